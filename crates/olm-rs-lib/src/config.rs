use std::time::Duration;

/// Runtime options for the controller.
///
/// `Default` reads the `OLM_RS_*` environment variables and falls back to built in values
/// when a variable is missing or can't be parsed.
#[derive(Debug, Clone)]
pub struct OlmRsOptions {
	namespace: Option<String>,
	global_catalog_namespace: String,
	catalog_dir: std::path::PathBuf,
	resync_interval: Duration,
	catalog_poll_interval: Duration,
	workers: usize,
	step_timeout: Duration,
	max_resolution_retries: u32,
	backoff_base: Duration,
	backoff_max: Duration,
	max_retained_install_plans: usize,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
	let value = std::env::var(name).ok()?;
	match value.parse::<T>() {
		Ok(v) => Some(v),
		Err(_) => {
			log::warn!("Ignoring unparsable value \"{}\" for {}", value, name);
			None
		}
	}
}

impl Default for OlmRsOptions {
	fn default() -> Self {
		Self {
			namespace: std::env::var("OLM_RS_NAMESPACE").ok().filter(|n| !n.is_empty()),
			global_catalog_namespace: std::env::var("OLM_RS_GLOBAL_CATALOG_NAMESPACE").unwrap_or_else(|_| "olm".to_string()),
			catalog_dir: {
				if let Ok(e) = std::env::var("OLM_RS_CATALOG_DIR") {
					std::path::PathBuf::from(e)
				} else if let Ok(e) = std::env::var("XDG_DATA_HOME") {
					std::path::PathBuf::from(e).join("olm-rs").join("catalogs")
				} else if let Ok(e) = std::env::var("HOME") {
					std::path::PathBuf::from(e).join(".local/share").join("olm-rs").join("catalogs")
				} else {
					std::path::PathBuf::from("catalogs")
				}
			},
			resync_interval: Duration::from_secs(env_parse("OLM_RS_RESYNC_SECONDS").unwrap_or(300)),
			catalog_poll_interval: Duration::from_secs(env_parse("OLM_RS_CATALOG_POLL_SECONDS").unwrap_or(30)),
			workers: env_parse("OLM_RS_WORKERS").filter(|w| *w > 0).unwrap_or(4),
			step_timeout: Duration::from_secs(env_parse("OLM_RS_STEP_TIMEOUT_SECONDS").unwrap_or(60)),
			max_resolution_retries: 5,
			backoff_base: Duration::from_secs(1),
			backoff_max: Duration::from_secs(300),
			max_retained_install_plans: 5,
		}
	}
}

impl OlmRsOptions {
	/// Namespace the controller is restricted to, `None` watches every namespace.
	pub fn namespace(&self) -> Option<&str> {
		self.namespace.as_deref()
	}
	pub fn set_namespace(&mut self, namespace: Option<String>) {
		self.namespace = namespace;
	}

	/// Catalogs in this namespace are visible to subscriptions in every namespace.
	pub fn global_catalog_namespace(&self) -> &str {
		&self.global_catalog_namespace
	}
	/// returns if the namespace is valid or not.
	pub fn set_global_catalog_namespace(&mut self, namespace: String) -> bool {
		if namespace.is_empty() {
			false
		} else {
			self.global_catalog_namespace = namespace;
			true
		}
	}

	pub fn catalog_dir(&self) -> &std::path::Path {
		&self.catalog_dir
	}
	/// returns if the directory is valid or not.
	pub fn set_catalog_dir(&mut self, catalog_dir: std::path::PathBuf) -> bool {
		if catalog_dir.is_dir() {
			self.catalog_dir = catalog_dir;
			true
		} else {
			false
		}
	}

	pub fn resync_interval(&self) -> Duration {
		self.resync_interval
	}
	/// returns if the interval is valid or not.
	pub fn set_resync_interval(&mut self, interval: Duration) -> bool {
		if interval.is_zero() {
			false
		} else {
			self.resync_interval = interval;
			true
		}
	}

	/// How often catalogs are checked for changes made outside the controller.
	pub fn catalog_poll_interval(&self) -> Duration {
		self.catalog_poll_interval
	}
	/// returns if the interval is valid or not.
	pub fn set_catalog_poll_interval(&mut self, interval: Duration) -> bool {
		if interval.is_zero() {
			false
		} else {
			self.catalog_poll_interval = interval;
			true
		}
	}

	pub fn workers(&self) -> usize {
		self.workers
	}
	/// returns if the worker count is valid or not.
	pub fn set_workers(&mut self, workers: usize) -> bool {
		if workers == 0 {
			false
		} else {
			self.workers = workers;
			true
		}
	}

	/// Upper bound on a single cluster call made while applying a step.
	pub fn step_timeout(&self) -> Duration {
		self.step_timeout
	}
	/// returns if the timeout is valid or not.
	pub fn set_step_timeout(&mut self, timeout: Duration) -> bool {
		if timeout.is_zero() {
			false
		} else {
			self.step_timeout = timeout;
			true
		}
	}

	/// Number of times a resolution failure is retried before the key is parked until the next event.
	pub fn max_resolution_retries(&self) -> u32 {
		self.max_resolution_retries
	}
	pub fn set_max_resolution_retries(&mut self, retries: u32) {
		self.max_resolution_retries = retries;
	}

	pub fn backoff_base(&self) -> Duration {
		self.backoff_base
	}
	pub fn backoff_max(&self) -> Duration {
		self.backoff_max
	}
	/// returns if the bounds are valid or not.
	pub fn set_backoff(&mut self, base: Duration, max: Duration) -> bool {
		if base.is_zero() || max < base {
			false
		} else {
			self.backoff_base = base;
			self.backoff_max = max;
			true
		}
	}

	/// Install plans kept per subscription, the referenced plan included.
	pub fn max_retained_install_plans(&self) -> usize {
		self.max_retained_install_plans
	}
	/// returns if the count is valid or not.
	pub fn set_max_retained_install_plans(&mut self, count: usize) -> bool {
		if count == 0 {
			false
		} else {
			self.max_retained_install_plans = count;
			true
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test] fn zero_workers_rejected() { assert!(!OlmRsOptions::default().set_workers(0)) }
	#[test] fn zero_catalog_poll_rejected() { assert!(!OlmRsOptions::default().set_catalog_poll_interval(Duration::ZERO)) }
	#[test] fn backoff_max_below_base_rejected() { assert!(!OlmRsOptions::default().set_backoff(Duration::from_secs(10), Duration::from_secs(1))) }
	#[test] fn retained_plans_must_keep_one() { assert!(!OlmRsOptions::default().set_max_retained_install_plans(0)) }
	#[test] fn missing_catalog_dir_rejected() { assert!(!OlmRsOptions::default().set_catalog_dir("/definitely/not/here".into())) }
}
