//! What a namespace can see while resolving.

use std::sync::Arc;

use super::*;

/// A bundle already installed in the namespace.
///
/// Read back from the descriptor on the cluster, so only what the descriptor records is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBundle {
	pub name: String,
	pub package: Option<String>,
	pub version: Option<semver::Version>,
	pub replaces: Option<String>,
	pub owned_apis: Vec<ApiKey>,
	/// Catalog the bundle was installed from, when recorded.
	pub catalog: Option<CatalogKey>,
}

impl InstalledBundle {
	pub fn owns(&self, api: &ApiKey) -> bool {
		self.owned_apis.contains(api)
	}
}

/// Catalogs visible to a namespace plus the bundles already installed there.
///
/// Catalogs are ordered by priority, highest first, then by key.
#[derive(Debug, Clone)]
pub struct ResolutionScope {
	pub namespace: String,
	pub catalogs: Vec<Arc<CatalogSnapshot>>,
	/// Visible catalogs left out of the scope because they are unhealthy or their content could not be read.
	pub unhealthy: Vec<CatalogKey>,
	pub installed: Vec<InstalledBundle>,
}

impl ResolutionScope {
	pub fn new(namespace: impl Into<String>, catalogs: impl IntoIterator<Item = Arc<CatalogSnapshot>>, installed: Vec<InstalledBundle>) -> Self {
		let mut catalogs: Vec<Arc<CatalogSnapshot>> = catalogs.into_iter().collect();
		catalogs.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key.cmp(&b.key)));
		Self {
			namespace: namespace.into(),
			catalogs,
			unhealthy: Default::default(),
			installed,
		}
	}

	/// Builds the scope of `namespace` from the catalogs the provider lists.
	///
	/// Catalogs in `namespace` and in `global_namespace` are visible.
	pub async fn build(provider: &dyn CatalogProvider, namespace: &str, global_namespace: &str, installed: Vec<InstalledBundle>) -> crate::Result<Self> {
		let mut catalogs = Vec::<Arc<CatalogSnapshot>>::new();
		let mut unhealthy = Vec::<CatalogKey>::new();

		for status in provider.list().await? {
			if status.key.namespace != namespace && status.key.namespace != global_namespace {
				continue
			}
			if !status.healthy {
				log::debug!("Catalog {} is unhealthy, leaving it out of the scope of {}", status.key, namespace);
				unhealthy.push(status.key);
				continue
			}
			match provider.snapshot(&status.key).await {
				Ok(Some(s)) => catalogs.push(s),
				Ok(None) => {
					log::debug!("Catalog {} disappeared while building the scope of {}", status.key, namespace);
					unhealthy.push(status.key);
				},
				Err(e) if e.is_transient() => return Err(e),
				Err(e) => {
					log::warn!("Failed to read catalog {}: {}", status.key, e);
					unhealthy.push(status.key);
				},
			}
		}

		unhealthy.sort();
		let mut scope = Self::new(namespace, catalogs, installed);
		scope.unhealthy = unhealthy;
		Ok(scope)
	}

	pub fn catalog(&self, key: &CatalogKey) -> Option<&Arc<CatalogSnapshot>> {
		self.catalogs.iter().find(|c| &c.key == key)
	}

	/// Finds a bundle by name, looking in `preferred` first.
	pub fn find_bundle(&self, name: &str, preferred: Option<&CatalogKey>) -> Option<(&Arc<CatalogSnapshot>, &Arc<Bundle>)> {
		if let Some(c) = preferred.and_then(|k| self.catalog(k)) {
			if let Some(b) = c.bundle(name) {
				return Some((c, b))
			}
		}
		self.catalogs.iter().find_map(|c| c.bundle(name).map(|b| (c, b)))
	}

	pub fn installed(&self, name: &str) -> Option<&InstalledBundle> {
		self.installed.iter().find(|i| i.name == name)
	}

	pub fn installed_owners<'a>(&'a self, api: &ApiKey) -> impl Iterator<Item = &'a InstalledBundle> + 'a {
		let api = api.clone();
		self.installed.iter().filter(move |i| i.owns(&api))
	}

	/// Installed bundle of `package`, if any.
	pub fn installed_in_package(&self, package: &str) -> Option<&InstalledBundle> {
		self.installed.iter().find(|i| i.package.as_deref() == Some(package))
	}
}
