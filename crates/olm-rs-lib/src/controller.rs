//! Reconciling subscriptions and install plans by key.
//!
//! [`Controller`] holds what both reconcilers need and decides how failed keys are retried,
//! [`runtime`] drives it from API server watches and catalog changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kube::{Resource, ResourceExt};

mod backoff;
pub use backoff::RequeuePolicy;

pub mod runtime;

use crate::api::{InstallPlan, Subscription, SubscriptionState};
use crate::catalog::{CatalogKey, CatalogProvider};
use crate::cluster::{get_as, list_as, ClusterClient, ObjectKey};
use crate::install_plan::Executor;
use crate::subscription::{owner_of, Reconciler};
use crate::OlmRsOptions;

pub struct Controller {
	cluster: Arc<dyn ClusterClient>,
	catalogs: Arc<dyn CatalogProvider>,
	options: OlmRsOptions,
	/// Consecutive failures per key.
	failures: Mutex<HashMap<ObjectKey, u32>>,
}

fn key_for_subscription(subscription: &Subscription) -> ObjectKey {
	ObjectKey::of::<Subscription>(subscription.namespace().as_deref(), subscription.name_any())
}

impl Controller {
	pub fn new(cluster: Arc<dyn ClusterClient>, catalogs: Arc<dyn CatalogProvider>, options: OlmRsOptions) -> Self {
		Self {
			cluster,
			catalogs,
			options,
			failures: Default::default(),
		}
	}

	pub fn options(&self) -> &OlmRsOptions {
		&self.options
	}

	pub fn catalogs(&self) -> &Arc<dyn CatalogProvider> {
		&self.catalogs
	}

	/// Reconciles one key, returning the keys it affected.
	pub async fn process(&self, key: &ObjectKey) -> crate::Result<Vec<ObjectKey>> {
		let namespace = key.namespace.as_deref().unwrap_or_default();

		if key.kind == Subscription::kind(&()) {
			let reconciler = Reconciler::new(self.cluster.as_ref(), self.catalogs.as_ref(), &self.options);
			let Some(outcome) = reconciler.reconcile(namespace, &key.name).await? else { return Ok(vec![]) };
			let waiting = matches!(outcome.state, SubscriptionState::UpgradePending | SubscriptionState::UpgradeAvailable);
			return Ok(outcome.install_plan.into_iter().filter(|_| outcome.planned || waiting).collect())
		}

		if key.kind == InstallPlan::kind(&()) {
			let Some(before) = get_as::<InstallPlan>(self.cluster.as_ref(), key).await? else { return Ok(vec![]) };
			let executor = Executor::new(self.cluster.as_ref(), self.options.step_timeout())
				.catalogs(self.catalogs.as_ref(), self.options.global_catalog_namespace());
			let after = executor.sync(namespace, &key.name).await?;
			if after == Some(before.phase()) {
				return Ok(vec![])
			}
			/* Let the owner see the new phase */
			return Ok(owner_of(&serde_json::to_value(&before)?).into_iter().collect())
		}

		log::warn!("Don't know how to reconcile {}", key);
		Ok(vec![])
	}

	/// Counts a failure of `key` and picks when to try it again.
	///
	/// `None` means retries are used up, the key waits for its next change.
	pub fn requeue_after(&self, key: &ObjectKey, error: &crate::Error) -> Option<Duration> {
		let policy = if error.is_transient() { RequeuePolicy::transient(&self.options) } else { RequeuePolicy::resolution(&self.options) };
		let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
		let attempt = {
			let count = failures.entry(key.clone()).or_default();
			*count += 1;
			*count
		};
		match policy.delay(attempt) {
			Some(delay) => {
				log::warn!("Reconciling {} failed (attempt {}), retrying in {:?}: {}", key, attempt, delay, error);
				Some(delay)
			},
			None => {
				log::error!("Giving up on {} after {} attempts until it changes: {}", key, attempt - 1, error);
				failures.remove(key);
				None
			},
		}
	}

	pub fn forget_failures(&self, key: &ObjectKey) {
		self.failures.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
	}

	/// Subscriptions whose resolution can see `catalog`.
	///
	/// A catalog in the global namespace is visible from every namespace, any other only from its own.
	pub async fn subscriptions_using(&self, catalog: &CatalogKey) -> crate::Result<Vec<ObjectKey>> {
		let global = catalog.namespace == self.options.global_catalog_namespace();
		let namespace = match self.options.namespace() {
			Some(watched) if !global && watched != catalog.namespace => return Ok(vec![]),
			watched if global => watched,
			_ => Some(catalog.namespace.as_str()),
		};
		let subscriptions = list_as::<Subscription>(self.cluster.as_ref(), namespace).await?;
		log::debug!("Catalog {} is used by {} subscriptions", catalog, subscriptions.len());
		Ok(subscriptions.iter().map(key_for_subscription).collect())
	}
}

#[cfg(test)]
mod test {
	use serde_json::json;

	use super::*;
	use crate::catalog::MemoryCatalogProvider;
	use crate::cluster::MemoryCluster;

	fn subscription(namespace: &str, name: &str) -> serde_json::Value {
		json!({
			"apiVersion": "operators.coreos.com/v1alpha1",
			"kind": "Subscription",
			"metadata": { "name": name, "namespace": namespace },
			"spec": { "package": "p", "channel": "stable", "catalogSourceRef": { "name": "ops", "namespace": "olm" } },
		})
	}

	fn controller(cluster: Arc<MemoryCluster>, options: OlmRsOptions) -> Controller {
		Controller::new(cluster, Arc::new(MemoryCatalogProvider::default()), options)
	}

	#[tokio::test]
	async fn unknown_kind_is_skipped() {
		let c = controller(Arc::new(MemoryCluster::default()), OlmRsOptions::default());
		assert!(c.process(&ObjectKey::new("v1", "ConfigMap", Some("ns"), "c")).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn resolution_failures_give_up() {
		let cluster = Arc::new(MemoryCluster::default());
		cluster.insert(subscription("ns", "sub"));
		let mut options = OlmRsOptions::default();
		options.set_max_resolution_retries(1);
		let c = controller(cluster, options);
		let key = ObjectKey::of::<Subscription>(Some("ns"), "sub");

		let error = c.process(&key).await.unwrap_err();
		assert!(c.requeue_after(&key, &error).is_some());
		assert_eq!(c.failures.lock().unwrap().get(&key), Some(&1));
		assert_eq!(c.requeue_after(&key, &error), None);
		assert_eq!(c.failures.lock().unwrap().get(&key), None);
	}

	#[tokio::test]
	async fn transient_failures_back_off() {
		let c = controller(Arc::new(MemoryCluster::default()), OlmRsOptions::default());
		let key = ObjectKey::of::<Subscription>(Some("ns"), "sub");
		let error = crate::Error::IO(std::io::Error::new(std::io::ErrorKind::Other, "down"));

		let first = c.requeue_after(&key, &error).unwrap();
		assert!(c.requeue_after(&key, &error).unwrap() > first);
		c.forget_failures(&key);
		assert_eq!(c.requeue_after(&key, &error), Some(first));
	}

	#[tokio::test]
	async fn global_catalog_reaches_every_namespace() {
		let cluster = Arc::new(MemoryCluster::default());
		cluster.insert(subscription("a", "sub"));
		cluster.insert(subscription("b", "sub"));
		let c = controller(cluster, OlmRsOptions::default());
		let global = CatalogKey::new("ops", c.options().global_catalog_namespace());
		assert_eq!(c.subscriptions_using(&global).await.unwrap().len(), 2);
	}

	#[tokio::test]
	async fn namespaced_catalog_reaches_its_namespace() {
		let cluster = Arc::new(MemoryCluster::default());
		cluster.insert(subscription("a", "sub"));
		cluster.insert(subscription("b", "sub"));
		let c = controller(cluster, OlmRsOptions::default());
		assert_eq!(c.subscriptions_using(&CatalogKey::new("own", "a")).await.unwrap(), vec![ObjectKey::of::<Subscription>(Some("a"), "sub")]);
	}

	#[tokio::test]
	async fn unwatched_namespace_catalog_is_ignored() {
		let cluster = Arc::new(MemoryCluster::default());
		cluster.insert(subscription("a", "sub"));
		let mut options = OlmRsOptions::default();
		options.set_namespace(Some("a".into()));
		let c = controller(cluster, options);
		assert!(c.subscriptions_using(&CatalogKey::new("own", "b")).await.unwrap().is_empty());
	}
}
