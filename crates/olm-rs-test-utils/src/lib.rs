//! Various helpers for testing
//!
//! functions in this module should use results and not use any panics to avoid confusion in callers

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
	CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
	CustomResourceDefinitionVersion, CustomResourceValidation, JSONSchemaProps,
};
use olm_rs::api::{Approval, CatalogSourceRef, InstallPlan, OperatorGroup, OperatorGroupSpec, Subscription, SubscriptionSpec, SubscriptionStatus, UpgradeStrategy};
use olm_rs::catalog::{ApiKey, Bundle, CatalogIndex, CatalogKey, CatalogSnapshot, Channel, MemoryCatalogProvider, OwnedApi, PackageManifest, Permission};
use olm_rs::cluster::{ClusterClient, MemoryCluster, ObjectKey};
use olm_rs::controller::Controller;
use olm_rs::OlmRsOptions;

mod driver;
pub use driver::Driver;

/// Builds a [`Bundle`] one field at a time.
#[derive(Debug, Clone)]
pub struct BundleBuilder {
	bundle: Bundle,
}

impl BundleBuilder {
	/// An unparsable `version` reads as `0.0.0`.
	pub fn new(name: &str, package: &str, version: &str) -> Self {
		Self {
			bundle: Bundle {
				name: name.to_string(),
				package: package.to_string(),
				channels: vec![],
				version: semver::Version::parse(version).unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
				replaces: None,
				skips: vec![],
				skip_range: None,
				owned_apis: vec![],
				required_apis: vec![],
				permissions: vec![],
				cluster_permissions: vec![],
				extra_objects: vec![],
				descriptor: None,
			},
		}
	}

	pub fn channel(mut self, channel: &str) -> Self {
		self.bundle.channels.push(channel.to_string());
		self
	}

	pub fn replaces(mut self, name: &str) -> Self {
		self.bundle.replaces = Some(name.to_string());
		self
	}

	pub fn skips(mut self, name: &str) -> Self {
		self.bundle.skips.push(name.to_string());
		self
	}

	/// An unparsable range is ignored.
	pub fn skip_range(mut self, range: &str) -> Self {
		self.bundle.skip_range = range.parse().ok();
		self
	}

	/// Owns every served version of `crd`.
	pub fn owns_crd(mut self, crd: &CustomResourceDefinition) -> Self {
		for version in crd.spec.versions.iter().filter(|v| v.served) {
			self.bundle.owned_apis.push(OwnedApi {
				group: crd.spec.group.clone(),
				version: version.name.clone(),
				kind: crd.spec.names.kind.clone(),
				crd: Some(crd.clone()),
			});
		}
		self
	}

	/// Owns an API served by the operator itself.
	pub fn owns_api(mut self, group: &str, version: &str, kind: &str) -> Self {
		self.bundle.owned_apis.push(OwnedApi { group: group.into(), version: version.into(), kind: kind.into(), crd: None });
		self
	}

	pub fn requires(mut self, group: &str, version: &str, kind: &str) -> Self {
		self.bundle.required_apis.push(ApiKey::new(group, version, kind));
		self
	}

	pub fn permission(mut self, service_account: &str, rules: Vec<PolicyRule>) -> Self {
		self.bundle.permissions.push(Permission { service_account_name: service_account.into(), rules });
		self
	}

	pub fn cluster_permission(mut self, service_account: &str, rules: Vec<PolicyRule>) -> Self {
		self.bundle.cluster_permissions.push(Permission { service_account_name: service_account.into(), rules });
		self
	}

	pub fn object(mut self, object: serde_json::Value) -> Self {
		self.bundle.extra_objects.push(object);
		self
	}

	pub fn build(self) -> Bundle {
		self.bundle
	}
}

/// Read access on one resource.
pub fn read_rule(resource: &str) -> PolicyRule {
	PolicyRule {
		api_groups: Some(vec!["".into()]),
		resources: Some(vec![resource.into()]),
		verbs: vec!["get".into(), "list".into(), "watch".into()],
		..Default::default()
	}
}

/// A CRD for `group` serving `versions`, the first being the storage version.
///
/// Each version's schema requires `spec` to be an object.
pub fn crd(group: &str, plural: &str, kind: &str, versions: &[(&str, bool)]) -> CustomResourceDefinition {
	let spec_schema = JSONSchemaProps { type_: Some("object".into()), ..Default::default() };
	let schema = JSONSchemaProps {
		type_: Some("object".into()),
		properties: Some(BTreeMap::from([("spec".to_string(), spec_schema)])),
		..Default::default()
	};

	CustomResourceDefinition {
		metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
			name: Some(format!("{}.{}", plural, group)),
			..Default::default()
		},
		spec: CustomResourceDefinitionSpec {
			group: group.into(),
			names: CustomResourceDefinitionNames { kind: kind.into(), plural: plural.into(), ..Default::default() },
			scope: "Namespaced".into(),
			versions: versions.iter().enumerate().map(|(i, (name, served))| CustomResourceDefinitionVersion {
				name: name.to_string(),
				served: *served,
				storage: i == 0,
				schema: Some(CustomResourceValidation { open_api_v3_schema: Some(schema.clone()) }),
				..Default::default()
			}).collect(),
			..Default::default()
		},
		status: None,
	}
}

/// Builds a catalog of packages and bundles.
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
	key: CatalogKey,
	index: CatalogIndex,
}

impl CatalogBuilder {
	pub fn new(name: &str, namespace: &str) -> Self {
		Self { key: CatalogKey::new(name, namespace), index: CatalogIndex::default() }
	}

	pub fn priority(mut self, priority: i32) -> Self {
		self.index.priority = priority;
		self
	}

	/// Adds a package, `channels` being `(channel, head)` pairs with the first as the default.
	pub fn package(mut self, name: &str, channels: &[(&str, &str)]) -> Self {
		self.index.packages.push(PackageManifest {
			name: name.into(),
			channels: channels.iter().map(|(c, head)| Channel { name: c.to_string(), current_bundle: head.to_string() }).collect(),
			default_channel: channels.first().map(|(c, _)| c.to_string()),
		});
		self
	}

	pub fn bundle(mut self, bundle: Bundle) -> Self {
		self.index.bundles.push(bundle);
		self
	}

	pub fn key(&self) -> &CatalogKey {
		&self.key
	}

	pub fn index(&self) -> &CatalogIndex {
		&self.index
	}

	pub fn build(self) -> CatalogSnapshot {
		CatalogSnapshot::from_parts(self.key, self.index.priority, self.index.packages, self.index.bundles)
	}
}

/// The `stable` channel of package `p`, `p-v1 -> p-v2 -> p-v3`.
pub fn linear_catalog() -> CatalogBuilder {
	CatalogBuilder::new("ops", "olm")
		.package("p", &[("stable", "p-v3")])
		.bundle(BundleBuilder::new("p-v1", "p", "1.0.0").channel("stable").build())
		.bundle(BundleBuilder::new("p-v2", "p", "2.0.0").channel("stable").replaces("p-v1").build())
		.bundle(BundleBuilder::new("p-v3", "p", "3.0.0").channel("stable").replaces("p-v2").build())
}

pub fn subscription(namespace: &str, name: &str, package: &str, channel: &str, catalog: &CatalogKey) -> Subscription {
	let mut subscription = Subscription::new(name, SubscriptionSpec {
		package: package.into(),
		channel: channel.into(),
		catalog_source_ref: CatalogSourceRef::from(catalog),
		starting_bundle: None,
		approval: Approval::Automatic,
	});
	subscription.metadata.namespace = Some(namespace.into());
	subscription
}

pub fn operator_group(namespace: &str, strategy: UpgradeStrategy, target_namespaces: &[&str]) -> OperatorGroup {
	let mut group = OperatorGroup::new("group", OperatorGroupSpec {
		target_namespaces: target_namespaces.iter().map(|n| n.to_string()).collect(),
		upgrade_strategy: strategy,
	});
	group.metadata.namespace = Some(namespace.into());
	group
}

/// A temporary directory laid out for `DirectoryCatalogProvider`.
pub struct CatalogDir {
	dir: tempfile::TempDir,
}

impl CatalogDir {
	pub fn new() -> std::io::Result<Self> {
		Ok(Self { dir: tempfile::tempdir()? })
	}

	pub fn path(&self) -> &std::path::Path {
		self.dir.path()
	}

	/// Writes the catalog as `<namespace>/<name>.json`.
	pub fn write(&self, catalog: &CatalogBuilder) -> std::io::Result<()> {
		let dir = self.dir.path().join(&catalog.key().namespace);
		std::fs::create_dir_all(&dir)?;
		let content = serde_json::to_string_pretty(catalog.index())?;
		std::fs::write(dir.join(format!("{}.json", catalog.key().name)), content)
	}

	/// Writes arbitrary content as the catalog `namespace`/`name`.
	pub fn write_raw(&self, namespace: &str, name: &str, content: &str) -> std::io::Result<()> {
		let dir = self.dir.path().join(namespace);
		std::fs::create_dir_all(&dir)?;
		std::fs::write(dir.join(format!("{}.json", name)), content)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
	#[error("object has no apiVersion, kind or name")]
	Unkeyed,
	#[error(transparent)]
	Json(#[from] serde_json::Error),
	#[error(transparent)]
	OlmRs(#[from] olm_rs::Error),
}

/// An in memory cluster and catalog provider with a controller running over them.
pub struct Fixture {
	pub cluster: Arc<MemoryCluster>,
	pub catalogs: Arc<MemoryCatalogProvider>,
	pub driver: Driver,
}

impl Default for Fixture {
	fn default() -> Self {
		Self::with_options(OlmRsOptions::default())
	}
}

impl Fixture {
	pub fn with_options(options: OlmRsOptions) -> Self {
		let cluster = Arc::new(MemoryCluster::default());
		let catalogs = Arc::new(MemoryCatalogProvider::default());
		let driver = Driver::new(Controller::new(cluster.clone(), catalogs.clone(), options));
		Self { cluster, catalogs, driver }
	}

	pub fn options(&self) -> &OlmRsOptions {
		self.driver.controller().options()
	}

	/// Stores an object in the cluster without going through the controller.
	pub fn insert<K: serde::Serialize>(&self, object: &K) -> Result<ObjectKey, FixtureError> {
		self.cluster.insert(serde_json::to_value(object)?).ok_or(FixtureError::Unkeyed)
	}

	/// Queues `key` and processes until nothing is left to do.
	pub async fn settle(&self, key: ObjectKey) -> usize {
		self.driver.add(key);
		self.driver.run_until_idle().await
	}

	/// Processes whatever watches and catalog changes queued, without queueing anything first.
	pub async fn run_until_idle(&self) -> usize {
		self.driver.run_until_idle().await
	}

	pub async fn settle_subscription(&self, namespace: &str, name: &str) -> usize {
		self.settle(ObjectKey::of::<Subscription>(Some(namespace), name)).await
	}

	pub fn get<K: serde::de::DeserializeOwned>(&self, key: &ObjectKey) -> Option<K> {
		self.cluster.object(key).and_then(|v| serde_json::from_value(v).ok())
	}

	pub fn subscription_status(&self, namespace: &str, name: &str) -> Option<SubscriptionStatus> {
		self.get::<Subscription>(&ObjectKey::of::<Subscription>(Some(namespace), name))?.status
	}

	/// The plan a subscription references.
	pub fn referenced_plan(&self, namespace: &str, name: &str) -> Option<InstallPlan> {
		let plan_ref = self.subscription_status(namespace, name)?.install_plan_ref?;
		self.get(&ObjectKey::of::<InstallPlan>(Some(&plan_ref.namespace), &plan_ref.name))
	}

	pub fn install_plans(&self) -> Vec<InstallPlan> {
		self.cluster.objects_of("InstallPlan").into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect()
	}

	/// Sets `approved` on a plan the way a user would.
	pub async fn approve(&self, namespace: &str, name: &str) -> Result<(), FixtureError> {
		let key = ObjectKey::of::<InstallPlan>(Some(namespace), name);
		let mut plan: InstallPlan = self.get(&key).ok_or_else(|| olm_rs::Error::NotFound(key.to_string()))?;
		plan.spec.approved = true;
		self.cluster.replace(&serde_json::to_value(&plan)?).await.map_err(olm_rs::Error::from)?;
		Ok(())
	}
}
