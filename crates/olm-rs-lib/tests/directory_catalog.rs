use std::sync::Arc;

use olm_rs::api::SubscriptionState;
use olm_rs::catalog::{CatalogKey, CatalogProvider, CatalogStatus, DirectoryCatalogProvider};
use olm_rs::cluster::{MemoryCluster, ObjectKey};
use olm_rs::controller::Controller;
use olm_rs::OlmRsOptions;
use olm_rs_test_utils::*;

#[tokio::test]
async fn lists_catalogs_per_namespace() {
	let dir = CatalogDir::new().unwrap();
	dir.write(&linear_catalog().priority(10)).unwrap();
	dir.write(&CatalogBuilder::new("community", "ns")).unwrap();
	dir.write_raw("ns", "broken", "{ not json").unwrap();
	std::fs::write(dir.path().join("ns").join("README.md"), "ignored").unwrap();

	let provider = DirectoryCatalogProvider::new(dir.path());
	assert_eq!(provider.list().await.unwrap(), vec![
		CatalogStatus { key: CatalogKey::new("broken", "ns"), priority: 0, healthy: false },
		CatalogStatus { key: CatalogKey::new("community", "ns"), priority: 0, healthy: true },
		CatalogStatus { key: CatalogKey::new("ops", "olm"), priority: 10, healthy: true },
	]);
}

#[tokio::test]
async fn snapshot_reads_bundles() {
	let dir = CatalogDir::new().unwrap();
	dir.write(&linear_catalog()).unwrap();
	let provider = DirectoryCatalogProvider::new(dir.path());

	let snapshot = provider.snapshot(&CatalogKey::new("ops", "olm")).await.unwrap().unwrap();
	assert_eq!(snapshot.channel_head("p", "stable").unwrap().name, "p-v3");
	assert_eq!(snapshot.bundle("p-v2").unwrap().replaces.as_deref(), Some("p-v1"));
	assert!(provider.snapshot(&CatalogKey::new("missing", "olm")).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_root_lists_nothing() {
	let dir = CatalogDir::new().unwrap();
	let provider = DirectoryCatalogProvider::new(dir.path().join("nowhere"));
	assert!(provider.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn controller_installs_from_directory() {
	let dir = CatalogDir::new().unwrap();
	dir.write(&linear_catalog()).unwrap();

	let cluster = Arc::new(MemoryCluster::default());
	let driver = Driver::new(Controller::new(cluster.clone(), Arc::new(DirectoryCatalogProvider::new(dir.path())), OlmRsOptions::default()));
	cluster.insert(serde_json::to_value(subscription("ns", "sub", "p", "stable", &CatalogKey::new("ops", "olm"))).unwrap());
	driver.add(ObjectKey::of::<olm_rs::api::Subscription>(Some("ns"), "sub"));
	driver.run_until_idle().await;

	let subscription: olm_rs::api::Subscription = serde_json::from_value(cluster.object(&ObjectKey::of::<olm_rs::api::Subscription>(Some("ns"), "sub")).unwrap()).unwrap();
	let status = subscription.status.unwrap();
	assert_eq!(status.current_bundle.as_deref(), Some("p-v3"));
	assert_eq!(status.state, SubscriptionState::UpToDate);
}

#[tokio::test]
async fn rewritten_catalog_file_is_picked_up() {
	let dir = CatalogDir::new().unwrap();
	dir.write(&linear_catalog()).unwrap();

	let cluster = Arc::new(MemoryCluster::default());
	let driver = Driver::new(Controller::new(cluster.clone(), Arc::new(DirectoryCatalogProvider::new(dir.path())), OlmRsOptions::default()));
	driver.controller().catalogs().refresh().await.unwrap();
	cluster.insert(serde_json::to_value(subscription("ns", "sub", "p", "stable", &CatalogKey::new("ops", "olm"))).unwrap());
	driver.add(ObjectKey::of::<olm_rs::api::Subscription>(Some("ns"), "sub"));
	driver.run_until_idle().await;

	dir.write(&linear_catalog()
		.package("p", &[("stable", "p-v4")])
		.bundle(BundleBuilder::new("p-v4", "p", "4.0.0").channel("stable").replaces("p-v3").build())).unwrap();
	driver.controller().catalogs().refresh().await.unwrap();
	assert!(driver.run_until_idle().await > 0);

	let subscription: olm_rs::api::Subscription = serde_json::from_value(cluster.object(&ObjectKey::of::<olm_rs::api::Subscription>(Some("ns"), "sub")).unwrap()).unwrap();
	assert_eq!(subscription.status.unwrap().current_bundle.as_deref(), Some("p-v4"));
}
