use olm_rs::api::condition::{find_condition, ConditionStatus, ConditionType};
use olm_rs::api::{Approval, InstallPlanPhase, Subscription, SubscriptionState, UpgradeStrategy};
use olm_rs::catalog::CatalogKey;
use olm_rs::cluster::{ClusterClient, ObjectKey};
use olm_rs::OlmRsOptions;
use olm_rs_test_utils::*;

fn catalog_key() -> CatalogKey {
	CatalogKey::new("ops", "olm")
}

fn chain(length: usize) -> CatalogBuilder {
	let head = format!("p-v{}", length);
	let mut catalog = CatalogBuilder::new("ops", "olm").package("p", &[("stable", head.as_str())]);
	for i in 1..=length {
		let mut bundle = BundleBuilder::new(&format!("p-v{}", i), "p", &format!("{}.0.0", i)).channel("stable");
		if i > 1 {
			bundle = bundle.replaces(&format!("p-v{}", i - 1));
		}
		catalog = catalog.bundle(bundle.build());
	}
	catalog
}

async fn edit_subscription(fixture: &Fixture, edit: impl FnOnce(&mut Subscription)) {
	let key = ObjectKey::of::<Subscription>(Some("ns"), "sub");
	let mut subscription: Subscription = fixture.get(&key).unwrap();
	edit(&mut subscription);
	fixture.cluster.replace(&serde_json::to_value(&subscription).unwrap()).await.unwrap();
}

#[tokio::test]
async fn walks_the_channel_one_plan_per_hop() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(chain(3).build());
	let mut s = subscription("ns", "sub", "p", "stable", &catalog_key());
	s.spec.starting_bundle = Some("p-v1".into());
	fixture.insert(&s).unwrap();
	fixture.settle_subscription("ns", "sub").await;

	let mut plans = fixture.install_plans();
	plans.sort_by_key(|p| p.spec.generation);
	let hops: Vec<_> = plans.iter().map(|p| p.spec.bundle_names.clone()).collect();
	assert_eq!(hops, vec![vec!["p-v1"], vec!["p-v2"], vec!["p-v3"]]);
	assert_eq!(plans.iter().map(|p| p.spec.generation).collect::<Vec<_>>(), vec![1, 2, 3]);
	assert_eq!(fixture.subscription_status("ns", "sub").unwrap().current_bundle.as_deref(), Some("p-v3"));
	assert_eq!(fixture.cluster.objects_of("ClusterServiceVersion").len(), 1);
}

#[tokio::test]
async fn old_plans_are_collected() {
	let mut options = OlmRsOptions::default();
	options.set_max_retained_install_plans(2);
	let fixture = Fixture::with_options(options);
	fixture.catalogs.publish(chain(5).build());
	let mut s = subscription("ns", "sub", "p", "stable", &catalog_key());
	s.spec.starting_bundle = Some("p-v1".into());
	fixture.insert(&s).unwrap();
	fixture.settle_subscription("ns", "sub").await;

	let mut generations: Vec<_> = fixture.install_plans().iter().map(|p| p.spec.generation).collect();
	generations.sort();
	assert_eq!(generations, vec![4, 5]);
	assert_eq!(fixture.referenced_plan("ns", "sub").unwrap().spec.generation, 5);
}

fn crd_bundle(name: &str, version: &str, replaces: Option<&str>, crd_versions: &[(&str, bool)]) -> olm_rs::catalog::Bundle {
	let mut bundle = BundleBuilder::new(name, "p", version)
		.channel("stable")
		.owns_crd(&crd("example.com", "widgets", "Widget", crd_versions));
	if let Some(r) = replaces {
		bundle = bundle.replaces(r);
	}
	bundle.build()
}

/// Installs `p-v1`, then fails the upgrade to `p-v2` and publishes a fixed `p-v3`.
async fn failed_upgrade(fixture: &Fixture) {
	let v1 = crd_bundle("p-v1", "1.0.0", None, &[("v1alpha1", true), ("v1alpha2", true)]);
	let v2 = crd_bundle("p-v2", "2.0.0", Some("p-v1"), &[("v1alpha1", true), ("v1", true)]);
	let v3 = crd_bundle("p-v3", "3.0.0", Some("p-v2"), &[("v1alpha1", true), ("v1alpha2", true), ("v1", true)]);

	fixture.catalogs.publish(CatalogBuilder::new("ops", "olm").package("p", &[("stable", "p-v1")]).bundle(v1.clone()).build());
	fixture.insert(&subscription("ns", "sub", "p", "stable", &catalog_key())).unwrap();
	fixture.settle_subscription("ns", "sub").await;

	fixture.catalogs.publish(CatalogBuilder::new("ops", "olm").package("p", &[("stable", "p-v2")]).bundle(v1.clone()).bundle(v2.clone()).build());
	fixture.settle_subscription("ns", "sub").await;
	assert_eq!(fixture.referenced_plan("ns", "sub").unwrap().phase(), InstallPlanPhase::Failed);

	fixture.catalogs.publish(CatalogBuilder::new("ops", "olm").package("p", &[("stable", "p-v3")]).bundle(v1).bundle(v2).bundle(v3).build());
	fixture.settle_subscription("ns", "sub").await;
}

#[tokio::test]
async fn failed_plan_pins_the_subscription() {
	let fixture = Fixture::default();
	failed_upgrade(&fixture).await;

	assert_eq!(fixture.install_plans().len(), 2);
	assert_eq!(fixture.referenced_plan("ns", "sub").unwrap().phase(), InstallPlanPhase::Failed);
	let status = fixture.subscription_status("ns", "sub").unwrap();
	assert_eq!(status.current_bundle.as_deref(), Some("p-v1"));
	assert!(find_condition(&status.conditions, ConditionType::InstallPlanFailed).is_some());
}

#[tokio::test]
async fn fail_forward_upgrades_past_failed_bundle() {
	let fixture = Fixture::default();
	fixture.insert(&operator_group("ns", UpgradeStrategy::FailForward, &["ns"])).unwrap();
	failed_upgrade(&fixture).await;

	let plan = fixture.referenced_plan("ns", "sub").unwrap();
	assert_eq!(plan.spec.bundle_names, vec!["p-v3"]);
	assert_eq!(plan.phase(), InstallPlanPhase::Complete);

	let status = fixture.subscription_status("ns", "sub").unwrap();
	assert_eq!(status.current_bundle.as_deref(), Some("p-v3"));
	assert!(find_condition(&status.conditions, ConditionType::InstallPlanFailed).is_none());
	let csvs = fixture.cluster.objects_of("ClusterServiceVersion");
	assert_eq!(csvs.len(), 1);
	assert_eq!(csvs[0]["metadata"]["name"], "p-v3");
}

#[tokio::test]
async fn spec_change_abandons_pending_plan() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog()
		.package("p", &[("stable", "p-v3"), ("beta", "p-v4")])
		.bundle(BundleBuilder::new("p-v4", "p", "4.0.0").channel("beta").replaces("p-v3").build())
		.build());
	let mut s = subscription("ns", "sub", "p", "stable", &catalog_key());
	s.spec.approval = Approval::Manual;
	fixture.insert(&s).unwrap();
	fixture.settle_subscription("ns", "sub").await;
	let abandoned = fixture.referenced_plan("ns", "sub").unwrap();
	assert_eq!(abandoned.spec.bundle_names, vec!["p-v3"]);

	edit_subscription(&fixture, |s| s.spec.channel = "beta".into()).await;
	fixture.settle_subscription("ns", "sub").await;

	let plan = fixture.referenced_plan("ns", "sub").unwrap();
	assert_eq!(plan.spec.bundle_names, vec!["p-v4"]);
	assert_eq!(plan.phase(), InstallPlanPhase::RequiresApproval);
	assert_ne!(plan.metadata.name, abandoned.metadata.name);
	assert_eq!(fixture.install_plans().len(), 2);
}

#[tokio::test]
async fn unhealthy_catalog_is_reported() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog().build());
	fixture.catalogs.set_healthy(&catalog_key(), false);
	fixture.insert(&subscription("ns", "sub", "p", "stable", &catalog_key())).unwrap();
	fixture.settle_subscription("ns", "sub").await;

	let status = fixture.subscription_status("ns", "sub").unwrap();
	let unhealthy = find_condition(&status.conditions, ConditionType::CatalogSourcesUnhealthy).unwrap();
	assert_eq!(unhealthy.status, ConditionStatus::True);
	assert_eq!(unhealthy.message.as_deref(), Some("olm/ops (unhealthy)"));
	assert!(fixture.install_plans().is_empty());

	fixture.catalogs.set_healthy(&catalog_key(), true);
	fixture.settle_subscription("ns", "sub").await;
	let status = fixture.subscription_status("ns", "sub").unwrap();
	let healthy = find_condition(&status.conditions, ConditionType::CatalogSourcesUnhealthy).unwrap();
	assert_eq!(healthy.status, ConditionStatus::False);
	assert!(find_condition(&status.conditions, ConditionType::ResolutionFailed).is_none());
	assert_eq!(status.state, SubscriptionState::UpToDate);
}

#[tokio::test]
async fn transient_errors_change_nothing() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog().build());
	fixture.run_until_idle().await;
	fixture.insert(&subscription("ns", "sub", "p", "stable", &catalog_key())).unwrap();

	fixture.cluster.fail_next(1);
	fixture.settle_subscription("ns", "sub").await;
	assert!(fixture.install_plans().is_empty());
	assert!(fixture.subscription_status("ns", "sub").is_none());

	fixture.settle_subscription("ns", "sub").await;
	assert_eq!(fixture.subscription_status("ns", "sub").unwrap().current_bundle.as_deref(), Some("p-v3"));
}

#[tokio::test]
async fn deleted_plan_is_replaced() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog().build());
	let mut s = subscription("ns", "sub", "p", "stable", &catalog_key());
	s.spec.approval = Approval::Manual;
	fixture.insert(&s).unwrap();
	fixture.settle_subscription("ns", "sub").await;

	let plan = fixture.referenced_plan("ns", "sub").unwrap();
	let key = ObjectKey::of::<olm_rs::api::InstallPlan>(Some("ns"), plan.metadata.name.clone().unwrap());
	fixture.cluster.delete(&key).await.unwrap();

	let reconciler = olm_rs::subscription::Reconciler::new(fixture.cluster.as_ref(), fixture.catalogs.as_ref(), fixture.options());
	let outcome = reconciler.reconcile("ns", "sub").await.unwrap().unwrap();
	assert!(outcome.planned);
	let status = fixture.subscription_status("ns", "sub").unwrap();
	assert!(find_condition(&status.conditions, ConditionType::InstallPlanMissing).is_some());
	assert_eq!(fixture.referenced_plan("ns", "sub").unwrap().spec.bundle_names, vec!["p-v3"]);

	/* Seeing the new plan clears the condition */
	fixture.settle_subscription("ns", "sub").await;
	let status = fixture.subscription_status("ns", "sub").unwrap();
	assert!(find_condition(&status.conditions, ConditionType::InstallPlanMissing).is_none());
	assert_eq!(fixture.referenced_plan("ns", "sub").unwrap().phase(), InstallPlanPhase::RequiresApproval);
}

#[tokio::test]
async fn unapproved_plan_follows_the_catalog() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog().build());
	let mut s = subscription("ns", "sub", "p", "stable", &catalog_key());
	s.spec.approval = Approval::Manual;
	fixture.insert(&s).unwrap();
	fixture.settle_subscription("ns", "sub").await;
	let stale = fixture.referenced_plan("ns", "sub").unwrap();
	assert_eq!(stale.spec.bundle_names, vec!["p-v3"]);
	assert_eq!(stale.phase(), InstallPlanPhase::RequiresApproval);

	fixture.catalogs.publish(chain(4).build());
	fixture.settle_subscription("ns", "sub").await;

	let plan = fixture.referenced_plan("ns", "sub").unwrap();
	assert_eq!(plan.spec.bundle_names, vec!["p-v4"]);
	assert_eq!(plan.phase(), InstallPlanPhase::RequiresApproval);
	assert_ne!(plan.metadata.name, stale.metadata.name);
	assert_eq!(fixture.install_plans().len(), 2);
	assert_eq!(fixture.subscription_status("ns", "sub").unwrap().state, SubscriptionState::UpgradeAvailable);
}

#[tokio::test]
async fn unapproved_plan_is_kept_while_current() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog().build());
	let mut s = subscription("ns", "sub", "p", "stable", &catalog_key());
	s.spec.approval = Approval::Manual;
	fixture.insert(&s).unwrap();
	fixture.settle_subscription("ns", "sub").await;
	let plan = fixture.referenced_plan("ns", "sub").unwrap();

	fixture.catalogs.publish(linear_catalog().build());
	fixture.settle_subscription("ns", "sub").await;
	assert_eq!(fixture.referenced_plan("ns", "sub").unwrap().metadata.name, plan.metadata.name);
	assert_eq!(fixture.install_plans().len(), 1);
}

#[tokio::test]
async fn package_change_installs_the_new_package() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog()
		.package("q", &[("stable", "q-v1")])
		.bundle(BundleBuilder::new("q-v1", "q", "1.0.0").channel("stable").build())
		.build());
	fixture.insert(&subscription("ns", "sub", "p", "stable", &catalog_key())).unwrap();
	fixture.settle_subscription("ns", "sub").await;
	assert_eq!(fixture.subscription_status("ns", "sub").unwrap().current_bundle.as_deref(), Some("p-v3"));

	edit_subscription(&fixture, |s| s.spec.package = "q".into()).await;
	fixture.settle_subscription("ns", "sub").await;

	let status = fixture.subscription_status("ns", "sub").unwrap();
	assert_eq!(status.current_bundle.as_deref(), Some("q-v1"));
	assert_eq!(status.state, SubscriptionState::UpToDate);
	assert!(find_condition(&status.conditions, ConditionType::ResolutionFailed).is_none());
}

#[tokio::test]
async fn catalog_update_upgrades_without_being_asked() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog().build());
	fixture.insert(&subscription("ns", "sub", "p", "stable", &catalog_key())).unwrap();
	fixture.settle_subscription("ns", "sub").await;
	assert_eq!(fixture.subscription_status("ns", "sub").unwrap().current_bundle.as_deref(), Some("p-v3"));

	fixture.catalogs.publish(chain(4).build());
	assert!(fixture.run_until_idle().await > 0);

	let status = fixture.subscription_status("ns", "sub").unwrap();
	assert_eq!(status.current_bundle.as_deref(), Some("p-v4"));
	assert_eq!(status.state, SubscriptionState::UpToDate);
}

#[tokio::test]
async fn catalog_in_other_namespace_leaves_subscription_alone() {
	let fixture = Fixture::default();
	fixture.catalogs.publish(linear_catalog().build());
	fixture.insert(&subscription("ns", "sub", "p", "stable", &catalog_key())).unwrap();
	fixture.settle_subscription("ns", "sub").await;

	fixture.catalogs.publish(CatalogBuilder::new("own", "elsewhere").build());
	assert_eq!(fixture.run_until_idle().await, 0);
}
