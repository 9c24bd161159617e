//! Keeping a subscription's package installed and moving it along its channel.
//!
//! A pass reads the subscription, follows the install plan it references and resolves the next
//! hop. A plan that hasn't started installing is kept while it targets what the resolution picks,
//! otherwise a new plan is recorded and referenced instead. Plans are applied by the
//! [executor](crate::install_plan::Executor), the reconciler only reads their phase.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use serde_json::Value;

use crate::api::condition::{remove_condition, set_condition, ConditionStatus, ConditionType};
use crate::api::subscription::InstallPlanRef;
use crate::api::{operator_group, InstallPlan, InstallPlanPhase, InstallPlanSpec, Subscription, SubscriptionState, SubscriptionStatus};
use crate::catalog::{CatalogKey, CatalogProvider, InstalledBundle, ResolutionScope};
use crate::cluster::{create_as, get_as, list_as, replace_status_as, ClusterClient, ClusterError, ObjectKey};
use crate::install_plan::{self, descriptor, InstallScope};
use crate::resolver::{Resolution, ResolverBuilder};
use crate::OlmRsOptions;

pub const SUBSCRIPTION_LABEL: &str = "olm-rs.io/subscription";

/// Result of a reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
	pub state: SubscriptionState,
	/// Plan the subscription references after the pass.
	pub install_plan: Option<ObjectKey>,
	/// A plan was created during the pass.
	pub planned: bool,
	pub status_written: bool,
}

/// Checks if `plan` was made for the subscription `name`.
pub fn is_owned_by(plan: &InstallPlan, name: &str) -> bool {
	plan.metadata.owner_references.iter().flatten()
		.any(|o| o.kind == Subscription::kind(&()) && o.name == name)
}

/// A plan waiting on approval leaves the upgrade available, anything else has it pending.
fn pending_state(phase: InstallPlanPhase) -> SubscriptionState {
	match phase {
		InstallPlanPhase::RequiresApproval => SubscriptionState::UpgradeAvailable,
		_ => SubscriptionState::UpgradePending,
	}
}

/// Deterministic plan name for a resolution made from `current`.
fn plan_name(namespace: &str, subscription: &str, fingerprint: &str, current: Option<&str>, bundle_names: &[String]) -> String {
	let digest = sha256::digest(format!("{}/{}\n{}\n{}\n{}", namespace, subscription, fingerprint, current.unwrap_or_default(), bundle_names.join(",")));
	format!("install-{}", digest.chars().take(10).collect::<String>())
}

pub struct Reconciler<'a> {
	cluster: &'a dyn ClusterClient,
	catalogs: &'a dyn CatalogProvider,
	options: &'a OlmRsOptions,
}

impl<'a> Reconciler<'a> {
	pub fn new(cluster: &'a dyn ClusterClient, catalogs: &'a dyn CatalogProvider, options: &'a OlmRsOptions) -> Self {
		Self { cluster, catalogs, options }
	}

	async fn installed(&self, namespace: &str) -> crate::Result<Vec<InstalledBundle>> {
		let descriptors = self.cluster.list(descriptor::API_VERSION, descriptor::KIND, Some(namespace)).await?;
		Ok(descriptors.iter().filter_map(descriptor::installed_from_descriptor).collect())
	}

	/// Runs one pass over the subscription `namespace`/`name`.
	///
	/// Returns `None` when the subscription doesn't exist. Resolution failures are written to the
	/// status before being returned.
	pub async fn reconcile(&self, namespace: &str, name: &str) -> crate::Result<Option<ReconcileOutcome>> {
		let key = ObjectKey::of::<Subscription>(Some(namespace), name);
		let Some(subscription) = get_as::<Subscription>(self.cluster, &key).await? else {
			log::debug!("{} is gone", key);
			return Ok(None)
		};
		let original = subscription.status.clone().unwrap_or_default();
		let mut status = original.clone();
		let spec = &subscription.spec;
		let fingerprint = spec.fingerprint();

		let group = operator_group::for_namespace(self.cluster, namespace).await?;
		let scope = ResolutionScope::build(self.catalogs, namespace, self.options.global_catalog_namespace(), self.installed(namespace).await?).await?;
		let catalog_key = CatalogKey::from(&spec.catalog_source_ref);
		self.report_catalog_health(&scope, &catalog_key, &mut status);

		/* Follow the referenced plan */
		let mut current = status.current_bundle.clone();
		let mut pending: Option<InstallPlan> = None;
		let mut failing_forward = false;
		if let Some(plan_ref) = status.install_plan_ref.clone() {
			let plan_key = ObjectKey::of::<InstallPlan>(Some(&plan_ref.namespace), &plan_ref.name);
			match get_as::<InstallPlan>(self.cluster, &plan_key).await? {
				None => {
					log::warn!("{} references missing {}", key, plan_key);
					set_condition(&mut status.conditions, ConditionType::InstallPlanMissing, ConditionStatus::True, "ReferencedInstallPlanNotFound", format!("install plan {} not found", plan_ref.name));
					remove_condition(&mut status.conditions, ConditionType::InstallPlanPending);
					status.install_plan_ref = None;
					status.target_bundle = None;
				},
				Some(plan) => {
					remove_condition(&mut status.conditions, ConditionType::InstallPlanMissing);
					let spec_changed = status.observed_spec.as_deref() != Some(fingerprint.as_str());
					match plan.phase() {
						InstallPlanPhase::Complete => {
							remove_condition(&mut status.conditions, ConditionType::InstallPlanPending);
							remove_condition(&mut status.conditions, ConditionType::InstallPlanFailed);
							if let Some(target) = plan.target_bundle() {
								if current.as_deref() != Some(target) {
									log::info!("{} installed {}", key, target);
								}
								current = Some(target.to_string());
							}
							status.current_bundle = current.clone();
							status.target_bundle = None;
						},
						InstallPlanPhase::Failed if spec_changed => {
							log::info!("{} changed, leaving failed {} behind", key, plan_key);
							remove_condition(&mut status.conditions, ConditionType::InstallPlanFailed);
							status.install_plan_ref = None;
							status.target_bundle = None;
						},
						InstallPlanPhase::Failed => {
							remove_condition(&mut status.conditions, ConditionType::InstallPlanPending);
							let message = plan.status.as_ref().and_then(|s| s.message.clone()).unwrap_or_default();
							let reason = plan.status.as_ref()
								.and_then(|s| s.steps.iter().find_map(|step| step.reason.clone()))
								.unwrap_or_else(|| "InstallComponentFailed".to_string());
							set_condition(&mut status.conditions, ConditionType::InstallPlanFailed, ConditionStatus::True, reason, message);

							if !group.fail_forward() {
								log::debug!("{} stays on failed {}", key, plan_key);
								return self.finish(subscription, original, status, Some(plan_key), false).await.map(Some)
							}
							/* Upgrade from the failed bundle as if it was installed */
							if let Some(target) = plan.target_bundle() {
								current = Some(target.to_string());
							}
							failing_forward = true;
						},
						phase if spec_changed => {
							log::info!("{} changed while {} is {}, abandoning it", key, plan_key, phase.as_str());
							remove_condition(&mut status.conditions, ConditionType::InstallPlanPending);
							status.install_plan_ref = None;
							status.target_bundle = None;
						},
						phase @ InstallPlanPhase::Installing => {
							set_condition(&mut status.conditions, ConditionType::InstallPlanPending, ConditionStatus::True, phase.as_str(), format!("install plan {} is {}", plan_ref.name, phase.as_str()));
							status.state = pending_state(phase);
							return self.finish(subscription, original, status, Some(plan_key), false).await.map(Some)
						},
						_ => {
							/* Not installing yet, kept only while the resolution still agrees with it */
							pending = Some(plan);
						},
					}
				},
			}
		}

		/* Moving to another package starts over from what that package has installed */
		if let Some(c) = current.clone() {
			let package = scope.installed(&c).and_then(|i| i.package.clone())
				.or_else(|| scope.find_bundle(&c, Some(&catalog_key)).map(|(_, b)| b.package.clone()));
			if package.is_some_and(|p| p != spec.package) {
				log::info!("{} moved from {} to package {}", key, c, spec.package);
				current = None;
				status.current_bundle = None;
			}
		}

		/* Something of the package may be installed without the subscription knowing */
		if current.is_none() {
			current = scope.installed_in_package(&spec.package).map(|i| i.name.clone());
			if let Some(c) = &current {
				log::info!("{} adopting installed {}", key, c);
				status.current_bundle = Some(c.clone());
			}
		}

		let mut builder = ResolverBuilder::new(&scope)
			.package(&spec.package, &spec.channel)
			.catalog(catalog_key)
			.starting_bundle(spec.starting_bundle.clone());
		if let Some(c) = &current {
			builder = builder.current(c, scope.installed(c).and_then(|i| i.version.clone()));
		}

		let resolution = match builder.resolve() {
			Ok(r) => r,
			Err(e) => {
				log::warn!("Resolving {} failed: {}", key, e);
				set_condition(&mut status.conditions, ConditionType::ResolutionFailed, ConditionStatus::True, e.reason(), e.to_string());
				let plan_key = status.install_plan_ref.as_ref().map(|r| ObjectKey::of::<InstallPlan>(Some(&r.namespace), &r.name));
				self.finish(subscription, original, status, plan_key, false).await?;
				return Err(e.into())
			},
		};
		remove_condition(&mut status.conditions, ConditionType::ResolutionFailed);

		if resolution.bundles.is_empty() && failing_forward {
			log::debug!("Nothing newer than the failed bundle of {}", key);
			let plan_key = status.install_plan_ref.as_ref().map(|r| ObjectKey::of::<InstallPlan>(Some(&r.namespace), &r.name));
			return self.finish(subscription, original, status, plan_key, false).await.map(Some)
		}
		if resolution.bundles.is_empty() {
			if let Some(stale) = &pending {
				log::info!("{} is up to date, leaving {} behind", key, stale.metadata.name.as_deref().unwrap_or_default());
				status.install_plan_ref = None;
				status.target_bundle = None;
			}
			status.state = SubscriptionState::UpToDate;
			remove_condition(&mut status.conditions, ConditionType::InstallPlanPending);
			let plan_key = status.install_plan_ref.as_ref().map(|r| ObjectKey::of::<InstallPlan>(Some(&r.namespace), &r.name));
			return self.finish(subscription, original, status, plan_key, false).await.map(Some)
		}

		let mut reusable: Option<InstallPlan> = None;
		if let Some(plan) = pending {
			let plan_name = plan.metadata.name.clone().unwrap_or_default();
			let phase = plan.phase();
			if plan.spec.bundle_names != resolution.bundle_names() {
				log::info!("{} now resolves to {}, replacing {} planned for {}", key, resolution.bundle_names().join(", "), plan_name, plan.spec.bundle_names.join(", "));
			} else if phase == InstallPlanPhase::None {
				/* Created but never recorded */
				reusable = Some(plan);
			} else {
				set_condition(&mut status.conditions, ConditionType::InstallPlanPending, ConditionStatus::True, phase.as_str(), format!("install plan {} is {}", plan_name, phase.as_str()));
				status.state = pending_state(phase);
				let plan_key = ObjectKey::of::<InstallPlan>(Some(namespace), &plan_name);
				return self.finish(subscription, original, status, Some(plan_key), false).await.map(Some)
			}
		}

		let plan = match self.create_plan(&subscription, &resolution, current.as_deref(), InstallScope::of(&group), reusable).await {
			Ok(p) => p,
			Err(e) if !e.is_transient() => {
				log::warn!("Planning {} failed: {}", key, e);
				set_condition(&mut status.conditions, ConditionType::ResolutionFailed, ConditionStatus::True, e.reason(), e.to_string());
				self.finish(subscription, original, status, None, false).await?;
				return Err(e)
			},
			Err(e) => return Err(e),
		};

		let plan_name = plan.metadata.name.clone().unwrap_or_default();
		let phase = plan.phase();
		status.install_plan_ref = Some(InstallPlanRef { name: plan_name.clone(), namespace: namespace.to_string() });
		status.target_bundle = plan.target_bundle().map(str::to_string);
		status.observed_spec = Some(fingerprint);
		status.state = pending_state(phase);
		set_condition(&mut status.conditions, ConditionType::InstallPlanPending, ConditionStatus::True, phase.as_str(), format!("install plan {} is {}", plan_name, phase.as_str()));

		self.collect_garbage(namespace, name, &plan_name).await?;
		let plan_key = ObjectKey::of::<InstallPlan>(Some(namespace), &plan_name);
		self.finish(subscription, original, status, Some(plan_key), true).await.map(Some)
	}

	fn report_catalog_health(&self, scope: &ResolutionScope, catalog: &CatalogKey, status: &mut SubscriptionStatus) {
		if scope.catalog(catalog).is_some() {
			set_condition(&mut status.conditions, ConditionType::CatalogSourcesUnhealthy, ConditionStatus::False, "AllCatalogSourcesHealthy", "");
			return
		}

		let mut names: Vec<String> = scope.unhealthy.iter().map(|k| format!("{} (unhealthy)", k)).collect();
		if !scope.unhealthy.contains(catalog) {
			names.insert(0, format!("{} (missing)", catalog));
		}
		log::debug!("Catalog {} of subscription is not usable", catalog);
		set_condition(&mut status.conditions, ConditionType::CatalogSourcesUnhealthy, ConditionStatus::True, "UnhealthyCatalogSourceFound", names.join(", "));
	}

	/// Creates the plan installing `resolution` and records its steps.
	///
	/// A plan for the same resolution that already exists is reused.
	async fn create_plan(&self, subscription: &Subscription, resolution: &Resolution, current: Option<&str>, scope: InstallScope, reusable: Option<InstallPlan>) -> crate::Result<InstallPlan> {
		let namespace = subscription.metadata.namespace.clone().unwrap_or_default();
		let name = subscription.metadata.name.clone().unwrap_or_default();
		let bundle_names = resolution.bundle_names();
		let steps = install_plan::plan(&resolution.bundles, &namespace, scope)?;

		if let Some(plan) = reusable.filter(|p| p.spec.bundle_names == bundle_names) {
			log::debug!("Recording steps on existing plan {}", plan.metadata.name.as_deref().unwrap_or_default());
			return install_plan::record_plan(self.cluster, &plan, steps).await
		}

		let owned = list_as::<InstallPlan>(self.cluster, Some(&namespace)).await?;
		let generation = owned.iter()
			.filter(|p| is_owned_by(p, &name))
			.map(|p| p.spec.generation)
			.max()
			.unwrap_or(0) + 1;

		let plan_name = plan_name(&namespace, &name, &subscription.spec.fingerprint(), current, &bundle_names);
		let mut plan = InstallPlan::new(&plan_name, InstallPlanSpec {
			bundle_names,
			approval: subscription.spec.approval,
			approved: false,
			generation,
		});
		plan.metadata.namespace = Some(namespace.clone());
		plan.metadata.labels = Some([(SUBSCRIPTION_LABEL.to_string(), name.clone())].into());
		plan.metadata.owner_references = Some(vec![OwnerReference {
			api_version: Subscription::api_version(&()).to_string(),
			kind: Subscription::kind(&()).to_string(),
			name: name.clone(),
			uid: subscription.metadata.uid.clone().unwrap_or_default(),
			controller: Some(true),
			block_owner_deletion: None,
		}]);

		let created = match create_as(self.cluster, &plan).await {
			Ok(p) => {
				log::info!("Created plan {}/{} installing {}", namespace, plan_name, plan.spec.bundle_names.join(", "));
				p
			},
			Err(crate::Error::Cluster(ClusterError::AlreadyExists(_))) => {
				let existing = get_as::<InstallPlan>(self.cluster, &ObjectKey::of::<InstallPlan>(Some(&namespace), &plan_name)).await?
					.ok_or_else(|| ClusterError::Conflict(plan_name.clone()))?;
				if existing.phase() != InstallPlanPhase::None {
					log::debug!("Plan {}/{} already exists", namespace, plan_name);
					return Ok(existing)
				}
				existing
			},
			Err(e) => return Err(e),
		};
		install_plan::record_plan(self.cluster, &created, steps).await
	}

	/// Deletes the oldest plans of the subscription beyond the retention limit, never the referenced one.
	async fn collect_garbage(&self, namespace: &str, subscription: &str, referenced: &str) -> crate::Result<()> {
		let mut others: Vec<InstallPlan> = list_as::<InstallPlan>(self.cluster, Some(namespace)).await?
			.into_iter()
			.filter(|p| is_owned_by(p, subscription) && p.metadata.name.as_deref() != Some(referenced))
			.collect();
		others.sort_by(|a, b| b.spec.generation.cmp(&a.spec.generation).then_with(|| a.metadata.name.cmp(&b.metadata.name)));

		for plan in others.into_iter().skip(self.options.max_retained_install_plans().saturating_sub(1)) {
			let name = plan.metadata.name.unwrap_or_default();
			log::debug!("Deleting old plan {}/{}", namespace, name);
			match self.cluster.delete(&ObjectKey::of::<InstallPlan>(Some(namespace), &name)).await {
				Ok(()) | Err(ClusterError::NotFound(_)) => {},
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}

	/// Writes the status when it changed.
	async fn finish(&self, mut subscription: Subscription, original: SubscriptionStatus, mut status: SubscriptionStatus, install_plan: Option<ObjectKey>, planned: bool) -> crate::Result<ReconcileOutcome> {
		let state = status.state;
		let changed = SubscriptionStatus { last_updated: None, ..status.clone() } != SubscriptionStatus { last_updated: None, ..original };
		if changed {
			status.last_updated = Some(chrono::Utc::now().to_rfc3339());
			subscription.status = Some(status);
			replace_status_as(self.cluster, &subscription).await?;
			log::trace!("Wrote status of subscription {}", subscription.metadata.name.as_deref().unwrap_or_default());
		}
		Ok(ReconcileOutcome { state, install_plan, planned, status_written: changed })
	}
}

/// Reads the subscription owning a plan manifest, if any.
pub fn owner_of(plan: &Value) -> Option<ObjectKey> {
	let namespace = plan.pointer("/metadata/namespace")?.as_str()?;
	plan.pointer("/metadata/ownerReferences")?
		.as_array()?
		.iter()
		.find(|o| o.get("kind").and_then(Value::as_str) == Some(&*Subscription::kind(&())))
		.and_then(|o| o.get("name")?.as_str())
		.map(|name| ObjectKey::of::<Subscription>(Some(namespace), name))
}
