//! Drives an [`InstallPlan`] through its phases and applies its steps.
//!
//! ```text
//! None -> Planning -> RequiresApproval -> Installing -> Complete
//!                  \______________________/          \-> Failed
//! ```
//!
//! Each pass reads the plan, does as much as it can and writes the status back with the
//! resourceVersion it read. A step is applied idempotently:
//! - missing objects are created;
//! - objects already carrying the step's content are left alone;
//! - anything else is replaced, CRDs only once the new definition is compatible.
//!
//! Transient cluster errors end the pass without touching the phase so it can be retried.
//!
//! Plans made by a subscription get their steps from it. Any other plan in `None` is planned
//! here from the bundles it names, looked up in the catalogs the namespace can see.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde_json::Value;

use kube::Resource;

use super::{descriptor, planner, InstallScope};
use super::step::{StepError, StepFailure};
use crate::api::{operator_group, Approval, InstallPlan, InstallPlanPhase, Step, StepStatus, Subscription};
use crate::api::condition::{set_condition, ConditionStatus, ConditionType};
use crate::catalog::{CatalogProvider, ResolutionScope};
use crate::cluster::{get_as, replace_status_as, ClusterClient, ClusterError, ObjectKey};
use crate::crd_compat;
use crate::resolver::ResolvedBundle;

/// How applying a step stopped early.
#[derive(Debug)]
enum Interrupt {
	/// The step can't be applied, the plan fails.
	Failed(StepError),
	/// Retry the pass later.
	Retry(crate::Error),
}

impl From<StepError> for Interrupt {
	fn from(e: StepError) -> Self {
		Interrupt::Failed(e)
	}
}

impl From<ClusterError> for Interrupt {
	fn from(e: ClusterError) -> Self {
		if e.is_transient() {
			Interrupt::Retry(e.into())
		} else {
			Interrupt::Failed(StepError::new(StepFailure::StepApplyFailed, e.to_string()))
		}
	}
}

/// Checks every field set in `desired` has the same value in `live`.
///
/// Fields only present on the live object, such as server defaults, are ignored.
pub fn is_superset(live: &Value, desired: &Value) -> bool {
	match (live, desired) {
		(Value::Object(l), Value::Object(d)) => d.iter().all(|(k, dv)| match l.get(k) {
			Some(lv) => is_superset(lv, dv),
			None => dv.is_null(),
		}),
		(Value::Array(l), Value::Array(d)) => l.len() == d.len() && l.iter().zip(d).all(|(lv, dv)| is_superset(lv, dv)),
		(l, d) => l == d,
	}
}

pub struct Executor<'c> {
	cluster: &'c dyn ClusterClient,
	step_timeout: Duration,
	/// Catalogs and global catalog namespace for planning plans nobody recorded steps on.
	catalogs: Option<(&'c dyn CatalogProvider, &'c str)>,
}

impl<'c> Executor<'c> {
	pub fn new(cluster: &'c dyn ClusterClient, step_timeout: Duration) -> Self {
		Self { cluster, step_timeout, catalogs: None }
	}

	/// Lets the executor plan the bundles of plans created without steps.
	pub fn catalogs(mut self, catalogs: &'c dyn CatalogProvider, global_namespace: &'c str) -> Self {
		self.catalogs = Some((catalogs, global_namespace));
		self
	}

	/// Runs one pass over the plan `namespace`/`name`.
	///
	/// Returns the phase the plan is left in, `None` when the plan doesn't exist.
	pub async fn sync(&self, namespace: &str, name: &str) -> crate::Result<Option<InstallPlanPhase>> {
		let key = ObjectKey::of::<InstallPlan>(Some(namespace), name);
		let Some(mut plan) = get_as::<InstallPlan>(self.cluster, &key).await? else {
			log::debug!("{} is gone", key);
			return Ok(None)
		};

		loop {
			let phase = plan.phase();
			log::trace!("{} is {}", key, phase.as_str());
			match phase {
				InstallPlanPhase::None => {
					let Some((catalogs, global_namespace)) = self.catalogs else { return Ok(Some(phase)) };
					if plan.metadata.owner_references.iter().flatten().any(|o| o.kind == Subscription::kind(&())) {
						log::trace!("{} gets its steps from its subscription", key);
						return Ok(Some(phase))
					}
					plan = self.plan_steps(plan, namespace, catalogs, global_namespace).await?;
				},
				InstallPlanPhase::Failed => return Ok(Some(phase)),
				InstallPlanPhase::Planning => {
					let next = if plan.spec.approval == Approval::Manual && !plan.spec.approved {
						InstallPlanPhase::RequiresApproval
					} else {
						InstallPlanPhase::Installing
					};
					plan = self.move_to(plan, next, None).await?;
				},
				InstallPlanPhase::RequiresApproval => {
					if !plan.spec.approved {
						return Ok(Some(phase))
					}
					log::info!("{} approved", key);
					plan = self.move_to(plan, InstallPlanPhase::Installing, None).await?;
				},
				InstallPlanPhase::Installing => {
					plan = self.install(plan, namespace).await?;
					return Ok(Some(plan.phase()))
				},
				InstallPlanPhase::Complete => {
					self.verify(&plan, namespace).await?;
					return Ok(Some(phase))
				},
			}
		}
	}

	/// Plans the bundles `plan` names, failing it when one of them is in no visible catalog.
	async fn plan_steps(&self, mut plan: InstallPlan, namespace: &str, catalogs: &dyn CatalogProvider, global_namespace: &str) -> crate::Result<InstallPlan> {
		let scope = ResolutionScope::build(catalogs, namespace, global_namespace, vec![]).await?;
		let mut bundles = Vec::<ResolvedBundle>::new();
		for name in &plan.spec.bundle_names {
			let Some((catalog, bundle)) = scope.find_bundle(name, None) else {
				let message = format!("bundle {} is not in any catalog visible from {}", name, namespace);
				log::warn!("Plan {}/{}: {}", namespace, plan.metadata.name.as_deref().unwrap_or_default(), message);
				let status = plan.status.get_or_insert_with(Default::default);
				set_condition(&mut status.conditions, ConditionType::Installed, ConditionStatus::False, "BundleNotFound", &message);
				return self.move_to(plan, InstallPlanPhase::Failed, Some(message)).await
			};
			bundles.push(ResolvedBundle { bundle: bundle.clone(), catalog: catalog.key.clone() });
		}

		let group = operator_group::for_namespace(self.cluster, namespace).await?;
		let steps = planner::plan(&bundles, namespace, InstallScope::of(&group))?;
		super::record_plan(self.cluster, &plan, steps).await
	}

	async fn move_to(&self, mut plan: InstallPlan, phase: InstallPlanPhase, message: Option<String>) -> crate::Result<InstallPlan> {
		let status = plan.status.get_or_insert_with(Default::default);
		log::debug!("Plan {} {} -> {}", plan.metadata.name.as_deref().unwrap_or_default(), status.phase.as_str(), phase.as_str());
		status.phase = phase;
		status.message = message;
		replace_status_as(self.cluster, &plan).await
	}

	async fn install(&self, mut plan: InstallPlan, namespace: &str) -> crate::Result<InstallPlan> {
		let step_count = plan.status.as_ref().map(|s| s.steps.len()).unwrap_or_default();

		for index in 0..step_count {
			let Some(step) = plan.status.as_ref().and_then(|s| s.steps.get(index)).cloned() else { break };
			match self.apply(&step, namespace).await {
				Ok(applied) => {
					if applied != step.status {
						if let Some(s) = plan.status.as_mut().and_then(|s| s.steps.get_mut(index)) {
							s.status = applied;
							s.reason = None;
							s.message = None;
						}
						plan = replace_status_as(self.cluster, &plan).await?;
					}
				},
				Err(Interrupt::Retry(e)) => {
					log::debug!("Step {}/{} interrupted: {}", step.resource_kind, step.resource_name, e);
					return Err(e)
				},
				Err(Interrupt::Failed(e)) => {
					log::warn!("Step {}/{} failed: {}", step.resource_kind, step.resource_name, e);
					let message = format!("{} {}: {}", step.resource_kind, step.resource_name, e.message);
					if let Some(status) = plan.status.as_mut() {
						if let Some(s) = status.steps.get_mut(index) {
							s.status = StepStatus::Failed;
							s.reason = Some(e.reason.as_str().to_string());
							s.message = Some(e.message.clone());
						}
						set_condition(&mut status.conditions, ConditionType::Installed, ConditionStatus::False, e.reason.as_str(), &message);
					}
					return self.move_to(plan, InstallPlanPhase::Failed, Some(message)).await
				},
			}
		}

		let steps = plan.status.as_ref().map(|s| s.steps.clone()).unwrap_or_default();
		self.remove_superseded_descriptors(&steps, namespace).await?;

		if let Some(status) = plan.status.as_mut() {
			set_condition(&mut status.conditions, ConditionType::Installed, ConditionStatus::True, "InstallSucceeded", "");
		}
		log::info!("Plan {}/{} complete", namespace, plan.metadata.name.as_deref().unwrap_or_default());
		self.move_to(plan, InstallPlanPhase::Complete, None).await
	}

	/// Runs a cluster call under the step timeout.
	async fn timed<T>(&self, key: &ObjectKey, call: impl Future<Output = Result<T, ClusterError>>) -> Result<Result<T, ClusterError>, StepError> {
		tokio::time::timeout(self.step_timeout, call).await
			.map_err(|_| StepError::new(StepFailure::StepTimeout, format!("{} took longer than {:?}", key, self.step_timeout)))
	}

	async fn apply(&self, step: &Step, namespace: &str) -> Result<StepStatus, Interrupt> {
		let desired: Value = serde_json::from_str(&step.manifest)
			.map_err(|e| StepError::new(StepFailure::StepApplyFailed, format!("unreadable manifest: {}", e)))?;
		let key = ObjectKey::from_manifest(&desired)
			.ok_or_else(|| StepError::new(StepFailure::StepApplyFailed, "manifest has no apiVersion, kind or name"))?;

		let live = match self.timed(&key, self.cluster.get(&key)).await?? {
			Some(live) => live,
			None => {
				if key.kind == descriptor::KIND {
					self.check_descriptor_conflict(&desired, namespace).await?;
				}
				match self.timed(&key, self.cluster.create(&desired)).await? {
					Ok(_) => {
						log::debug!("Created {}", key);
						return Ok(StepStatus::Created)
					},
					/* Created by someone else since the read */
					Err(ClusterError::AlreadyExists(_)) => self.timed(&key, self.cluster.get(&key)).await??
						.ok_or_else(|| Interrupt::Retry(ClusterError::Conflict(key.to_string()).into()))?,
					Err(e) => return Err(e.into()),
				}
			},
		};

		if is_superset(&live, &desired) {
			return Ok(if step.status.is_done() { step.status } else { StepStatus::Present })
		}

		if key.kind == "CustomResourceDefinition" {
			self.check_crd(&key, &live, &desired).await?;
		}
		if key.kind == descriptor::KIND {
			self.check_descriptor_conflict(&desired, namespace).await?;
		}

		let mut replacement = desired;
		if let (Some(rv), Some(meta)) = (live.pointer("/metadata/resourceVersion").cloned(), replacement.get_mut("metadata").and_then(Value::as_object_mut)) {
			meta.insert("resourceVersion".into(), rv);
		}
		self.timed(&key, self.cluster.replace(&replacement)).await??;
		log::debug!("Updated {}", key);
		Ok(StepStatus::Created)
	}

	async fn check_crd(&self, key: &ObjectKey, live: &Value, desired: &Value) -> Result<(), Interrupt> {
		let unreadable = |e: serde_json::Error| StepError::new(StepFailure::StepApplyFailed, format!("{} is unreadable: {}", key, e));
		let existing: CustomResourceDefinition = serde_json::from_value(live.clone()).map_err(unreadable)?;
		let proposed: CustomResourceDefinition = serde_json::from_value(desired.clone()).map_err(unreadable)?;

		crd_compat::check(&existing, &proposed)
			.map_err(|e| StepError::new(StepFailure::CRDIncompatible, e.to_string()))?;

		/* Unserved versions can't be listed */
		let mut stored = Vec::<Value>::new();
		for version in existing.spec.versions.iter().filter(|v| v.served) {
			let api_version = format!("{}/{}", existing.spec.group, version.name);
			stored.extend(self.timed(key, self.cluster.list(&api_version, &existing.spec.names.kind, None)).await??);
		}
		log::trace!("Validating {} stored objects against {}", stored.len(), key);
		crd_compat::check_stored(&proposed, &stored)
			.map_err(|e| StepError::new(StepFailure::CRDIncompatible, e.to_string()))?;
		Ok(())
	}

	/// Fails when a descriptor of another package in the namespace already owns one of the APIs.
	async fn check_descriptor_conflict(&self, desired: &Value, namespace: &str) -> Result<(), Interrupt> {
		let Some(incoming) = descriptor::installed_from_descriptor(desired) else { return Ok(()) };
		let key = ObjectKey::new(descriptor::API_VERSION, descriptor::KIND, Some(namespace), &incoming.name);
		let others = self.timed(&key, self.cluster.list(descriptor::API_VERSION, descriptor::KIND, Some(namespace))).await??;

		for other in others.iter().filter_map(descriptor::installed_from_descriptor) {
			if other.name == incoming.name || (other.package.is_some() && other.package == incoming.package) {
				continue
			}
			if let Some(api) = incoming.owned_apis.iter().find(|api| other.owns(api)) {
				return Err(StepError::new(StepFailure::ConstraintConflict, format!("{} is already provided by {}", api, other.name)).into())
			}
		}
		Ok(())
	}

	/// Deletes descriptors of the same packages that this plan's descriptors replaced.
	async fn remove_superseded_descriptors(&self, steps: &[Step], namespace: &str) -> crate::Result<()> {
		let installed: Vec<_> = steps.iter()
			.filter(|s| s.resource_kind == descriptor::KIND)
			.filter_map(|s| serde_json::from_str::<Value>(&s.manifest).ok())
			.filter_map(|m| descriptor::installed_from_descriptor(&m))
			.collect();
		if installed.is_empty() {
			return Ok(())
		}

		let existing = self.cluster.list(descriptor::API_VERSION, descriptor::KIND, Some(namespace)).await?;
		for old in existing.iter().filter_map(descriptor::installed_from_descriptor) {
			let superseded = installed.iter().any(|new| new.name != old.name && new.package.is_some() && new.package == old.package);
			if !superseded || installed.iter().any(|new| new.name == old.name) {
				continue
			}
			log::info!("Removing superseded descriptor {}/{}", namespace, old.name);
			match self.cluster.delete(&ObjectKey::new(descriptor::API_VERSION, descriptor::KIND, Some(namespace), &old.name)).await {
				Ok(()) | Err(ClusterError::NotFound(_)) => {},
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}

	/// Compares a complete plan with the cluster without writing anything.
	async fn verify(&self, plan: &InstallPlan, namespace: &str) -> crate::Result<()> {
		for step in plan.status.iter().flat_map(|s| s.steps.iter()) {
			let Ok(desired) = serde_json::from_str::<Value>(&step.manifest) else { continue };
			let Some(key) = ObjectKey::from_manifest(&desired) else { continue };
			match self.cluster.get(&key).await? {
				Some(live) if is_superset(&live, &desired) => {},
				Some(_) => log::warn!("{} drifted from plan {}/{}", key, namespace, plan.metadata.name.as_deref().unwrap_or_default()),
				None => log::warn!("{} of plan {}/{} is missing", key, namespace, plan.metadata.name.as_deref().unwrap_or_default()),
			}
		}
		Ok(())
	}
}
