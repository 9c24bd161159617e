//! Install plans, from resolved bundles to objects applied on the cluster.
//!
//! The [`planner`] turns a resolution into ordered [`Step`]s, which are recorded on an
//! [`InstallPlan`] and then applied by the [`Executor`].

pub mod planner;
pub use planner::{plan, InstallScope};

pub mod executor;
pub use executor::Executor;

pub mod descriptor;

mod step;
pub use step::*;

use crate::api::{InstallPlan, InstallPlanPhase, InstallPlanStatus, Step};
use crate::cluster::{replace_status_as, ClusterClient};

/// Writes `steps` onto `plan` and moves it to `Planning`.
pub async fn record_plan(cluster: &dyn ClusterClient, plan: &InstallPlan, steps: Vec<Step>) -> crate::Result<InstallPlan> {
	let mut plan = plan.clone();
	log::debug!("Recording {} steps on plan {}", steps.len(), plan.metadata.name.as_deref().unwrap_or_default());
	plan.status = Some(InstallPlanStatus {
		phase: InstallPlanPhase::Planning,
		steps,
		..Default::default()
	});
	replace_status_as(cluster, &plan).await
}
