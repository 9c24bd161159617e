use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Approval, CatalogSourceRef, Condition};

/// A resolved set of bundles and the steps that install them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
	group = "operators.coreos.com",
	version = "v1alpha1",
	kind = "InstallPlan",
	plural = "installplans",
	shortname = "ip",
	namespaced,
	status = "InstallPlanStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanSpec {
	pub bundle_names: Vec<String>,
	#[serde(default)]
	pub approval: Approval,
	#[serde(default)]
	pub approved: bool,
	/// Increases with each plan made for the same subscription.
	#[serde(default)]
	pub generation: i64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum InstallPlanPhase {
	#[default]
	None,
	Planning,
	RequiresApproval,
	Installing,
	Complete,
	Failed,
}

impl InstallPlanPhase {
	pub fn is_terminal(&self) -> bool {
		matches!(self, InstallPlanPhase::Complete | InstallPlanPhase::Failed)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			InstallPlanPhase::None => "None",
			InstallPlanPhase::Planning => "Planning",
			InstallPlanPhase::RequiresApproval => "RequiresApproval",
			InstallPlanPhase::Installing => "Installing",
			InstallPlanPhase::Complete => "Complete",
			InstallPlanPhase::Failed => "Failed",
		}
	}
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum StepStatus {
	#[default]
	Unknown,
	Present,
	Created,
	Failed,
}

impl StepStatus {
	pub fn is_done(&self) -> bool {
		matches!(self, StepStatus::Present | StepStatus::Created)
	}
}

/// One object to be applied.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Step {
	/// Bundle that introduced the step.
	pub resolving: String,
	pub resource_kind: String,
	pub resource_name: String,
	#[serde(default)]
	pub resource_group: String,
	pub resource_version: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_namespace: Option<String>,
	pub catalog_source_ref: CatalogSourceRef,
	/// The object to apply, as JSON.
	pub manifest: String,
	#[serde(default)]
	pub status: StepStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstallPlanStatus {
	#[serde(default)]
	pub phase: InstallPlanPhase,
	#[serde(default)]
	pub steps: Vec<Step>,
	#[serde(default)]
	pub conditions: Vec<Condition>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

impl InstallPlan {
	pub fn phase(&self) -> InstallPlanPhase {
		self.status.as_ref().map(|s| s.phase).unwrap_or_default()
	}

	/// The bundle the plan moves its subscription to.
	pub fn target_bundle(&self) -> Option<&str> {
		self.spec.bundle_names.last().map(String::as_str)
	}
}
