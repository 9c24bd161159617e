//! Resource kinds the controller reads and writes.
//!
//! `Subscription` and `InstallPlan` are served by the controller's own CRDs,
//! `OperatorGroup` is read for the install scope and upgrade strategy.

use schemars::JsonSchema;
use serde::{Serialize, Deserialize};

pub mod condition;
pub use condition::{Condition, ConditionType, ConditionStatus};

pub mod subscription;
pub use subscription::{Subscription, SubscriptionSpec, SubscriptionStatus, SubscriptionState};

pub mod install_plan;
pub use install_plan::{InstallPlan, InstallPlanSpec, InstallPlanStatus, InstallPlanPhase, Step, StepStatus};

pub mod operator_group;
pub use operator_group::{OperatorGroup, OperatorGroupSpec, UpgradeStrategy};

pub const GROUP: &str = "operators.coreos.com";
pub const API_VERSION: &str = "operators.coreos.com/v1alpha1";

/// Reference to a catalog by name and namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct CatalogSourceRef {
	pub name: String,
	pub namespace: String,
}

impl From<&CatalogSourceRef> for crate::catalog::CatalogKey {
	fn from(r: &CatalogSourceRef) -> Self {
		crate::catalog::CatalogKey::new(&r.name, &r.namespace)
	}
}

impl From<&crate::catalog::CatalogKey> for CatalogSourceRef {
	fn from(k: &crate::catalog::CatalogKey) -> Self {
		Self { name: k.name.clone(), namespace: k.namespace.clone() }
	}
}

/// How an install plan is allowed to start.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum Approval {
	#[default]
	Automatic,
	Manual,
}

/// Every CRD the controller serves.
pub fn crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition> {
	use kube::CustomResourceExt;
	vec![Subscription::crd(), InstallPlan::crd(), OperatorGroup::crd()]
}
