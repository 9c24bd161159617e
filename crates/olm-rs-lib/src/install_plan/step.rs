use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde_json::Value;

use crate::api::{CatalogSourceRef, Step, StepStatus};
use crate::catalog::CatalogKey;

/// Steps are deduplicated on kind and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
	pub kind: String,
	pub name: String,
}

impl std::fmt::Display for ResourceKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.kind, self.name)
	}
}

impl From<&Step> for ResourceKey {
	fn from(step: &Step) -> Self {
		Self { kind: step.resource_kind.clone(), name: step.resource_name.clone() }
	}
}

/// An object a step applies.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResource {
	CustomResourceDefinition(CustomResourceDefinition),
	ServiceAccount(ServiceAccount),
	Role(Role),
	RoleBinding(RoleBinding),
	ClusterRole(ClusterRole),
	ClusterRoleBinding(ClusterRoleBinding),
	/// A bundle provided object of any other kind.
	Object(Value),
	/// The bundle's `ClusterServiceVersion`.
	Descriptor(Value),
}

impl StepResource {
	pub fn manifest(&self) -> crate::Result<Value> {
		Ok(match self {
			StepResource::CustomResourceDefinition(o) => serde_json::to_value(o)?,
			StepResource::ServiceAccount(o) => serde_json::to_value(o)?,
			StepResource::Role(o) => serde_json::to_value(o)?,
			StepResource::RoleBinding(o) => serde_json::to_value(o)?,
			StepResource::ClusterRole(o) => serde_json::to_value(o)?,
			StepResource::ClusterRoleBinding(o) => serde_json::to_value(o)?,
			StepResource::Object(v) | StepResource::Descriptor(v) => v.clone(),
		})
	}
}

/// A step before it's written into a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
	pub resolving: String,
	pub catalog: CatalogKey,
	pub resource: StepResource,
}

impl PlannedStep {
	pub fn into_step(self) -> crate::Result<Step> {
		let manifest = self.resource.manifest()?;
		let key = crate::cluster::ObjectKey::from_manifest(&manifest)
			.ok_or_else(|| crate::Error::Validation(format!("step for {} has no apiVersion, kind or name", self.resolving)))?;
		let (group, version) = crate::cluster::split_api_version(&key.api_version);

		Ok(Step {
			resolving: self.resolving,
			resource_group: group.to_string(),
			resource_version: version.to_string(),
			resource_kind: key.kind,
			resource_name: key.name,
			resource_namespace: key.namespace,
			catalog_source_ref: CatalogSourceRef::from(&self.catalog),
			manifest: serde_json::to_string(&manifest)?,
			status: StepStatus::Unknown,
			reason: None,
			message: None,
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFailure {
	CRDIncompatible,
	StepApplyFailed,
	StepTimeout,
	ConstraintConflict,
}

impl StepFailure {
	pub fn as_str(&self) -> &'static str {
		match self {
			StepFailure::CRDIncompatible => "CRDIncompatible",
			StepFailure::StepApplyFailed => "StepApplyFailed",
			StepFailure::StepTimeout => "StepTimeout",
			StepFailure::ConstraintConflict => "ConstraintConflict",
		}
	}
}

/// Why a step could not be applied, written onto the step and the plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {message}", reason.as_str())]
pub struct StepError {
	pub reason: StepFailure,
	pub message: String,
}

impl StepError {
	pub fn new(reason: StepFailure, message: impl Into<String>) -> Self {
		Self { reason, message: message.into() }
	}
}
