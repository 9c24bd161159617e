use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct Condition {
	#[serde(rename = "type")]
	pub type_: ConditionType,
	pub status: ConditionStatus,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
	#[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
	pub last_transition_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionType {
	CatalogSourcesUnhealthy,
	InstallPlanPending,
	InstallPlanFailed,
	InstallPlanMissing,
	ResolutionFailed,
	/// Set on install plans.
	Installed,
	#[serde(other)]
	Unknown,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
	True,
	False,
	Unknown,
}

/// Sets a condition, the transition time only moves when the status changes.
pub fn set_condition(conditions: &mut Vec<Condition>, type_: ConditionType, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) {
	let reason = Some(reason.into());
	let message = Some(message.into());
	match conditions.iter_mut().find(|c| c.type_ == type_) {
		Some(c) => {
			if c.status != status {
				c.status = status;
				c.last_transition_time = Some(chrono::Utc::now().to_rfc3339());
			}
			c.reason = reason;
			c.message = message;
		},
		None => conditions.push(Condition {
			type_,
			status,
			reason,
			message,
			last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
		}),
	}
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: ConditionType) {
	conditions.retain(|c| c.type_ != type_);
}

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
	conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn transition_time_kept_while_status_unchanged() {
		let mut conditions = vec![];
		set_condition(&mut conditions, ConditionType::InstallPlanPending, ConditionStatus::True, "Installing", "");
		conditions[0].last_transition_time = Some("earlier".into());
		set_condition(&mut conditions, ConditionType::InstallPlanPending, ConditionStatus::True, "RequiresApproval", "");
		assert_eq!(conditions[0].last_transition_time.as_deref(), Some("earlier"));
		assert_eq!(conditions[0].reason.as_deref(), Some("RequiresApproval"));

		set_condition(&mut conditions, ConditionType::InstallPlanPending, ConditionStatus::False, "Complete", "");
		assert_ne!(conditions[0].last_transition_time.as_deref(), Some("earlier"));
	}

	#[test]
	fn removal_only_touches_type() {
		let mut conditions = vec![];
		set_condition(&mut conditions, ConditionType::ResolutionFailed, ConditionStatus::True, "ConstraintConflict", "");
		set_condition(&mut conditions, ConditionType::InstallPlanMissing, ConditionStatus::True, "ReferencedInstallPlanNotFound", "");
		remove_condition(&mut conditions, ConditionType::ResolutionFailed);
		assert_eq!(conditions.len(), 1);
		assert!(find_condition(&conditions, ConditionType::InstallPlanMissing).is_some());
	}
}
