use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Approval, CatalogSourceRef, Condition};

/// Request to keep a package from a channel installed and up to date.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
	group = "operators.coreos.com",
	version = "v1alpha1",
	kind = "Subscription",
	plural = "subscriptions",
	shortname = "sub",
	namespaced,
	status = "SubscriptionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
	pub package: String,
	pub channel: String,
	pub catalog_source_ref: CatalogSourceRef,
	/// Bundle to install first instead of the channel head.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub starting_bundle: Option<String>,
	#[serde(default)]
	pub approval: Approval,
}

impl SubscriptionSpec {
	/// Identifies the spec fields that decide what gets installed.
	pub fn fingerprint(&self) -> String {
		sha256::digest(format!(
			"{}\n{}\n{}/{}\n{}",
			self.package,
			self.channel,
			self.catalog_source_ref.namespace,
			self.catalog_source_ref.name,
			self.starting_bundle.as_deref().unwrap_or(""),
		))
	}
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum SubscriptionState {
	#[default]
	None,
	UpToDate,
	UpgradeAvailable,
	UpgradePending,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct InstallPlanRef {
	pub name: String,
	pub namespace: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
	#[serde(default)]
	pub state: SubscriptionState,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub current_bundle: Option<String>,
	/// Bundle the referenced install plan installs.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target_bundle: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub install_plan_ref: Option<InstallPlanRef>,
	#[serde(default)]
	pub conditions: Vec<Condition>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_updated: Option<String>,
	/// Fingerprint of the spec the referenced plan was made for.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub observed_spec: Option<String>,
}

#[cfg(test)]
mod test {
	use super::*;

	fn spec() -> SubscriptionSpec {
		serde_json::from_value(serde_json::json!({
			"package": "p",
			"channel": "stable",
			"catalogSourceRef": { "name": "ops", "namespace": "olm" },
		})).unwrap()
	}

	#[test] fn approval_defaults_to_automatic() { assert_eq!(spec().approval, Approval::Automatic) }
	#[test] fn fingerprint_tracks_channel() {
		let mut other = spec();
		other.channel = "fast".into();
		assert_ne!(spec().fingerprint(), other.fingerprint());
		assert_eq!(spec().fingerprint(), spec().fingerprint());
	}
}
