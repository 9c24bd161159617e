//! Bundles, the versioned unit published by a catalog.

use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::{Serialize, Deserialize};

use super::VersionRange;

/// Group, version and kind of an API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiKey {
	pub group: String,
	pub version: String,
	pub kind: String,
}

impl ApiKey {
	pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
		Self { group: group.into(), version: version.into(), kind: kind.into() }
	}
}

impl std::fmt::Display for ApiKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.group.is_empty() {
			write!(f, "{}/{}", self.version, self.kind)
		} else {
			write!(f, "{}/{}, Kind={}", self.group, self.version, self.kind)
		}
	}
}

/// An API the bundle provides.
///
/// When `crd` is present the API is backed by a custom resource definition which is installed with the bundle,
/// otherwise it's an extension API served by the operator itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedApi {
	pub group: String,
	pub version: String,
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub crd: Option<CustomResourceDefinition>,
}

impl OwnedApi {
	pub fn key(&self) -> ApiKey {
		ApiKey::new(&self.group, &self.version, &self.kind)
	}
}

/// Rules granted to a service account the operator runs as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
	pub service_account_name: String,
	#[serde(default)]
	pub rules: Vec<PolicyRule>,
}

/// A specific operator version.
///
/// Bundles are immutable once published by a catalog and are shared between snapshots behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
	pub name: String,
	pub package: String,
	/// Channels this bundle is a member of.
	#[serde(default)]
	pub channels: Vec<String>,
	pub version: semver::Version,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub replaces: Option<String>,
	#[serde(default)]
	pub skips: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub skip_range: Option<VersionRange>,
	#[serde(default, rename = "ownedAPIs")]
	pub owned_apis: Vec<OwnedApi>,
	#[serde(default, rename = "requiredAPIs")]
	pub required_apis: Vec<ApiKey>,
	#[serde(default)]
	pub permissions: Vec<Permission>,
	#[serde(default)]
	pub cluster_permissions: Vec<Permission>,
	#[serde(default)]
	pub extra_objects: Vec<serde_json::Value>,
	/// The bundle's own descriptor, rendered into a `ClusterServiceVersion` during planning.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub descriptor: Option<serde_json::Value>,
}

impl Bundle {
	pub fn owns(&self, api: &ApiKey) -> bool {
		self.owned_apis.iter().any(|o| &o.key() == api)
	}

	pub fn owned_api_keys(&self) -> impl Iterator<Item = ApiKey> + '_ {
		self.owned_apis.iter().map(OwnedApi::key)
	}

	/// CRDs shipped with the bundle, each only once even when it backs several owned versions.
	pub fn owned_crds(&self) -> Vec<&CustomResourceDefinition> {
		let mut crds = Vec::<&CustomResourceDefinition>::new();
		for crd in self.owned_apis.iter().filter_map(|o| o.crd.as_ref()) {
			if !crds.iter().any(|c| c.metadata.name == crd.metadata.name) {
				crds.push(crd);
			}
		}
		crds
	}

	/// Checks if installing this bundle supersedes the bundle `name` at `version`.
	///
	/// `replaces`, `skips` and `skipRange` all count.
	pub fn supersedes(&self, name: &str, version: Option<&semver::Version>) -> bool {
		if self.replaces.as_deref() == Some(name) || self.skips.iter().any(|s| s == name) {
			return true
		}
		match (&self.skip_range, version) {
			(Some(range), Some(v)) => range.contains(v),
			_ => false,
		}
	}

	pub fn in_channel(&self, channel: &str) -> bool {
		self.channels.iter().any(|c| c == channel)
	}
}

impl std::fmt::Display for Bundle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} ({})", self.name, self.version)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn bundle(name: &str, version: &str) -> Bundle {
		Bundle {
			name: name.to_string(),
			package: "p".to_string(),
			channels: vec!["stable".to_string()],
			version: semver::Version::parse(version).unwrap(),
			replaces: None,
			skips: vec![],
			skip_range: None,
			owned_apis: vec![],
			required_apis: vec![],
			permissions: vec![],
			cluster_permissions: vec![],
			extra_objects: vec![],
			descriptor: None,
		}
	}

	#[test]
	fn supersedes_through_each_edge_kind() {
		let mut b = bundle("p-v3", "3.0.0");
		b.replaces = Some("p-v2".to_string());
		b.skips = vec!["p-v1".to_string()];
		b.skip_range = Some(">=0.1.0 <0.5.0".parse().unwrap());

		assert!(b.supersedes("p-v2", None));
		assert!(b.supersedes("p-v1", None));
		assert!(b.supersedes("p-v0.3", Some(&semver::Version::new(0, 3, 0))));
		assert!(!b.supersedes("p-v0.7", Some(&semver::Version::new(0, 7, 0))));
	}

	#[test]
	fn deserializes_catalog_field_names() {
		let b: Bundle = serde_json::from_value(serde_json::json!({
			"name": "p-v1",
			"package": "p",
			"version": "1.0.0",
			"skipRange": "<1.0.0",
			"ownedAPIs": [{ "group": "example.com", "version": "v1", "kind": "Widget" }],
			"requiredAPIs": [{ "group": "example.com", "version": "v1", "kind": "Gadget" }],
		})).unwrap();
		assert!(b.owns(&ApiKey::new("example.com", "v1", "Widget")));
		assert_eq!(b.required_apis[0].kind, "Gadget");
		assert!(b.skip_range.unwrap().contains(&semver::Version::new(0, 9, 0)));
	}
}
