use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Install scope and upgrade policy of the operators in a namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
	group = "operators.coreos.com",
	version = "v1",
	kind = "OperatorGroup",
	plural = "operatorgroups",
	shortname = "og",
	namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OperatorGroupSpec {
	/// Namespaces the operators watch, empty means all namespaces.
	#[serde(default)]
	pub target_namespaces: Vec<String>,
	#[serde(default)]
	pub upgrade_strategy: UpgradeStrategy,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum UpgradeStrategy {
	#[default]
	Default,
	/// Failed installs may be superseded by a newer bundle.
	FailForward,
}

impl OperatorGroupSpec {
	pub fn all_namespaces(&self) -> bool {
		self.target_namespaces.is_empty()
	}

	pub fn fail_forward(&self) -> bool {
		self.upgrade_strategy == UpgradeStrategy::FailForward
	}
}

/// Operator group of `namespace`, the defaults for the namespace alone when there is none.
///
/// With several groups the first listed one wins.
pub async fn for_namespace(cluster: &dyn crate::cluster::ClusterClient, namespace: &str) -> crate::Result<OperatorGroupSpec> {
	let groups = crate::cluster::list_as::<OperatorGroup>(cluster, Some(namespace)).await?;
	if groups.len() > 1 {
		log::warn!("{} operator groups in {}, using {}", groups.len(), namespace, groups[0].metadata.name.as_deref().unwrap_or_default());
	}
	Ok(groups.into_iter().next().map(|g| g.spec).unwrap_or_else(|| OperatorGroupSpec {
		target_namespaces: vec![namespace.to_string()],
		..Default::default()
	}))
}
