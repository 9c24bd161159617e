//! Access to the objects stored in the cluster.
//!
//! Objects travel as JSON so that every kind, built in or custom, goes through the same calls.
//! Writes use optimistic concurrency, an object carrying `metadata.resourceVersion` is only
//! written when the stored version still matches.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

mod memory;
pub use memory::MemoryCluster;

mod kube_cluster;
pub use kube_cluster::KubeCluster;

/// Identifies an object in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
	pub api_version: String,
	pub kind: String,
	/// `None` for cluster scoped objects.
	pub namespace: Option<String>,
	pub name: String,
}

impl ObjectKey {
	pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
		Self {
			api_version: api_version.into(),
			kind: kind.into(),
			namespace: namespace.map(str::to_string),
			name: name.into(),
		}
	}

	/// Key of a typed resource.
	pub fn of<K: kube::Resource<DynamicType = ()>>(namespace: Option<&str>, name: impl Into<String>) -> Self {
		Self::new(K::api_version(&()), K::kind(&()), namespace, name)
	}

	pub fn from_manifest(manifest: &Value) -> Option<Self> {
		Some(Self {
			api_version: manifest.get("apiVersion")?.as_str()?.to_string(),
			kind: manifest.get("kind")?.as_str()?.to_string(),
			namespace: manifest.pointer("/metadata/namespace").and_then(Value::as_str).map(str::to_string),
			name: manifest.pointer("/metadata/name")?.as_str()?.to_string(),
		})
	}

	/// The API group, empty for the core group.
	pub fn group(&self) -> &str {
		split_api_version(&self.api_version).0
	}
}

impl std::fmt::Display for ObjectKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.namespace {
			Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
			None => write!(f, "{} {}", self.kind, self.name),
		}
	}
}

/// Splits `group/version` into its parts, the core group has no prefix.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
	match api_version.split_once('/') {
		Some((group, version)) => (group, version),
		None => ("", api_version),
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
	#[error("{0} not found")]
	NotFound(String),
	#[error("{0} already exists")]
	AlreadyExists(String),
	/// The stored object changed since it was read.
	#[error("conflict writing {0}")]
	Conflict(String),
	/// The API server rejected the content.
	#[error("rejected: {0}")]
	Invalid(String),
	#[error("cluster unavailable: {0}")]
	Transient(String),
}

impl ClusterError {
	/// Errors that go away by retrying, a conflict is retried after reading the object again.
	pub fn is_transient(&self) -> bool {
		matches!(self, ClusterError::Conflict(_) | ClusterError::Transient(_))
	}
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
	async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, ClusterError>;
	async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>, ClusterError>;
	async fn create(&self, object: &Value) -> Result<Value, ClusterError>;
	/// Replaces everything but the status.
	async fn replace(&self, object: &Value) -> Result<Value, ClusterError>;
	/// Replaces only the status.
	async fn replace_status(&self, object: &Value) -> Result<Value, ClusterError>;
	async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError>;
}

pub async fn get_as<T: DeserializeOwned>(client: &dyn ClusterClient, key: &ObjectKey) -> crate::Result<Option<T>> {
	match client.get(key).await? {
		Some(v) => Ok(Some(serde_json::from_value(v)?)),
		None => Ok(None),
	}
}

/// Lists a typed resource, objects that fail to deserialize are skipped.
pub async fn list_as<K>(client: &dyn ClusterClient, namespace: Option<&str>) -> crate::Result<Vec<K>>
where
	K: kube::Resource<DynamicType = ()> + DeserializeOwned,
{
	let objects = client.list(&K::api_version(&()), &K::kind(&()), namespace).await?;
	Ok(objects.into_iter()
		.filter_map(|o| match serde_json::from_value::<K>(o) {
			Ok(k) => Some(k),
			Err(e) => {
				log::warn!("Skipping malformed {}: {}", K::kind(&()), e);
				None
			},
		})
		.collect())
}

pub async fn create_as<K: Serialize + DeserializeOwned>(client: &dyn ClusterClient, object: &K) -> crate::Result<K> {
	let created = client.create(&serde_json::to_value(object)?).await?;
	Ok(serde_json::from_value(created)?)
}

pub async fn replace_status_as<K: Serialize + DeserializeOwned>(client: &dyn ClusterClient, object: &K) -> crate::Result<K> {
	let written = client.replace_status(&serde_json::to_value(object)?).await?;
	Ok(serde_json::from_value(written)?)
}

pub async fn replace_as<K: Serialize + DeserializeOwned>(client: &dyn ClusterClient, object: &K) -> crate::Result<K> {
	let written = client.replace(&serde_json::to_value(object)?).await?;
	Ok(serde_json::from_value(written)?)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn key_from_manifest() {
		let key = ObjectKey::from_manifest(&serde_json::json!({
			"apiVersion": "rbac.authorization.k8s.io/v1",
			"kind": "Role",
			"metadata": { "name": "r", "namespace": "ns" },
		})).unwrap();
		assert_eq!(key, ObjectKey::new("rbac.authorization.k8s.io/v1", "Role", Some("ns"), "r"));
		assert_eq!(key.group(), "rbac.authorization.k8s.io");
	}

	#[test] fn core_group_is_empty() { assert_eq!(split_api_version("v1"), ("", "v1")) }
	#[test] fn conflict_is_transient() { assert!(ClusterError::Conflict("x".into()).is_transient()) }
	#[test] fn invalid_is_not_transient() { assert!(!ClusterError::Invalid("x".into()).is_transient()) }
}
