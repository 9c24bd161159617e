use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use serde_json::Value;
use tokio::sync::RwLock;

use super::*;

impl From<kube::Error> for ClusterError {
	fn from(e: kube::Error) -> Self {
		match e {
			kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
				(404, _) => ClusterError::NotFound(response.message),
				(409, "AlreadyExists") => ClusterError::AlreadyExists(response.message),
				(409, _) => ClusterError::Conflict(response.message),
				(400, _) | (403, _) | (422, _) => ClusterError::Invalid(response.message),
				_ => ClusterError::Transient(response.message),
			},
			other => ClusterError::Transient(other.to_string()),
		}
	}
}

/// [`ClusterClient`] backed by the Kubernetes API.
///
/// Kinds are looked up through discovery once and cached.
pub struct KubeCluster {
	client: kube::Client,
	resources: RwLock<HashMap<(String, String), (ApiResource, ApiCapabilities)>>,
}

impl KubeCluster {
	pub fn new(client: kube::Client) -> Self {
		Self {
			client,
			resources: Default::default(),
		}
	}

	pub fn client(&self) -> &kube::Client {
		&self.client
	}

	async fn resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, ApiCapabilities), ClusterError> {
		let cache_key = (api_version.to_string(), kind.to_string());
		if let Some(found) = self.resources.read().await.get(&cache_key) {
			return Ok(found.clone())
		}

		let (group, version) = split_api_version(api_version);
		let gvk = GroupVersionKind::gvk(group, version, kind);
		let found = kube::discovery::pinned_kind(&self.client, &gvk).await.map_err(|e| match e {
			kube::Error::Discovery(d) => ClusterError::Invalid(format!("unknown kind {} {}: {}", api_version, kind, d)),
			other => other.into(),
		})?;
		log::trace!("Discovered {} {} as {}", api_version, kind, found.0.plural);
		self.resources.write().await.insert(cache_key, found.clone());
		Ok(found)
	}

	async fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClusterError> {
		let (resource, capabilities) = self.resource(api_version, kind).await?;
		Ok(match (capabilities.scope, namespace) {
			(Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &resource),
			_ => Api::all_with(self.client.clone(), &resource),
		})
	}

	async fn api_for(&self, object: &Value) -> Result<(Api<DynamicObject>, ObjectKey), ClusterError> {
		let key = ObjectKey::from_manifest(object).ok_or_else(|| ClusterError::Invalid("object has no apiVersion, kind or name".into()))?;
		let api = self.api(&key.api_version, &key.kind, key.namespace.as_deref()).await?;
		Ok((api, key))
	}
}

fn to_dynamic(object: &Value) -> Result<DynamicObject, ClusterError> {
	serde_json::from_value(object.clone()).map_err(|e| ClusterError::Invalid(e.to_string()))
}

fn to_value(object: DynamicObject) -> Result<Value, ClusterError> {
	serde_json::to_value(object).map_err(|e| ClusterError::Transient(e.to_string()))
}

#[async_trait]
impl ClusterClient for KubeCluster {
	async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, ClusterError> {
		let api = self.api(&key.api_version, &key.kind, key.namespace.as_deref()).await?;
		match api.get_opt(&key.name).await? {
			Some(o) => Ok(Some(to_value(o)?)),
			None => Ok(None),
		}
	}

	async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>, ClusterError> {
		let api = self.api(api_version, kind, namespace).await?;
		let list = api.list(&ListParams::default()).await?;
		list.items.into_iter().map(to_value).collect()
	}

	async fn create(&self, object: &Value) -> Result<Value, ClusterError> {
		let (api, key) = self.api_for(object).await?;
		log::debug!("Creating {}", key);
		to_value(api.create(&PostParams::default(), &to_dynamic(object)?).await?)
	}

	async fn replace(&self, object: &Value) -> Result<Value, ClusterError> {
		let (api, key) = self.api_for(object).await?;
		log::debug!("Replacing {}", key);
		to_value(api.replace(&key.name, &PostParams::default(), &to_dynamic(object)?).await?)
	}

	async fn replace_status(&self, object: &Value) -> Result<Value, ClusterError> {
		let (api, key) = self.api_for(object).await?;
		/* A merge patch carrying the resourceVersion is rejected when the object moved on */
		let patch = serde_json::json!({
			"metadata": { "resourceVersion": object.pointer("/metadata/resourceVersion") },
			"status": object.get("status"),
		});
		to_value(api.patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch)).await?)
	}

	async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
		let api = self.api(&key.api_version, &key.kind, key.namespace.as_deref()).await?;
		log::debug!("Deleting {}", key);
		api.delete(&key.name, &DeleteParams::default()).await?;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn api_error(code: u16, reason: &str) -> kube::Error {
		kube::Error::Api(kube::core::ErrorResponse {
			status: "Failure".into(),
			message: "m".into(),
			reason: reason.into(),
			code,
		})
	}

	#[test] fn not_found_maps() { assert_eq!(ClusterError::from(api_error(404, "NotFound")), ClusterError::NotFound("m".into())) }
	#[test] fn already_exists_maps() { assert_eq!(ClusterError::from(api_error(409, "AlreadyExists")), ClusterError::AlreadyExists("m".into())) }
	#[test] fn conflict_maps() { assert_eq!(ClusterError::from(api_error(409, "Conflict")), ClusterError::Conflict("m".into())) }
	#[test] fn unprocessable_maps() { assert_eq!(ClusterError::from(api_error(422, "Invalid")), ClusterError::Invalid("m".into())) }
	#[test] fn server_error_is_transient() { assert!(ClusterError::from(api_error(500, "InternalError")).is_transient()) }
}
