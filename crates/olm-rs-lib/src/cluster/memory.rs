use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::*;

#[derive(Debug, Default)]
struct MemoryState {
	objects: BTreeMap<ObjectKey, Value>,
	next_version: u64,
	mutations: usize,
	/// `(kind, name, message)` of writes the "API server" refuses.
	rejections: Vec<(String, String, String)>,
	failing_calls: usize,
	/// `(apiVersion, kind)` pairs discovery doesn't know.
	unknown: Vec<(String, String)>,
}

impl MemoryState {
	fn bump(&mut self, object: &mut Value) {
		self.next_version += 1;
		if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
			meta.insert("resourceVersion".into(), Value::String(self.next_version.to_string()));
		}
	}

	fn check_failure(&mut self, what: &str) -> Result<(), ClusterError> {
		if self.failing_calls > 0 {
			self.failing_calls -= 1;
			return Err(ClusterError::Transient(format!("injected failure during {}", what)))
		}
		Ok(())
	}

	fn check_rejection(&self, key: &ObjectKey) -> Result<(), ClusterError> {
		match self.rejections.iter().find(|(kind, name, _)| kind == &key.kind && name == &key.name) {
			Some((_, _, message)) => Err(ClusterError::Invalid(message.clone())),
			None => Ok(()),
		}
	}

	fn check_known(&self, api_version: &str, kind: &str) -> Result<(), ClusterError> {
		if self.unknown.iter().any(|(a, k)| a == api_version && k == kind) {
			return Err(ClusterError::Invalid(format!("unknown kind {} {}", api_version, kind)))
		}
		Ok(())
	}

	fn check_version(&self, key: &ObjectKey, stored: &Value, object: &Value) -> Result<(), ClusterError> {
		let wanted = object.pointer("/metadata/resourceVersion").and_then(Value::as_str);
		let current = stored.pointer("/metadata/resourceVersion").and_then(Value::as_str);
		match wanted {
			Some(w) if Some(w) != current => Err(ClusterError::Conflict(key.to_string())),
			_ => Ok(()),
		}
	}
}

/// An in process cluster.
///
/// Every object is stored as given, there is no admission or defaulting.
/// Mutating calls are counted, transient failures and rejections can be injected.
#[derive(Debug, Default)]
pub struct MemoryCluster {
	state: Mutex<MemoryState>,
}

impl MemoryCluster {
	fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Stores an object without counting a mutation.
	pub fn insert(&self, mut object: Value) -> Option<ObjectKey> {
		let key = ObjectKey::from_manifest(&object)?;
		let mut state = self.lock();
		state.bump(&mut object);
		state.objects.insert(key.clone(), object);
		Some(key)
	}

	pub fn object(&self, key: &ObjectKey) -> Option<Value> {
		self.lock().objects.get(key).cloned()
	}

	/// Every stored object of `kind`.
	pub fn objects_of(&self, kind: &str) -> Vec<Value> {
		self.lock().objects.iter()
			.filter(|(k, _)| k.kind == kind)
			.map(|(_, v)| v.clone())
			.collect()
	}

	pub fn mutation_count(&self) -> usize {
		self.lock().mutations
	}

	pub fn reset_mutation_count(&self) {
		self.lock().mutations = 0;
	}

	/// Writes of `kind`/`name` fail as invalid with `message`.
	pub fn reject(&self, kind: &str, name: &str, message: &str) {
		self.lock().rejections.push((kind.to_string(), name.to_string(), message.to_string()));
	}

	/// Calls for `api_version` `kind` fail the way they do for a version nothing serves.
	pub fn forget_kind(&self, api_version: &str, kind: &str) {
		self.lock().unknown.push((api_version.to_string(), kind.to_string()));
	}

	/// The next `calls` calls of any type fail as transient.
	pub fn fail_next(&self, calls: usize) {
		self.lock().failing_calls = calls;
	}
}

#[async_trait]
impl ClusterClient for MemoryCluster {
	async fn get(&self, key: &ObjectKey) -> Result<Option<Value>, ClusterError> {
		let mut state = self.lock();
		state.check_failure("get")?;
		state.check_known(&key.api_version, &key.kind)?;
		Ok(state.objects.get(key).cloned())
	}

	async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Vec<Value>, ClusterError> {
		let mut state = self.lock();
		state.check_failure("list")?;
		state.check_known(api_version, kind)?;
		Ok(state.objects.iter()
			.filter(|(k, _)| k.api_version == api_version && k.kind == kind)
			.filter(|(k, _)| namespace.is_none() || k.namespace.as_deref() == namespace)
			.map(|(_, v)| v.clone())
			.collect())
	}

	async fn create(&self, object: &Value) -> Result<Value, ClusterError> {
		let key = ObjectKey::from_manifest(object).ok_or_else(|| ClusterError::Invalid("object has no apiVersion, kind or name".into()))?;
		let mut state = self.lock();
		state.check_failure("create")?;
		state.check_rejection(&key)?;
		if state.objects.contains_key(&key) {
			return Err(ClusterError::AlreadyExists(key.to_string()))
		}

		let mut stored = object.clone();
		if stored.get("metadata").map(Value::is_object) != Some(true) {
			return Err(ClusterError::Invalid(format!("{} has no metadata", key)))
		}
		state.bump(&mut stored);
		let version = state.next_version;
		if let Some(meta) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
			meta.insert("uid".into(), Value::String(format!("uid-{}", version)));
			meta.insert("creationTimestamp".into(), Value::String(chrono::Utc::now().to_rfc3339()));
		}
		state.mutations += 1;
		state.objects.insert(key, stored.clone());
		Ok(stored)
	}

	async fn replace(&self, object: &Value) -> Result<Value, ClusterError> {
		let key = ObjectKey::from_manifest(object).ok_or_else(|| ClusterError::Invalid("object has no apiVersion, kind or name".into()))?;
		let mut state = self.lock();
		state.check_failure("replace")?;
		state.check_rejection(&key)?;
		let stored = state.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
		state.check_version(&key, &stored, object)?;

		let mut replaced = object.clone();
		if let Some(map) = replaced.as_object_mut() {
			match stored.get("status") {
				Some(status) => { map.insert("status".into(), status.clone()); },
				None => { map.remove("status"); },
			}
		}
		for field in ["uid", "creationTimestamp"] {
			if let Some(v) = stored.pointer(&format!("/metadata/{}", field)).cloned() {
				if let Some(meta) = replaced.get_mut("metadata").and_then(Value::as_object_mut) {
					meta.insert(field.into(), v);
				}
			}
		}
		state.bump(&mut replaced);
		state.mutations += 1;
		state.objects.insert(key, replaced.clone());
		Ok(replaced)
	}

	async fn replace_status(&self, object: &Value) -> Result<Value, ClusterError> {
		let key = ObjectKey::from_manifest(object).ok_or_else(|| ClusterError::Invalid("object has no apiVersion, kind or name".into()))?;
		let mut state = self.lock();
		state.check_failure("replace_status")?;
		let mut stored = state.objects.get(&key).cloned().ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
		state.check_version(&key, &stored, object)?;

		if let Some(map) = stored.as_object_mut() {
			match object.get("status") {
				Some(status) => { map.insert("status".into(), status.clone()); },
				None => { map.remove("status"); },
			}
		}
		state.bump(&mut stored);
		state.mutations += 1;
		state.objects.insert(key, stored.clone());
		Ok(stored)
	}

	async fn delete(&self, key: &ObjectKey) -> Result<(), ClusterError> {
		let mut state = self.lock();
		state.check_failure("delete")?;
		if state.objects.remove(key).is_none() {
			return Err(ClusterError::NotFound(key.to_string()))
		}
		state.mutations += 1;
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use serde_json::json;

	fn config_map(name: &str) -> Value {
		json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": "ns" }, "data": { "a": "1" } })
	}

	#[tokio::test]
	async fn stale_replace_conflicts() {
		let cluster = MemoryCluster::default();
		let created = cluster.create(&config_map("c")).await.unwrap();
		let mut first = created.clone();
		first["data"]["a"] = json!("2");
		cluster.replace(&first).await.unwrap();

		let mut stale = created;
		stale["data"]["a"] = json!("3");
		assert!(matches!(cluster.replace(&stale).await, Err(ClusterError::Conflict(_))));
		assert_eq!(cluster.mutation_count(), 2);
	}

	#[tokio::test]
	async fn replace_keeps_status_and_status_write_keeps_spec() {
		let cluster = MemoryCluster::default();
		let mut object = config_map("c");
		object["status"] = json!({ "phase": "Old" });
		let created = cluster.create(&object).await.unwrap();

		let mut with_status = created.clone();
		with_status["status"] = json!({ "phase": "New" });
		with_status["data"]["a"] = json!("ignored");
		let written = cluster.replace_status(&with_status).await.unwrap();
		assert_eq!(written["status"]["phase"], "New");
		assert_eq!(written["data"]["a"], "1");

		let mut spec_change = written.clone();
		spec_change["status"] = json!({ "phase": "ignored" });
		spec_change["data"]["a"] = json!("2");
		let replaced = cluster.replace(&spec_change).await.unwrap();
		assert_eq!(replaced["status"]["phase"], "New");
		assert_eq!(replaced["data"]["a"], "2");
	}

	#[tokio::test]
	async fn injected_failures_are_transient() {
		let cluster = MemoryCluster::default();
		cluster.fail_next(1);
		assert!(cluster.create(&config_map("c")).await.unwrap_err().is_transient());
		assert!(cluster.create(&config_map("c")).await.is_ok());
		assert!(matches!(cluster.create(&config_map("c")).await, Err(ClusterError::AlreadyExists(_))));
	}

	#[tokio::test]
	async fn list_filters_namespace() {
		let cluster = MemoryCluster::default();
		cluster.insert(config_map("a"));
		let mut other = config_map("b");
		other["metadata"]["namespace"] = json!("elsewhere");
		cluster.insert(other);
		assert_eq!(cluster.list("v1", "ConfigMap", Some("ns")).await.unwrap().len(), 1);
		assert_eq!(cluster.list("v1", "ConfigMap", None).await.unwrap().len(), 2);
		assert_eq!(cluster.mutation_count(), 0);
	}
}
