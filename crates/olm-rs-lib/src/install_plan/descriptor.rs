//! The `ClusterServiceVersion` written for each installed bundle.
//!
//! It records what the bundle owns so that later resolutions can see it as installed.

use serde_json::{json, Map, Value};

use crate::catalog::{ApiKey, Bundle, CatalogKey, InstalledBundle};

pub const API_VERSION: &str = "operators.coreos.com/v1alpha1";
pub const KIND: &str = "ClusterServiceVersion";
pub const PACKAGE_LABEL: &str = "olm-rs.io/package";
pub const CATALOG_ANNOTATION: &str = "olm-rs.io/catalog";

/// Renders the descriptor of `bundle` for `namespace`, starting from the one the bundle ships.
pub fn render(bundle: &Bundle, namespace: &str, catalog: &CatalogKey) -> Value {
	let owned_crds: Vec<Value> = bundle.owned_apis.iter()
		.filter_map(|o| o.crd.as_ref().map(|crd| json!({
			"name": crd.metadata.name.clone().unwrap_or_default(),
			"version": o.version,
			"kind": o.kind,
		})))
		.collect();
	let owned_services: Vec<Value> = bundle.owned_apis.iter()
		.filter(|o| o.crd.is_none())
		.map(|o| json!({ "group": o.group, "version": o.version, "kind": o.kind }))
		.collect();

	let mut root = match bundle.descriptor.clone() {
		Some(Value::Object(o)) => o,
		_ => Map::new(),
	};
	root.insert("apiVersion".into(), json!(API_VERSION));
	root.insert("kind".into(), json!(KIND));

	let mut metadata = take_object(&mut root, "metadata");
	metadata.insert("name".into(), json!(bundle.name));
	metadata.insert("namespace".into(), json!(namespace));
	let mut labels = take_object(&mut metadata, "labels");
	labels.insert(PACKAGE_LABEL.into(), json!(bundle.package));
	metadata.insert("labels".into(), Value::Object(labels));
	let mut annotations = take_object(&mut metadata, "annotations");
	annotations.insert(CATALOG_ANNOTATION.into(), json!(catalog.to_string()));
	metadata.insert("annotations".into(), Value::Object(annotations));
	root.insert("metadata".into(), Value::Object(metadata));

	let mut spec = take_object(&mut root, "spec");
	spec.insert("version".into(), json!(bundle.version.to_string()));
	match &bundle.replaces {
		Some(r) => { spec.insert("replaces".into(), json!(r)); },
		None => { spec.remove("replaces"); },
	}
	if !bundle.skips.is_empty() {
		spec.insert("skips".into(), json!(bundle.skips));
	}
	spec.insert("customresourcedefinitions".into(), json!({ "owned": owned_crds }));
	spec.insert("apiservicedefinitions".into(), json!({ "owned": owned_services }));
	root.insert("spec".into(), Value::Object(spec));

	Value::Object(root)
}

/// Removes `key` from `map`, anything but an object reads as an empty one.
fn take_object(map: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
	match map.remove(key) {
		Some(Value::Object(o)) => o,
		_ => Map::new(),
	}
}

/// Reads back what an installed descriptor records.
pub fn installed_from_descriptor(descriptor: &Value) -> Option<InstalledBundle> {
	let name = descriptor.pointer("/metadata/name")?.as_str()?.to_string();
	let str_at = |p: &str| descriptor.pointer(p).and_then(Value::as_str);

	let mut owned_apis = Vec::<ApiKey>::new();
	for crd in descriptor.pointer("/spec/customresourcedefinitions/owned").and_then(Value::as_array).into_iter().flatten() {
		let crd_name = crd.get("name").and_then(Value::as_str).unwrap_or_default();
		let group = crd_name.split_once('.').map(|(_, g)| g).unwrap_or_default();
		let version = crd.get("version").and_then(Value::as_str).unwrap_or_default();
		let kind = crd.get("kind").and_then(Value::as_str).unwrap_or_default();
		owned_apis.push(ApiKey::new(group, version, kind));
	}
	for api in descriptor.pointer("/spec/apiservicedefinitions/owned").and_then(Value::as_array).into_iter().flatten() {
		let field = |k: &str| api.get(k).and_then(Value::as_str).unwrap_or_default();
		owned_apis.push(ApiKey::new(field("group"), field("version"), field("kind")));
	}

	Some(InstalledBundle {
		name,
		package: descriptor.pointer("/metadata/labels").and_then(|l| l.get(PACKAGE_LABEL)).and_then(Value::as_str).map(str::to_string),
		version: str_at("/spec/version").and_then(|v| semver::Version::parse(v).ok()),
		replaces: str_at("/spec/replaces").map(str::to_string),
		owned_apis,
		catalog: descriptor.pointer("/metadata/annotations")
			.and_then(|a| a.get(CATALOG_ANNOTATION))
			.and_then(Value::as_str)
			.and_then(|c| c.split_once('/'))
			.map(|(ns, name)| CatalogKey::new(name, ns)),
	})
}
