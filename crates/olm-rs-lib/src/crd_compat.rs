//! Deciding if a CRD on the cluster may be replaced by a newer definition.
//!
//! An update is compatible when it keeps every served version and doesn't narrow the schema of any version
//! kept by both definitions. Custom resources already stored must also validate against the new schema.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{CustomResourceDefinition, CustomResourceDefinitionVersion};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Incompatibility {
	#[error("served version {0} would be removed")]
	ServedVersionRemoved(String),
	#[error("schema of version {version} narrows at {path}: {detail}")]
	SchemaNarrowed {
		version: String,
		path: String,
		detail: String,
	},
	#[error("stored object {name} is invalid against version {version}: {detail}")]
	StoredObjectInvalid {
		name: String,
		version: String,
		detail: String,
	},
	#[error("schema of version {version} is unusable: {detail}")]
	InvalidSchema {
		version: String,
		detail: String,
	},
}

fn schema_of(version: &CustomResourceDefinitionVersion) -> Option<Value> {
	version.schema.as_ref()
		.and_then(|s| s.open_api_v3_schema.as_ref())
		.and_then(|s| serde_json::to_value(s).ok())
}

/// Checks `proposed` against the definition currently on the cluster.
pub fn check(existing: &CustomResourceDefinition, proposed: &CustomResourceDefinition) -> Result<(), Incompatibility> {
	for old in existing.spec.versions.iter() {
		let new = proposed.spec.versions.iter().find(|v| v.name == old.name);
		let Some(new) = new else {
			if old.served {
				return Err(Incompatibility::ServedVersionRemoved(old.name.clone()))
			}
			continue
		};

		if let (Some(old_schema), Some(new_schema)) = (schema_of(old), schema_of(new)) {
			if let Some((path, detail)) = narrowing(&old_schema, &new_schema, "") {
				return Err(Incompatibility::SchemaNarrowed { version: old.name.clone(), path, detail })
			}
		}
	}
	Ok(())
}

/// Validates stored custom resources against the schema `proposed` gives their version.
pub fn check_stored(proposed: &CustomResourceDefinition, stored: &[Value]) -> Result<(), Incompatibility> {
	for version in proposed.spec.versions.iter() {
		let Some(schema) = schema_of(version) else { continue };
		let instances: Vec<&Value> = stored.iter()
			.filter(|o| {
				o.get("apiVersion").and_then(Value::as_str)
					.and_then(|a| a.rsplit('/').next())
					== Some(version.name.as_str())
			})
			.collect();
		if instances.is_empty() {
			continue
		}

		let schema = to_json_schema(&schema);
		let compiled = jsonschema::JSONSchema::options()
			.with_draft(jsonschema::Draft::Draft4)
			.compile(&schema)
			.map_err(|e| Incompatibility::InvalidSchema { version: version.name.clone(), detail: e.to_string() })?;

		for instance in instances {
			if let Err(errors) = compiled.validate(instance) {
				let detail = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
				let name = instance.pointer("/metadata/name").and_then(Value::as_str).unwrap_or("<unnamed>").to_string();
				return Err(Incompatibility::StoredObjectInvalid { name, version: version.name.clone(), detail })
			}
		}
	}
	Ok(())
}

/// Converts an OpenAPI v3 schema to JSON schema, `nullable` becomes a `null` member of `type`.
fn to_json_schema(schema: &Value) -> Value {
	match schema {
		Value::Object(map) => {
			let mut out = Map::new();
			let nullable = map.get("nullable").and_then(Value::as_bool).unwrap_or(false);
			for (k, v) in map {
				match k.as_str() {
					"nullable" => {},
					"type" if nullable => {
						out.insert(k.clone(), Value::Array(vec![v.clone(), Value::String("null".into())]));
					},
					/* Keys holding a map of schemas, the keys themselves aren't schemas */
					"properties" | "patternProperties" | "definitions" => {
						let converted = v.as_object()
							.map(|m| m.iter().map(|(n, s)| (n.clone(), to_json_schema(s))).collect::<Map<_, _>>())
							.map(Value::Object)
							.unwrap_or_else(|| v.clone());
						out.insert(k.clone(), converted);
					},
					"enum" | "required" | "default" | "example" => {
						out.insert(k.clone(), v.clone());
					},
					_ => {
						out.insert(k.clone(), to_json_schema(v));
					},
				}
			}
			Value::Object(out)
		},
		Value::Array(items) => Value::Array(items.iter().map(to_json_schema).collect()),
		other => other.clone(),
	}
}

fn join(path: &str, segment: &str) -> String {
	if path.is_empty() { segment.to_string() } else { format!("{}.{}", path, segment) }
}

fn number(schema: &Value, key: &str) -> Option<f64> {
	schema.get(key).and_then(Value::as_f64)
}

fn flag(schema: &Value, key: &str) -> bool {
	schema.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Finds the first place `new` accepts less than `old`, as a path and a description.
fn narrowing(old: &Value, new: &Value, path: &str) -> Option<(String, String)> {
	let here = |detail: String| Some((if path.is_empty() { "<root>".to_string() } else { path.to_string() }, detail));

	match (old.get("type"), new.get("type")) {
		(Some(o), Some(n)) if o != n => return here(format!("type changed from {} to {}", o, n)),
		(None, Some(n)) => return here(format!("type {} added", n)),
		(Some(o), None) => log::trace!("{}: type {} dropped", path, o),
		_ => {},
	}

	/* Lower bounds */
	match (number(old, "minimum"), number(new, "minimum")) {
		(None, Some(n)) => return here(format!("minimum {} added", n)),
		(Some(o), Some(n)) if n > o => return here(format!("minimum raised from {} to {}", o, n)),
		(Some(o), Some(n)) if n == o && !flag(old, "exclusiveMinimum") && flag(new, "exclusiveMinimum") => return here(format!("minimum {} made exclusive", n)),
		_ => {},
	}
	match (number(old, "maximum"), number(new, "maximum")) {
		(None, Some(n)) => return here(format!("maximum {} added", n)),
		(Some(o), Some(n)) if n < o => return here(format!("maximum lowered from {} to {}", o, n)),
		(Some(o), Some(n)) if n == o && !flag(old, "exclusiveMaximum") && flag(new, "exclusiveMaximum") => return here(format!("maximum {} made exclusive", n)),
		_ => {},
	}

	for key in ["minLength", "minItems", "minProperties"] {
		let o = old.get(key).and_then(Value::as_u64).unwrap_or(0);
		if let Some(n) = new.get(key).and_then(Value::as_u64) {
			if n > o {
				return here(format!("{} raised from {} to {}", key, o, n))
			}
		}
	}
	for key in ["maxLength", "maxItems", "maxProperties"] {
		match (old.get(key).and_then(Value::as_u64), new.get(key).and_then(Value::as_u64)) {
			(None, Some(n)) => return here(format!("{} {} added", key, n)),
			(Some(o), Some(n)) if n < o => return here(format!("{} lowered from {} to {}", key, o, n)),
			_ => {},
		}
	}

	let required = |s: &Value| -> Vec<String> {
		s.get("required").and_then(Value::as_array)
			.map(|r| r.iter().filter_map(Value::as_str).map(str::to_string).collect())
			.unwrap_or_default()
	};
	let old_required = required(old);
	if let Some(added) = required(new).into_iter().find(|r| !old_required.contains(r)) {
		return here(format!("property {} is now required", added))
	}

	match (old.get("enum").and_then(Value::as_array), new.get("enum").and_then(Value::as_array)) {
		(None, Some(_)) => return here("enum added".to_string()),
		(Some(o), Some(n)) => {
			if let Some(dropped) = o.iter().find(|v| !n.contains(v)) {
				return here(format!("enum value {} removed", dropped))
			}
		},
		_ => {},
	}

	match (old.get("pattern"), new.get("pattern")) {
		(None, Some(n)) => return here(format!("pattern {} added", n)),
		(Some(o), Some(n)) if o != n => return here(format!("pattern changed from {} to {}", o, n)),
		_ => {},
	}

	if flag(old, "nullable") && !flag(new, "nullable") {
		return here("no longer nullable".to_string())
	}

	match (old.get("additionalProperties"), new.get("additionalProperties")) {
		(o, Some(Value::Bool(false))) if o != Some(&Value::Bool(false)) => return here("additional properties forbidden".to_string()),
		(Some(o @ Value::Object(_)), Some(n @ Value::Object(_))) => {
			if let Some(found) = narrowing(o, n, &join(path, "additionalProperties")) {
				return Some(found)
			}
		},
		_ => {},
	}

	if let (Some(o), Some(n)) = (old.get("properties").and_then(Value::as_object), new.get("properties").and_then(Value::as_object)) {
		for (name, old_prop) in o {
			if let Some(new_prop) = n.get(name) {
				if let Some(found) = narrowing(old_prop, new_prop, &join(path, name)) {
					return Some(found)
				}
			}
		}
	}

	if let (Some(o @ Value::Object(_)), Some(n @ Value::Object(_))) = (old.get("items"), new.get("items")) {
		if let Some(found) = narrowing(o, n, &join(path, "items")) {
			return Some(found)
		}
	}

	None
}

#[cfg(test)]
mod test {
	use super::*;
	use serde_json::json;

	fn crd(versions: Value) -> CustomResourceDefinition {
		serde_json::from_value(json!({
			"apiVersion": "apiextensions.k8s.io/v1",
			"kind": "CustomResourceDefinition",
			"metadata": { "name": "widgets.example.com" },
			"spec": {
				"group": "example.com",
				"names": { "kind": "Widget", "plural": "widgets" },
				"scope": "Namespaced",
				"versions": versions,
			}
		})).unwrap()
	}

	fn version(name: &str, schema: Value) -> Value {
		json!({ "name": name, "served": true, "storage": false, "schema": { "openAPIV3Schema": schema } })
	}

	fn spec_schema(spec: Value) -> Value {
		json!({ "type": "object", "properties": { "spec": spec } })
	}

	fn narrows(old: Value, new: Value) -> bool {
		let a = crd(json!([version("v1", spec_schema(old))]));
		let b = crd(json!([version("v1", spec_schema(new))]));
		matches!(check(&a, &b), Err(Incompatibility::SchemaNarrowed { .. }))
	}

	#[test]
	fn adding_a_version_is_compatible() {
		let a = crd(json!([version("v1alpha1", json!({ "type": "object" }))]));
		let b = crd(json!([version("v1alpha1", json!({ "type": "object" })), version("v1alpha2", json!({ "type": "object" }))]));
		assert!(check(&a, &b).is_ok());
	}

	#[test]
	fn removing_a_served_version_is_incompatible() {
		let a = crd(json!([version("v1alpha1", json!({ "type": "object" })), version("v1alpha2", json!({ "type": "object" }))]));
		let b = crd(json!([version("v1alpha1", json!({ "type": "object" })), version("v1", json!({ "type": "object" }))]));
		assert_eq!(check(&a, &b), Err(Incompatibility::ServedVersionRemoved("v1alpha2".into())));
	}

	#[test]
	fn removing_an_unserved_version_is_compatible() {
		let mut unserved = version("v1alpha1", json!({ "type": "object" }));
		unserved["served"] = json!(false);
		let a = crd(json!([unserved, version("v1", json!({ "type": "object" }))]));
		let b = crd(json!([version("v1", json!({ "type": "object" }))]));
		assert!(check(&a, &b).is_ok());
	}

	#[test] fn type_change_narrows() { assert!(narrows(json!({ "type": "string" }), json!({ "type": "integer" }))) }
	#[test] fn raised_minimum_narrows() { assert!(narrows(json!({ "type": "integer", "minimum": 1 }), json!({ "type": "integer", "minimum": 2 }))) }
	#[test] fn lowered_minimum_widens() { assert!(!narrows(json!({ "type": "integer", "minimum": 2 }), json!({ "type": "integer", "minimum": 1 }))) }
	#[test] fn exclusive_minimum_narrows() { assert!(narrows(json!({ "type": "integer", "minimum": 1 }), json!({ "type": "integer", "minimum": 1, "exclusiveMinimum": true }))) }
	#[test] fn added_max_length_narrows() { assert!(narrows(json!({ "type": "string" }), json!({ "type": "string", "maxLength": 5 }))) }
	#[test] fn newly_required_narrows() { assert!(narrows(json!({ "type": "object" }), json!({ "type": "object", "required": ["size"] }))) }
	#[test] fn enum_dropping_value_narrows() { assert!(narrows(json!({ "type": "string", "enum": ["a", "b"] }), json!({ "type": "string", "enum": ["a"] }))) }
	#[test] fn enum_gaining_value_widens() { assert!(!narrows(json!({ "type": "string", "enum": ["a"] }), json!({ "type": "string", "enum": ["a", "b"] }))) }
	#[test] fn new_pattern_narrows() { assert!(narrows(json!({ "type": "string" }), json!({ "type": "string", "pattern": "^a" }))) }
	#[test] fn nullable_removed_narrows() { assert!(narrows(json!({ "type": "string", "nullable": true }), json!({ "type": "string" }))) }
	#[test] fn added_property_widens() {
		assert!(!narrows(
			json!({ "type": "object", "properties": { "a": { "type": "string" } } }),
			json!({ "type": "object", "properties": { "a": { "type": "string" }, "b": { "type": "integer" } } }),
		))
	}
	#[test] fn nested_item_narrowing_found() {
		assert!(narrows(
			json!({ "type": "array", "items": { "type": "object", "properties": { "n": { "type": "integer" } } } }),
			json!({ "type": "array", "items": { "type": "object", "properties": { "n": { "type": "integer", "maximum": 3 } } } }),
		))
	}
	#[test] fn additional_properties_forbidden_narrows() {
		assert!(narrows(json!({ "type": "object" }), json!({ "type": "object", "additionalProperties": false })))
	}

	#[test]
	fn stored_objects_validated() {
		let proposed = crd(json!([version("v1", spec_schema(json!({ "type": "object", "properties": { "size": { "type": "integer", "maximum": 10 } } })))]));
		let ok = json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "small" }, "spec": { "size": 3 } });
		let bad = json!({ "apiVersion": "example.com/v1", "kind": "Widget", "metadata": { "name": "big" }, "spec": { "size": 30 } });
		let other = json!({ "apiVersion": "example.com/v2", "kind": "Widget", "metadata": { "name": "elsewhere" }, "spec": { "size": 30 } });

		assert!(check_stored(&proposed, &[ok.clone(), other]).is_ok());
		let e = check_stored(&proposed, &[ok, bad]).unwrap_err();
		assert!(matches!(e, Incompatibility::StoredObjectInvalid { ref name, .. } if name == "big"));
	}

	#[test]
	fn nullable_becomes_null_type() {
		let converted = to_json_schema(&json!({ "type": "object", "properties": { "a": { "type": "string", "nullable": true } } }));
		assert_eq!(converted["properties"]["a"]["type"], json!(["string", "null"]));
	}
}
