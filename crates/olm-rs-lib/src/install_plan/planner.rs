//! Compiling resolved bundles into an ordered list of steps.
//!
//! Each bundle contributes, in order: its CRDs, service accounts, namespaced RBAC, cluster RBAC,
//! extra objects and finally its descriptor. Bundles are planned in resolution order so
//! dependencies land before the bundles requiring them.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;

use super::descriptor;
use super::step::{PlannedStep, ResourceKey, StepResource};
use crate::api::Step;
use crate::catalog::Bundle;
use crate::resolver::ResolvedBundle;

pub const OWNER_LABEL: &str = "olm-rs.io/owner";

/// Kinds that never get a namespace.
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
	"APIService",
	"ClusterRole",
	"ClusterRoleBinding",
	"CustomResourceDefinition",
	"MutatingWebhookConfiguration",
	"Namespace",
	"PersistentVolume",
	"PriorityClass",
	"StorageClass",
	"ValidatingWebhookConfiguration",
];

/// Namespaces the operator being installed watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallScope {
	#[default]
	OwnNamespace,
	/// Namespaced permissions are granted cluster wide.
	AllNamespaces,
}

impl InstallScope {
	pub fn of(group: &crate::api::OperatorGroupSpec) -> Self {
		if group.all_namespaces() { InstallScope::AllNamespaces } else { InstallScope::OwnNamespace }
	}
}

fn meta(name: &str, namespace: Option<&str>, owner: &str) -> ObjectMeta {
	ObjectMeta {
		name: Some(name.to_string()),
		namespace: namespace.map(str::to_string),
		labels: Some(BTreeMap::from([(OWNER_LABEL.to_string(), owner.to_string())])),
		..Default::default()
	}
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
	RoleRef {
		api_group: "rbac.authorization.k8s.io".into(),
		kind: kind.into(),
		name: name.into(),
	}
}

fn service_account_subject(name: &str, namespace: &str) -> Vec<Subject> {
	vec![Subject {
		kind: "ServiceAccount".into(),
		name: name.into(),
		namespace: Some(namespace.into()),
		..Default::default()
	}]
}

fn cluster_rbac(name: &str, rules: &[PolicyRule], service_account: &str, namespace: &str, owner: &str) -> [StepResource; 2] {
	[
		StepResource::ClusterRole(ClusterRole {
			metadata: meta(name, None, owner),
			rules: Some(rules.to_vec()),
			..Default::default()
		}),
		StepResource::ClusterRoleBinding(ClusterRoleBinding {
			metadata: meta(name, None, owner),
			role_ref: role_ref("ClusterRole", name),
			subjects: Some(service_account_subject(service_account, namespace)),
		}),
	]
}

/// Objects of one bundle in apply order.
fn bundle_resources(bundle: &Bundle, namespace: &str, scope: InstallScope, catalog: &crate::catalog::CatalogKey) -> crate::Result<Vec<StepResource>> {
	let mut crds = Vec::<StepResource>::new();
	let mut accounts = Vec::<StepResource>::new();
	let mut namespaced_rbac = Vec::<StepResource>::new();
	let mut cluster_rbac_steps = Vec::<StepResource>::new();
	let mut extra = Vec::<StepResource>::new();

	for crd in bundle.owned_crds() {
		crds.push(StepResource::CustomResourceDefinition(crd.clone()));
	}

	let add_account = |accounts: &mut Vec<StepResource>, name: &str| {
		let account = StepResource::ServiceAccount(ServiceAccount {
			metadata: meta(name, Some(namespace), &bundle.name),
			..Default::default()
		});
		if !accounts.contains(&account) {
			accounts.push(account);
		}
	};

	for permission in &bundle.permissions {
		let sa = &permission.service_account_name;
		add_account(&mut accounts, sa);
		let name = format!("{}-{}", bundle.name, sa);
		match scope {
			InstallScope::OwnNamespace => {
				namespaced_rbac.push(StepResource::Role(Role {
					metadata: meta(&name, Some(namespace), &bundle.name),
					rules: Some(permission.rules.clone()),
				}));
				namespaced_rbac.push(StepResource::RoleBinding(RoleBinding {
					metadata: meta(&name, Some(namespace), &bundle.name),
					role_ref: role_ref("Role", &name),
					subjects: Some(service_account_subject(sa, namespace)),
				}));
			},
			InstallScope::AllNamespaces => {
				cluster_rbac_steps.extend(cluster_rbac(&name, &permission.rules, sa, namespace, &bundle.name));
			},
		}
	}

	for permission in &bundle.cluster_permissions {
		let sa = &permission.service_account_name;
		add_account(&mut accounts, sa);
		let name = format!("{}-{}-cluster", bundle.name, sa);
		cluster_rbac_steps.extend(cluster_rbac(&name, &permission.rules, sa, namespace, &bundle.name));
	}

	for object in &bundle.extra_objects {
		let mut object = object.clone();
		let kind = object.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
		let named = object.pointer("/metadata/name").and_then(Value::as_str).is_some();
		if kind.is_empty() || !named || object.get("apiVersion").and_then(Value::as_str).is_none() {
			return Err(crate::Error::Validation(format!("bundle {} has an object without apiVersion, kind or name", bundle.name)))
		}
		if !CLUSTER_SCOPED_KINDS.contains(&kind.as_str()) {
			if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
				meta.insert("namespace".into(), Value::String(namespace.to_string()));
			}
		}
		extra.push(StepResource::Object(object));
	}

	let mut resources = crds;
	resources.extend(accounts);
	resources.extend(namespaced_rbac);
	resources.extend(cluster_rbac_steps);
	resources.extend(extra);
	resources.push(StepResource::Descriptor(descriptor::render(bundle, namespace, catalog)));
	Ok(resources)
}

/// Plans the resolved bundles into steps, merged by kind and name with the first bundle keeping a shared object.
pub fn plan_resources(bundles: &[ResolvedBundle], namespace: &str, scope: InstallScope) -> crate::Result<Vec<PlannedStep>> {
	let mut seen = HashSet::<ResourceKey>::new();
	let mut planned = Vec::<PlannedStep>::new();

	for resolved in bundles {
		for resource in bundle_resources(&resolved.bundle, namespace, scope, &resolved.catalog)? {
			let manifest = resource.manifest()?;
			let key = ResourceKey {
				kind: manifest.get("kind").and_then(Value::as_str).unwrap_or_default().to_string(),
				name: manifest.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default().to_string(),
			};
			if !seen.insert(key.clone()) {
				log::debug!("{} from {} is already planned", key, resolved.bundle.name);
				continue
			}
			planned.push(PlannedStep {
				resolving: resolved.bundle.name.clone(),
				catalog: resolved.catalog.clone(),
				resource,
			});
		}
	}
	Ok(planned)
}

/// Plans the resolved bundles into plan steps.
pub fn plan(bundles: &[ResolvedBundle], namespace: &str, scope: InstallScope) -> crate::Result<Vec<Step>> {
	plan_resources(bundles, namespace, scope)?
		.into_iter()
		.map(PlannedStep::into_step)
		.collect()
}
