//! # Catalogs
//!
//! A catalog publishes packages and the bundles belonging to them.
//! Catalog content is consumed as an immutable [`CatalogSnapshot`] per reconcile pass,
//! obtained from a [`CatalogProvider`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Deserialize};

mod version_range;
pub use version_range::VersionRange;
pub use version_range::VersionBounds;

mod bundle;
pub use bundle::*;

mod package;
pub use package::*;

pub mod iterator;

mod scope;
pub use scope::*;

mod provider;
pub use provider::*;

/// Identifies a catalog by name and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogKey {
	pub name: String,
	pub namespace: String,
}

impl CatalogKey {
	pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
		Self { name: name.into(), namespace: namespace.into() }
	}
}

impl std::fmt::Display for CatalogKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}/{}", self.namespace, self.name)
	}
}

/// Health and priority of a catalog as reported by its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogStatus {
	pub key: CatalogKey,
	pub priority: i32,
	pub healthy: bool,
}

/// Immutable view of a catalog's content.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
	pub key: CatalogKey,
	pub priority: i32,
	pub packages: BTreeMap<String, PackageManifest>,
	pub bundles: BTreeMap<String, Arc<Bundle>>,
}

impl CatalogSnapshot {
	pub fn new(key: CatalogKey, priority: i32) -> Self {
		Self {
			key,
			priority,
			packages: Default::default(),
			bundles: Default::default(),
		}
	}

	/// Builds a snapshot from package manifests and bundles.
	///
	/// Bundles are keyed by name, a later bundle with a duplicate name replaces the earlier one.
	pub fn from_parts(key: CatalogKey, priority: i32, packages: impl IntoIterator<Item = PackageManifest>, bundles: impl IntoIterator<Item = Bundle>) -> Self {
		let mut snapshot = Self::new(key, priority);
		for p in packages {
			snapshot.packages.insert(p.name.clone(), p);
		}
		for b in bundles {
			if snapshot.bundles.contains_key(&b.name) {
				log::warn!("Catalog {} publishes bundle {} more than once, keeping the last", snapshot.key, b.name);
			}
			snapshot.bundles.insert(b.name.clone(), Arc::new(b));
		}
		snapshot
	}

	pub fn package(&self, name: &str) -> Option<&PackageManifest> {
		self.packages.get(name)
	}

	pub fn bundle(&self, name: &str) -> Option<&Arc<Bundle>> {
		self.bundles.get(name)
	}

	pub fn bundles(&self) -> impl Iterator<Item = &Arc<Bundle>> {
		self.bundles.values()
	}

	/// The bundle currently at the head of `channel` in `package`.
	pub fn channel_head(&self, package: &str, channel: &str) -> Option<&Arc<Bundle>> {
		self.package(package)
			.and_then(|p| p.head_of(channel))
			.and_then(|name| self.bundle(name))
	}

	/// Checks if `bundle` is the head of any channel of its package.
	pub fn is_channel_head(&self, bundle: &Bundle) -> bool {
		self.package(&bundle.package)
			.map(|p| p.channels.iter().any(|c| c.current_bundle == bundle.name))
			.unwrap_or(false)
	}

	/// Checks if `bundle` is the head of its package's default channel.
	pub fn is_default_head(&self, bundle: &Bundle) -> bool {
		self.package(&bundle.package)
			.and_then(|p| p.default_head())
			.map(|h| h == bundle.name)
			.unwrap_or(false)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn bundle(name: &str, version: &str) -> Bundle {
		serde_json::from_value(serde_json::json!({
			"name": name,
			"package": "p",
			"channels": ["stable"],
			"version": version,
		})).unwrap()
	}

	fn snapshot() -> CatalogSnapshot {
		CatalogSnapshot::from_parts(
			CatalogKey::new("ops", "olm"),
			0,
			[PackageManifest {
				name: "p".into(),
				channels: vec![Channel { name: "stable".into(), current_bundle: "p-v2".into() }],
				default_channel: Some("stable".into()),
			}],
			[bundle("p-v1", "1.0.0"), bundle("p-v2", "2.0.0")],
		)
	}

	#[test] fn channel_head_found() { assert_eq!(snapshot().channel_head("p", "stable").unwrap().name, "p-v2") }
	#[test] fn channel_head_missing_channel() { assert!(snapshot().channel_head("p", "alpha").is_none()) }
	#[test] fn default_head_detected() {
		let s = snapshot();
		assert!(s.is_default_head(s.bundle("p-v2").unwrap()));
		assert!(!s.is_default_head(s.bundle("p-v1").unwrap()));
	}
	#[test] fn key_displays_namespace_first() { assert_eq!(CatalogKey::new("ops", "olm").to_string(), "olm/ops") }
}
