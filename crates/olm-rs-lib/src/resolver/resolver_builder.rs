use std::sync::Arc;

use super::upgrade_graph::{self, Position, UpgradePath};
use super::requirements::{self, ResolvedBundle};
use super::ResolutionError;
use crate::catalog::*;

/// Outcome of a resolve.
#[derive(Debug, Clone)]
pub struct Resolution {
	pub path: UpgradePath,
	/// Bundles to install for the next hop, dependencies first and the hop itself last.
	/// Empty when the subscription is already at the channel head.
	pub bundles: Vec<ResolvedBundle>,
}

impl Resolution {
	/// The bundle the subscription moves to.
	pub fn target(&self) -> Option<&ResolvedBundle> {
		self.bundles.last()
	}

	pub fn head(&self) -> &Arc<Bundle> {
		&self.path.head
	}

	pub fn bundle_names(&self) -> Vec<String> {
		self.bundles.iter().map(|r| r.bundle.name.clone()).collect()
	}
}

pub struct ResolverBuilder<'s> {
	scope: &'s ResolutionScope,
	package: String,
	channel: String,
	catalog: Option<CatalogKey>,
	starting_bundle: Option<String>,
	current: Option<(String, Option<semver::Version>)>,
}

impl<'s> ResolverBuilder<'s> {
	pub fn new(scope: &'s ResolutionScope) -> Self {
		Self {
			scope,
			package: Default::default(),
			channel: Default::default(),
			catalog: None,
			starting_bundle: None,
			current: None,
		}
	}

	pub fn package(mut self, package: impl Into<String>, channel: impl Into<String>) -> Self {
		self.package = package.into();
		self.channel = channel.into();
		self
	}

	/// Catalog named by the subscription, preferred when breaking ties.
	pub fn catalog(mut self, catalog: CatalogKey) -> Self {
		self.catalog = Some(catalog);
		self
	}

	pub fn starting_bundle(mut self, starting_bundle: Option<String>) -> Self {
		self.starting_bundle = starting_bundle;
		self
	}

	/// Bundle to upgrade from, with its version when known.
	pub fn current(mut self, name: impl Into<String>, version: Option<semver::Version>) -> Self {
		self.current = Some((name.into(), version));
		self
	}

	pub fn resolve(self) -> Result<Resolution, ResolutionError> {
		let preferred = self.catalog.clone().unwrap_or_else(|| CatalogKey::new("", &self.scope.namespace));
		let (snapshot, head) = upgrade_graph::select_head(self.scope, &self.package, &self.channel, &preferred)?;
		log::debug!("Head of {}/{} is {} from {}", self.package, self.channel, head, snapshot.key);

		/* Version of the current bundle may only be known from the catalog */
		let current_version = self.current.as_ref().and_then(|(name, version)| {
			version.clone().or_else(|| snapshot.bundle(name).map(|b| b.version.clone()))
		});
		let current = self.current.as_ref().map(|(name, _)| Position { name, version: current_version.as_ref() });

		let path = upgrade_graph::walk_channel(snapshot, &self.package, &self.channel, current, self.starting_bundle.as_deref())?;
		let Some(next) = path.next_hop().cloned() else {
			log::debug!("{} is at the head of {}/{}", head, self.package, self.channel);
			return Ok(Resolution { path, bundles: vec![] })
		};

		let bundles = requirements::resolve_requirements(self.scope, &preferred, ResolvedBundle { bundle: next, catalog: snapshot.key.clone() })?;
		Ok(Resolution { path, bundles })
	}
}
