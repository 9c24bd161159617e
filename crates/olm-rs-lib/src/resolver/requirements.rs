//! Pulling in the bundles that provide the APIs a bundle requires.

use std::sync::Arc;

use crate::catalog::*;
use crate::catalog::iterator::OwningExt;
use super::ResolutionError;

/// A bundle chosen for installation and the catalog it comes from.
#[derive(Debug, Clone)]
pub struct ResolvedBundle {
	pub bundle: Arc<Bundle>,
	pub catalog: CatalogKey,
}

/// Checks if installing `by` retires the installed bundle.
///
/// An installed bundle of the same package at an older version is being upgraded by `by`.
pub fn supersedes_installed(by: &Bundle, installed: &InstalledBundle) -> bool {
	if by.name == installed.name || by.supersedes(&installed.name, installed.version.as_ref()) {
		return true
	}
	match (&installed.package, &installed.version) {
		(Some(p), Some(v)) => p == &by.package && v <= &by.version,
		(Some(p), None) => p == &by.package,
		_ => false,
	}
}

fn supersedes_either(a: &Bundle, b: &Bundle) -> bool {
	a.supersedes(&b.name, Some(&b.version)) || b.supersedes(&a.name, Some(&a.version))
}

struct RequirementResolver<'s> {
	scope: &'s ResolutionScope,
	preferred: &'s CatalogKey,
	/// Post order, dependencies before dependents.
	selected: Vec<ResolvedBundle>,
	in_progress: Vec<Arc<Bundle>>,
}

impl<'s> RequirementResolver<'s> {
	fn chosen(&self) -> impl Iterator<Item = &Arc<Bundle>> {
		self.selected.iter().map(|r| &r.bundle).chain(self.in_progress.iter())
	}

	fn is_chosen(&self, name: &str) -> bool {
		self.chosen().any(|b| b.name == name)
	}

	fn installed_provider(&self, api: &ApiKey) -> Option<&'s InstalledBundle> {
		self.scope.installed_owners(api)
			.find(|i| !self.chosen().any(|b| supersedes_installed(b, i)))
	}

	/// Catalogs in search order, priority first then the subscription's catalog then key.
	fn search_order(&self) -> Vec<&'s Arc<CatalogSnapshot>> {
		let mut catalogs: Vec<&Arc<CatalogSnapshot>> = self.scope.catalogs.iter().collect();
		catalogs.sort_by(|a, b| {
			b.priority.cmp(&a.priority)
				.then_with(|| (&b.key == self.preferred).cmp(&(&a.key == self.preferred)))
				.then_with(|| a.key.cmp(&b.key))
		});
		catalogs
	}

	/// Best provider of `api` in the first catalog that has one.
	fn find_provider(&self, api: &ApiKey) -> Option<ResolvedBundle> {
		for catalog in self.search_order() {
			let rank = |b: &Bundle| {
				if catalog.is_default_head(b) { 0 } else if catalog.is_channel_head(b) { 1 } else { 2 }
			};
			let best = catalog.bundles()
				.owning(api)
				.min_by(|a, b| {
					let (a, b): (&Bundle, &Bundle) = (a, b);
					rank(a).cmp(&rank(b))
						.then_with(|| b.version.cmp(&a.version))
						.then_with(|| a.name.cmp(&b.name))
				});
			if let Some(b) = best {
				return Some(ResolvedBundle { bundle: b.clone(), catalog: catalog.key.clone() })
			}
		}
		None
	}

	fn resolve(&mut self, resolved: ResolvedBundle) -> Result<(), ResolutionError> {
		self.in_progress.push(resolved.bundle.clone());

		for api in &resolved.bundle.required_apis {
			if self.chosen().any(|b| b.owns(api)) {
				continue
			}
			if let Some(i) = self.installed_provider(api) {
				log::debug!("{} required by {} is provided by installed bundle {}", api, resolved.bundle.name, i.name);
				continue
			}
			let provider = self.find_provider(api)
				.ok_or_else(|| ResolutionError::ConstraintsNotSatisfiable(format!("no bundle in scope provides {} required by {}", api, resolved.bundle.name)))?;
			if self.is_chosen(&provider.bundle.name) {
				continue
			}
			log::debug!("{} required by {} is provided by {} from {}", api, resolved.bundle.name, provider.bundle.name, provider.catalog);
			self.resolve(provider)?;
		}

		self.in_progress.retain(|b| b.name != resolved.bundle.name);
		self.selected.push(resolved);
		Ok(())
	}

	/// No API may be owned twice among the selection and the installed bundles it doesn't supersede.
	fn check_ownership(&self) -> Result<(), ResolutionError> {
		for (i, a) in self.selected.iter().enumerate() {
			for b in self.selected.iter().skip(i + 1) {
				if supersedes_either(&a.bundle, &b.bundle) {
					continue
				}
				if let Some(api) = a.bundle.owned_api_keys().find(|k| b.bundle.owns(k)) {
					return Err(ResolutionError::ConstraintConflict { api, first: a.bundle.name.clone(), second: b.bundle.name.clone() })
				}
			}

			for installed in &self.scope.installed {
				if self.selected.iter().any(|s| supersedes_installed(&s.bundle, installed)) {
					continue
				}
				if let Some(api) = a.bundle.owned_api_keys().find(|k| installed.owns(k)) {
					return Err(ResolutionError::ConstraintConflict { api, first: installed.name.clone(), second: a.bundle.name.clone() })
				}
			}
		}
		Ok(())
	}
}

/// Resolves the requirements of `target` depth first.
///
/// Returns the target and every bundle it pulls in, dependencies before dependents with the target last.
pub fn resolve_requirements(scope: &ResolutionScope, preferred: &CatalogKey, target: ResolvedBundle) -> Result<Vec<ResolvedBundle>, ResolutionError> {
	let mut resolver = RequirementResolver {
		scope,
		preferred,
		selected: Default::default(),
		in_progress: Default::default(),
	};
	resolver.resolve(target)?;
	resolver.check_ownership()?;
	Ok(resolver.selected)
}
