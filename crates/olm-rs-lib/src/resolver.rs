//! Working out which bundles need to be installed for a subscription.
//!
//! # Usage
//! 1. Create a [`ResolverBuilder`] over a [`ResolutionScope`](crate::catalog::ResolutionScope).
//! 1. Give it the package, channel and catalog the subscription asks for,
//! plus the current bundle when something is already installed.
//! 1. [`ResolverBuilder::resolve()`] walks the upgrade graph to the next hop
//! and pulls in the bundles providing the APIs it requires.
//! 1. Hand the [`Resolution`] to the [planner](crate::install_plan::planner).

use crate::catalog::*;

pub mod upgrade_graph;
pub use upgrade_graph::UpgradePath;

pub mod requirements;
pub use requirements::ResolvedBundle;

mod resolver_builder;
pub use resolver_builder::ResolverBuilder;
pub use resolver_builder::Resolution;

/// Resolution failures, these are not retried until the catalogs or the subscription change.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
	#[error("constraints not satisfiable: {0}")]
	ConstraintsNotSatisfiable(String),
	/// More than one catalog publishes a head for the channel and none of them is the subscription's.
	#[error("package {package} channel {channel} has a head in several catalogs: {}", catalogs.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(", "))]
	AmbiguousHead {
		package: String,
		channel: String,
		catalogs: Vec<CatalogKey>,
	},
	#[error("{first} and {second} both provide {api}")]
	ConstraintConflict {
		api: ApiKey,
		first: String,
		second: String,
	},
}

impl ResolutionError {
	/// Stable reason string for status conditions.
	pub fn reason(&self) -> &'static str {
		match self {
			ResolutionError::ConstraintConflict { .. } => "ConstraintConflict",
			ResolutionError::ConstraintsNotSatisfiable(_) | ResolutionError::AmbiguousHead { .. } => "ConstraintsNotSatisfiable",
		}
	}
}
