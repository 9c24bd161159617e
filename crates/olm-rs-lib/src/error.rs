//! Library error type.

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("cluster error: {0}")]
	Cluster(#[from] crate::cluster::ClusterError),
	#[error("resolution failed: {0}")]
	Resolution(#[from] crate::resolver::ResolutionError),
	#[error("IO error: {0}")]
	IO(#[from] std::io::Error),
	#[error("JSON error: {0}")]
	SerdeJSON(#[from] serde_json::Error),
	#[error("parsing error: {0}")]
	Parse(String),
	#[error("validation error: {0}")]
	Validation(String),
	#[error("not found: {0}")]
	NotFound(String),
}

impl Error {
	/// Errors caused by the infrastructure rather than the content being reconciled.
	///
	/// These are retried without limit and never move a plan to `Failed`.
	pub fn is_transient(&self) -> bool {
		match self {
			Error::Cluster(e) => e.is_transient(),
			Error::IO(_) => true,
			_ => false,
		}
	}

	/// Stable reason string for status conditions.
	pub fn reason(&self) -> &'static str {
		match self {
			Error::Resolution(e) => e.reason(),
			Error::Cluster(_) | Error::IO(_) => "ClusterError",
			Error::SerdeJSON(_) | Error::Parse(_) => "InvalidContent",
			Error::Validation(_) => "ValidationFailed",
			Error::NotFound(_) => "NotFound",
		}
	}
}
