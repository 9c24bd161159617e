pub mod error;
pub use error::Result;
pub use error::Error;

pub mod config;
pub use config::OlmRsOptions;

pub mod api;
pub mod catalog;
pub mod cluster;
pub mod resolver;
pub mod crd_compat;
pub mod install_plan;
pub mod subscription;
pub mod controller;
