//! Builds and pushes OCI/Docker container images directly from resolved
//! file trees and archives, without a Docker daemon — content-addressed
//! blob caching, registry push/pull with a connectivity failover ladder,
//! deterministic tar archiving, and a DAG pipeline with decentralized
//! progress reporting tie the pieces together under [`build::build`].

pub mod archive;
pub mod assemble;
pub mod auth;
pub mod build;
pub mod cache;
pub mod cli;
pub mod digest;
pub mod error;
pub mod events;
pub mod http;
pub mod logging;
pub mod manifest;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod settings;

pub use build::build;
pub use error::{BuildError, Result};
pub use model::{BuildPlan, Image, Target};
