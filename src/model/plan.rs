//! [`BuildPlan`]: the immutable snapshot of what to build. Constructed once
//! by the front end (YAML/CLI parsing is explicitly out of scope) and owned
//! exclusively by the [`crate::pipeline::Pipeline`] for the duration of one build.

use crate::model::file_entry::LayerSource;
use crate::model::image::Platform;
use crate::model::{CompressionAlgorithm, CredentialRetriever};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Docker,
    Oci,
}

/// Where the assembled image is written (§4.10).
pub enum Target {
    Registry { address: String, repository: String, tags: Vec<String> },
    Tar { path: PathBuf },
    Daemon { docker_path: Option<PathBuf>, tags: Vec<String> },
}

pub struct BuildPlan {
    /// A resolvable reference, or the literal string `"scratch"`.
    pub base_image: String,
    pub platforms: Vec<Platform>,
    pub creation_time: SystemTime,
    pub format: ManifestFormat,
    pub compression: CompressionAlgorithm,
    pub environment: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub volumes: BTreeSet<String>,
    pub exposed_ports: BTreeSet<String>,
    pub user: Option<String>,
    pub working_directory: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub layers: Vec<LayerSource>,
    pub targets: Vec<Target>,
    pub cache_dir: PathBuf,
    pub credential_retrievers: Vec<Box<dyn CredentialRetriever>>,
    /// `registry -> mirror hosts`, tried in order for base-image pulls only.
    pub registry_mirrors: BTreeMap<String, Vec<String>>,
    pub allow_insecure_registries: bool,
    pub send_credentials_over_http: bool,
    /// Whether a [`Layer::Reference`](crate::model::Layer::Reference) on the
    /// same registry host may be published via a cross-repository mount
    /// (§4.7) instead of a full pull-then-push round trip.
    pub cross_repository_blob_mounts: bool,
    /// Keep a locally-materialised copy of every base layer even when the
    /// target registry already has it (skips the "reference, don't pull"
    /// optimisation in §4.8).
    pub always_cache_base_image: bool,
    pub worker_pool_size: usize,
}

impl BuildPlan {
    /// §7 ConfigurationError: a plan that cannot possibly succeed.
    pub fn validate(&self) -> Result<(), crate::error::BuildError> {
        if self.base_image.trim().is_empty() {
            return Err(crate::error::BuildError::configuration("base image reference is empty"));
        }
        if self.platforms.is_empty() {
            return Err(crate::error::BuildError::configuration("platform set is empty"));
        }
        if self.targets.is_empty() {
            return Err(crate::error::BuildError::configuration("no build target configured"));
        }
        if self.format == ManifestFormat::Docker && self.compression != CompressionAlgorithm::Gzip {
            return Err(crate::error::BuildError::configuration(
                "Docker V2.2 format only supports gzip compression; zstd/none require OCI format",
            ));
        }
        Ok(())
    }
}
