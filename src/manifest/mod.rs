//! Manifest & Configuration Model (C4): Docker V2.2, OCI manifest, OCI index,
//! and the container configuration JSON. Grounded on the teacher's
//! `image/manifest.rs` (too minimal — a single Docker-only shape) and
//! `image/manifest_handler.rs`'s platform-selection idiom, expanded to the
//! full variant set SPEC_FULL.md §4.4 calls for.

mod config;
mod sniff;
mod v21;

pub use config::ContainerConfig;
pub use sniff::{sniff_manifest, ManifestVariant};
pub use v21::translate_v21;

use crate::digest::{BlobDescriptor, Digest};
use crate::model::image::Platform;
use serde::{Deserialize, Serialize};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX_V1: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// `Accept` header value sent on every manifest GET (§4.4).
pub fn manifest_accept_header() -> String {
    [DOCKER_MANIFEST_V2, OCI_MANIFEST_V1, DOCKER_MANIFEST_LIST_V2, OCI_INDEX_V1, DOCKER_MANIFEST_V1].join(", ")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestLayerDescriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
}

impl From<&ManifestLayerDescriptor> for BlobDescriptor {
    fn from(d: &ManifestLayerDescriptor) -> Self {
        BlobDescriptor { size: d.size, digest: d.digest.clone(), media_type: Some(d.media_type.clone()) }
    }
}

/// A Docker V2.2 or OCI single-platform manifest — the two share an
/// identical JSON shape modulo media types, so one struct serves both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: ManifestLayerDescriptor,
    pub layers: Vec<ManifestLayerDescriptor>,
}

impl ImageManifest {
    pub fn new(format: crate::model::ManifestFormat, config: ManifestLayerDescriptor, layers: Vec<ManifestLayerDescriptor>) -> Self {
        let media_type = match format {
            crate::model::ManifestFormat::Docker => DOCKER_MANIFEST_V2,
            crate::model::ManifestFormat::Oci => OCI_MANIFEST_V1,
        };
        Self { schema_version: 2, media_type: media_type.to_string(), config, layers }
    }

    /// §4.4 invariant: `len(manifest.layers) == len(config.rootfs.diff_ids)`.
    pub fn layer_count_matches(&self, config: &ContainerConfig) -> bool {
        self.layers.len() == config.rootfs.diff_ids.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformManifestRef {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: Digest,
    pub platform: Option<ManifestPlatform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPlatform {
    pub architecture: String,
    pub os: String,
}

impl From<&ManifestPlatform> for Platform {
    fn from(p: &ManifestPlatform) -> Self {
        Platform { architecture: p.architecture.clone(), os: p.os.clone() }
    }
}

/// OCI image index / Docker manifest list: a manifest-of-manifests, one per
/// platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub manifests: Vec<PlatformManifestRef>,
}

impl ManifestIndex {
    /// Multi-platform selection: prefer an exact match, falling back to the
    /// first entry when none matches (grounded on the teacher's
    /// `handle_index_manifest`, which defaults to "first linux/amd64, else
    /// first").
    pub fn select(&self, wanted: &Platform) -> Option<&PlatformManifestRef> {
        self.manifests
            .iter()
            .find(|m| m.platform.as_ref().map(|p| p.os == wanted.os && p.architecture == wanted.architecture).unwrap_or(false))
            .or_else(|| self.manifests.first())
    }
}
