//! Core data model (§3): layers, images, file trees, build plans.

mod file_entry;
mod image;
mod layer;
mod plan;

pub use file_entry::{ArchiveLayerSource, FileEntriesLayer, FileEntry, LayerSource};
pub use image::{Image, Platform};
pub use layer::{CompressionAlgorithm, ImageLayers, Layer};
pub use plan::{BuildPlan, ManifestFormat, Target};

use crate::digest::Digest;

/// Credential carried either as a username/password pair or an opaque
/// identity token (e.g. what a registry's token endpoint issues back).
#[derive(Debug, Clone)]
pub enum Credential {
    UserPassword { username: String, password: String },
    IdentityToken(String),
}

/// An `Authorization` HTTP header value, already formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Basic(String),
    Bearer(String),
}

impl Authorization {
    pub fn header_value(&self) -> String {
        match self {
            Authorization::Basic(v) => format!("Basic {}", v),
            Authorization::Bearer(v) => format!("Bearer {}", v),
        }
    }

    pub fn basic(username: &str, password: &str) -> Self {
        use base64::Engine;
        let raw = format!("{}:{}", username, password);
        Authorization::Basic(base64::engine::general_purpose::STANDARD.encode(raw))
    }
}

/// An ordered source of credentials for a given registry; the first
/// retriever in the chain to return `Some` wins (§4.6). Discovery of *which*
/// retrievers to construct (docker config parsing, system credential
/// helpers) is explicitly out of scope for the core — it receives
/// already-constructed trait objects. `async` because a retriever may shell
/// out to a credential helper process or hit a local agent socket.
#[async_trait::async_trait]
pub trait CredentialRetriever: Send + Sync {
    async fn retrieve(&self) -> Result<Option<Credential>, crate::error::BuildError>;
}

/// A selector is a stable hash of a [`FileEntriesLayer`]'s source description
/// (paths, sizes, mtimes, permissions, ownership, extraction paths) used by
/// the cache to answer "have I already built this layer" without re-tarring.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector(String);

impl Selector {
    pub fn new(hex: String) -> Self {
        Selector(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Either side of a cache lookup result: content-addressed by digest, or
/// keyed by selector pointing at a digest.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    Blob { digest: Digest, path: std::path::PathBuf, diff_id: Option<Digest> },
    SelectorLink { selector: Selector, digest: Digest },
}
