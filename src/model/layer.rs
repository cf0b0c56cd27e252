//! The polymorphic [`Layer`] state (Design Note §9): a tagged variant over
//! the capability set {provides-bytes, provides-digest, provides-diff-id}
//! rather than an inheritance hierarchy. Steps declare which capability they
//! need and the scheduler only runs them once it's satisfied.

use crate::digest::{BlobDescriptor, Digest};
use crate::model::file_entry::LayerSource;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    Zstd,
}

impl CompressionAlgorithm {
    /// Docker layers are always gzip; OCI may additionally use zstd or none.
    pub fn docker_media_type_suffix(self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "tar.gzip",
            CompressionAlgorithm::None | CompressionAlgorithm::Zstd => {
                unreachable!("Docker V2.2 format only supports gzip compression")
            }
        }
    }

    pub fn oci_media_type_suffix(self) -> &'static str {
        match self {
            CompressionAlgorithm::Gzip => "tar+gzip",
            CompressionAlgorithm::Zstd => "tar+zstd",
            CompressionAlgorithm::None => "tar",
        }
    }
}

type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Callbacks that produce a layer's compressed and uncompressed byte streams
/// on demand; used only by the `Unwritten` state, materialised exactly once
/// by whichever step first needs the layer's digest or bytes.
pub struct LayerArchiverCallbacks {
    pub source: LayerSource,
    pub compression: CompressionAlgorithm,
}

/// A layer in one of four states (§3). Every state exposes at least a
/// [`BlobDescriptor`] once materialised; only `Unwritten` is allowed to lack
/// one, and it must be materialised before any registry or tar output step
/// consumes it.
pub enum Layer {
    /// Holds archiver inputs; nothing has been hashed yet.
    Unwritten(LayerArchiverCallbacks),
    /// Pulled-by-reference: descriptor and diff-id known, no local bytes.
    Reference { descriptor: BlobDescriptor, diff_id: Digest },
    /// Descriptor known; diff-id must be derived by decompressing on demand.
    ReferenceNoDiffId { descriptor: BlobDescriptor },
    /// Local bytes at `<cache>/layers/<digest>`.
    Cached { path: PathBuf, descriptor: BlobDescriptor, diff_id: Digest },
}

impl Layer {
    pub fn descriptor(&self) -> Option<&BlobDescriptor> {
        match self {
            Layer::Unwritten(_) => None,
            Layer::Reference { descriptor, .. }
            | Layer::ReferenceNoDiffId { descriptor }
            | Layer::Cached { descriptor, .. } => Some(descriptor),
        }
    }

    pub fn diff_id(&self) -> Option<&Digest> {
        match self {
            Layer::Reference { diff_id, .. } | Layer::Cached { diff_id, .. } => Some(diff_id),
            Layer::Unwritten(_) | Layer::ReferenceNoDiffId { .. } => None,
        }
    }

    pub fn is_materialised(&self) -> bool {
        !matches!(self, Layer::Unwritten(_))
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Unwritten(cb) => f.debug_struct("Unwritten").field("source", &cb.source.name()).finish(),
            Layer::Reference { descriptor, diff_id } => f.debug_struct("Reference").field("descriptor", descriptor).field("diff_id", diff_id).finish(),
            Layer::ReferenceNoDiffId { descriptor } => f.debug_struct("ReferenceNoDiffId").field("descriptor", descriptor).finish(),
            Layer::Cached { path, descriptor, diff_id } => f
                .debug_struct("Cached")
                .field("path", path)
                .field("descriptor", descriptor)
                .field("diff_id", diff_id)
                .finish(),
        }
    }
}

/// An ordered sequence of layers. Adding a layer whose digest is already
/// present is a no-op for registry push purposes (de-dup) but the original
/// order is always preserved — there are no duplicates in the manifest sense.
#[derive(Default)]
pub struct ImageLayers {
    layers: Vec<Layer>,
}

impl ImageLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Layer> {
        self.layers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn into_inner(self) -> Vec<Layer> {
        self.layers
    }

    /// Distinct digests currently present, in first-seen order — the set a
    /// registry push needs to de-dup against.
    pub fn distinct_digests(&self) -> Vec<&Digest> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for l in &self.layers {
            if let Some(d) = l.descriptor() {
                if seen.insert(d.digest.as_str()) {
                    out.push(&d.digest);
                }
            }
        }
        out
    }
}
