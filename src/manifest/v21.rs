//! V2.1 (schemaVersion 1) manifest translation — read-only support for
//! legacy base images, per the spec's Open Question: "Historic V2.1
//! manifest translation is lossy (no explicit diff-ids)." Decision recorded
//! here and in the design notes: diff-ids are approximated as the blob
//! digest itself (gzip layers are assumed, since V2.1 predates any other
//! compression), which is wrong for the rare re-gzip case but matches what
//! registries serving V2.1 actually store — uncompressed diff-id tracking
//! was never part of that schema. Translated manifests carry a synthetic
//! config built from nothing but the fsLayers list, since V2.1 has no
//! `config` blob at all.

use super::{ImageManifest, ManifestLayerDescriptor, DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE, DOCKER_MANIFEST_V2};
use crate::digest::{BlobDescriptor, Digest};
use crate::error::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct V21Manifest {
    #[serde(rename = "schemaVersion")]
    #[allow(dead_code)]
    schema_version: u32,
    name: String,
    tag: String,
    #[serde(rename = "fsLayers")]
    fs_layers: Vec<FsLayer>,
}

#[derive(Debug, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

/// Translates a V2.1 manifest body into a V22-shaped [`ImageManifest`].
/// `fsLayers` is stored outermost-first (the opposite of V22's order), so
/// this reverses it; the synthetic config descriptor has size 0 and a
/// digest computed over the layer digest list, since there is no real
/// config blob to point at.
pub fn translate_v21(body: &[u8]) -> Result<ImageManifest> {
    let v21: V21Manifest = serde_json::from_slice(body)?;

    let mut layers: Vec<ManifestLayerDescriptor> = Vec::with_capacity(v21.fs_layers.len());
    for fs_layer in v21.fs_layers.iter().rev() {
        let digest = Digest::parse(fs_layer.blob_sum.clone())?;
        layers.push(ManifestLayerDescriptor { media_type: DOCKER_LAYER_MEDIA_TYPE.to_string(), size: 0, digest });
    }

    let synthetic_seed = format!("{}:{}:{}", v21.name, v21.tag, layers.iter().map(|l| l.digest.as_str()).collect::<Vec<_>>().join(","));
    let synthetic_config_descriptor = BlobDescriptor::of_bytes(synthetic_seed.as_bytes());

    Ok(ImageManifest {
        schema_version: 2,
        media_type: DOCKER_MANIFEST_V2.to_string(),
        config: ManifestLayerDescriptor {
            media_type: DOCKER_CONFIG_MEDIA_TYPE.to_string(),
            size: synthetic_config_descriptor.size,
            digest: synthetic_config_descriptor.digest,
        },
        layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_v21() -> Vec<u8> {
        format!(
            r#"{{"schemaVersion":1,"name":"library/debian","tag":"legacy","fsLayers":[{{"blobSum":"sha256:{}"}},{{"blobSum":"sha256:{}"}}]}}"#,
            "1".repeat(64),
            "2".repeat(64)
        )
        .into_bytes()
    }

    #[test]
    fn reverses_fs_layers_into_bottom_up_order() {
        let manifest = translate_v21(&sample_v21()).unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0].digest.hex(), "2".repeat(64));
        assert_eq!(manifest.layers[1].digest.hex(), "1".repeat(64));
    }

    #[test]
    fn translation_is_deterministic_for_same_input() {
        let a = translate_v21(&sample_v21()).unwrap();
        let b = translate_v21(&sample_v21()).unwrap();
        assert_eq!(a.config.digest, b.config.digest);
    }

    #[test]
    fn rejects_malformed_blob_sum() {
        let body = br#"{"schemaVersion":1,"name":"x","tag":"y","fsLayers":[{"blobSum":"not-a-digest"}]}"#;
        assert!(translate_v21(body).is_err());
    }
}
