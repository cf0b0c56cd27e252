//! Schema sniffing (§4.4): before fully parsing a manifest response, decode
//! just enough of it — `schemaVersion` and `mediaType` — to dispatch to the
//! right parser. Grounded on the teacher's `image/manifest_handler.rs`,
//! which switches on `Content-Type` before touching the body; this goes one
//! step further and also trusts the body's own `mediaType` field, since
//! some registries mirror V2.1 manifests behind a generic `Content-Type`.

use super::{
    ImageManifest, ManifestIndex, DOCKER_MANIFEST_LIST_V2, DOCKER_MANIFEST_V1, DOCKER_MANIFEST_V2, OCI_INDEX_V1,
    OCI_MANIFEST_V1,
};
use crate::error::{BuildError, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Sniff {
    #[serde(rename = "schemaVersion")]
    schema_version: Option<u32>,
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
}

/// A manifest response, resolved to one of the shapes this core understands.
pub enum ManifestVariant {
    Single(ImageManifest),
    Index(ManifestIndex),
}

/// Parses a manifest GET response body, using `content_type` (the response's
/// `Content-Type` header, if the registry sent one) as the first signal and
/// the body's own `mediaType`/`schemaVersion` fields as the fallback.
pub fn sniff_manifest(body: &[u8], content_type: Option<&str>) -> Result<ManifestVariant> {
    let sniff: Sniff = serde_json::from_slice(body)?;

    let media_type = content_type
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string())
        .or(sniff.media_type.clone());

    match media_type.as_deref() {
        Some(DOCKER_MANIFEST_LIST_V2) | Some(OCI_INDEX_V1) => {
            Ok(ManifestVariant::Index(serde_json::from_slice(body)?))
        }
        Some(DOCKER_MANIFEST_V2) | Some(OCI_MANIFEST_V1) => {
            Ok(ManifestVariant::Single(serde_json::from_slice(body)?))
        }
        Some(DOCKER_MANIFEST_V1) => Ok(ManifestVariant::Single(super::translate_v21(body)?)),
        _ => match sniff.schema_version {
            Some(1) => Ok(ManifestVariant::Single(super::translate_v21(body)?)),
            Some(2) => {
                // schemaVersion 2 covers both single manifests and indexes;
                // the presence of a `manifests` array is the tiebreaker.
                if body_looks_like_index(body) {
                    Ok(ManifestVariant::Index(serde_json::from_slice(body)?))
                } else {
                    Ok(ManifestVariant::Single(serde_json::from_slice(body)?))
                }
            }
            _ => Err(BuildError::ManifestFormat(format!(
                "unrecognized manifest: content-type={:?}, schemaVersion={:?}, mediaType={:?}",
                content_type, sniff.schema_version, sniff.media_type
            ))),
        },
    }
}

fn body_looks_like_index(body: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .map(|v| v.get("manifests").is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_docker_v22_by_content_type() {
        let body = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"mediaType":"application/vnd.docker.container.image.v1+json","size":1,"digest":"sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"},"layers":[]}"#;
        let variant = sniff_manifest(body, Some(DOCKER_MANIFEST_V2)).unwrap();
        assert!(matches!(variant, ManifestVariant::Single(_)));
    }

    #[test]
    fn sniffs_index_from_body_when_content_type_absent() {
        let body = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
        let variant = sniff_manifest(body, None).unwrap();
        assert!(matches!(variant, ManifestVariant::Index(_)));
    }

    #[test]
    fn unrecognized_shape_is_manifest_format_error() {
        let body = br#"{"foo":"bar"}"#;
        let err = sniff_manifest(body, None).unwrap_err();
        assert!(matches!(err, BuildError::ManifestFormat(_)));
    }
}
