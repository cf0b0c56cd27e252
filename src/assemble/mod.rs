//! Image Assembler & Targets (C10): turns a fully materialised [`Image`]
//! into a container config, a manifest, and bytes written to one of the
//! three target kinds (§4.10) — registry push, a tarball (Docker-save or
//! OCI-layout shape), or a local Docker daemon via `docker load`. Grounded
//! on the teacher's `registry/tar_utils.rs` (tar writing idiom) and
//! `image/manifest_handler.rs` (assembling a manifest from resolved parts),
//! generalized to cover the two on-disk tar layouts and the daemon path the
//! teacher never had to support (it only ever pushed to a registry).

use crate::cache::BlobCache;
use crate::digest::{BlobDescriptor, Digest};
use crate::error::{BuildError, Result};
use crate::manifest::{
    ContainerConfig, ImageManifest, ManifestLayerDescriptor, DOCKER_CONFIG_MEDIA_TYPE, DOCKER_LAYER_MEDIA_TYPE, OCI_CONFIG_MEDIA_TYPE,
    OCI_INDEX_V1, OCI_MANIFEST_V1,
};
use crate::model::{CompressionAlgorithm, Image, ManifestFormat};
use crate::registry::RegistryClient;
use std::io::Write;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub struct AssembledImage {
    pub config_json: Vec<u8>,
    pub config_descriptor: BlobDescriptor,
    pub manifest: ImageManifest,
    pub manifest_json: Vec<u8>,
}

fn layer_media_type(format: ManifestFormat, compression: CompressionAlgorithm) -> String {
    match format {
        ManifestFormat::Docker => format!("application/vnd.docker.image.rootfs.diff.{}", compression.docker_media_type_suffix()),
        ManifestFormat::Oci => format!("application/vnd.oci.image.layer.v1.{}", compression.oci_media_type_suffix()),
    }
}

fn config_media_type(format: ManifestFormat) -> &'static str {
    match format {
        ManifestFormat::Docker => DOCKER_CONFIG_MEDIA_TYPE,
        ManifestFormat::Oci => OCI_CONFIG_MEDIA_TYPE,
    }
}

/// Builds the container config JSON and manifest from every layer's
/// descriptor and diff-id. Every layer must already be materialised —
/// calling this before the pipeline finishes archiving/pulling layers is a
/// configuration error, not something to recover from here.
pub fn assemble(image: &Image, format: ManifestFormat, compression: CompressionAlgorithm) -> Result<AssembledImage> {
    let mut diff_ids: Vec<Digest> = Vec::with_capacity(image.layers.len());
    let mut layer_descriptors: Vec<ManifestLayerDescriptor> = Vec::with_capacity(image.layers.len());
    let media_type = layer_media_type(format, compression);

    for layer in image.layers.iter() {
        let diff_id = layer
            .diff_id()
            .ok_or_else(|| BuildError::Configuration("layer has no diff-id at assembly time".to_string()))?
            .clone();
        let descriptor = layer
            .descriptor()
            .ok_or_else(|| BuildError::Configuration("layer has no descriptor at assembly time".to_string()))?
            .clone();
        diff_ids.push(diff_id);
        layer_descriptors.push(ManifestLayerDescriptor { media_type: media_type.clone(), size: descriptor.size, digest: descriptor.digest });
    }

    let config = ContainerConfig::from_image(image, diff_ids);
    let config_json = config.to_json_bytes()?;
    let config_descriptor = BlobDescriptor::of_bytes(&config_json).with_media_type(config_media_type(format));

    let manifest = ImageManifest::new(
        format,
        ManifestLayerDescriptor { media_type: config_media_type(format).to_string(), size: config_descriptor.size, digest: config_descriptor.digest.clone() },
        layer_descriptors,
    );
    let manifest_json = serde_json::to_vec(&manifest)?;

    Ok(AssembledImage { config_json, config_descriptor, manifest, manifest_json })
}

/// Pushes the config blob, every distinct layer blob, and finally the
/// manifest. Layer blobs are read back out of `cache` by digest; callers are
/// expected to have already materialised every `Cached` layer before this
/// runs (the pipeline's `PushBaseLayer`/`PushAppLayer` steps do this per
/// layer, concurrently — this function handles only the manifest/config
/// tail that must happen last).
pub async fn push_manifest_and_config(client: &RegistryClient, assembled: &AssembledImage, tags: &[String]) -> Result<()> {
    crate::pipeline::retry_transient(|| client.push_blob(&assembled.config_descriptor, &assembled.config_json)).await?;
    for tag in tags {
        crate::pipeline::retry_transient(|| client.push_manifest(tag, &assembled.manifest_json, &assembled.manifest.media_type)).await?;
    }
    Ok(())
}

/// Writes the assembled image as a tarball readable by `docker load`
/// (schemaVersion-less legacy `docker save` layout: a top-level `config.json`,
/// one gzip-compressed `<digest>.tar.gz` per layer, and a `manifest.json`
/// index) or, for OCI format, the OCI Image Layout (`oci-layout` +
/// `blobs/sha256/<hex>` + `index.json`).
pub async fn write_tar_target(
    path: &Path,
    image: &Image,
    assembled: &AssembledImage,
    format: ManifestFormat,
    cache: &BlobCache,
    tags: &[String],
) -> Result<()> {
    let mut layer_blobs: Vec<(Digest, Vec<u8>, Digest)> = Vec::with_capacity(image.layers.len());
    for layer in image.layers.iter() {
        let descriptor = layer.descriptor().ok_or_else(|| BuildError::Configuration("layer not materialised".to_string()))?;
        let diff_id = layer.diff_id().ok_or_else(|| BuildError::Configuration("layer not materialised".to_string()))?;
        let cached = cache.get(&descriptor.digest).await?;
        let bytes = tokio::fs::read(&cached.path).await?;
        layer_blobs.push((descriptor.digest.clone(), bytes, diff_id.clone()));
    }

    let path = path.to_path_buf();
    let config_json = assembled.config_json.clone();
    let manifest_json = assembled.manifest_json.clone();
    let config_digest = assembled.config_descriptor.digest.clone();
    let manifest_digest = BlobDescriptor::of_bytes(&manifest_json).digest;
    let manifest_media_type = assembled.manifest.media_type.clone();
    let manifest_size = manifest_json.len() as u64;
    let tags = tags.to_vec();

    tokio::task::spawn_blocking(move || match format {
        ManifestFormat::Docker => write_docker_save_tar(&path, &config_digest, &config_json, &manifest_json, &layer_blobs, &tags),
        ManifestFormat::Oci => write_oci_layout_tar(&path, &config_digest, &config_json, &manifest_digest, &manifest_json, manifest_media_type, manifest_size, &layer_blobs),
    })
    .await
    .map_err(|e| BuildError::Archive { source_path: None, detail: format!("tar-writing task panicked: {}", e) })?
}

/// §4.10's Docker-save layout: `config.json`, one `<compressed digest
/// hex>.tar.gz` per layer (the bytes already sitting in the cache under that
/// digest — never the uncompressed diff-id, which names a different blob
/// entirely and would make `docker load` recompute a mismatching digest on
/// ingest), and a `manifest.json` index tying the two together with
/// `RepoTags`.
fn write_docker_save_tar(
    path: &Path,
    _config_digest: &Digest,
    config_json: &[u8],
    manifest_json: &[u8],
    layers: &[(Digest, Vec<u8>, Digest)],
    tags: &[String],
) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| BuildError::Archive { source_path: Some(path.to_path_buf()), detail: e.to_string() })?;
    let mut builder = tar::Builder::new(file);

    let mut layer_paths = Vec::with_capacity(layers.len());
    for (digest, bytes, _diff_id) in layers {
        let layer_path = format!("{}.tar.gz", digest.hex());
        append_bytes(&mut builder, &layer_path, bytes)?;
        layer_paths.push(layer_path);
    }

    append_bytes(&mut builder, "config.json", config_json)?;

    let save_manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": tags,
        "Layers": layer_paths,
    }]);
    append_bytes(&mut builder, "manifest.json", serde_json::to_string(&save_manifest).unwrap_or_default().as_bytes())?;
    let _ = manifest_json; // the V2.2 manifest itself isn't part of the legacy save layout

    builder.finish().map_err(|e| BuildError::Archive { source_path: Some(path.to_path_buf()), detail: e.to_string() })
}

#[allow(clippy::too_many_arguments)]
fn write_oci_layout_tar(
    path: &Path,
    config_digest: &Digest,
    config_json: &[u8],
    manifest_digest: &Digest,
    manifest_json: &[u8],
    manifest_media_type: String,
    manifest_size: u64,
    layers: &[(Digest, Vec<u8>, Digest)],
) -> Result<()> {
    let file = std::fs::File::create(path).map_err(|e| BuildError::Archive { source_path: Some(path.to_path_buf()), detail: e.to_string() })?;
    let mut builder = tar::Builder::new(file);

    append_bytes(&mut builder, "oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#)?;
    append_bytes(&mut builder, &format!("blobs/sha256/{}", config_digest.hex()), config_json)?;
    append_bytes(&mut builder, &format!("blobs/sha256/{}", manifest_digest.hex()), manifest_json)?;
    for (digest, bytes, _) in layers {
        append_bytes(&mut builder, &format!("blobs/sha256/{}", digest.hex()), bytes)?;
    }

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX_V1,
        "manifests": [{
            "mediaType": manifest_media_type,
            "size": manifest_size,
            "digest": manifest_digest.as_str(),
        }],
    });
    append_bytes(&mut builder, "index.json", serde_json::to_string(&index).unwrap_or_default().as_bytes())?;

    builder.finish().map_err(|e| BuildError::Archive { source_path: Some(path.to_path_buf()), detail: e.to_string() })
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_mtime(crate::archive::DEFAULT_MODIFICATION_TIME);
    header.set_size(data.len() as u64);
    header
        .set_path(path)
        .map_err(|e| BuildError::Archive { source_path: None, detail: format!("path too long for tar target {}: {}", path, e) })?;
    header.set_cksum();
    builder
        .append(&header, data)
        .map_err(|e| BuildError::Archive { source_path: None, detail: e.to_string() })
}

/// Builds the Docker-save tarball in memory and pipes it into `docker load`
/// (or `<docker_path> load` when a non-default binary/path is configured),
/// capturing stderr for diagnosis on a non-zero exit (§4.10's `DaemonLoad`
/// error variant).
pub async fn load_into_daemon(docker_path: Option<&Path>, tar_bytes: Vec<u8>) -> Result<()> {
    let binary = docker_path.map(|p| p.to_string_lossy().to_string()).unwrap_or_else(|| "docker".to_string());
    let mut child = Command::new(&binary)
        .arg("load")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| BuildError::DaemonLoad { exit_code: None, stderr: format!("failed to spawn {}: {}", binary, e) })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&tar_bytes)
            .await
            .map_err(|e| BuildError::DaemonLoad { exit_code: None, stderr: format!("failed writing tar to docker load stdin: {}", e) })?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BuildError::DaemonLoad { exit_code: None, stderr: e.to_string() })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(BuildError::DaemonLoad { exit_code: output.status.code(), stderr: String::from_utf8_lossy(&output.stderr).to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageLayers, Layer, Platform};
    use std::collections::{BTreeMap, BTreeSet};
    use std::io::Read;
    use std::time::SystemTime;

    fn layer_with(digest_byte: u8, diff_byte: u8) -> Layer {
        let descriptor = BlobDescriptor::new(10, Digest::from_hex(&digest_byte.to_string().repeat(64)).unwrap());
        let diff_id = Digest::from_hex(&diff_byte.to_string().repeat(64)).unwrap();
        Layer::Cached { path: "/tmp/unused".into(), descriptor, diff_id }
    }

    fn sample_image() -> Image {
        let mut layers = ImageLayers::new();
        layers.push(layer_with(1, 2));
        layers.push(layer_with(3, 4));
        Image {
            layers,
            history: vec![],
            env: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            labels: BTreeMap::new(),
            exposed_ports: BTreeSet::new(),
            volumes: BTreeSet::new(),
            user: None,
            working_dir: None,
            created: SystemTime::UNIX_EPOCH,
            platform: Platform::default(),
        }
    }

    #[test]
    fn assembled_manifest_layer_count_matches_config_diff_ids() {
        let image = sample_image();
        let assembled = assemble(&image, ManifestFormat::Docker, CompressionAlgorithm::Gzip).unwrap();
        assert_eq!(assembled.manifest.layers.len(), 2);
    }

    #[test]
    fn config_digest_is_stable_for_same_image_shape() {
        let image = sample_image();
        let a = assemble(&image, ManifestFormat::Docker, CompressionAlgorithm::Gzip).unwrap();
        let b = assemble(&image, ManifestFormat::Docker, CompressionAlgorithm::Gzip).unwrap();
        assert_eq!(a.config_descriptor.digest, b.config_descriptor.digest);
    }

    #[test]
    fn oci_format_uses_oci_media_types() {
        let image = sample_image();
        let assembled = assemble(&image, ManifestFormat::Oci, CompressionAlgorithm::Zstd).unwrap();
        assert_eq!(assembled.manifest.media_type, OCI_MANIFEST_V1);
        assert!(assembled.manifest.layers[0].media_type.ends_with("tar+zstd"));
    }

    /// §4.10: the Docker-save layout names the config `config.json`, names
    /// each layer `<compressed digest hex>.tar.gz`, and the bytes under that
    /// name are the exact compressed bytes the digest names — never bytes
    /// keyed by the uncompressed diff-id, which `docker load` would reject.
    #[test]
    fn docker_save_tar_layout_matches_spec() {
        let config_digest = Digest::from_hex(&"9".repeat(64)).unwrap();
        let layer_digest = Digest::from_hex(&"1".repeat(64)).unwrap();
        let diff_id = Digest::from_hex(&"2".repeat(64)).unwrap();
        let compressed_bytes = b"not really gzip but stands in for compressed bytes".to_vec();
        let layers = vec![(layer_digest.clone(), compressed_bytes.clone(), diff_id)];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tar");
        write_docker_save_tar(&path, &config_digest, b"{}", b"{}", &layers, &["myapp:latest".to_string()]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut names = Vec::new();
        let mut layer_contents = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            if name == format!("{}.tar.gz", layer_digest.hex()) {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).unwrap();
                layer_contents = Some(buf);
            }
            names.push(name);
        }

        assert!(names.contains(&"config.json".to_string()));
        assert!(names.contains(&"manifest.json".to_string()));
        assert!(names.contains(&format!("{}.tar.gz", layer_digest.hex())));
        assert_eq!(layer_contents.expect("layer entry present"), compressed_bytes);

        let mut archive = tar::Archive::new(bytes.as_slice());
        let manifest_bytes = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == "manifest.json")
            .map(|mut e| {
                let mut buf = Vec::new();
                e.read_to_end(&mut buf).unwrap();
                buf
            })
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&manifest_bytes).unwrap();
        assert_eq!(manifest[0]["Config"], "config.json");
        assert_eq!(manifest[0]["Layers"][0], format!("{}.tar.gz", layer_digest.hex()));
    }
}
