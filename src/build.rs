//! Top-level orchestration: turns a [`BuildPlan`] into a resolved [`Image`]
//! and writes it to every configured target. This is the seam the CLI (and
//! any other embedder) calls through; everything below it — registry client,
//! cache, archiver, scheduler — is usable independently, but this is the
//! "do the whole build" entry point that ties them together into the
//! assemble-and-push DAG described in §4.8.

use crate::archive::{archive_from_raw_tar, archive_layer};
use crate::cache::{selector_for, BlobCache};
use crate::digest::{BlobDescriptor, Digest};
use crate::error::{BuildError, Result};
use crate::events::{Allocation, EventBus};
use crate::manifest::ContainerConfig;
use crate::model::{
    ArchiveLayerSource, BuildPlan, CompressionAlgorithm, FileEntriesLayer, Image, ImageLayers, Layer, LayerSource, ManifestFormat,
    Platform, Target,
};
use crate::pipeline::{retry_transient, Scheduler, Step, StepAction};
use crate::registry::RegistryClient;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Splits `registry/repository:tag` (or `@digest`) into its three parts. The
/// literal `scratch` is handled by the caller before this is reached.
/// Follows the same convention `docker`/`crane` use: no dot, colon before the
/// first slash, or `localhost` in the first segment means "no registry host",
/// which implies Docker Hub with an implicit `library/` namespace.
pub fn parse_reference(reference: &str) -> Result<(String, String, String)> {
    let (name, pinned) = match reference.rsplit_once('@') {
        Some((n, digest)) => (n, format!("sha256:{}", digest.trim_start_matches("sha256:"))),
        None => match reference.rsplit_once(':') {
            // Only a tag if the colon comes after the last '/' (otherwise it's a port).
            Some((n, tag)) if !tag.contains('/') => (n, tag.to_string()),
            _ => (reference, "latest".to_string()),
        },
    };

    if name.is_empty() {
        return Err(BuildError::configuration(format!("empty image reference: {}", reference)));
    }

    match name.split_once('/') {
        Some((host, repo)) if host.contains('.') || host.contains(':') || host == "localhost" => {
            Ok((host.to_string(), repo.to_string(), pinned))
        }
        _ => Ok(("registry-1.docker.io".to_string(), format!("library/{}", name.trim_start_matches('/')), pinned)),
    }
}

/// Set only when the base was pulled from a real registry (not `scratch`),
/// kept around so pushing to a target can mount its layers cross-repo or,
/// failing that, pull them through before re-pushing.
struct BaseSource {
    client: RegistryClient,
    host: String,
    repository: String,
}

struct BaseImage {
    image: Image,
    source: Option<BaseSource>,
}

async fn resolve_base_image(plan: &BuildPlan, cache: &BlobCache, events: &EventBus) -> Result<BaseImage> {
    if plan.base_image.trim() == "scratch" {
        let image = Image {
            layers: ImageLayers::new(),
            history: Vec::new(),
            env: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            labels: BTreeMap::new(),
            exposed_ports: Default::default(),
            volumes: Default::default(),
            user: None,
            working_dir: None,
            created: plan.creation_time,
            platform: plan.platforms.first().cloned().unwrap_or_default(),
        };
        return Ok(BaseImage { image, source: None });
    }

    let (host, repository, reference) = parse_reference(&plan.base_image)?;
    let platform = plan.platforms.first().cloned().unwrap_or_default();

    events.log_info(format!("pulling base image {}", plan.base_image));
    let (client, pulled) = pull_manifest_via_mirrors(plan, &host, &repository, &reference, &platform, events).await?;

    let config_descriptor: BlobDescriptor = (&pulled.manifest.config).into();
    let config_cached = retry_transient(|| client.pull_blob_to_cache(&config_descriptor.digest, cache)).await?;
    let config_bytes = tokio::fs::read(&cache.get(&config_cached.digest).await?.path).await?;
    let base_config: ContainerConfig = serde_json::from_slice(&config_bytes)?;

    if base_config.rootfs.diff_ids.len() != pulled.manifest.layers.len() {
        return Err(BuildError::ManifestFormat(format!(
            "base image {} has {} layers but config lists {} diff-ids",
            plan.base_image,
            pulled.manifest.layers.len(),
            base_config.rootfs.diff_ids.len()
        )));
    }

    let mut layers = ImageLayers::new();
    for (layer_desc, diff_id) in pulled.manifest.layers.iter().zip(base_config.rootfs.diff_ids.iter()) {
        let descriptor: BlobDescriptor = layer_desc.into();
        if plan.always_cache_base_image {
            let cached = retry_transient(|| client.pull_blob_to_cache(&descriptor.digest, cache)).await?;
            let path = cache.get(&cached.digest).await?.path;
            layers.push(Layer::Cached { path, descriptor: cached, diff_id: diff_id.clone() });
        } else {
            layers.push(Layer::Reference { descriptor, diff_id: diff_id.clone() });
        }
    }

    let env = base_config
        .config
        .env
        .iter()
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let history = base_config.history.iter().map(|h| h.created_by.clone().unwrap_or_else(|| "base layer".to_string())).collect();

    let image = Image {
        layers,
        history,
        env,
        entrypoint: base_config.config.entrypoint.clone(),
        cmd: base_config.config.cmd.clone(),
        labels: base_config.config.labels.clone(),
        exposed_ports: base_config.config.exposed_ports.keys().cloned().collect(),
        volumes: base_config.config.volumes.keys().cloned().collect(),
        user: if base_config.config.user.is_empty() { None } else { Some(base_config.config.user.clone()) },
        working_dir: if base_config.config.working_dir.is_empty() { None } else { Some(base_config.config.working_dir.clone()) },
        created: plan.creation_time,
        platform: Platform { architecture: base_config.architecture, os: base_config.os },
    };

    Ok(BaseImage { image, source: Some(BaseSource { client, host, repository }) })
}

/// Tries each configured mirror host for `primary_host` in order before
/// falling through to `primary_host` itself (§4.6/§6: mirrors apply only to
/// base-image pulls). A candidate is abandoned — not retried — on any
/// error; only the final candidate's failure is returned to the caller,
/// since an earlier candidate's rejection is expected when a mirror simply
/// doesn't carry this image.
async fn pull_manifest_via_mirrors(
    plan: &BuildPlan,
    primary_host: &str,
    repository: &str,
    reference: &str,
    platform: &Platform,
    events: &EventBus,
) -> Result<(RegistryClient, crate::registry::PulledManifest)> {
    let mut candidates: Vec<String> = plan.registry_mirrors.get(primary_host).cloned().unwrap_or_default();
    candidates.push(primary_host.to_string());

    let last_index = candidates.len() - 1;
    let mut last_err = None;
    for (i, candidate_host) in candidates.iter().enumerate() {
        let client = match RegistryClient::new(
            candidate_host,
            repository,
            plan.allow_insecure_registries,
            plan.send_credentials_over_http,
            &plan.credential_retrievers,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        match retry_transient(|| client.pull_manifest(reference, platform)).await {
            Ok(pulled) => return Ok((client, pulled)),
            Err(e) => {
                if i != last_index {
                    events.log_warning(format!("mirror {} failed for base image pull, falling through: {}", candidate_host, e));
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| BuildError::configuration("no registry mirror or primary host configured")))
}

/// Archives one local layer source into cache, reusing a prior archive of the
/// identical source description (§4.2's selector index) when one exists.
async fn build_local_layer(source: &LayerSource, cache: &BlobCache, compression: CompressionAlgorithm) -> Result<(Layer, String)> {
    match source {
        LayerSource::FileEntries(FileEntriesLayer { name, entries }) => {
            let selector = selector_for(entries);
            if let Some(digest) = cache.resolve_selector(&selector).await? {
                let cached = cache.get(&digest).await?;
                let diff_id = diff_id_for_cached(&cached.path).await?;
                return Ok((Layer::Cached { path: cached.path, descriptor: cached.descriptor, diff_id }, name.clone()));
            }

            let layer = FileEntriesLayer::new(name.clone(), entries.clone());
            let archived = archive_layer(&layer, compression)?;
            let descriptor = cache.put(&archived.compressed).await?;
            cache.link_selector(&selector, &descriptor.digest).await?;
            let path = cache.get(&descriptor.digest).await?.path;
            Ok((Layer::Cached { path, descriptor, diff_id: archived.diff_id.digest }, name.clone()))
        }
        LayerSource::Archive(ArchiveLayerSource { name, archive_path, .. }) => {
            let raw = tokio::fs::read(archive_path)
                .await
                .map_err(|e| BuildError::Archive { source_path: Some(archive_path.clone()), detail: e.to_string() })?;
            let archived = archive_from_raw_tar(raw, compression)?;
            let descriptor = cache.put(&archived.compressed).await?;
            let path = cache.get(&descriptor.digest).await?.path;
            Ok((Layer::Cached { path, descriptor, diff_id: archived.diff_id.digest }, name.clone()))
        }
    }
}

/// Recomputes a diff-id for a cache hit whose selector already pointed at a
/// compressed digest — cheap relative to re-archiving, and keeps selector
/// hits from needing a second, diff-id-keyed index.
async fn diff_id_for_cached(path: &std::path::Path) -> Result<Digest> {
    let bytes = tokio::fs::read(path).await?;
    decompress_and_hash(&bytes)
}

fn decompress_and_hash(compressed: &[u8]) -> Result<Digest> {
    use std::io::Read;
    // Try gzip first, then zstd, falling back to "already uncompressed" —
    // mirrors the three `CompressionAlgorithm` variants a cache hit could be.
    let mut gz = flate2::read::GzDecoder::new(compressed);
    let mut raw = Vec::new();
    if gz.read_to_end(&mut raw).is_ok() && !raw.is_empty() {
        return Ok(BlobDescriptor::of_bytes(&raw).digest);
    }
    if let Ok(raw) = zstd::decode_all(compressed) {
        return Ok(BlobDescriptor::of_bytes(&raw).digest);
    }
    Ok(BlobDescriptor::of_bytes(compressed).digest)
}

/// Pushes every distinct layer blob to `client`. A layer still in the
/// [`Layer::Reference`] state (never materialised locally) is mounted
/// cross-repo from `source` when that's on the same registry host and the
/// plan allows it (§4.7); otherwise it's pulled through `source`'s client
/// into the cache before being re-pushed.
async fn push_layers(
    client: &RegistryClient,
    target_host: &str,
    layers: &ImageLayers,
    cache: &BlobCache,
    source: Option<&BaseSource>,
    allow_mounts: bool,
) -> Result<()> {
    for layer in layers.iter() {
        let descriptor = match layer.descriptor() {
            Some(d) => d,
            None => return Err(BuildError::configuration("layer reached publish stage unmaterialised")),
        };
        if retry_transient(|| client.blob_exists(&descriptor.digest)).await? {
            continue;
        }

        if let Layer::Reference { .. } = layer {
            if let Some(base) = source {
                let same_host = crate::auth::canonical_registry_host(&base.host) == crate::auth::canonical_registry_host(target_host);
                if allow_mounts && same_host && retry_transient(|| client.mount_blob(&descriptor.digest, &base.repository)).await? {
                    continue;
                }
                if !cache.contains(&descriptor.digest).await {
                    retry_transient(|| base.client.pull_blob_to_cache(&descriptor.digest, cache)).await?;
                }
            }
        }

        let cached = cache.get(&descriptor.digest).await?;
        let bytes = tokio::fs::read(&cached.path).await?;
        retry_transient(|| client.push_blob(&cached.descriptor, &bytes)).await?;
    }
    Ok(())
}

/// Merges the plan's own container-config fields (§6) onto the image
/// resolved from the base (§3), run after layers are attached and before any
/// target sees the image. Env is merged key-by-key with the plan taking
/// precedence over the base; every other field the plan sets replaces the
/// base's value outright, matching how each of these fields works in a
/// Dockerfile-equivalent build (`ENV` accumulates, `ENTRYPOINT`/`CMD`/`USER`/
/// `WORKDIR` overwrite).
fn apply_plan_overrides(image: &mut Image, plan: &BuildPlan) {
    for (k, v) in &plan.environment {
        image.env.insert(k.clone(), v.clone());
    }
    if plan.entrypoint.is_some() {
        image.entrypoint = plan.entrypoint.clone();
    }
    if plan.cmd.is_some() {
        image.cmd = plan.cmd.clone();
    }
    for (k, v) in &plan.labels {
        image.labels.insert(k.clone(), v.clone());
    }
    if plan.user.is_some() {
        image.user = plan.user.clone();
    }
    if plan.working_directory.is_some() {
        image.working_dir = plan.working_directory.clone();
    }
    image.volumes.extend(plan.volumes.iter().cloned());
    image.exposed_ports.extend(plan.exposed_ports.iter().cloned());
}

/// Runs an entire build: resolves the base image, archives every local layer
/// (concurrently, bounded by `plan.worker_pool_size`), and writes the result
/// to every configured target. Returns the resolved [`Image`] so a caller can
/// inspect what was actually built (final digests, layer count) afterward.
pub async fn build(plan: &BuildPlan, events: Arc<EventBus>) -> Result<Image> {
    plan.validate()?;
    let cache = Arc::new(BlobCache::open(&plan.cache_dir).await?);
    let root = Allocation::root(events.clone(), "build");
    let stages = root.subdivide_weighted(&[("base", 1.0), ("layers", 3.0), ("publish", 2.0)]);

    let BaseImage { mut image, source } = resolve_base_image(plan, &cache, &events).await?;
    stages[0].complete();

    if !plan.layers.is_empty() {
        let scheduler = Scheduler::new(plan.worker_pool_size.max(1));
        let built: Arc<Mutex<Vec<(usize, Layer, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let layer_progress = stages[1].subdivide_equal(plan.layers.len());

        let mut steps = Vec::with_capacity(plan.layers.len());
        for (index, source) in plan.layers.iter().cloned().enumerate() {
            let compression = plan.compression;
            let built = built.clone();
            let allocation = layer_progress[index].clone();
            let cache = cache.clone();
            let action: StepAction = Box::new(move || {
                Box::pin(async move {
                    let (layer, name) = build_local_layer(&source, &cache, compression).await?;
                    allocation.complete();
                    built.lock().await.push((index, layer, name));
                    Ok(())
                })
            });
            steps.push(Step::new(format!("archive-layer-{}", index), vec![], action));
        }
        scheduler.run(steps).await?;

        let mut results = built.lock().await;
        results.sort_by_key(|(index, _, _)| *index);
        for (_, layer, name) in results.drain(..) {
            image.layers.push(layer);
            image.history.push(name);
        }
    } else {
        stages[1].complete();
    }

    apply_plan_overrides(&mut image, plan);

    for target in &plan.targets {
        match target {
            Target::Registry { address, repository, tags } => {
                let client = RegistryClient::new(address, repository, plan.allow_insecure_registries, plan.send_credentials_over_http, &plan.credential_retrievers).await?;
                push_layers(&client, address, &image.layers, &cache, source.as_ref(), plan.cross_repository_blob_mounts).await?;
                let assembled = crate::assemble::assemble(&image, plan.format, plan.compression)?;
                crate::assemble::push_manifest_and_config(&client, &assembled, tags).await?;
                events.log_info(format!("pushed {} tag(s) to {}/{}", tags.len(), address, repository));
            }
            Target::Tar { path } => {
                let assembled = crate::assemble::assemble(&image, plan.format, plan.compression)?;
                crate::assemble::write_tar_target(path, &image, &assembled, plan.format, &cache, &[]).await?;
                events.log_info(format!("wrote image tarball to {}", path.display()));
            }
            Target::Daemon { docker_path, tags } => {
                let assembled = crate::assemble::assemble(&image, ManifestFormat::Docker, CompressionAlgorithm::Gzip)?;
                let tmp_path = std::env::temp_dir().join(format!("containerize-{}.tar", uuid::Uuid::new_v4()));
                crate::assemble::write_tar_target(&tmp_path, &image, &assembled, ManifestFormat::Docker, &cache, tags).await?;
                let bytes = tokio::fs::read(&tmp_path).await?;
                let _ = tokio::fs::remove_file(&tmp_path).await;
                crate::assemble::load_into_daemon(docker_path.as_deref(), bytes).await?;
                events.log_info("loaded image into local daemon".to_string());
            }
        }
    }
    stages[2].complete();
    root.complete();

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_hub_shorthand() {
        let (host, repo, reference) = parse_reference("alpine:3.19").unwrap();
        assert_eq!(host, "registry-1.docker.io");
        assert_eq!(repo, "library/alpine");
        assert_eq!(reference, "3.19");
    }

    #[test]
    fn parses_namespaced_docker_hub_reference() {
        let (host, repo, reference) = parse_reference("myorg/myapp:latest").unwrap();
        assert_eq!(host, "registry-1.docker.io");
        assert_eq!(repo, "myorg/myapp");
        assert_eq!(reference, "latest");
    }

    #[test]
    fn parses_reference_with_explicit_registry_host() {
        let (host, repo, reference) = parse_reference("gcr.io/distroless/java17:nonroot").unwrap();
        assert_eq!(host, "gcr.io");
        assert_eq!(repo, "distroless/java17");
        assert_eq!(reference, "nonroot");
    }

    #[test]
    fn parses_reference_with_port_and_no_tag() {
        let (host, repo, reference) = parse_reference("localhost:5000/myimage").unwrap();
        assert_eq!(host, "localhost:5000");
        assert_eq!(repo, "myimage");
        assert_eq!(reference, "latest");
    }

    #[test]
    fn parses_reference_pinned_by_digest() {
        let digest = "a".repeat(64);
        let (_, _, reference) = parse_reference(&format!("alpine@sha256:{}", digest)).unwrap();
        assert_eq!(reference, format!("sha256:{}", digest));
    }
}
