//! Turns parsed [`crate::cli::args`] into a [`BuildPlan`] and drives it
//! through [`crate::build::build`], printing progress through a plain
//! [`crate::logging::Logger`] rather than wiring a renderer onto the
//! [`crate::events::EventBus`] — good enough for a CLI front end; an
//! embedder wanting richer output subscribes to the bus itself.

use crate::build::parse_reference;
use crate::cli::args::{BuildArgs, CompressionArg, FormatArg, InspectArgs};
use crate::error::{BuildError, Result};
use crate::events::EventBus;
use crate::logging::Logger;
use crate::model::{
    ArchiveLayerSource, BuildPlan, CompressionAlgorithm, Credential, CredentialRetriever, FileEntriesLayer, FileEntry, LayerSource,
    ManifestFormat, Platform, Target,
};
use crate::registry::RegistryClient;
use crate::settings::Settings;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub async fn run_build(args: BuildArgs) -> Result<()> {
    let logger = if args.quiet { Logger::quiet() } else { Logger::new(args.verbose) };
    logger.section("containerize build");

    let plan = build_plan_from_args(&args)?;
    plan.validate()?;

    let events = Arc::new(EventBus::default());
    let mut progress = events.subscribe();
    let verbose = logger.is_verbose();
    tokio::spawn(async move {
        use crate::events::Event;
        while let Ok(event) = progress.recv().await {
            match event {
                Event::Log(log) => println!("{:?}", log),
                Event::Progress(p) if verbose => println!("   {} -> {:.0}%", p.path, p.fraction * 100.0),
                _ => {}
            }
        }
    });

    logger.step(&format!("building from {}", args.from));
    let image = crate::build::build(&plan, events).await?;
    logger.info(&format!("built image with {} layer(s) in {:.2}s", image.layers.len(), logger.elapsed_secs()));
    Ok(())
}

pub async fn run_inspect(args: InspectArgs) -> Result<()> {
    let logger = Logger::new(false);
    let (host, repository, reference) = parse_reference(&args.reference)?;
    let client = RegistryClient::new(&host, &repository, args.allow_insecure_registries, false, &[]).await?;
    let pulled = client.pull_manifest(&reference, &Platform::default()).await?;
    logger.info(&format!("digest: {}", pulled.digest));
    logger.info(&format!("layers: {}", pulled.manifest.layers.len()));
    for layer in &pulled.manifest.layers {
        logger.info(&format!("  {} ({} bytes, {})", layer.digest, layer.size, layer.media_type));
    }
    Ok(())
}

fn build_plan_from_args(args: &BuildArgs) -> Result<BuildPlan> {
    let format = match args.format {
        FormatArg::Docker => ManifestFormat::Docker,
        FormatArg::Oci => ManifestFormat::Oci,
    };
    let compression = match args.compression {
        CompressionArg::Gzip => CompressionAlgorithm::Gzip,
        CompressionArg::Zstd => CompressionAlgorithm::Zstd,
        CompressionArg::None => CompressionAlgorithm::None,
    };

    let mut targets = Vec::new();
    if !args.targets.is_empty() {
        let mut grouped: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for reference in &args.targets {
            let (host, repository, tag) = parse_reference(reference)?;
            grouped.entry((host, repository)).or_default().push(tag);
        }
        for ((address, repository), tags) in grouped {
            targets.push(Target::Registry { address, repository, tags });
        }
    }
    if let Some(path) = &args.tar {
        targets.push(Target::Tar { path: path.clone() });
    }
    if args.load_docker {
        targets.push(Target::Daemon { docker_path: args.docker_path.clone(), tags: args.targets.clone() });
    }

    let mut layers = Vec::new();
    for (index, (host_dir, container_prefix)) in args.layers.iter().enumerate() {
        let entries = collect_file_entries(host_dir, container_prefix)?;
        layers.push(LayerSource::FileEntries(FileEntriesLayer::new(format!("layer-{}", index), entries)));
    }

    let settings = Settings::from_env();

    Ok(BuildPlan {
        base_image: args.from.clone(),
        platforms: vec![Platform::default()],
        creation_time: SystemTime::now(),
        format,
        compression,
        environment: args.env.iter().cloned().collect(),
        labels: BTreeMap::new(),
        volumes: BTreeSet::new(),
        exposed_ports: BTreeSet::new(),
        user: args.user.clone(),
        working_directory: args.working_dir.clone(),
        entrypoint: args.entrypoint.as_ref().map(|s| shell_words_lite(s)),
        cmd: args.cmd.as_ref().map(|s| shell_words_lite(s)),
        layers,
        targets,
        cache_dir: args.cache_dir.clone().unwrap_or_else(default_cache_dir),
        credential_retrievers: env_credential_retrievers(),
        registry_mirrors: BTreeMap::new(),
        allow_insecure_registries: args.allow_insecure_registries,
        send_credentials_over_http: settings.send_credentials_over_http,
        cross_repository_blob_mounts: settings.cross_repository_blob_mounts,
        always_cache_base_image: false,
        worker_pool_size: args.workers.max(1),
    })
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir().join("containerize-cache")
}

/// Splits on plain whitespace — no quoting support. Good enough for the CLI's
/// `--entrypoint`/`--cmd` flags; an embedder building a [`BuildPlan`] directly
/// supplies `Vec<String>` and never goes through this at all.
fn shell_words_lite(s: &str) -> Vec<String> {
    s.split_whitespace().map(|w| w.to_string()).collect()
}

/// Reads `CONTAINERIZE_USERNAME`/`CONTAINERIZE_PASSWORD` at retrieval time
/// rather than at construction, so a build started before the variables are
/// set (e.g. by a credential helper wrapper script) still picks them up.
struct EnvCredentialRetriever;

#[async_trait::async_trait]
impl CredentialRetriever for EnvCredentialRetriever {
    async fn retrieve(&self) -> Result<Option<Credential>> {
        let username = std::env::var("CONTAINERIZE_USERNAME").ok();
        let password = std::env::var("CONTAINERIZE_PASSWORD").ok();
        match (username, password) {
            (Some(username), Some(password)) => Ok(Some(Credential::UserPassword { username, password })),
            _ => Ok(None),
        }
    }
}

fn env_credential_retrievers() -> Vec<Box<dyn CredentialRetriever>> {
    vec![Box::new(EnvCredentialRetriever)]
}

fn collect_file_entries(host_dir: &Path, container_prefix: &str) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    walk(host_dir, host_dir, container_prefix, &mut entries)?;
    Ok(entries)
}

fn walk(root: &Path, dir: &Path, container_prefix: &str, out: &mut Vec<FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| BuildError::Archive { source_path: Some(dir.to_path_buf()), detail: e.to_string() })?;
    for entry in read_dir {
        let entry = entry.map_err(|e| BuildError::Archive { source_path: Some(dir.to_path_buf()), detail: e.to_string() })?;
        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| BuildError::Archive { source_path: Some(path.clone()), detail: e.to_string() })?;
        if metadata.is_dir() {
            walk(root, &path, container_prefix, out)?;
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
        let extraction_path = format!("{}/{}", container_prefix.trim_end_matches('/'), relative);
        let mod_time = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let permissions = file_permissions(&metadata);
        out.push(FileEntry::new(path, extraction_path, permissions, mod_time, "0:0"));
    }
    Ok(())
}

#[cfg(unix)]
fn file_permissions(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_permissions(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

/// Unused outside the CLI's own `Inspect` path today, but public so an
/// embedder can build a one-off `ArchiveLayerSource` from a path without
/// going through the `--layer` flag at all.
pub fn archive_layer_source(name: impl Into<String>, archive_path: PathBuf, media_type: Option<String>) -> LayerSource {
    LayerSource::Archive(ArchiveLayerSource { name: name.into(), archive_path, media_type })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_words_lite_splits_on_whitespace() {
        assert_eq!(shell_words_lite("/bin/sh -c run"), vec!["/bin/sh", "-c", "run"]);
    }

    #[test]
    fn collect_file_entries_walks_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("nested/b.txt"), b"b").unwrap();

        let entries = collect_file_entries(dir.path(), "/app").unwrap();
        let mut paths: Vec<_> = entries.iter().map(|e| e.extraction_path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["/app/a.txt".to_string(), "/app/nested/b.txt".to_string()]);
    }
}
