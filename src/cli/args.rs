//! CLI argument definitions. Grounded on the teacher's `cli/args.rs`
//! subcommand-per-verb layout (`clap::Parser` + `clap::Subcommand`), pared
//! down to the two operations this core actually exposes: building an
//! image, and inspecting one already on a registry.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "containerize", version, about = "Builds and pushes OCI/Docker images without a daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build an image from a base image and a set of layers, writing it to
    /// one or more targets.
    Build(BuildArgs),
    /// Pull and print a manifest's digest, layer count, and platform set
    /// without building anything.
    Inspect(InspectArgs),
}

#[derive(clap::Args, Debug)]
pub struct BuildArgs {
    /// Base image reference, or the literal `scratch`.
    #[arg(long)]
    pub from: String,

    /// `registry/repository:tag` to push to. Repeatable.
    #[arg(long = "to")]
    pub targets: Vec<String>,

    /// Write an image tarball to this path instead of (or alongside) a
    /// registry push.
    #[arg(long)]
    pub tar: Option<PathBuf>,

    /// Load the built image into a local Docker daemon via `docker load`.
    #[arg(long, action = ArgAction::SetTrue)]
    pub load_docker: bool,

    /// Path to a non-default `docker` binary for `--load-docker`.
    #[arg(long)]
    pub docker_path: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "docker")]
    pub format: FormatArg,

    #[arg(long, value_enum, default_value = "gzip")]
    pub compression: CompressionArg,

    /// A directory to be tarred as a single layer, `host:container`.
    #[arg(long = "layer", value_parser = parse_layer_spec)]
    pub layers: Vec<(PathBuf, String)>,

    #[arg(long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    #[arg(long)]
    pub entrypoint: Option<String>,

    #[arg(long)]
    pub cmd: Option<String>,

    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub working_dir: Option<String>,

    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, action = ArgAction::SetTrue)]
    pub allow_insecure_registries: bool,

    #[arg(long, default_value_t = num_cpus())]
    pub workers: usize,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    #[arg(short, long, action = ArgAction::SetTrue)]
    pub quiet: bool,
}

#[derive(clap::Args, Debug)]
pub struct InspectArgs {
    /// `registry/repository:tag-or-digest`.
    #[arg(long)]
    pub reference: String,

    #[arg(long, action = ArgAction::SetTrue)]
    pub allow_insecure_registries: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum FormatArg {
    Docker,
    Oci,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum CompressionArg {
    Gzip,
    Zstd,
    None,
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn parse_layer_spec(s: &str) -> Result<(PathBuf, String), String> {
    match s.split_once(':') {
        Some((host, container)) => Ok((PathBuf::from(host), container.to_string())),
        None => Err(format!("expected HOST:CONTAINER, got '{}'", s)),
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), v.to_string())),
        None => Err(format!("expected KEY=VALUE, got '{}'", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_spec_splits_on_first_colon() {
        assert_eq!(parse_layer_spec("./out:/app").unwrap(), (PathBuf::from("./out"), "/app".to_string()));
    }

    #[test]
    fn layer_spec_without_colon_is_rejected() {
        assert!(parse_layer_spec("./out").is_err());
    }

    #[test]
    fn key_value_splits_on_first_equals() {
        assert_eq!(parse_key_value("FOO=bar=baz").unwrap(), ("FOO".to_string(), "bar=baz".to_string()));
    }
}
