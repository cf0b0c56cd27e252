//! Thin CLI front end (§5's [ADDED] note): parses arguments with `clap`
//! derive macros, the way the teacher's `cli/args.rs` does, and hands off to
//! [`crate::build::build`]. Everything interesting — the pipeline, the
//! registry client, the cache — works the same whether it's driven from here
//! or embedded directly by another Rust program.

pub mod args;
mod runner;

use crate::error::Result;
pub use args::{Cli, Command};

pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build(build_args) => runner::run_build(build_args).await,
        Command::Inspect(inspect_args) => runner::run_inspect(inspect_args).await,
    }
}
