//! CLI surface (spec §6, ambient: the engine's configuration contract).
//!
//! Generalizes the `clap` derive style used by the pack's own binaries
//! (`testcrate`, `pubsys`) to Rocker's five subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cache::FsCache;
use crate::engine::EngineConfig;

#[derive(Debug, Parser)]
#[command(name = "rocker", about = "a declarative, cache-aware container image build engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Docker Engine API endpoint (defaults to `DOCKER_HOST`, then the local socket).
    #[arg(long, global = true, env = "DOCKER_HOST")]
    pub host: Option<String>,
    #[arg(long, global = true, env = "DOCKER_TLS_VERIFY")]
    pub tlsverify: Option<String>,
    #[arg(long, global = true)]
    pub tlscacert: Option<PathBuf>,
    #[arg(long, global = true)]
    pub tlscert: Option<PathBuf>,
    #[arg(long, global = true)]
    pub tlskey: Option<PathBuf>,

    #[arg(long, global = true)]
    pub verbose: bool,
    /// Switches the logger to structured JSON lines.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the pipeline on a Rockerfile.
    Build(BuildArgs),
    /// Inspect image metadata.
    Show {
        reference: String,
        #[arg(long)]
        json: bool,
    },
    /// Prune resources (dangling untagged images, stale exports containers).
    Clean,
    /// Pull one image via the engine's daemon client.
    Pull { reference: String },
    /// Report client configuration.
    Info {
        #[arg(long)]
        all: bool,
    },
}

#[derive(Debug, Parser)]
pub struct BuildArgs {
    /// Path to the Rockerfile (default `Rockerfile`).
    #[arg(short = 'f', long = "file", default_value = "Rockerfile")]
    pub file: PathBuf,

    /// Build context directory.
    #[arg(default_value = ".")]
    pub context: PathBuf,

    #[arg(long = "auth")]
    pub auth: Option<String>,

    /// Template variable, repeatable: `--var k=v`.
    #[arg(long = "var", value_parser = parse_key_val)]
    pub var: Vec<(String, String)>,

    #[arg(long = "build-arg", value_parser = parse_key_val_optional)]
    pub build_arg: Vec<(String, Option<String>)>,

    #[arg(long)]
    pub no_cache: bool,
    #[arg(long)]
    pub reload_cache: bool,
    #[arg(long)]
    pub no_reuse: bool,
    #[arg(long)]
    pub push: bool,
    #[arg(long)]
    pub pull: bool,
    #[arg(long)]
    pub attach: bool,
    #[arg(long)]
    pub no_garbage: bool,

    /// Prints the compiled plan instead of running it.
    #[arg(long)]
    pub print: bool,
    /// Build metadata (git commit/branch/url) to surface in labels.
    #[arg(long)]
    pub meta: bool,

    #[arg(long)]
    pub id: Option<String>,
    #[arg(long = "artifacts-path")]
    pub artifacts_path: Option<PathBuf>,
    #[arg(long = "cache-dir", default_value = ".rocker-cache")]
    pub cache_dir: PathBuf,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((k.to_string(), v.to_string()))
}

fn parse_key_val_optional(s: &str) -> Result<(String, Option<String>), String> {
    match s.split_once('=') {
        Some((k, v)) => Ok((k.to_string(), Some(v.to_string()))),
        None => Ok((s.to_string(), None)),
    }
}

impl BuildArgs {
    /// Resolves the build args and global flags from `Cli` into an
    /// [`EngineConfig`] and an [`FsCache`] (spec §6 Environment:
    /// `ARG`-referenced env vars fall back to the process environment when
    /// not overridden on the CLI).
    pub fn engine_config(&self, build_id: String) -> EngineConfig {
        EngineConfig {
            context_dir: self.context.clone(),
            cache_dir: self.cache_dir.clone(),
            global_pull: self.pull,
            global_attach: self.attach,
            global_push: self.push,
            no_garbage: self.no_garbage,
            no_reuse: self.no_reuse,
            build_id: self.id.clone().unwrap_or(build_id),
            persist_exports: self.artifacts_path.is_some(),
        }
    }

    pub fn cache(&self) -> FsCache {
        let cache = FsCache::new(self.cache_dir.clone());
        if self.reload_cache {
            cache.reload_cache()
        } else if self.no_cache {
            cache.no_cache()
        } else {
            cache
        }
    }
}
