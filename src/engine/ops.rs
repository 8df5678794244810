//! Per-Op contracts (spec §4.E).

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::{FsCache, OpProjection};
use crate::copy;
use crate::daemon::{ContainerPurpose, DaemonClient};
use crate::error::{ErrorKind, Result};
use crate::parser::Directive;
use crate::plan::Op;
use crate::state::{Healthcheck, State};

use super::{BuildReport, TaggedImage};

/// Build-wide configuration resolved from the CLI (spec §6 `build` options).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub context_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub global_pull: bool,
    pub global_attach: bool,
    pub global_push: bool,
    pub no_garbage: bool,
    pub no_reuse: bool,
    pub build_id: String,
    pub persist_exports: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_dir: PathBuf::from("."),
            cache_dir: PathBuf::from(".rocker-cache"),
            global_pull: false,
            global_attach: false,
            global_push: false,
            no_garbage: false,
            no_reuse: false,
            build_id: "default".to_string(),
            persist_exports: false,
        }
    }
}

pub struct OpOutcome {
    pub next_state: State,
    /// Set only by `From` when the loaded base image carried ONBUILD
    /// triggers (spec §4.C rule 6, §4.E FROM).
    pub injected: Option<Vec<Directive>>,
}

fn no_inject(next_state: State) -> OpOutcome {
    OpOutcome {
        next_state,
        injected: None,
    }
}

pub async fn apply(
    op: &Op,
    state: &State,
    daemon: &dyn DaemonClient,
    cache: &FsCache,
    config: &EngineConfig,
    report: &mut BuildReport,
) -> Result<OpOutcome> {
    match op {
        Op::From(d) => from(d, state, daemon, config).await,
        Op::Run(d) => run(d, state, daemon).await,
        Op::Env(d) => Ok(no_inject(env(d, state)?)),
        Op::Label(d) => Ok(no_inject(label(d, state)?)),
        Op::Workdir(d) => Ok(no_inject(workdir(d, state)?)),
        Op::Cmd(d) => Ok(no_inject(cmd(d, state)?)),
        Op::Entrypoint(d) => Ok(no_inject(entrypoint(d, state)?)),
        Op::Expose(d) => Ok(no_inject(expose(d, state)?)),
        Op::Volume(d) => Ok(no_inject(volume(d, state)?)),
        Op::User(d) => Ok(no_inject(user(d, state)?)),
        Op::Maintainer(d) => Ok(no_inject(maintainer(d, state)?)),
        Op::Healthcheck(d) => Ok(no_inject(healthcheck(d, state)?)),
        Op::Arg(d) => Ok(no_inject(arg(d, state)?)),
        Op::Copy(d) => copy_or_add(d, state, daemon, config, "COPY").await,
        Op::Add(d) => copy_or_add(d, state, daemon, config, "ADD").await,
        Op::Tag(d) => tag(d, state, daemon, report).await,
        Op::Push(d) => push(d, state, daemon, config, report).await,
        Op::Mount(d) => mount(d, state, daemon).await,
        Op::Attach(d) => attach(d, state, daemon, config).await,
        Op::Export(d) => export(d, state, daemon, config).await,
        Op::Import(d) => import(d, state, daemon, cache, config).await,
        Op::Require(d) => require(d, state),
        Op::OnbuildWrap(inner) => {
            let outcome = Box::pin(apply(inner, state, daemon, cache, config, report)).await?;
            Ok(outcome)
        }
        Op::Commit => commit(state, daemon, cache, config, report).await,
        Op::Cleanup { tagged, final_ } => cleanup(state, daemon, config, *tagged, *final_).await,
    }
}

async fn from(d: &Directive, state: &State, daemon: &dyn DaemonClient, config: &EngineConfig) -> Result<OpOutcome> {
    let reference = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("FROM requires an image reference".to_string()))?;

    let info = daemon.ensure_image(reference, config.global_pull).await?;

    let mut next = State::new();
    next.image_id = info.id.clone();
    next.parent_id = info.id;
    next.config.env = info.env;
    next.config.cmd = info.cmd;
    next.config.entrypoint = info.entrypoint;
    next.config.labels = info.labels;
    next.config.exposed_ports = info.exposed_ports;
    next.config.volumes = info.volumes;
    next.config.user = info.user;
    next.dockerignore = state.dockerignore.clone();
    next.build_args = state.build_args.clone();

    let injected = if info.onbuild.is_empty() {
        None
    } else {
        let mut directives = Vec::new();
        for line in &info.onbuild {
            let mut parsed = crate::parser::parse(line)?;
            if let Some(mut directive) = parsed.pop() {
                directive.is_onbuild = true;
                directives.push(directive);
            }
        }
        Some(directives)
    };

    Ok(OpOutcome {
        next_state: next,
        injected,
    })
}

async fn run(d: &Directive, state: &State, daemon: &dyn DaemonClient) -> Result<OpOutcome> {
    if state.image_id.is_empty() {
        return Err(ErrorKind::user_input("RUN requires a preceding FROM".to_string()));
    }

    // Whether this RUN (and the rest of its segment) is actually reusable
    // from the cache is decided once, by the Commit op, against the full
    // aggregated batch this RUN feeds into — not here against this single
    // directive's text, which the write side never keys on.
    let effective_cmd = if d.is_json() {
        d.args.clone()
    } else {
        vec!["/bin/sh".to_string(), "-c".to_string(), d.args.join(" ")]
    };

    let saved_cmd = state.config.cmd.clone();
    let mut staged = state.clone();
    staged.config.cmd = Some(effective_cmd);

    let container_id = daemon.create_container(&staged, &staged.host_config).await?;
    daemon.run_container(&container_id, false).await?;

    let mut next = staged.with_container_id(container_id);
    next.config.cmd = saved_cmd;
    next = next.commit(&d.original);
    next.pending_tarsum = None;

    Ok(no_inject(next))
}

fn env(d: &Directive, state: &State) -> Result<State> {
    if d.args.len() % 2 != 0 {
        return Err(ErrorKind::user_input("ENV requires an even number of key/value tokens".to_string()));
    }
    let mut next = state.clone();
    for pair in d.args.chunks(2) {
        let (k, v) = (&pair[0], &pair[1]);
        if let Some(existing) = next.config.env.iter_mut().find(|e| e.starts_with(&format!("{k}="))) {
            *existing = format!("{k}={v}");
        } else {
            next.config.env.push(format!("{k}={v}"));
        }
    }
    Ok(next.commit(&d.original))
}

fn label(d: &Directive, state: &State) -> Result<State> {
    if d.args.len() % 2 != 0 {
        return Err(ErrorKind::user_input("LABEL requires an even number of key/value tokens".to_string()));
    }
    let mut next = state.clone();
    for pair in d.args.chunks(2) {
        next.config.labels.insert(pair[0].clone(), pair[1].clone());
    }
    Ok(next.commit(&d.original))
}

fn workdir(d: &Directive, state: &State) -> Result<State> {
    let path = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("WORKDIR requires a path".to_string()))?;
    let mut next = state.clone();
    next.config.workdir = if path.starts_with('/') {
        path.clone()
    } else if next.config.workdir.is_empty() {
        format!("/{path}")
    } else {
        format!("{}/{}", next.config.workdir.trim_end_matches('/'), path)
    };
    Ok(next.commit(&d.original))
}

fn cmd(d: &Directive, state: &State) -> Result<State> {
    let mut next = state.clone();
    next.config.cmd = if d.is_json() {
        Some(d.args.clone())
    } else if d.args.is_empty() {
        None
    } else {
        Some(vec!["/bin/sh".to_string(), "-c".to_string(), d.args.join(" ")])
    };
    next.cmd_set = next.config.cmd.is_some();
    Ok(next.commit(&d.original))
}

fn entrypoint(d: &Directive, state: &State) -> Result<State> {
    let mut next = state.clone();
    next.config.entrypoint = if d.is_json() {
        Some(d.args.clone())
    } else if d.args.is_empty() {
        None
    } else {
        Some(vec!["/bin/sh".to_string(), "-c".to_string(), d.args.join(" ")])
    };
    if !next.cmd_set {
        next.config.cmd = None;
    }
    Ok(next.commit(&d.original))
}

fn expose(d: &Directive, state: &State) -> Result<State> {
    let mut next = state.clone();
    for port in &d.args {
        if !next.config.exposed_ports.contains(port) {
            next.config.exposed_ports.push(port.clone());
        }
    }
    // Sorted in the config itself, not just the commit message: the cache
    // fingerprint is computed from a serialization of `state.config`, so
    // `EXPOSE 443 80` and `EXPOSE 80 443` must leave it byte-identical too
    // (spec §8: same fingerprint regardless of EXPOSE argument order).
    next.config.exposed_ports.sort();
    Ok(next.commit(format!("EXPOSE {}", next.config.exposed_ports.join(" "))))
}

fn volume(d: &Directive, state: &State) -> Result<State> {
    let mut next = state.clone();
    for v in &d.args {
        if v.is_empty() {
            return Err(ErrorKind::user_input("VOLUME requires a non-empty path".to_string()));
        }
        if !next.config.volumes.contains(v) {
            next.config.volumes.push(v.clone());
        }
    }
    Ok(next.commit(&d.original))
}

fn user(d: &Directive, state: &State) -> Result<State> {
    let user = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("USER requires an argument".to_string()))?;
    let mut next = state.clone();
    next.config.user = user.clone();
    Ok(next.commit(&d.original))
}

fn maintainer(d: &Directive, state: &State) -> Result<State> {
    let mut next = state.clone();
    next.config.labels.insert("maintainer".to_string(), d.args.join(" "));
    Ok(next.commit(&d.original))
}

fn healthcheck(d: &Directive, state: &State) -> Result<State> {
    let mut next = state.clone();
    if d.flag("none").is_some() {
        next.config.healthcheck = Some(Healthcheck {
            test: vec!["NONE".to_string()],
            interval: None,
            timeout: None,
            retries: None,
        });
    } else {
        let test_prefix = if d.is_json() { "CMD" } else { "CMD-SHELL" };
        let mut test = vec![test_prefix.to_string()];
        test.extend(d.args.iter().cloned());
        next.config.healthcheck = Some(Healthcheck {
            test,
            interval: d.flag("interval").map(str::to_string),
            timeout: d.flag("timeout").map(str::to_string),
            retries: d.flag("retries").and_then(|r| r.parse().ok()),
        });
    }
    Ok(next.commit(&d.original))
}

fn arg(d: &Directive, state: &State) -> Result<State> {
    let name = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("ARG requires a name".to_string()))?;
    let default_value = d.args.get(1).filter(|v| !v.is_empty()).cloned();
    let mut next = state.clone();
    let resolved = next
        .build_args
        .get(name)
        .and_then(|existing| existing.value.clone())
        .or(default_value)
        .or_else(|| std::env::var(name).ok());
    next.build_args.insert(
        name.clone(),
        crate::state::BuildArg {
            value: resolved,
            declared: true,
        },
    );
    Ok(next.commit(&d.original))
}

async fn copy_or_add(
    d: &Directive,
    state: &State,
    daemon: &dyn DaemonClient,
    config: &EngineConfig,
    directive_name: &str,
) -> Result<OpOutcome> {
    if d.args.len() < 2 {
        return Err(ErrorKind::user_input(format!("{directive_name} requires at least one source and a destination")));
    }
    let (srcs, dest) = d.args.split_at(d.args.len() - 1);
    let dest = &dest[0];

    let result = copy::plan_copy(
        &config.context_dir,
        srcs,
        dest,
        directive_name == "ADD",
        &state.dockerignore,
        directive_name,
    )
    .await?;

    let Some(result) = result else {
        info!("{directive_name}: no files matched after dockerignore filtering, skipping commit");
        return Ok(no_inject(state.skip_commit()));
    };

    // As with RUN, the cache decision for this COPY/ADD is made once by the
    // Commit op against the aggregated batch it belongs to.
    let mut staged = state.clone();
    staged.config.cmd = Some(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("#(nop) {}", result.commit_message),
    ]);
    let container_id = daemon.create_container(&staged, &staged.host_config).await?;
    daemon
        .upload_to_container(&container_id, result.archive, "/")
        .await?;

    let mut next = state.with_container_id(container_id);
    next = next.commit(&result.commit_message);
    next.pending_tarsum = Some(result.tarsum.clone());
    Ok(no_inject(next))
}

async fn tag(d: &Directive, state: &State, daemon: &dyn DaemonClient, report: &mut BuildReport) -> Result<OpOutcome> {
    let reference = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("TAG requires an image reference".to_string()))?;
    if state.image_id.is_empty() {
        return Err(ErrorKind::user_input("TAG requires a preceding FROM".to_string()));
    }
    daemon.tag_image(&state.image_id, reference).await?;
    report.tagged_images.push(TaggedImage {
        reference: reference.clone(),
        image_id: state.image_id.clone(),
    });
    Ok(no_inject(state.clone()))
}

async fn push(
    d: &Directive,
    state: &State,
    daemon: &dyn DaemonClient,
    config: &EngineConfig,
    report: &mut BuildReport,
) -> Result<OpOutcome> {
    let reference = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("PUSH requires an image reference".to_string()))?;
    if state.image_id.is_empty() {
        return Err(ErrorKind::user_input("PUSH requires a preceding FROM".to_string()));
    }
    daemon.tag_image(&state.image_id, reference).await?;
    report.tagged_images.push(TaggedImage {
        reference: reference.clone(),
        image_id: state.image_id.clone(),
    });

    if !config.global_push {
        return Ok(no_inject(state.clone()));
    }

    if let Some(object_ref) = crate::artifact::objectstore::ObjectStoreRef::parse(reference) {
        let aws_config = aws_config::load_from_env().await;
        let s3 = aws_sdk_s3::Client::new(&aws_config);
        crate::artifact::objectstore::push(daemon, &s3, &config.cache_dir, &state.image_id, &object_ref).await?;
    } else {
        daemon.push_image(reference).await?;
    }
    Ok(no_inject(state.clone()))
}

async fn mount(d: &Directive, state: &State, daemon: &dyn DaemonClient) -> Result<OpOutcome> {
    let mut next = state.clone();
    for spec in &d.args {
        let parts: Vec<&str> = spec.splitn(3, ':').collect();
        match parts.as_slice() {
            [host_path, container_path] => {
                let resolved = daemon.resolve_host_path(host_path).await?;
                next.host_config.binds.push(format!("{resolved}:{container_path}"));
            }
            [host_path, container_path, "ro"] => {
                let resolved = daemon.resolve_host_path(host_path).await?;
                next.host_config.binds.push(format!("{resolved}:{container_path}:ro"));
            }
            [container_path] => {
                let name = format!("rocker-mount-{}", container_path.replace('/', "_"));
                let id = daemon
                    .ensure_container(&name, "busybox:latest", ContainerPurpose::Mount)
                    .await?;
                next.host_config.volumes_from.push(id);
            }
            _ => return Err(ErrorKind::user_input(format!("invalid MOUNT spec: {spec:?}"))),
        }
    }
    next.cache_busted = true;
    Ok(no_inject(next))
}

async fn attach(d: &Directive, state: &State, daemon: &dyn DaemonClient, config: &EngineConfig) -> Result<OpOutcome> {
    if !config.global_attach {
        return Ok(no_inject(state.skip_commit()));
    }
    if state.image_id.is_empty() {
        return Err(ErrorKind::user_input("ATTACH requires a preceding FROM".to_string()));
    }
    let mut staged = state.clone();
    if !d.args.is_empty() {
        staged.config.cmd = if d.is_json() {
            Some(d.args.clone())
        } else {
            Some(vec!["/bin/sh".to_string(), "-c".to_string(), d.args.join(" ")])
        };
    }
    staged.config.tty = true;
    staged.config.open_stdin = true;
    let container_id = daemon.create_container(&staged, &staged.host_config).await?;
    daemon.run_container(&container_id, true).await?;
    let next = state.with_container_id(container_id).commit(&d.original);
    Ok(no_inject(next))
}

async fn export(d: &Directive, state: &State, daemon: &dyn DaemonClient, config: &EngineConfig) -> Result<OpOutcome> {
    let path = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("EXPORT requires a path".to_string()))?;

    let mut next = state.clone();
    if next.exports_container_id.is_empty() {
        next.exports_container_id = crate::artifact::ensure_exports_container(daemon, &config.build_id).await?;
    }

    let local_path = std::path::Path::new(&config.context_dir).join(path.trim_start_matches('/'));
    let contents = tokio::fs::read(&local_path)
        .await
        .map_err(|e| ErrorKind::io(format!("EXPORT: reading {path}: {e}")))?;

    let export_result = crate::artifact::export_path(
        daemon,
        &next.exports_container_id,
        &next.image_id,
        path,
        &contents,
    )
    .await?;

    Ok(no_inject(next.commit(format!("EXPORT {path} ({})", export_result.content_hash))))
}

async fn import(
    d: &Directive,
    state: &State,
    daemon: &dyn DaemonClient,
    cache: &FsCache,
    config: &EngineConfig,
) -> Result<OpOutcome> {
    let src = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("IMPORT requires a source path".to_string()))?;
    let dst = d.args.get(1).unwrap_or(src);

    if state.exports_container_id.is_empty() {
        return Err(ErrorKind::user_input("IMPORT with no prior EXPORT in this build".to_string()));
    }

    let contents = crate::artifact::import_path(daemon, &state.exports_container_id, &state.image_id, src).await?;
    let cache_key = crate::artifact::import_cache_key(&hex::encode(sha2::Sha256::digest(&contents)), dst);

    let local_path = config.context_dir.join(dst.trim_start_matches('/'));
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ErrorKind::io(format!("IMPORT: creating {}: {e}", parent.display())))?;
    }
    tokio::fs::write(&local_path, &contents)
        .await
        .map_err(|e| ErrorKind::io(format!("IMPORT: writing {dst}: {e}")))?;

    let _ = cache; // the cache lookup for IMPORT is driven by `cache_key` through the surrounding RUN/COPY fingerprint, not a dedicated cache entry here
    Ok(no_inject(state.commit(format!("IMPORT {src} to {dst} ({cache_key})"))))
}

fn require(d: &Directive, state: &State) -> Result<OpOutcome> {
    let name = d
        .args
        .first()
        .ok_or_else(|| ErrorKind::user_input("REQUIRE requires a variable name".to_string()))?;
    if !state.build_args.contains_key(name) && std::env::var(name).is_err() {
        return Err(ErrorKind::user_input(format!("REQUIRE: {name} is not defined")));
    }
    Ok(no_inject(state.clone()))
}

async fn commit(
    state: &State,
    daemon: &dyn DaemonClient,
    cache: &FsCache,
    config: &EngineConfig,
    report: &mut BuildReport,
) -> Result<OpOutcome> {
    let message = state.pending_commit_message();

    if message.is_none() && state.container_id.is_empty() {
        return Ok(no_inject(state.clone()));
    }

    // The sole cache decision for this batch: keyed on the same aggregated
    // message/config/tarsum that `cache.put` below writes, so any segment —
    // not just ones that happened to run a RUN/COPY through a real
    // container — can hit the cache (spec §4.F, §8 property 3).
    let projection = match &message {
        Some(msg) => Some(OpProjection {
            commit_message: msg.clone(),
            config_projection: serde_json::to_value(&state.config).map_err(|e| ErrorKind::io(e.to_string()))?,
            tarsum: state.pending_tarsum.clone(),
        }),
        None => None,
    };

    if let Some(projection) = &projection {
        if !state.cache_busted && !config.no_reuse {
            if let Some(cached_child) = cache.get(&state.image_id, projection).await {
                report.cache_hits += 1;
                debug!(child = %cached_child, "commit cache hit");
                if !state.container_id.is_empty() {
                    daemon.remove_container(&state.container_id).await?;
                }
                let mut next = state.clone();
                next.parent_id = state.image_id.clone();
                next.image_id = cached_child;
                next.container_id = String::new();
                next.commit_log.clear();
                next.pending_tarsum = None;
                return Ok(no_inject(next));
            }
        }
        report.cache_misses += 1;
    }

    let container_id = if state.container_id.is_empty() {
        let joined = message.clone().unwrap_or_default();
        let mut staged = state.clone();
        staged.config.cmd = Some(vec!["/bin/sh".to_string(), "-c".to_string(), format!("#(nop) {joined}")]);
        daemon.create_container(&staged, &staged.host_config).await?
    } else {
        state.container_id.clone()
    };

    let mut staged = state.clone();
    staged.container_id = container_id.clone();
    let joined = message.clone().unwrap_or_default();
    let new_image_id = daemon.commit_container(&staged, &joined).await?;
    daemon.remove_container(&container_id).await?;

    if let Some(projection) = &projection {
        cache.put(&state.image_id, projection, &new_image_id).await;
    }

    let mut next = state.clone();
    next.parent_id = state.image_id.clone();
    next.image_id = new_image_id;
    next.container_id = String::new();
    next.commit_log.clear();
    next.pending_tarsum = None;
    next.produced_image = true;

    Ok(no_inject(next))
}

async fn cleanup(
    state: &State,
    daemon: &dyn DaemonClient,
    config: &EngineConfig,
    tagged: bool,
    final_: bool,
) -> Result<OpOutcome> {
    let mut next = state.clone();

    if !state.exports_container_id.is_empty() && final_ {
        crate::artifact::cleanup_exports_container(daemon, &state.exports_container_id, config.persist_exports)
            .await?;
        next.exports_container_id = String::new();
    }

    if !tagged {
        if config.no_garbage && state.produced_image && !state.image_id.is_empty() {
            daemon.remove_image(&state.image_id).await?;
        }
    }

    if !final_ {
        next.image_id = String::new();
    }

    Ok(no_inject(next))
}
