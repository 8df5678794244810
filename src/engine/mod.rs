//! Execution engine (spec §4.E): drives a compiled [`crate::plan::Plan`]
//! against a [`DaemonClient`], threading an immutable [`State`] through each
//! Op and consulting the build cache between mutating Ops.

mod ops;

pub use ops::EngineConfig;

use tracing::{info, info_span, warn};

use crate::cache::FsCache;
use crate::cancel::CancelGuard;
use crate::daemon::DaemonClient;
use crate::error::{ErrorKind, Result};
use crate::plan::{compile_segment, Op, Plan};
use crate::state::State;

/// One produced, tagged image — the externally visible result of a build.
#[derive(Debug, Clone)]
pub struct TaggedImage {
    pub reference: String,
    pub image_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub tagged_images: Vec<TaggedImage>,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// Drives `plan` to completion. Segments that already produced intermediate
/// images are still cleaned up even after a fatal error further along (spec
/// §7 propagation policy) — callers that need partial results on error
/// should inspect the `Err`'s stacked context.
pub async fn run_build(
    plan: &Plan,
    daemon: &dyn DaemonClient,
    cache: &FsCache,
    config: &EngineConfig,
    cancel: &CancelGuard,
) -> Result<BuildReport> {
    let mut state = State::new();
    let mut report = BuildReport::default();
    let mut cleanup_stack: Vec<State> = Vec::new();
    // Owned, mutable working copy: ONBUILD injection (spec §4.C rule 6)
    // splices directly into this vector rather than recursing.
    let mut working_ops = plan.ops.clone();

    let mut i = 0;
    while i < working_ops.len() {
        if cancel.is_cancelled() {
            run_best_effort_cleanup(daemon, &cleanup_stack, &state).await;
            return Err(ErrorKind::cancelled());
        }

        let op = working_ops[i].clone();
        let span = info_span!("op", op = op_label(&op));
        let _enter = span.enter();

        match ops::apply(&op, &state, daemon, cache, config, &mut report).await {
            Ok(ops::OpOutcome { next_state, injected }) => {
                state = next_state;
                if let Op::From(_) = op {
                    cleanup_stack.push(state.clone());
                }
                if let Some(triggers) = injected {
                    // The base image carried ONBUILD triggers: splice their
                    // compiled Ops in right after this FROM (spec §4.C rule 6).
                    let injected_ops = compile_segment(&triggers)?;
                    splice_after(&mut working_ops, i, injected_ops);
                }
            }
            Err(e) => {
                warn!("op failed, running best-effort cleanup for produced segments: {e}");
                run_best_effort_cleanup(daemon, &cleanup_stack, &state).await;
                return Err(e);
            }
        }

        i += 1;
    }

    info!(tagged = report.tagged_images.len(), "build finished");
    Ok(report)
}

fn splice_after(ops: &mut Vec<Op>, index: usize, injected: Vec<Op>) {
    for (offset, op) in injected.into_iter().enumerate() {
        ops.insert(index + 1 + offset, op);
    }
}

async fn run_best_effort_cleanup(daemon: &dyn DaemonClient, cleanup_stack: &[State], current: &State) {
    for state in cleanup_stack.iter().chain(std::iter::once(current)) {
        if !state.container_id.is_empty() {
            if let Err(e) = daemon.remove_container(&state.container_id).await {
                warn!("cleanup: failed to remove container {}: {e}", state.container_id);
            }
        }
        if !state.exports_container_id.is_empty() {
            if let Err(e) = daemon.remove_container(&state.exports_container_id).await {
                warn!(
                    "cleanup: failed to remove exports container {}: {e}",
                    state.exports_container_id
                );
            }
        }
    }
}

fn op_label(op: &Op) -> &'static str {
    match op {
        Op::From(_) => "From",
        Op::Run(_) => "Run",
        Op::Env(_) => "Env",
        Op::Label(_) => "Label",
        Op::Workdir(_) => "Workdir",
        Op::Cmd(_) => "Cmd",
        Op::Entrypoint(_) => "Entrypoint",
        Op::Expose(_) => "Expose",
        Op::Volume(_) => "Volume",
        Op::User(_) => "User",
        Op::Copy(_) => "Copy",
        Op::Add(_) => "Add",
        Op::Tag(_) => "Tag",
        Op::Push(_) => "Push",
        Op::Mount(_) => "Mount",
        Op::Attach(_) => "Attach",
        Op::Export(_) => "Export",
        Op::Import(_) => "Import",
        Op::Require(_) => "Require",
        Op::Maintainer(_) => "Maintainer",
        Op::Healthcheck(_) => "Healthcheck",
        Op::Arg(_) => "Arg",
        Op::OnbuildWrap(_) => "OnbuildWrap",
        Op::Commit => "Commit",
        Op::Cleanup { .. } => "Cleanup",
    }
}
