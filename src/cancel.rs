//! Cancellation plumbing (spec §5: "Cancellation and timeouts").
//!
//! Generalizes `super_orchestrator::misc::CtrlCTask`: a background task sets
//! a shared flag when `ctrl_c`/SIGTERM is observed, and the engine's Op loop
//! polls the flag between Ops (the same granularity at which
//! `ContainerNetwork::wait_with_timeout` polls its runners).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::warn;

use crate::error::Result;

/// Shared between the signal-handling task and the engine's Op loop.
#[derive(Debug, Clone)]
pub struct CancelGuard {
    flag: Arc<AtomicBool>,
}

impl Default for CancelGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelGuard {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Installs a process-wide `ctrlc` handler that flips this guard's flag.
    /// Safe to call once per process; a second call is a no-op (mirrors
    /// `ctrlc::set_handler`'s own "already set" error, which we swallow).
    pub fn install(&self) -> Result<()> {
        let flag = self.flag.clone();
        let res = ctrlc::set_handler(move || {
            warn!("received interrupt signal, requesting cancellation of the current build");
            flag.store(true, Ordering::SeqCst);
        });
        if let Err(e) = res {
            warn!("could not install ctrl-c handler (already installed?): {e}");
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Used by tests to simulate an interrupt without touching process
    /// signal state.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}
