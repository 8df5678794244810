//! `rocker`: a declarative, cache-aware container image build engine.
//!
//! A Rockerfile is parsed ([`parser`]), template-expanded ([`template`]),
//! compiled into a flat [`plan::Plan`] of [`plan::Op`]s ([`plan`]), and
//! executed by [`engine::run_build`] against a [`daemon::DaemonClient`],
//! consulting [`cache::FsCache`] between mutating Ops.

pub mod artifact;
pub mod cache;
pub mod cancel;
pub mod cli;
pub mod copy;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod logging;
pub mod parser;
pub mod plan;
pub mod rockerfile;
pub mod state;
pub mod template;

pub use error::{ErrorKind, Result};
