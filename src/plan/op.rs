//! The `Op` tree produced by the plan compiler (spec §3, §4.C).

use serde::{Deserialize, Serialize};

use crate::parser::Directive;

/// One primitive step of a compiled [`super::Plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    From(Directive),
    Run(Directive),
    Env(Directive),
    Label(Directive),
    Workdir(Directive),
    Cmd(Directive),
    Entrypoint(Directive),
    Expose(Directive),
    Volume(Directive),
    User(Directive),
    Copy(Directive),
    Add(Directive),
    Tag(Directive),
    Push(Directive),
    Mount(Directive),
    Attach(Directive),
    Export(Directive),
    Import(Directive),
    Require(Directive),
    Maintainer(Directive),
    Healthcheck(Directive),
    Arg(Directive),
    /// A directive inherited from the base image's ONBUILD triggers,
    /// wrapping the primitive it would otherwise compile to.
    OnbuildWrap(Box<Op>),
    /// Seals buffered state mutations into a new image.
    Commit,
    /// Closes a FROM segment. `tagged` reflects whether a TAG/PUSH occurred
    /// in the segment; `final_` marks the last Cleanup in the whole Plan.
    Cleanup { tagged: bool, final_: bool },
}

impl Op {
    /// The directive this Op was compiled from, if any (Commit/Cleanup have
    /// none).
    pub fn directive(&self) -> Option<&Directive> {
        match self {
            Op::From(d)
            | Op::Run(d)
            | Op::Env(d)
            | Op::Label(d)
            | Op::Workdir(d)
            | Op::Cmd(d)
            | Op::Entrypoint(d)
            | Op::Expose(d)
            | Op::Volume(d)
            | Op::User(d)
            | Op::Copy(d)
            | Op::Add(d)
            | Op::Tag(d)
            | Op::Push(d)
            | Op::Mount(d)
            | Op::Attach(d)
            | Op::Export(d)
            | Op::Import(d)
            | Op::Require(d)
            | Op::Maintainer(d)
            | Op::Healthcheck(d)
            | Op::Arg(d) => Some(d),
            Op::OnbuildWrap(inner) => inner.directive(),
            Op::Commit | Op::Cleanup { .. } => None,
        }
    }

    /// Whether this Op, if it mutates state, requires a subsequent Commit to
    /// seal the change (spec §4.C rule 2).
    pub fn is_state_mutating(&self) -> bool {
        matches!(
            self,
            Op::Env(_)
                | Op::Label(_)
                | Op::Workdir(_)
                | Op::User(_)
                | Op::Cmd(_)
                | Op::Entrypoint(_)
                | Op::Expose(_)
                | Op::Volume(_)
                | Op::Healthcheck(_)
                | Op::Maintainer(_)
                | Op::Arg(_)
                | Op::Copy(_)
                | Op::Add(_)
                | Op::Run(_)
                | Op::Attach(_)
        ) || matches!(self, Op::OnbuildWrap(inner) if inner.is_state_mutating())
    }
}

/// The compiled sequence of Ops for an entire Rockerfile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub ops: Vec<Op>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Op) {
        self.ops.push(op);
    }
}
