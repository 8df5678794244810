//! The immutable per-step [`State`] snapshot (spec §3, §4.D).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::parser::Directive;

/// Dropped by [`State::commit`] before the join; its presence still counts
/// as "there is something to commit" so that a lone SkipCommit still forces
/// a Commit op to run (and potentially clear a stale containerID).
pub const COMMIT_SKIP: &str = "\u{0}COMMIT_SKIP\u{0}";

/// Container-side configuration, mirroring the fields `CreateContainer` and
/// `CommitContainer` need from the daemon client (spec §3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub workdir: String,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub user: String,
    pub healthcheck: Option<Healthcheck>,
    /// Set only by ATTACH, which (unlike RUN) forces a TTY and an open
    /// stdin on the container it creates (spec §4.E ATTACH).
    pub tty: bool,
    pub open_stdin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
}

/// Host-side configuration: bind mounts and reusable data-volume containers
/// (spec §3, populated by MOUNT).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub binds: Vec<String>,
    pub volumes_from: Vec<String>,
}

/// A build-arg binding; `declared` is true once an `ARG` directive has
/// introduced the name, distinguishing it from an override supplied on the
/// CLI for a name the Rockerfile never declares (spec §3, §6 Environment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArg {
    pub value: Option<String>,
    pub declared: bool,
}

/// Immutable snapshot of the build threaded through [`crate::plan::Op`]s.
/// Every Op consumes a `&State` and returns a fresh `State`; nothing here is
/// mutated in place (spec §4.D, §9).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub config: ContainerConfig,
    pub host_config: HostConfig,

    pub image_id: String,
    pub parent_id: String,
    pub container_id: String,
    pub exports_container_id: String,

    pub commit_log: Vec<String>,
    pub produced_image: bool,
    pub cmd_set: bool,
    pub cache_busted: bool,

    pub inject_commands: Vec<Directive>,
    pub dockerignore: Vec<String>,
    pub build_args: BTreeMap<String, BuildArg>,

    /// The tarsum of a pending COPY/ADD commit, carried from the mutating Op
    /// through to the next Commit so its fingerprint can include it (spec
    /// §4.F: "COPY/ADD's cache key additionally incorporates the tarsum").
    pub pending_tarsum: Option<String>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `msg` to the commit log in insertion order (spec §4.D: "insertion
    /// order is required so history reflects directive order").
    pub fn commit(&self, msg: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.commit_log.push(msg.into());
        next
    }

    /// Appends the [`COMMIT_SKIP`] sentinel: the Commit op will drop this
    /// entry from the joined message but still treats the log as non-empty.
    pub fn skip_commit(&self) -> Self {
        self.commit(COMMIT_SKIP)
    }

    /// The joined, sentinel-free commit message for a pending Commit op, or
    /// `None` if there is nothing to commit.
    pub fn pending_commit_message(&self) -> Option<String> {
        let real: Vec<&str> = self
            .commit_log
            .iter()
            .map(String::as_str)
            .filter(|m| *m != COMMIT_SKIP)
            .collect();
        if real.is_empty() {
            None
        } else {
            Some(real.join("; "))
        }
    }

    /// Compares the cache-relevant projection of two states: everything that
    /// feeds the build cache fingerprint, ignoring ephemeral identifiers like
    /// `container_id` (spec §4.D).
    pub fn cache_projection_eq(&self, other: &State) -> bool {
        self.config == other.config
            && self.host_config == other.host_config
            && self.commit_log == other.commit_log
    }

    /// Returns a copy with `container_id` set, used by primitives that spawn
    /// an ephemeral work container ahead of a Commit.
    pub fn with_container_id(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.container_id = id.into();
        next
    }

    pub fn with_image_id(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.image_id = id.into();
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_insertion_ordered() {
        let s = State::new().commit("ENV a=1").commit("ENV b=2");
        assert_eq!(s.commit_log, vec!["ENV a=1", "ENV b=2"]);
        assert_eq!(
            s.pending_commit_message().unwrap(),
            "ENV a=1; ENV b=2"
        );
    }

    #[test]
    fn skip_commit_sentinel_dropped_from_message() {
        let s = State::new().skip_commit();
        assert_eq!(s.commit_log, vec![COMMIT_SKIP]);
        assert_eq!(s.pending_commit_message(), None);
    }

    #[test]
    fn skip_commit_mixed_with_real_commit() {
        let s = State::new().skip_commit().commit("RUN true");
        assert_eq!(s.pending_commit_message().unwrap(), "RUN true");
    }

    #[test]
    fn original_untouched_by_returned_copy() {
        let s0 = State::new();
        let s1 = s0.commit("ENV a=1");
        assert!(s0.commit_log.is_empty());
        assert_eq!(s1.commit_log.len(), 1);
    }
}
