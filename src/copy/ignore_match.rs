//! Dockerignore pattern matching, built on the `ignore` crate's gitignore
//! matcher (spec §4.G step 1).

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{ErrorKind, Result};

/// Compiles a dockerignore pattern list (in directive order) against a root
/// directory, the same semantics `.dockerignore` uses: later patterns can
/// re-include paths excluded by earlier ones via a leading `!`.
pub fn build_matcher(root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| ErrorKind::user_input(format!("invalid dockerignore pattern {pattern:?}: {e}")))?;
    }
    builder
        .build()
        .map_err(|e| ErrorKind::user_input(format!("compiling dockerignore patterns: {e}")))
}

pub fn is_ignored(matcher: &Gitignore, path: &Path, is_dir: bool) -> bool {
    matcher.matched(path, is_dir).is_ignore()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn simple_exclude() {
        let root = PathBuf::from("/ctx");
        let m = build_matcher(&root, &["*.log".to_string()]).unwrap();
        assert!(is_ignored(&m, &root.join("debug.log"), false));
        assert!(!is_ignored(&m, &root.join("main.rs"), false));
    }

    #[test]
    fn reinclude_with_bang() {
        let root = PathBuf::from("/ctx");
        let m = build_matcher(
            &root,
            &["*.log".to_string(), "!keep.log".to_string()],
        )
        .unwrap();
        assert!(is_ignored(&m, &root.join("debug.log"), false));
        assert!(!is_ignored(&m, &root.join("keep.log"), false));
    }
}
