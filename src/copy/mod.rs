//! Copy/Tar subsystem (spec §4.G): expands COPY/ADD sources into a
//! deterministic tar stream ready for upload to a staging container.

mod ignore_match;
mod tar;
mod url_source;

pub use tar::{build_deterministic_tar, TarEntry};
pub use url_source::fetch_url_source;

use std::path::{Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// The resolved outcome of one `COPY`/`ADD` directive, ready for upload.
#[derive(Debug, Clone)]
pub struct CopyResult {
    pub archive: Vec<u8>,
    pub tarsum: String,
    pub commit_message: String,
    pub dest: String,
}

/// `COPY src... dest` / `ADD src... dest` (spec §4.G). `context_dir` anchors
/// relative globs; `dockerignore` is the ordered pattern list from the
/// current [`crate::state::State`]. `is_add` enables URL sources. Returns
/// `Ok(None)` when the expanded file set is empty after dockerignore
/// filtering — the caller must emit `SkipCommit` in that case (spec §9).
pub async fn plan_copy(
    context_dir: &Path,
    srcs: &[String],
    dest: &str,
    is_add: bool,
    dockerignore: &[String],
    directive_name: &str,
) -> Result<Option<CopyResult>> {
    let dest_is_dir_form = dest.ends_with('/') || dest == "." || dest == "/";

    if srcs.len() > 1 && !dest_is_dir_form {
        return Err(ErrorKind::user_input(format!(
            "{directive_name}: multiple sources require a destination ending in '/' (got {dest:?})"
        )));
    }

    let matcher = ignore_match::build_matcher(context_dir, dockerignore)?;
    let mut entries: Vec<TarEntry> = Vec::new();
    let mut seen: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

    for src in srcs {
        if is_add && url_source::is_url(src) {
            let fetched = url_source::fetch_url_source(src).await?;
            let tar_path = strip_leading_slash(dest.trim_end_matches('/'));
            if seen.insert(tar_path.clone()) {
                entries.push(TarEntry {
                    tar_path,
                    source_path: fetched,
                });
            }
            continue;
        }

        for (tar_path, abs_path) in expand_src(context_dir, src, dest, srcs.len() > 1)? {
            if ignore_match::is_ignored(&matcher, &abs_path, abs_path.is_dir()) {
                continue;
            }
            if abs_path.is_symlink() && std::fs::metadata(&abs_path).is_err() {
                continue; // dangling symlink
            }
            if seen.insert(tar_path.clone()) {
                entries.push(TarEntry {
                    tar_path,
                    source_path: abs_path,
                });
            }
        }
    }

    entries.sort_by(|a, b| a.tar_path.cmp(&b.tar_path));

    if entries.is_empty() {
        return Ok(None);
    }

    let (archive, tarsum) = build_deterministic_tar(&entries)?;
    let commit_message = format!(
        "{} {} to {}",
        directive_name,
        tarsum,
        dest
    );

    Ok(Some(CopyResult {
        archive,
        tarsum,
        commit_message,
        dest: dest.to_string(),
    }))
}

/// Expands one glob/plain source into `(tar_path, absolute_source_path)`
/// pairs, applying the destination-handling rules of spec §4.G step 2.
fn expand_src(
    context_dir: &Path,
    src: &str,
    dest: &str,
    multi_source: bool,
) -> Result<Vec<(String, PathBuf)>> {
    let pattern = context_dir.join(src);
    let pattern_str = pattern.to_string_lossy().into_owned();
    let is_wildcard = src.contains('*') || src.contains('?') || src.contains('[');

    let mut matches: Vec<PathBuf> = Vec::new();
    if is_wildcard {
        for entry in glob::glob(&pattern_str)
            .map_err(|e| ErrorKind::user_input(format!("invalid glob {src:?}: {e}")))?
        {
            matches.push(entry.map_err(|e| ErrorKind::io(e.to_string()))?);
        }
    } else if pattern.exists() {
        matches.push(pattern.clone());
    } else {
        return Err(ErrorKind::user_input(format!(
            "source {src:?} does not exist under the build context"
        )));
    }

    let common_prefix = if is_wildcard {
        // strip the wildcard pattern's directory portion
        Path::new(src)
            .parent()
            .map(|p| context_dir.join(p))
            .unwrap_or_else(|| context_dir.to_path_buf())
    } else {
        pattern
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| context_dir.to_path_buf())
    };

    let mut out = Vec::new();
    for m in matches {
        if m.is_dir() {
            for walk_entry in walkdir::WalkDir::new(&m).into_iter() {
                let walk_entry = walk_entry.map_err(|e| ErrorKind::io(e.to_string()))?;
                if walk_entry.file_type().is_dir() {
                    continue;
                }
                let rel = walk_entry
                    .path()
                    .strip_prefix(&common_prefix)
                    .unwrap_or(walk_entry.path());
                let tar_path = join_dest(dest, rel, multi_source, false);
                out.push((tar_path, walk_entry.path().to_path_buf()));
            }
        } else {
            let rel = m.strip_prefix(&common_prefix).unwrap_or(&m);
            let single_file_rename =
                !multi_source && !is_wildcard && !dest.ends_with('/') && dest != "." && dest != "/";
            let tar_path = if single_file_rename {
                strip_leading_slash(dest)
            } else {
                join_dest(dest, rel, multi_source, true)
            };
            out.push((tar_path, m));
        }
    }
    Ok(out)
}

fn join_dest(dest: &str, rel: &Path, _multi_source: bool, _single_file: bool) -> String {
    let base = dest.trim_end_matches('/');
    let rel_str = rel.to_string_lossy();
    if base.is_empty() || base == "." {
        strip_leading_slash(&rel_str)
    } else {
        strip_leading_slash(&format!("{base}/{rel_str}"))
    }
}

fn strip_leading_slash(p: &str) -> String {
    p.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn single_file_rename() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("Rockerfile");
        std::fs::File::create(&file_path).unwrap().write_all(b"FROM alpine").unwrap();

        let result = plan_copy(dir.path(), &["Rockerfile".to_string()], "/Rockerfile", false, &[], "COPY")
            .await
            .unwrap()
            .unwrap();
        assert!(result.commit_message.starts_with("COPY "));
        assert!(result.commit_message.ends_with("to /Rockerfile"));

        let (_, tarsum) = build_deterministic_tar(&[TarEntry {
            tar_path: "Rockerfile".to_string(),
            source_path: file_path,
        }])
        .unwrap();
        assert!(result.tarsum.contains(&tarsum["tarsum.v1+sha256:".len()..][..8]));
    }

    #[tokio::test]
    async fn zero_matches_after_ignore_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.log"), b"x").unwrap();
        let result = plan_copy(
            dir.path(),
            &["secret.log".to_string()],
            "/dest/",
            false,
            &["*.log".to_string()],
            "COPY",
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn multi_source_requires_trailing_slash_dest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        std::fs::write(dir.path().join("b"), b"b").unwrap();
        let err = plan_copy(
            dir.path(),
            &["a".to_string(), "b".to_string()],
            "/dest",
            false,
            &[],
            "COPY",
        )
        .await;
        assert!(err.is_err());
    }
}
