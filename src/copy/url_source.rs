//! URL sources for `ADD` (spec §4.G step 3): download to a temp file, set
//! its mtime from the `Last-Modified` response header, and let the caller
//! fold it into the regular tar-building path as a single-entry source.

use std::path::PathBuf;

use tracing::debug;

use crate::error::{ErrorKind, Result};

pub fn is_url(src: &str) -> bool {
    src.starts_with("http://") || src.starts_with("https://")
}

/// A fetched URL source plus the cache-key material from spec §4.G step 3:
/// the etag (if the server sent one) combined with the tarsum computed once
/// the file lands in the tar stream.
#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub path: PathBuf,
    pub etag: Option<String>,
}

/// Downloads `url` and returns the local temp file path, after applying the
/// server's `Last-Modified` timestamp to the file's mtime.
pub async fn fetch_url_source(url: &str) -> Result<PathBuf> {
    let client = reqwest::Client::new();
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ErrorKind::collaborator("add_url_fetch", e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ErrorKind::user_input(format!(
            "ADD: fetching {url} returned HTTP {status}"
        )));
    }

    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok());

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ErrorKind::collaborator("add_url_fetch", e))?;

    let mut tmp_path = std::env::temp_dir();
    tmp_path.push(format!("rocker-add-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp_path, &bytes).map_err(|e| ErrorKind::io(format!("writing ADD temp file: {e}")))?;

    if let Some(mtime) = last_modified {
        let mtime_ft = filetime::FileTime::from_system_time(mtime);
        filetime::set_file_mtime(&tmp_path, mtime_ft)
            .map_err(|e| ErrorKind::io(format!("setting ADD temp file mtime: {e}")))?;
    }

    debug!(%url, etag = ?etag, "fetched ADD URL source");
    Ok(tmp_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_urls() {
        assert!(is_url("https://example.com/file.tar.gz"));
        assert!(is_url("http://example.com/file"));
        assert!(!is_url("./local/path"));
        assert!(!is_url("relative/file.txt"));
    }
}
