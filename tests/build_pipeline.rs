//! Black-box pipeline tests: Rockerfile text -> parse -> compile -> execute
//! against `MockDaemonClient`, exercising the concrete scenarios and
//! cross-module properties the engine is expected to satisfy end to end.

use rocker::cache::FsCache;
use rocker::daemon::{ImageInfo, MockDaemonClient};
use rocker::engine::{self, EngineConfig};
use rocker::parser;

fn config(context_dir: &std::path::Path, cache_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        context_dir: context_dir.to_path_buf(),
        cache_dir: cache_dir.to_path_buf(),
        build_id: "test".to_string(),
        ..Default::default()
    }
}

async fn build(
    text: &str,
    daemon: &MockDaemonClient,
    cache: &FsCache,
    context_dir: &std::path::Path,
) -> rocker::Result<engine::BuildReport> {
    let directives = parser::parse(text)?;
    let plan = rocker::plan::compile(&directives)?;
    let cfg = config(context_dir, &context_dir.join(".cache"));
    let cancel = rocker::cancel::CancelGuard::new();
    engine::run_build(&plan, daemon, cache, &cfg, &cancel).await
}

#[tokio::test]
async fn from_and_tag_produces_a_tagged_image() {
    let daemon = MockDaemonClient::new();
    daemon.seed_image(
        "alpine",
        ImageInfo {
            id: "sha256:alpine-base".to_string(),
            ..Default::default()
        },
    );
    let tmp = tempfile::tempdir().unwrap();
    let cache = FsCache::new(tmp.path().join(".cache"));

    let report = build("FROM alpine\nTAG rocker_tag\n", &daemon, &cache, tmp.path())
        .await
        .unwrap();

    assert_eq!(report.tagged_images.len(), 1);
    assert_eq!(report.tagged_images[0].reference, "rocker_tag");
    assert!(daemon.tags().iter().any(|(_, r)| r == "rocker_tag"));
}

#[tokio::test]
async fn repeated_builds_hit_the_cache() {
    let daemon = MockDaemonClient::new();
    daemon.seed_image(
        "alpine",
        ImageInfo {
            id: "sha256:alpine-base".to_string(),
            ..Default::default()
        },
    );
    let tmp = tempfile::tempdir().unwrap();
    let cache = FsCache::new(tmp.path().join(".cache"));
    let text = "FROM alpine\nRUN echo hello\nENV FOO=bar\n";

    let first = build(text, &daemon, &cache, tmp.path()).await.unwrap();
    let second = build(text, &daemon, &cache, tmp.path()).await.unwrap();

    assert_eq!(first.cache_misses, second.cache_hits);
    assert!(second.cache_hits > 0, "second identical build should hit the cache");
    assert_eq!(second.cache_misses, 0);
}

#[tokio::test]
async fn mount_busts_the_cache_for_later_ops() {
    let daemon = MockDaemonClient::new();
    daemon.seed_image(
        "alpine",
        ImageInfo {
            id: "sha256:alpine-base".to_string(),
            ..Default::default()
        },
    );
    let tmp = tempfile::tempdir().unwrap();
    let cache = FsCache::new(tmp.path().join(".cache"));

    let without_mount = "FROM alpine\nRUN echo hello\n";
    let with_mount = "FROM alpine\nMOUNT /tmp/data:/data\nRUN echo hello\n";

    build(without_mount, &daemon, &cache, tmp.path()).await.unwrap();
    let mounted = build(with_mount, &daemon, &cache, tmp.path()).await.unwrap();

    assert_eq!(mounted.cache_misses, 1, "a MOUNT ahead of RUN must prevent reuse of the unmounted RUN's cache entry");
}

#[tokio::test]
async fn expose_ports_are_order_independent_for_caching() {
    let daemon = MockDaemonClient::new();
    daemon.seed_image(
        "alpine",
        ImageInfo {
            id: "sha256:alpine-base".to_string(),
            ..Default::default()
        },
    );
    let tmp = tempfile::tempdir().unwrap();
    let cache = FsCache::new(tmp.path().join(".cache"));

    let a = build("FROM alpine\nEXPOSE 8080 443\n", &daemon, &cache, tmp.path()).await.unwrap();
    let b = build("FROM alpine\nEXPOSE 443 8080\n", &daemon, &cache, tmp.path()).await.unwrap();

    assert_eq!(a.cache_misses, 1);
    assert_eq!(b.cache_hits, 1, "EXPOSE in a different order must still hit the same cache entry");
}

#[tokio::test]
async fn no_cache_flag_forces_misses_but_still_writes() {
    let daemon = MockDaemonClient::new();
    daemon.seed_image(
        "alpine",
        ImageInfo {
            id: "sha256:alpine-base".to_string(),
            ..Default::default()
        },
    );
    let tmp = tempfile::tempdir().unwrap();
    let text = "FROM alpine\nRUN echo hello\n";

    let plain_cache = FsCache::new(tmp.path().join(".cache"));
    build(text, &daemon, &plain_cache, tmp.path()).await.unwrap();
    let second = build(text, &daemon, &plain_cache, tmp.path()).await.unwrap();
    assert_eq!(second.cache_hits, 1);

    let no_read_cache = FsCache::new(tmp.path().join(".cache")).no_cache();
    let third = build(text, &daemon, &no_read_cache, tmp.path()).await.unwrap();
    assert_eq!(third.cache_misses, 1, "--no-cache must force a miss even though a valid entry exists");
}

#[tokio::test]
async fn copy_with_no_matching_files_skips_the_commit() {
    let daemon = MockDaemonClient::new();
    daemon.seed_image(
        "alpine",
        ImageInfo {
            id: "sha256:alpine-base".to_string(),
            ..Default::default()
        },
    );
    let tmp = tempfile::tempdir().unwrap();
    let cache = FsCache::new(tmp.path().join(".cache"));

    let report = build("FROM alpine\nCOPY nonexistent-*.txt /dest/\n", &daemon, &cache, tmp.path())
        .await
        .unwrap();

    assert_eq!(report.cache_misses, 0, "a COPY matching zero files must not produce a commit at all");
}

#[tokio::test]
async fn export_then_import_round_trips_file_contents() {
    let daemon = MockDaemonClient::new();
    daemon.seed_image(
        "alpine",
        ImageInfo {
            id: "sha256:alpine-base".to_string(),
            ..Default::default()
        },
    );
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("payload.txt"), b"exported contents").unwrap();
    let cache = FsCache::new(tmp.path().join(".cache"));

    build(
        "FROM alpine\nCOPY payload.txt /payload.txt\nEXPORT /payload.txt\nIMPORT /payload.txt /imported.txt\n",
        &daemon,
        &cache,
        tmp.path(),
    )
    .await
    .unwrap();

    let imported = std::fs::read(tmp.path().join("imported.txt")).unwrap();
    assert_eq!(imported, b"exported contents");
}
