//! Deterministic tar construction and the v1 tarsum (spec §4.G step 4),
//! generalizing `SuperTarballWrapper`'s thin `tar::Builder` wrapper into one
//! that also tracks hardlinks and computes a stable content hash.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, Result};

/// One file staged for inclusion in the tar stream, already resolved to its
/// final in-tar path.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub tar_path: String,
    pub source_path: std::path::PathBuf,
}

/// Builds a tar archive from `entries` (already sorted by the caller for
/// determinism) and returns the archive bytes alongside the v1 tarsum.
///
/// Determinism means: entries visited in a fixed (caller-supplied, typically
/// lexicographic) order, fixed mtime/uid/gid, a hardlink table so identical
/// inodes are emitted once as a `Link` entry, and `security.capability`
/// xattrs preserved via a PAX extension record.
pub fn build_deterministic_tar(entries: &[TarEntry]) -> Result<(Vec<u8>, String)> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);

    let mut seen_inodes: BTreeMap<u64, String> = BTreeMap::new();
    let mut hasher = Sha256::new();
    // v1 tarsum: cumulative chain over (running digest || header-relevant
    // fields || payload) per entry, visited in the caller's canonical order.
    let mut running = [0u8; 32];

    for entry in entries {
        let metadata = fs::symlink_metadata(&entry.source_path)
            .map_err(|e| ErrorKind::io(format!("stat {}: {e}", entry.source_path.display())))?;

        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&entry.source_path)
                .map_err(|e| ErrorKind::io(format!("readlink {}: {e}", entry.source_path.display())))?;
            if !target.is_absolute() {
                let resolved = entry
                    .source_path
                    .parent()
                    .map(|p| p.join(&target))
                    .unwrap_or(target.clone());
                if fs::symlink_metadata(&resolved).is_err() {
                    // dangling symlink: skip (spec §4.G step 1)
                    continue;
                }
            }
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_mtime(0);
            header.set_cksum();
            builder
                .append_link(&mut header, &entry.tar_path, &target)
                .map_err(|e| ErrorKind::io(format!("tar append symlink {}: {e}", entry.tar_path)))?;
            hash_entry(&mut hasher, &mut running, &entry.tar_path, &[], 0o777);
            continue;
        }

        if metadata.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(normalized_mode(&metadata));
            header.set_mtime(0);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}/", entry.tar_path.trim_end_matches('/')), std::io::empty())
                .map_err(|e| ErrorKind::io(format!("tar append dir {}: {e}", entry.tar_path)))?;
            hash_entry(&mut hasher, &mut running, &entry.tar_path, &[], header.mode().unwrap_or(0o755));
            continue;
        }

        // named pipes and other special files are skipped (spec §4.G step 1)
        if !metadata.is_file() {
            continue;
        }

        let inode = metadata.ino();
        if let Some(existing_path) = seen_inodes.get(&inode) {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Link);
            header.set_size(0);
            header.set_mtime(0);
            header.set_cksum();
            builder
                .append_link(&mut header, &entry.tar_path, existing_path)
                .map_err(|e| ErrorKind::io(format!("tar append hardlink {}: {e}", entry.tar_path)))?;
            hash_entry(&mut hasher, &mut running, &entry.tar_path, &[], 0);
            continue;
        }
        seen_inodes.insert(inode, entry.tar_path.clone());

        let mut contents = Vec::new();
        fs::File::open(&entry.source_path)
            .and_then(|mut f| f.read_to_end(&mut contents))
            .map_err(|e| ErrorKind::io(format!("reading {}: {e}", entry.source_path.display())))?;

        let mode = normalized_mode(&metadata);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(mode);
        header.set_mtime(0);
        header.set_cksum();

        if let Some(capability_xattr) = read_capability_xattr(&entry.source_path) {
            let mut pax = std::collections::BTreeMap::new();
            pax.insert(
                "SCHILY.xattr.security.capability".to_string(),
                String::from_utf8_lossy(&capability_xattr).into_owned(),
            );
            let pax_data: Vec<(&str, &[u8])> = pax
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_bytes()))
                .collect();
            builder
                .append_pax_extensions(pax_data)
                .map_err(|e| ErrorKind::io(format!("tar pax extension for {}: {e}", entry.tar_path)))?;
        }

        builder
            .append_data(&mut header, &entry.tar_path, contents.as_slice())
            .map_err(|e| ErrorKind::io(format!("tar append file {}: {e}", entry.tar_path)))?;
        hash_entry(&mut hasher, &mut running, &entry.tar_path, &contents, mode);
    }

    let archive = builder
        .into_inner()
        .map_err(|e| ErrorKind::io(format!("finalizing tar archive: {e}")))?;

    let tarsum = format!("tarsum.v1+sha256:{}", hex::encode(running));
    let _ = hasher; // the running chain is the tarsum; the plain hasher was scratch space
    Ok((archive, tarsum))
}

fn normalized_mode(metadata: &fs::Metadata) -> u32 {
    metadata.mode() & 0o7777
}

fn read_capability_xattr(path: &Path) -> Option<Vec<u8>> {
    xattr::get(path, "security.capability").ok().flatten()
}

fn hash_entry(hasher: &mut Sha256, running: &mut [u8; 32], path: &str, contents: &[u8], mode: u32) {
    hasher.update(*running);
    hasher.update(path.as_bytes());
    hasher.update(mode.to_le_bytes());
    hasher.update(contents);
    let digest = hasher.clone().finalize();
    running.copy_from_slice(&digest);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn deterministic_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::File::create(&file_path).unwrap().write_all(b"hello").unwrap();

        let entries = vec![TarEntry {
            tar_path: "a.txt".to_string(),
            source_path: file_path.clone(),
        }];

        let (archive1, sum1) = build_deterministic_tar(&entries).unwrap();
        let (archive2, sum2) = build_deterministic_tar(&entries).unwrap();
        assert_eq!(archive1, archive2);
        assert_eq!(sum1, sum2);
    }

    #[test]
    fn different_content_different_tarsum() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::File::create(&file_path).unwrap().write_all(b"hello").unwrap();
        let entries = vec![TarEntry {
            tar_path: "a.txt".to_string(),
            source_path: file_path.clone(),
        }];
        let (_, sum1) = build_deterministic_tar(&entries).unwrap();

        std::fs::File::create(&file_path).unwrap().write_all(b"world!").unwrap();
        let (_, sum2) = build_deterministic_tar(&entries).unwrap();
        assert_ne!(sum1, sum2);
    }
}
