use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tokio_util::sync::CancellationToken;

use crate::home::{HomeLayout, PRIV_VALIDATOR_STATE};

use super::{
    parse_checksum, sha256_file, ExtractOptions, Phase, ProgressFn, SnapshotEngine, SnapshotError,
    SnapshotProgress, CHECKSUM_SUFFIX,
};

/// Written into the target directory after a complete extraction.
pub const MARKER_FILE: &str = ".snapshot_extracted";

pub(super) async fn run(
    engine: &SnapshotEngine,
    home: &HomeLayout,
    opts: &ExtractOptions,
) -> Result<(), SnapshotError> {
    let (archive, recorded) = newest_cached_archive(&home.snapshot_cache_dir())?;
    let size = fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);

    (opts.progress)(&SnapshotProgress::new(
        Phase::Verify,
        0,
        size,
        format!("verifying {}", archive.display()),
    ));
    let hashed = {
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || sha256_file(&archive))
            .await
            .map_err(|e| SnapshotError::io("hash cached archive")(io::Error::other(e)))?
            .map_err(SnapshotError::io("hash cached archive"))?
    };
    if hashed != recorded {
        return Err(SnapshotError::CorruptCache {
            path: archive,
            expected: recorded,
            actual: hashed,
        });
    }
    (opts.progress)(&SnapshotProgress::new(Phase::Verify, size, size, "checksum verified"));

    let target = opts.target_dir.clone();
    let progress = opts.progress.clone();
    let cancel = engine.cancel_token().clone();
    let unpacked = tokio::task::spawn_blocking(move || {
        unpack(&archive, &target, &progress, &cancel)?;
        fs::write(target.join(MARKER_FILE), format!("{recorded}\n"))
            .map_err(SnapshotError::io("write extraction marker"))
    })
    .await
    .map_err(|e| SnapshotError::io("extract archive")(io::Error::other(e)))?;

    if unpacked.is_ok() {
        tracing::info!(target = %opts.target_dir.display(), "snapshot extracted");
    }
    unpacked
}

/// Most recently written archive in `cache_dir` that has a recorded digest.
fn newest_cached_archive(cache_dir: &Path) -> Result<(PathBuf, String), SnapshotError> {
    let missing = || SnapshotError::NoCachedArchive {
        dir: cache_dir.to_path_buf(),
    };
    let entries = fs::read_dir(cache_dir).map_err(|_| missing())?;

    let mut best: Option<(SystemTime, PathBuf, String)> = None;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(archive_name) = name.strip_suffix(CHECKSUM_SUFFIX) else {
            continue;
        };
        let archive = cache_dir.join(archive_name);
        let Ok(meta) = fs::metadata(&archive) else {
            continue;
        };
        let Some(sum) = fs::read_to_string(&path).ok().and_then(|t| parse_checksum(&t)) else {
            continue;
        };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(t, _, _)| modified > *t) {
            best = Some((modified, archive, sum));
        }
    }
    best.map(|(_, archive, sum)| (archive, sum)).ok_or_else(missing)
}

/// Unpacks a gzip tar into `target`, entry by entry.
///
/// Every regular file is written to `<final>.part` and renamed into place.
/// Entries already renamed before an error are left for the operator to
/// wipe with `reset`.
pub(crate) fn unpack(
    archive: &Path,
    target: &Path,
    progress: &ProgressFn,
    cancel: &CancellationToken,
) -> Result<(), SnapshotError> {
    fs::create_dir_all(target).map_err(SnapshotError::io("create extraction target"))?;
    let file = File::open(archive).map_err(SnapshotError::io("open cached archive"))?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let strip_data = target.file_name().is_some_and(|n| n == "data");

    let mut written: u64 = 0;
    for entry in archive.entries().map_err(SnapshotError::Archive)? {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        let mut entry = entry.map_err(SnapshotError::Archive)?;
        let raw = entry.path().map_err(SnapshotError::Archive)?.into_owned();
        let shown = raw.display().to_string();

        let Some(relative) = sanitize(&raw, strip_data)? else {
            continue;
        };
        let dest = target.join(&relative);
        progress(&SnapshotProgress::new(Phase::Extract, written, 0, shown.clone()));

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(SnapshotError::io(format!("create {}", dest.display())))?;
                set_mode(&dest, 0o755)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if is_validator_state(&dest) && dest.exists() {
                    tracing::info!(path = %dest.display(), "keeping existing validator state");
                    continue;
                }
                let executable = entry.header().mode().map(|m| m & 0o111 != 0).unwrap_or(false);
                let expected = entry.size();
                written += write_entry(&mut entry, &dest, executable, expected)?;
            }
            other => {
                tracing::warn!(entry = %shown, kind = ?other, "skipping unsupported archive entry");
            }
        }
    }
    progress(&SnapshotProgress::new(Phase::Extract, written, written, "extraction complete"));
    Ok(())
}

/// Relative path for `raw` under the target, or `None` for the root entry.
/// Absolute paths and `..` components are rejected.
fn sanitize(raw: &Path, strip_data: bool) -> Result<Option<PathBuf>, SnapshotError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SnapshotError::UnsafeEntry {
                    entry: raw.display().to_string(),
                });
            }
        }
    }
    if strip_data && parts.first().is_some_and(|p| *p == "data") {
        parts.remove(0);
    }
    if parts.is_empty() {
        return Ok(None);
    }
    Ok(Some(parts.iter().collect()))
}

/// `.../data/priv_validator_state.json`
fn is_validator_state(path: &Path) -> bool {
    path.file_name().is_some_and(|n| n == PRIV_VALIDATOR_STATE)
        && path
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|n| n == "data")
}

/// Removes the temp file unless the rename happened.
struct PartFile {
    path: PathBuf,
    done: bool,
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.done {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn write_entry<R: Read>(
    entry: &mut R,
    dest: &Path,
    executable: bool,
    expected: u64,
) -> Result<u64, SnapshotError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(SnapshotError::io(format!("create {}", parent.display())))?;
    }
    let mut part_name = dest.as_os_str().to_owned();
    part_name.push(".part");
    let mut part = PartFile {
        path: PathBuf::from(part_name),
        done: false,
    };

    let mut out = File::create(&part.path)
        .map_err(SnapshotError::io(format!("create {}", part.path.display())))?;
    let mut buffer = vec![0u8; 256 * 1024];
    let mut total = 0u64;
    loop {
        // Read failures come from the decompressor: a damaged archive.
        let read = entry.read(&mut buffer).map_err(SnapshotError::Archive)?;
        if read == 0 {
            break;
        }
        out.write_all(&buffer[..read])
            .map_err(SnapshotError::io(format!("write {}", part.path.display())))?;
        total += read as u64;
    }
    if total != expected {
        return Err(SnapshotError::Archive(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{} ends after {total} of {expected} bytes", dest.display()),
        )));
    }
    out.flush()
        .map_err(SnapshotError::io(format!("flush {}", part.path.display())))?;
    drop(out);

    set_mode(&part.path, if executable { 0o755 } else { 0o644 })?;
    fs::rename(&part.path, dest).map_err(SnapshotError::io(format!("rename into {}", dest.display())))?;
    part.done = true;
    Ok(total)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), SnapshotError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(SnapshotError::io(format!("chmod {}", path.display())))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), SnapshotError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::noop_progress;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn append_file(builder: &mut tar::Builder<GzEncoder<File>>, name: &str, body: &[u8], mode: u32) {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(mode);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, name, body)
            .expect("append entry");
    }

    fn build_archive(path: &Path, entries: &[(&str, &[u8], u32)]) {
        let file = File::create(path).expect("create archive");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        for (name, body, mode) in entries {
            append_file(&mut builder, name, body, *mode);
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip");
    }

    /// Tar with a raw name, bypassing the builder's own path checks.
    fn build_raw_archive(path: &Path, name: &str) {
        let file = File::create(path).expect("create archive");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        let mut header = tar::Header::new_old();
        let bytes = name.as_bytes();
        header.as_old_mut().name[..bytes.len()].copy_from_slice(bytes);
        header.set_size(3);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder.append(&header, &b"bad"[..]).expect("append raw entry");
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip");
    }

    #[test]
    fn unpack_strips_data_prefix_and_keeps_validator_state() {
        let tmp = TempDir::new().expect("create temp dir");
        let archive = tmp.path().join("a.tar.gz");
        build_archive(
            &archive,
            &[
                ("data/blockstore.db/000001.log", b"blocks", 0o644),
                ("data/priv_validator_state.json", br#"{"height":"999"}"#, 0o644),
                ("./data/tools/run.sh", b"#!/bin/sh\n", 0o755),
            ],
        );

        let data = tmp.path().join("home").join("data");
        fs::create_dir_all(&data).expect("mkdir data");
        let state = data.join(PRIV_VALIDATOR_STATE);
        fs::write(&state, r#"{"height":"42","round":0,"step":0}"#).expect("write state");

        unpack(&archive, &data, &noop_progress(), &CancellationToken::new()).expect("unpack");

        assert_eq!(
            fs::read_to_string(data.join("blockstore.db/000001.log")).expect("read log"),
            "blocks"
        );
        assert_eq!(
            fs::read_to_string(&state).expect("read state"),
            r#"{"height":"42","round":0,"step":0}"#
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(data.join("tools/run.sh"))
                .expect("stat script")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
            let mode = fs::metadata(data.join("blockstore.db/000001.log"))
                .expect("stat log")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }
        assert!(!data.join("blockstore.db/000001.log.part").exists());
    }

    #[test]
    fn unpack_writes_validator_state_when_absent() {
        let tmp = TempDir::new().expect("create temp dir");
        let archive = tmp.path().join("a.tar.gz");
        build_archive(
            &archive,
            &[("data/priv_validator_state.json", br#"{"height":"7"}"#, 0o644)],
        );
        let data = tmp.path().join("data");
        unpack(&archive, &data, &noop_progress(), &CancellationToken::new()).expect("unpack");
        assert_eq!(
            fs::read_to_string(data.join(PRIV_VALIDATOR_STATE)).expect("read"),
            r#"{"height":"7"}"#
        );
    }

    #[test]
    fn traversal_entry_fails_without_writing() {
        let tmp = TempDir::new().expect("create temp dir");
        let archive = tmp.path().join("evil.tar.gz");
        build_raw_archive(&archive, "../escape.txt");

        let target = tmp.path().join("target");
        let err = unpack(&archive, &target, &noop_progress(), &CancellationToken::new())
            .expect_err("traversal rejected");
        assert!(matches!(err, SnapshotError::UnsafeEntry { .. }));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn truncated_archive_is_an_integrity_error() {
        let tmp = TempDir::new().expect("create temp dir");
        let archive = tmp.path().join("a.tar.gz");
        // Incompressible content so the cut lands inside the file body.
        let mut state: u32 = 0x1234_5678;
        let big: Vec<u8> = (0..512 * 1024)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect();
        build_archive(&archive, &[("data/big.bin", &big, 0o644)]);
        let bytes = fs::read(&archive).expect("read archive");
        fs::write(&archive, &bytes[..bytes.len() / 2]).expect("truncate");

        let target = tmp.path().join("data");
        let err = unpack(&archive, &target, &noop_progress(), &CancellationToken::new())
            .expect_err("truncated");
        assert!(matches!(err, SnapshotError::Archive(_)));
        assert!(!target.join("big.bin.part").exists());
    }

    #[test]
    fn extract_events_name_entries() {
        let tmp = TempDir::new().expect("create temp dir");
        let archive = tmp.path().join("a.tar.gz");
        build_archive(&archive, &[("data/x", b"1", 0o644), ("data/y", b"2", 0o644)]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |p: &SnapshotProgress| {
                seen.lock().expect("lock").push((p.phase, p.message.clone()))
            })
        };
        unpack(&archive, &tmp.path().join("data"), &progress, &CancellationToken::new())
            .expect("unpack");

        let seen = seen.lock().expect("lock");
        assert!(seen.iter().all(|(phase, _)| *phase == Phase::Extract));
        assert_eq!(seen[0].1, "data/x");
        assert_eq!(seen[1].1, "data/y");
    }

    #[test]
    fn symlink_entries_are_skipped() {
        let tmp = TempDir::new().expect("create temp dir");
        let archive = tmp.path().join("a.tar.gz");
        let file = File::create(&archive).expect("create archive");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        append_file(&mut builder, "data/x", b"1", 0o644);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_link_name("/etc/passwd").expect("link name");
        builder
            .append_data(&mut header, "data/link", std::io::empty())
            .expect("append symlink");
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip");

        let data = tmp.path().join("data");
        unpack(&archive, &data, &noop_progress(), &CancellationToken::new()).expect("unpack");

        assert_eq!(fs::read_to_string(data.join("x")).expect("read x"), "1");
        assert!(fs::symlink_metadata(data.join("link")).is_err());
    }

    #[test]
    fn cancelled_token_stops_extraction() {
        let tmp = TempDir::new().expect("create temp dir");
        let archive = tmp.path().join("a.tar.gz");
        build_archive(&archive, &[("data/x", b"1", 0o644)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = unpack(&archive, &tmp.path().join("data"), &noop_progress(), &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, SnapshotError::Cancelled));
    }

    #[test]
    fn newest_archive_with_checksum_wins() {
        let tmp = TempDir::new().expect("create temp dir");
        let digest = "a".repeat(64);
        fs::write(tmp.path().join("orphan.tar.gz"), "x").expect("write orphan");
        fs::write(tmp.path().join("latest.tar.gz"), "x").expect("write archive");
        fs::write(tmp.path().join("latest.tar.gz.sha256"), format!("{digest}\n"))
            .expect("write checksum");

        let (path, sum) = newest_cached_archive(tmp.path()).expect("archive found");
        assert_eq!(path, tmp.path().join("latest.tar.gz"));
        assert_eq!(sum, digest);

        let empty = TempDir::new().expect("create temp dir");
        assert!(matches!(
            newest_cached_archive(empty.path()),
            Err(SnapshotError::NoCachedArchive { .. })
        ));
    }
}
