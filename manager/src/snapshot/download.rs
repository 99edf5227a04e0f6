use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::{
    parse_checksum, DownloadOptions, Phase, SnapshotDescriptor, SnapshotEngine, SnapshotError,
    SnapshotProgress,
};

/// Minimum bytes between two Download events.
const PROGRESS_STEP: u64 = 4 << 20;

pub(super) async fn run(
    engine: &SnapshotEngine,
    desc: &SnapshotDescriptor,
    opts: &DownloadOptions,
) -> Result<(), SnapshotError> {
    let progress = &opts.progress;
    let cached = desc.recorded_checksum();

    let remote = match fetch_checksum(engine, &desc.checksum_url).await {
        Ok(sum) => sum,
        Err(err) => match (&cached, opts.no_cache) {
            (Some(recorded), false) => {
                tracing::warn!(%err, "remote checksum unavailable, using cached archive");
                progress(&SnapshotProgress::new(
                    Phase::Cache,
                    0,
                    0,
                    format!("using cached snapshot {recorded} (remote checksum unavailable)"),
                ));
                return Ok(());
            }
            _ => return Err(err),
        },
    };

    if !opts.no_cache && cached.as_deref() == Some(remote.as_str()) {
        tracing::info!(archive = %desc.archive_path.display(), "snapshot cache hit");
        progress(&SnapshotProgress::new(
            Phase::Cache,
            0,
            0,
            format!("cached snapshot matches remote checksum {remote}"),
        ));
        return Ok(());
    }

    let actual = stream_to_part(engine, desc, opts).await?;
    let part = desc.part_path();
    if actual != remote {
        remove_quietly(&part);
        return Err(SnapshotError::Mismatch {
            expected: remote,
            actual,
        });
    }

    tokio::fs::rename(&part, &desc.archive_path)
        .await
        .map_err(SnapshotError::io("move downloaded archive into cache"))?;
    tokio::fs::write(&desc.checksum_path, format!("{remote}\n"))
        .await
        .map_err(SnapshotError::io("record snapshot checksum"))?;
    tracing::info!(archive = %desc.archive_path.display(), checksum = %remote, "snapshot cached");
    Ok(())
}

async fn fetch_checksum(engine: &SnapshotEngine, url: &str) -> Result<String, SnapshotError> {
    let http = |message: String| SnapshotError::Http {
        url: url.to_string(),
        message,
    };
    let response = engine
        .client()
        .get(url)
        .timeout(engine.checksum_timeout())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| http(e.to_string()))?;
    let body = response.text().await.map_err(|e| http(e.to_string()))?;
    parse_checksum(&body).ok_or_else(|| SnapshotError::BadChecksum {
        url: url.to_string(),
        body: body.chars().take(80).collect(),
    })
}

/// Removes the temp file unless disarmed.
struct PartGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if self.armed {
            remove_quietly(&self.path);
        }
    }
}

/// Streams the archive body into the `.part` file, hashing as it goes.
/// Returns the hex digest of what was written.
async fn stream_to_part(
    engine: &SnapshotEngine,
    desc: &SnapshotDescriptor,
    opts: &DownloadOptions,
) -> Result<String, SnapshotError> {
    let url = &desc.source_url;
    let http = |message: String| SnapshotError::Http {
        url: url.clone(),
        message,
    };

    let response = engine
        .client()
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| http(e.to_string()))?;
    let total = response.content_length().unwrap_or(0);

    let part = desc.part_path();
    let mut guard = PartGuard {
        path: part.clone(),
        armed: true,
    };
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(SnapshotError::io("create snapshot temp file"))?;

    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    let mut reported: u64 = 0;
    (opts.progress)(&SnapshotProgress::new(
        Phase::Download,
        0,
        total,
        format!("downloading {url}"),
    ));

    loop {
        let chunk = tokio::select! {
            _ = engine.cancel_token().cancelled() => return Err(SnapshotError::Cancelled),
            next = stream.next() => next,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk.map_err(|e| http(e.to_string()))?;

        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(SnapshotError::io("write snapshot temp file"))?;
        written += chunk.len() as u64;

        if written - reported >= PROGRESS_STEP {
            reported = written;
            (opts.progress)(&SnapshotProgress::new(Phase::Download, written, total, "downloading"));
        }
    }

    file.flush()
        .await
        .map_err(SnapshotError::io("flush snapshot temp file"))?;
    file.sync_all()
        .await
        .map_err(SnapshotError::io("sync snapshot temp file"))?;
    drop(file);

    if total > 0 && written != total {
        return Err(http(format!("body ended after {written} of {total} bytes")));
    }
    (opts.progress)(&SnapshotProgress::new(Phase::Download, written, total, "download complete"));

    guard.armed = false;
    Ok(hex::encode(hasher.finalize()))
}

fn remove_quietly(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(%err, path = %path.display(), "failed to remove temp file");
        }
    }
}
