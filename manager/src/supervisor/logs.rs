//! Reading the supervisor's append-only log file.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How far back from the end of the file `tail_lines` looks.
const TAIL_WINDOW: u64 = 1 << 20;
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// Last `n` lines of `path`. Only the final megabyte is read.
pub fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let (text, _) = read_tail(path)?;
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

/// Same as [`tail_lines`] but an absent file yields no lines.
pub fn tail_lines_or_empty(path: &Path, n: usize) -> Vec<String> {
    tail_lines(path, n).unwrap_or_default()
}

fn read_tail(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if start > 0 {
        // Drop the partial first line.
        if let Some(pos) = text.find('\n') {
            text.drain(..=pos);
        }
    }
    Ok((text, len))
}

/// Calls `on_line` for every line appended to `path` after `offset` until
/// `cancel` fires. Handles truncation by restarting from the beginning.
pub async fn follow<F>(
    path: &Path,
    mut offset: u64,
    cancel: &CancellationToken,
    mut on_line: F,
) -> io::Result<()>
where
    F: FnMut(&str),
{
    let mut pending = String::new();
    loop {
        let len = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        if len < offset {
            offset = 0;
            pending.clear();
        }
        if len > offset {
            let chunk = read_range(path, offset, len)?;
            offset = len;
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                on_line(line.trim_end_matches(['\n', '\r']));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(FOLLOW_POLL) => {}
        }
    }
}

fn read_range(path: &Path, from: u64, to: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut buf = vec![0u8; (to - from) as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Current length of `path`, 0 when absent.
pub fn current_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[test]
    fn tail_returns_last_lines() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join("node.log");
        std::fs::write(&path, "a\nb\nc\nd\n").expect("write log");

        assert_eq!(tail_lines(&path, 2).expect("tail"), vec!["c", "d"]);
        assert_eq!(tail_lines(&path, 10).expect("tail").len(), 4);
        assert!(tail_lines_or_empty(&tmp.path().join("missing"), 3).is_empty());
    }

    #[tokio::test]
    async fn follow_sees_appended_lines() {
        let tmp = TempDir::new().expect("create temp dir");
        let path = tmp.path().join("node.log");
        std::fs::write(&path, "old\n").expect("write log");
        let offset = current_len(&path);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let follower = {
            let seen = seen.clone();
            let cancel = cancel.clone();
            let path = path.clone();
            tokio::spawn(async move {
                follow(&path, offset, &cancel, |line| {
                    seen.lock().expect("lock").push(line.to_string())
                })
                .await
            })
        };

        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("open for append");
            writeln!(file, "new 1").expect("append");
            writeln!(file, "new 2").expect("append");
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        cancel.cancel();
        follower
            .await
            .expect("join follower")
            .expect("follow succeeded");

        assert_eq!(*seen.lock().expect("lock"), vec!["new 1", "new 2"]);
    }
}
