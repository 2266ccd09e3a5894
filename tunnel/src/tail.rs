//! Follows the local events file that the agent SDK appends to.
//!
//! The tailer starts at the end of the file, survives truncation and rotation, and
//! emits complete lines in file order. Turning lines into envelopes is done by the
//! relay writer through [`envelopes_for_line`].

use anyhow::Context;
use devtunnel_protocol::{Envelope, event_type_for_command};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::LineDecodeError;

const LINE_CHANNEL_CAPACITY: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// A line that grows past this without a newline is discarded.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

pub fn looks_like_object(line: &str) -> bool {
    line.starts_with('{') && line.ends_with('}')
}

pub fn looks_like_array(line: &str) -> bool {
    line.starts_with('[') && line.ends_with(']')
}

/// Strict UTF-8 view of one raw line, without the trailing newline.
pub fn line_from_bytes(raw: &[u8]) -> Result<String, LineDecodeError> {
    let line = std::str::from_utf8(raw)?;
    Ok(line.trim().to_string())
}

/// Decodes one line into records: an object yields itself, an array its elements.
pub fn decode_line(line: &str) -> Result<Vec<Value>, LineDecodeError> {
    let line = line.trim();
    if looks_like_object(line) {
        let record: Value = serde_json::from_str(line)?;
        return Ok(vec![record]);
    }
    if looks_like_array(line) {
        let records: Vec<Value> = serde_json::from_str(line)?;
        return Ok(records);
    }
    Err(LineDecodeError::UnrecognizedShape)
}

/// Builds the outbound envelopes for a line. Records without a string `command`
/// are dropped; `event` becomes `session_event`.
pub fn envelopes_for_line(session_id: &str, line: &str) -> Result<Vec<Envelope>, LineDecodeError> {
    let envelopes = decode_line(line)?
        .into_iter()
        .filter_map(|record| {
            let command = record.get("command")?.as_str()?.to_string();
            Some(Envelope::new(
                session_id,
                event_type_for_command(&command),
                record,
            ))
        })
        .collect();
    Ok(envelopes)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId(u64);

fn file_id(meta: &std::fs::Metadata) -> Option<FileId> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(FileId(meta.ino()))
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        None
    }
}

struct TailState {
    path: PathBuf,
    offset: u64,
    id: Option<FileId>,
    /// Byte at `offset - 1` as last read; a different byte there means the file was rewritten.
    last_byte: Option<u8>,
    partial: Vec<u8>,
    discarding: bool,
}

fn byte_before_end(path: &Path, len: u64) -> Option<u8> {
    use std::io::{Read, Seek};
    if len == 0 {
        return None;
    }
    let mut file = std::fs::File::open(path).ok()?;
    file.seek(std::io::SeekFrom::Start(len - 1)).ok()?;
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).ok()?;
    Some(byte[0])
}

impl TailState {
    fn at_end_of(path: PathBuf) -> Self {
        let (offset, id) = match std::fs::metadata(&path) {
            Ok(meta) => (meta.len(), file_id(&meta)),
            Err(_) => (0, None),
        };
        let last_byte = byte_before_end(&path, offset);
        Self {
            path,
            offset,
            id,
            last_byte,
            partial: Vec::new(),
            discarding: false,
        }
    }

    fn reset(&mut self, id: Option<FileId>) {
        self.offset = 0;
        self.id = id;
        self.last_byte = None;
        self.partial.clear();
        self.discarding = false;
    }

    async fn read_range(&self, start: u64, end: u64) -> anyhow::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path)
            .await
            .context("open events file")?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .context("seek events file")?;
        let mut buf = Vec::new();
        file.take(end.saturating_sub(start))
            .read_to_end(&mut buf)
            .await
            .context("read events file")?;
        Ok(buf)
    }

    /// Reads whatever was appended since the last call and returns complete lines.
    async fn read_new_lines(&mut self) -> anyhow::Result<Vec<String>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.reset(None);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err).context("stat events file"),
        };

        let id = file_id(&meta);
        if id != self.id || meta.len() < self.offset {
            tracing::debug!(path=%self.path.display(), "events file rotated or truncated; reopening");
            self.reset(id);
        }
        if meta.len() == self.offset {
            return Ok(Vec::new());
        }

        let mut buf = self
            .read_range(self.offset.saturating_sub(1), meta.len())
            .await?;
        if self.offset > 0 {
            match self.last_byte {
                Some(last) if buf.first() != Some(&last) => {
                    tracing::debug!(path=%self.path.display(), "events file rewritten in place; reopening");
                    self.reset(id);
                    buf = self.read_range(0, meta.len()).await?;
                }
                _ => {
                    buf.drain(..1.min(buf.len()));
                }
            }
        }
        self.offset += buf.len() as u64;
        if let Some(last) = buf.last() {
            self.last_byte = Some(*last);
        }
        self.partial.extend_from_slice(&buf);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            if self.discarding {
                self.discarding = false;
                continue;
            }
            match line_from_bytes(&raw) {
                Ok(line) if line.is_empty() => {}
                Ok(line) => lines.push(line),
                Err(err) => tracing::debug!(error=%err, "skipping events line"),
            }
        }
        if self.partial.len() > MAX_LINE_BYTES {
            tracing::debug!(bytes = self.partial.len(), "events line too long; discarding");
            self.partial.clear();
            self.discarding = true;
        }
        Ok(lines)
    }
}

/// Running watch over the events file. Dropping it stops the watch.
pub struct EventTailer {
    dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl EventTailer {
    pub fn spawn(path: impl Into<PathBuf>) -> anyhow::Result<(Self, mpsc::Receiver<String>)> {
        let path = path.into();
        let dir = parent_dir(&path);
        let file_name = path.file_name().map(|n| n.to_os_string());

        let (wake_tx, mut wake_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let ours = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                    if ours {
                        let _ = wake_tx.send(());
                    }
                }
                Err(err) => tracing::debug!(error=%err, "events file watcher error"),
            }
        })
        .context("create events file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", dir.display()))?;

        let (lines_tx, lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut state = TailState::at_end_of(path);
        tracing::debug!(path=%state.path.display(), offset=state.offset, "tailing events file");

        let task = tokio::spawn(async move {
            // Notifications can be coalesced or missed on some platforms; the
            // interval keeps the tail moving regardless.
            let mut poll = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    woke = wake_rx.recv() => {
                        if woke.is_none() {
                            break;
                        }
                    }
                    _ = poll.tick() => {}
                }
                match state.read_new_lines().await {
                    Ok(lines) => {
                        for line in lines {
                            if lines_tx.send(line).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => tracing::debug!(error=%err, "events file read failed"),
                }
            }
        });

        Ok((
            Self {
                dir,
                watcher: Some(watcher),
                task,
            },
            lines_rx,
        ))
    }

    pub fn stop(mut self) -> anyhow::Result<()> {
        self.task.abort();
        if let Some(mut watcher) = self.watcher.take() {
            watcher
                .unwatch(&self.dir)
                .context("stop watching events file")?;
        }
        Ok(())
    }
}

impl Drop for EventTailer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
