use base64::Engine;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use sandpad_protocol::ConsoleChunk;

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub seq: u64,
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
}

impl From<&OutputChunk> for ConsoleChunk {
    fn from(chunk: &OutputChunk) -> Self {
        ConsoleChunk {
            seq: chunk.seq,
            data: chunk.data.clone(),
        }
    }
}

/// Upper bound on retained scrollback bytes, whatever the chunk limit.
pub const MAX_SCROLLBACK_BYTES: usize = 4 * 1024 * 1024;

/// Bounded console scrollback.
///
/// Keeps at most `max_chunks` chunks and [`MAX_SCROLLBACK_BYTES`] bytes,
/// dropping the oldest first but never the newest chunk. Sequence numbers
/// start at 1 and are never reused, so a reader that fell behind the
/// eviction point just gets what is left.
#[derive(Debug)]
pub struct Scrollback {
    chunks: VecDeque<OutputChunk>,
    bytes: usize,
    max_chunks: usize,
    last_seq: u64,
}

/// Append-only console transcript, one JSON object per chunk.
#[derive(Debug)]
pub struct HistoryLog {
    file: File,
    path: PathBuf,
}

#[derive(Serialize)]
struct TranscriptLine<'a> {
    seq: u64,
    timestamp_ms: u128,
    data_b64: &'a str,
}

impl Scrollback {
    pub fn new(max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            max_chunks: max_chunks.max(1),
            last_seq: 0,
        }
    }

    pub fn append(&mut self, data: Vec<u8>) -> OutputChunk {
        self.last_seq += 1;
        let chunk = OutputChunk {
            seq: self.last_seq,
            data,
            timestamp: SystemTime::now(),
        };
        self.bytes += chunk.data.len();
        self.chunks.push_back(chunk.clone());
        while self.chunks.len() > self.max_chunks
            || (self.bytes > MAX_SCROLLBACK_BYTES && self.chunks.len() > 1)
        {
            match self.chunks.pop_front() {
                Some(evicted) => self.bytes -= evicted.data.len(),
                None => break,
            }
        }
        chunk
    }

    /// Retained chunks with a sequence number above `after`, oldest first.
    pub fn since(&self, after: Option<u64>) -> Vec<OutputChunk> {
        let after = after.unwrap_or(0);
        let start = self.chunks.partition_point(|chunk| chunk.seq <= after);
        self.chunks.range(start..).cloned().collect()
    }

    pub fn last_seq(&self) -> Option<u64> {
        (self.last_seq > 0).then_some(self.last_seq)
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl HistoryLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_chunk(&mut self, chunk: &OutputChunk) -> std::io::Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&chunk.data);
        let mut line = serde_json::to_vec(&TranscriptLine {
            seq: chunk.seq,
            timestamp_ms: chunk
                .timestamp
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
            data_b64: &encoded,
        })?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()
    }
}

struct OutputState {
    scrollback: Scrollback,
    history: Option<HistoryLog>,
}

/// Console output shared by every process pump and the interactive shell.
///
/// Chunks are numbered, kept in a bounded scrollback and fanned out live.
/// Writing and subscribing happen under one lock, so a subscriber that
/// replays first and then listens never misses or duplicates a chunk.
pub struct ConsoleOutput {
    state: Mutex<OutputState>,
    tx: broadcast::Sender<OutputChunk>,
}

impl ConsoleOutput {
    pub fn new(max_chunks: usize, history: Option<HistoryLog>) -> Self {
        let (tx, _rx) = broadcast::channel(max_chunks.clamp(16, 4096));
        Self {
            state: Mutex::new(OutputState {
                scrollback: Scrollback::new(max_chunks),
                history,
            }),
            tx,
        }
    }

    pub fn write(&self, data: impl Into<Vec<u8>>) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let chunk = state.scrollback.append(data.into());

        let history_failed = match state.history.as_mut() {
            Some(log) => match log.append_chunk(&chunk) {
                Ok(()) => false,
                Err(err) => {
                    warn!(path = %log.path().display(), "console transcript disabled: {err}");
                    true
                }
            },
            None => false,
        };
        if history_failed {
            state.history = None;
        }

        let seq = chunk.seq;
        let _ = self.tx.send(chunk);
        seq
    }

    /// Write `text` on a line of its own.
    pub fn write_line(&self, text: &str) -> u64 {
        self.write(format!("\r\n{text}\r\n"))
    }

    pub fn replay(&self, last_seq: Option<u64>) -> Vec<OutputChunk> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scrollback
            .since(last_seq)
    }

    pub fn replay_and_subscribe(
        &self,
        last_seq: Option<u64>,
    ) -> (Vec<OutputChunk>, broadcast::Receiver<OutputChunk>) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.scrollback.since(last_seq), self.tx.subscribe())
    }

    pub fn newest_seq(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scrollback
            .last_seq()
    }
}
