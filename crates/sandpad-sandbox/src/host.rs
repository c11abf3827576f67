use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sandpad_protocol::seed::SeedItem;

use crate::path::{normalize, resolve_under};
use crate::{
    DirEntry, EntryKind, PIPE_CAPACITY, ProcessHandle, Runtime, SERVER_READY_CAPACITY, Sandbox,
    SandboxError, SeedTree, ServerReady, TERMINATED_EXIT_CODE,
};

const READ_CHUNK_BYTES: usize = 8192;
// Longest unterminated line kept for announcement scanning.
const MAX_CARRIED_BYTES: usize = 1024;

static LISTEN_ANNOUNCEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:https?://)?(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]):(\d{2,5})")
        .expect("listen announcement pattern is valid")
});

/// Runtime backed by a host directory and real child processes.
#[derive(Debug, Clone)]
pub struct HostRuntime {
    root: PathBuf,
}

impl HostRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Runtime for HostRuntime {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            SandboxError::Boot(format!(
                "failed to create sandbox root {}: {err}",
                self.root.display()
            ))
        })?;
        let root = tokio::fs::canonicalize(&self.root).await.map_err(|err| {
            SandboxError::Boot(format!(
                "failed to resolve sandbox root {}: {err}",
                self.root.display()
            ))
        })?;
        info!(root = %root.display(), "host sandbox booted");
        Ok(Arc::new(HostSandbox::new(root)))
    }
}

pub struct HostSandbox {
    root: PathBuf,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl HostSandbox {
    fn new(root: PathBuf) -> Self {
        let (ready_tx, _rx) = broadcast::channel(SERVER_READY_CAPACITY);
        Self { root, ready_tx }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    async fn mount(&self, tree: &SeedTree) -> Result<(), SandboxError> {
        for (path, item) in tree.walk() {
            let target = resolve_under(&self.root, &path)?;
            match item {
                SeedItem::Directory(_) => tokio::fs::create_dir_all(&target).await,
                SeedItem::File(_, contents) => tokio::fs::write(&target, contents).await,
            }
            .map_err(|err| SandboxError::io(&path, err))?;
        }
        debug!(root = %self.root.display(), "seed tree mounted");
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let dir = resolve_under(&self.root, path)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|err| SandboxError::io(path, err))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| SandboxError::io(path, err))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| SandboxError::io(path, err))?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::Other
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        // Host listing order is unspecified; keep it stable for display.
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let target = resolve_under(&self.root, path)?;
        if tokio::fs::metadata(&target)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(SandboxError::IsADirectory(normalize(path)?));
        }
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|err| SandboxError::io(path, err))
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        let target = resolve_under(&self.root, path)?;
        tokio::fs::write(&target, contents)
            .await
            .map_err(|err| SandboxError::io(path, err))
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, SandboxError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| SandboxError::Spawn {
            command: command.to_string(),
            message: err.to_string(),
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        info!(process_id = %id, command, ?args, pid = ?child.id(), "process spawned");

        let (out_tx, out_rx) = mpsc::channel(PIPE_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, out_tx.clone(), self.ready_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, out_tx.clone(), self.ready_tx.clone()));
        }
        drop(out_tx);

        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(PIPE_CAPACITY);
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(data) = in_rx.recv().await {
                    if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let kill_signal = kill.clone();
        let process_id = id.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_signal.cancelled() => None,
            };
            let code = match waited {
                Some(Ok(status)) => status.code().unwrap_or(TERMINATED_EXIT_CODE),
                Some(Err(err)) => {
                    warn!(process_id = %process_id, "failed to wait on process: {err}");
                    TERMINATED_EXIT_CODE
                }
                None => {
                    if let Err(err) = child.kill().await {
                        warn!(process_id = %process_id, "failed to kill process: {err}");
                    }
                    TERMINATED_EXIT_CODE
                }
            };
            info!(process_id = %process_id, exit_code = code, "process exited");
            let _ = exit_tx.send(code);
        });

        Ok(ProcessHandle {
            id,
            output: out_rx,
            input: in_tx,
            exit: exit_rx,
            kill,
        })
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }
}

async fn pump_output<R>(
    mut reader: R,
    tx: mpsc::Sender<Vec<u8>>,
    ready_tx: broadcast::Sender<ServerReady>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut scanner = ReadyScanner::default();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!("process pipe read failed: {err}");
                break;
            }
        };
        let chunk = buf[..n].to_vec();
        for ready in scanner.feed(&chunk) {
            let _ = ready_tx.send(ready);
        }
        // Keep draining after the consumer is gone so the child never blocks on a full pipe.
        let _ = tx.send(chunk).await;
    }
    for ready in scanner.finish() {
        let _ = ready_tx.send(ready);
    }
}

/// Scans process output line by line. A line split across reads is carried
/// over and scanned once its newline arrives.
#[derive(Debug, Default)]
struct ReadyScanner {
    tail: Vec<u8>,
}

impl ReadyScanner {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ServerReady> {
        self.tail.extend_from_slice(chunk);
        let found = match self.tail.iter().rposition(|b| *b == b'\n') {
            Some(end) => {
                let rest = self.tail.split_off(end + 1);
                let lines = std::mem::replace(&mut self.tail, rest);
                detect_server_ready(&lines)
            }
            None => Vec::new(),
        };
        if self.tail.len() > MAX_CARRIED_BYTES {
            let excess = self.tail.len() - MAX_CARRIED_BYTES;
            self.tail.drain(..excess);
        }
        found
    }

    /// Scan whatever is left once the stream has ended.
    fn finish(&mut self) -> Vec<ServerReady> {
        detect_server_ready(&std::mem::take(&mut self.tail))
    }
}

/// Find `localhost:PORT`-style listen announcements in a chunk of output.
pub fn detect_server_ready(chunk: &[u8]) -> Vec<ServerReady> {
    let text = String::from_utf8_lossy(chunk);
    LISTEN_ANNOUNCEMENT
        .captures_iter(&text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .filter(|port| *port > 0)
        .map(|port| ServerReady {
            port,
            url: format!("http://localhost:{port}"),
        })
        .collect()
}
