//! In-memory runtime with scripted programs.
//!
//! Nothing touches the host: files live in a map and every spawnable command
//! is a [`Program`] registered up front. Boots are counted and the last booted
//! sandbox stays reachable so callers can inspect what happened inside it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sandpad_protocol::seed::SeedItem;

use crate::path::{file_name, normalize, parent};
use crate::{
    DirEntry, EntryKind, PIPE_CAPACITY, ProcessHandle, Runtime, SERVER_READY_CAPACITY, Sandbox,
    SandboxError, SeedTree, ServerReady, TERMINATED_EXIT_CODE,
};

/// Delay applied to a write before it lands, keyed on path and contents.
pub type WriteLatency = Arc<dyn Fn(&str, &str) -> Duration + Send + Sync>;

/// Delay applied to a read, keyed on path.
pub type ReadLatency = Arc<dyn Fn(&str) -> Duration + Send + Sync>;

/// Returns an error message for writes that should fail, keyed on path and
/// contents.
pub type WriteFault = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// Scripted behaviour of one command.
///
/// A program writes its output chunks, optionally announces a server, then
/// either exits with `exit_code`, echoes input back until killed, or (with
/// neither) stays alive until killed.
#[derive(Debug, Clone, Default)]
pub struct Program {
    output: Vec<Vec<u8>>,
    chunk_delay: Option<Duration>,
    exit_code: Option<i32>,
    echo_input: bool,
    announce: Option<ServerReady>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.output.push(chunk.into());
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn exits_with(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn echo_input(mut self) -> Self {
        self.echo_input = true;
        self
    }

    pub fn announces(mut self, port: u16, url: impl Into<String>) -> Self {
        self.announce = Some(ServerReady {
            port,
            url: url.into(),
        });
        self
    }
}

#[derive(Default)]
pub struct MemoryRuntime {
    programs: HashMap<String, Program>,
    boot_failure: Option<String>,
    boot_delay: Option<Duration>,
    write_latency: Option<WriteLatency>,
    write_fault: Option<WriteFault>,
    read_latency: Option<ReadLatency>,
    spawn_delay: Option<Duration>,
    boots: AtomicUsize,
    booted: Mutex<Option<Arc<MemorySandbox>>>,
}

impl fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("programs", &self.programs.keys().collect::<Vec<_>>())
            .field("boot_failure", &self.boot_failure)
            .field("boots", &self.boot_count())
            .finish()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, command: impl Into<String>, program: Program) -> Self {
        self.programs.insert(command.into(), program);
        self
    }

    pub fn failing_boot(mut self, message: impl Into<String>) -> Self {
        self.boot_failure = Some(message.into());
        self
    }

    pub fn with_boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = Some(delay);
        self
    }

    pub fn with_write_latency<F>(mut self, latency: F) -> Self
    where
        F: Fn(&str, &str) -> Duration + Send + Sync + 'static,
    {
        self.write_latency = Some(Arc::new(latency));
        self
    }

    pub fn with_write_fault<F>(mut self, fault: F) -> Self
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.write_fault = Some(Arc::new(fault));
        self
    }

    pub fn with_read_latency<F>(mut self, latency: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.read_latency = Some(Arc::new(latency));
        self
    }

    /// Delay every `spawn` before the process is registered.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = Some(delay);
        self
    }

    /// How many times `boot` has been called.
    pub fn boot_count(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }

    /// The most recently booted sandbox, if any boot succeeded.
    pub fn sandbox(&self) -> Option<Arc<MemorySandbox>> {
        self.booted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let boot_number = self.boots.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.boot_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.boot_failure {
            return Err(SandboxError::Boot(message.clone()));
        }

        let sandbox = Arc::new(MemorySandbox {
            write_fault: self.write_fault.clone(),
            read_latency: self.read_latency.clone(),
            spawn_delay: self.spawn_delay,
            ..MemorySandbox::new(self.programs.clone(), self.write_latency.clone())
        });
        *self.booted.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&sandbox));
        debug!(boot_number, "memory sandbox booted");
        Ok(sandbox)
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(String),
    Directory,
}

/// One `spawn` call observed by a memory sandbox.
#[derive(Debug, Clone)]
pub struct SpawnRecord {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub kill: CancellationToken,
}

pub struct MemorySandbox {
    nodes: Mutex<BTreeMap<String, Node>>,
    programs: HashMap<String, Program>,
    write_latency: Option<WriteLatency>,
    write_fault: Option<WriteFault>,
    read_latency: Option<ReadLatency>,
    spawn_delay: Option<Duration>,
    ready_tx: broadcast::Sender<ServerReady>,
    spawned: Mutex<Vec<SpawnRecord>>,
    next_pid: AtomicUsize,
}

impl MemorySandbox {
    fn new(programs: HashMap<String, Program>, write_latency: Option<WriteLatency>) -> Self {
        let (ready_tx, _rx) = broadcast::channel(SERVER_READY_CAPACITY);
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            programs,
            write_latency,
            write_fault: None,
            read_latency: None,
            spawn_delay: None,
            ready_tx,
            spawned: Mutex::new(Vec::new()),
            next_pid: AtomicUsize::new(1),
        }
    }

    /// Current durable contents of a file.
    pub fn file(&self, path: &str) -> Option<String> {
        let key = normalize(path).ok()?;
        match self.nodes.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            Some(Node::File(contents)) => Some(contents.clone()),
            _ => None,
        }
    }

    /// Every spawn so far, in call order.
    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn spawn_count(&self, command: &str) -> usize {
        self.spawned()
            .iter()
            .filter(|record| record.command == command)
            .count()
    }

    /// Emit a server-ready event as if a process had bound a port.
    pub fn announce(&self, port: u16, url: impl Into<String>) {
        let _ = self.ready_tx.send(ServerReady {
            port,
            url: url.into(),
        });
    }

    fn lookup_dir(&self, key: &str, raw: &str) -> Result<(), SandboxError> {
        if key.is_empty() {
            return Ok(());
        }
        match self.nodes.lock().unwrap_or_else(|e| e.into_inner()).get(key) {
            Some(Node::Directory) => Ok(()),
            Some(Node::File(_)) => Err(SandboxError::NotADirectory(raw.to_string())),
            None => Err(SandboxError::NotFound(raw.to_string())),
        }
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    async fn mount(&self, tree: &SeedTree) -> Result<(), SandboxError> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        for (path, item) in tree.walk() {
            let key = normalize(&path)?;
            let node = match item {
                SeedItem::Directory(_) => Node::Directory,
                SeedItem::File(_, contents) => Node::File(contents.to_string()),
            };
            nodes.insert(key, node);
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let dir = normalize(path)?;
        self.lookup_dir(&dir, path)?;

        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(nodes
            .iter()
            .filter(|(key, _)| !key.is_empty() && parent(key) == dir)
            .map(|(key, node)| DirEntry {
                name: file_name(key).to_string(),
                kind: match node {
                    Node::File(_) => EntryKind::File,
                    Node::Directory => EntryKind::Directory,
                },
            })
            .collect())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let key = normalize(path)?;
        if let Some(latency) = &self.read_latency {
            tokio::time::sleep(latency(&key)).await;
        }
        match self.nodes.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
            Some(Node::File(contents)) => Ok(contents.clone()),
            Some(Node::Directory) => Err(SandboxError::IsADirectory(path.to_string())),
            None => Err(SandboxError::NotFound(path.to_string())),
        }
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        let key = normalize(path)?;
        if key.is_empty() {
            return Err(SandboxError::IsADirectory(path.to_string()));
        }
        if let Some(latency) = &self.write_latency {
            tokio::time::sleep(latency(&key, contents)).await;
        }
        self.lookup_dir(parent(&key), path)?;
        if let Some(message) = self.write_fault.as_ref().and_then(|f| f(&key, contents)) {
            return Err(SandboxError::Io {
                path: path.to_string(),
                source: std::io::Error::other(message),
            });
        }

        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(nodes.get(&key), Some(Node::Directory)) {
            return Err(SandboxError::IsADirectory(path.to_string()));
        }
        nodes.insert(key, Node::File(contents.to_string()));
        Ok(())
    }

    async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, SandboxError> {
        if let Some(delay) = self.spawn_delay {
            tokio::time::sleep(delay).await;
        }
        let program = self
            .programs
            .get(command)
            .cloned()
            .ok_or_else(|| SandboxError::Spawn {
                command: command.to_string(),
                message: "command not found".to_string(),
            })?;

        let id = format!("mem-{}", self.next_pid.fetch_add(1, Ordering::SeqCst));
        let kill = CancellationToken::new();
        self.spawned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SpawnRecord {
                id: id.clone(),
                command: command.to_string(),
                args: args.to_vec(),
                kill: kill.clone(),
            });

        let (out_tx, out_rx) = mpsc::channel(PIPE_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(run_program(
            program,
            out_tx,
            in_rx,
            exit_tx,
            self.ready_tx.clone(),
            kill.clone(),
        ));

        debug!(process_id = %id, command, "scripted process spawned");
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

async fn run_program(
    program: Program,
    out_tx: mpsc::Sender<Vec<u8>>,
    mut in_rx: mpsc::Receiver<Vec<u8>>,
    exit_tx: oneshot::Sender<i32>,
    ready_tx: broadcast::Sender<ServerReady>,
    kill: CancellationToken,
) {
    for chunk in program.output {
        if let Some(delay) = program.chunk_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = kill.cancelled() => {
                    drop(out_tx);
                    let _ = exit_tx.send(TERMINATED_EXIT_CODE);
                    return;
                }
            }
        }
        let _ = out_tx.send(chunk).await;
    }

    if let Some(ready) = program.announce {
        let _ = ready_tx.send(ready);
    }

    let code = if program.echo_input {
        loop {
            tokio::select! {
                _ = kill.cancelled() => break TERMINATED_EXIT_CODE,
                data = in_rx.recv() => match data {
                    Some(data) => {
                        let _ = out_tx.send(data).await;
                    }
                    None => break 0,
                },
            }
        }
    } else if let Some(code) = program.exit_code {
        code
    } else {
        kill.cancelled().await;
        TERMINATED_EXIT_CODE
    };

    drop(out_tx);
    let _ = exit_tx.send(code);
}
