//! Capability contract between the coordinator and a sandboxed runtime.
//!
//! A [`Runtime`] boots at most one [`Sandbox`] per call. The sandbox exposes a
//! virtual file system, process spawning with piped byte streams, and a
//! server-ready notification stream. Two runtimes ship with the crate:
//! [`HostRuntime`] maps the sandbox onto a host directory and real child
//! processes, [`MemoryRuntime`] keeps everything in memory and runs scripted
//! programs.

pub mod error;
pub mod host;
pub mod memory;
pub mod path;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub use error::SandboxError;
pub use host::{HostRuntime, HostSandbox};
pub use memory::{MemoryRuntime, MemorySandbox, Program};
pub use sandpad_protocol::{ProcessId, SeedTree};

/// Bound on queued output chunks / input writes per process.
pub const PIPE_CAPACITY: usize = 256;

/// Exit code reported for a process that was killed instead of exiting on its own.
pub const TERMINATED_EXIT_CODE: i32 = -1;

/// Capacity of the server-ready broadcast channel.
pub const SERVER_READY_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A server inside the sandbox started listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Handle to a spawned process.
///
/// `output` yields chunks in the order the process produced them and closes
/// once the process has exited and its pipes are drained; it cannot be
/// restarted. `exit` resolves with the exit code. Cancelling `kill`
/// terminates the process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub id: ProcessId,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Sender<Vec<u8>>,
    pub exit: oneshot::Receiver<i32>,
    pub kill: CancellationToken,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Boot a fresh sandbox instance.
    async fn boot(&self) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Populate the file system from a seed tree.
    async fn mount(&self, tree: &SeedTree) -> Result<(), SandboxError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError>;

    async fn spawn(&self, command: &str, args: &[String]) -> Result<ProcessHandle, SandboxError>;

    /// Subscribe to server-ready notifications. Each event is delivered once per receiver.
    fn server_ready(&self) -> broadcast::Receiver<ServerReady>;
}
