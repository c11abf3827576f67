pub mod paths;
pub mod seed;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use seed::{SeedNode, SeedTree};

/// Version announced in the `hello` frame.
pub const PROTOCOL_VERSION: u32 = 1;

/// Edits carry whole file contents, so lines can get large.
pub const MAX_JSON_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Identifier the sandbox assigns to a spawned process.
pub type ProcessId = String;

/// Lifecycle of the single runtime session owned by a coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Booting,
    Ready,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Failed)
    }
}

/// One entry of a directory listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub is_directory: bool,
}

impl FileEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: false,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_directory: true,
        }
    }
}

/// The file currently open in the editor and the last content the catalog knows of.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActiveFile {
    pub path: String,
    pub content: String,
}

/// Category of long-lived child process tracked by the process controller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Install,
    Serve,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Install => f.write_str("install"),
            RunKind::Serve => f.write_str("serve"),
        }
    }
}

/// Status of one run-kind.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Done {
        exit_code: i32,
    },
}

impl RunStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, RunStatus::Running)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunStatus::Done { exit_code } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

/// Result of asking the process controller to start a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    Blocked { by: RunKind },
}

/// Result of attaching a console sink.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachOutcome {
    Attached,
    AlreadyAttached,
}

/// Where the most recently announced server can be reached.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PreviewAddress {
    pub port: u16,
    pub url: String,
}

/// Everything a rendering shell needs to draw the IDE.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_error: Option<String>,
    pub sidebar_open: bool,
    pub loading: bool,
    pub files: Vec<FileEntry>,
    pub active_file: Option<ActiveFile>,
    pub installing: bool,
    pub server_running: bool,
    pub install: RunStatus,
    pub serve: RunStatus,
    pub preview: Option<PreviewAddress>,
}

/// One sequence-numbered slice of console output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsoleChunk {
    pub seq: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Observable state changes published by the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SessionStateChanged {
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FilesRefreshed {
        files: Vec<FileEntry>,
    },
    ActiveFileChanged {
        path: String,
    },
    FileError {
        path: String,
        message: String,
    },
    WriteFailed {
        path: String,
        message: String,
    },
    RunStatusChanged {
        kind: RunKind,
        status: RunStatus,
    },
    PreviewChanged {
        port: u16,
        url: String,
    },
    SidebarToggled {
        open: bool,
    },
    ConsoleOutput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
}

/// Rendering-shell requests sent as JSON lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Snapshot,
    SetSidebar {
        open: bool,
    },
    RefreshFiles,
    SelectFile {
        path: String,
    },
    EditActiveFile {
        content: String,
    },
    Flush,
    StartInstall,
    StartServe,
    ConsoleAttach,
    ConsoleInput {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ConsoleHistory {
        #[serde(default)]
        last_seq: Option<u64>,
    },
    Subscribe,
    Unsubscribe,
    Shutdown,
}

/// Daemon-to-shell frames.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Hello {
        protocol_version: u32,
        #[serde(default)]
        features: Vec<String>,
    },
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Event(Event),
}

impl Response {
    pub fn hello(features: Vec<String>) -> Self {
        Response::Hello {
            protocol_version: PROTOCOL_VERSION,
            features,
        }
    }

    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
            code,
        }
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotReady,
    AlreadyBooted,
    BootFailed,
    FileNotFound,
    FileIo,
    NoActiveFile,
    SpawnFailed,
    Disposed,
    InvalidRequest,
    ServerError,
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
