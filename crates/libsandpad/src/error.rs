use thiserror::Error;

use sandpad_protocol::{ErrorCode, SessionState};
use sandpad_sandbox::SandboxError;

#[derive(Error, Debug)]
pub enum SandpadError {
    #[error("boot failed: {0}")]
    Boot(String),

    #[error("runtime session already booted")]
    AlreadyBooted,

    #[error("runtime session is not ready (state: {0:?})")]
    NotReady(SessionState),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file error on {path}: {message}")]
    FileIo { path: String, message: String },

    #[error("no file is selected")]
    NoActiveFile,

    #[error("failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("coordinator disposed")]
    Disposed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandpadError {
    /// Map a sandbox failure on `path` into the file error taxonomy.
    pub fn from_file_op(path: &str, err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(_) => SandpadError::FileNotFound(path.to_string()),
            other => SandpadError::FileIo {
                path: path.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            SandpadError::Boot(_) => (ErrorCode::BootFailed, self.to_string()),
            SandpadError::AlreadyBooted => (ErrorCode::AlreadyBooted, self.to_string()),
            SandpadError::NotReady(_) => (ErrorCode::NotReady, self.to_string()),
            SandpadError::FileNotFound(_) => (ErrorCode::FileNotFound, self.to_string()),
            SandpadError::FileIo { .. } => (ErrorCode::FileIo, self.to_string()),
            SandpadError::NoActiveFile => (ErrorCode::NoActiveFile, self.to_string()),
            SandpadError::Spawn { .. } => (ErrorCode::SpawnFailed, self.to_string()),
            SandpadError::Disposed => (ErrorCode::Disposed, self.to_string()),
            SandpadError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
