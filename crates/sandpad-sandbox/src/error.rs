use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("boot failed: {0}")]
    Boot(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("failed to spawn {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    /// Wrap an I/O error for `path`, folding `NotFound` into its own variant.
    pub fn io(path: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            SandboxError::NotFound(path.to_string())
        } else {
            SandboxError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}
