use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;
pub const DEFAULT_CONSOLE_BUFFER_CHUNKS: usize = 10_000;
pub const DEFAULT_BOOT_TIMEOUT_MS: u64 = 60_000;

/// A program plus its arguments, as spawned inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Tunables for one coordinator. Every field has a default, so a partial
/// `[coordinator]` table in the daemon config is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Interactive shell attached to the console.
    pub shell: CommandSpec,
    /// Dependency installation command.
    pub install: CommandSpec,
    /// Long-running server command.
    pub serve: CommandSpec,
    /// File opened right after boot, if the listing contains it.
    pub initial_file: Option<String>,
    /// Budget for boot plus seed mount. `0` waits forever.
    pub boot_timeout_ms: u64,
    pub console_buffer_chunks: usize,
    pub event_capacity: usize,
    /// Append-only transcript of console output.
    pub console_log: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shell: CommandSpec::new("jsh", &[]),
            install: CommandSpec::new("npm", &["install"]),
            serve: CommandSpec::new("npm", &["run", "start"]),
            initial_file: Some("index.js".to_string()),
            boot_timeout_ms: DEFAULT_BOOT_TIMEOUT_MS,
            console_buffer_chunks: DEFAULT_CONSOLE_BUFFER_CHUNKS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            console_log: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn boot_timeout(&self) -> Option<Duration> {
        (self.boot_timeout_ms > 0).then(|| Duration::from_millis(self.boot_timeout_ms))
    }
}
