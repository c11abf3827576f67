use std::path::PathBuf;

/// Returns the default runtime directory for the sandpad daemon.
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("sandpad")
    } else {
        // SAFETY: getuid() is always safe to call and has no preconditions
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/sandpad-{uid}"))
    }
}

/// Returns the default socket path for the sandpad daemon.
pub fn default_socket_path() -> PathBuf {
    default_runtime_dir().join("sandpad.sock")
}

/// Returns the config/data directory path for sandpad.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("sandpad")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("sandpad")
    } else {
        PathBuf::from("/tmp/sandpad")
    }
}

/// Returns the config file path for the sandpad daemon.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
