use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use sandpad_protocol::{ActiveFile, Event, FileEntry};

use crate::broker::EventBroker;
use crate::error::SandpadError;
use crate::session::RuntimeSession;

/// Top-level listing plus the one file open in the editor.
pub struct FileCatalog {
    session: Arc<RuntimeSession>,
    events: Arc<EventBroker>,
    files: Mutex<Vec<FileEntry>>,
    active: Mutex<Option<ActiveFile>>,
    // Bumped by every select; only the newest ticket may install its result.
    select_generation: AtomicU64,
}

impl FileCatalog {
    pub fn new(session: Arc<RuntimeSession>, events: Arc<EventBroker>) -> Self {
        Self {
            session,
            events,
            files: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            select_generation: AtomicU64::new(0),
        }
    }

    /// Re-list the sandbox root and replace the listing wholesale.
    pub async fn refresh(&self) -> Result<Vec<FileEntry>, SandpadError> {
        let listing = self.session.list_top_level_files().await?;
        debug!(count = listing.len(), "file listing refreshed");
        *self.files.lock().unwrap_or_else(|e| e.into_inner()) = listing.clone();
        self.events.broadcast(Event::FilesRefreshed {
            files: listing.clone(),
        });
        Ok(listing)
    }

    /// Open `path`. The current file stays active until the read succeeds;
    /// a failed read leaves it untouched.
    ///
    /// Returns the file active once the call settles. If a newer select
    /// started while this one was reading, its result is discarded and the
    /// newer selection (or, while that is still loading, the previously
    /// active file) is returned instead. Only when nothing is active yet is
    /// the discarded read handed back.
    pub async fn select(&self, path: &str) -> Result<ActiveFile, SandpadError> {
        let ticket = self.select_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let content = match self.session.read_file(path).await {
            Ok(content) => content,
            Err(err) => {
                warn!(path, "select failed: {err}");
                self.events.broadcast(Event::FileError {
                    path: path.to_string(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        let selected = ActiveFile {
            path: path.to_string(),
            content,
        };
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if self.select_generation.load(Ordering::SeqCst) != ticket {
                debug!(path, "select superseded by a newer one");
                return Ok(active.clone().unwrap_or(selected));
            }
            *active = Some(selected.clone());
        }
        info!(path, "active file changed");
        self.events.broadcast(Event::ActiveFileChanged {
            path: path.to_string(),
        });
        Ok(selected)
    }

    /// Replace the active file's content and queue the write.
    pub fn edit(&self, content: String) -> Result<(), SandpadError> {
        let path = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            let file = active.as_mut().ok_or(SandpadError::NoActiveFile)?;
            file.content.clone_from(&content);
            file.path.clone()
        };
        self.session.write_file(&path, content)
    }

    pub fn files(&self) -> Vec<FileEntry> {
        self.files.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|entry| entry.name == name && !entry.is_directory)
    }

    pub fn active(&self) -> Option<ActiveFile> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
