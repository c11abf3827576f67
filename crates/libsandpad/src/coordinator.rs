//! The coordinator behind one IDE window.
//!
//! A [`Coordinator`] wires one [`RuntimeSession`] to the file catalog, the
//! install/serve controller and the interactive console, and exposes the
//! result as commands plus observable state. Rendering shells call commands,
//! read [`Snapshot`]s and follow the [`Event`] stream; they never touch the
//! sandbox directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use sandpad_protocol::{
    ActiveFile, AttachOutcome, ConsoleChunk, Event, FileEntry, PreviewAddress, SeedTree,
    SessionState, Snapshot, StartOutcome,
};
use sandpad_sandbox::Runtime;

use crate::broker::EventBroker;
use crate::catalog::FileCatalog;
use crate::config::CoordinatorConfig;
use crate::console::{ConsoleSink, InteractiveConsole};
use crate::error::SandpadError;
use crate::output::{ConsoleOutput, HistoryLog};
use crate::process::ProcessController;
use crate::session::RuntimeSession;

pub struct Coordinator {
    config: CoordinatorConfig,
    events: Arc<EventBroker>,
    output: Arc<ConsoleOutput>,
    session: Arc<RuntimeSession>,
    catalog: FileCatalog,
    processes: ProcessController,
    console: InteractiveConsole,
    sidebar_open: AtomicBool,
}

impl Coordinator {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        seed: SeedTree,
        config: CoordinatorConfig,
    ) -> Result<Self, SandpadError> {
        let history = match &config.console_log {
            Some(path) => Some(HistoryLog::open(path)?),
            None => None,
        };
        let events = Arc::new(EventBroker::new(config.event_capacity));
        let output = Arc::new(ConsoleOutput::new(config.console_buffer_chunks, history));
        let session = Arc::new(RuntimeSession::new(
            runtime,
            seed,
            config.boot_timeout(),
            Arc::clone(&events),
        ));
        let catalog = FileCatalog::new(Arc::clone(&session), Arc::clone(&events));
        let processes = ProcessController::new(
            Arc::clone(&session),
            Arc::clone(&output),
            Arc::clone(&events),
            config.install.clone(),
            config.serve.clone(),
        );
        let console = InteractiveConsole::new(
            Arc::clone(&session),
            Arc::clone(&output),
            config.shell.clone(),
        );

        Ok(Self {
            config,
            events,
            output,
            session,
            catalog,
            processes,
            console,
            sidebar_open: AtomicBool::new(true),
        })
    }

    /// Boot the sandbox, list the root and open the initial file.
    pub async fn boot(&self) -> Result<(), SandpadError> {
        self.session.boot().await?;
        self.catalog.refresh().await?;

        if let Some(initial) = self.config.initial_file.as_deref() {
            if self.catalog.contains(initial) {
                if let Err(err) = self.catalog.select(initial).await {
                    warn!(path = initial, "could not open initial file: {err}");
                }
            } else {
                info!(path = initial, "initial file not in listing, nothing selected");
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.session.state();
        let install = self.processes.install_status();
        let serve = self.processes.serve_status();
        Snapshot {
            state,
            boot_error: self.session.boot_error(),
            sidebar_open: self.sidebar_open.load(Ordering::SeqCst),
            loading: state == SessionState::Booting,
            files: self.catalog.files(),
            active_file: self.catalog.active(),
            installing: install.is_running(),
            server_running: serve.is_running(),
            install,
            serve,
            preview: self.session.current_preview(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn preview(&self) -> watch::Receiver<Option<PreviewAddress>> {
        self.session.preview()
    }

    pub fn set_sidebar_open(&self, open: bool) {
        if self.sidebar_open.swap(open, Ordering::SeqCst) != open {
            self.events.broadcast(Event::SidebarToggled { open });
        }
    }

    pub async fn refresh_files(&self) -> Result<Vec<FileEntry>, SandpadError> {
        self.ensure_live()?;
        self.catalog.refresh().await
    }

    pub async fn select_file(&self, path: &str) -> Result<ActiveFile, SandpadError> {
        self.ensure_live()?;
        self.catalog.select(path).await
    }

    pub fn edit_active_file(&self, content: String) -> Result<(), SandpadError> {
        self.ensure_live()?;
        self.catalog.edit(content)
    }

    pub async fn start_install(&self) -> Result<StartOutcome, SandpadError> {
        self.ensure_live()?;
        self.processes.start_install().await
    }

    pub async fn start_serve(&self) -> Result<StartOutcome, SandpadError> {
        self.ensure_live()?;
        self.processes.start_serve().await
    }

    pub async fn attach_console<S: ConsoleSink>(
        &self,
        sink: S,
        input: mpsc::Receiver<Vec<u8>>,
    ) -> Result<AttachOutcome, SandpadError> {
        self.ensure_live()?;
        self.console.attach(sink, input).await
    }

    /// Console scrollback after `last_seq`.
    pub fn console_history(&self, last_seq: Option<u64>) -> Vec<ConsoleChunk> {
        self.output
            .replay(last_seq)
            .iter()
            .map(ConsoleChunk::from)
            .collect()
    }

    /// Wait for every queued file write to land. Fails with the first write
    /// that did not.
    pub async fn flush_writes(&self) -> Result<(), SandpadError> {
        self.ensure_live()?;
        self.session.flush_all().await
    }

    /// Stop the shell and every process, flush writes, then refuse all
    /// further commands.
    pub async fn dispose(&self) {
        if self.session.is_disposed() {
            return;
        }
        info!("disposing coordinator");
        self.console.dispose();
        self.processes.dispose();
        self.session.dispose().await;
    }

    pub fn session(&self) -> &Arc<RuntimeSession> {
        &self.session
    }

    pub fn processes(&self) -> &ProcessController {
        &self.processes
    }

    pub fn output(&self) -> &Arc<ConsoleOutput> {
        &self.output
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn ensure_live(&self) -> Result<(), SandpadError> {
        if self.session.is_disposed() {
            Err(SandpadError::Disposed)
        } else {
            Ok(())
        }
    }
}
