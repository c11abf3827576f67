use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sandpad_protocol::{Event, FileEntry, PreviewAddress, SeedTree, SessionState};
use sandpad_sandbox::{ProcessHandle, Runtime, Sandbox, SandboxError, path};

use crate::broker::EventBroker;
use crate::error::SandpadError;
use crate::writer::{FlushAck, PathWriter};

/// Cancels the underlying listener when dropped.
#[must_use = "dropping a subscription cancels it"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {}

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns the one sandbox a coordinator talks to.
///
/// Every other component reaches the sandbox through this type, so nothing
/// can write files or spawn processes before boot finished or after it failed.
pub struct RuntimeSession {
    runtime: Arc<dyn Runtime>,
    seed: SeedTree,
    boot_timeout: Option<Duration>,
    events: Arc<EventBroker>,
    boot_claimed: AtomicBool,
    disposed: AtomicBool,
    state_tx: watch::Sender<SessionState>,
    boot_error: Mutex<Option<String>>,
    sandbox: OnceLock<Arc<dyn Sandbox>>,
    writers: Mutex<HashMap<String, PathWriter>>,
    preview_tx: Arc<watch::Sender<Option<PreviewAddress>>>,
    preview_listener: Mutex<Option<Subscription>>,
}

impl RuntimeSession {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        seed: SeedTree,
        boot_timeout: Option<Duration>,
        events: Arc<EventBroker>,
    ) -> Self {
        let (state_tx, _rx) = watch::channel(SessionState::Booting);
        let (preview_tx, _rx) = watch::channel(None);
        Self {
            runtime,
            seed,
            boot_timeout,
            events,
            boot_claimed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            state_tx,
            boot_error: Mutex::new(None),
            sandbox: OnceLock::new(),
            writers: Mutex::new(HashMap::new()),
            preview_tx: Arc::new(preview_tx),
            preview_listener: Mutex::new(None),
        }
    }

    /// Boot the runtime and mount the seed tree. Runs at most once; any
    /// further call, concurrent or not, fails with `AlreadyBooted`.
    pub async fn boot(&self) -> Result<(), SandpadError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SandpadError::Disposed);
        }
        if self.boot_claimed.swap(true, Ordering::SeqCst) {
            warn!("boot requested more than once");
            return Err(SandpadError::AlreadyBooted);
        }

        info!(timeout = ?self.boot_timeout, "booting runtime session");
        let deadline = self.boot_timeout.map(|limit| Instant::now() + limit);

        let sandbox = match within(deadline, self.runtime.boot()).await {
            Some(Ok(sandbox)) => sandbox,
            Some(Err(err)) => return Err(self.fail_boot(err.to_string())),
            None => return Err(self.fail_boot(self.timeout_message("boot"))),
        };

        // Listen before mounting so no announcement can slip past.
        let listener = self.listen_for_servers(sandbox.as_ref());

        match within(deadline, sandbox.mount(&self.seed)).await {
            Some(Ok(())) => {}
            Some(Err(err)) => return Err(self.fail_boot(format!("mount failed: {err}"))),
            None => return Err(self.fail_boot(self.timeout_message("mount"))),
        }

        *self
            .preview_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
        if self.sandbox.set(sandbox).is_err() {
            // Unreachable while boot_claimed guards entry.
            return Err(SandpadError::AlreadyBooted);
        }
        self.set_state(SessionState::Ready, None);
        info!("runtime session ready");
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn boot_error(&self) -> Option<String> {
        self.boot_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub async fn list_top_level_files(&self) -> Result<Vec<FileEntry>, SandpadError> {
        let sandbox = self.require_ready()?;
        let entries = sandbox
            .read_dir("/")
            .await
            .map_err(|err| SandpadError::from_file_op("/", err))?;
        Ok(entries
            .into_iter()
            .map(|entry| FileEntry {
                is_directory: entry.is_directory(),
                name: entry.name,
            })
            .collect())
    }

    pub async fn read_file(&self, file: &str) -> Result<String, SandpadError> {
        let sandbox = self.require_ready()?;
        let key = path::normalize(file).map_err(|err| SandpadError::from_file_op(file, err))?;
        sandbox
            .read_file(&format!("/{key}"))
            .await
            .map_err(|err| SandpadError::from_file_op(file, err))
    }

    /// Queue a write. Returns as soon as the write is queued; writes to the
    /// same path land in the order they were queued.
    pub fn write_file(&self, file: &str, content: String) -> Result<(), SandpadError> {
        let sandbox = self.require_ready()?;
        let key = path::normalize(file).map_err(|err| SandpadError::from_file_op(file, err))?;

        let mut writers = self.writers.lock().unwrap_or_else(|e| e.into_inner());
        let writer = writers.entry(key.clone()).or_insert_with(|| {
            debug!(path = %key, "starting path writer");
            PathWriter::spawn(Arc::clone(sandbox), key.clone(), Arc::clone(&self.events))
        });
        if writer.enqueue(content) {
            Ok(())
        } else {
            Err(SandpadError::Disposed)
        }
    }

    /// Wait until every write queued for `file` so far is durable. Fails
    /// with `FileIo` if the latest write to `file` did not land.
    pub async fn flush(&self, file: &str) -> Result<(), SandpadError> {
        let key = path::normalize(file).map_err(|err| SandpadError::from_file_op(file, err))?;
        let ack = self
            .writers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .and_then(PathWriter::flush);
        match ack {
            Some(ack) => settle(key, ack).await,
            None => Ok(()),
        }
    }

    /// Flush every path. Every queue is drained; the first failure is
    /// returned.
    pub async fn flush_all(&self) -> Result<(), SandpadError> {
        let acks: Vec<_> = self
            .writers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(key, writer)| writer.flush().map(|ack| (key.clone(), ack)))
            .collect();
        let mut first = None;
        for (key, ack) in acks {
            if let Err(err) = settle(key, ack).await {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
    ) -> Result<ProcessHandle, SandpadError> {
        let sandbox = self.require_ready().map_err(|err| match err {
            SandpadError::Disposed => SandpadError::Disposed,
            other => SandpadError::Spawn {
                command: command.to_string(),
                message: other.to_string(),
            },
        })?;

        sandbox
            .spawn(command, args)
            .await
            .map_err(|err| SandpadError::Spawn {
                command: command.to_string(),
                message: match err {
                    SandboxError::Spawn { message, .. } => message,
                    other => other.to_string(),
                },
            })
    }

    /// Invoke `callback` with `(port, url)` for every server-ready event from
    /// now on, until the returned subscription is dropped.
    pub fn on_server_ready<F>(&self, mut callback: F) -> Result<Subscription, SandpadError>
    where
        F: FnMut(u16, &str) + Send + 'static,
    {
        let sandbox = self.require_ready()?;
        let mut rx = sandbox.server_ready();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ready) => callback(ready.port, &ready.url),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "server-ready listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription { task })
    }

    /// Latest server-ready address; each new event replaces the previous one.
    pub fn preview(&self) -> watch::Receiver<Option<PreviewAddress>> {
        self.preview_tx.subscribe()
    }

    pub fn current_preview(&self) -> Option<PreviewAddress> {
        self.preview_tx.borrow().clone()
    }

    /// Flush pending writes, then stop every background task. All later
    /// operations fail with `Disposed`.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.flush_all().await {
            warn!("pending write lost on dispose: {err}");
        }
        for (_, writer) in self
            .writers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
        {
            writer.abort();
        }
        if let Some(listener) = self
            .preview_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.cancel();
        }
        info!("runtime session disposed");
    }

    fn require_ready(&self) -> Result<&Arc<dyn Sandbox>, SandpadError> {
        if self.is_disposed() {
            return Err(SandpadError::Disposed);
        }
        self.sandbox
            .get()
            .ok_or_else(|| SandpadError::NotReady(self.state()))
    }

    fn listen_for_servers(&self, sandbox: &dyn Sandbox) -> Subscription {
        let mut rx = sandbox.server_ready();
        let preview_tx = Arc::clone(&self.preview_tx);
        let events = Arc::clone(&self.events);
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ready) => {
                        info!(port = ready.port, url = %ready.url, "server ready");
                        preview_tx.send_replace(Some(PreviewAddress {
                            port: ready.port,
                            url: ready.url.clone(),
                        }));
                        events.broadcast(Event::PreviewChanged {
                            port: ready.port,
                            url: ready.url,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "preview listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }

    fn fail_boot(&self, message: String) -> SandpadError {
        error!("runtime session failed to boot: {message}");
        *self.boot_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());
        self.set_state(SessionState::Failed, Some(message.clone()));
        SandpadError::Boot(message)
    }

    fn timeout_message(&self, stage: &str) -> String {
        match self.boot_timeout {
            Some(limit) => format!("{stage} timed out after {}ms", limit.as_millis()),
            None => format!("{stage} timed out"),
        }
    }

    fn set_state(&self, state: SessionState, error: Option<String>) {
        self.state_tx.send_replace(state);
        self.events
            .broadcast(Event::SessionStateChanged { state, error });
    }
}

async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn settle(path: String, ack: FlushAck) -> Result<(), SandpadError> {
    match ack.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(message)) => Err(SandpadError::FileIo { path, message }),
        // Writer task gone.
        Err(_) => Err(SandpadError::Disposed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandpad_sandbox::{MemoryRuntime, Program};

    fn seed() -> SeedTree {
        SeedTree::new()
            .with_file("index.js", "console.log('hi')")
            .with_file("package.json", "{}")
    }

    fn session_with(runtime: Arc<MemoryRuntime>, timeout: Option<Duration>) -> RuntimeSession {
        RuntimeSession::new(runtime, seed(), timeout, Arc::new(EventBroker::new(64)))
    }

    #[tokio::test]
    async fn boot_runs_once() {
        let runtime = Arc::new(MemoryRuntime::new());
        let session = session_with(Arc::clone(&runtime), None);

        session.boot().await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(matches!(
            session.boot().await,
            Err(SandpadError::AlreadyBooted)
        ));
        assert_eq!(runtime.boot_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_boot_creates_one_sandbox() {
        let runtime =
            Arc::new(MemoryRuntime::new().with_boot_delay(Duration::from_millis(50)));
        let session = session_with(Arc::clone(&runtime), None);

        let (first, second) = tokio::join!(session.boot(), session.boot());
        assert!(first.is_ok() ^ second.is_ok());
        assert_eq!(runtime.boot_count(), 1);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn boot_failure_is_terminal() {
        let runtime = Arc::new(MemoryRuntime::new().failing_boot("SharedArrayBuffer unavailable"));
        let session = session_with(Arc::clone(&runtime), None);

        let err = session.boot().await.unwrap_err();
        assert!(matches!(err, SandpadError::Boot(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.boot_error().unwrap().contains("SharedArrayBuffer"));

        assert!(matches!(
            session.boot().await,
            Err(SandpadError::AlreadyBooted)
        ));
        assert_eq!(runtime.boot_count(), 1);
        assert!(matches!(
            session.list_top_level_files().await,
            Err(SandpadError::NotReady(SessionState::Failed))
        ));
    }

    #[tokio::test]
    async fn boot_timeout_fails_session() {
        let runtime =
            Arc::new(MemoryRuntime::new().with_boot_delay(Duration::from_millis(500)));
        let session = session_with(runtime, Some(Duration::from_millis(20)));

        let err = session.boot().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn operations_before_boot_fail_loudly() {
        let session = session_with(Arc::new(MemoryRuntime::new()), None);
        assert!(matches!(
            session.list_top_level_files().await,
            Err(SandpadError::NotReady(SessionState::Booting))
        ));
        assert!(matches!(
            session.read_file("index.js").await,
            Err(SandpadError::NotReady(_))
        ));
        assert!(matches!(
            session.write_file("index.js", "x".into()),
            Err(SandpadError::NotReady(_))
        ));
        assert!(matches!(
            session.spawn_process("npm", &[]).await,
            Err(SandpadError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn lists_seed_in_listing_order() {
        let session = session_with(Arc::new(MemoryRuntime::new()), None);
        session.boot().await.unwrap();
        let names: Vec<String> = session
            .list_top_level_files()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["index.js", "package.json"]);
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() {
        let session = session_with(Arc::new(MemoryRuntime::new()), None);
        session.boot().await.unwrap();
        assert_eq!(
            session.read_file("/index.js").await.unwrap(),
            "console.log('hi')"
        );
        assert!(matches!(
            session.read_file("missing.js").await,
            Err(SandpadError::FileNotFound(p)) if p == "missing.js"
        ));
    }

    #[tokio::test]
    async fn slow_early_write_does_not_overtake_later_one() {
        let runtime = Arc::new(MemoryRuntime::new().with_write_latency(|_, content| {
            if content == "first" {
                Duration::from_millis(80)
            } else {
                Duration::from_millis(1)
            }
        }));
        let session = session_with(Arc::clone(&runtime), None);
        session.boot().await.unwrap();

        session.write_file("index.js", "first".into()).unwrap();
        session.write_file("/index.js", "second".into()).unwrap();
        session.write_file("index.js", "third".into()).unwrap();
        session.flush("index.js").await.unwrap();

        let sandbox = runtime.sandbox().unwrap();
        assert_eq!(sandbox.file("index.js").as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn flush_reports_failed_write_until_a_later_one_lands() {
        let runtime = Arc::new(MemoryRuntime::new().with_write_fault(|_, content| {
            (content == "bad").then(|| "disk full".to_string())
        }));
        let session = session_with(Arc::clone(&runtime), None);
        session.boot().await.unwrap();
        let mut events = session.events.subscribe();

        session.write_file("index.js", "bad".into()).unwrap();
        let err = session.flush("index.js").await.unwrap_err();
        assert!(
            matches!(err, SandpadError::FileIo { ref path, ref message } if path == "index.js" && message.contains("disk full"))
        );
        assert!(matches!(session.flush_all().await, Err(SandpadError::FileIo { .. })));
        assert!(matches!(
            events.recv().await.unwrap(),
            Event::WriteFailed { path, .. } if path == "index.js"
        ));
        let sandbox = runtime.sandbox().unwrap();
        assert_eq!(sandbox.file("index.js").as_deref(), Some("console.log('hi')"));

        session.write_file("index.js", "good".into()).unwrap();
        session.flush("index.js").await.unwrap();
        session.flush_all().await.unwrap();
        assert_eq!(sandbox.file("index.js").as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn server_ready_callback_and_last_wins_preview() {
        let runtime = Arc::new(MemoryRuntime::new());
        let session = session_with(Arc::clone(&runtime), None);
        session.boot().await.unwrap();

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = session
            .on_server_ready(move |port, url| {
                let _ = seen_tx.send((port, url.to_string()));
            })
            .unwrap();
        assert!(subscription.is_active());

        let mut preview = session.preview();
        let sandbox = runtime.sandbox().unwrap();
        sandbox.announce(3000, "https://preview.example");
        assert_eq!(
            seen_rx.recv().await,
            Some((3000, "https://preview.example".to_string()))
        );
        preview.changed().await.unwrap();
        assert_eq!(
            preview.borrow_and_update().as_ref().map(|p| p.port),
            Some(3000)
        );

        subscription.cancel();
        sandbox.announce(3001, "https://other.example");
        preview.changed().await.unwrap();
        assert_eq!(
            session.current_preview(),
            Some(PreviewAddress {
                port: 3001,
                url: "https://other.example".to_string()
            })
        );
        assert!(seen_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dispose_flushes_then_rejects() {
        let runtime = Arc::new(
            MemoryRuntime::new()
                .with_write_latency(|_, _| Duration::from_millis(20))
                .with_program("npm", Program::new().exits_with(0)),
        );
        let session = session_with(Arc::clone(&runtime), None);
        session.boot().await.unwrap();

        session.write_file("notes.txt", "kept".into()).unwrap();
        session.dispose().await;

        assert_eq!(
            runtime.sandbox().unwrap().file("notes.txt").as_deref(),
            Some("kept")
        );
        assert!(matches!(
            session.write_file("notes.txt", "late".into()),
            Err(SandpadError::Disposed)
        ));
        assert!(matches!(
            session.spawn_process("npm", &[]).await,
            Err(SandpadError::Disposed)
        ));
    }
}
