use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sandpad_protocol::{Event, RunKind, RunStatus, StartOutcome};
use sandpad_sandbox::{ProcessHandle, TERMINATED_EXIT_CODE};

use crate::broker::EventBroker;
use crate::config::CommandSpec;
use crate::error::SandpadError;
use crate::output::ConsoleOutput;
use crate::session::RuntimeSession;

pub const INSTALL_BANNER: &str = "\x1b[33mInstalling dependencies...\x1b[0m";
pub const INSTALL_SUCCEEDED: &str = "\x1b[32mDependencies installed successfully!\x1b[0m";
pub const SERVE_BANNER: &str = "\x1b[33mStarting server...\x1b[0m";

pub fn install_failed_line(exit_code: i32) -> String {
    format!("\x1b[31mInstallation failed with exit code {exit_code}\x1b[0m")
}

fn spawn_failed_line(command: &CommandSpec, err: &SandpadError) -> String {
    format!("\x1b[31mFailed to start `{command}`: {err}\x1b[0m")
}

struct Running {
    kill: CancellationToken,
    pump: JoinHandle<()>,
}

/// Live runs. Once `disposed` is set nothing new is tracked.
#[derive(Default)]
struct Runs {
    disposed: bool,
    live: Vec<Running>,
}

/// Runs the install and serve commands and streams their output to the
/// console.
///
/// Each run kind has its own status channel. At most one run of each kind is
/// alive at a time, and serve waits for a running install to finish.
pub struct ProcessController {
    session: Arc<RuntimeSession>,
    console: Arc<ConsoleOutput>,
    events: Arc<EventBroker>,
    install_cmd: CommandSpec,
    serve_cmd: CommandSpec,
    install: Arc<watch::Sender<RunStatus>>,
    serve: Arc<watch::Sender<RunStatus>>,
    // Held while checking and claiming a run kind.
    claim: Mutex<()>,
    runs: Mutex<Runs>,
}

impl ProcessController {
    pub fn new(
        session: Arc<RuntimeSession>,
        console: Arc<ConsoleOutput>,
        events: Arc<EventBroker>,
        install_cmd: CommandSpec,
        serve_cmd: CommandSpec,
    ) -> Self {
        let (install, _rx) = watch::channel(RunStatus::Idle);
        let (serve, _rx) = watch::channel(RunStatus::Idle);
        Self {
            session,
            console,
            events,
            install_cmd,
            serve_cmd,
            install: Arc::new(install),
            serve: Arc::new(serve),
            claim: Mutex::new(()),
            runs: Mutex::new(Runs::default()),
        }
    }

    pub async fn start_install(&self) -> Result<StartOutcome, SandpadError> {
        self.ensure_live()?;
        {
            let _claim = self.claim.lock().unwrap_or_else(|e| e.into_inner());
            if !claim(&self.install) {
                info!("install already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        self.publish(RunKind::Install, RunStatus::Running);
        self.console.write_line(INSTALL_BANNER);

        let handle = self.spawn(RunKind::Install, &self.install_cmd).await?;
        info!(id = %handle.id, command = %self.install_cmd, "install started");

        let console = Arc::clone(&self.console);
        let events = Arc::clone(&self.events);
        let status = Arc::clone(&self.install);
        self.track(handle, move |exit_code| {
            if exit_code == 0 {
                info!("install finished");
                console.write_line(INSTALL_SUCCEEDED);
            } else {
                warn!(exit_code, "install failed");
                console.write_line(&install_failed_line(exit_code));
            }
            let done = RunStatus::Done { exit_code };
            status.send_replace(done);
            events.broadcast(Event::RunStatusChanged {
                kind: RunKind::Install,
                status: done,
            });
        })?;
        Ok(StartOutcome::Started)
    }

    pub async fn start_serve(&self) -> Result<StartOutcome, SandpadError> {
        self.ensure_live()?;
        {
            let _claim = self.claim.lock().unwrap_or_else(|e| e.into_inner());
            if self.install.borrow().is_running() {
                info!("serve blocked by running install");
                return Ok(StartOutcome::Blocked {
                    by: RunKind::Install,
                });
            }
            if !claim(&self.serve) {
                info!("server already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        self.publish(RunKind::Serve, RunStatus::Running);
        self.console.write_line(SERVE_BANNER);

        let handle = self.spawn(RunKind::Serve, &self.serve_cmd).await?;
        info!(id = %handle.id, command = %self.serve_cmd, "server started");

        let console = Arc::clone(&self.console);
        // The server stays marked running after its process exits.
        self.track(handle, move |exit_code| {
            warn!(exit_code, "server process exited");
            console.write_line(&format!(
                "\x1b[31mServer exited with code {exit_code}\x1b[0m"
            ));
        })?;
        Ok(StartOutcome::Started)
    }

    pub fn install_status(&self) -> RunStatus {
        *self.install.borrow()
    }

    pub fn serve_status(&self) -> RunStatus {
        *self.serve.borrow()
    }

    pub fn watch(&self, kind: RunKind) -> watch::Receiver<RunStatus> {
        match kind {
            RunKind::Install => self.install.subscribe(),
            RunKind::Serve => self.serve.subscribe(),
        }
    }

    /// Kill every process this controller started and stop their pumps.
    /// A spawn still in flight is killed as soon as it returns.
    pub fn dispose(&self) {
        let live = {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.disposed = true;
            std::mem::take(&mut runs.live)
        };
        for run in live {
            run.kill.cancel();
            run.pump.abort();
        }
    }

    async fn spawn(
        &self,
        kind: RunKind,
        command: &CommandSpec,
    ) -> Result<ProcessHandle, SandpadError> {
        match self
            .session
            .spawn_process(&command.program, &command.args)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(err) => {
                error!(%kind, command = %command, "spawn failed: {err}");
                self.console.write_line(&spawn_failed_line(command, &err));
                self.status_tx(kind).send_replace(RunStatus::Idle);
                self.publish(kind, RunStatus::Idle);
                Err(err)
            }
        }
    }

    /// Pump the process output into the console, then hand the exit code to
    /// `on_exit` once the output is drained.
    ///
    /// Fails with `Disposed`, killing the process, if `dispose` ran while the
    /// spawn was in flight.
    fn track<F>(&self, handle: ProcessHandle, on_exit: F) -> Result<(), SandpadError>
    where
        F: FnOnce(i32) + Send + 'static,
    {
        let ProcessHandle {
            id,
            mut output,
            exit,
            kill,
            ..
        } = handle;

        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.disposed {
            warn!(%id, "controller disposed during spawn; killing process");
            kill.cancel();
            return Err(SandpadError::Disposed);
        }
        runs.live.retain(|run| !run.pump.is_finished());

        let console = Arc::clone(&self.console);
        let pump = tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                console.write(chunk);
            }
            let exit_code = exit.await.unwrap_or(TERMINATED_EXIT_CODE);
            info!(%id, exit_code, "process exited");
            on_exit(exit_code);
        });
        runs.live.push(Running { kill, pump });
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), SandpadError> {
        if self.runs.lock().unwrap_or_else(|e| e.into_inner()).disposed {
            Err(SandpadError::Disposed)
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    fn live_runs(&self) -> usize {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .live
            .len()
    }

    fn status_tx(&self, kind: RunKind) -> &watch::Sender<RunStatus> {
        match kind {
            RunKind::Install => &self.install,
            RunKind::Serve => &self.serve,
        }
    }

    fn publish(&self, kind: RunKind, status: RunStatus) {
        self.events
            .broadcast(Event::RunStatusChanged { kind, status });
    }
}

/// Move `tx` to Running unless it already is. Returns whether it moved.
fn claim(tx: &watch::Sender<RunStatus>) -> bool {
    tx.send_if_modified(|status| {
        if status.is_running() {
            false
        } else {
            *status = RunStatus::Running;
            true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandpad_protocol::SeedTree;
    use sandpad_sandbox::{MemoryRuntime, Program};
    use std::time::Duration;

    struct Fixture {
        runtime: Arc<MemoryRuntime>,
        console: Arc<ConsoleOutput>,
        controller: ProcessController,
    }

    async fn fixture(runtime: MemoryRuntime) -> Fixture {
        let runtime = Arc::new(runtime);
        let events = Arc::new(EventBroker::new(64));
        let session = Arc::new(RuntimeSession::new(
            Arc::clone(&runtime) as Arc<dyn sandpad_sandbox::Runtime>,
            SeedTree::new(),
            None,
            Arc::clone(&events),
        ));
        session.boot().await.unwrap();
        let console = Arc::new(ConsoleOutput::new(128, None));
        let controller = ProcessController::new(
            session,
            Arc::clone(&console),
            events,
            CommandSpec::new("npm", &["install"]),
            CommandSpec::new("node", &["index.js"]),
        );
        Fixture {
            runtime,
            console,
            controller,
        }
    }

    fn transcript(console: &ConsoleOutput) -> String {
        console
            .replay(None)
            .iter()
            .map(|chunk| String::from_utf8_lossy(&chunk.data).into_owned())
            .collect()
    }

    async fn wait_done(controller: &ProcessController) -> RunStatus {
        let mut rx = controller.watch(RunKind::Install);
        let status = *rx
            .wait_for(|status| matches!(status, RunStatus::Done { .. }))
            .await
            .unwrap();
        status
    }

    #[tokio::test]
    async fn install_success_ends_with_success_line() {
        let f = fixture(
            MemoryRuntime::new()
                .with_program("npm", Program::new().output("added 2 packages\n").exits_with(0)),
        )
        .await;

        assert_eq!(
            f.controller.start_install().await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(wait_done(&f.controller).await, RunStatus::Done { exit_code: 0 });

        let text = transcript(&f.console);
        let banner = text.find("Installing dependencies...").unwrap();
        let output = text.find("added 2 packages").unwrap();
        assert!(banner < output);
        assert!(text.trim_end().ends_with(INSTALL_SUCCEEDED));
    }

    #[tokio::test]
    async fn install_failure_reports_exit_code() {
        let f = fixture(MemoryRuntime::new().with_program("npm", Program::new().exits_with(1))).await;

        f.controller.start_install().await.unwrap();
        let status = wait_done(&f.controller).await;
        assert_eq!(status, RunStatus::Done { exit_code: 1 });
        assert!(!status.succeeded());
        assert!(
            transcript(&f.console)
                .trim_end()
                .ends_with(&install_failed_line(1))
        );
    }

    #[tokio::test]
    async fn install_while_running_is_noop() {
        let f = fixture(
            MemoryRuntime::new().with_program(
                "npm",
                Program::new()
                    .output("working")
                    .chunk_delay(Duration::from_millis(50))
                    .exits_with(0),
            ),
        )
        .await;

        assert_eq!(
            f.controller.start_install().await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            f.controller.start_install().await.unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(f.runtime.sandbox().unwrap().spawn_count("npm"), 1);

        wait_done(&f.controller).await;
        assert_eq!(
            f.controller.start_install().await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(f.runtime.sandbox().unwrap().spawn_count("npm"), 2);
    }

    #[tokio::test]
    async fn spawn_failure_resets_to_idle() {
        let f = fixture(MemoryRuntime::new()).await;

        let err = f.controller.start_install().await.unwrap_err();
        assert!(matches!(err, SandpadError::Spawn { ref command, .. } if command == "npm"));
        assert_eq!(f.controller.install_status(), RunStatus::Idle);
        assert!(transcript(&f.console).contains("Failed to start `npm install`"));
    }

    #[tokio::test]
    async fn serve_is_blocked_by_running_install() {
        let f = fixture(
            MemoryRuntime::new()
                .with_program("npm", Program::new())
                .with_program("node", Program::new()),
        )
        .await;

        f.controller.start_install().await.unwrap();
        assert_eq!(
            f.controller.start_serve().await.unwrap(),
            StartOutcome::Blocked {
                by: RunKind::Install
            }
        );
        assert_eq!(f.runtime.sandbox().unwrap().spawn_count("node"), 0);
    }

    #[tokio::test]
    async fn serve_stays_running_after_exit() {
        let f = fixture(
            MemoryRuntime::new().with_program(
                "node",
                Program::new().output("listening\n").exits_with(0),
            ),
        )
        .await;

        assert_eq!(
            f.controller.start_serve().await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            f.controller.start_serve().await.unwrap(),
            StartOutcome::AlreadyRunning
        );

        let console = Arc::clone(&f.console);
        tokio::time::timeout(Duration::from_secs(5), async move {
            while !transcript(&console).contains("Server exited with code 0") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.controller.serve_status(), RunStatus::Running);
        assert!(transcript(&f.console).contains(SERVE_BANNER));
    }

    #[tokio::test]
    async fn dispose_kills_processes() {
        let f = fixture(MemoryRuntime::new().with_program("node", Program::new())).await;
        f.controller.start_serve().await.unwrap();

        f.controller.dispose();
        let record = &f.runtime.sandbox().unwrap().spawned()[0];
        assert!(record.kill.is_cancelled());
    }

    #[tokio::test]
    async fn dispose_during_spawn_kills_late_process() {
        let f = fixture(
            MemoryRuntime::new()
                .with_spawn_delay(Duration::from_millis(50))
                .with_program("node", Program::new()),
        )
        .await;

        let (outcome, ()) = tokio::join!(f.controller.start_serve(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.controller.dispose();
        });
        assert!(matches!(outcome, Err(SandpadError::Disposed)));
        let spawned = f.runtime.sandbox().unwrap().spawned();
        assert_eq!(spawned.len(), 1);
        assert!(spawned[0].kill.is_cancelled());
        assert_eq!(f.controller.live_runs(), 0);
        assert!(matches!(
            f.controller.start_install().await,
            Err(SandpadError::Disposed)
        ));
    }

    #[tokio::test]
    async fn finished_installs_are_not_retained() {
        let f = fixture(MemoryRuntime::new().with_program("npm", Program::new().exits_with(0))).await;

        for _ in 0..3 {
            f.controller.start_install().await.unwrap();
            wait_done(&f.controller).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.controller.start_install().await.unwrap();
        assert_eq!(f.controller.live_runs(), 1);
        assert_eq!(f.runtime.sandbox().unwrap().spawn_count("npm"), 4);
    }
}
