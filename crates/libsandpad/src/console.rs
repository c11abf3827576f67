use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sandpad_protocol::AttachOutcome;
use sandpad_sandbox::{ProcessHandle, TERMINATED_EXIT_CODE};

use crate::config::CommandSpec;
use crate::error::SandpadError;
use crate::output::ConsoleOutput;
use crate::session::RuntimeSession;

/// Destination for console bytes, typically a terminal widget.
pub trait ConsoleSink: Send + Sync + 'static {
    /// Deliver one chunk. Returning false detaches the sink.
    fn write(&self, data: &[u8]) -> bool;
}

impl ConsoleSink for mpsc::UnboundedSender<Vec<u8>> {
    fn write(&self, data: &[u8]) -> bool {
        self.send(data.to_vec()).is_ok()
    }
}

// Fan-out sink: stays attached while nobody is listening.
impl ConsoleSink for broadcast::Sender<Vec<u8>> {
    fn write(&self, data: &[u8]) -> bool {
        let _ = self.send(data.to_vec());
        true
    }
}

struct Shell {
    kill: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct ShellSlot {
    disposed: bool,
    shell: Option<Shell>,
}

/// The single interactive shell of a coordinator.
pub struct InteractiveConsole {
    session: Arc<RuntimeSession>,
    console: Arc<ConsoleOutput>,
    shell_cmd: CommandSpec,
    attached: AtomicBool,
    slot: Mutex<ShellSlot>,
}

impl InteractiveConsole {
    pub fn new(session: Arc<RuntimeSession>, console: Arc<ConsoleOutput>, shell_cmd: CommandSpec) -> Self {
        Self {
            session,
            console,
            shell_cmd,
            attached: AtomicBool::new(false),
            slot: Mutex::new(ShellSlot::default()),
        }
    }

    /// Spawn the shell and connect it to `sink` and `input`. Console output
    /// written before the call is replayed to the sink first. Only the first
    /// successful call spawns anything.
    pub async fn attach<S: ConsoleSink>(
        &self,
        sink: S,
        input: mpsc::Receiver<Vec<u8>>,
    ) -> Result<AttachOutcome, SandpadError> {
        if self.attached.swap(true, Ordering::SeqCst) {
            debug!("console already attached");
            return Ok(AttachOutcome::AlreadyAttached);
        }

        let handle = match self
            .session
            .spawn_process(&self.shell_cmd.program, &self.shell_cmd.args)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                warn!(command = %self.shell_cmd, "shell spawn failed: {err}");
                let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
                if !slot.disposed {
                    self.attached.store(false, Ordering::SeqCst);
                }
                return Err(err);
            }
        };

        let ProcessHandle {
            id,
            output,
            input: shell_input,
            exit,
            kill,
        } = handle;

        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.disposed {
            warn!(%id, "console disposed during spawn; killing shell");
            kill.cancel();
            return Err(SandpadError::Disposed);
        }
        info!(%id, command = %self.shell_cmd, "console attached");

        let tasks = vec![
            tokio::spawn(forward_to_sink(Arc::clone(&self.console), sink)),
            tokio::spawn(pump_shell_output(
                Arc::clone(&self.console),
                id,
                output,
                exit,
            )),
            tokio::spawn(pump_shell_input(input, shell_input)),
        ];
        slot.shell = Some(Shell { kill, tasks });
        Ok(AttachOutcome::Attached)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Terminate the shell and detach both streams. The console cannot be
    /// attached again afterwards.
    pub fn dispose(&self) {
        self.attached.store(true, Ordering::SeqCst);
        let shell = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.disposed = true;
            slot.shell.take()
        };
        if let Some(shell) = shell {
            shell.kill.cancel();
            for task in shell.tasks {
                task.abort();
            }
            info!("console detached");
        }
    }
}

async fn pump_shell_output(
    console: Arc<ConsoleOutput>,
    id: String,
    mut output: mpsc::Receiver<Vec<u8>>,
    exit: tokio::sync::oneshot::Receiver<i32>,
) {
    while let Some(chunk) = output.recv().await {
        console.write(chunk);
    }
    let exit_code = exit.await.unwrap_or(TERMINATED_EXIT_CODE);
    info!(%id, exit_code, "shell exited");
}

async fn pump_shell_input(mut input: mpsc::Receiver<Vec<u8>>, shell: mpsc::Sender<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        if shell.send(data).await.is_err() {
            debug!("shell input closed");
            break;
        }
    }
}

/// Replay the scrollback, then stream live chunks. Chunks are delivered
/// once each and in sequence order, including after a lag.
async fn forward_to_sink<S: ConsoleSink>(console: Arc<ConsoleOutput>, sink: S) {
    let (replay, mut rx) = console.replay_and_subscribe(None);
    let mut last_seq = 0;
    for chunk in replay {
        if !sink.write(&chunk.data) {
            return;
        }
        last_seq = chunk.seq;
    }

    loop {
        match rx.recv().await {
            Ok(chunk) => {
                if chunk.seq <= last_seq {
                    continue;
                }
                if !sink.write(&chunk.data) {
                    break;
                }
                last_seq = chunk.seq;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "console sink lagged, replaying from scrollback");
                for chunk in console.replay(Some(last_seq)) {
                    if !sink.write(&chunk.data) {
                        return;
                    }
                    last_seq = chunk.seq;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("console sink detached");
}
