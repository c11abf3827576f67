use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use futures_util::SinkExt;
use libsandpad::{Coordinator, CoordinatorConfig, SandpadError};
use nix::unistd::Uid;
use sandpad_protocol::{
    AttachOutcome, ErrorCode, Event, MAX_JSON_LINE_BYTES, PROTOCOL_VERSION, Request, Response,
};
use sandpad_sandbox::HostRuntime;
use serde::Deserialize;
use serde_json::json;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, info, warn};

const CONSOLE_INPUT_CAPACITY: usize = 256;
const CONSOLE_FANOUT_CAPACITY: usize = 1024;

/// Serve one sandbox-backed IDE coordinator over a Unix socket.
#[derive(Parser, Debug)]
#[command(name = "sandpad-local", version)]
struct Args {
    /// Socket path (overrides config file)
    #[arg(long = "socket")]
    socket_path: Option<PathBuf>,
    /// TOML config file
    #[arg(long = "config")]
    config_path: Option<PathBuf>,
    /// Host directory used as the sandbox root
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// JSON seed tree mounted on boot instead of the default project
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct RuntimeConfig {
    socket_path: PathBuf,
    runtime_dir: PathBuf,
    pid_file: PathBuf,
    workspace: PathBuf,
    seed: Option<PathBuf>,
    allowed_uid: u32,
    outbound_queue: usize,
    coordinator: CoordinatorConfig,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    workspace: Option<PathBuf>,
    seed: Option<PathBuf>,
    outbound_queue: Option<usize>,
    #[serde(default)]
    coordinator: CoordinatorConfig,
}

/// Console plumbing shared by every connection. The shell output fans out
/// to all connections; input from any connection goes to the one shell.
struct ConsoleBridge {
    output: broadcast::Sender<Vec<u8>>,
    input: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl ConsoleBridge {
    fn new() -> Self {
        let (output, _rx) = broadcast::channel(CONSOLE_FANOUT_CAPACITY);
        Self {
            output,
            input: Mutex::new(None),
        }
    }

    fn input(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Clone)]
struct Daemon {
    coordinator: Arc<Coordinator>,
    console: Arc<ConsoleBridge>,
    outbound_queue: usize,
    shutdown_tx: watch::Sender<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sandpad_local=info,libsandpad=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_runtime_config(&args)?;

    let seed = match &cfg.seed {
        Some(path) => libsandpad::seed::load(path)
            .with_context(|| format!("failed to load seed {}", path.display()))?,
        None => libsandpad::seed::default_project(),
    };
    let coordinator = Arc::new(
        Coordinator::new(
            Arc::new(HostRuntime::new(cfg.workspace.clone())),
            seed,
            cfg.coordinator.clone(),
        )
        .context("failed to create coordinator")?,
    );

    let listener = bind_socket(&cfg)?;

    info!(
        "sandpad-local started pid={} socket={} workspace={} protocol_version={}",
        std::process::id(),
        cfg.socket_path.display(),
        cfg.workspace.display(),
        PROTOCOL_VERSION
    );

    // Boot in the background so shells can watch the loading state.
    let boot_task = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            match coordinator.boot().await {
                Ok(()) => info!("coordinator booted"),
                Err(err) => error!("coordinator boot failed: {err}"),
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Daemon {
        coordinator: Arc::clone(&coordinator),
        console: Arc::new(ConsoleBridge::new()),
        outbound_queue: cfg.outbound_queue,
        shutdown_tx: shutdown_tx.clone(),
    };
    let active_connections: Arc<RwLock<Vec<JoinHandle<()>>>> = Arc::new(RwLock::new(Vec::new()));

    let accept_result = accept_loop(
        listener,
        daemon,
        cfg.allowed_uid,
        shutdown_rx,
        Arc::clone(&active_connections),
    )
    .await;

    shutdown_tx.send_replace(true);
    for handle in active_connections.write().await.drain(..) {
        handle.abort();
    }
    boot_task.abort();
    coordinator.dispose().await;

    let _ = fs::remove_file(&cfg.socket_path);
    let _ = fs::remove_file(&cfg.pid_file);

    accept_result
}

async fn accept_loop(
    listener: UnixListener,
    daemon: Daemon,
    allowed_uid: u32,
    mut shutdown_rx: watch::Receiver<bool>,
    active_connections: Arc<RwLock<Vec<JoinHandle<()>>>>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("shutdown requested, stopping accept loop");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping accept loop");
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                match authorize_peer(&stream, allowed_uid) {
                    Ok(uid) => debug!(uid, "client connected"),
                    Err(err) => {
                        warn!("rejected peer: {err}");
                        continue;
                    }
                }

                let handle = tokio::spawn(handle_connection(stream, daemon.clone()));
                let mut connections = active_connections.write().await;
                connections.retain(|h| !h.is_finished());
                connections.push(handle);
            }
        }
    }

    Ok(())
}

#[derive(Default)]
struct ConnectionTasks {
    events: Option<JoinHandle<()>>,
    console: Option<JoinHandle<()>>,
}

impl ConnectionTasks {
    fn abort_all(&mut self) {
        for task in [self.events.take(), self.console.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

async fn handle_connection(stream: UnixStream, daemon: Daemon) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let (out_tx, mut out_rx) = mpsc::channel::<Response>(daemon.outbound_queue);
    let mut writer = FramedWrite::new(
        write_half,
        LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
    );

    let writer_task = tokio::spawn(async move {
        while let Some(resp) = out_rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(line) => line,
                Err(err) => {
                    error!("failed to encode response: {err}");
                    continue;
                }
            };

            if let Err(err) = writer.send(line).await {
                warn!("socket write failed: {err}");
                break;
            }
        }
    });

    if enqueue_response(
        &out_tx,
        Response::hello(vec![
            "single_writer_queue".to_string(),
            "events".to_string(),
            "console".to_string(),
            "console_history".to_string(),
        ]),
    )
    .is_err()
    {
        writer_task.abort();
        return;
    }

    let mut tasks = ConnectionTasks::default();

    loop {
        let line = match futures_util::StreamExt::next(&mut reader).await {
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                warn!("socket read failed: {err}");
                break;
            }
            None => break,
        };

        let req: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                if enqueue_response(
                    &out_tx,
                    Response::error(ErrorCode::InvalidRequest, format!("invalid request: {err}")),
                )
                .is_err()
                {
                    break;
                }
                continue;
            }
        };

        match handle_request(req, &daemon, &out_tx, &mut tasks).await {
            Ok(continue_loop) => {
                if !continue_loop {
                    break;
                }
            }
            Err(err) => {
                if enqueue_response(&out_tx, error_response(&err)).is_err() {
                    break;
                }
            }
        }
    }

    tasks.abort_all();
    drop(out_tx);
    let _ = writer_task.await;
}

async fn handle_request(
    req: Request,
    daemon: &Daemon,
    out_tx: &mpsc::Sender<Response>,
    tasks: &mut ConnectionTasks,
) -> Result<bool> {
    let coordinator = &daemon.coordinator;
    match req {
        Request::Snapshot => {
            let snapshot = coordinator.snapshot();
            enqueue_response(out_tx, Response::ok(Some(serde_json::to_value(snapshot)?)))?;
        }
        Request::SetSidebar { open } => {
            coordinator.set_sidebar_open(open);
            enqueue_response(out_tx, Response::ok(Some(json!({"sidebar_open": open}))))?;
        }
        Request::RefreshFiles => {
            let files = coordinator.refresh_files().await?;
            enqueue_response(out_tx, Response::ok(Some(serde_json::to_value(files)?)))?;
        }
        Request::SelectFile { path } => {
            let active = coordinator.select_file(&path).await?;
            enqueue_response(out_tx, Response::ok(Some(serde_json::to_value(active)?)))?;
        }
        Request::EditActiveFile { content } => {
            let bytes = content.len();
            coordinator.edit_active_file(content)?;
            enqueue_response(out_tx, Response::ok(Some(json!({"queued": bytes}))))?;
        }
        Request::Flush => {
            coordinator.flush_writes().await?;
            enqueue_response(out_tx, Response::ok(Some(json!({"flushed": true}))))?;
        }
        Request::StartInstall => {
            let outcome = coordinator.start_install().await?;
            enqueue_response(out_tx, Response::ok(Some(serde_json::to_value(outcome)?)))?;
        }
        Request::StartServe => {
            let outcome = coordinator.start_serve().await?;
            enqueue_response(out_tx, Response::ok(Some(serde_json::to_value(outcome)?)))?;
        }
        Request::ConsoleAttach => {
            // Subscribe before attaching so the replayed scrollback reaches
            // this connection.
            let rx = daemon.console.output.subscribe();
            let outcome = attach_console(daemon).await?;
            if let Some(old) = tasks
                .console
                .replace(tokio::spawn(forward_console(rx, out_tx.clone())))
            {
                old.abort();
            }
            enqueue_response(out_tx, Response::ok(Some(json!({"outcome": outcome}))))?;
        }
        Request::ConsoleInput { data } => {
            let input = daemon
                .console
                .input()
                .ok_or_else(|| anyhow!("console is not attached"))?;
            let written = data.len();
            input
                .send(data)
                .await
                .map_err(|_| anyhow!("console input closed"))?;
            enqueue_response(out_tx, Response::ok(Some(json!({"written": written}))))?;
        }
        Request::ConsoleHistory { last_seq } => {
            let chunks = coordinator.console_history(last_seq);
            enqueue_response(out_tx, Response::ok(Some(serde_json::to_value(chunks)?)))?;
        }
        Request::Subscribe => {
            let rx = coordinator.subscribe();
            if let Some(old) = tasks
                .events
                .replace(tokio::spawn(forward_events(rx, out_tx.clone())))
            {
                old.abort();
            }
            enqueue_response(out_tx, Response::ok(Some(json!({"subscribed": true}))))?;
        }
        Request::Unsubscribe => {
            if let Some(task) = tasks.events.take() {
                task.abort();
            }
            enqueue_response(out_tx, Response::ok(Some(json!({"subscribed": false}))))?;
        }
        Request::Shutdown => {
            let _ = enqueue_response(out_tx, Response::ok(Some(json!({"shutdown": true}))));
            daemon.shutdown_tx.send_replace(true);
            return Ok(false);
        }
    }

    Ok(true)
}

async fn attach_console(daemon: &Daemon) -> Result<AttachOutcome> {
    let (input_tx, input_rx) = mpsc::channel(CONSOLE_INPUT_CAPACITY);
    let outcome = daemon
        .coordinator
        .attach_console(daemon.console.output.clone(), input_rx)
        .await?;
    if outcome == AttachOutcome::Attached {
        *daemon
            .console
            .input
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(input_tx);
    }
    Ok(outcome)
}

async fn forward_events(mut rx: broadcast::Receiver<Event>, out: mpsc::Sender<Response>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if enqueue_response(&out, Response::Event(event)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_console(mut rx: broadcast::Receiver<Vec<u8>>, out: mpsc::Sender<Response>) {
    loop {
        match rx.recv().await {
            Ok(data) => {
                if enqueue_response(&out, Response::Event(Event::ConsoleOutput { data })).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "console subscriber lagged, use console_history to catch up");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn enqueue_response(out_tx: &mpsc::Sender<Response>, response: Response) -> Result<()> {
    match out_tx.try_send(response) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => Err(anyhow!(
            "outbound queue full ({} responses pending)",
            out_tx.max_capacity()
        )),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(anyhow!("connection closed")),
    }
}

fn error_response(err: &anyhow::Error) -> Response {
    match err.downcast_ref::<SandpadError>() {
        Some(err) => {
            let (code, message) = err.to_error_code();
            Response::error(code, message)
        }
        None => Response::error(ErrorCode::InvalidRequest, err.to_string()),
    }
}

fn load_runtime_config(args: &Args) -> Result<RuntimeConfig> {
    let file_cfg = if let Some(path) = &args.config_path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str::<FileConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?
    } else {
        FileConfig::default()
    };

    let runtime_dir = file_cfg
        .runtime_dir
        .unwrap_or_else(sandpad_protocol::paths::default_runtime_dir);

    let socket_path = args
        .socket_path
        .clone()
        .or(file_cfg.socket_path)
        .unwrap_or_else(|| runtime_dir.join("sandpad.sock"));
    let pid_file = file_cfg
        .pid_file
        .unwrap_or_else(|| runtime_dir.join("sandpad.pid"));
    let workspace = args
        .workspace
        .clone()
        .or(file_cfg.workspace)
        .unwrap_or_else(|| runtime_dir.join("workspace"));

    Ok(RuntimeConfig {
        socket_path,
        runtime_dir,
        pid_file,
        workspace,
        seed: args.seed.clone().or(file_cfg.seed),
        allowed_uid: Uid::effective().as_raw(),
        outbound_queue: file_cfg.outbound_queue.unwrap_or(1024),
        coordinator: file_cfg.coordinator,
    })
}

/// Prepare the runtime directory and bind the control socket.
///
/// A socket file left behind by a dead daemon is replaced. A socket that
/// still accepts connections belongs to a live daemon and is left alone.
fn bind_socket(cfg: &RuntimeConfig) -> Result<UnixListener> {
    fs::create_dir_all(&cfg.runtime_dir)?;
    fs::set_permissions(&cfg.runtime_dir, fs::Permissions::from_mode(0o700))?;
    if let Some(parent) = cfg.socket_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if cfg.socket_path.exists() {
        if std::os::unix::net::UnixStream::connect(&cfg.socket_path).is_ok() {
            bail!(
                "another sandpad-local is already serving {}",
                cfg.socket_path.display()
            );
        }
        debug!(socket = %cfg.socket_path.display(), "removing stale socket");
        fs::remove_file(&cfg.socket_path).with_context(|| {
            format!("failed to remove stale socket {}", cfg.socket_path.display())
        })?;
    }

    let listener = UnixListener::bind(&cfg.socket_path)
        .with_context(|| format!("failed to bind {}", cfg.socket_path.display()))?;
    fs::set_permissions(&cfg.socket_path, fs::Permissions::from_mode(0o600))?;
    fs::write(&cfg.pid_file, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", cfg.pid_file.display()))?;
    Ok(listener)
}

/// Only the daemon's own user may drive the sandbox. Returns the peer uid.
fn authorize_peer(stream: &UnixStream, allowed_uid: u32) -> Result<u32> {
    let uid = stream
        .peer_cred()
        .context("failed to query peer credentials")?
        .uid();
    if uid != allowed_uid {
        bail!("uid {uid} may not control this sandbox (owner is {allowed_uid})");
    }
    Ok(uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["sandpad-local"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn runtime_config(dir: &std::path::Path) -> RuntimeConfig {
        let runtime_dir = dir.join("run");
        RuntimeConfig {
            socket_path: runtime_dir.join("sandpad.sock"),
            pid_file: runtime_dir.join("sandpad.pid"),
            workspace: runtime_dir.join("workspace"),
            runtime_dir,
            seed: None,
            allowed_uid: Uid::effective().as_raw(),
            outbound_queue: 8,
            coordinator: CoordinatorConfig::default(),
        }
    }

    #[tokio::test]
    async fn full_or_closed_connection_rejects_responses() {
        let (tx, rx) = mpsc::channel(2);
        enqueue_response(&tx, Response::ok(None)).unwrap();
        enqueue_response(&tx, Response::error(ErrorCode::NotReady, "booting")).unwrap();
        let err = enqueue_response(&tx, Response::ok(None)).unwrap_err();
        assert!(err.to_string().contains("2 responses pending"));

        drop(rx);
        let err = enqueue_response(&tx, Response::ok(None)).unwrap_err();
        assert!(err.to_string().contains("connection closed"));
    }

    #[test]
    fn coordinator_errors_keep_their_code() {
        let err = anyhow::Error::from(SandpadError::NoActiveFile);
        let Response::Error { code, .. } = error_response(&err) else {
            panic!("expected error response");
        };
        assert_eq!(code, ErrorCode::NoActiveFile);

        let Response::Error { code, .. } = error_response(&anyhow!("console is not attached"))
        else {
            panic!("expected error response");
        };
        assert_eq!(code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn config_file_and_flags_merge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("sandpad.toml");
        fs::write(
            &config,
            format!(
                r#"
runtime_dir = "{runtime}"
outbound_queue = 64

[coordinator]
initial_file = "server.js"

[coordinator.install]
program = "/bin/sh"
args = ["-c", "echo installed"]
"#,
                runtime = dir.path().join("run").display()
            ),
        )
        .expect("write config");

        let config_arg = config.to_string_lossy().into_owned();
        let cfg = load_runtime_config(&args(&[
            "--config",
            &config_arg,
            "--socket",
            "/tmp/custom.sock",
        ]))
        .expect("load config");

        assert_eq!(cfg.socket_path, PathBuf::from("/tmp/custom.sock"));
        assert_eq!(cfg.workspace, dir.path().join("run").join("workspace"));
        assert_eq!(cfg.outbound_queue, 64);
        assert_eq!(cfg.coordinator.initial_file.as_deref(), Some("server.js"));
        assert_eq!(cfg.coordinator.install.program, "/bin/sh");
        assert_eq!(cfg.coordinator.serve.to_string(), "npm run start");
    }

    #[tokio::test]
    async fn stale_socket_is_replaced_with_private_one() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = runtime_config(dir.path());
        fs::create_dir_all(&cfg.runtime_dir).unwrap();
        // A listener that went away leaves its socket file behind.
        drop(std::os::unix::net::UnixListener::bind(&cfg.socket_path).unwrap());
        assert!(cfg.socket_path.exists());

        let _listener = bind_socket(&cfg).unwrap();
        let mode = |path: &PathBuf| fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&cfg.runtime_dir), 0o700);
        assert_eq!(mode(&cfg.socket_path), 0o600);
        assert_eq!(
            fs::read_to_string(&cfg.pid_file).unwrap(),
            std::process::id().to_string()
        );
        UnixStream::connect(&cfg.socket_path).await.unwrap();
    }

    #[tokio::test]
    async fn live_socket_is_not_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = runtime_config(dir.path());
        let _running = bind_socket(&cfg).unwrap();

        let err = bind_socket(&cfg).unwrap_err();
        assert!(err.to_string().contains("already serving"));
        assert!(cfg.socket_path.exists());
    }

    #[tokio::test]
    async fn only_the_owner_may_connect() {
        let (server, _client) = UnixStream::pair().unwrap();
        let owner = Uid::effective().as_raw();

        assert_eq!(authorize_peer(&server, owner).unwrap(), owner);
        let err = authorize_peer(&server, owner.wrapping_add(1)).unwrap_err();
        assert!(err.to_string().contains("may not control this sandbox"));
    }
}
