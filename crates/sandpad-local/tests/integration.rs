use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use sandpad_protocol::{
    ErrorCode, Event, MAX_JSON_LINE_BYTES, Request, Response, RunKind, RunStatus, SessionState,
    Snapshot,
};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

const CONFIG: &str = r#"
[coordinator]
boot_timeout_ms = 10000

[coordinator.shell]
program = "/bin/cat"

[coordinator.install]
program = "/bin/sh"
args = ["-c", "echo fetching packages; exit 0"]

[coordinator.serve]
program = "/bin/sh"
args = ["-c", "echo 'Example app listening at http://localhost:4321'; exec sleep 30"]
"#;

struct TestServer {
    runtime: TempDir,
    socket_path: PathBuf,
    child: Child,
}

impl TestServer {
    async fn spawn() -> Result<Self> {
        Self::spawn_with_config(CONFIG).await
    }

    async fn spawn_with_config(config: &str) -> Result<Self> {
        let runtime = tempfile::tempdir().context("failed to create temp runtime dir")?;
        let socket_path = runtime.path().join("sandpad.sock");
        let config_path = runtime.path().join("sandpad.toml");
        let config = format!(
            "runtime_dir = \"{}\"\n{config}",
            runtime.path().join("run").display()
        );
        fs::write(&config_path, config)?;

        let child = Command::new(assert_cmd::cargo::cargo_bin!("sandpad-local"))
            .arg("--socket")
            .arg(&socket_path)
            .arg("--config")
            .arg(&config_path)
            .arg("--workspace")
            .arg(runtime.path().join("workspace"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn sandpad-local")?;

        let start = Instant::now();
        loop {
            if socket_path.exists() && UnixStream::connect(&socket_path).await.is_ok() {
                break;
            }
            if start.elapsed() > Duration::from_secs(5) {
                bail!("timed out waiting for socket {}", socket_path.display());
            }
            sleep(Duration::from_millis(20)).await;
        }

        Ok(Self {
            runtime,
            socket_path,
            child,
        })
    }

    fn workspace(&self) -> PathBuf {
        self.runtime.path().join("workspace")
    }

    async fn client(&self) -> Result<ProtocolClient> {
        ProtocolClient::connect(&self.socket_path).await
    }

    async fn ready_client(&self) -> Result<ProtocolClient> {
        let mut client = self.client().await?;
        let start = Instant::now();
        loop {
            let snapshot = client.snapshot().await?;
            match snapshot.state {
                SessionState::Ready if snapshot.active_file.is_some() => return Ok(client),
                SessionState::Failed => bail!("boot failed: {:?}", snapshot.boot_error),
                _ => {}
            }
            if start.elapsed() > Duration::from_secs(10) {
                bail!("timed out waiting for boot");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Ok(mut client) = self.client().await {
            let _ = client.request_ok(Request::Shutdown).await;
        }
        let start = Instant::now();
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            if start.elapsed() > Duration::from_secs(5) {
                self.child.kill().context("failed to kill sandpad-local")?;
                let _ = self.child.wait();
                return Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

struct ProtocolClient {
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
    pending_events: Vec<Event>,
}

impl ProtocolClient {
    async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect {}", socket_path.display()))?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: FramedRead::new(
                read_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            writer: FramedWrite::new(
                write_half,
                LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
            ),
            pending_events: Vec::new(),
        };

        match client.next_response().await? {
            Response::Hello {
                protocol_version, ..
            } if protocol_version == sandpad_protocol::PROTOCOL_VERSION => Ok(client),
            other => bail!("expected hello, got {other:?}"),
        }
    }

    async fn send(&mut self, req: Request) -> Result<()> {
        self.writer.send(serde_json::to_string(&req)?).await?;
        Ok(())
    }

    async fn next_response(&mut self) -> Result<Response> {
        let Some(line) = timeout(Duration::from_secs(10), self.reader.next()).await? else {
            bail!("server disconnected");
        };
        Ok(serde_json::from_str(&line?)?)
    }

    async fn request(&mut self, req: Request) -> Result<Response> {
        self.send(req).await?;
        loop {
            match self.next_response().await? {
                Response::Event(event) => self.pending_events.push(event),
                Response::Hello { .. } => {}
                other => return Ok(other),
            }
        }
    }

    async fn request_ok(&mut self, req: Request) -> Result<Option<Value>> {
        match self.request(req).await? {
            Response::Ok { data } => Ok(data),
            Response::Error { message, .. } => bail!("{message}"),
            other => bail!("unexpected response {other:?}"),
        }
    }

    async fn snapshot(&mut self) -> Result<Snapshot> {
        let data = self.request_ok(Request::Snapshot).await?;
        Ok(serde_json::from_value(data.unwrap_or_default())?)
    }

    async fn next_event(&mut self) -> Result<Event> {
        if !self.pending_events.is_empty() {
            return Ok(self.pending_events.remove(0));
        }
        loop {
            if let Response::Event(event) = self.next_response().await? {
                return Ok(event);
            }
        }
    }

    async fn wait_event<F: Fn(&Event) -> bool>(&mut self, pred: F) -> Result<Event> {
        loop {
            let event = self.next_event().await?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }
}

#[tokio::test]
async fn boot_lists_seed_and_opens_index() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.ready_client().await?;

    let snapshot = client.snapshot().await?;
    let names: Vec<_> = snapshot.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["index.js", "package.json"]);
    assert!(!snapshot.loading);
    assert!(snapshot.sidebar_open);
    let active = snapshot.active_file.expect("initial file selected");
    assert_eq!(active.path, "index.js");
    assert!(active.content.contains("express"));

    server.shutdown().await
}

#[tokio::test]
async fn edits_reach_the_workspace() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.ready_client().await?;

    for n in 1..=5 {
        client
            .request_ok(Request::EditActiveFile {
                content: format!("console.log({n});"),
            })
            .await?;
    }
    client.request_ok(Request::Flush).await?;
    assert_eq!(
        fs::read_to_string(server.workspace().join("index.js"))?,
        "console.log(5);"
    );

    server.shutdown().await
}

#[tokio::test]
async fn failed_select_reports_code_and_keeps_file() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.ready_client().await?;

    match client
        .request(Request::SelectFile {
            path: "missing.js".to_string(),
        })
        .await?
    {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => bail!("expected error, got {other:?}"),
    }
    let snapshot = client.snapshot().await?;
    assert_eq!(snapshot.active_file.map(|f| f.path).as_deref(), Some("index.js"));

    server.shutdown().await
}

#[tokio::test]
async fn install_runs_to_completion() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.ready_client().await?;
    client.request_ok(Request::Subscribe).await?;

    let outcome = client.request_ok(Request::StartInstall).await?;
    assert_eq!(
        outcome.and_then(|v| v.get("outcome").cloned()),
        Some(Value::from("started"))
    );
    client
        .wait_event(|event| {
            matches!(
                event,
                Event::RunStatusChanged {
                    kind: RunKind::Install,
                    status: RunStatus::Done { exit_code: 0 }
                }
            )
        })
        .await?;

    let history = client
        .request_ok(Request::ConsoleHistory { last_seq: None })
        .await?
        .unwrap_or_default();
    let chunks: Vec<sandpad_protocol::ConsoleChunk> = serde_json::from_value(history)?;
    let text: String = chunks
        .iter()
        .map(|c| String::from_utf8_lossy(&c.data).into_owned())
        .collect();
    assert!(text.contains("Installing dependencies..."));
    assert!(text.contains("fetching packages"));
    assert!(text.contains("Dependencies installed successfully!"));

    server.shutdown().await
}

#[tokio::test]
async fn serve_publishes_preview() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.ready_client().await?;
    client.request_ok(Request::Subscribe).await?;

    client.request_ok(Request::StartServe).await?;
    let event = client
        .wait_event(|event| matches!(event, Event::PreviewChanged { .. }))
        .await?;
    assert_eq!(
        event,
        Event::PreviewChanged {
            port: 4321,
            url: "http://localhost:4321".to_string()
        }
    );

    let again = client.request_ok(Request::StartServe).await?;
    assert_eq!(
        again.and_then(|v| v.get("outcome").cloned()),
        Some(Value::from("already_running"))
    );
    let snapshot = client.snapshot().await?;
    assert!(snapshot.server_running);
    assert_eq!(snapshot.preview.map(|p| p.port), Some(4321));

    server.shutdown().await
}

#[tokio::test]
async fn console_attaches_once_and_echoes() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.ready_client().await?;

    let first = client.request_ok(Request::ConsoleAttach).await?;
    assert_eq!(first, Some(serde_json::json!({"outcome": "attached"})));

    let mut other = server.client().await?;
    let second = other.request_ok(Request::ConsoleAttach).await?;
    assert_eq!(second, Some(serde_json::json!({"outcome": "already_attached"})));

    client
        .request_ok(Request::ConsoleInput {
            data: b"hello sandbox\n".to_vec(),
        })
        .await?;

    let mut seen = Vec::new();
    while !String::from_utf8_lossy(&seen).contains("hello sandbox") {
        if let Event::ConsoleOutput { data } = client.next_event().await? {
            seen.extend_from_slice(&data);
        }
    }

    server.shutdown().await
}

#[tokio::test]
async fn invalid_request_is_rejected() -> Result<()> {
    let mut server = TestServer::spawn().await?;
    let mut client = server.client().await?;

    client.writer.send("{\"cmd\":\"reboot\"}".to_string()).await?;
    match client.next_response().await? {
        Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
        other => bail!("expected error, got {other:?}"),
    }

    server.shutdown().await
}
