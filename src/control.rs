//! Local control channel between the CLI and the running daemon.
//!
//! Newline-delimited JSON over a Unix socket. Each line from the client is
//! a [`Request`]; the daemon answers each with exactly one [`Response`]
//! carrying the same `id`. The socket is created with mode 0600, so only
//! the daemon's user (root) can drive it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::engine::{EngineCommand, EngineHandle, StatusReport};
use crate::error::AppFenceError;
use crate::signal::ShutdownToken;
use crate::validation::parse_interval;

/// Upper bound for one request line.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// How long the client waits for the daemon's answer.
const CLIENT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: std::result::Result<StatusReport, String>,
}

/// Operations exposed on the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Method {
    Status,
    Enable,
    Disable,
    BlockNow,
    Allow,
    Unblock { package_id: String },
    SetManual { enabled: bool },
    /// Duration in interval form, e.g. `4d` or `90m`.
    SetAllowDuration { duration: String },
    SetMetrics { enabled: bool },
    AllowlistAdd { package_id: String },
    AllowlistRemove { package_id: String },
    Refresh,
}

impl Method {
    /// Translate into an engine command, validating arguments.
    pub fn into_command(self) -> Result<EngineCommand> {
        Ok(match self {
            Method::Status => EngineCommand::Status,
            Method::Enable => EngineCommand::Enable,
            Method::Disable => EngineCommand::Disable,
            Method::BlockNow => EngineCommand::BlockNow,
            Method::Allow => EngineCommand::Allow,
            Method::Unblock { package_id } => EngineCommand::Unblock(package_id),
            Method::SetManual { enabled } => EngineCommand::SetManual(enabled),
            Method::SetAllowDuration { duration } => {
                let parsed = parse_interval(&duration)
                    .map_err(|e| AppFenceError::InvalidDuration(format!("{}: {:#}", duration, e)))?;
                EngineCommand::SetAllowDuration(parsed)
            }
            Method::SetMetrics { enabled } => EngineCommand::SetMetrics(enabled),
            Method::AllowlistAdd { package_id } => EngineCommand::AllowlistAdd(package_id),
            Method::AllowlistRemove { package_id } => EngineCommand::AllowlistRemove(package_id),
            Method::Refresh => EngineCommand::Refresh,
        })
    }
}

/// Listening side of the control socket.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the socket at `path`, replacing a stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory: {:?}", parent))?;
        }
        // the single-instance lock is already held, so any file here is stale
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("Failed to remove stale socket: {:?}", path))?;
        }

        let listener =
            UnixListener::bind(&path).with_context(|| format!("Failed to bind control socket: {:?}", path))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("Failed to set control socket permissions")?;

        info!("Control socket listening on {:?}", path);
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `shutdown` fires. Each connection is
    /// served on its own task; the engine serializes the commands.
    pub async fn serve(self, engine: EngineHandle, shutdown: ShutdownToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, engine).await {
                                debug!("Control connection closed with error: {:#}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                },
            }
        }
        debug!("Control server stopped");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove control socket {:?}: {}", self.path, e);
        }
    }
}

/// One newline-terminated request read from a connection.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    /// The line grew past [`MAX_LINE_BYTES`] before its newline.
    Oversized,
    Eof,
}

/// Read the next line, buffering at most `MAX_LINE_BYTES + 1` bytes.
async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Frame> {
    buf.clear();
    let limit = MAX_LINE_BYTES as u64 + 1;
    let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() != Some(&b'\n') && read as u64 == limit {
        return Ok(Frame::Oversized);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Frame::Line(line.trim_end_matches(['\n', '\r']).to_string()))
}

async fn handle_connection(stream: UnixStream, engine: EngineHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let (response, close) = match read_frame(&mut reader, &mut buf).await? {
            Frame::Eof => break,
            Frame::Line(line) if line.trim().is_empty() => continue,
            Frame::Line(line) => (dispatch(&line, &engine).await, false),
            Frame::Oversized => {
                warn!("Dropping control connection: request exceeds {} bytes", MAX_LINE_BYTES);
                let response = Response {
                    id: 0,
                    result: Err(format!("request exceeds {} bytes", MAX_LINE_BYTES)),
                };
                (response, true)
            }
        };

        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;
        if close {
            break;
        }
    }
    Ok(())
}

async fn dispatch(line: &str, engine: &EngineHandle) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return Response {
                id: 0,
                result: Err(format!("malformed request: {}", e)),
            }
        }
    };
    debug!("Control request {}: {:?}", request.id, request.method);

    let result = match request.method.into_command() {
        Ok(command) => engine.send(command).await.map_err(|e| format!("{:#}", e)),
        Err(e) => Err(format!("{:#}", e)),
    };
    Response { id: request.id, result }
}

/// Send one request to the daemon listening on `path`.
pub async fn call<P: AsRef<Path>>(path: P, method: Method) -> Result<StatusReport> {
    let path = path.as_ref();
    let stream = UnixStream::connect(path)
        .await
        .map_err(|_| AppFenceError::DaemonNotRunning(path.display().to_string()))?;

    let request = Request { id: 1, method };
    let exchange = async {
        let (reader, mut writer) = stream.into_split();
        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(reader).read_line(&mut line).await?;
        if read == 0 {
            anyhow::bail!("daemon closed the connection without answering");
        }
        let response: Response = serde_json::from_str(&line).context("Malformed response from daemon")?;
        Ok::<_, anyhow::Error>(response)
    };

    let response = tokio::time::timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS), exchange)
        .await
        .map_err(|_| AppFenceError::Control("timed out waiting for the daemon".to_string()))??;

    if response.id != request.id {
        return Err(AppFenceError::Control(format!(
            "response id {} does not match request {}",
            response.id, request.id
        ))
        .into());
    }
    response.result.map_err(|e| AppFenceError::Control(e).into())
}
