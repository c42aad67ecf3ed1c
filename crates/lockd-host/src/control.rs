use std::path::{Path, PathBuf};

use lockd_types::{Severity, WireCommand};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::HostError;
use crate::modes::daemon::ControlMsg;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub v: u8,
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: Value,
}

impl RequestEnvelope {
    pub fn new(id: impl Into<String>, cmd: impl Into<String>, payload: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: id.into(),
            cmd: cmd.into(),
            payload,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlError {
    pub code: String,
    pub message: String,
}

impl ControlError {
    fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: "invalid_request".into(),
            message: msg.into(),
        }
    }

    fn unknown_method() -> Self {
        Self {
            code: "unknown_method".into(),
            message: "unknown command".into(),
        }
    }

    fn decode(msg: impl Into<String>) -> Self {
        Self {
            code: "decode_error".into(),
            message: msg.into(),
        }
    }

    fn host(err: HostError) -> Self {
        Self {
            code: "host_error".into(),
            message: err.to_string(),
        }
    }

    fn unavailable() -> Self {
        Self {
            code: "unavailable".into(),
            message: "daemon is not accepting commands".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueuePayload {
    #[serde(default)]
    history: bool,
}

#[derive(Debug, Deserialize)]
struct IncidentsPayload {
    #[serde(default = "default_min_severity")]
    min_severity: Severity,
}

fn default_min_severity() -> Severity {
    Severity::Info
}

#[derive(Debug, Deserialize)]
struct UnlockPayload {
    lock_id: String,
    pin: String,
}

/// Control server (Unix socket, NDJSON framing) that translates requests
/// into daemon control messages and waits for their responses.
pub struct ControlServer {
    path: PathBuf,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ControlServer {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        control_tx: mpsc::Sender<ControlMsg>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let shutdown_rx = shutdown_tx.subscribe();
        Self {
            path: path.into(),
            control_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind the socket. Split from [`Self::serve`] so bind errors surface
    /// before the daemon starts.
    pub fn bind(&self) -> Result<UnixListener, HostError> {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
        let listener = UnixListener::bind(&self.path).map_err(|e| {
            HostError::Control(format!("failed to bind {}: {e}", self.path.display()))
        })?;
        // Owner-only; the socket can unlock the device.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(listener)
    }

    pub async fn serve(mut self, listener: UnixListener) {
        loop {
            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let tx = self.control_tx.clone();
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(handle_conn(stream, tx, shutdown_tx));
                        }
                        Err(err) => tracing::warn!(%err, "control accept failed"),
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    let _ = std::fs::remove_file(&self.path);
                    break;
                }
            }
        }
    }

    pub async fn run(self) -> Result<(), HostError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }
}

async fn handle_conn(
    stream: UnixStream,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    let mut line = String::new();

    while let Ok(n) = reader.read_line(&mut line).await {
        if n == 0 {
            break;
        }
        let resp = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(req) => handle_request(req, &control_tx, &shutdown_tx).await,
            Err(e) => ResponseEnvelope {
                id: String::new(),
                ok: false,
                result: None,
                error: Some(ControlError::decode(e.to_string())),
            },
        };
        if let Ok(json) = serde_json::to_string(&resp) {
            let _ = w.write_all(json.as_bytes()).await;
            let _ = w.write_all(b"\n").await;
        }
        line.clear();
    }
}

/// Send `msg` built around a fresh oneshot and wait for the daemon's answer.
async fn ask<T>(
    control_tx: &mpsc::Sender<ControlMsg>,
    build: impl FnOnce(oneshot::Sender<T>) -> ControlMsg,
) -> Result<T, ControlError> {
    let (tx, rx) = oneshot::channel();
    control_tx
        .send(build(tx))
        .await
        .map_err(|_| ControlError::unavailable())?;
    rx.await.map_err(|_| ControlError::unavailable())
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, ControlError> {
    serde_json::to_value(value).map_err(|e| ControlError::decode(e.to_string()))
}

fn payload<T: DeserializeOwned>(req: &RequestEnvelope) -> Result<T, ControlError> {
    serde_json::from_value(req.payload.clone()).map_err(|e| ControlError::decode(e.to_string()))
}

/// Like [`payload`], but a missing payload means "all defaults".
fn optional_payload<T: DeserializeOwned>(req: &RequestEnvelope) -> Result<T, ControlError> {
    if req.payload.is_null() {
        return serde_json::from_value(Value::Object(Default::default()))
            .map_err(|e| ControlError::decode(e.to_string()));
    }
    payload(req)
}

async fn handle_request(
    req: RequestEnvelope,
    control_tx: &mpsc::Sender<ControlMsg>,
    shutdown_tx: &broadcast::Sender<()>,
) -> ResponseEnvelope {
    let id = req.id.clone();
    let res = dispatch(&req, control_tx, shutdown_tx).await;
    match res {
        Ok(result) => ResponseEnvelope {
            id,
            ok: true,
            result: Some(result),
            error: None,
        },
        Err(err) => ResponseEnvelope {
            id,
            ok: false,
            result: None,
            error: Some(err),
        },
    }
}

async fn dispatch(
    req: &RequestEnvelope,
    control_tx: &mpsc::Sender<ControlMsg>,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<Value, ControlError> {
    if req.v != PROTOCOL_VERSION {
        return Err(ControlError::invalid_request("unsupported protocol version"));
    }
    match req.cmd.as_str() {
        "status" => {
            let status = ask(control_tx, |resp| ControlMsg::Status { resp }).await?;
            to_json(&status)
        }
        "queue" => {
            let p: QueuePayload = optional_payload(req)?;
            let commands = ask(control_tx, |resp| ControlMsg::Queue {
                history: p.history,
                resp,
            })
            .await?;
            to_json(&commands)
        }
        "incidents" => {
            let p: IncidentsPayload = optional_payload(req)?;
            let incidents = ask(control_tx, |resp| ControlMsg::Incidents {
                min: p.min_severity,
                resp,
            })
            .await?;
            to_json(&incidents)
        }
        "drain" => {
            let processed = ask(control_tx, |resp| ControlMsg::Drain { resp }).await?;
            to_json(&processed.map_err(ControlError::host)?)
        }
        "heartbeat" => {
            let report = ask(control_tx, |resp| ControlMsg::Heartbeat { resp }).await?;
            to_json(&report.map_err(ControlError::host)?)
        }
        "self-check" => {
            let outcome = ask(control_tx, |resp| ControlMsg::SelfCheck { resp }).await?;
            let outcome = outcome.map_err(ControlError::host)?;
            Ok(serde_json::json!({ "outcome": format!("{outcome:?}") }))
        }
        "submit" => {
            let command: WireCommand = payload(req)?;
            if command.id.trim().is_empty() {
                return Err(ControlError::invalid_request("command id is required"));
            }
            let processed = ask(control_tx, |resp| ControlMsg::Submit { command, resp }).await?;
            to_json(&processed.map_err(ControlError::host)?)
        }
        "unlock" => {
            let p: UnlockPayload = payload(req)?;
            let outcome = ask(control_tx, |resp| ControlMsg::PinUnlock {
                lock_id: p.lock_id,
                pin: p.pin,
                resp,
            })
            .await?;
            to_json(&outcome.map_err(ControlError::host)?)
        }
        "shutdown" => {
            let shutdown_tx = shutdown_tx.clone();
            let res = ask(control_tx, |resp| ControlMsg::Shutdown { resp, shutdown_tx }).await?;
            res.map_err(ControlError::host)?;
            Ok(serde_json::json!({}))
        }
        _ => Err(ControlError::unknown_method()),
    }
}

pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(r),
            writer: w,
            next_id: 0,
        })
    }

    pub async fn request(
        &mut self,
        envelope: &RequestEnvelope,
    ) -> std::io::Result<ResponseEnvelope> {
        let json = serde_json::to_string(envelope).map_err(std::io::Error::other)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the control connection",
            ));
        }
        serde_json::from_str(&line).map_err(std::io::Error::other)
    }

    /// One request; a daemon-side error becomes [`HostError::Control`].
    pub async fn call(&mut self, cmd: &str, payload: Value) -> Result<Value, HostError> {
        self.next_id += 1;
        let resp = self
            .request(&RequestEnvelope::new(self.next_id.to_string(), cmd, payload))
            .await?;
        if resp.ok {
            Ok(resp.result.unwrap_or(Value::Null))
        } else {
            let err = resp.error.unwrap_or_else(|| ControlError::invalid_request("empty error"));
            Err(HostError::Control(format!("{}: {}", err.code, err.message)))
        }
    }
}
