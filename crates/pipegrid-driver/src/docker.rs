//! Docker Engine API client over hyper.
//!
//! Speaks plain HTTP/1.1 to the engine through a unix socket or TCP, one
//! connection per request. Only the endpoints the driver needs are covered.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{
    Container, ContainerRuntime, ContainerSpec, EventStream, ListOptions, RuntimeEvent,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 256;
const USER_AGENT: &str = concat!("pipegrid-driver/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    fn parse(url: &str) -> RuntimeResult<Self> {
        if let Some(path) = url.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(RuntimeError::InvalidUrl(url.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let authority = url
            .strip_prefix("tcp://")
            .or_else(|| url.strip_prefix("http://"))
            .map(|rest| rest.trim_end_matches('/'))
            .ok_or_else(|| RuntimeError::InvalidUrl(url.to_string()))?;
        if authority.is_empty() || authority.contains('/') {
            return Err(RuntimeError::InvalidUrl(url.to_string()));
        }
        Ok(Self::Tcp(authority.to_string()))
    }

    /// Value of the `host` header.
    fn host(&self) -> &str {
        match self {
            Self::Unix(_) => "localhost",
            Self::Tcp(authority) => authority,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(authority) => write!(f, "tcp://{authority}"),
        }
    }
}

/// Container runtime backed by a Docker Engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    endpoint: Endpoint,
}

impl DockerRuntime {
    /// Client for `url` without contacting the engine.
    pub fn new(url: &str) -> RuntimeResult<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(url)?,
        })
    }

    pub fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }

    async fn open(&self) -> RuntimeResult<SendRequest<Full<Bytes>>> {
        let connect = async {
            match &self.endpoint {
                Endpoint::Unix(path) => connect_unix(path).await,
                Endpoint::Tcp(authority) => {
                    let stream = tokio::net::TcpStream::connect(authority.as_str())
                        .await
                        .map_err(|e| RuntimeError::Connect(format!("{authority}: {e}")))?;
                    handshake(stream).await
                }
            }
        };

        tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| RuntimeError::Connect(format!("{}: timed out", self.endpoint)))?
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<Response<Incoming>> {
        let mut sender = self.open().await?;

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("host", self.endpoint.host())
            .header("user-agent", USER_AGENT);
        let body = match body {
            Some(bytes) => {
                builder = builder.header("content-type", "application/json");
                Full::new(Bytes::from(bytes))
            }
            None => Full::new(Bytes::new()),
        };
        let req = builder
            .body(body)
            .map_err(|e| RuntimeError::Request(e.to_string()))?;

        sender
            .send_request(req)
            .await
            .map_err(|e| RuntimeError::Request(format!("{path}: {e}")))
    }

    /// Send a request and read the whole response body.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<(StatusCode, Bytes)> {
        let resp = self.send(method, path, body).await?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| RuntimeError::Request(format!("{path}: {e}")))?
            .to_bytes();
        Ok((status, body))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> RuntimeResult<()> {
        let (status, body) = self.call(Method::GET, "/_ping", None).await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(())
    }

    async fn list(&self, options: &ListOptions) -> RuntimeResult<Vec<Container>> {
        let path = list_path(options);
        let (status, body) = self.call(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        let listed: Vec<ListedContainer> =
            serde_json::from_slice(&body).map_err(|e| RuntimeError::Decode(e.to_string()))?;
        Ok(listed.into_iter().map(Container::from).collect())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<Option<Container>> {
        let path = format!("/containers/{}/json", encode(id));
        let (status, body) = self.call(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        let inspected: InspectedContainer =
            serde_json::from_slice(&body).map_err(|e| RuntimeError::Decode(e.to_string()))?;
        Ok(Some(inspected.into()))
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let path = format!("/images/create?fromImage={}", encode(image));
        let (status, body) = self.call(Method::POST, &path, None).await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        // Pull failures can arrive inside a 200 progress stream.
        if let Some(message) = progress_error(&body) {
            return Err(RuntimeError::Request(format!("pull {image}: {message}")));
        }
        debug!(%image, "image pulled");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let path = format!("/containers/create?name={}", encode(&spec.name));
        let payload = serde_json::json!({
            "Image": spec.image,
            "Labels": spec.labels,
            "Env": spec.env,
        });
        let payload =
            serde_json::to_vec(&payload).map_err(|e| RuntimeError::Request(e.to_string()))?;

        let (status, body) = self.call(Method::POST, &path, Some(payload)).await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        let created: CreatedContainer =
            serde_json::from_slice(&body).map_err(|e| RuntimeError::Decode(e.to_string()))?;
        for warning in created.warnings.iter().flatten() {
            warn!(name = %spec.name, %warning, "container created with warning");
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        let path = format!("/containers/{}/start", encode(id));
        let (status, body) = self.call(Method::POST, &path, None).await?;
        expect_done(status, &body, id)
    }

    async fn stop(&self, id: &str, timeout: Duration) -> RuntimeResult<()> {
        let path = format!("/containers/{}/stop?t={}", encode(id), timeout.as_secs());
        let (status, body) = self.call(Method::POST, &path, None).await?;
        expect_done(status, &body, id)
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let path = format!("/containers/{}?force={force}", encode(id));
        let (status, body) = self.call(Method::DELETE, &path, None).await?;
        expect_done(status, &body, id)
    }

    async fn events(&self) -> RuntimeResult<EventStream> {
        let path = format!("/events?filters={}", encode(r#"{"type":["container"]}"#));
        let resp = self.send(Method::GET, &path, None).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_events(resp.into_body(), tx));
        Ok(rx)
    }
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> RuntimeResult<SendRequest<Full<Bytes>>> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|e| RuntimeError::Connect(format!("{}: {e}", path.display())))?;
    handshake(stream).await
}

#[cfg(not(unix))]
async fn connect_unix(path: &std::path::Path) -> RuntimeResult<SendRequest<Full<Bytes>>> {
    Err(RuntimeError::InvalidUrl(format!(
        "unix sockets are not supported here: {}",
        path.display()
    )))
}

async fn handshake<S>(stream: S) -> RuntimeResult<SendRequest<Full<Bytes>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| RuntimeError::Connect(e.to_string()))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "runtime connection closed with error");
        }
    });

    Ok(sender)
}

/// Forward newline-delimited events until the body ends or the receiver
/// goes away. The stream always ends with an error item when the engine
/// side closes.
async fn read_events(mut body: Incoming, tx: mpsc::Sender<RuntimeResult<RuntimeEvent>>) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let frame = tokio::select! {
            _ = tx.closed() => return,
            frame = body.frame() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                let Ok(data) = frame.into_data() else {
                    continue;
                };
                buf.extend_from_slice(&data);
                for event in drain_lines(&mut buf) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Err(RuntimeError::EventStream(e.to_string()))).await;
                return;
            }
            None => {
                let _ = tx
                    .send(Err(RuntimeError::EventStream("stream ended".to_string())))
                    .await;
                return;
            }
        }
    }
}

/// Decode every complete line in `buf`, leaving a partial tail behind.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<EngineEvent>(line) {
            Ok(event) => events.push(event.into()),
            Err(e) => warn!(error = %e, "skipping undecodable runtime event"),
        }
    }
    events
}

fn list_path(options: &ListOptions) -> String {
    let mut path = format!("/containers/json?all={}", options.all);

    let labels: Vec<String> = options
        .labels
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .chain(options.label_keys.iter().cloned())
        .collect();
    if !labels.is_empty() {
        let filters = serde_json::json!({ "label": labels }).to_string();
        path.push_str("&filters=");
        path.push_str(&encode(&filters));
    }
    path
}

/// Start, stop and remove answer 204 when done and 304 when there was
/// nothing to do.
fn expect_done(status: StatusCode, body: &[u8], id: &str) -> RuntimeResult<()> {
    match status {
        StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::OK => Ok(()),
        StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(id.to_string())),
        other => Err(status_error(other, body)),
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> RuntimeError {
    let message = serde_json::from_slice::<EngineMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    RuntimeError::Status {
        status: status.as_u16(),
        message,
    }
}

fn progress_error(body: &[u8]) -> Option<String> {
    body.split(|b| *b == b'\n')
        .filter_map(|line| serde_json::from_slice::<PullProgress>(line).ok())
        .find_map(|progress| progress.error)
}

/// Percent-encode a query or path component.
fn encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ── Engine wire types ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedContainer {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    image: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    created: Option<i64>,
}

impl From<ListedContainer> for Container {
    fn from(c: ListedContainer) -> Self {
        let name = c
            .names
            .first()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();
        Self {
            id: c.id,
            name,
            image: c.image,
            state: c.state,
            labels: c.labels.unwrap_or_default(),
            created: c.created,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: InspectedState,
    #[serde(default)]
    config: InspectedConfig,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    #[serde(default)]
    status: String,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

impl From<InspectedContainer> for Container {
    fn from(c: InspectedContainer) -> Self {
        Self {
            id: c.id,
            name: c.name.trim_start_matches('/').to_string(),
            image: c.config.image,
            state: c.state.status,
            labels: c.config.labels.unwrap_or_default(),
            created: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedContainer {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct EngineEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: EngineActor,
    #[serde(default)]
    time: i64,
}

#[derive(Default, Deserialize)]
struct EngineActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

impl From<EngineEvent> for RuntimeEvent {
    fn from(e: EngineEvent) -> Self {
        Self {
            actor_id: e.actor.id,
            action: e.action,
            attributes: e.actor.attributes,
            time: e.time,
        }
    }
}

#[derive(Deserialize)]
struct EngineMessage {
    message: String,
}

#[derive(Deserialize)]
struct PullProgress {
    #[serde(default)]
    error: Option<String>,
}
