//! Byte-stream transport to the out-of-process model
//!
//! Every message is one JSON document terminated by a newline. A request
//! connection carries exactly one request and, for predictions, one response.
//! Training completion arrives on a separate listener that accepts a single
//! connection.

use crate::error::PredictError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

/// Prediction request sent to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub key: String,
    pub predict_history: Vec<f64>,
    pub look_back: usize,
    pub look_forward: usize,
}

/// Training request sent to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub key: String,
    pub train_history: Vec<f64>,
    pub resp_recv_address: String,
    pub look_back: usize,
    pub look_forward: usize,
    pub batch_size: usize,
    pub epochs: usize,
    pub n_layers: usize,
}

/// Reply to a prediction request
///
/// The model serializes unset fields as `null`, so every field tolerates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub trained: bool,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub prediction: Vec<f64>,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default, deserialize_with = "error_text")]
    pub error: String,
}

/// Training completion report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub trained: bool,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default, deserialize_with = "error_text")]
    pub error: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Errors arrive as a string, `null`, or an arbitrary JSON object
fn error_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    })
}

/// Where a model endpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// `tcp://host:port` and bare `host:port` are TCP, anything else is a
    /// Unix socket path, optionally prefixed with `unix://`
    pub fn parse(address: &str) -> Self {
        if let Some(addr) = address.strip_prefix("tcp://") {
            return Endpoint::Tcp(addr.to_string());
        }
        if let Some(path) = address.strip_prefix("unix://") {
            return Endpoint::Unix(PathBuf::from(path));
        }
        let looks_like_host_port = !address.contains('/')
            && address
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
        if looks_like_host_port {
            Endpoint::Tcp(address.to_string())
        } else {
            Endpoint::Unix(PathBuf::from(address))
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

async fn write_message<W, T>(stream: &mut W, message: &T) -> Result<(), PredictError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut payload = serde_json::to_vec(message)?;
    payload.push(b'\n');
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message<R, T>(stream: R) -> Result<T, PredictError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf).await?;
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Err(PredictError::Transport(
            "connection closed without a message".to_string(),
        ));
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Send one message, close the write half and read one reply
async fn exchange<S, Req, Resp>(mut stream: S, request: &Req) -> Result<Resp, PredictError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    write_message(&mut stream, request).await?;
    stream.shutdown().await?;
    read_message(stream).await
}

async fn deliver<S, Req>(mut stream: S, request: &Req) -> Result<(), PredictError>
where
    S: AsyncWrite + Unpin,
    Req: Serialize,
{
    write_message(&mut stream, request).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Send a request and wait for its response
pub async fn request<Req, Resp>(endpoint: &Endpoint, request: &Req) -> Result<Resp, PredictError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    debug!(endpoint = %endpoint, "Sending model request");
    match endpoint {
        Endpoint::Tcp(addr) => exchange(TcpStream::connect(addr).await?, request).await,
        Endpoint::Unix(path) => exchange(UnixStream::connect(path).await?, request).await,
    }
}

/// Send a request without waiting for a response
pub async fn send<Req: Serialize>(endpoint: &Endpoint, request: &Req) -> Result<(), PredictError> {
    debug!(endpoint = %endpoint, "Sending model request without reply");
    match endpoint {
        Endpoint::Tcp(addr) => deliver(TcpStream::connect(addr).await?, request).await,
        Endpoint::Unix(path) => deliver(UnixStream::connect(path).await?, request).await,
    }
}

/// Unix completion sockets currently bound by this process
fn claimed_sockets() -> &'static Mutex<HashSet<PathBuf>> {
    static CLAIMED: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    CLAIMED.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive use of a socket path, released and unlinked on drop
struct SocketClaim {
    path: PathBuf,
}

impl SocketClaim {
    fn acquire(path: &Path) -> Result<Self, PredictError> {
        let mut claimed = claimed_sockets()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.to_path_buf()) {
            return Err(PredictError::Transport(format!(
                "completion address {} is already awaiting a report",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for SocketClaim {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        claimed_sockets()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

enum ListenerKind {
    Tcp(TcpListener),
    // Field order matters: the listener closes before the claim unlinks its path.
    Unix(UnixListener, SocketClaim),
}

/// Listener that accepts exactly one message and then closes
pub struct CompletionListener {
    kind: ListenerKind,
}

impl CompletionListener {
    /// Bind the completion address
    ///
    /// A stale Unix socket file left by an earlier process is replaced. A path
    /// another listener of this process is still waiting on is refused.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, PredictError> {
        let kind = match endpoint {
            Endpoint::Tcp(addr) => ListenerKind::Tcp(TcpListener::bind(addr).await?),
            Endpoint::Unix(path) => {
                let claim = SocketClaim::acquire(path)?;
                remove_socket_file(path).await?;
                ListenerKind::Unix(UnixListener::bind(path)?, claim)
            }
        };
        Ok(Self { kind })
    }

    /// Wait for one connection and decode its message
    pub async fn accept_one<T: DeserializeOwned>(self) -> Result<T, PredictError> {
        match self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(peer = %peer, "Accepted completion connection");
                read_message(stream).await
            }
            ListenerKind::Unix(listener, claim) => {
                let accepted = listener.accept().await;
                drop(listener);
                drop(claim);
                let (stream, _) = accepted?;
                read_message(stream).await
            }
        }
    }
}

async fn remove_socket_file(path: &Path) -> Result<(), PredictError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
