//! aria2 JSON-RPC client
//!
//! aria2 answers RPC errors with a non-2xx status and a JSON-RPC error body,
//! so the body is decoded regardless of the HTTP status.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, instrument, trace};

use super::{BackendError, BackendStatus, DownloadBackend, RemoteState, SubmitOptions};

const STATUS_KEYS: [&str; 6] = [
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorMessage",
    "files",
];

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TellStatus {
    status: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    completed_length: String,
    #[serde(default)]
    download_speed: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    files: Vec<StatusFile>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusFile {
    #[serde(default)]
    path: String,
}

impl From<TellStatus> for BackendStatus {
    fn from(raw: TellStatus) -> Self {
        let number = |s: &str| s.parse::<u64>().unwrap_or(0);
        Self {
            state: RemoteState::parse(&raw.status),
            completed: number(&raw.completed_length),
            total: number(&raw.total_length),
            speed: number(&raw.download_speed),
            error: raw.error_message.filter(|m| !m.is_empty()),
            files: raw
                .files
                .into_iter()
                .filter(|f| !f.path.is_empty())
                .map(|f| PathBuf::from(f.path))
                .collect(),
        }
    }
}

/// Per-download options of `aria2.addUri`
fn uri_options(options: &SubmitOptions) -> Value {
    let mut value = json!({ "dir": options.dir.to_string_lossy() });
    if let Some(out) = &options.out {
        value["out"] = Value::String(out.clone());
    }
    value
}

/// Failure of a single RPC round trip
#[derive(Debug)]
enum CallError {
    Transport(String),
    Rpc { code: i64, message: String },
}

impl CallError {
    fn message(self) -> String {
        match self {
            Self::Transport(message) => message,
            Self::Rpc { code, message } => format!("{message} (code {code})"),
        }
    }
}

#[derive(Debug)]
pub struct Aria2Backend {
    client: Client,
    rpc_url: String,
    secret: Option<String>,
    next_id: AtomicU64,
}

impl Aria2Backend {
    pub fn new(rpc_url: impl Into<String>, secret: Option<String>) -> Self {
        Self::with_client(Client::new(), rpc_url, secret)
    }

    pub fn with_client(client: Client, rpc_url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            client,
            rpc_url: rpc_url.into(),
            secret: secret.filter(|s| !s.is_empty()),
            next_id: AtomicU64::new(1),
        }
    }

    fn request_body(&self, method: &str, params: Vec<Value>) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut all = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            all.push(Value::String(format!("token:{secret}")));
        }
        all.extend(params);
        json!({
            "jsonrpc": "2.0",
            "id": id.to_string(),
            "method": method,
            "params": all,
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, CallError> {
        let body = self.request_body(method, params);
        trace!(method, "aria2 RPC call");
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;
        let status = response.status();
        let decoded: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| CallError::Transport(format!("HTTP {status}: {e}")))?;

        match (decoded.result, decoded.error) {
            (_, Some(error)) => Err(CallError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(CallError::Transport(format!(
                "HTTP {status}: response carried neither result nor error"
            ))),
        }
    }
}

#[async_trait]
impl DownloadBackend for Aria2Backend {
    fn name(&self) -> &'static str {
        "aria2"
    }

    #[instrument(level = "debug", skip(self))]
    async fn add_uris(
        &self,
        uris: &[String],
        options: &SubmitOptions,
    ) -> Result<String, BackendError> {
        let gid: String = self
            .call("aria2.addUri", vec![json!(uris), uri_options(options)])
            .await
            .map_err(|e| BackendError::rejected(e.message()))?;
        debug!(gid = %gid, "aria2 accepted download");
        Ok(gid)
    }

    async fn tell_status(&self, handle: &str) -> Result<BackendStatus, BackendError> {
        let raw: TellStatus = self
            .call("aria2.tellStatus", vec![json!(handle), json!(STATUS_KEYS)])
            .await
            .map_err(|e| BackendError::Query(e.message()))?;
        Ok(raw.into())
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(&self, handle: &str) -> Result<(), BackendError> {
        let _: String = self
            .call("aria2.forceRemove", vec![json!(handle)])
            .await
            .map_err(|e| BackendError::Query(e.message()))?;
        Ok(())
    }

    async fn forget(&self, handle: &str) -> Result<(), BackendError> {
        let _: String = self
            .call("aria2.removeDownloadResult", vec![json!(handle)])
            .await
            .map_err(|e| BackendError::Query(e.message()))?;
        Ok(())
    }
}
