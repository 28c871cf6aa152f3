use std::collections::HashMap;
use std::io::Write as _;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;
use serde_json::Value;

use crate::config::DEBUG_LOGGING;
use crate::limits::{COLLECTOR_TIMEOUT, PROTOCOL_VERSION};

pub(crate) const CMD_REDIRECT: &str = "get_redirect_host";
pub(crate) const CMD_CONNECT: &str = "connect";
pub(crate) const CMD_METRICS: &str = "metric_data";
pub(crate) const CMD_CUSTOM_EVENTS: &str = "custom_event_data";
pub(crate) const CMD_TXN_EVENTS: &str = "analytic_event_data";
pub(crate) const CMD_ERROR_EVENTS: &str = "error_event_data";
pub(crate) const CMD_ERROR_DATA: &str = "error_data";
pub(crate) const CMD_TXN_TRACES: &str = "transaction_sample_data";

const USER_AGENT: &str = concat!("RushAgent-Rust/", env!("CARGO_PKG_VERSION"));

/// Everything that can go wrong talking to the collector. The predicates
/// below encode the response classification table driving the harvest loop.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("collector force restart: {0}")]
    ForceRestart(String),
    #[error("collector force disconnect: {0}")]
    ForceDisconnect(String),
    #[error("invalid license: {0}")]
    License(String),
    #[error("collector runtime error: {0}")]
    Runtime(String),
    #[error("unexpected collector response code {status}")]
    Status { status: u16 },
    #[error("payload of {size} bytes exceeds maximum")]
    PayloadTooLarge { size: usize },
    #[error("unsupported media type")]
    UnsupportedMedia,
    #[error("collector round-trip failed: {0}")]
    Transport(String),
    #[error("unparsable collector response: {0}")]
    Parse(String),
}

impl CollectorError {
    pub(crate) fn is_disconnect(&self) -> bool {
        matches!(
            self,
            CollectorError::ForceDisconnect(_) | CollectorError::Status { status: 410 }
        )
    }

    pub(crate) fn is_license_exception(&self) -> bool {
        matches!(self, CollectorError::License(_))
    }

    pub(crate) fn is_restart(&self) -> bool {
        matches!(
            self,
            CollectorError::ForceRestart(_) | CollectorError::Status { status: 401 | 409 }
        )
    }

    /// True when the payload should be merged into the next harvest and
    /// retried: transient statuses, network failures and deadline expiry.
    pub(crate) fn should_save_harvest_data(&self) -> bool {
        matches!(
            self,
            CollectorError::Transport(_)
                | CollectorError::Status {
                    status: 408 | 429 | 500 | 503
                }
        )
    }

    pub(crate) fn is_payload_too_large(&self) -> bool {
        matches!(self, CollectorError::PayloadTooLarge { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CollectorRequest {
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct CollectorResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The HTTP round-trip seam. The default implementation uses reqwest with a
/// hard per-request deadline; embedders and tests can supply their own.
#[async_trait]
pub trait CollectorTransport: Send + Sync {
    async fn round_trip(&self, req: CollectorRequest) -> Result<CollectorResponse, CollectorError>;
}

pub(crate) struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub(crate) fn new() -> ReqwestTransport {
        let client = reqwest::Client::builder()
            .timeout(COLLECTOR_TIMEOUT)
            .build()
            .unwrap_or_default();
        ReqwestTransport { client }
    }
}

#[async_trait]
impl CollectorTransport for ReqwestTransport {
    async fn round_trip(&self, req: CollectorRequest) -> Result<CollectorResponse, CollectorError> {
        let mut builder = self.client.post(&req.url).body(req.body);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        Ok(CollectorResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// One collector invocation: method, destination host and serialized body.
pub(crate) struct Cmd<'a> {
    pub name: &'a str,
    pub collector: &'a str,
    pub license: &'a str,
    pub run_id: Option<&'a str>,
    pub data: Vec<u8>,
    pub max_payload_size: usize,
    pub request_headers: &'a HashMap<String, String>,
    pub use_tls: bool,
}

fn command_url(cmd: &Cmd<'_>) -> String {
    let scheme = if cmd.use_tls { "https" } else { "http" };
    let mut url = format!(
        "{scheme}://{}/agent_listener/invoke_raw_method?marshal_format=json&protocol_version={PROTOCOL_VERSION}&method={}&license_key={}",
        cmd.collector,
        urlencoding::encode(cmd.name),
        urlencoding::encode(cmd.license),
    );
    if let Some(run_id) = cmd.run_id {
        url.push_str("&run_id=");
        url.push_str(&urlencoding::encode(run_id));
    }
    url
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CollectorError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| CollectorError::Transport(format!("gzip: {e}")))
}

/// Execute one collector command: enforce the payload cap, gzip the body,
/// run the round-trip and decode the response envelope into a return value
/// or a typed error.
pub(crate) async fn collector_request(
    transport: &dyn CollectorTransport,
    cmd: Cmd<'_>,
) -> Result<Value, CollectorError> {
    if cmd.data.len() > cmd.max_payload_size {
        return Err(CollectorError::PayloadTooLarge {
            size: cmd.data.len(),
        });
    }
    if *DEBUG_LOGGING {
        tracing::debug!(
            method = cmd.name,
            payload = %String::from_utf8_lossy(&cmd.data),
            "collector request"
        );
    }

    let url = command_url(&cmd);
    let mut headers = vec![
        ("Accept-Encoding".to_string(), "identity, deflate".to_string()),
        ("Content-Type".to_string(), "application/octet-stream".to_string()),
        ("Content-Encoding".to_string(), "gzip".to_string()),
        ("User-Agent".to_string(), USER_AGENT.to_string()),
    ];
    for (name, value) in cmd.request_headers {
        headers.push((name.clone(), value.clone()));
    }

    let body = compress(&cmd.data)?;
    let response = transport
        .round_trip(CollectorRequest { url, body, headers })
        .await?;

    match response.status {
        200..=299 => parse_response(&response.body),
        413 => Err(CollectorError::PayloadTooLarge {
            size: cmd.data.len(),
        }),
        415 => Err(CollectorError::UnsupportedMedia),
        status => Err(CollectorError::Status { status }),
    }
}

#[derive(Deserialize)]
struct RpmException {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    #[serde(default)]
    return_value: Option<Value>,
    #[serde(default)]
    exception: Option<RpmException>,
}

fn parse_response(body: &[u8]) -> Result<Value, CollectorError> {
    let envelope: ResponseEnvelope =
        serde_json::from_slice(body).map_err(|e| CollectorError::Parse(e.to_string()))?;
    if let Some(exception) = envelope.exception {
        return Err(map_exception(exception));
    }
    Ok(envelope.return_value.unwrap_or(Value::Null))
}

fn map_exception(exception: RpmException) -> CollectorError {
    let error_type = exception.error_type.unwrap_or_default();
    let message = exception.message.unwrap_or_else(|| error_type.clone());
    if error_type.ends_with("ForceRestartException") {
        CollectorError::ForceRestart(message)
    } else if error_type.ends_with("ForceDisconnectException") {
        CollectorError::ForceDisconnect(message)
    } else if error_type.ends_with("LicenseException") {
        CollectorError::License(message)
    } else {
        CollectorError::Runtime(message)
    }
}
