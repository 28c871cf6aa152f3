use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};

use crate::attributes::truncate_string;
use crate::collector::{CMD_CONNECT, CMD_REDIRECT, Cmd, CollectorError, CollectorTransport, collector_request};
use crate::config::Config;
use crate::limits::{
    APDEX_THRESHOLD_DEFAULT, ATTRIBUTE_KEY_LENGTH_LIMIT, MAX_PAYLOAD_SIZE_DEFAULT,
    SAMPLING_PERIOD_DEFAULT, SAMPLING_TARGET_DEFAULT,
};
use crate::rules::{MetricRules, SegmentRules};
use crate::utilization;

const AGENT_LANGUAGE: &str = "rust";
const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Session identifier issued by the collector. The wire value may be a JSON
/// string or number; both collapse to their string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AgentRunId(String);

impl AgentRunId {
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for AgentRunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(AgentRunId(s)),
            Value::Number(n) => Ok(AgentRunId(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "agent_run_id must be a string or number, got {other}"
            ))),
        }
    }
}

/// The collector's post-handshake settings, immutable for the lifetime of
/// one `AppRun`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct ConnectReply {
    #[serde(rename = "agent_run_id")]
    pub run_id: Option<AgentRunId>,

    pub url_rules: MetricRules,
    #[serde(rename = "metric_name_rules")]
    pub metric_rules: MetricRules,
    #[serde(rename = "transaction_name_rules")]
    pub txn_name_rules: MetricRules,
    #[serde(rename = "transaction_segment_terms")]
    pub segment_terms: SegmentRules,

    #[serde(rename = "apdex_t")]
    pub apdex_threshold_seconds: f64,
    #[serde(rename = "web_transactions_apdex")]
    pub key_txn_apdex: HashMap<String, f64>,

    pub collect_analytics_events: bool,
    pub collect_custom_events: bool,
    pub collect_traces: bool,
    pub collect_errors: bool,
    pub collect_error_events: bool,

    pub sampling_target: u64,
    #[serde(rename = "sampling_target_period_in_seconds")]
    pub sampling_target_period_seconds: u64,

    #[serde(rename = "max_payload_size_in_bytes")]
    pub max_payload_size: usize,
    pub request_headers_map: HashMap<String, String>,
}

impl Default for ConnectReply {
    fn default() -> Self {
        ConnectReply {
            run_id: None,
            url_rules: MetricRules::default(),
            metric_rules: MetricRules::default(),
            txn_name_rules: MetricRules::default(),
            segment_terms: SegmentRules::default(),
            apdex_threshold_seconds: APDEX_THRESHOLD_DEFAULT.as_secs_f64(),
            key_txn_apdex: HashMap::new(),
            collect_analytics_events: true,
            collect_custom_events: true,
            collect_traces: true,
            collect_errors: true,
            collect_error_events: true,
            sampling_target: SAMPLING_TARGET_DEFAULT,
            sampling_target_period_seconds: SAMPLING_PERIOD_DEFAULT.as_secs(),
            max_payload_size: MAX_PAYLOAD_SIZE_DEFAULT,
            request_headers_map: HashMap::new(),
        }
    }
}

/// One connected session: the reply plus the redirect host every payload
/// for this run must be sent to.
#[derive(Debug)]
pub(crate) struct AppRun {
    pub reply: ConnectReply,
    pub collector: String,
}

impl AppRun {
    pub(crate) fn run_id(&self) -> &str {
        self.reply
            .run_id
            .as_ref()
            .map(AgentRunId::as_str)
            .unwrap_or_default()
    }

    /// Apdex threshold for a frozen transaction name, honoring key
    /// transaction overrides.
    pub(crate) fn apdex_threshold(&self, final_name: &str) -> Duration {
        let seconds = self
            .reply
            .key_txn_apdex
            .get(final_name)
            .copied()
            .unwrap_or(self.reply.apdex_threshold_seconds);
        Duration::from_secs_f64(seconds.max(0.0))
    }

    pub(crate) fn sampling_period(&self) -> Duration {
        Duration::from_secs(self.reply.sampling_target_period_seconds)
    }
}

fn environment_snapshot() -> Value {
    json!([
        ["language", AGENT_LANGUAGE],
        ["agent_version", AGENT_VERSION],
        ["host.os", std::env::consts::OS],
        ["host.arch", std::env::consts::ARCH],
        [
            "runtime.numCPU",
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        ],
    ])
}

fn connect_payload(config: &Config, util: &utilization::Utilization) -> Value {
    let app_names: Vec<&str> = config.app_name.split(';').collect();
    // At most 64 label pairs, keys and values truncated to the attribute
    // length limit.
    let labels: Vec<Value> = config
        .labels
        .iter()
        .take(64)
        .map(|(k, v)| {
            json!({
                "label_type": truncate_string(k.clone(), ATTRIBUTE_KEY_LENGTH_LIMIT),
                "label_value": truncate_string(v.clone(), ATTRIBUTE_KEY_LENGTH_LIMIT),
            })
        })
        .collect();
    let mut payload = json!({
        "pid": std::process::id(),
        "language": AGENT_LANGUAGE,
        "agent_version": AGENT_VERSION,
        "host": util.hostname,
        "app_name": app_names,
        "high_security": config.high_security,
        "labels": labels,
        "environment": environment_snapshot(),
        "identifier": config.app_name,
        "utilization": util,
        "settings": serde_json::to_value(config).unwrap_or(Value::Null),
    });
    if !config.host_display_name.is_empty() {
        payload["display_host"] = json!(config.host_display_name);
    }
    json!([payload])
}

/// One full redirect→connect handshake against the preconnect host.
pub(crate) async fn connect_attempt(
    config: &Config,
    transport: &dyn CollectorTransport,
) -> Result<AppRun, CollectorError> {
    let no_headers = HashMap::new();
    let preconnect_host = config.preconnect_host();

    let redirect = collector_request(
        transport,
        Cmd {
            name: CMD_REDIRECT,
            collector: &preconnect_host,
            license: &config.license,
            run_id: None,
            data: b"[]".to_vec(),
            max_payload_size: MAX_PAYLOAD_SIZE_DEFAULT,
            request_headers: &no_headers,
            use_tls: config.use_tls,
        },
    )
    .await?;
    let redirect_host = match redirect.as_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => {
            return Err(CollectorError::Parse(format!(
                "invalid redirect host: {redirect}"
            )));
        }
    };

    let util = utilization::gather(&config.utilization).await;
    let payload = connect_payload(config, &util);
    let data = serde_json::to_vec(&payload).map_err(|e| CollectorError::Parse(e.to_string()))?;
    let reply_value = collector_request(
        transport,
        Cmd {
            name: CMD_CONNECT,
            collector: &redirect_host,
            license: &config.license,
            run_id: None,
            data,
            max_payload_size: MAX_PAYLOAD_SIZE_DEFAULT,
            request_headers: &no_headers,
            use_tls: config.use_tls,
        },
    )
    .await?;

    let reply: ConnectReply = serde_json::from_value(reply_value)
        .map_err(|e| CollectorError::Parse(format!("bad connect reply: {e}")))?;
    let Some(run_id) = &reply.run_id else {
        return Err(CollectorError::Parse("connect reply missing agent_run_id".into()));
    };
    tracing::info!(collector = %redirect_host, run_id = %run_id.as_str(), "connected");
    Ok(AppRun {
        reply,
        collector: redirect_host,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_defaults() {
        let reply: ConnectReply = serde_json::from_str("{}").unwrap();
        assert!(reply.run_id.is_none());
        assert_eq!(reply.apdex_threshold_seconds, 0.5);
        assert!(reply.collect_analytics_events);
        assert_eq!(reply.max_payload_size, MAX_PAYLOAD_SIZE_DEFAULT);
        assert_eq!(reply.sampling_target, SAMPLING_TARGET_DEFAULT);
    }

    #[test]
    fn run_id_accepts_string_and_number() {
        let reply: ConnectReply =
            serde_json::from_str(r#"{"agent_run_id": "abc123"}"#).unwrap();
        assert_eq!(reply.run_id.unwrap().as_str(), "abc123");

        let reply: ConnectReply = serde_json::from_str(r#"{"agent_run_id": 474}"#).unwrap();
        assert_eq!(reply.run_id.unwrap().as_str(), "474");
    }

    #[test]
    fn key_txn_apdex_override() {
        let reply: ConnectReply = serde_json::from_str(
            r#"{
                "agent_run_id": "1",
                "apdex_t": 0.5,
                "web_transactions_apdex": {"WebTransaction/Rust/key": 0.1}
            }"#,
        )
        .unwrap();
        let run = AppRun {
            reply,
            collector: "collector-1.example.com".into(),
        };
        assert_eq!(run.apdex_threshold("WebTransaction/Rust/key"), Duration::from_millis(100));
        assert_eq!(run.apdex_threshold("WebTransaction/Rust/other"), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn connect_payload_shape() {
        let mut config = Config::new("one;two", "0123456789012345678901234567890123456789");
        config.labels.insert("env".into(), "prod".into());
        config.host_display_name = "display".into();
        let util = utilization::gather(&config.utilization).await;
        let payload = connect_payload(&config, &util);
        let obj = &payload[0];
        assert_eq!(obj["language"], "rust");
        assert_eq!(obj["app_name"], json!(["one", "two"]));
        assert_eq!(obj["labels"][0]["label_type"], "env");
        assert_eq!(obj["display_host"], "display");
        assert!(obj["settings"].get("license").is_none());
        assert!(obj["utilization"]["logical_processors"].as_u64().unwrap() >= 1);
        assert!(obj["environment"].as_array().unwrap().len() >= 4);
    }
}
