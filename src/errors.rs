use std::backtrace::Backtrace;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::json;

use crate::attributes::{Attributes, Destinations};
use crate::limits::{MAX_HARVEST_ERRORS, MAX_STACK_TRACE_FRAMES};

pub(crate) const HIGH_SECURITY_ERROR_MSG: &str = "message removed by high security setting";

#[derive(Debug, Clone)]
pub(crate) struct StackFrame {
    pub name: String,
    pub filepath: String,
    pub line: u64,
}

/// A captured call stack, bounded to 100 frames.
#[derive(Debug, Clone)]
pub(crate) struct StackTrace(Vec<StackFrame>);

impl StackTrace {
    pub(crate) fn capture() -> StackTrace {
        StackTrace::parse(&Backtrace::force_capture().to_string())
    }

    // The std backtrace renders as alternating "N: symbol" and
    // "at path:line:col" lines; frames without debug info omit the location.
    fn parse(rendered: &str) -> StackTrace {
        let mut frames: Vec<StackFrame> = Vec::new();
        for line in rendered.lines() {
            let trimmed = line.trim();
            if let Some(location) = trimmed.strip_prefix("at ") {
                if let Some(frame) = frames.last_mut() {
                    let mut parts = location.rsplitn(3, ':');
                    let _col = parts.next();
                    let line_no = parts.next().and_then(|l| l.parse().ok()).unwrap_or(0);
                    let path = parts.next().unwrap_or(location);
                    if frame.filepath.is_empty() {
                        frame.filepath = path.to_string();
                        frame.line = line_no;
                    }
                }
                continue;
            }
            if frames.len() >= MAX_STACK_TRACE_FRAMES {
                break;
            }
            if let Some((index, symbol)) = trimmed.split_once(':') {
                if index.chars().all(|c| c.is_ascii_digit()) && !index.is_empty() {
                    frames.push(StackFrame {
                        name: symbol.trim().to_string(),
                        filepath: String::new(),
                        line: 0,
                    });
                }
            }
        }
        StackTrace(frames)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for StackTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for frame in &self.0 {
            seq.serialize_element(&json!({
                "name": frame.name,
                "filepath": frame.filepath,
                "line": frame.line,
            }))?;
        }
        seq.end()
    }
}

/// One error noticed during a transaction, before finalization attaches the
/// transaction context.
#[derive(Debug, Clone)]
pub(crate) struct TxnError {
    pub when: DateTime<Utc>,
    pub msg: String,
    pub klass: String,
    pub stack: Option<StackTrace>,
}

/// A finalized error trace, ready for the error_data endpoint.
#[derive(Debug)]
pub(crate) struct ErrorTrace {
    pub when: DateTime<Utc>,
    pub txn_name: String,
    pub msg: String,
    pub klass: String,
    pub stack: Option<StackTrace>,
    pub request_uri: Option<String>,
    pub attrs: Arc<Attributes>,
}

impl Serialize for ErrorTrace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut params = serde_json::Map::new();
        if let Some(stack) = &self.stack {
            params.insert("stack_trace".into(), serde_json::to_value(stack).map_err(serde::ser::Error::custom)?);
        }
        params.insert(
            "agentAttributes".into(),
            self.attrs.agent_json(Destinations::ERROR_TRACES).into(),
        );
        params.insert(
            "userAttributes".into(),
            self.attrs.user_json(Destinations::ERROR_TRACES).into(),
        );
        params.insert("intrinsics".into(), json!({}));
        if let Some(uri) = &self.request_uri {
            params.insert("request_uri".into(), uri.clone().into());
        }

        // Error-trace timestamps are fractional milliseconds.
        let when_ms = self.when.timestamp_micros() as f64 / 1_000.0;
        let mut seq = serializer.serialize_seq(Some(5))?;
        seq.serialize_element(&when_ms)?;
        seq.serialize_element(&self.txn_name)?;
        seq.serialize_element(&self.msg)?;
        seq.serialize_element(&self.klass)?;
        seq.serialize_element(&params)?;
        seq.end()
    }
}

/// Bounded list of error traces for one harvest window.
#[derive(Debug, Default)]
pub(crate) struct HarvestErrors {
    errors: Vec<ErrorTrace>,
}

impl HarvestErrors {
    pub(crate) fn new() -> HarvestErrors {
        HarvestErrors { errors: Vec::new() }
    }

    pub(crate) fn add(&mut self, trace: ErrorTrace) {
        if self.errors.len() < MAX_HARVEST_ERRORS {
            self.errors.push(trace);
        }
    }

    pub(crate) fn extend(&mut self, traces: Vec<ErrorTrace>) {
        for t in traces {
            self.add(t);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.errors.len()
    }

    pub(crate) fn into_traces(self) -> Vec<ErrorTrace> {
        self.errors
    }

    pub(crate) fn collector_json(
        &self,
        run_id: &str,
    ) -> Result<Option<Vec<u8>>, serde_json::Error> {
        if self.errors.is_empty() {
            return Ok(None);
        }
        serde_json::to_vec(&json!([run_id, self.errors])).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeConfig, AttributeConfigInput};

    fn attrs() -> Arc<Attributes> {
        let config = Arc::new(AttributeConfig::new(&AttributeConfigInput::default()));
        Arc::new(Attributes::new(config))
    }

    fn trace(msg: &str) -> ErrorTrace {
        ErrorTrace {
            when: Utc::now(),
            txn_name: "WebTransaction/Rust/hello".into(),
            msg: msg.into(),
            klass: "io::Error".into(),
            stack: None,
            request_uri: Some("/hello".into()),
            attrs: attrs(),
        }
    }

    #[test]
    fn stack_capture_produces_frames() {
        let st = StackTrace::capture();
        assert!(!st.is_empty());
        assert!(st.0.len() <= MAX_STACK_TRACE_FRAMES);
    }

    #[test]
    fn stack_parse_extracts_locations() {
        let rendered = "   0: rush_agent::errors::tests\n             at ./src/errors.rs:12:5\n   1: unknown_frame\n";
        let st = StackTrace::parse(rendered);
        assert_eq!(st.0.len(), 2);
        assert_eq!(st.0[0].name, "rush_agent::errors::tests");
        assert_eq!(st.0[0].filepath, "./src/errors.rs");
        assert_eq!(st.0[0].line, 12);
        assert_eq!(st.0[1].line, 0);
    }

    #[test]
    fn harvest_errors_bounded() {
        let mut h = HarvestErrors::new();
        for i in 0..(MAX_HARVEST_ERRORS + 5) {
            h.add(trace(&format!("error {i}")));
        }
        assert_eq!(h.len(), MAX_HARVEST_ERRORS);
    }

    #[test]
    fn error_trace_wire_form() {
        let mut h = HarvestErrors::new();
        h.add(trace("boom"));
        let bytes = h.collector_json("99").unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v[0], "99");
        let e = &v[1][0];
        assert!(e[0].is_f64());
        assert_eq!(e[1], "WebTransaction/Rust/hello");
        assert_eq!(e[2], "boom");
        assert_eq!(e[3], "io::Error");
        assert_eq!(e[4]["request_uri"], "/hello");

        let empty = HarvestErrors::new();
        assert!(empty.collector_json("99").unwrap().is_none());
    }
}
