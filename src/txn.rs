use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use url::Url;

use crate::app::AppInner;
use crate::attributes::{
    ATTR_HOST_DISPLAY_NAME, ATTR_REQUEST_ACCEPT, ATTR_REQUEST_CONTENT_LENGTH,
    ATTR_REQUEST_CONTENT_TYPE, ATTR_REQUEST_HOST, ATTR_REQUEST_METHOD, ATTR_REQUEST_REFERER,
    ATTR_REQUEST_USER_AGENT, ATTR_RESPONSE_CODE, AttributeError, AttributeValue, Attributes,
    agent_attribute_defaults,
};
use crate::connect::{AppRun, ConnectReply};
use crate::errors::{ErrorTrace, HIGH_SECURITY_ERROR_MSG, StackTrace, TxnError};
use crate::events::{ErrorEvent, TxnEvent};
use crate::harvest::HarvestData;
use crate::limits::{MAX_TRACE_NODES, MAX_TXN_ERRORS};
use crate::metrics::{
    APDEX_PREFIX, APDEX_ROLLUP, ApdexZone, BACKGROUND_ROLLUP, DISPATCHER_METRIC, ERRORS_ALL,
    ERRORS_BACKGROUND, ERRORS_PREFIX, ERRORS_WEB, MetricId, MetricTable, QUEUE_METRIC, WEB_ROLLUP,
    calculate_apdex_zone,
};
use crate::queue_time::{QueueTiming, parse_queue_times};
use crate::sampler::Priority;
use crate::trace::{TraceBuilder, TxnTrace};
use crate::tracer::{DatastoreSegment, SegmentStartTime, Tracer, safe_url};

const WEB_PREFIX: &str = "WebTransaction/Rust/";
const BACKGROUND_PREFIX: &str = "OtherTransaction/Rust/";

/// Request context for a web transaction, captured at start.
#[derive(Debug, Clone, Default)]
pub struct WebRequest {
    pub method: String,
    pub url: Option<Url>,
    pub headers: HashMap<String, String>,
}

impl WebRequest {
    pub fn new(
        method: impl Into<String>,
        url: Option<Url>,
        headers: HashMap<String, String>,
    ) -> WebRequest {
        WebRequest {
            method: method.into(),
            url,
            headers,
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct TxnData {
    start_instant: Instant,
    start_wall: DateTime<Utc>,
    name: String,
    is_web: bool,
    ignore: bool,
    errors: Vec<TxnError>,
    attrs: Attributes,
    tracer: Tracer,
    queue: QueueTiming,
    priority: Priority,
    request_uri: Option<String>,
    run: Option<Arc<AppRun>>,
}

/// One observed unit of work. Internally serialized by a mutex so callers
/// may share it across their own tasks; every method is a no-op after
/// `end`. The mutex is never held across a channel send: `end` stages all
/// artifacts locally first.
pub struct Transaction {
    app: Arc<AppInner>,
    state: Mutex<Option<TxnData>>,
}

impl Transaction {
    pub(crate) fn start(app: Arc<AppInner>, name: &str, request: Option<WebRequest>) -> Transaction {
        let start_instant = Instant::now();
        let start_wall = Utc::now();
        let run = app.current_run();

        let mut priority = Priority::random();
        if app.current_sampler().compute_sampled(priority, start_instant) {
            priority = priority.boost();
        }

        let mut attrs = Attributes::new(app.attr_config.clone());
        if !app.config.host_display_name.is_empty() {
            add_agent(&mut attrs, ATTR_HOST_DISPLAY_NAME, app.config.host_display_name.as_str());
        }

        let is_web = request.is_some();
        let mut queue = QueueTiming::default();
        let mut request_uri = None;
        if let Some(req) = &request {
            capture_request_attributes(&mut attrs, req);
            queue = parse_queue_times(&req.headers, start_wall);
            request_uri = req.url.as_ref().map(safe_url).filter(|u| !u.is_empty());
        }

        let tracer_config = &app.config.transaction_tracer;
        let trace = if tracer_config.enabled {
            Some(TraceBuilder::new(
                MAX_TRACE_NODES,
                tracer_config.segment_threshold,
                tracer_config.stack_trace_threshold,
            ))
        } else {
            None
        };

        Transaction {
            app,
            state: Mutex::new(Some(TxnData {
                start_instant,
                start_wall,
                name: name.to_string(),
                is_web,
                ignore: false,
                errors: Vec::new(),
                attrs,
                tracer: Tracer::new(trace),
                queue,
                priority,
                request_uri,
                run,
            })),
        }
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut TxnData) -> R) -> Option<R> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(f)
    }

    /// Rename the transaction. Ignored after `end`.
    pub fn set_name(&self, name: &str) {
        self.with_data(|data| data.name = name.to_string());
    }

    /// Discard this transaction at `end`.
    pub fn ignore(&self) {
        self.with_data(|data| data.ignore = true);
    }

    pub fn add_attribute(
        &self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Result<(), AttributeError> {
        if self.app.config.high_security {
            return Err(AttributeError::HighSecurity);
        }
        self.with_data(|data| data.attrs.add_user(key.into(), value.into()))
            .unwrap_or(Ok(()))
    }

    /// Record an error against this transaction, deriving the class from
    /// the error's type.
    pub fn notice_error<E: std::error::Error>(&self, error: &E) {
        self.notice_error_with_class(&error.to_string(), std::any::type_name::<E>());
    }

    /// Record an error with an explicit class. This is also the hook for
    /// host recovery paths: call it with class "panic" before resuming the
    /// unwind.
    pub fn notice_error_with_class(&self, msg: &str, klass: &str) {
        let high_security = self.app.config.high_security;
        let msg = if high_security {
            HIGH_SECURITY_ERROR_MSG.to_string()
        } else {
            msg.to_string()
        };
        self.with_data(|data| {
            if data.errors.len() >= MAX_TXN_ERRORS {
                return;
            }
            data.errors.push(TxnError {
                when: Utc::now(),
                msg,
                klass: klass.to_string(),
                stack: Some(StackTrace::capture()),
            });
        });
    }

    /// Record the response status. Codes >= 400 outside the configured
    /// ignore list synthesize a transaction error.
    pub fn write_response_code(&self, code: u16) {
        let ignored = self
            .app
            .config
            .error_collector
            .ignore_status_codes
            .contains(&code);
        self.with_data(|data| {
            data.attrs.add_agent(
                ATTR_RESPONSE_CODE,
                AttributeValue::from(code.to_string()),
                agent_attribute_defaults(ATTR_RESPONSE_CODE),
            );
            if code >= 400 && !ignored && data.errors.len() < MAX_TXN_ERRORS {
                data.errors.push(TxnError {
                    when: Utc::now(),
                    msg: reason_phrase(code).to_string(),
                    klass: code.to_string(),
                    stack: None,
                });
            }
        });
    }

    pub fn start_segment(&self) -> SegmentStartTime {
        self.with_data(|data| {
            let now = data.start_instant.elapsed();
            data.tracer.start_segment(now)
        })
        .unwrap_or_default()
    }

    pub fn end_segment(&self, token: SegmentStartTime, name: &str) {
        self.with_data(|data| {
            let now = data.start_instant.elapsed();
            data.tracer.end_basic_segment(token, now, name);
        });
    }

    pub fn end_external_segment(&self, token: SegmentStartTime, url: Option<&Url>) {
        self.with_data(|data| {
            let now = data.start_instant.elapsed();
            data.tracer.end_external_segment(token, now, url);
        });
    }

    pub fn end_datastore_segment(&self, token: SegmentStartTime, segment: DatastoreSegment) {
        self.with_data(|data| {
            let now = data.start_instant.elapsed();
            data.tracer.end_datastore_segment(token, now, segment);
        });
    }

    /// Finalize: freeze the name, compute apdex and rollups, and ship one
    /// harvestable per artifact class. Consumes the recorded state; later
    /// calls on this transaction do nothing.
    pub fn end(&self) {
        let data = self.state.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(data) = data else { return };
        if data.ignore {
            return;
        }
        let Some(run) = data.run.clone() else {
            tracing::debug!("transaction '{}' dropped: agent not connected", data.name);
            return;
        };
        let duration = data.start_instant.elapsed();

        let Some(final_name) = freeze_name(&run.reply, data.is_web, &data.name) else {
            tracing::debug!("transaction '{}' ignored by rename rules", data.name);
            return;
        };

        let TxnData {
            start_wall,
            is_web,
            errors,
            attrs,
            mut tracer,
            queue,
            priority,
            request_uri,
            ..
        } = data;

        let has_errors = !errors.is_empty();
        let threshold = run.apdex_threshold(&final_name);
        let zone = if !is_web {
            ApdexZone::None
        } else if has_errors {
            ApdexZone::Failing
        } else {
            calculate_apdex_zone(threshold, duration)
        };

        let attrs = Arc::new(attrs);
        let config = &self.app.config;
        let run_id = run.run_id().to_string();

        let mut table = MetricTable::new(start_wall);
        create_txn_metrics(
            &mut table,
            &final_name,
            is_web,
            duration,
            tracer.finished_children,
            threshold,
            zone,
            has_errors,
            &queue,
        );
        tracer.merge_breakdown_metrics(&mut table, &final_name, is_web);
        self.app.consume(run_id.clone(), HarvestData::Metrics(table));

        if config.transaction_events.enabled && run.reply.collect_analytics_events {
            let event = TxnEvent {
                name: final_name.clone(),
                timestamp: start_wall,
                duration,
                zone,
                queue_duration: non_zero(queue.duration),
                external_call_count: tracer.external_count,
                external_duration: tracer.external_duration,
                datastore_call_count: tracer.datastore_count,
                datastore_duration: tracer.datastore_duration,
                attrs: attrs.clone(),
            };
            self.app
                .consume(run_id.clone(), HarvestData::TxnEvent(priority, Box::new(event)));
        }

        if has_errors && config.error_collector.enabled && run.reply.collect_errors {
            let traces: Vec<ErrorTrace> = errors
                .iter()
                .map(|e| ErrorTrace {
                    when: e.when,
                    txn_name: final_name.clone(),
                    msg: e.msg.clone(),
                    klass: e.klass.clone(),
                    stack: e.stack.clone(),
                    request_uri: request_uri.clone(),
                    attrs: attrs.clone(),
                })
                .collect();
            self.app
                .consume(run_id.clone(), HarvestData::ErrorTraces(traces));

            if config.error_collector.capture_events && run.reply.collect_error_events {
                let events: Vec<(Priority, ErrorEvent)> = errors
                    .into_iter()
                    .map(|e| {
                        (
                            Priority::random(),
                            ErrorEvent {
                                klass: e.klass,
                                msg: e.msg,
                                when: e.when,
                                txn_name: final_name.clone(),
                                duration,
                                queue_duration: non_zero(queue.duration),
                                attrs: attrs.clone(),
                            },
                        )
                    })
                    .collect();
                self.app
                    .consume(run_id.clone(), HarvestData::ErrorEvents(events));
            }
        }

        if run.reply.collect_traces {
            if let Some(builder) = tracer.trace.take() {
                let trace_threshold = if config.transaction_tracer.threshold.is_apdex_failing {
                    threshold * 4
                } else {
                    config.transaction_tracer.threshold.duration
                };
                if duration >= trace_threshold {
                    let trace = TxnTrace {
                        start: start_wall,
                        duration,
                        final_name,
                        request_uri,
                        nodes: builder.into_nodes(),
                        attrs,
                    };
                    self.app.consume(run_id, HarvestData::TxnTrace(Box::new(trace)));
                }
            }
        }
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() { None } else { Some(d) }
}

fn add_agent(attrs: &mut Attributes, key: &'static str, value: &str) {
    attrs.add_agent(
        key,
        AttributeValue::from(value),
        agent_attribute_defaults(key),
    );
}

fn capture_request_attributes(attrs: &mut Attributes, req: &WebRequest) {
    if !req.method.is_empty() {
        add_agent(attrs, ATTR_REQUEST_METHOD, &req.method);
    }
    let host = req
        .header("Host")
        .map(str::to_string)
        .or_else(|| req.url.as_ref().and_then(Url::host_str).map(str::to_string));
    if let Some(host) = host {
        add_agent(attrs, ATTR_REQUEST_HOST, &host);
    }
    if let Some(accept) = req.header("Accept") {
        add_agent(attrs, ATTR_REQUEST_ACCEPT, accept);
    }
    if let Some(content_type) = req.header("Content-Type") {
        add_agent(attrs, ATTR_REQUEST_CONTENT_TYPE, content_type);
    }
    if let Some(length) = req.header("Content-Length").and_then(|v| v.parse::<i64>().ok()) {
        attrs.add_agent(
            ATTR_REQUEST_CONTENT_LENGTH,
            AttributeValue::from(length),
            agent_attribute_defaults(ATTR_REQUEST_CONTENT_LENGTH),
        );
    }
    if let Some(user_agent) = req.header("User-Agent") {
        add_agent(attrs, ATTR_REQUEST_USER_AGENT, user_agent);
    }
    // Referer is scrubbed of query, fragment and userinfo before storage.
    if let Some(referer) = req.header("Referer").and_then(|r| Url::parse(r).ok()) {
        let scrubbed = safe_url(&referer);
        if !scrubbed.is_empty() {
            add_agent(attrs, ATTR_REQUEST_REFERER, &scrubbed);
        }
    }
}

/// Freeze the metric name: url rules on the raw name, the web/background
/// prefix, transaction name rules, then segment terms. An empty result or
/// an ignore-rule match drops the transaction.
fn freeze_name(reply: &ConnectReply, is_web: bool, name: &str) -> Option<String> {
    let after_url_rules = reply.url_rules.apply(name)?;
    let prefix = if is_web { WEB_PREFIX } else { BACKGROUND_PREFIX };
    let prefixed = format!("{prefix}{}", after_url_rules.trim_start_matches('/'));
    let renamed = reply.txn_name_rules.apply(&prefixed)?;
    let terminal = reply.segment_terms.apply(&renamed);
    if terminal.is_empty() {
        return None;
    }
    Some(terminal)
}

#[allow(clippy::too_many_arguments)]
fn create_txn_metrics(
    table: &mut MetricTable,
    final_name: &str,
    is_web: bool,
    duration: Duration,
    finished_children: Duration,
    threshold: Duration,
    zone: ApdexZone,
    has_errors: bool,
    queue: &QueueTiming,
) {
    let exclusive = duration.saturating_sub(finished_children);
    table.add_duration(MetricId::unscoped(final_name), duration, exclusive, true);
    if is_web {
        table.add_duration(MetricId::unscoped(WEB_ROLLUP), duration, Duration::ZERO, true);
        table.add_duration(MetricId::unscoped(DISPATCHER_METRIC), duration, Duration::ZERO, true);
    } else {
        table.add_duration(MetricId::unscoped(BACKGROUND_ROLLUP), duration, Duration::ZERO, true);
    }

    if zone != ApdexZone::None {
        table.add_apdex(MetricId::unscoped(APDEX_ROLLUP), threshold, zone, true);
        let specific = format!("{APDEX_PREFIX}{}", remove_first_segment(final_name));
        table.add_apdex(MetricId::unscoped(specific), threshold, zone, false);
    }

    if has_errors {
        table.add_single_count(MetricId::unscoped(ERRORS_ALL), true);
        let side = if is_web { ERRORS_WEB } else { ERRORS_BACKGROUND };
        table.add_single_count(MetricId::unscoped(side), true);
        table.add_single_count(
            MetricId::unscoped(format!("{ERRORS_PREFIX}{final_name}")),
            true,
        );
    }

    if !queue.duration.is_zero() {
        table.add_duration(MetricId::unscoped(QUEUE_METRIC), queue.duration, queue.duration, true);
    }
    for (name, d) in &queue.intermediaries {
        table.add_duration(
            MetricId::unscoped(format!("{QUEUE_METRIC}/{name}")),
            *d,
            *d,
            false,
        );
    }
}

fn remove_first_segment(name: &str) -> &str {
    name.split_once('/').map(|(_, rest)| rest).unwrap_or(name)
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Bad Response",
    }
}
