use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::attributes::{AttributeConfig, AttributeValue};
use crate::collector::{
    Cmd, CollectorError, CollectorTransport, ReqwestTransport, collector_request,
};
use crate::config::{Config, ConfigError};
use crate::connect::{AppRun, connect_attempt};
use crate::events::{CustomEvent, CustomEventError};
use crate::harvest::{Harvest, HarvestData, HarvestPayload};
use crate::limits::{
    APP_DATA_CHAN_SIZE, CONNECT_BACKOFF_SCHEDULE, HARVEST_PERIOD, SAMPLING_PERIOD_DEFAULT,
    SAMPLING_TARGET_DEFAULT,
};
use crate::sampler::{AdaptiveSampler, Priority};
use crate::txn::{Transaction, WebRequest};

pub(crate) enum ControlMsg {
    ConnectReply(Arc<AppRun>),
    CollectorError(CollectorError),
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct AppInner {
    pub(crate) config: Config,
    pub(crate) attr_config: Arc<AttributeConfig>,
    pub(crate) run: RwLock<Option<Arc<AppRun>>>,
    pub(crate) sampler: RwLock<Arc<AdaptiveSampler>>,
    pub(crate) data_tx: mpsc::Sender<(String, HarvestData)>,
    pub(crate) ctrl_tx: mpsc::UnboundedSender<ControlMsg>,
    pub(crate) transport: Arc<dyn CollectorTransport>,
}

impl AppInner {
    pub(crate) fn current_run(&self) -> Option<Arc<AppRun>> {
        self.run.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn current_sampler(&self) -> Arc<AdaptiveSampler> {
        self.sampler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Push one artifact toward the harvest loop. The channel is bounded;
    /// when it is full the artifact is dropped rather than blocking the
    /// producer.
    pub(crate) fn consume(&self, run_id: String, data: HarvestData) {
        if self.data_tx.try_send((run_id, data)).is_err() {
            tracing::warn!("data channel full, dropping harvest artifact");
        }
    }
}

/// An embedded agent instance: owns the harvest loop, the connect worker
/// and the shared state transactions record into.
#[derive(Clone)]
pub struct Application {
    inner: Arc<AppInner>,
}

impl Application {
    /// Validate the config and start the agent. Must be called from within
    /// a tokio runtime; the harvest loop and connect worker are spawned
    /// immediately (unless `development` is set, in which case the agent
    /// never dials out).
    pub fn new(config: Config) -> Result<Application, ConfigError> {
        config.validate()?;
        let attr_config = Arc::new(AttributeConfig::new(&config.attribute_config_input()));
        let transport: Arc<dyn CollectorTransport> = match &config.transport {
            Some(t) => t.clone(),
            None => Arc::new(ReqwestTransport::new()),
        };
        let (data_tx, data_rx) = mpsc::channel(APP_DATA_CHAN_SIZE);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(AppInner {
            config,
            attr_config,
            run: RwLock::new(None),
            sampler: RwLock::new(Arc::new(AdaptiveSampler::new(
                SAMPLING_TARGET_DEFAULT,
                SAMPLING_PERIOD_DEFAULT,
                Instant::now(),
            ))),
            data_tx,
            ctrl_tx,
            transport,
        });

        tokio::spawn(process(inner.clone(), data_rx, ctrl_rx));
        if !inner.config.development {
            spawn_connect_worker(inner.clone());
        } else {
            tracing::info!("development mode: collector disabled");
        }
        Ok(Application { inner })
    }

    pub fn start_transaction(&self, name: &str, request: Option<WebRequest>) -> Transaction {
        Transaction::start(self.inner.clone(), name, request)
    }

    /// Record a user event into the current harvest. Rejected when custom
    /// events are disabled by config, high security or the connect reply.
    pub fn record_custom_event(
        &self,
        event_type: &str,
        params: Vec<(String, AttributeValue)>,
    ) -> Result<(), CustomEventError> {
        if !self.inner.config.custom_insights_events.enabled || self.inner.config.high_security {
            return Err(CustomEventError::Disabled);
        }
        let event = CustomEvent::new(event_type.to_string(), params, Utc::now())?;
        let Some(run) = self.inner.current_run() else {
            return Ok(());
        };
        if !run.reply.collect_custom_events {
            return Ok(());
        }
        self.inner.consume(
            run.run_id().to_string(),
            HarvestData::CustomEvent(Priority::random(), Box::new(event)),
        );
        Ok(())
    }

    /// Block until the first connect handshake finishes or the timeout
    /// expires. Returns whether the agent is connected.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.inner.current_run().is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.inner.current_run().is_some()
    }

    /// Stop the harvest loop, flushing one final harvest if connected.
    pub async fn shutdown(&self, timeout: Duration) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.ctrl_tx.send(ControlMsg::Shutdown(ack_tx)).is_err() {
            return;
        }
        if tokio::time::timeout(timeout, ack_rx).await.is_err() {
            tracing::warn!("shutdown timed out before the final harvest completed");
        }
    }
}

/// The single-threaded harvest loop: every mutation of the current harvest
/// happens here, fed by the data channel, the control channel and the
/// harvest ticker.
async fn process(
    inner: Arc<AppInner>,
    mut data_rx: mpsc::Receiver<(String, HarvestData)>,
    mut ctrl_rx: mpsc::UnboundedReceiver<ControlMsg>,
) {
    let mut harvest: Option<Harvest> = None;
    let mut ticker = tokio::time::interval(HARVEST_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let (Some(run), Some(h)) = (inner.current_run(), harvest.as_mut()) {
                    let snapshot = std::mem::replace(h, Harvest::new(Utc::now()));
                    spawn_harvest(inner.clone(), run, snapshot);
                }
            }
            msg = data_rx.recv() => {
                let Some((run_id, data)) = msg else { break };
                let current = inner.current_run();
                match (current, harvest.as_mut()) {
                    (Some(run), Some(h)) if run.run_id() == run_id => {
                        data.merge_into_harvest(h);
                    }
                    _ => tracing::debug!("dropping data for stale run {run_id}"),
                }
            }
            msg = ctrl_rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    ControlMsg::ConnectReply(run) => {
                        *inner.sampler.write().unwrap_or_else(|e| e.into_inner()) =
                            Arc::new(AdaptiveSampler::new(
                                run.reply.sampling_target,
                                run.sampling_period(),
                                Instant::now(),
                            ));
                        *inner.run.write().unwrap_or_else(|e| e.into_inner()) = Some(run);
                        harvest = Some(Harvest::new(Utc::now()));
                    }
                    ControlMsg::CollectorError(e) => {
                        handle_collector_error(&inner, &mut harvest, e);
                    }
                    ControlMsg::Shutdown(ack) => {
                        if let (Some(run), Some(h)) = (inner.current_run(), harvest.take()) {
                            send_harvest(inner.clone(), run, h).await;
                        }
                        *inner.run.write().unwrap_or_else(|e| e.into_inner()) = None;
                        let _ = ack.send(());
                        tracing::info!("agent shut down");
                        break;
                    }
                }
            }
        }
    }
}

fn handle_collector_error(
    inner: &Arc<AppInner>,
    harvest: &mut Option<Harvest>,
    e: CollectorError,
) {
    if e.is_disconnect() || e.is_license_exception() {
        tracing::error!("collector shut this agent down: {e}");
        *inner.run.write().unwrap_or_else(|p| p.into_inner()) = None;
        *harvest = None;
    } else if e.is_restart() {
        tracing::warn!("collector requested a restart: {e}");
        *inner.run.write().unwrap_or_else(|p| p.into_inner()) = None;
        *harvest = None;
        spawn_connect_worker(inner.clone());
    } else {
        tracing::warn!("unexpected collector error: {e}");
    }
}

fn spawn_connect_worker(inner: Arc<AppInner>) {
    tokio::spawn(async move {
        let mut attempt = 0usize;
        loop {
            match connect_attempt(&inner.config, inner.transport.as_ref()).await {
                Ok(run) => {
                    let _ = inner.ctrl_tx.send(ControlMsg::ConnectReply(Arc::new(run)));
                    return;
                }
                Err(e) if e.is_disconnect() || e.is_license_exception() => {
                    let _ = inner.ctrl_tx.send(ControlMsg::CollectorError(e));
                    return;
                }
                Err(e) => {
                    let idx = attempt.min(CONNECT_BACKOFF_SCHEDULE.len() - 1);
                    let backoff = CONNECT_BACKOFF_SCHEDULE[idx];
                    tracing::warn!("connect attempt failed (retry in {backoff}s): {e}");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    attempt += 1;
                }
            }
        }
    });
}

/// Finalize a snapshotted harvest and dispatch every payload in its own
/// task, so the harvest loop never waits on I/O.
fn spawn_harvest(inner: Arc<AppInner>, run: Arc<AppRun>, mut harvest: Harvest) {
    tokio::spawn(async move {
        harvest.create_final_metrics();
        harvest.apply_metric_rules(&run.reply.metric_rules);
        for payload in harvest.into_payloads() {
            tokio::spawn(send_payload(inner.clone(), run.clone(), payload, true));
        }
    });
}

// Shutdown path: same as spawn_harvest but awaited to completion.
async fn send_harvest(inner: Arc<AppInner>, run: Arc<AppRun>, mut harvest: Harvest) {
    harvest.create_final_metrics();
    harvest.apply_metric_rules(&run.reply.metric_rules);
    for payload in harvest.into_payloads() {
        send_payload(inner.clone(), run.clone(), payload, true).await;
    }
}

async fn send_payload(
    inner: Arc<AppInner>,
    run: Arc<AppRun>,
    payload: HarvestPayload,
    allow_split: bool,
) {
    let endpoint = payload.endpoint();
    let data = match payload.data(run.run_id(), Utc::now()) {
        Ok(Some(data)) => data,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("failed to serialize {endpoint} payload: {e}");
            return;
        }
    };

    let result = collector_request(
        inner.transport.as_ref(),
        Cmd {
            name: endpoint,
            collector: &run.collector,
            license: &inner.config.license,
            run_id: Some(run.run_id()),
            data,
            max_payload_size: run.reply.max_payload_size,
            request_headers: &run.reply.request_headers_map,
            use_tls: inner.config.use_tls,
        },
    )
    .await;

    match result {
        Ok(_) => tracing::debug!("harvest {endpoint} sent"),
        Err(e) if e.is_restart() || e.is_disconnect() || e.is_license_exception() => {
            tracing::warn!("harvest {endpoint}: {e}");
            let _ = inner.ctrl_tx.send(ControlMsg::CollectorError(e));
        }
        Err(e) if e.is_payload_too_large() && allow_split => match payload.split() {
            Some((first, second)) => {
                tracing::warn!("harvest {endpoint} too large, retrying as two halves");
                Box::pin(send_payload(inner.clone(), run.clone(), first, false)).await;
                Box::pin(send_payload(inner, run, second, false)).await;
            }
            None => tracing::warn!("harvest {endpoint} too large, dropping: {e}"),
        },
        Err(e) if e.should_save_harvest_data() => {
            tracing::warn!("harvest {endpoint} failed, saving for next harvest: {e}");
            if let Some(merge_back) = payload.into_merge_back() {
                inner.consume(run.run_id().to_string(), merge_back);
            }
        }
        Err(e) => tracing::warn!("harvest {endpoint} failed, dropping: {e}"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::collector::CollectorResponse;

    #[tokio::test(start_paused = true)]
    async fn connects_and_flushes_final_harvest_on_shutdown() {
        let transport = Arc::new(ScriptedTransport::connected());
        let app = Application::new(config_with(transport.clone())).unwrap();
        assert!(app.wait_for_connection(Duration::from_secs(5)).await);

        app.record_custom_event(
            "Purchase",
            vec![("amount".to_string(), AttributeValue::from(3))],
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        app.shutdown(Duration::from_secs(5)).await;

        let custom = transport.requests_for("custom_event_data");
        assert_eq!(custom.len(), 1);
        assert!(custom[0].contains("Purchase"));
        // Final metrics always carry the instance-reporting counter.
        let metrics = transport.requests_for("metric_data");
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].contains("Instance/Reporting"));
        assert!(metrics[0].contains("run-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_drives_periodic_harvest() {
        let transport = Arc::new(ScriptedTransport::connected());
        let app = Application::new(config_with(transport.clone())).unwrap();
        assert!(app.wait_for_connection(Duration::from_secs(5)).await);

        app.record_custom_event("Tick", vec![]).unwrap();
        tokio::time::sleep(HARVEST_PERIOD + Duration::from_secs(1)).await;

        let custom = transport.requests_for("custom_event_data");
        assert_eq!(custom.len(), 1);
        assert!(custom[0].contains("Tick"));
    }

    #[tokio::test(start_paused = true)]
    async fn force_restart_reconnects_and_drops_stale_data() {
        let transport = Arc::new(ScriptedTransport::connected());
        // First custom-event harvest triggers a restart; afterwards the
        // scripted second handshake reconnects under a new run id.
        transport.script(
            "custom_event_data",
            CollectorResponse {
                status: 200,
                body: serde_json::json!({
                    "exception": {"message": "restart", "error_type": "ForceRestartException"}
                })
                .to_string()
                .into_bytes(),
            },
        );
        transport.script("get_redirect_host", ok_body("collector-2.example.com".into()));
        transport.script(
            "connect",
            ok_body(serde_json::json!({ "agent_run_id": "run-2" })),
        );

        let app = Application::new(config_with(transport.clone())).unwrap();
        assert!(app.wait_for_connection(Duration::from_secs(5)).await);

        app.record_custom_event("BeforeRestart", vec![]).unwrap();
        tokio::time::sleep(HARVEST_PERIOD + Duration::from_secs(1)).await;

        // The restart worker runs the handshake again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.requests_for("get_redirect_host").len(), 2);
        assert_eq!(transport.requests_for("connect").len(), 2);

        // Data recorded under the new run flows into the next harvest.
        app.record_custom_event("AfterRestart", vec![]).unwrap();
        tokio::time::sleep(HARVEST_PERIOD + Duration::from_secs(1)).await;
        let custom = transport.requests_for("custom_event_data");
        assert_eq!(custom.len(), 2);
        assert!(custom[1].contains("AfterRestart"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_merges_events_into_next_harvest() {
        let transport = Arc::new(ScriptedTransport::connected());
        transport.script(
            "custom_event_data",
            CollectorResponse {
                status: 503,
                body: Vec::new(),
            },
        );

        let app = Application::new(config_with(transport.clone())).unwrap();
        assert!(app.wait_for_connection(Duration::from_secs(5)).await);

        app.record_custom_event("Retried", vec![]).unwrap();
        tokio::time::sleep(HARVEST_PERIOD + Duration::from_secs(1)).await;
        assert_eq!(transport.requests_for("custom_event_data").len(), 1);

        // Second harvest retries the merged-back events.
        tokio::time::sleep(HARVEST_PERIOD).await;
        let custom = transport.requests_for("custom_event_data");
        assert_eq!(custom.len(), 2);
        assert!(custom[1].contains("Retried"));
    }

    #[tokio::test(start_paused = true)]
    async fn force_disconnect_goes_dormant() {
        let transport = Arc::new(ScriptedTransport::connected());
        transport.script(
            "custom_event_data",
            CollectorResponse {
                status: 410,
                body: Vec::new(),
            },
        );

        let app = Application::new(config_with(transport.clone())).unwrap();
        assert!(app.wait_for_connection(Duration::from_secs(5)).await);
        app.record_custom_event("Doomed", vec![]).unwrap();
        tokio::time::sleep(HARVEST_PERIOD + Duration::from_secs(1)).await;

        // No reconnect: a single handshake ever happened.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.requests_for("get_redirect_host").len(), 1);
        assert!(app.inner.current_run().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn development_mode_never_dials_out() {
        let transport = Arc::new(ScriptedTransport::connected());
        let mut config = config_with(transport.clone());
        config.development = true;
        let app = Application::new(config).unwrap();
        assert!(!app.wait_for_connection(Duration::from_secs(1)).await);
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_events_rejected_under_high_security() {
        let transport = Arc::new(ScriptedTransport::connected());
        let mut config = config_with(transport);
        config.high_security = true;
        let app = Application::new(config).unwrap();
        assert!(matches!(
            app.record_custom_event("Nope", vec![]),
            Err(CustomEventError::Disabled)
        ));
    }
}
