use chrono::{DateTime, Utc};

use crate::collector::{
    CMD_CUSTOM_EVENTS, CMD_ERROR_DATA, CMD_ERROR_EVENTS, CMD_METRICS, CMD_TXN_EVENTS,
    CMD_TXN_TRACES,
};
use crate::errors::{ErrorTrace, HarvestErrors};
use crate::events::{CustomEvent, ErrorEvent, EventPool, TxnEvent};
use crate::limits::{MAX_CUSTOM_EVENTS, MAX_ERROR_EVENTS, MAX_TXN_EVENTS};
use crate::metrics::{
    CUSTOM_EVENTS_SEEN, CUSTOM_EVENTS_SENT, ERROR_EVENTS_SEEN, ERROR_EVENTS_SENT,
    INSTANCE_REPORTING, MetricId, MetricTable, SUPPORTABILITY_DROPPED, TXN_EVENTS_SEEN,
    TXN_EVENTS_SENT,
};
use crate::rules::MetricRules;
use crate::sampler::Priority;
use crate::trace::{HarvestTraces, TxnTrace};

/// One harvest window's aggregation bucket. Only the harvest loop touches
/// it, so nothing in here locks.
#[derive(Debug)]
pub(crate) struct Harvest {
    pub metrics: MetricTable,
    pub custom_events: EventPool<CustomEvent>,
    pub txn_events: EventPool<TxnEvent>,
    pub error_events: EventPool<ErrorEvent>,
    pub error_traces: HarvestErrors,
    pub txn_traces: HarvestTraces,
}

impl Harvest {
    pub(crate) fn new(now: DateTime<Utc>) -> Harvest {
        Harvest {
            metrics: MetricTable::new(now),
            custom_events: EventPool::new(MAX_CUSTOM_EVENTS),
            txn_events: EventPool::new(MAX_TXN_EVENTS),
            error_events: EventPool::new(MAX_ERROR_EVENTS),
            error_traces: HarvestErrors::new(),
            txn_traces: HarvestTraces::new(),
        }
    }

    /// Append instance-reporting and event accounting supportability
    /// metrics. Called exactly once, immediately before serialization.
    pub(crate) fn create_final_metrics(&mut self) {
        self.metrics
            .add_single_count(MetricId::unscoped(INSTANCE_REPORTING), true);

        for (seen, sent, pool_seen, pool_saved) in [
            (TXN_EVENTS_SEEN, TXN_EVENTS_SENT, self.txn_events.seen(), self.txn_events.saved()),
            (
                CUSTOM_EVENTS_SEEN,
                CUSTOM_EVENTS_SENT,
                self.custom_events.seen(),
                self.custom_events.saved(),
            ),
            (
                ERROR_EVENTS_SEEN,
                ERROR_EVENTS_SENT,
                self.error_events.seen(),
                self.error_events.saved(),
            ),
        ] {
            self.metrics
                .add_count(MetricId::unscoped(seen), pool_seen as f64, true);
            self.metrics
                .add_count(MetricId::unscoped(sent), pool_saved as f64, true);
        }

        if self.metrics.num_dropped() > 0 {
            let dropped = self.metrics.num_dropped() as f64;
            self.metrics
                .add_count(MetricId::unscoped(SUPPORTABILITY_DROPPED), dropped, true);
        }
    }

    pub(crate) fn apply_metric_rules(&mut self, rules: &MetricRules) {
        let period_start = self.metrics.period_start;
        let table = std::mem::replace(&mut self.metrics, MetricTable::new(period_start));
        self.metrics = table.apply_rules(rules);
    }

    pub(crate) fn into_payloads(self) -> Vec<HarvestPayload> {
        vec![
            HarvestPayload::Metrics(self.metrics),
            HarvestPayload::CustomEvents(self.custom_events),
            HarvestPayload::TxnEvents(self.txn_events),
            HarvestPayload::ErrorEvents(self.error_events),
            HarvestPayload::ErrorTraces(self.error_traces),
            HarvestPayload::TxnTraces(self.txn_traces),
        ]
    }
}

/// Artifacts flowing from transaction emitters (and failed-payload
/// merge-backs) to the harvest loop over the data channel.
#[derive(Debug)]
pub(crate) enum HarvestData {
    Metrics(MetricTable),
    TxnEvent(Priority, Box<TxnEvent>),
    CustomEvent(Priority, Box<CustomEvent>),
    ErrorEvents(Vec<(Priority, ErrorEvent)>),
    ErrorTraces(Vec<ErrorTrace>),
    TxnTrace(Box<TxnTrace>),
    // Failed-payload merge-backs; these carry retry accounting.
    FailedMetrics(MetricTable),
    FailedTxnEvents(EventPool<TxnEvent>),
    FailedCustomEvents(EventPool<CustomEvent>),
    FailedErrorEvents(EventPool<ErrorEvent>),
}

impl HarvestData {
    pub(crate) fn merge_into_harvest(self, h: &mut Harvest) {
        match self {
            HarvestData::Metrics(table) => h.metrics.merge(table),
            HarvestData::TxnEvent(priority, event) => h.txn_events.add_event(priority, *event),
            HarvestData::CustomEvent(priority, event) => {
                h.custom_events.add_event(priority, *event);
            }
            HarvestData::ErrorEvents(events) => {
                for (priority, event) in events {
                    h.error_events.add_event(priority, event);
                }
            }
            HarvestData::ErrorTraces(traces) => h.error_traces.extend(traces),
            HarvestData::TxnTrace(trace) => h.txn_traces.witness(*trace),
            HarvestData::FailedMetrics(table) => h.metrics.merge_failed(table),
            HarvestData::FailedTxnEvents(pool) => h.txn_events.merge_failed(pool),
            HarvestData::FailedCustomEvents(pool) => h.custom_events.merge_failed(pool),
            HarvestData::FailedErrorEvents(pool) => h.error_events.merge_failed(pool),
        }
    }
}

/// One endpoint's worth of a snapshotted harvest, ready to serialize and
/// send. The variant set is closed: these are the only payload kinds.
#[derive(Debug)]
pub(crate) enum HarvestPayload {
    Metrics(MetricTable),
    CustomEvents(EventPool<CustomEvent>),
    TxnEvents(EventPool<TxnEvent>),
    ErrorEvents(EventPool<ErrorEvent>),
    ErrorTraces(HarvestErrors),
    TxnTraces(HarvestTraces),
}

impl HarvestPayload {
    pub(crate) fn endpoint(&self) -> &'static str {
        match self {
            HarvestPayload::Metrics(_) => CMD_METRICS,
            HarvestPayload::CustomEvents(_) => CMD_CUSTOM_EVENTS,
            HarvestPayload::TxnEvents(_) => CMD_TXN_EVENTS,
            HarvestPayload::ErrorEvents(_) => CMD_ERROR_EVENTS,
            HarvestPayload::ErrorTraces(_) => CMD_ERROR_DATA,
            HarvestPayload::TxnTraces(_) => CMD_TXN_TRACES,
        }
    }

    /// Serialize for the collector; `Ok(None)` means nothing to send.
    pub(crate) fn data(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>, serde_json::Error> {
        match self {
            HarvestPayload::Metrics(table) => table.collector_json(run_id, now),
            HarvestPayload::CustomEvents(pool) => pool.collector_json(run_id),
            HarvestPayload::TxnEvents(pool) => pool.collector_json(run_id),
            HarvestPayload::ErrorEvents(pool) => pool.collector_json(run_id),
            HarvestPayload::ErrorTraces(errors) => errors.collector_json(run_id),
            HarvestPayload::TxnTraces(traces) => traces.collector_json(run_id),
        }
    }

    /// Convert a payload whose send failed into the merge-back artifact for
    /// the next harvest. Traces are not worth retrying.
    pub(crate) fn into_merge_back(self) -> Option<HarvestData> {
        match self {
            HarvestPayload::Metrics(table) => Some(HarvestData::FailedMetrics(table)),
            HarvestPayload::CustomEvents(pool) => Some(HarvestData::FailedCustomEvents(pool)),
            HarvestPayload::TxnEvents(pool) => Some(HarvestData::FailedTxnEvents(pool)),
            HarvestPayload::ErrorEvents(pool) => Some(HarvestData::FailedErrorEvents(pool)),
            HarvestPayload::ErrorTraces(errors) => {
                Some(HarvestData::ErrorTraces(errors.into_traces()))
            }
            HarvestPayload::TxnTraces(_) => None,
        }
    }

    /// Halve an event payload for a too-large retry. Non-splittable
    /// payloads return None and are dropped by the caller.
    pub(crate) fn split(self) -> Option<(HarvestPayload, HarvestPayload)> {
        match self {
            HarvestPayload::CustomEvents(pool) => {
                let (a, b) = pool.split();
                Some((HarvestPayload::CustomEvents(a), HarvestPayload::CustomEvents(b)))
            }
            HarvestPayload::TxnEvents(pool) => {
                let (a, b) = pool.split();
                Some((HarvestPayload::TxnEvents(a), HarvestPayload::TxnEvents(b)))
            }
            HarvestPayload::ErrorEvents(pool) => {
                let (a, b) = pool.split();
                Some((HarvestPayload::ErrorEvents(a), HarvestPayload::ErrorEvents(b)))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn final_metrics_report_event_accounting() {
        let mut h = Harvest::new(Utc::now());
        for i in 0..3 {
            let e = CustomEvent::new("T".into(), vec![], Utc::now()).unwrap();
            h.custom_events.add_event(Priority::fixed(i as f32 / 10.0), e);
        }
        h.create_final_metrics();
        assert_eq!(h.metrics.get(INSTANCE_REPORTING, "").unwrap().count, 1.0);
        assert_eq!(h.metrics.get(CUSTOM_EVENTS_SEEN, "").unwrap().count, 3.0);
        assert_eq!(h.metrics.get(CUSTOM_EVENTS_SENT, "").unwrap().count, 3.0);
        assert_eq!(h.metrics.get(TXN_EVENTS_SEEN, "").unwrap().count, 0.0);
        assert!(h.metrics.get(SUPPORTABILITY_DROPPED, "").is_none());
    }

    #[test]
    fn payload_endpoints_are_the_wire_methods() {
        let h = Harvest::new(Utc::now());
        let endpoints: Vec<&str> = h.into_payloads().iter().map(|p| p.endpoint()).collect();
        assert_eq!(
            endpoints,
            vec![
                "metric_data",
                "custom_event_data",
                "analytic_event_data",
                "error_event_data",
                "error_data",
                "transaction_sample_data",
            ]
        );
    }

    #[test]
    fn empty_payloads_serialize_to_none() {
        let h = Harvest::new(Utc::now());
        for payload in h.into_payloads() {
            // A fresh harvest has nothing to ship on any endpoint.
            assert!(payload.data("1", Utc::now()).unwrap().is_none());
        }
    }

    #[test]
    fn merge_back_preserves_event_priorities() {
        let mut pool = EventPool::new(10);
        let e = CustomEvent::new("T".into(), vec![], Utc::now()).unwrap();
        pool.add_event(Priority::fixed(0.7), e);
        let payload = HarvestPayload::CustomEvents(pool);
        let mut next = Harvest::new(Utc::now());
        payload.into_merge_back().unwrap().merge_into_harvest(&mut next);
        assert_eq!(next.custom_events.saved(), 1);
        assert_eq!(next.custom_events.seen(), 1);
    }

    #[test]
    fn traces_are_never_merged_back() {
        let payload = HarvestPayload::TxnTraces(HarvestTraces::new());
        assert!(payload.into_merge_back().is_none());
    }

    #[test]
    fn only_event_payloads_split() {
        assert!(HarvestPayload::TxnEvents(EventPool::new(4)).split().is_some());
        assert!(HarvestPayload::ErrorTraces(HarvestErrors::new()).split().is_none());
        assert!(
            HarvestPayload::Metrics(MetricTable::new(Utc::now()))
                .split()
                .is_none()
        );
    }
}
