use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::limits::MAX_METRICS;
use crate::rules::MetricRules;

// Rollup metric names shared across the transaction lifecycle and the
// breakdown emitters.
pub(crate) const APDEX_ROLLUP: &str = "Apdex";
pub(crate) const APDEX_PREFIX: &str = "Apdex/";
pub(crate) const WEB_ROLLUP: &str = "WebTransaction";
pub(crate) const BACKGROUND_ROLLUP: &str = "OtherTransaction/all";
pub(crate) const DISPATCHER_METRIC: &str = "HttpDispatcher";
pub(crate) const ERRORS_ALL: &str = "Errors/all";
pub(crate) const ERRORS_WEB: &str = "Errors/allWeb";
pub(crate) const ERRORS_BACKGROUND: &str = "Errors/allOther";
pub(crate) const ERRORS_PREFIX: &str = "Errors/";
pub(crate) const QUEUE_METRIC: &str = "WebFrontend/QueueTime";

pub(crate) const INSTANCE_REPORTING: &str = "Instance/Reporting";
pub(crate) const SUPPORTABILITY_DROPPED: &str = "Supportability/MetricsDropped";
pub(crate) const TXN_EVENTS_SEEN: &str = "Supportability/AnalyticsEvents/TotalEventsSeen";
pub(crate) const TXN_EVENTS_SENT: &str = "Supportability/AnalyticsEvents/TotalEventsSent";
pub(crate) const CUSTOM_EVENTS_SEEN: &str = "Supportability/Events/Customer/Seen";
pub(crate) const CUSTOM_EVENTS_SENT: &str = "Supportability/Events/Customer/Sent";
pub(crate) const ERROR_EVENTS_SEEN: &str = "Supportability/Events/TransactionError/Seen";
pub(crate) const ERROR_EVENTS_SENT: &str = "Supportability/Events/TransactionError/Sent";

/// User satisfaction band for one web transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApdexZone {
    Satisfying,
    Tolerating,
    Failing,
    None,
}

impl ApdexZone {
    pub(crate) fn label(self) -> Option<&'static str> {
        match self {
            ApdexZone::Satisfying => Some("S"),
            ApdexZone::Tolerating => Some("T"),
            ApdexZone::Failing => Some("F"),
            ApdexZone::None => None,
        }
    }
}

/// satisfying <= T, tolerating <= 4T, else failing.
pub(crate) fn calculate_apdex_zone(threshold: Duration, duration: Duration) -> ApdexZone {
    if duration <= threshold {
        ApdexZone::Satisfying
    } else if duration <= threshold * 4 {
        ApdexZone::Tolerating
    } else {
        ApdexZone::Failing
    }
}

/// The six-slot aggregate shipped per metric. Apdex metrics overload the
/// first three slots as satisfied/tolerated/failing counts so zone tallies
/// still merge arithmetically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MetricData {
    pub count: f64,
    pub total: f64,
    pub exclusive: f64,
    pub min: f64,
    pub max: f64,
    pub sum_squares: f64,
}

impl MetricData {
    pub(crate) fn from_duration(total: Duration, exclusive: Duration) -> MetricData {
        let t = total.as_secs_f64();
        let e = exclusive.as_secs_f64();
        MetricData {
            count: 1.0,
            total: t,
            exclusive: e,
            min: t,
            max: t,
            sum_squares: t * t,
        }
    }

    pub(crate) fn from_apdex(zone: ApdexZone, threshold: Duration) -> MetricData {
        let t = threshold.as_secs_f64();
        let (s, tol, f) = match zone {
            ApdexZone::Satisfying => (1.0, 0.0, 0.0),
            ApdexZone::Tolerating => (0.0, 1.0, 0.0),
            ApdexZone::Failing => (0.0, 0.0, 1.0),
            ApdexZone::None => (0.0, 0.0, 0.0),
        };
        MetricData {
            count: s,
            total: tol,
            exclusive: f,
            min: t,
            max: t,
            sum_squares: 0.0,
        }
    }

    pub(crate) fn from_count(count: f64) -> MetricData {
        MetricData {
            count,
            total: 0.0,
            exclusive: 0.0,
            min: 0.0,
            max: 0.0,
            sum_squares: 0.0,
        }
    }

    pub(crate) fn aggregate(&mut self, other: MetricData) {
        self.count += other.count;
        self.total += other.total;
        self.exclusive += other.exclusive;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
        self.sum_squares += other.sum_squares;
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) struct MetricId {
    pub name: String,
    /// Empty string means unscoped.
    pub scope: String,
}

impl MetricId {
    pub(crate) fn unscoped(name: impl Into<String>) -> MetricId {
        MetricId {
            name: name.into(),
            scope: String::new(),
        }
    }

    pub(crate) fn scoped(name: impl Into<String>, scope: impl Into<String>) -> MetricId {
        MetricId {
            name: name.into(),
            scope: scope.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Metric {
    forced: bool,
    data: MetricData,
}

/// Aggregated metrics for one harvest window, keyed by (name, scope).
/// Overflow past the table cap drops unforced metrics and counts them for
/// the `Supportability/MetricsDropped` report.
#[derive(Debug)]
pub(crate) struct MetricTable {
    metrics: HashMap<MetricId, Metric>,
    max_table_size: usize,
    num_dropped: u64,
    failed_harvests: u32,
    pub(crate) period_start: DateTime<Utc>,
}

impl MetricTable {
    pub(crate) fn new(period_start: DateTime<Utc>) -> MetricTable {
        MetricTable::with_capacity(MAX_METRICS, period_start)
    }

    pub(crate) fn with_capacity(max_table_size: usize, period_start: DateTime<Utc>) -> MetricTable {
        MetricTable {
            metrics: HashMap::new(),
            max_table_size,
            num_dropped: 0,
            failed_harvests: 0,
            period_start,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.metrics.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub(crate) fn num_dropped(&self) -> u64 {
        self.num_dropped
    }

    fn full(&self) -> bool {
        self.metrics.len() >= self.max_table_size
    }

    pub(crate) fn add(&mut self, id: MetricId, data: MetricData, forced: bool) {
        match self.metrics.get_mut(&id) {
            Some(existing) => existing.data.aggregate(data),
            None => {
                if self.full() && !forced {
                    self.num_dropped += 1;
                    return;
                }
                self.metrics.insert(id, Metric { forced, data });
            }
        }
    }

    pub(crate) fn add_duration(
        &mut self,
        id: MetricId,
        total: Duration,
        exclusive: Duration,
        forced: bool,
    ) {
        self.add(id, MetricData::from_duration(total, exclusive), forced);
    }

    pub(crate) fn add_apdex(
        &mut self,
        id: MetricId,
        threshold: Duration,
        zone: ApdexZone,
        forced: bool,
    ) {
        self.add(id, MetricData::from_apdex(zone, threshold), forced);
    }

    pub(crate) fn add_count(&mut self, id: MetricId, count: f64, forced: bool) {
        self.add(id, MetricData::from_count(count), forced);
    }

    pub(crate) fn add_single_count(&mut self, id: MetricId, forced: bool) {
        self.add_count(id, 1.0, forced);
    }

    /// Fold `other` into this table. Used on the harvest thread both for
    /// per-transaction tables and for the pieces of a split reservoir.
    pub(crate) fn merge(&mut self, other: MetricTable) {
        self.num_dropped += other.num_dropped;
        for (id, metric) in other.metrics {
            self.add(id, metric.data, metric.forced);
        }
    }

    /// Merge a table whose harvest send failed. Gives up silently after the
    /// retry limit; otherwise the combined table keeps the older period
    /// start so the collector sees the true window.
    pub(crate) fn merge_failed(&mut self, other: MetricTable) {
        let fails = other.failed_harvests + 1;
        if fails >= crate::limits::FAILED_METRIC_ATTEMPTS_LIMIT {
            tracing::warn!("dropping metrics after {fails} failed harvest attempts");
            return;
        }
        self.failed_harvests = fails;
        if other.period_start < self.period_start {
            self.period_start = other.period_start;
        }
        self.merge(other);
    }

    /// Rename pass from the connect reply. Metrics whose name is ignored by
    /// a rule are dropped; renamed metrics merge with any existing entry.
    pub(crate) fn apply_rules(self, rules: &MetricRules) -> MetricTable {
        if rules.is_empty() {
            return self;
        }
        let mut applied = MetricTable::with_capacity(self.max_table_size, self.period_start);
        applied.num_dropped = self.num_dropped;
        applied.failed_harvests = self.failed_harvests;
        for (id, metric) in self.metrics {
            match rules.apply(&id.name) {
                Some(name) => applied.add(
                    MetricId {
                        name,
                        scope: id.scope,
                    },
                    metric.data,
                    metric.forced,
                ),
                None => {
                    tracing::debug!("metric '{}' ignored by rename rules", id.name);
                }
            }
        }
        applied
    }

    pub(crate) fn collector_json(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>, serde_json::Error> {
        if self.is_empty() {
            return Ok(None);
        }
        let entries: Vec<serde_json::Value> = self
            .metrics
            .iter()
            .map(|(id, metric)| {
                let ident = if id.scope.is_empty() {
                    json!({ "name": id.name })
                } else {
                    json!({ "name": id.name, "scope": id.scope })
                };
                let d = metric.data;
                json!([ident, [d.count, d.total, d.exclusive, d.min, d.max, d.sum_squares]])
            })
            .collect();
        let payload = json!([
            run_id,
            self.period_start.timestamp(),
            now.timestamp(),
            entries
        ]);
        serde_json::to_vec(&payload).map(Some)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, name: &str, scope: &str) -> Option<MetricData> {
        self.metrics
            .get(&MetricId {
                name: name.to_string(),
                scope: scope.to_string(),
            })
            .map(|m| m.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::MetricRules;

    fn table() -> MetricTable {
        MetricTable::new(Utc::now())
    }

    #[test]
    fn duration_aggregation() {
        let mut t = table();
        let id = MetricId::unscoped("WebTransaction/Rust/hello");
        t.add_duration(id.clone(), Duration::from_secs(2), Duration::from_secs(1), false);
        t.add_duration(id.clone(), Duration::from_secs(4), Duration::from_secs(3), false);
        let d = t.get("WebTransaction/Rust/hello", "").unwrap();
        assert_eq!(d.count, 2.0);
        assert_eq!(d.total, 6.0);
        assert_eq!(d.exclusive, 4.0);
        assert_eq!(d.min, 2.0);
        assert_eq!(d.max, 4.0);
        assert_eq!(d.sum_squares, 20.0);
    }

    #[test]
    fn apdex_encoding_merges_zone_counts() {
        let mut t = table();
        let id = MetricId::unscoped(APDEX_ROLLUP);
        let threshold = Duration::from_millis(500);
        t.add_apdex(id.clone(), threshold, ApdexZone::Satisfying, true);
        t.add_apdex(id.clone(), threshold, ApdexZone::Tolerating, true);
        t.add_apdex(id.clone(), threshold, ApdexZone::Failing, true);
        t.add_apdex(id.clone(), threshold, ApdexZone::Failing, true);
        let d = t.get(APDEX_ROLLUP, "").unwrap();
        assert_eq!((d.count, d.total, d.exclusive), (1.0, 1.0, 2.0));
        assert_eq!(d.min, 0.5);
    }

    #[test]
    fn apdex_zone_bands() {
        let t = Duration::from_millis(100);
        assert_eq!(calculate_apdex_zone(t, Duration::from_millis(100)), ApdexZone::Satisfying);
        assert_eq!(calculate_apdex_zone(t, Duration::from_millis(250)), ApdexZone::Tolerating);
        assert_eq!(calculate_apdex_zone(t, Duration::from_millis(401)), ApdexZone::Failing);
    }

    #[test]
    fn overflow_drops_unforced_and_counts() {
        let mut t = MetricTable::with_capacity(2, Utc::now());
        t.add_single_count(MetricId::unscoped("a"), false);
        t.add_single_count(MetricId::unscoped("b"), false);
        t.add_single_count(MetricId::unscoped("c"), false);
        t.add_single_count(MetricId::unscoped("forced"), true);
        // Existing entries still aggregate past the cap.
        t.add_single_count(MetricId::unscoped("a"), false);
        assert_eq!(t.num_dropped(), 1);
        assert_eq!(t.get("a", "").unwrap().count, 2.0);
        assert!(t.get("c", "").is_none());
        assert!(t.get("forced", "").is_some());
    }

    #[test]
    fn merge_failed_keeps_older_period_and_counts_attempts() {
        let old_start = Utc::now() - chrono::Duration::seconds(120);
        let mut failed = MetricTable::new(old_start);
        failed.add_single_count(MetricId::unscoped("x"), false);

        let mut current = table();
        current.merge_failed(failed);
        assert_eq!(current.period_start, old_start);
        assert_eq!(current.failed_harvests, 1);
        assert_eq!(current.get("x", "").unwrap().count, 1.0);
    }

    #[test]
    fn merge_failed_discards_after_limit() {
        let mut doomed = MetricTable::new(Utc::now());
        doomed.add_single_count(MetricId::unscoped("x"), false);
        doomed.failed_harvests = crate::limits::FAILED_METRIC_ATTEMPTS_LIMIT - 1;

        let mut current = table();
        current.merge_failed(doomed);
        assert!(current.get("x", "").is_none());
    }

    #[test]
    fn rules_rename_and_ignore() {
        let rules: MetricRules = serde_json::from_str(
            r#"[
                {"match_expression": "secret", "ignore": true, "eval_order": 0},
                {"match_expression": "old", "replacement": "new", "eval_order": 1}
            ]"#,
        )
        .unwrap();
        let mut t = table();
        t.add_single_count(MetricId::unscoped("contains/secret/stuff"), false);
        t.add_single_count(MetricId::unscoped("path/old/leaf"), false);
        let t = t.apply_rules(&rules);
        assert!(t.get("contains/secret/stuff", "").is_none());
        assert!(t.get("path/new/leaf", "").is_some());
    }

    #[test]
    fn rules_are_idempotent_when_output_is_stable() {
        let rules: MetricRules = serde_json::from_str(
            r#"[{"match_expression": "^legacy/", "replacement": "modern/", "eval_order": 0}]"#,
        )
        .unwrap();
        let mut t = table();
        t.add_single_count(MetricId::unscoped("legacy/route"), false);
        let once = t.apply_rules(&rules);
        assert!(once.get("modern/route", "").is_some());
        let twice = once.apply_rules(&rules);
        assert!(twice.get("modern/route", "").is_some());
        assert_eq!(twice.len(), 1);
    }

    #[test]
    fn collector_json_shape() {
        let mut t = table();
        t.add_duration(
            MetricId::scoped("Custom/seg", "WebTransaction/Rust/x"),
            Duration::from_secs(1),
            Duration::from_secs(1),
            false,
        );
        let bytes = t.collector_json("12345", Utc::now()).unwrap().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v[0], "12345");
        assert_eq!(v[3][0][0]["name"], "Custom/seg");
        assert_eq!(v[3][0][0]["scope"], "WebTransaction/Rust/x");
        assert_eq!(v[3][0][1][0], 1.0);

        let empty = table();
        assert!(empty.collector_json("12345", Utc::now()).unwrap().is_none());
    }
}
