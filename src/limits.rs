use std::time::Duration;

// Harvest cadence and collector deadlines.
pub(crate) const HARVEST_PERIOD: Duration = Duration::from_secs(60);
pub(crate) const COLLECTOR_TIMEOUT: Duration = Duration::from_secs(20);
pub(crate) const APP_DATA_CHAN_SIZE: usize = 200;

/// Reconnect schedule after a ForceRestartException, in seconds. The final
/// entry repeats.
pub(crate) const CONNECT_BACKOFF_SCHEDULE: &[u64] = &[15, 15, 30, 60, 120, 300];

// Reservoir capacities per harvest period.
pub(crate) const MAX_TXN_EVENTS: usize = 10_000;
pub(crate) const MAX_CUSTOM_EVENTS: usize = 10_000;
pub(crate) const MAX_ERROR_EVENTS: usize = 100;

// Error capture bounds.
pub(crate) const MAX_TXN_ERRORS: usize = 5;
pub(crate) const MAX_HARVEST_ERRORS: usize = 20;
pub(crate) const MAX_STACK_TRACE_FRAMES: usize = 100;

// Metric table.
pub(crate) const MAX_METRICS: usize = 2_000;

// Transaction trace tree.
pub(crate) const MAX_TRACE_NODES: usize = 256;

// Attribute validation.
pub(crate) const ATTRIBUTE_KEY_LENGTH_LIMIT: usize = 255;
pub(crate) const ATTRIBUTE_VALUE_LENGTH_LIMIT: usize = 255;
pub(crate) const ATTRIBUTE_USER_LIMIT: usize = 64;
pub(crate) const CUSTOM_EVENT_TYPE_LENGTH_LIMIT: usize = 255;

// Merge-back retry limits for failed harvest payloads.
pub(crate) const FAILED_METRIC_ATTEMPTS_LIMIT: u32 = 5;
pub(crate) const FAILED_EVENTS_ATTEMPTS_LIMIT: u32 = 10;

// Collector protocol.
pub(crate) const PROTOCOL_VERSION: u32 = 17;
pub(crate) const MAX_PAYLOAD_SIZE_DEFAULT: usize = 1_000_000;
pub(crate) const COLLECTOR_HOST_DEFAULT: &str = "collector.newrelic.com";

// Adaptive sampler defaults, overridable by the connect reply.
pub(crate) const SAMPLING_TARGET_DEFAULT: u64 = 10;
pub(crate) const SAMPLING_PERIOD_DEFAULT: Duration = Duration::from_secs(60);

// Apdex and tracer thresholds.
pub(crate) const APDEX_THRESHOLD_DEFAULT: Duration = Duration::from_millis(500);
pub(crate) const SEGMENT_THRESHOLD_DEFAULT: Duration = Duration::from_millis(2);
pub(crate) const STACK_TRACE_THRESHOLD_DEFAULT: Duration = Duration::from_millis(500);

pub(crate) const LICENSE_LENGTH: usize = 40;
