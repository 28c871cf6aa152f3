use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::attributes::{AttributeConfigInput, DestinationConfig};
use crate::collector::CollectorTransport;
use crate::limits::{LICENSE_LENGTH, SEGMENT_THRESHOLD_DEFAULT, STACK_TRACE_THRESHOLD_DEFAULT};

/// Preconnect host override, resolved once at process start.
pub(crate) static HOST_OVERRIDE: LazyLock<Option<String>> = LazyLock::new(|| {
    std::env::var("NEW_RELIC_HOST").ok().filter(|h| !h.is_empty())
});

/// Opt-in verbose dump of harvest payloads, resolved once at process start.
pub(crate) static DEBUG_LOGGING: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("NEW_RELIC_DEBUG_LOGGING").is_ok_and(|v| !v.is_empty() && v != "0")
});

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("license length is not {expected}: got {actual}")]
    LicenseLength { expected: usize, actual: usize },
    #[error("app name required")]
    AppNameMissing,
    #[error("high security requires TLS")]
    HighSecurityRequiresTls,
}

/// Attribute include/exclude surface for one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeDestination {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for AttributeDestination {
    fn default() -> Self {
        AttributeDestination {
            enabled: true,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl AttributeDestination {
    fn to_input(&self) -> DestinationConfig {
        DestinationConfig {
            enabled: self.enabled,
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCollectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub capture_events: bool,
    /// Response codes that never produce an automatic transaction error.
    #[serde(default = "default_ignore_status_codes")]
    pub ignore_status_codes: Vec<u16>,
    #[serde(default)]
    pub attributes: AttributeDestination,
}

impl Default for ErrorCollectorConfig {
    fn default() -> Self {
        ErrorCollectorConfig {
            enabled: true,
            capture_events: true,
            ignore_status_codes: default_ignore_status_codes(),
            attributes: AttributeDestination::default(),
        }
    }
}

fn default_ignore_status_codes() -> Vec<u16> {
    vec![404]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEventsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub attributes: AttributeDestination,
}

impl Default for TransactionEventsConfig {
    fn default() -> Self {
        TransactionEventsConfig {
            enabled: true,
            attributes: AttributeDestination::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEventsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CustomEventsConfig {
    fn default() -> Self {
        CustomEventsConfig { enabled: true }
    }
}

/// Transaction trace threshold: apdex-derived (4×T) by default, or a fixed
/// duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerThreshold {
    #[serde(default = "default_true")]
    pub is_apdex_failing: bool,
    #[serde(default)]
    pub duration: Duration,
}

impl Default for TracerThreshold {
    fn default() -> Self {
        TracerThreshold {
            is_apdex_failing: true,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionTracerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub threshold: TracerThreshold,
    #[serde(default = "default_segment_threshold")]
    pub segment_threshold: Duration,
    #[serde(default = "default_stack_trace_threshold")]
    pub stack_trace_threshold: Duration,
    #[serde(default)]
    pub attributes: AttributeDestination,
}

impl Default for TransactionTracerConfig {
    fn default() -> Self {
        TransactionTracerConfig {
            enabled: true,
            threshold: TracerThreshold::default(),
            segment_threshold: default_segment_threshold(),
            stack_trace_threshold: default_stack_trace_threshold(),
            attributes: AttributeDestination::default(),
        }
    }
}

fn default_segment_threshold() -> Duration {
    SEGMENT_THRESHOLD_DEFAULT
}

fn default_stack_trace_threshold() -> Duration {
    STACK_TRACE_THRESHOLD_DEFAULT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserMonitoringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "disabled_attributes")]
    pub attributes: AttributeDestination,
}

impl Default for BrowserMonitoringConfig {
    fn default() -> Self {
        BrowserMonitoringConfig {
            enabled: false,
            attributes: disabled_attributes(),
        }
    }
}

fn disabled_attributes() -> AttributeDestination {
    AttributeDestination {
        enabled: false,
        ..AttributeDestination::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilizationConfig {
    #[serde(default)]
    pub detect_aws: bool,
    #[serde(default = "default_true")]
    pub detect_docker: bool,
}

impl Default for UtilizationConfig {
    fn default() -> Self {
        UtilizationConfig {
            detect_aws: false,
            detect_docker: true,
        }
    }
}

/// Embedder-facing agent configuration. Construct with [`Config::new`] and
/// adjust fields before handing it to `Application::new`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub app_name: String,
    #[serde(skip_serializing)]
    pub license: String,
    #[serde(default)]
    pub high_security: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub host_display_name: String,
    #[serde(default)]
    pub error_collector: ErrorCollectorConfig,
    #[serde(default)]
    pub transaction_events: TransactionEventsConfig,
    #[serde(default)]
    pub custom_insights_events: CustomEventsConfig,
    #[serde(default)]
    pub transaction_tracer: TransactionTracerConfig,
    #[serde(default)]
    pub attributes: AttributeDestination,
    #[serde(default)]
    pub browser_monitoring: BrowserMonitoringConfig,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub utilization: UtilizationConfig,
    /// When set, the agent never contacts a collector: transactions are
    /// recorded and dropped. Validation is also relaxed.
    #[serde(default)]
    pub development: bool,
    /// Custom collector round-trip, mainly for tests.
    #[serde(skip)]
    pub transport: Option<Arc<dyn CollectorTransport>>,
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("app_name", &self.app_name)
            .field("high_security", &self.high_security)
            .field("use_tls", &self.use_tls)
            .field("development", &self.development)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn new(app_name: impl Into<String>, license: impl Into<String>) -> Config {
        Config {
            app_name: app_name.into(),
            license: license.into(),
            high_security: false,
            labels: HashMap::new(),
            host_display_name: String::new(),
            error_collector: ErrorCollectorConfig::default(),
            transaction_events: TransactionEventsConfig::default(),
            custom_insights_events: CustomEventsConfig::default(),
            transaction_tracer: TransactionTracerConfig::default(),
            attributes: AttributeDestination::default(),
            browser_monitoring: BrowserMonitoringConfig::default(),
            use_tls: true,
            utilization: UtilizationConfig::default(),
            development: false,
            transport: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.high_security && !self.use_tls {
            return Err(ConfigError::HighSecurityRequiresTls);
        }
        if self.development {
            return Ok(());
        }
        if self.license.len() != LICENSE_LENGTH {
            return Err(ConfigError::LicenseLength {
                expected: LICENSE_LENGTH,
                actual: self.license.len(),
            });
        }
        if self.app_name.is_empty() {
            return Err(ConfigError::AppNameMissing);
        }
        Ok(())
    }

    pub(crate) fn attribute_config_input(&self) -> AttributeConfigInput {
        AttributeConfigInput {
            attributes: self.attributes.to_input(),
            txn_events: self.transaction_events.attributes.to_input(),
            txn_traces: self.transaction_tracer.attributes.to_input(),
            error_traces: self.error_collector.attributes.to_input(),
            browser: self.browser_monitoring.attributes.to_input(),
        }
    }

    pub(crate) fn preconnect_host(&self) -> String {
        HOST_OVERRIDE
            .clone()
            .unwrap_or_else(|| crate::limits::COLLECTOR_HOST_DEFAULT.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LICENSE: &str = "0123456789012345678901234567890123456789";

    #[test]
    fn valid_config_passes() {
        let c = Config::new("my app", LICENSE);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn bad_license_rejected() {
        let c = Config::new("my app", "short");
        assert!(matches!(
            c.validate(),
            Err(ConfigError::LicenseLength { actual: 5, .. })
        ));
    }

    #[test]
    fn empty_app_name_rejected() {
        let c = Config::new("", LICENSE);
        assert!(matches!(c.validate(), Err(ConfigError::AppNameMissing)));
    }

    #[test]
    fn development_mode_relaxes_validation() {
        let mut c = Config::new("", "");
        c.development = true;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn high_security_needs_tls() {
        let mut c = Config::new("my app", LICENSE);
        c.high_security = true;
        c.use_tls = false;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::HighSecurityRequiresTls)
        ));
    }

    #[test]
    fn settings_dump_omits_license() {
        let c = Config::new("my app", LICENSE);
        let v = serde_json::to_value(&c).unwrap();
        assert!(v.get("license").is_none());
        assert_eq!(v["app_name"], "my app");
    }
}
