//! In-process telemetry agent: record transactions, segments, errors and
//! custom events in the host application, aggregate them per harvest window
//! and ship the payloads to a remote collector once a minute.
//!
//! ```no_run
//! use rush_agent::{Application, Config};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::new("My App", std::env::var("NEW_RELIC_LICENSE_KEY")?);
//! let app = Application::new(config)?;
//!
//! let txn = app.start_transaction("index", None);
//! let segment = txn.start_segment();
//! // ... application work ...
//! txn.end_segment(segment, "render");
//! txn.end();
//! # Ok(())
//! # }
//! ```

mod app;
mod attributes;
mod collector;
mod config;
mod connect;
mod errors;
mod events;
mod harvest;
mod limits;
mod metrics;
mod queue_time;
mod rules;
mod sampler;
mod trace;
mod tracer;
mod txn;
mod utilization;

pub use app::Application;
pub use attributes::{AttributeError, AttributeValue};
pub use collector::{CollectorError, CollectorRequest, CollectorResponse, CollectorTransport};
pub use config::{
    AttributeDestination, BrowserMonitoringConfig, Config, ConfigError, CustomEventsConfig,
    ErrorCollectorConfig, TracerThreshold, TransactionEventsConfig, TransactionTracerConfig,
    UtilizationConfig,
};
pub use events::CustomEventError;
pub use metrics::ApdexZone;
pub use tracer::{DatastoreSegment, SegmentStartTime};
pub use txn::{Transaction, WebRequest};

pub use url::Url;
