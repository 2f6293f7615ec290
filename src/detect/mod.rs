//! Detection side of the watchdog: pattern classification, repeat
//! suppression, log-stream analysis, and active health probing.

pub mod dedup;
pub mod health;
pub mod log_analyzer;
pub mod patterns;

pub use dedup::Deduplicator;
pub use health::{AppProbe, HealthProber, MetricSeries, ResourceSample};
pub use log_analyzer::{ExportFormat, LogAnalyzer, LogEntry, LogLevel, SearchFilter};
pub use patterns::{PatternRegistry, PatternRule};
