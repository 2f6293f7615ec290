//! # Data Contracts: Error Events
//!
//! ## Responsibility
//! The shared vocabulary between detection and remediation: a classified,
//! timestamped observation that something is wrong ([`ErrorEvent`]), its
//! severity, and where it came from. Events are created by the log analyzer
//! or the health prober, consumed exactly once by the remediation engine,
//! and never mutated after creation.
//!
//! ## Guarantees
//! - Serializable: every type round-trips through serde (reports, exports)
//! - Ordered severity: `Low < Medium < High < Critical`
//!
//! ## NOT Responsible For
//! - Classification (pattern registry, `detect::patterns`)
//! - Suppression of repeats (`detect::dedup`)

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity of a detected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Cosmetic or informational — never auto-fixed.
    Low,
    /// Degraded behaviour worth recording.
    Medium,
    /// Functional failure, remediation recommended.
    High,
    /// The monitored application is unusable.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low      => write!(f, "low"),
            Severity::Medium   => write!(f, "medium"),
            Severity::High     => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventSource
// ---------------------------------------------------------------------------

/// Which detector produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// Active health probing (liveness, latency, resources, UI).
    Probe,
    /// Passive log-line classification.
    Log,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Probe => write!(f, "probe"),
            EventSource::Log   => write!(f, "log"),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorEvent
// ---------------------------------------------------------------------------

/// A classified, timestamped observation that something is wrong.
///
/// Created by the log analyzer or health prober; never mutated afterwards.
/// An event with `auto_fix_eligible == false` must never reach the
/// remediation engine's execution path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Stable error type identifier, e.g. `database_connection_failure`.
    /// Deduplication keys on this field.
    pub type_name: String,
    /// The raw message or probe description that triggered classification.
    pub message: String,
    pub severity: Severity,
    /// Coarse grouping: `database`, `storage`, `ui`, `memory`, `process`, ...
    pub category: String,
    /// Observable symptoms attached by the detector, for reports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symptoms: Vec<String>,
    pub auto_fix_eligible: bool,
    /// Name of the fix strategy to run, looked up in the strategy book.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_ref: Option<String>,
    /// Milliseconds since the Unix epoch at creation time.
    pub timestamp_ms: u64,
    pub source: EventSource,
    /// Optional metric readings captured alongside the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HashMap<String, f64>>,
}

impl ErrorEvent {
    /// Create a new event stamped with the current wall-clock time.
    pub fn new(
        type_name: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        category: impl Into<String>,
        source: EventSource,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            severity,
            category: category.into(),
            symptoms: Vec::new(),
            auto_fix_eligible: false,
            strategy_ref: None,
            timestamp_ms: now_ms(),
            source,
            metrics: None,
        }
    }

    /// Mark the event fixable by the named strategy.
    pub fn with_strategy(mut self, strategy_ref: impl Into<String>) -> Self {
        self.strategy_ref = Some(strategy_ref.into());
        self.auto_fix_eligible = true;
        self
    }

    /// Attach an observed symptom.
    pub fn with_symptom(mut self, symptom: impl Into<String>) -> Self {
        self.symptoms.push(symptom.into());
        self
    }

    /// Attach a metric reading.
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value);
        self
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Severity =====

    #[test]
    fn test_severity_display() {
        assert_eq!(Severity::Low.to_string(), "low");
        assert_eq!(Severity::Medium.to_string(), "medium");
        assert_eq!(Severity::High.to_string(), "high");
        assert_eq!(Severity::Critical.to_string(), "critical");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_severity_serde_lowercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: Severity = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(back, Severity::High);
    }

    // ===== EventSource =====

    #[test]
    fn test_event_source_display() {
        assert_eq!(EventSource::Probe.to_string(), "probe");
        assert_eq!(EventSource::Log.to_string(), "log");
    }

    // ===== ErrorEvent =====

    #[test]
    fn test_new_event_not_eligible_by_default() {
        let ev = ErrorEvent::new("x", "boom", Severity::High, "ui", EventSource::Log);
        assert!(!ev.auto_fix_eligible);
        assert!(ev.strategy_ref.is_none());
    }

    #[test]
    fn test_with_strategy_marks_eligible() {
        let ev = ErrorEvent::new("x", "boom", Severity::High, "ui", EventSource::Log)
            .with_strategy("reload_ui");
        assert!(ev.auto_fix_eligible);
        assert_eq!(ev.strategy_ref.as_deref(), Some("reload_ui"));
    }

    #[test]
    fn test_with_symptom_appends() {
        let ev = ErrorEvent::new("x", "boom", Severity::High, "ui", EventSource::Probe)
            .with_symptom("white screen")
            .with_symptom("no response");
        assert_eq!(ev.symptoms.len(), 2);
    }

    #[test]
    fn test_with_metric_inserts() {
        let ev = ErrorEvent::new("x", "boom", Severity::High, "memory", EventSource::Probe)
            .with_metric("memory_mb", 812.0);
        assert_eq!(ev.metrics.unwrap().get("memory_mb"), Some(&812.0));
    }

    #[test]
    fn test_timestamp_is_recent() {
        let before = now_ms();
        let ev = ErrorEvent::new("x", "boom", Severity::Low, "ui", EventSource::Log);
        assert!(ev.timestamp_ms >= before);
    }

    #[test]
    fn test_event_serde_round_trip() {
        let ev = ErrorEvent::new("db_down", "ECONNREFUSED", Severity::Critical, "database", EventSource::Log)
            .with_strategy("restart_db")
            .with_metric("latency_ms", 3000.0);
        let json = serde_json::to_string(&ev).unwrap();
        let back: ErrorEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.type_name, "db_down");
        assert_eq!(back.severity, Severity::Critical);
        assert!(back.auto_fix_eligible);
    }
}
