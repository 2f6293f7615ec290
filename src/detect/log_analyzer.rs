//! # Stage: Log Analyzer
//!
//! ## Responsibility
//! Ingests raw log lines from the monitored app, buffers them in a bounded
//! ring, and classifies them against the pattern registry. `error`/`fatal`
//! lines are classified synchronously and forwarded immediately; all other
//! levels are classified lazily in batch by [`LogAnalyzer::analyze_buffered`],
//! which the orchestrator drives on a timer. Also exposes `search` for
//! diagnostics and a pure `export_snapshot` / `import_snapshot` pair.
//!
//! ## Guarantees
//! - Bounded: buffer capacity is fixed; overflow truncates to the newest
//!   `truncate_target` entries, preserving original line order
//! - Append-only: classification history is never edited
//! - Pure export: `export_snapshot` has no side effects

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::detect::patterns::PatternRegistry;
use crate::error::{MedicError, Result};
use crate::event::{now_ms, ErrorEvent};

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "err" => LogLevel::Error,
            "fatal" | "critical" => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }

    /// Levels at or above this are classified synchronously on ingest.
    pub fn is_immediate(self) -> bool {
        self >= LogLevel::Error
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info  => write!(f, "info"),
            LogLevel::Warn  => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Fatal => write!(f, "fatal"),
        }
    }
}

// ---------------------------------------------------------------------------
// LogEntry + snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub line: String,
    pub level: LogLevel,
    pub timestamp_ms: u64,
    /// Whether this entry has already been through classification.
    #[serde(default)]
    pub classified: bool,
}

/// Serialized form of the analyzer's state, for export/import round trips.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<LogEntry>,
    history: Vec<ErrorEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    Text,
}

/// Filter for [`LogAnalyzer::search`]. `None` fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFilter {
    pub level: Option<LogLevel>,
    pub from_ms: Option<u64>,
    pub to_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// LogAnalyzer
// ---------------------------------------------------------------------------

pub struct LogAnalyzer {
    registry: PatternRegistry,
    buffer: VecDeque<LogEntry>,
    max_buffered: usize,
    truncate_target: usize,
    /// Append-only record of every classification produced.
    history: Vec<ErrorEvent>,
    /// When set, classified events are forwarded here for remediation.
    sink: Option<mpsc::UnboundedSender<ErrorEvent>>,
}

impl LogAnalyzer {
    pub fn new(registry: PatternRegistry, max_buffered: usize, truncate_target: usize) -> Self {
        Self {
            registry,
            buffer: VecDeque::with_capacity(truncate_target.min(max_buffered)),
            max_buffered: max_buffered.max(1),
            truncate_target: truncate_target.max(1).min(max_buffered.max(1)),
            history: Vec::new(),
            sink: None,
        }
    }

    /// Route classified events to the given channel.
    pub fn set_sink(&mut self, tx: mpsc::UnboundedSender<ErrorEvent>) {
        self.sink = Some(tx);
    }

    /// Append a line to the buffer. `error`/`fatal` lines are classified
    /// immediately; the produced event (if any) is returned and forwarded.
    pub fn ingest(&mut self, line: impl Into<String>, level: LogLevel) -> Option<ErrorEvent> {
        let mut entry = LogEntry {
            line: line.into(),
            level,
            timestamp_ms: now_ms(),
            classified: false,
        };

        let mut produced = None;
        if level.is_immediate() {
            entry.classified = true;
            produced = self.classify_and_record(&entry.line);
        }

        self.buffer.push_back(entry);
        if self.buffer.len() > self.max_buffered {
            // FIFO eviction down to the newest `truncate_target` entries.
            let excess = self.buffer.len() - self.truncate_target;
            self.buffer.drain(..excess);
        }

        produced
    }

    /// Classify every buffered entry that has not been looked at yet.
    /// Returns the new events in original line order.
    pub fn analyze_buffered(&mut self) -> Vec<ErrorEvent> {
        let mut produced = Vec::new();
        let lines: Vec<String> = self
            .buffer
            .iter_mut()
            .filter(|e| !e.classified)
            .map(|e| {
                e.classified = true;
                e.line.clone()
            })
            .collect();
        for line in lines {
            if let Some(ev) = self.classify_and_record(&line) {
                produced.push(ev);
            }
        }
        produced
    }

    /// Order-preserving search over the current buffer.
    pub fn search(&self, query: &str, filter: SearchFilter) -> Vec<&LogEntry> {
        self.buffer
            .iter()
            .filter(|e| e.line.contains(query))
            .filter(|e| filter.level.map_or(true, |l| e.level == l))
            .filter(|e| filter.from_ms.map_or(true, |t| e.timestamp_ms >= t))
            .filter(|e| filter.to_ms.map_or(true, |t| e.timestamp_ms <= t))
            .collect()
    }

    /// Pure serialization of the current buffer plus classification history.
    pub fn export_snapshot(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => {
                let snap = Snapshot {
                    entries: self.buffer.iter().cloned().collect(),
                    history: self.history.clone(),
                };
                Ok(serde_json::to_string_pretty(&snap)?)
            }
            ExportFormat::Csv => {
                let mut out = String::from("timestamp_ms,level,line\n");
                for e in &self.buffer {
                    out.push_str(&format!(
                        "{},{},\"{}\"\n",
                        e.timestamp_ms,
                        e.level,
                        e.line.replace('"', "\"\"")
                    ));
                }
                Ok(out)
            }
            ExportFormat::Text => {
                let mut out = String::new();
                for e in &self.buffer {
                    out.push_str(&format!("{} [{}] {}\n", e.timestamp_ms, e.level, e.line));
                }
                Ok(out)
            }
        }
    }

    /// Replace buffer and history from a JSON snapshot produced by
    /// [`LogAnalyzer::export_snapshot`].
    pub fn import_snapshot(&mut self, json: &str) -> Result<()> {
        let snap: Snapshot =
            serde_json::from_str(json).map_err(|e| MedicError::Detection(e.to_string()))?;
        self.buffer = snap.entries.into();
        self.history = snap.history;
        Ok(())
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// The append-only classification history, oldest first.
    pub fn history(&self) -> &[ErrorEvent] {
        &self.history
    }

    // --- private ---

    fn classify_and_record(&mut self, line: &str) -> Option<ErrorEvent> {
        let ev = self.registry.classify(line)?;
        self.history.push(ev.clone());
        if let Some(ref tx) = self.sink {
            // A closed sink means the orchestrator is shutting down; the
            // history entry is still recorded.
            let _ = tx.send(ev.clone());
        }
        Some(ev)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
