//! Watchdog configuration.
//!
//! Consumed, not owned: every component takes the slice of config it needs
//! at construction. Loadable from a TOML file; every field has a default so
//! a partial file (or none at all) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MedicError, Result};

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Health-probe thresholds. Breaching one produces an [`crate::event::ErrorEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Maximum acceptable health-ping round trip, in milliseconds.
    pub response_time_ms: u64,
    /// Resident memory ceiling for the monitored process, in megabytes.
    pub memory_usage_mb: f64,
    /// CPU usage ceiling, percent of one core.
    pub cpu_usage_percent: f64,
    /// Maximum acceptable UI render time, in milliseconds.
    pub ui_render_time_ms: u64,
    /// Fraction of pixels allowed to differ between consecutive captures.
    pub screenshot_diff_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            response_time_ms: 2_000,
            memory_usage_mb: 512.0,
            cpu_usage_percent: 80.0,
            ui_render_time_ms: 1_000,
            screenshot_diff_threshold: 0.10,
        }
    }
}

// ---------------------------------------------------------------------------
// MedicConfig
// ---------------------------------------------------------------------------

/// Top-level configuration for the whole subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicConfig {
    /// Command line used to start the monitored application.
    pub app_command: Vec<String>,
    /// Base URL of the monitored application's local HTTP surface.
    pub app_url: String,
    /// Interval between periodic statistics/report generation, in seconds.
    pub monitor_interval_secs: u64,
    /// Interval between health prober ticks, in seconds.
    pub health_check_interval_secs: u64,
    /// Interval between batch classifications of buffered log lines, in seconds.
    pub log_analysis_interval_secs: u64,
    pub thresholds: Thresholds,
    /// Repeat events of the same type within this window are suppressed.
    pub dedup_window_secs: u64,
    /// Capacity of the dedup ring; oldest entries evicted beyond this.
    pub dedup_ring_cap: usize,
    /// How long `start` waits for the app's startup signal before failing.
    pub startup_timeout_secs: u64,
    /// Grace period between the stop signal and force-kill.
    pub shutdown_timeout_secs: u64,
    /// Log buffer capacity; on overflow the buffer is truncated to
    /// `log_truncate_target` newest entries.
    pub max_buffered_logs: usize,
    pub log_truncate_target: usize,
    /// Base delay for the engine's linear backoff (`base * attempt`), ms.
    pub fix_base_delay_ms: u64,
    /// Directory where session and incident reports are written.
    pub report_dir: PathBuf,
    /// The app's SQLite file, target of backup/restore.
    pub db_path: PathBuf,
    /// Directories swept by the temp-cleanup fix step.
    pub temp_dirs: Vec<PathBuf>,
}

impl Default for MedicConfig {
    fn default() -> Self {
        Self {
            app_command: vec!["notes-app".to_string()],
            app_url: "http://127.0.0.1:1420".to_string(),
            monitor_interval_secs: 60,
            health_check_interval_secs: 10,
            log_analysis_interval_secs: 15,
            thresholds: Thresholds::default(),
            dedup_window_secs: 60,
            dedup_ring_cap: 10,
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 10,
            max_buffered_logs: 1_000,
            log_truncate_target: 500,
            fix_base_delay_ms: 1_000,
            report_dir: PathBuf::from("reports"),
            db_path: PathBuf::from("notes.db"),
            temp_dirs: vec![std::env::temp_dir().join("notemedic")],
        }
    }
}

impl MedicConfig {
    /// Load configuration from a TOML file. Missing fields fall back to
    /// defaults; a missing file is an error (use `Default` for that case).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| MedicError::Config(e.to_string()))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn fix_base_delay(&self) -> Duration {
        Duration::from_millis(self.fix_base_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn log_analysis_interval(&self) -> Duration {
        Duration::from_secs(self.log_analysis_interval_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
