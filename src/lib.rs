//! Error-detection and auto-remediation watchdog for a local note-taking
//! app.
//!
//! The crate splits into a detection side (`detect`: pattern registry, log
//! analysis, health probing, deduplication) and a remediation side
//! (`remedy`: capability handlers, fix strategies, the single-flight fix
//! engine). The `runner` orchestrates whole sessions over both and ships
//! results through `report`.

pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
pub mod event;
pub mod remedy;
pub mod report;
pub mod runner;

pub use config::MedicConfig;
pub use error::{MedicError, Result};
pub use event::{ErrorEvent, EventSource, Severity};
