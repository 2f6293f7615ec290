//! Crate-level error taxonomy.
//!
//! Propagation policy: step- and verification-level failures are recovered
//! locally by the engine's retry loop; only [`MedicError::Exhausted`]
//! surfaces upward. [`MedicError::Lifecycle`] is fatal to the current test
//! session but never to the orchestrator process itself. Detection errors
//! are converted into `health_check_failure` events at the tick boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MedicError>;

#[derive(Debug, Error)]
pub enum MedicError {
    /// A probe or classification failed. Logged and converted to a
    /// medium-severity event; never fatal to the prober loop.
    #[error("detection failed: {0}")]
    Detection(String),

    /// One remediation step failed; triggers retry/backoff.
    #[error("remediation step '{step}' failed: {reason}")]
    Step { step: String, reason: String },

    /// All remediation attempts failed; triggers rollback.
    #[error("strategy '{strategy}' exhausted after {attempts} attempts")]
    Exhausted { strategy: String, attempts: u32 },

    /// The monitored process failed to start or stop within its timeout.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("config error: {0}")]
    Config(String),

    /// Report generation failed. Callers log and swallow this; a report
    /// failure must not fail the session.
    #[error("report error: {0}")]
    Report(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
