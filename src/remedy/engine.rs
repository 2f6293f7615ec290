//! # Stage: Fix Engine
//!
//! ## Responsibility
//! Executes fix strategies against the capability handlers: bounded retries
//! with linear backoff, post-fix verification, best-effort rollback once a
//! strategy is exhausted, and an append-only history with aggregate stats.
//!
//! ## Guarantees
//! - Single flight: at most one fix runs at a time; concurrent submissions
//!   queue FIFO and are drained in order
//! - Bounded: never more than `max_attempts` attempts per submission
//! - Rollback runs only after the final attempt fails, never mid-sequence
//! - History is append-only; a failed fix is recorded like a successful one
//!
//! ## NOT Responsible For
//! - Deciding what is fixable (`detect::patterns` sets `strategy_ref`)
//! - Suppressing repeats (`detect::dedup`)

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::event::{now_ms, ErrorEvent};
use crate::remedy::capabilities::Capabilities;
use crate::remedy::strategy::{Criterion, FixStrategy, StepAction, StrategyBook};

// ---------------------------------------------------------------------------
// FixResult / FixStats
// ---------------------------------------------------------------------------

/// Outcome of one executed step within a fix attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: String,
    /// 1-based attempt this step ran in.
    pub attempt: u32,
    pub success: bool,
    pub detail: Option<String>,
}

/// One verification criterion and whether it held.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionCheck {
    pub criterion: String,
    pub passed: bool,
}

/// Post-fix verification outcome: the whole check set from one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub passed: bool,
    pub checks: Vec<CriterionCheck>,
}

/// Outcome of one submission, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResult {
    pub id: Uuid,
    pub event_type: String,
    pub strategy: String,
    pub success: bool,
    pub attempts_used: u32,
    pub rolled_back: bool,
    pub duration_ms: u64,
    pub message: String,
    /// Every step executed, across all attempts, in execution order.
    pub step_results: Vec<StepResult>,
    /// Criteria from the last attempt that reached verification; `None`
    /// when every attempt died in its step sequence.
    pub verification: Option<Verification>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyStats {
    pub attempted: usize,
    pub succeeded: usize,
}

/// Aggregates over the whole fix history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FixStats {
    pub total: usize,
    pub successful: usize,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub by_strategy: HashMap<String, StrategyStats>,
    pub by_type: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// FixEngine
// ---------------------------------------------------------------------------

type Pending = (ErrorEvent, oneshot::Sender<FixResult>);

pub struct FixEngine {
    caps: Capabilities,
    book: StrategyBook,
    /// Backoff after a failed attempt `n` is `base_delay * n`.
    base_delay: Duration,
    queue: Mutex<VecDeque<Pending>>,
    busy: AtomicBool,
    history: Mutex<Vec<FixResult>>,
}

impl FixEngine {
    pub fn new(caps: Capabilities, book: StrategyBook, base_delay: Duration) -> Self {
        Self {
            caps,
            book,
            base_delay,
            queue: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Submit an event for remediation and wait for its outcome.
    ///
    /// Returns `None` for events that are not auto-fix eligible (nothing is
    /// recorded for those). Eligible events are queued FIFO; the task that
    /// finds the engine idle drains the queue inline, so at most one fix
    /// sequence runs at any time.
    pub async fn submit(&self, event: ErrorEvent) -> Option<FixResult> {
        if !event.auto_fix_eligible || event.strategy_ref.is_none() {
            info!(event_type = %event.type_name, "event not auto-fix eligible, skipping");
            return None;
        }

        let (tx, rx) = oneshot::channel();
        self.queue.lock().await.push_back((event, tx));
        self.drain().await;
        rx.await.ok()
    }

    /// Event types currently queued, oldest first. The in-flight fix, if
    /// any, is not included.
    pub async fn queue_snapshot(&self) -> Vec<String> {
        self.queue
            .lock()
            .await
            .iter()
            .map(|(ev, _)| ev.type_name.clone())
            .collect()
    }

    pub async fn history(&self) -> Vec<FixResult> {
        self.history.lock().await.clone()
    }

    /// Drop all recorded results and any queued submissions. Waiters on
    /// dropped submissions observe a closed channel.
    pub async fn clear_history(&self) {
        self.history.lock().await.clear();
        self.queue.lock().await.clear();
    }

    pub async fn stats(&self) -> FixStats {
        let history = self.history.lock().await;
        let total = history.len();
        if total == 0 {
            return FixStats::default();
        }
        let successful = history.iter().filter(|r| r.success).count();
        let mut by_strategy: HashMap<String, StrategyStats> = HashMap::new();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        let mut duration_sum = 0u64;
        for r in history.iter() {
            let s = by_strategy.entry(r.strategy.clone()).or_default();
            s.attempted += 1;
            if r.success {
                s.succeeded += 1;
            }
            *by_type.entry(r.event_type.clone()).or_default() += 1;
            duration_sum += r.duration_ms;
        }
        FixStats {
            total,
            successful,
            success_rate: successful as f64 / total as f64,
            avg_duration_ms: duration_sum as f64 / total as f64,
            by_strategy,
            by_type,
        }
    }

    // -----------------------------------------------------------------------
    // Drain loop
    // -----------------------------------------------------------------------

    async fn drain(&self) {
        loop {
            if self
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another task is draining; it will pick up our entry.
                return;
            }
            while let Some((event, tx)) = self.pop().await {
                let result = self.run_fix(&event).await;
                self.history.lock().await.push(result.clone());
                let _ = tx.send(result);
            }
            self.busy.store(false, Ordering::Release);
            // An entry may have been pushed between pop() and the release.
            if self.queue.lock().await.is_empty() {
                return;
            }
        }
    }

    async fn pop(&self) -> Option<Pending> {
        self.queue.lock().await.pop_front()
    }

    // -----------------------------------------------------------------------
    // One fix sequence
    // -----------------------------------------------------------------------

    async fn run_fix(&self, event: &ErrorEvent) -> FixResult {
        let id = Uuid::new_v4();
        let started = std::time::Instant::now();
        // Checked in submit(); a missing ref past that point is a book gap.
        let strategy_name = event.strategy_ref.clone().unwrap_or_default();

        let Some(strategy) = self.book.get(&strategy_name).cloned() else {
            warn!(strategy = %strategy_name, "no such strategy in the book");
            return FixResult {
                id,
                event_type: event.type_name.clone(),
                strategy: strategy_name,
                success: false,
                attempts_used: 0,
                rolled_back: false,
                duration_ms: started.elapsed().as_millis() as u64,
                message: "strategy not found".into(),
                step_results: Vec::new(),
                verification: None,
                timestamp_ms: now_ms(),
            };
        };

        info!(
            strategy = %strategy.name,
            event_type = %event.type_name,
            max_attempts = strategy.max_attempts,
            "fix sequence starting"
        );

        let mut step_results = Vec::new();
        let mut last_verification: Option<Verification> = None;
        let mut last_failure = String::new();
        for attempt in 1..=strategy.max_attempts {
            match self.run_steps(&strategy, attempt, &mut step_results).await {
                Ok(()) => {
                    let verification = self.verify(&strategy.success_criteria).await;
                    if verification.passed {
                        info!(strategy = %strategy.name, attempt, "fix verified");
                        return FixResult {
                            id,
                            event_type: event.type_name.clone(),
                            strategy: strategy.name.clone(),
                            success: true,
                            attempts_used: attempt,
                            rolled_back: false,
                            duration_ms: started.elapsed().as_millis() as u64,
                            message: format!("fixed on attempt {attempt}"),
                            step_results,
                            verification: Some(verification),
                            timestamp_ms: now_ms(),
                        };
                    }
                    last_failure = verification
                        .checks
                        .iter()
                        .find(|c| !c.passed)
                        .map(|c| format!("verification failed: {}", c.criterion))
                        .unwrap_or_else(|| "verification failed".into());
                    last_verification = Some(verification);
                }
                Err(reason) => {
                    last_failure = reason;
                }
            }
            warn!(strategy = %strategy.name, attempt, reason = %last_failure, "attempt failed");
            if attempt < strategy.max_attempts {
                tokio::time::sleep(self.base_delay * attempt).await;
            }
        }

        // Exhausted: best-effort rollback. A rollback failure is logged but
        // never escalates past the failed fix itself.
        let mut rolled_back = false;
        for step in &strategy.rollback {
            match self.run_step(step).await {
                Ok(()) => rolled_back = true,
                Err(reason) => {
                    warn!(strategy = %strategy.name, step = step.name(), %reason, "rollback step failed");
                }
            }
        }

        let exhausted = crate::error::MedicError::Exhausted {
            strategy: strategy.name.clone(),
            attempts: strategy.max_attempts,
        };
        FixResult {
            id,
            event_type: event.type_name.clone(),
            strategy: strategy.name.clone(),
            success: false,
            attempts_used: strategy.max_attempts,
            rolled_back,
            duration_ms: started.elapsed().as_millis() as u64,
            message: format!("{exhausted}: {last_failure}"),
            step_results,
            verification: last_verification,
            timestamp_ms: now_ms(),
        }
    }

    /// The step half of one attempt: every step in order, each recorded
    /// into `log`. A failing step aborts the attempt without undoing
    /// earlier steps.
    async fn run_steps(
        &self,
        strategy: &FixStrategy,
        attempt: u32,
        log: &mut Vec<StepResult>,
    ) -> std::result::Result<(), String> {
        for step in &strategy.steps {
            match self.run_step(step).await {
                Ok(()) => log.push(StepResult {
                    step: step.name().into(),
                    attempt,
                    success: true,
                    detail: None,
                }),
                Err(reason) => {
                    log.push(StepResult {
                        step: step.name().into(),
                        attempt,
                        success: false,
                        detail: Some(reason.clone()),
                    });
                    return Err(format!("step {} failed: {reason}", step.name()));
                }
            }
        }
        Ok(())
    }

    /// Evaluate every criterion, even after one fails; the full check set
    /// goes into the fix record.
    async fn verify(&self, criteria: &[Criterion]) -> Verification {
        let mut checks = Vec::with_capacity(criteria.len());
        for criterion in criteria {
            checks.push(CriterionCheck {
                criterion: criterion.to_string(),
                passed: self.check(criterion).await,
            });
        }
        Verification { passed: checks.iter().all(|c| c.passed), checks }
    }

    async fn run_step(&self, step: &StepAction) -> std::result::Result<(), String> {
        let outcome = match step {
            StepAction::KillProcess => self.caps.process.stop().await,
            StepAction::StartApp => self.caps.process.start().await,
            StepAction::BackupStorage => self.caps.storage.backup().await.map(|_| ()),
            StepAction::RestoreStorage => self.caps.storage.restore().await,
            StepAction::ReloadUi => self.caps.ui.reload().await,
            StepAction::ReclaimMemory => self.caps.memory.reclaim().await,
            StepAction::CleanupTempFiles => self.caps.cleanup_temp_files().await.map(|_| ()),
            StepAction::WaitForElement { selector, timeout_ms } => {
                let found = self
                    .caps
                    .ui
                    .wait_for_element(selector, Duration::from_millis(*timeout_ms))
                    .await;
                if found {
                    Ok(())
                } else {
                    return Err(format!("element '{selector}' did not appear"));
                }
            }
        };
        outcome.map_err(|e| e.to_string())
    }

    async fn check(&self, criterion: &Criterion) -> bool {
        match criterion {
            Criterion::AppRunning => self.caps.process.is_running().await,
            Criterion::UiResponsive => self.caps.ui.is_responsive().await,
            Criterion::DbAccessible => self.caps.storage.is_accessible().await,
            Criterion::MemoryReduced => self.caps.memory.is_reduced().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
