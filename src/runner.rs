//! # Stage: Orchestrator
//!
//! ## Responsibility
//! Drives whole sessions: starts the monitored app, runs a test suite (or
//! the long-running monitor loop), routes every observed error through
//! deduplication into the fix engine, retries repaired steps, and ships the
//! finished session to the report sink.
//!
//! ## Guarantees
//! - Startup failure ends the session immediately; no tests run against a
//!   process that never came up
//! - Deduplication happens before submission: a repeat inside the window
//!   never reaches the engine
//! - The app is stopped on the way out, pass or fail
//! - Reporting is fire-and-forget: a sink failure never fails the session
//!
//! ## NOT Responsible For
//! - Fix execution (`remedy::engine`)
//! - Classification rules (`detect::patterns`)

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::MedicConfig;
use crate::detect::health::AppProbe;
use crate::detect::log_analyzer::{LogAnalyzer, LogLevel};
use crate::detect::{Deduplicator, HealthProber, PatternRegistry};
use crate::error::{MedicError, Result};
use crate::event::{now_ms, ErrorEvent, EventSource, Severity};
use crate::remedy::{Capabilities, FixEngine, FixResult};
use crate::report::{ReportSink, TestSession};

// ---------------------------------------------------------------------------
// Suites
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suite {
    Smoke,
    Regression,
    Stress,
    Security,
    All,
}

impl Suite {
    pub fn name(self) -> &'static str {
        match self {
            Suite::Smoke      => "smoke",
            Suite::Regression => "regression",
            Suite::Stress     => "stress",
            Suite::Security   => "security",
            Suite::All        => "all",
        }
    }

    /// Test steps in execution order. `startup` is implicit and not listed.
    pub fn plan(self) -> &'static [&'static str] {
        match self {
            Suite::Smoke => &["basic_ui", "create_note"],
            Suite::Regression => &["basic_ui", "create_note", "search_notes", "storage_roundtrip"],
            Suite::Stress => &["stress_load"],
            Suite::Security => &["security_scan"],
            Suite::All => &[
                "basic_ui",
                "create_note",
                "search_notes",
                "storage_roundtrip",
                "stress_load",
                "security_scan",
            ],
        }
    }
}

impl FromStr for Suite {
    type Err = MedicError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "smoke"      => Ok(Suite::Smoke),
            "regression" => Ok(Suite::Regression),
            "stress"     => Ok(Suite::Stress),
            "security"   => Ok(Suite::Security),
            "all"        => Ok(Suite::All),
            other        => Err(MedicError::Config(format!("unknown suite '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// AppDriver — functional surface of the monitored app
// ---------------------------------------------------------------------------

/// What the test steps can do to the app, beyond probing it. The real
/// implementation speaks to the app's local REST surface.
#[async_trait]
pub trait AppDriver: Send + Sync {
    /// Create a note; returns its id.
    async fn create_note(&self, title: &str, body: &str) -> Result<String>;

    /// Full-text search; returns the number of hits.
    async fn search_notes(&self, query: &str) -> Result<usize>;

    async fn delete_note(&self, id: &str) -> Result<()>;
}

/// REST driver against the app's local HTTP surface.
pub struct HttpDriver {
    app_url: String,
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new(app_url: impl Into<String>) -> Self {
        Self { app_url: app_url.into(), client: reqwest::Client::new() }
    }

    fn step_err(step: &str, e: impl std::fmt::Display) -> MedicError {
        MedicError::Step { step: step.into(), reason: e.to_string() }
    }
}

#[async_trait]
impl AppDriver for HttpDriver {
    async fn create_note(&self, title: &str, body: &str) -> Result<String> {
        let url = format!("{}/api/notes", self.app_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "title": title, "body": body }))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Self::step_err("create_note", e))?
            .error_for_status()
            .map_err(|e| Self::step_err("create_note", e))?;
        let v: serde_json::Value =
            resp.json().await.map_err(|e| Self::step_err("create_note", e))?;
        v.get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| Self::step_err("create_note", "response missing id"))
    }

    async fn search_notes(&self, query: &str) -> Result<usize> {
        let url = format!("{}/api/notes/search", self.app_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("q", query)])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Self::step_err("search_notes", e))?
            .error_for_status()
            .map_err(|e| Self::step_err("search_notes", e))?;
        let v: serde_json::Value =
            resp.json().await.map_err(|e| Self::step_err("search_notes", e))?;
        Ok(v.as_array().map(Vec::len).unwrap_or(0))
    }

    async fn delete_note(&self, id: &str) -> Result<()> {
        let url = format!("{}/api/notes/{id}", self.app_url);
        self.client
            .delete(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Self::step_err("delete_note", e))?
            .error_for_status()
            .map_err(|e| Self::step_err("delete_note", e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    cfg: MedicConfig,
    caps: Capabilities,
    probe: Arc<dyn AppProbe>,
    driver: Arc<dyn AppDriver>,
    engine: Arc<FixEngine>,
    registry: PatternRegistry,
    dedup: Mutex<Deduplicator>,
    sink: Arc<dyn ReportSink>,
    /// Concrete process manager, when one exists; needed for log routing.
    managed: Option<Arc<crate::remedy::ManagedProcess>>,
}

impl Orchestrator {
    pub fn new(
        cfg: MedicConfig,
        caps: Capabilities,
        probe: Arc<dyn AppProbe>,
        driver: Arc<dyn AppDriver>,
        engine: Arc<FixEngine>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let dedup = Deduplicator::new(cfg.dedup_window(), cfg.dedup_ring_cap);
        Self {
            cfg,
            caps,
            probe,
            driver,
            engine,
            registry: PatternRegistry::builtin(),
            dedup: Mutex::new(dedup),
            sink,
            managed: None,
        }
    }

    /// Attach the concrete process manager so monitor mode can tail the
    /// app's stdout/stderr.
    pub fn with_managed(mut self, managed: Arc<crate::remedy::ManagedProcess>) -> Self {
        self.managed = Some(managed);
        self
    }

    // -----------------------------------------------------------------------
    // Suite mode
    // -----------------------------------------------------------------------

    /// Run one suite end to end and return the finished session. The app is
    /// always stopped before this returns.
    pub async fn run_suite(&self, suite: Suite) -> Result<TestSession> {
        let mut session = TestSession::begin(suite.name());
        info!(suite = suite.name(), session = %session.id, "session starting");

        let started = std::time::Instant::now();
        match self.caps.process.start().await {
            Ok(()) => {
                session.record("startup", true, started.elapsed().as_millis() as u64, None);
            }
            Err(e) => {
                // Nothing below can run against an app that never came up.
                error!(error = %e, "startup failed, aborting session");
                session.record(
                    "startup",
                    false,
                    started.elapsed().as_millis() as u64,
                    Some(e.to_string()),
                );
                session.errors.push(
                    ErrorEvent::new(
                        "startup_failure",
                        e.to_string(),
                        Severity::Critical,
                        "process",
                        EventSource::Probe,
                    ),
                );
                self.finish(&mut session).await;
                return Ok(session);
            }
        }

        for name in suite.plan() {
            self.run_step(name, &mut session).await;
        }

        if let Err(e) = self.caps.process.stop().await {
            warn!(error = %e, "app did not stop cleanly");
        }
        self.finish(&mut session).await;
        Ok(session)
    }

    async fn finish(&self, session: &mut TestSession) {
        session.finish();
        info!(
            session = %session.id,
            passed = session.passed_count(),
            failed = session.failed_count(),
            fixes = session.fixes.len(),
            "session finished"
        );
        if let Err(e) = self.sink.session(session).await {
            warn!(error = %e, "session report failed");
        }
    }

    /// Execute one step; on failure, classify the error, route it through
    /// the engine, and retry the step once if the fix succeeded.
    async fn run_step(&self, name: &str, session: &mut TestSession) {
        let started = std::time::Instant::now();
        match self.execute(name).await {
            Ok(()) => {
                session.record(name, true, started.elapsed().as_millis() as u64, None);
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(step = name, %reason, "step failed");
                let event = self.classify_failure(name, &reason);
                session.errors.push(event.clone());

                let fix = self.handle_event(event).await;
                let repaired = fix.as_ref().map(|f| f.success).unwrap_or(false);
                if let Some(f) = fix {
                    session.fixes.push(f);
                }

                if repaired {
                    // The fix verified; give the step one more try.
                    let retry_started = std::time::Instant::now();
                    match self.execute(name).await {
                        Ok(()) => session.record(
                            name,
                            true,
                            retry_started.elapsed().as_millis() as u64,
                            Some(format!("passed after fix ({reason})")),
                        ),
                        Err(e2) => session.record(
                            name,
                            false,
                            retry_started.elapsed().as_millis() as u64,
                            Some(format!("still failing after fix: {e2}")),
                        ),
                    }
                } else {
                    session.record(
                        name,
                        false,
                        started.elapsed().as_millis() as u64,
                        Some(reason),
                    );
                }
            }
        }
    }

    fn classify_failure(&self, step: &str, reason: &str) -> ErrorEvent {
        self.registry.classify(reason).unwrap_or_else(|| {
            ErrorEvent::new(
                format!("{step}_failure"),
                reason,
                Severity::Medium,
                "test",
                EventSource::Probe,
            )
        })
    }

    /// Dedup, submit, and report one error event. Returns the fix outcome,
    /// or `None` when the event was suppressed or not eligible.
    pub async fn handle_event(&self, event: ErrorEvent) -> Option<FixResult> {
        {
            let mut dedup = self.dedup.lock().await;
            if !dedup.check_and_accept(&event.type_name, now_ms()) {
                info!(event_type = %event.type_name, "suppressed as duplicate");
                return None;
            }
        }
        let fix = self.engine.submit(event.clone()).await?;
        if let Err(e) = self.sink.incident(&event, &fix).await {
            warn!(error = %e, "incident report failed");
        }
        Some(fix)
    }

    // -----------------------------------------------------------------------
    // Test steps
    // -----------------------------------------------------------------------

    async fn execute(&self, name: &str) -> Result<()> {
        match name {
            "basic_ui" => self.step_basic_ui().await,
            "create_note" => self.step_create_note().await,
            "search_notes" => self.step_search_notes().await,
            "storage_roundtrip" => self.step_storage_roundtrip().await,
            "stress_load" => self.step_stress_load().await,
            "security_scan" => self.step_security_scan().await,
            other => Err(MedicError::Config(format!("unknown test step '{other}'"))),
        }
    }

    async fn step_basic_ui(&self) -> Result<()> {
        for selector in ["#editor", "#sidebar"] {
            if !self.probe.element_present(selector).await {
                return Err(MedicError::Step {
                    step: "basic_ui".into(),
                    reason: format!("element not found: {selector}"),
                });
            }
        }
        Ok(())
    }

    async fn step_create_note(&self) -> Result<()> {
        let id = self
            .driver
            .create_note("watchdog probe", "created by the smoke suite")
            .await?;
        self.driver.delete_note(&id).await
    }

    async fn step_search_notes(&self) -> Result<()> {
        let id = self.driver.create_note("searchable marker", "needle body").await?;
        let hits = self.driver.search_notes("searchable marker").await?;
        self.driver.delete_note(&id).await?;
        if hits == 0 {
            return Err(MedicError::Step {
                step: "search_notes".into(),
                reason: "created note not found by search".into(),
            });
        }
        Ok(())
    }

    async fn step_storage_roundtrip(&self) -> Result<()> {
        self.caps.storage.backup().await?;
        if !self.caps.storage.is_accessible().await {
            return Err(MedicError::Step {
                step: "storage_roundtrip".into(),
                reason: "storage not accessible after backup".into(),
            });
        }
        Ok(())
    }

    async fn step_stress_load(&self) -> Result<()> {
        const NOTES: usize = 25;
        let budget = Duration::from_millis(self.cfg.thresholds.response_time_ms * NOTES as u64);
        let started = std::time::Instant::now();
        // Random marker keeps runs distinguishable in the app's own data.
        let run_tag: u32 = rand::random();
        let mut ids = Vec::with_capacity(NOTES);
        for i in 0..NOTES {
            ids.push(
                self.driver
                    .create_note(&format!("load {run_tag:08x}-{i}"), "bulk body")
                    .await?,
            );
        }
        for id in &ids {
            self.driver.delete_note(id).await?;
        }
        if started.elapsed() > budget {
            return Err(MedicError::Step {
                step: "stress_load".into(),
                reason: format!("{NOTES} notes took {:?}, budget {budget:?}", started.elapsed()),
            });
        }
        Ok(())
    }

    async fn step_security_scan(&self) -> Result<()> {
        // Hostile inputs must neither error out nor take the app down.
        let probes = [
            "'; DROP TABLE notes; --",
            "<script>alert(1)</script>",
            "../../etc/passwd",
        ];
        for p in probes {
            let id = self.driver.create_note(p, p).await.map_err(|e| MedicError::Step {
                step: "security_scan".into(),
                reason: format!("app rejected abnormally on hostile input: {e}"),
            })?;
            self.driver.delete_note(&id).await?;
            self.driver.search_notes(p).await?;
        }
        if !self.caps.process.is_running().await {
            return Err(MedicError::Step {
                step: "security_scan".into(),
                reason: "app died during hostile-input scan".into(),
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Monitor mode
    // -----------------------------------------------------------------------

    /// Long-running watch loop: health ticks, log analysis, periodic stats,
    /// until Ctrl-C. The app is started on entry and stopped on exit; a
    /// final session report summarizes what happened.
    pub async fn run_monitor(&self, mut prober: HealthProber) -> Result<TestSession> {
        let mut session = TestSession::begin("monitor");
        info!(session = %session.id, "monitor starting");

        let mut analyzer = LogAnalyzer::new(
            self.registry.clone(),
            self.cfg.max_buffered_logs,
            self.cfg.log_truncate_target,
        );
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ErrorEvent>();
        analyzer.set_sink(event_tx.clone());
        prober.set_sink(event_tx);

        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
        // Routing must be in place before the spawn; with scripted
        // capabilities this channel simply stays empty.
        if let Some(ref managed) = self.managed {
            managed.route_logs(log_tx).await;
        }

        self.caps.process.start().await?;
        session.record("startup", true, 0, None);

        let mut health_tick = tokio::time::interval(self.cfg.health_check_interval());
        let mut analyze_tick = tokio::time::interval(self.cfg.log_analysis_interval());
        let mut stats_tick = tokio::time::interval(self.cfg.monitor_interval());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                _ = health_tick.tick() => {
                    prober.tick().await;
                }
                _ = analyze_tick.tick() => {
                    analyzer.analyze_buffered();
                }
                _ = stats_tick.tick() => {
                    let stats = self.engine.stats().await;
                    info!(
                        fixes = stats.total,
                        successful = stats.successful,
                        "monitor statistics"
                    );
                }
                Some(line) = log_rx.recv() => {
                    let level = guess_level(&line);
                    analyzer.ingest(line, level);
                }
                Some(event) = event_rx.recv() => {
                    session.errors.push(event.clone());
                    if let Some(fix) = self.handle_event(event).await {
                        session.fixes.push(fix);
                    }
                }
            }
        }

        if let Err(e) = self.caps.process.stop().await {
            warn!(error = %e, "app did not stop cleanly");
        }
        self.finish(&mut session).await;
        Ok(session)
    }
}

/// Best-effort level extraction from a raw app log line.
fn guess_level(line: &str) -> LogLevel {
    line.split_whitespace()
        .take(4)
        .map(|t| t.trim_matches(|c: char| "[]():".contains(c)))
        .map(LogLevel::from_str_loose)
        .find(|l| *l != LogLevel::Info)
        .unwrap_or(LogLevel::Info)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
