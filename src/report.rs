//! # Stage: Reporting
//!
//! ## Responsibility
//! Session and incident report generation. The session model lives here;
//! the runner fills it in and hands it to a [`ReportSink`] at the end of a
//! run. Sinks are fire-and-forget from the runner's point of view: a
//! reporting failure is logged, never escalated.
//!
//! ## NOT Responsible For
//! - Deciding what goes into a session (`runner`)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{MedicError, Result};
use crate::event::{now_ms, ErrorEvent};
use crate::remedy::FixResult;

// ---------------------------------------------------------------------------
// Session model
// ---------------------------------------------------------------------------

/// One executed test step within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub name: String,
    pub passed: bool,
    pub duration_ms: u64,
    pub detail: Option<String>,
}

/// Everything that happened in one suite run: test outcomes, the errors
/// observed, and the fixes attempted for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSession {
    pub id: Uuid,
    pub suite_name: String,
    pub started_ms: u64,
    pub ended_ms: u64,
    pub tests: Vec<TestRecord>,
    pub errors: Vec<ErrorEvent>,
    pub fixes: Vec<FixResult>,
}

impl TestSession {
    pub fn begin(suite_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            suite_name: suite_name.into(),
            started_ms: now_ms(),
            ended_ms: 0,
            tests: Vec::new(),
            errors: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.ended_ms = now_ms();
    }

    pub fn record(&mut self, name: impl Into<String>, passed: bool, duration_ms: u64, detail: Option<String>) {
        self.tests.push(TestRecord { name: name.into(), passed, duration_ms, detail });
    }

    pub fn passed_count(&self) -> usize {
        self.tests.iter().filter(|t| t.passed).count()
    }

    pub fn failed_count(&self) -> usize {
        self.tests.len() - self.passed_count()
    }

    /// A session passes when every test record ends passed and no attempted
    /// fix failed. The runner re-records a repaired step after its retry, so
    /// a surviving failed record means the step was never actually repaired,
    /// even if a fix for it verified.
    pub fn all_resolved(&self) -> bool {
        self.failed_count() == 0 && self.fixes.iter().all(|f| f.success)
    }
}

// ---------------------------------------------------------------------------
// ReportSink
// ---------------------------------------------------------------------------

/// Where finished sessions and individual incidents go.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Persist a finished session; returns the paths written.
    async fn session(&self, session: &TestSession) -> Result<Vec<PathBuf>>;

    /// Persist one error-and-fix pair as it happens.
    async fn incident(&self, event: &ErrorEvent, fix: &FixResult) -> Result<PathBuf>;
}

// ---------------------------------------------------------------------------
// JsonReporter
// ---------------------------------------------------------------------------

/// Writes a JSON report plus a short Markdown summary per session, and one
/// JSON file per incident, under a configured directory.
pub struct JsonReporter {
    dir: PathBuf,
}

impl JsonReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| MedicError::Report(format!("create {}: {e}", self.dir.display())))
    }

    fn summary_md(session: &TestSession) -> String {
        let mut out = String::new();
        out.push_str(&format!("# Session {} — {}\n\n", session.id, session.suite_name));
        out.push_str(&format!(
            "- tests: {} passed, {} failed\n- errors observed: {}\n- fixes attempted: {} ({} succeeded)\n\n",
            session.passed_count(),
            session.failed_count(),
            session.errors.len(),
            session.fixes.len(),
            session.fixes.iter().filter(|f| f.success).count(),
        ));
        for t in &session.tests {
            let mark = if t.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!("- [{mark}] {} ({}ms)\n", t.name, t.duration_ms));
            if let Some(ref d) = t.detail {
                out.push_str(&format!("  - {d}\n"));
            }
        }
        out
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| MedicError::Report(format!("write {}: {e}", path.display())))
    }
}

#[async_trait]
impl ReportSink for JsonReporter {
    async fn session(&self, session: &TestSession) -> Result<Vec<PathBuf>> {
        self.ensure_dir().await?;
        let json_path = self.dir.join(format!("session-{}.json", session.id));
        let md_path = self.dir.join(format!("session-{}.md", session.id));
        let json = serde_json::to_vec_pretty(session)?;
        self.write(&json_path, &json).await?;
        self.write(&md_path, Self::summary_md(session).as_bytes()).await?;
        info!(report = %json_path.display(), "session report written");
        Ok(vec![json_path, md_path])
    }

    async fn incident(&self, event: &ErrorEvent, fix: &FixResult) -> Result<PathBuf> {
        self.ensure_dir().await?;
        let path = self
            .dir
            .join(format!("incident-{}-{}.json", event.type_name, fix.timestamp_ms));
        #[derive(Serialize)]
        struct Incident<'a> {
            event: &'a ErrorEvent,
            fix: &'a FixResult,
        }
        let json = serde_json::to_vec_pretty(&Incident { event, fix })?;
        self.write(&path, &json).await?;
        info!(report = %path.display(), "incident report written");
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
