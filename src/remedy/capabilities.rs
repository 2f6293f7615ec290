//! # Stage: Capability Handlers
//!
//! ## Responsibility
//! The side-effecting surface the fix engine acts through: process
//! lifecycle, storage backup/restore, UI reload, memory reclamation, and
//! temp-file cleanup. Everything is behind a trait so the engine can be
//! exercised with scripted fakes.
//!
//! ## Guarantees
//! - Startup is bounded: `start` fails after the configured timeout if the
//!   app never answers its health ping
//! - Shutdown is graceful-then-forced: TERM, a grace period, then kill
//!
//! ## NOT Responsible For
//! - Deciding which capability to invoke (`remedy::strategy`)
//! - Retry/rollback policy (`remedy::engine`)

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::MedicConfig;
use crate::detect::health::{AppProbe, ResourceSample, ScreenCapture};
use crate::error::{MedicError, Result};

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Start the app and wait for it to become reachable.
    ///
    /// # Errors
    /// Lifecycle error when spawn fails or the startup timeout elapses.
    async fn start(&self) -> Result<()>;

    /// Stop the app, gracefully first, force-killing after the grace period.
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> bool;
}

#[async_trait]
pub trait StorageControl: Send + Sync {
    /// Snapshot the storage file; returns the backup path.
    async fn backup(&self) -> Result<PathBuf>;

    /// Restore the most recent backup over the live storage file.
    async fn restore(&self) -> Result<()>;

    async fn is_accessible(&self) -> bool;
}

#[async_trait]
pub trait UiControl: Send + Sync {
    async fn reload(&self) -> Result<()>;

    /// Poll for an element until it appears or the timeout elapses.
    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> bool;

    async fn is_responsive(&self) -> bool;
}

#[async_trait]
pub trait MemoryControl: Send + Sync {
    /// Ask the app to drop caches and run a collection pass.
    async fn reclaim(&self) -> Result<()>;

    /// Whether memory went down since the last `reclaim` call.
    async fn is_reduced(&self) -> bool;
}

/// Bundle handed to the fix engine. Cloning shares the underlying handlers.
#[derive(Clone)]
pub struct Capabilities {
    pub process: Arc<dyn ProcessControl>,
    pub storage: Arc<dyn StorageControl>,
    pub ui: Arc<dyn UiControl>,
    pub memory: Arc<dyn MemoryControl>,
    /// Directories swept by the temp-cleanup step.
    pub temp_dirs: Vec<PathBuf>,
}

impl Capabilities {
    /// Delete regular files under each configured temp directory. Missing
    /// directories are skipped; per-file failures are logged and skipped.
    pub async fn cleanup_temp_files(&self) -> Result<usize> {
        let mut removed = 0usize;
        for dir in &self.temp_dirs {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => removed += 1,
                        Err(e) => warn!(path = %path.display(), error = %e, "temp cleanup skip"),
                    }
                }
            }
        }
        info!(removed, "temp cleanup complete");
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// ManagedProcess — real ProcessControl + AppProbe
// ---------------------------------------------------------------------------

/// Owns the monitored application's child process and answers both the
/// control and probe surfaces for it.
pub struct ManagedProcess {
    command: Vec<String>,
    app_url: String,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
    /// `(utime+stime jiffies, wall instant)` from the last CPU sample.
    cpu_prev: Mutex<Option<(u64, std::time::Instant)>>,
    /// Where child stdout/stderr lines go, when someone asked for them.
    log_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ManagedProcess {
    pub fn new(cfg: &MedicConfig) -> Self {
        Self {
            command: cfg.app_command.clone(),
            app_url: cfg.app_url.clone(),
            startup_timeout: cfg.startup_timeout(),
            shutdown_timeout: cfg.shutdown_timeout(),
            client: reqwest::Client::new(),
            child: Mutex::new(None),
            cpu_prev: Mutex::new(None),
            log_tx: Mutex::new(None),
        }
    }

    /// Route the child's stdout and stderr lines to `tx`. Takes effect at
    /// the next `start`.
    pub async fn route_logs(&self, tx: mpsc::UnboundedSender<String>) {
        *self.log_tx.lock().await = Some(tx);
    }

    async fn ping(&self) -> Result<Duration> {
        let url = format!("{}/health", self.app_url);
        let started = std::time::Instant::now();
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| MedicError::Detection(format!("health ping failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(MedicError::Detection(format!(
                "health ping returned {}",
                resp.status()
            )));
        }
        Ok(started.elapsed())
    }

    async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl ProcessControl for ManagedProcess {
    async fn start(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait().map(|s| s.is_none()).unwrap_or(false) {
                debug!("start requested but process already running");
                return Ok(());
            }
        }
        let (prog, args) = self
            .command
            .split_first()
            .ok_or_else(|| MedicError::Lifecycle("empty app command".into()))?;
        info!(command = %self.command.join(" "), "starting app");
        let mut child = Command::new(prog)
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MedicError::Lifecycle(format!("spawn failed: {e}")))?;

        if let Some(tx) = self.log_tx.lock().await.clone() {
            if let Some(stdout) = child.stdout.take() {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                });
            }
        }
        *guard = Some(child);
        drop(guard);

        // Wait for the app to answer its health ping.
        let deadline = std::time::Instant::now() + self.startup_timeout;
        loop {
            if self.ping().await.is_ok() {
                info!("app is up");
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                return Err(MedicError::Lifecycle(format!(
                    "app did not come up within {:?}",
                    self.startup_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            return Ok(());
        };

        // Graceful first: TERM, then wait out the grace period.
        #[cfg(unix)]
        {
            let _ = Command::new("kill").arg(pid.to_string()).status().await;
        }
        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(status) => {
                info!(?status, "app exited");
                Ok(())
            }
            Err(_) => {
                warn!(pid, "graceful shutdown timed out, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| MedicError::Lifecycle(format!("kill failed: {e}")))
            }
        }
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => child.try_wait().map(|s| s.is_none()).unwrap_or(false),
            None => false,
        }
    }
}

#[async_trait]
impl AppProbe for ManagedProcess {
    async fn is_process_alive(&self) -> bool {
        self.is_running().await
    }

    async fn response_latency(&self) -> Result<Duration> {
        self.ping().await
    }

    async fn sample_resources(&self) -> Result<ResourceSample> {
        let pid = self
            .pid()
            .await
            .ok_or_else(|| MedicError::Detection("no process to sample".into()))?;

        let status = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await?;
        let memory_mb = status
            .lines()
            .find(|l| l.starts_with("VmRSS:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<f64>().ok())
            .map(|kb| kb / 1024.0)
            .ok_or_else(|| MedicError::Detection("VmRSS not found".into()))?;

        // CPU usage from the utime+stime delta since the previous sample.
        let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await?;
        let fields: Vec<&str> = stat.split_whitespace().collect();
        let jiffies: u64 = fields
            .get(13)
            .zip(fields.get(14))
            .and_then(|(u, s)| Some(u.parse::<u64>().ok()? + s.parse::<u64>().ok()?))
            .ok_or_else(|| MedicError::Detection("malformed /proc stat".into()))?;
        let now = std::time::Instant::now();
        let mut prev = self.cpu_prev.lock().await;
        let cpu_percent = match prev.replace((jiffies, now)) {
            Some((prev_jiffies, prev_at)) => {
                let wall = now.duration_since(prev_at).as_secs_f64();
                if wall > 0.0 {
                    let ticks_per_sec = 100.0;
                    (jiffies.saturating_sub(prev_jiffies) as f64 / ticks_per_sec) / wall * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };

        Ok(ResourceSample { memory_mb, cpu_percent })
    }

    async fn element_present(&self, selector: &str) -> bool {
        let url = format!("{}/health/element/{}", self.app_url, selector.trim_start_matches('#'));
        matches!(
            self.client.get(&url).timeout(Duration::from_secs(5)).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn capture_screen(&self) -> Option<ScreenCapture> {
        // No capture capability on the HTTP surface; visual diffing is only
        // available when a capture-capable probe is injected.
        None
    }
}

// ---------------------------------------------------------------------------
// FileStorage — real StorageControl
// ---------------------------------------------------------------------------

/// Storage handler over the app's SQLite file. Backups are timestamped
/// siblings under `<db_dir>/backups/`.
pub struct FileStorage {
    db_path: PathBuf,
}

impl FileStorage {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    fn backup_dir(&self) -> PathBuf {
        self.db_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("backups")
    }

    async fn latest_backup(&self) -> Result<Option<PathBuf>> {
        let dir = self.backup_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(None),
        };
        let mut latest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "bak") {
                // Timestamped names sort lexicographically.
                if latest.as_ref().map_or(true, |l| path.file_name() > l.file_name()) {
                    latest = Some(path);
                }
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl StorageControl for FileStorage {
    async fn backup(&self) -> Result<PathBuf> {
        let dir = self.backup_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = crate::event::now_ms();
        let dest = dir.join(format!("{stamp}.bak"));
        tokio::fs::copy(&self.db_path, &dest).await?;
        info!(backup = %dest.display(), "storage backed up");
        Ok(dest)
    }

    async fn restore(&self) -> Result<()> {
        let latest = self
            .latest_backup()
            .await?
            .ok_or_else(|| MedicError::Step {
                step: "restore_storage".into(),
                reason: "no backup available".into(),
            })?;
        tokio::fs::copy(&latest, &self.db_path).await?;
        info!(backup = %latest.display(), "storage restored");
        Ok(())
    }

    async fn is_accessible(&self) -> bool {
        tokio::fs::metadata(&self.db_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// HttpUi / HttpMemory — real UI and memory handlers
// ---------------------------------------------------------------------------

/// UI handler speaking to the app's local control endpoints.
pub struct HttpUi {
    app_url: String,
    client: reqwest::Client,
}

impl HttpUi {
    pub fn new(app_url: impl Into<String>) -> Self {
        Self { app_url: app_url.into(), client: reqwest::Client::new() }
    }
}

#[async_trait]
impl UiControl for HttpUi {
    async fn reload(&self) -> Result<()> {
        let url = format!("{}/control/reload", self.app_url);
        self.client
            .post(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| MedicError::Step {
                step: "reload_ui".into(),
                reason: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| MedicError::Step {
                step: "reload_ui".into(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration) -> bool {
        let url = format!(
            "{}/health/element/{}",
            self.app_url,
            selector.trim_start_matches('#')
        );
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let present = matches!(
                self.client.get(&url).timeout(Duration::from_secs(5)).send().await,
                Ok(resp) if resp.status().is_success()
            );
            if present {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn is_responsive(&self) -> bool {
        let url = format!("{}/health", self.app_url);
        matches!(
            self.client.get(&url).timeout(Duration::from_secs(5)).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

/// Memory handler: asks the app to drop caches, then verifies against the
/// RSS reading taken at reclaim time.
pub struct HttpMemory {
    app_url: String,
    client: reqwest::Client,
    probe: Arc<dyn AppProbe>,
    baseline_mb: Mutex<Option<f64>>,
}

impl HttpMemory {
    pub fn new(app_url: impl Into<String>, probe: Arc<dyn AppProbe>) -> Self {
        Self {
            app_url: app_url.into(),
            client: reqwest::Client::new(),
            probe,
            baseline_mb: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MemoryControl for HttpMemory {
    async fn reclaim(&self) -> Result<()> {
        if let Ok(sample) = self.probe.sample_resources().await {
            *self.baseline_mb.lock().await = Some(sample.memory_mb);
        }
        let url = format!("{}/control/gc", self.app_url);
        self.client
            .post(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| MedicError::Step {
                step: "reclaim_memory".into(),
                reason: e.to_string(),
            })?
            .error_for_status()
            .map_err(|e| MedicError::Step {
                step: "reclaim_memory".into(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn is_reduced(&self) -> bool {
        let Some(baseline) = *self.baseline_mb.lock().await else {
            return false;
        };
        match self.probe.sample_resources().await {
            Ok(sample) => sample.memory_mb < baseline,
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
