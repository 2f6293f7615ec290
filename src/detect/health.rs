//! # Stage: Health Prober
//!
//! ## Responsibility
//! Active probing of the monitored application on a fixed interval. Each
//! tick runs, in order: process liveness (a dead process short-circuits the
//! rest of the tick), response latency against a threshold, resource
//! sampling into rolling series, a memory-leak heuristic, critical-UI
//! element presence (with the sweep timed against the render threshold),
//! and an optional visual-regression check through a pluggable diff
//! function.
//!
//! ## Guarantees
//! - Independent checks: one failing check never blocks the others
//! - Non-fatal: any probe error becomes a medium `health_check_failure`
//!   event instead of crashing the prober loop
//! - Bounded: metric series are fixed-capacity rings
//!
//! ## NOT Responsible For
//! - Suppressing repeats (`detect::dedup`, applied by the orchestrator)
//! - Fix execution (`remedy::engine`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Thresholds;
use crate::error::Result;
use crate::event::{ErrorEvent, EventSource, Severity};

// ---------------------------------------------------------------------------
// Probe surface
// ---------------------------------------------------------------------------

/// One resource reading for the monitored process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// A raw screen capture handed to the diff function. The prober never
/// interprets pixels itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenCapture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// What the prober can observe about the monitored application.
///
/// The real implementation wraps the managed child process plus an HTTP
/// ping; tests inject scripted fakes.
#[async_trait]
pub trait AppProbe: Send + Sync {
    async fn is_process_alive(&self) -> bool;

    /// Round-trip time of a health ping.
    ///
    /// # Errors
    /// Returns a detection error when the app is unreachable.
    async fn response_latency(&self) -> Result<Duration>;

    /// # Errors
    /// Returns a detection error when sampling fails (e.g. `/proc` gone).
    async fn sample_resources(&self) -> Result<ResourceSample>;

    async fn element_present(&self, selector: &str) -> bool;

    /// `None` when the host environment provides no capture capability.
    async fn capture_screen(&self) -> Option<ScreenCapture>;
}

/// Pluggable visual diff: fraction of difference in `[0, 1]`.
pub type ScreenDiffFn = Box<dyn Fn(&ScreenCapture, &ScreenCapture) -> f64 + Send + Sync>;

/// Byte-wise pixel diff, the default [`ScreenDiffFn`]. Mismatched
/// dimensions count as fully different.
pub fn pixel_diff_fraction(a: &ScreenCapture, b: &ScreenCapture) -> f64 {
    if a.width != b.width || a.height != b.height || a.pixels.len() != b.pixels.len() {
        return 1.0;
    }
    if a.pixels.is_empty() {
        return 0.0;
    }
    let differing = a
        .pixels
        .iter()
        .zip(b.pixels.iter())
        .filter(|(x, y)| x != y)
        .count();
    differing as f64 / a.pixels.len() as f64
}

/// A UI element the prober checks each tick. Only `critical` elements
/// produce events when absent.
#[derive(Debug, Clone)]
pub struct UiElement {
    pub selector: String,
    pub critical: bool,
}

// ---------------------------------------------------------------------------
// MetricSeries — rolling samples
// ---------------------------------------------------------------------------

/// Fixed-capacity rolling series of metric samples, oldest evicted.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    samples: Vec<f64>,
    cap: usize,
}

impl MetricSeries {
    pub fn new(cap: usize) -> Self {
        Self { samples: Vec::with_capacity(cap.max(1)), cap: cap.max(1) }
    }

    pub fn push(&mut self, v: f64) {
        if self.samples.len() >= self.cap {
            self.samples.remove(0);
        }
        self.samples.push(v);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.last().copied()
    }

    /// Leak heuristic: over the last `n` samples, the fraction of strictly
    /// increasing consecutive deltas is at least `frac`. Requires a full
    /// window of `n` samples.
    pub fn mostly_increasing(&self, n: usize, frac: f64) -> bool {
        if n < 2 || self.samples.len() < n {
            return false;
        }
        let tail = &self.samples[self.samples.len() - n..];
        let increasing = tail.windows(2).filter(|w| w[1] > w[0]).count();
        increasing as f64 / (n - 1) as f64 >= frac
    }
}

// ---------------------------------------------------------------------------
// HealthProber
// ---------------------------------------------------------------------------

/// Number of trailing memory samples inspected by the leak heuristic.
const LEAK_WINDOW: usize = 10;
/// Fraction of increasing deltas that signals a leak.
const LEAK_FRACTION: f64 = 0.8;
/// Capacity of each rolling metric series.
const SERIES_CAP: usize = 120;

pub struct HealthProber {
    probe: Arc<dyn AppProbe>,
    thresholds: Thresholds,
    elements: Vec<UiElement>,
    memory_series: MetricSeries,
    cpu_series: MetricSeries,
    latency_series: MetricSeries,
    screen_diff: Option<ScreenDiffFn>,
    prev_capture: Option<ScreenCapture>,
    sink: Option<mpsc::UnboundedSender<ErrorEvent>>,
}

impl HealthProber {
    pub fn new(probe: Arc<dyn AppProbe>, thresholds: Thresholds) -> Self {
        Self {
            probe,
            thresholds,
            elements: Vec::new(),
            memory_series: MetricSeries::new(SERIES_CAP),
            cpu_series: MetricSeries::new(SERIES_CAP),
            latency_series: MetricSeries::new(SERIES_CAP),
            screen_diff: None,
            prev_capture: None,
            sink: None,
        }
    }

    /// Register a UI element to be checked each tick.
    pub fn watch_element(&mut self, selector: impl Into<String>, critical: bool) {
        self.elements.push(UiElement { selector: selector.into(), critical });
    }

    /// Enable the visual-regression check with the given diff function.
    pub fn set_screen_diff(&mut self, diff: ScreenDiffFn) {
        self.screen_diff = Some(diff);
    }

    /// Route emitted events to the given channel.
    pub fn set_sink(&mut self, tx: mpsc::UnboundedSender<ErrorEvent>) {
        self.sink = Some(tx);
    }

    pub fn memory_series(&self) -> &MetricSeries {
        &self.memory_series
    }

    /// Run one full probe cycle and return the events it produced.
    /// Never returns an error: probe failures become events.
    pub async fn tick(&mut self) -> Vec<ErrorEvent> {
        let mut events = Vec::new();

        // 1. Liveness. A dead process makes every other probe meaningless,
        // so the rest of the tick is skipped.
        if !self.probe.is_process_alive().await {
            events.push(
                ErrorEvent::new(
                    "process_not_running",
                    "monitored process is not running",
                    Severity::Critical,
                    "process",
                    EventSource::Probe,
                )
                .with_strategy("restart_app"),
            );
            self.emit(&events);
            return events;
        }

        // 2. Response latency.
        match self.probe.response_latency().await {
            Ok(latency) => {
                let ms = latency.as_millis() as f64;
                self.latency_series.push(ms);
                if ms > self.thresholds.response_time_ms as f64 {
                    events.push(
                        ErrorEvent::new(
                            "slow_response",
                            format!(
                                "health ping took {ms:.0}ms (threshold {}ms)",
                                self.thresholds.response_time_ms
                            ),
                            Severity::High,
                            "performance",
                            EventSource::Probe,
                        )
                        .with_strategy("reload_ui")
                        .with_metric("response_time_ms", ms),
                    );
                }
            }
            Err(e) => events.push(Self::check_failure("response_latency", &e.to_string())),
        }

        // 3 + 4. Resource sampling and the leak heuristic.
        match self.probe.sample_resources().await {
            Ok(sample) => {
                self.memory_series.push(sample.memory_mb);
                self.cpu_series.push(sample.cpu_percent);

                if self.memory_series.mostly_increasing(LEAK_WINDOW, LEAK_FRACTION) {
                    events.push(
                        ErrorEvent::new(
                            "memory_leak",
                            format!(
                                "memory rising across last {LEAK_WINDOW} samples, now {:.0}MB",
                                sample.memory_mb
                            ),
                            Severity::High,
                            "memory",
                            EventSource::Probe,
                        )
                        .with_strategy("reclaim_memory")
                        .with_metric("memory_mb", sample.memory_mb),
                    );
                } else if sample.memory_mb > self.thresholds.memory_usage_mb {
                    events.push(
                        ErrorEvent::new(
                            "high_memory_usage",
                            format!(
                                "memory {:.0}MB exceeds threshold {:.0}MB",
                                sample.memory_mb, self.thresholds.memory_usage_mb
                            ),
                            Severity::Medium,
                            "memory",
                            EventSource::Probe,
                        )
                        .with_strategy("reclaim_memory")
                        .with_metric("memory_mb", sample.memory_mb),
                    );
                }

                if sample.cpu_percent > self.thresholds.cpu_usage_percent {
                    events.push(
                        ErrorEvent::new(
                            "high_cpu_usage",
                            format!(
                                "cpu {:.0}% exceeds threshold {:.0}%",
                                sample.cpu_percent, self.thresholds.cpu_usage_percent
                            ),
                            Severity::Medium,
                            "performance",
                            EventSource::Probe,
                        )
                        .with_metric("cpu_percent", sample.cpu_percent),
                    );
                }
            }
            Err(e) => events.push(Self::check_failure("resource_sampling", &e.to_string())),
        }

        // 5. Critical UI elements. The sweep doubles as the render-time
        // check: a UI that answers element probes slowly is rendering slowly.
        let sweep_started = std::time::Instant::now();
        for el in self.elements.clone() {
            if el.critical && !self.probe.element_present(&el.selector).await {
                events.push(
                    ErrorEvent::new(
                        "missing_ui_element",
                        format!("critical element '{}' not found", el.selector),
                        Severity::High,
                        "ui",
                        EventSource::Probe,
                    )
                    .with_strategy("reload_ui")
                    .with_symptom(el.selector.clone()),
                );
            }
        }
        let sweep_ms = sweep_started.elapsed().as_millis() as u64;
        if !self.elements.is_empty() && sweep_ms > self.thresholds.ui_render_time_ms {
            events.push(
                ErrorEvent::new(
                    "slow_ui_render",
                    format!(
                        "element sweep took {sweep_ms}ms (threshold {}ms)",
                        self.thresholds.ui_render_time_ms
                    ),
                    Severity::Medium,
                    "ui",
                    EventSource::Probe,
                )
                .with_strategy("reload_ui")
                .with_metric("ui_render_time_ms", sweep_ms as f64),
            );
        }

        // 6. Optional visual regression against the previous capture.
        if let Some(ref diff) = self.screen_diff {
            if let Some(current) = self.probe.capture_screen().await {
                if let Some(ref prev) = self.prev_capture {
                    let d = diff(prev, &current);
                    if d > self.thresholds.screenshot_diff_threshold {
                        events.push(
                            ErrorEvent::new(
                                "visual_regression",
                                format!(
                                    "screen diff {d:.3} exceeds threshold {:.3}",
                                    self.thresholds.screenshot_diff_threshold
                                ),
                                Severity::Medium,
                                "ui",
                                EventSource::Probe,
                            )
                            .with_strategy("reload_ui")
                            .with_metric("screenshot_diff", d),
                        );
                    }
                }
                self.prev_capture = Some(current);
            }
        }

        self.emit(&events);
        events
    }

    fn check_failure(check: &str, reason: &str) -> ErrorEvent {
        ErrorEvent::new(
            "health_check_failure",
            format!("{check} check failed: {reason}"),
            Severity::Medium,
            "monitor",
            EventSource::Probe,
        )
    }

    fn emit(&self, events: &[ErrorEvent]) {
        if let Some(ref tx) = self.sink {
            for ev in events {
                let _ = tx.send(ev.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Scripted probe: every answer is set up front by the test.
    struct FakeProbe {
        alive: AtomicBool,
        latency_ms: Mutex<std::result::Result<u64, String>>,
        resources: Mutex<std::result::Result<ResourceSample, String>>,
        missing_elements: Mutex<Vec<String>>,
        element_delay: Mutex<Option<Duration>>,
        capture: Mutex<Option<ScreenCapture>>,
    }

    impl FakeProbe {
        fn healthy() -> Self {
            Self {
                alive: AtomicBool::new(true),
                latency_ms: Mutex::new(Ok(50)),
                resources: Mutex::new(Ok(ResourceSample { memory_mb: 100.0, cpu_percent: 5.0 })),
                missing_elements: Mutex::new(Vec::new()),
                element_delay: Mutex::new(None),
                capture: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl AppProbe for FakeProbe {
        async fn is_process_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn response_latency(&self) -> Result<Duration> {
            match self.latency_ms.lock().unwrap().clone() {
                Ok(ms) => Ok(Duration::from_millis(ms)),
                Err(e) => Err(crate::error::MedicError::Detection(e)),
            }
        }

        async fn sample_resources(&self) -> Result<ResourceSample> {
            match self.resources.lock().unwrap().clone() {
                Ok(s) => Ok(s),
                Err(e) => Err(crate::error::MedicError::Detection(e)),
            }
        }

        async fn element_present(&self, selector: &str) -> bool {
            let delay = *self.element_delay.lock().unwrap();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            !self.missing_elements.lock().unwrap().iter().any(|s| s == selector)
        }

        async fn capture_screen(&self) -> Option<ScreenCapture> {
            self.capture.lock().unwrap().clone()
        }
    }

    fn prober(probe: Arc<FakeProbe>) -> HealthProber {
        HealthProber::new(probe, Thresholds::default())
    }

    // ===== MetricSeries =====

    #[test]
    fn test_series_capped() {
        let mut s = MetricSeries::new(3);
        for i in 0..10 {
            s.push(i as f64);
        }
        assert_eq!(s.len(), 3);
        assert_eq!(s.last(), Some(9.0));
    }

    #[test]
    fn test_mostly_increasing_needs_full_window() {
        let mut s = MetricSeries::new(20);
        for i in 0..9 {
            s.push(i as f64);
        }
        assert!(!s.mostly_increasing(10, 0.8));
        s.push(9.0);
        assert!(s.mostly_increasing(10, 0.8));
    }

    #[test]
    fn test_mostly_increasing_flat_is_false() {
        let mut s = MetricSeries::new(20);
        for _ in 0..10 {
            s.push(100.0);
        }
        assert!(!s.mostly_increasing(10, 0.8));
    }

    #[test]
    fn test_mostly_increasing_tolerates_one_dip() {
        // 8 of 9 deltas increasing: 8/9 ≈ 0.89 ≥ 0.8
        let mut s = MetricSeries::new(20);
        for v in [1.0, 2.0, 3.0, 4.0, 3.5, 5.0, 6.0, 7.0, 8.0, 9.0] {
            s.push(v);
        }
        assert!(s.mostly_increasing(10, 0.8));
    }

    // ===== pixel diff =====

    #[test]
    fn test_pixel_diff_identical_zero() {
        let a = ScreenCapture { width: 2, height: 1, pixels: vec![1, 2, 3, 4] };
        assert_eq!(pixel_diff_fraction(&a, &a.clone()), 0.0);
    }

    #[test]
    fn test_pixel_diff_half_changed() {
        let a = ScreenCapture { width: 2, height: 1, pixels: vec![1, 2, 3, 4] };
        let b = ScreenCapture { width: 2, height: 1, pixels: vec![1, 2, 9, 9] };
        assert!((pixel_diff_fraction(&a, &b) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_pixel_diff_dimension_mismatch_is_one() {
        let a = ScreenCapture { width: 2, height: 1, pixels: vec![1, 2] };
        let b = ScreenCapture { width: 1, height: 1, pixels: vec![1] };
        assert_eq!(pixel_diff_fraction(&a, &b), 1.0);
    }

    // ===== tick: liveness =====

    #[tokio::test]
    async fn test_dead_process_emits_critical_and_skips_rest() {
        let probe = Arc::new(FakeProbe::healthy());
        probe.alive.store(false, Ordering::SeqCst);
        // Latency would also fail, but must never be probed.
        *probe.latency_ms.lock().unwrap() = Err("unreachable".into());

        let mut p = prober(Arc::clone(&probe));
        let events = p.tick().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].type_name, "process_not_running");
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[0].strategy_ref.as_deref(), Some("restart_app"));
    }

    #[tokio::test]
    async fn test_healthy_tick_no_events() {
        let mut p = prober(Arc::new(FakeProbe::healthy()));
        assert!(p.tick().await.is_empty());
    }

    // ===== tick: latency =====

    #[tokio::test]
    async fn test_slow_response_event() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.latency_ms.lock().unwrap() = Ok(5_000);
        let mut p = prober(probe);
        let events = p.tick().await;
        assert!(events.iter().any(|e| e.type_name == "slow_response"));
    }

    #[tokio::test]
    async fn test_latency_probe_error_becomes_check_failure() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.latency_ms.lock().unwrap() = Err("connection reset".into());
        let mut p = prober(probe);
        let events = p.tick().await;
        let failures: Vec<_> = events.iter().filter(|e| e.type_name == "health_check_failure").collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_failed_latency_does_not_block_resource_check() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.latency_ms.lock().unwrap() = Err("reset".into());
        *probe.resources.lock().unwrap() =
            Ok(ResourceSample { memory_mb: 9_000.0, cpu_percent: 5.0 });
        let mut p = prober(probe);
        let events = p.tick().await;
        assert!(events.iter().any(|e| e.type_name == "health_check_failure"));
        assert!(events.iter().any(|e| e.type_name == "high_memory_usage"));
    }

    // ===== tick: memory =====

    #[tokio::test]
    async fn test_memory_leak_detected_after_rising_samples() {
        let probe = Arc::new(FakeProbe::healthy());
        let mut p = prober(Arc::clone(&probe));
        for i in 0..10 {
            *probe.resources.lock().unwrap() =
                Ok(ResourceSample { memory_mb: 100.0 + i as f64, cpu_percent: 5.0 });
            let events = p.tick().await;
            if i < 9 {
                assert!(!events.iter().any(|e| e.type_name == "memory_leak"), "tick {i}");
            } else {
                assert!(events.iter().any(|e| e.type_name == "memory_leak"));
            }
        }
    }

    #[tokio::test]
    async fn test_high_memory_without_leak_pattern() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.resources.lock().unwrap() =
            Ok(ResourceSample { memory_mb: 2_000.0, cpu_percent: 5.0 });
        let mut p = prober(probe);
        let events = p.tick().await;
        assert!(events.iter().any(|e| e.type_name == "high_memory_usage"));
    }

    #[tokio::test]
    async fn test_high_cpu_event_not_eligible() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.resources.lock().unwrap() =
            Ok(ResourceSample { memory_mb: 100.0, cpu_percent: 99.0 });
        let mut p = prober(probe);
        let events = p.tick().await;
        let cpu = events.iter().find(|e| e.type_name == "high_cpu_usage").unwrap();
        assert!(!cpu.auto_fix_eligible);
    }

    // ===== tick: UI elements =====

    #[tokio::test]
    async fn test_missing_critical_element_event() {
        let probe = Arc::new(FakeProbe::healthy());
        probe.missing_elements.lock().unwrap().push("#editor".into());
        let mut p = prober(probe);
        p.watch_element("#editor", true);
        p.watch_element("#sidebar", true);
        let events = p.tick().await;
        let missing: Vec<_> = events.iter().filter(|e| e.type_name == "missing_ui_element").collect();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].symptoms.contains(&"#editor".to_string()));
    }

    #[tokio::test]
    async fn test_slow_element_sweep_emits_render_event() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.element_delay.lock().unwrap() = Some(Duration::from_millis(25));
        let mut thresholds = Thresholds::default();
        thresholds.ui_render_time_ms = 5;
        let mut p = HealthProber::new(probe, thresholds);
        p.watch_element("#editor", true);

        let events = p.tick().await;
        let slow = events.iter().find(|e| e.type_name == "slow_ui_render").unwrap();
        assert_eq!(slow.severity, Severity::Medium);
        assert_eq!(slow.strategy_ref.as_deref(), Some("reload_ui"));
    }

    #[tokio::test]
    async fn test_fast_sweep_stays_quiet() {
        let probe = Arc::new(FakeProbe::healthy());
        let mut p = prober(probe);
        p.watch_element("#editor", true);
        assert!(p.tick().await.is_empty());
    }

    #[tokio::test]
    async fn test_non_critical_element_ignored() {
        let probe = Arc::new(FakeProbe::healthy());
        probe.missing_elements.lock().unwrap().push("#tooltip".into());
        let mut p = prober(probe);
        p.watch_element("#tooltip", false);
        assert!(p.tick().await.is_empty());
    }

    // ===== tick: visual regression =====

    #[tokio::test]
    async fn test_visual_regression_on_second_capture() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.capture.lock().unwrap() =
            Some(ScreenCapture { width: 2, height: 1, pixels: vec![0, 0, 0, 0] });
        let mut p = prober(Arc::clone(&probe));
        p.set_screen_diff(Box::new(pixel_diff_fraction));

        // First tick stores the baseline, no diff possible yet.
        assert!(p.tick().await.is_empty());

        *probe.capture.lock().unwrap() =
            Some(ScreenCapture { width: 2, height: 1, pixels: vec![9, 9, 9, 9] });
        let events = p.tick().await;
        assert!(events.iter().any(|e| e.type_name == "visual_regression"));
    }

    #[tokio::test]
    async fn test_no_diff_function_no_visual_check() {
        let probe = Arc::new(FakeProbe::healthy());
        *probe.capture.lock().unwrap() =
            Some(ScreenCapture { width: 1, height: 1, pixels: vec![0] });
        let mut p = prober(probe);
        assert!(p.tick().await.is_empty());
        assert!(p.tick().await.is_empty());
    }

    // ===== sink =====

    #[tokio::test]
    async fn test_events_forwarded_to_sink() {
        let probe = Arc::new(FakeProbe::healthy());
        probe.alive.store(false, Ordering::SeqCst);
        let mut p = prober(probe);
        let (tx, mut rx) = mpsc::unbounded_channel();
        p.set_sink(tx);
        p.tick().await;
        assert_eq!(rx.try_recv().unwrap().type_name, "process_not_running");
    }
}
