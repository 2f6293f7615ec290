//! # Stage: Pattern Registry
//!
//! ## Responsibility
//! Static rule set mapping a regex matcher to an error classification
//! (type, category, severity, remediation-strategy reference). Pure data,
//! loaded once at startup. `classify` returns the first matching rule —
//! rules are evaluated in registration order, and that tie-break is
//! intentional: specific rules (database, storage) are registered before
//! generic ones (crash, rejection).
//!
//! ## Guarantees
//! - Pure: classification has no side effects
//! - Deterministic: same line, same registry → same event type
//!
//! ## NOT Responsible For
//! - Suppressing repeats (`detect::dedup`)
//! - Deciding when to classify (`detect::log_analyzer`)

use once_cell::sync::Lazy;
use regex::Regex;

use crate::event::{ErrorEvent, EventSource, Severity};

// ---------------------------------------------------------------------------
// PatternRule
// ---------------------------------------------------------------------------

/// One classification rule. Identity is `id`; immutable once registered.
#[derive(Debug, Clone)]
pub struct PatternRule {
    /// Stable identifier; becomes the `type_name` of emitted events.
    pub id: String,
    pub pattern: Regex,
    pub category: String,
    pub severity: Severity,
    pub description: String,
    pub auto_fix_eligible: bool,
    pub strategy_ref: Option<String>,
}

impl PatternRule {
    /// Build a rule from a regex source string.
    ///
    /// # Errors
    /// Returns the regex compilation error for an invalid pattern.
    pub fn new(
        id: impl Into<String>,
        pattern: &str,
        category: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        strategy_ref: Option<&str>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            id: id.into(),
            pattern: Regex::new(pattern)?,
            category: category.into(),
            severity,
            description: description.into(),
            auto_fix_eligible: strategy_ref.is_some(),
            strategy_ref: strategy_ref.map(str::to_string),
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

// ---------------------------------------------------------------------------
// PatternRegistry
// ---------------------------------------------------------------------------

/// Ordered collection of [`PatternRule`]s; first match wins.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    rules: Vec<PatternRule>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// The default rule set for the monitored note-taking app. Compiled
    /// once; callers get a cheap clone of the shared set.
    pub fn builtin() -> Self {
        static BUILTIN: Lazy<PatternRegistry> = Lazy::new(PatternRegistry::build_builtin);
        BUILTIN.clone()
    }

    fn build_builtin() -> Self {
        let mut reg = Self::new();
        let table: &[(&str, &str, &str, Severity, &str, Option<&str>)] = &[
            (
                "database_connection_failure",
                r"(?i)ECONNREFUSED|SQLITE_CANTOPEN|database is locked",
                "database",
                Severity::Critical,
                "the app cannot reach its SQLite database",
                Some("restart_db"),
            ),
            (
                "storage_corruption",
                r"(?i)SQLITE_CORRUPT|database disk image is malformed",
                "storage",
                Severity::Critical,
                "the storage file is corrupted",
                Some("restore_storage"),
            ),
            (
                "disk_full",
                r"(?i)ENOSPC|no space left on device",
                "storage",
                Severity::High,
                "the disk hosting the storage file is full",
                Some("cleanup_temp"),
            ),
            (
                "out_of_memory",
                r"(?i)out of memory|allocation failed|OOM killed",
                "memory",
                Severity::High,
                "the app exhausted its memory budget",
                Some("reclaim_memory"),
            ),
            (
                "permission_denied",
                r"(?i)EACCES|permission denied",
                "storage",
                Severity::High,
                "a file operation was denied by the OS",
                None,
            ),
            (
                "missing_ui_element",
                r"(?i)element not found|missing critical element",
                "ui",
                Severity::High,
                "a critical UI element failed to render",
                Some("reload_ui"),
            ),
            (
                "render_timeout",
                r"(?i)render timeout|ui thread blocked|slow frame",
                "ui",
                Severity::Medium,
                "the UI took too long to render",
                Some("reload_ui"),
            ),
            (
                "app_crash",
                r"(?i)panicked at|segmentation fault|fatal error",
                "process",
                Severity::Critical,
                "the app process crashed",
                Some("restart_app"),
            ),
            (
                "unhandled_rejection",
                r"(?i)unhandled promise rejection|uncaught exception",
                "ui",
                Severity::Medium,
                "script error in the UI layer",
                Some("reload_ui"),
            ),
        ];
        for (id, pat, cat, sev, desc, strat) in table {
            // Builtin patterns are static literals, checked by tests below.
            if let Ok(rule) = PatternRule::new(*id, pat, *cat, *sev, *desc, *strat) {
                reg.register(rule);
            }
        }
        reg
    }

    /// Append a rule; later registrations lose ties to earlier ones.
    pub fn register(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }

    /// Classify a log line against the registry.
    ///
    /// Returns an [`ErrorEvent`] built from the first matching rule, in
    /// registration order, or `None` when nothing matches.
    pub fn classify(&self, line: &str) -> Option<ErrorEvent> {
        let rule = self.rules.iter().find(|r| r.matches(line))?;
        let mut ev = ErrorEvent::new(
            rule.id.clone(),
            line,
            rule.severity,
            rule.category.clone(),
            EventSource::Log,
        )
        .with_symptom(rule.description.clone());
        if let Some(ref strat) = rule.strategy_ref {
            ev = ev.with_strategy(strat.clone());
        }
        Some(ev)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
