//! Remediation side of the watchdog: capability handlers, the strategy
//! playbook, and the fix engine that interprets it.

pub mod capabilities;
pub mod engine;
pub mod strategy;

pub use capabilities::{
    Capabilities, FileStorage, HttpMemory, HttpUi, ManagedProcess, MemoryControl, ProcessControl,
    StorageControl, UiControl,
};
pub use engine::{CriterionCheck, FixEngine, FixResult, FixStats, StepResult, Verification};
pub use strategy::{Criterion, FixStrategy, StepAction, StrategyBook};
