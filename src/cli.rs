use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::runner::Suite;

#[derive(Parser)]
#[command(name = "notemedic")]
#[command(version)]
#[command(about = "Watchdog for a local note-taking app: detects failures and repairs them")]
pub struct Args {
    /// Path to a TOML config file; defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the command that launches the monitored app
    #[arg(long = "app-cmd", global = true)]
    pub app_cmd: Option<String>,

    /// Override the directory reports are written to
    #[arg(long, global = true)]
    pub report_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Quick startup + basic functionality check
    Smoke,
    /// Full functional pass: UI, notes, search, storage
    Regression,
    /// Bulk note creation under a latency budget
    Stress,
    /// Hostile-input scan (injection, XSS, traversal)
    Security,
    /// Every suite in one session
    All,
    /// Long-running watch loop until interrupted
    Monitor,
}

impl Command {
    /// The suite this command maps to; `None` for monitor mode.
    pub fn suite(self) -> Option<Suite> {
        match self {
            Command::Smoke      => Some(Suite::Smoke),
            Command::Regression => Some(Suite::Regression),
            Command::Stress     => Some(Suite::Stress),
            Command::Security   => Some(Suite::Security),
            Command::All        => Some(Suite::All),
            Command::Monitor    => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suite_subcommand() {
        let args = Args::parse_from(["notemedic", "smoke"]);
        assert_eq!(args.command.suite(), Some(Suite::Smoke));
    }

    #[test]
    fn test_monitor_has_no_suite() {
        let args = Args::parse_from(["notemedic", "monitor"]);
        assert!(args.command.suite().is_none());
    }

    #[test]
    fn test_global_overrides_after_subcommand() {
        let args = Args::parse_from([
            "notemedic",
            "regression",
            "--app-cmd",
            "notes-app --headless",
            "--report-dir",
            "/tmp/reports",
        ]);
        assert_eq!(args.app_cmd.as_deref(), Some("notes-app --headless"));
        assert_eq!(args.report_dir.as_deref(), Some(std::path::Path::new("/tmp/reports")));
    }

    #[test]
    fn test_missing_subcommand_rejected() {
        assert!(Args::try_parse_from(["notemedic"]).is_err());
    }
}
