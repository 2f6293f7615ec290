use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use notemedic::cli::Args;
use notemedic::config::MedicConfig;
use notemedic::detect::HealthProber;
use notemedic::remedy::{
    Capabilities, FileStorage, FixEngine, HttpMemory, HttpUi, ManagedProcess, StrategyBook,
};
use notemedic::report::{JsonReporter, TestSession};
use notemedic::runner::{HttpDriver, Orchestrator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match args.config {
        Some(ref path) => MedicConfig::load(path)?,
        None => MedicConfig::default(),
    };
    if let Some(ref cmd) = args.app_cmd {
        cfg.app_command = cmd.split_whitespace().map(str::to_string).collect();
    }
    if let Some(ref dir) = args.report_dir {
        cfg.report_dir = dir.clone();
    }

    // Wire the real capability set around one managed process.
    let managed = Arc::new(ManagedProcess::new(&cfg));
    let caps = Capabilities {
        process: managed.clone(),
        storage: Arc::new(FileStorage::new(cfg.db_path.clone())),
        ui: Arc::new(HttpUi::new(cfg.app_url.clone())),
        memory: Arc::new(HttpMemory::new(cfg.app_url.clone(), managed.clone())),
        temp_dirs: cfg.temp_dirs.clone(),
    };
    let engine = Arc::new(FixEngine::new(
        caps.clone(),
        StrategyBook::builtin(),
        cfg.fix_base_delay(),
    ));
    let sink = Arc::new(JsonReporter::new(cfg.report_dir.clone()));
    let driver = Arc::new(HttpDriver::new(cfg.app_url.clone()));

    let thresholds = cfg.thresholds.clone();
    let orchestrator = Orchestrator::new(
        cfg,
        caps,
        managed.clone(),
        driver,
        Arc::clone(&engine),
        sink,
    )
    .with_managed(Arc::clone(&managed));

    let session = match args.command.suite() {
        Some(suite) => orchestrator.run_suite(suite).await?,
        None => {
            let mut prober = HealthProber::new(managed.clone(), thresholds);
            prober.watch_element("#editor", true);
            prober.watch_element("#sidebar", true);
            let session = orchestrator.run_monitor(prober).await?;
            print_session(&session);
            info!("monitor stopped");
            return Ok(());
        }
    };

    print_session(&session);
    if !session.all_resolved() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_session(session: &TestSession) {
    println!();
    println!("{} {}", "Session".bold(), session.id);
    for t in &session.tests {
        let mark = if t.passed { "✓".green() } else { "✗".red() };
        println!("  {mark} {} ({}ms)", t.name, t.duration_ms);
        if let Some(ref d) = t.detail {
            println!("      {}", d.dimmed());
        }
    }
    if !session.fixes.is_empty() {
        println!("  {}", "fixes:".bold());
        for f in &session.fixes {
            let mark = if f.success { "✓".green() } else { "✗".red() };
            println!(
                "  {mark} {} for {} ({} attempts)",
                f.strategy, f.event_type, f.attempts_used
            );
        }
    }
    let verdict = if session.all_resolved() {
        "PASSED".green().bold()
    } else {
        "FAILED".red().bold()
    };
    println!(
        "{verdict} — {} passed, {} failed, {} fixes",
        session.passed_count(),
        session.failed_count(),
        session.fixes.len()
    );
}
