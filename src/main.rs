use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};

use provisor::config::Config;
use provisor::core::ExecutorKind;
use provisor::dispatch::{ExecutorRegistry, ProcessExecutor};
use provisor::events::ProgressEvent;
use provisor::orchestration::{
    CheckStatus, Inventory, InventoryReport, Orchestrator, OrchestratorConfig, PatternAdvisor,
    SessionRecord, SessionReport,
};
use provisor::{Plan, Result, SessionStore};

/// Provisor - dependency-aware machine provisioning
#[derive(Parser, Debug)]
#[command(name = "provisor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PROVISOR_DEBUG=1   Enable debug logging (alternative to --debug)\n    PROVISOR_LOG       Full tracing filter directive, e.g. provisor=trace")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.provisor/provisor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a provisioning plan to completion
    Run {
        /// Path to the plan file (TOML)
        plan: PathBuf,

        /// Maximum tasks dispatched at once (overrides config)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Re-run a failed task once when the advisor suggests a retry
        #[arg(long)]
        auto_remediate: bool,

        /// Do not persist the session record
        #[arg(long)]
        no_save: bool,
    },

    /// Report which tasks are already satisfied, without running any action
    Check {
        /// Path to the plan file (TOML)
        plan: PathBuf,

        /// Maximum tasks probed at once (overrides config)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Check a plan for duplicate ids, unknown prerequisites and cycles
    Validate {
        /// Path to the plan file (TOML)
        plan: PathBuf,
    },

    /// Show the report of a stored session
    Status {
        /// Session ID or prefix (uses latest if not specified)
        session_id: Option<String>,
    },

    /// List stored sessions, newest first
    Sessions,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    provisor::log::init_with_debug(cli.debug);

    if provisor::log::is_debug() {
        info!("provisor starting (debug mode enabled)");
    }

    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Run {
            plan,
            concurrency,
            auto_remediate,
            no_save,
        } => {
            let success = rt.block_on(run_plan(
                &config,
                plan,
                concurrency,
                auto_remediate,
                no_save,
            ))?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Check { plan, concurrency } => {
            let satisfied = rt.block_on(run_check(&config, plan, concurrency))?;
            if !satisfied {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Validate { plan } => rt.block_on(run_validate(&config, plan)),
        Command::Status { session_id } => rt.block_on(run_status(&config, session_id)),
        Command::Sessions => rt.block_on(run_sessions(&config)),
    }
}

fn default_timeout(config: &Config) -> Duration {
    Duration::from_millis(config.default_timeout_ms)
}

fn process_registry() -> Result<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    for kind in ExecutorKind::ALL {
        registry.register(Arc::new(ProcessExecutor::new(kind)?))?;
    }
    Ok(registry)
}

async fn run_plan(
    config: &Config,
    path: PathBuf,
    concurrency: Option<usize>,
    auto_remediate: bool,
    no_save: bool,
) -> Result<bool> {
    let plan = Plan::load(&path, default_timeout(config)).await?;
    info!(
        "Run command: plan={}, tasks={}, concurrency={:?}, auto_remediate={}",
        path.display(),
        plan.tasks.len(),
        concurrency,
        auto_remediate
    );

    let registry = process_registry()?;

    let mut orchestrator_config = OrchestratorConfig::from(config);
    if let Some(n) = concurrency {
        orchestrator_config.concurrency = n.max(1);
    }
    orchestrator_config.auto_remediate |= auto_remediate;

    let orchestrator = Orchestrator::builder(plan.tasks.clone(), registry)
        .config(orchestrator_config)
        .advisor(Arc::new(PatternAdvisor::new()))
        .build()?;

    println!(
        "Session {} : {} ({} tasks)",
        orchestrator.session_id().short(),
        display_name(&plan, &path),
        plan.tasks.len()
    );
    println!();

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            print_event(&event);
        }
    });

    let interrupt = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, shutting down session");
                eprintln!("\nInterrupted, cancelling outstanding tasks...");
                orchestrator.shutdown();
            }
        })
    };

    let report = orchestrator.run().await?;
    interrupt.abort();
    printer.await.ok();

    println!();
    print_report(&report);

    let mut saved = true;
    if !no_save {
        let record = orchestrator
            .record()
            .with_metadata("plan", &path.display().to_string())
            .with_metadata("name", &plan.name);
        match save_record(config, &record).await {
            Ok(file) => println!("\nSession saved: {}", file.display()),
            Err(e) => {
                warn!("Failed to save session record: {}", e);
                eprintln!("\nerror: session record not saved: {}", e);
                saved = false;
            }
        }
    }

    Ok(report.is_success() && saved)
}

async fn save_record(config: &Config, record: &SessionRecord) -> Result<PathBuf> {
    let store = SessionStore::from_config(config)?;
    store.save(record).await
}

async fn run_check(config: &Config, path: PathBuf, concurrency: Option<usize>) -> Result<bool> {
    let plan = Plan::load(&path, default_timeout(config)).await?;
    info!(
        "Check command: plan={}, tasks={}, concurrency={:?}",
        path.display(),
        plan.tasks.len(),
        concurrency
    );

    let concurrency = concurrency.unwrap_or(config.concurrency).max(1);
    let inventory = Arc::new(Inventory::with_concurrency(process_registry()?, concurrency));
    println!(
        "Checking {} ({} tasks)",
        display_name(&plan, &path),
        plan.tasks.len()
    );
    println!();

    let interrupt = {
        let inventory = Arc::clone(&inventory);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, abandoning checks");
                inventory.cancel();
            }
        })
    };
    let report = inventory.check(plan.tasks).await?;
    interrupt.abort();

    print_inventory(&report);
    Ok(report.is_satisfied())
}

async fn run_validate(config: &Config, path: PathBuf) -> Result<()> {
    let plan = Plan::load(&path, default_timeout(config)).await?;
    let graph = plan.graph()?;
    let order = graph.topological_order();

    println!(
        "Plan {} is valid: {} tasks, {} dependencies",
        display_name(&plan, &path),
        graph.len(),
        graph.edge_count()
    );
    println!();
    println!("Execution order:");
    for (i, task) in order.iter().enumerate() {
        println!("  {:>3}. {} ({})", i + 1, task.id(), task.executor());
    }
    let kinds: Vec<String> = plan.executors().iter().map(|k| k.to_string()).collect();
    println!();
    println!("Executors: {}", kinds.join(", "));
    Ok(())
}

async fn run_status(config: &Config, session_id: Option<String>) -> Result<()> {
    let store = SessionStore::from_config(config)?;
    let record = match session_id {
        Some(prefix) => store.find(&prefix).await?,
        None => match store.latest().await? {
            Some(record) => record,
            None => {
                println!("No sessions found in {}", store.dir().display());
                return Ok(());
            }
        },
    };
    print_record(&record);
    Ok(())
}

async fn run_sessions(config: &Config) -> Result<()> {
    let store = SessionStore::from_config(config)?;
    let reports = store.list().await?;
    if reports.is_empty() {
        println!("No sessions found in {}", store.dir().display());
        return Ok(());
    }
    println!("{:<10} {:<20} {:>6}  SUMMARY", "SESSION", "STARTED", "OK");
    for report in &reports {
        println!(
            "{:<10} {:<20} {:>6}  {}",
            report.session_id.short(),
            report.started_at.format("%Y-%m-%d %H:%M:%S"),
            if report.is_success() { "yes" } else { "no" },
            report.summary()
        );
    }
    Ok(())
}

fn display_name(plan: &Plan, path: &std::path::Path) -> String {
    if plan.name.is_empty() {
        path.display().to_string()
    } else {
        plan.name.clone()
    }
}

fn print_event(event: &ProgressEvent) {
    if event.is_blocked() {
        println!(
            "  [{:<10}] {:<24} {}",
            "blocked",
            event.task_id.as_str(),
            event.message
        );
        return;
    }
    let attempt = if event.attempt > 1 {
        format!(" (attempt {})", event.attempt)
    } else {
        String::new()
    };
    println!(
        "  [{:<10}] {:<24} {:>3}% {}{}",
        event.state.as_str(),
        event.task_id.as_str(),
        event.percent,
        event.message,
        attempt
    );
}

fn print_report(report: &SessionReport) {
    println!("Summary: {}", report.summary());
    for failed in &report.failed {
        let marker = if failed.critical { "critical" } else { "non-critical" };
        println!(
            "  FAILED  {} ({}, {} after {} attempts): {}",
            failed.task_id,
            marker,
            failed.detail.kind.as_str(),
            failed.detail.attempts,
            truncate_string(&failed.detail.message, 80)
        );
        if let Some(hint) = &failed.detail.remediation {
            println!("          hint: {}", hint.reason);
        }
    }
    for blocked in &report.blocked {
        println!("  BLOCKED {} (by {})", blocked.task_id, blocked.blocked_by);
    }
    for id in &report.cancelled {
        println!("  CANCELLED {}", id);
    }
}

fn print_inventory(report: &InventoryReport) {
    for item in &report.items {
        let marker = match item.status {
            CheckStatus::Satisfied => "ok",
            CheckStatus::Unsatisfied => "missing",
            CheckStatus::Unverifiable => "?",
            CheckStatus::Error => "error",
        };
        let detail = item
            .message
            .as_deref()
            .map(|m| truncate_string(m, 60))
            .unwrap_or_default();
        println!(
            "  [{:<7}] {:<24} {:<12} {}",
            marker,
            item.task_id.as_str(),
            item.status.as_str(),
            detail
        );
    }
    println!();
    println!("Summary: {}", report.summary());
}

fn print_record(record: &SessionRecord) {
    println!("Session: {}", record.session_id);
    for (key, value) in &record.metadata {
        println!("  {:<8} {}", format!("{}:", key), value);
    }
    println!(
        "  started: {}",
        record.report.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(finished) = record.report.finished_at {
        println!("  finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    println!();
    for task in &record.tasks {
        println!(
            "  {:<24} {:<10} attempts={}",
            task.task.id().as_str(),
            task.snapshot.state.as_str(),
            task.snapshot.attempts
        );
    }
    println!();
    print_report(&record.report);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    let first_line = s.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_len {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
