//! `bulwark` command line.
//!
//! Inspect dependency configs and operate audit ledgers:
//!
//! ```text
//! bulwark check deps.yaml
//! bulwark budgets deps.yaml --json
//! bulwark audit --state-file .canary_state.json summary
//! bulwark audit --state-file .canary_state.json record deploy --failed --revert "rollback deploy"
//! bulwark audit --state-file .canary_state.json reset --clear-ledger
//! ```

use anyhow::{Context, Result};
use bulwark_core::{
    ActionRecord, ActionSummary, AuditBreaker, BudgetMonitor, CategoryStatus, NodeHealth,
    ResilienceConfig,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "Inspect resilience configs and audit ledgers", long_about = None)]
struct Cli {
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config and show each dependency's settings
    Check {
        /// YAML or JSON config file
        config: PathBuf,
    },
    /// Show the budget categories a config defines
    Budgets {
        /// YAML or JSON config file
        config: PathBuf,
    },
    /// Operate an audit ledger
    Audit {
        /// Ledger file
        #[arg(long, default_value = ".canary_state.json")]
        state_file: PathBuf,

        /// Failures before the circuit opens
        #[arg(long, default_value_t = bulwark_core::audit::DEFAULT_FAILURE_THRESHOLD)]
        threshold: u32,

        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Counts and current state
    Summary,
    /// Recorded actions that carry a revert command
    RevertPlan,
    /// Exit non-zero if the circuit is open
    Check {
        /// Action about to run
        operation: String,
    },
    /// Record an action outcome
    Record {
        operation: String,

        /// The action failed
        #[arg(long)]
        failed: bool,

        /// Command that undoes the action
        #[arg(long)]
        revert: Option<String>,
    },
    /// Close the circuit
    Reset {
        /// Also drop the action ledger
        #[arg(long)]
        clear_ledger: bool,
    },
}

#[derive(Serialize)]
struct CheckReport {
    dependencies: Vec<NodeHealth>,
    order: Vec<String>,
    budgets: Vec<CategoryStatus>,
    audit: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulwark=info,bulwark_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Check { config } => check(&config, cli.json),
        Commands::Budgets { config } => budgets(&config, cli.json),
        Commands::Audit {
            state_file,
            threshold,
            action,
        } => audit(&state_file, threshold, action, cli.json),
    }
}

fn load(path: &Path) -> Result<ResilienceConfig> {
    ResilienceConfig::from_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

fn budget_status(config: &ResilienceConfig) -> Vec<CategoryStatus> {
    let monitor = BudgetMonitor::new();
    config.register_budgets(&monitor);
    monitor.all_status()
}

fn check(path: &Path, json: bool) -> Result<()> {
    let config = load(path)?;
    let chain = config.build_chain()?;
    let report = CheckReport {
        dependencies: chain.health(),
        order: chain.order().to_vec(),
        budgets: budget_status(&config),
        audit: config.audit.is_some(),
    };

    if json {
        return print_json(&report);
    }

    println!("{} dependencies, run order: {}", report.dependencies.len(), report.order.join(" -> "));
    for dep in &report.dependencies {
        println!(
            "  {:<24} timeout {:>6}ms  fallback {}",
            dep.name,
            dep.timeout_ms,
            if dep.has_fallback { "yes" } else { "no" }
        );
    }
    println!("{} budget categories", report.budgets.len());
    if report.audit {
        println!("audit breaker configured");
    }
    Ok(())
}

fn budgets(path: &Path, json: bool) -> Result<()> {
    let statuses = budget_status(&load(path)?);
    if json {
        return print_json(&statuses);
    }
    for status in &statuses {
        println!(
            "{:<24} {:>8}ms total  {:>8}ms remaining",
            status.name, status.total_ms, status.remaining_ms
        );
    }
    Ok(())
}

fn audit(state_file: &Path, threshold: u32, action: AuditAction, json: bool) -> Result<()> {
    let breaker = AuditBreaker::new(threshold, state_file);

    match action {
        AuditAction::Summary => {
            let summary = breaker.action_summary();
            if json {
                return print_json(&summary);
            }
            print_summary(&summary);
        }
        AuditAction::RevertPlan => {
            let plan = breaker.revert_plan();
            if json {
                return print_json(&plan);
            }
            print_plan(&plan);
        }
        AuditAction::Check { operation } => {
            breaker.assert_can_execute(&operation)?;
            if !json {
                println!("{} may proceed", operation);
            }
        }
        AuditAction::Record {
            operation,
            failed,
            revert,
        } => {
            breaker.record_action(&operation, !failed, revert.as_deref());
            tracing::info!(operation = %operation, success = !failed, "Action recorded");
            if json {
                return print_json(&breaker.action_summary());
            }
            print_summary(&breaker.action_summary());
        }
        AuditAction::Reset { clear_ledger } => {
            breaker.reset();
            if clear_ledger {
                breaker.clear_ledger();
            }
            if !json {
                println!("Circuit reset{}", if clear_ledger { ", ledger cleared" } else { "" });
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &ActionSummary) {
    println!("state:      {}", summary.current_state);
    println!("actions:    {}", summary.total_actions);
    println!("succeeded:  {}", summary.success_count);
    println!("failed:     {}", summary.failure_count);
    println!("in window:  {}", summary.failures_in_window);
}

fn print_plan(plan: &[ActionRecord]) {
    if plan.is_empty() {
        println!("Nothing to revert");
        return;
    }
    for record in plan {
        println!(
            "{}  {:<24} {}",
            record.timestamp.to_rfc3339(),
            record.operation,
            record.revert().unwrap_or_default()
        );
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
