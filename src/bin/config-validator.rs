//! # Scheduler Configuration Validator
//!
//! Command-line tool for validating `scheduler-config.yaml` for one environment, or
//! comparing the resolved configuration of two environments, before starting a node.

use clap::{Parser, Subcommand};
use lease_core::config::{ConfigManager, SchedulerConfig};
use lease_core::orchestration::RetryPolicy;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const ENVIRONMENTS: [&str; 3] = ["development", "test", "production"];

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate scheduler configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Directory containing scheduler-config.yaml (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for `structure` (json, yaml)
    #[arg(long, default_value = "yaml")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every section
    All,

    /// Validate one section
    Component {
        /// Section name (database, job_acquisition, job_execution, retry, fetch_and_lock, auth)
        name: String,
    },

    /// List known environments
    Environments,

    /// Print the resolved configuration with secrets masked
    Structure,

    /// Show the sections that differ between two environments
    Compare {
        #[arg(short, long, default_value = "development")]
        base: String,

        #[arg(short, long)]
        target: String,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Environments) => list_environments(),
        Some(Commands::Structure) => show_structure(&cli),
        Some(Commands::Compare { base, target }) => compare(&cli, base, target),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            println!("❌ {e}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> Result<Arc<ConfigManager>, Box<dyn std::error::Error>> {
    Ok(ConfigManager::load_from_directory_with_env(
        cli.config_dir.clone(),
        environment,
    )?)
}

fn validate_all(cli: &Cli) -> CliResult {
    println!("🔧 Validating scheduler configuration");
    println!("Environment: {}", cli.environment);

    let manager = load(cli, &cli.environment)?;
    println!(
        "✅ Loaded {}",
        manager.config_directory().join("scheduler-config.yaml").display()
    );

    let config = manager.config();
    for section in [
        "database",
        "job_acquisition",
        "job_execution",
        "retry",
        "fetch_and_lock",
        "auth",
    ] {
        report_section(config, section)?;
    }

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(cli: &Cli, name: &str) -> CliResult {
    println!("🔧 Validating component: {name}");
    let manager = load(cli, &cli.environment)?;
    report_section(manager.config(), &name.to_lowercase().replace('-', "_"))
}

fn report_section(config: &SchedulerConfig, section: &str) -> CliResult {
    match section {
        "database" => {
            println!("  database: pool={} checkout_timeout={}ms", config.database.pool, config.database.checkout_timeout_millis);
        }
        "job_acquisition" => {
            let acquisition = &config.job_acquisition;
            println!(
                "  job_acquisition: max_jobs={} lock={}ms wait={}..{}ms scope={:?}",
                acquisition.max_jobs_per_acquisition,
                acquisition.lock_time_in_millis,
                acquisition.wait_time_in_millis,
                acquisition.max_wait_in_millis,
                acquisition.exclusivity_scope
            );
        }
        "job_execution" => {
            let execution = &config.job_execution;
            println!(
                "  job_execution: batches={} queue={} continue_on_failure={}",
                execution.max_concurrent_batches,
                execution.queue_capacity,
                execution.continue_batch_on_failure
            );
        }
        "retry" => {
            let policy = RetryPolicy::from_config(&config.retry)?;
            println!(
                "  retry: default_retries={} strategy={:?}",
                config.retry.default_retries,
                policy.strategy()
            );
        }
        "fetch_and_lock" => {
            let fetch = &config.fetch_and_lock;
            println!(
                "  fetch_and_lock: backoff={}..{}ms divisor={}",
                fetch.min_backoff_millis, fetch.default_backoff_millis, fetch.backoff_divisor
            );
        }
        "auth" => {
            println!(
                "  auth: enabled={} realm={} users={}",
                config.auth.enabled,
                config.auth.realm,
                config.auth.users.len()
            );
        }
        other => return Err(format!("Unknown component: {other}").into()),
    }
    println!("✅ {section}");
    Ok(())
}

fn list_environments() -> CliResult {
    println!("📋 Available environments:");
    for environment in ENVIRONMENTS {
        println!("  - {environment}");
    }
    Ok(())
}

fn show_structure(cli: &Cli) -> CliResult {
    let manager = load(cli, &cli.environment)?;
    let sanitized = manager.debug_config();
    match cli.format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&sanitized)?),
        "yaml" => println!("{}", serde_yaml::to_string(&sanitized)?),
        other => return Err(format!("Unknown format: {other}").into()),
    }
    Ok(())
}

fn compare(cli: &Cli, base: &str, target: &str) -> CliResult {
    println!("🔍 Comparing {base} → {target}");
    let base_config = load(cli, base)?.debug_config();
    let target_config = load(cli, target)?.debug_config();

    let (Some(base_sections), Some(target_sections)) =
        (base_config.as_object(), target_config.as_object())
    else {
        return Err("resolved configuration is not a mapping".into());
    };

    let mut differences = 0;
    for (section, base_value) in base_sections {
        if section == "environment" {
            continue;
        }
        if target_sections.get(section) != Some(base_value) {
            differences += 1;
            println!("  ≠ {section}");
        }
    }

    if differences == 0 {
        println!("✅ No differences");
    } else {
        println!("{differences} section(s) differ");
    }
    Ok(())
}
