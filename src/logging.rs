//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and to a JSON log file, so an
//! acquisition cycle or a long-poll sweep can be followed across background tasks.

use chrono::Utc;
use std::fs;
use std::process;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_DIR: &str = "log";

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; an already installed global subscriber is kept.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = active_environment();
        let level = default_level(&environment);

        let console = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(filter_or(level));
        let file = json_file_layer(&environment, level);
        let file_output = file.is_some();

        if tracing_subscriber::registry()
            .with(console)
            .with(file)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already installed, keeping it");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            file_output,
            "🔧 Structured logging initialized"
        );
    });
}

/// JSON lines written to `log/<env>.<pid>.<timestamp>.log`; `None` when the directory
/// cannot be created
fn json_file_layer<S>(environment: &str, level: &str) -> Option<impl Layer<S>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    fs::create_dir_all(LOG_DIR).ok()?;
    let name = format!(
        "{environment}.{}.{}.log",
        process::id(),
        Utc::now().format("%Y%m%d_%H%M%S")
    );
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(LOG_DIR, name));
    let _ = FILE_GUARD.set(guard);

    Some(
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(filter_or(level)),
    )
}

/// `RUST_LOG` wins over the environment default
fn filter_or(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn active_environment() -> String {
    ["SCHEDULER_ENV", "APP_ENV"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .unwrap_or_else(|| "development".to_string())
}

fn default_level(environment: &str) -> &'static str {
    if environment == "production" {
        "info"
    } else {
        "debug"
    }
}

/// One acquisition cycle of the job executor
pub fn log_acquisition_cycle(
    node_id: &str,
    selected: usize,
    acquired: usize,
    lost_races: usize,
    batches: usize,
) {
    tracing::info!(
        node_id = %node_id,
        selected = selected,
        acquired = acquired,
        lost_races = lost_races,
        batches = batches,
        timestamp = %Utc::now().to_rfc3339(),
        "🔒 ACQUISITION_CYCLE"
    );
}

/// A lease level operation on one work item
pub fn log_lease_operation(
    operation: &str,
    work_item_id: &str,
    owner: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        work_item_id = %work_item_id,
        owner = owner,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📌 LEASE_OPERATION"
    );
}

/// A state change of a long-poll request
pub fn log_long_poll_event(
    event: &str,
    request_id: &str,
    worker_id: &str,
    items: usize,
    details: Option<&str>,
) {
    tracing::info!(
        event = %event,
        request_id = %request_id,
        worker_id = %worker_id,
        items = items,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📮 LONG_POLL"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(default_level("test"), "debug");
        assert_eq!(default_level("development"), "debug");
        assert_eq!(default_level("production"), "info");
        assert_eq!(default_level("unknown"), "debug");
    }

    #[test]
    fn test_helpers_do_not_require_a_subscriber() {
        log_acquisition_cycle("node-a", 3, 2, 1, 2);
        log_lease_operation("release", "job-1", Some("node-a"), "ok", None);
        log_long_poll_event("queued", "req-1", "worker-1", 0, Some("no items"));
        log_error("job_executor", "acquire", "database unavailable", None);
    }
}
