use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::LoggingSection;

const JSON_LOG_PREFIX: &str = "doh-gateway.jsonl";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

/// Install the console subscriber, plus a daily-rolled JSON log when configured.
pub fn init_tracing(verbose: bool, logging: &LoggingSection) -> Result<()> {
    let default_level = if verbose {
        "doh_gateway=debug"
    } else {
        "doh_gateway=info"
    };
    let make_env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match &logging.json_directory {
        Some(directory) => {
            let (writer, guard) = build_json_writer(directory)?;
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false))
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_target(true)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG),
                );
            let _ = LOG_GUARD.set(guard);
            install_subscriber(subscriber)?;
        }
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(make_env_filter())
                .with(fmt::layer().with_target(false));
            install_subscriber(subscriber)?;
        }
    }

    Ok(())
}

fn build_json_writer(directory: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    let appender = rolling::daily(directory, JSON_LOG_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn json_writer_creates_directory_and_rolls_daily() {
        let dir = tempdir().expect("temp directory");
        let nested = dir.path().join("logs").join("json");

        let (mut writer, guard) = build_json_writer(&nested).expect("writer");
        writer.write_all(b"{\"message\":\"hello\"}\n").expect("write");
        drop(guard);

        let files: Vec<_> = fs::read_dir(&nested)
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with(JSON_LOG_PREFIX));
    }
}
