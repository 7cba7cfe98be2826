use std::{
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::config::TrackerSection;
use crate::metrics::GatewayMetrics;

const TIMESTAMP_FORMAT: &str = "%y-%m-%d %H:%M:%S";

/// One resolved name and when it was seen.
#[derive(Debug, Clone)]
pub struct TrackEntry {
    pub domain: String,
    pub seen_at: DateTime<Utc>,
}

impl TrackEntry {
    fn line(&self) -> String {
        format!("{} - {}\n", self.seen_at.format(TIMESTAMP_FORMAT), self.domain)
    }
}

/// Fire-and-forget query log with a single background writer.
///
/// Entries are dropped (and counted) when the queue is full so a slow disk
/// never stalls DNS replies.
pub struct Tracker {
    sender: RwLock<Option<mpsc::Sender<TrackEntry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<GatewayMetrics>,
}

/// Queue and flush tuning, decoupled from the config file's units.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub queue_capacity: usize,
    pub flush_interval: Duration,
    pub flush_threshold: usize,
}

impl From<&TrackerSection> for TrackerSettings {
    fn from(section: &TrackerSection) -> Self {
        Self {
            queue_capacity: section.queue_capacity,
            flush_interval: section.flush_interval(),
            flush_threshold: section.flush_threshold_bytes,
        }
    }
}

impl Tracker {
    pub async fn start(section: &TrackerSection, metrics: Arc<GatewayMetrics>) -> Result<Self> {
        let path = section
            .path
            .clone()
            .context("Tracker enabled without a log path")?;
        Self::spawn(path, TrackerSettings::from(section), metrics).await
    }

    pub async fn spawn(
        path: PathBuf,
        settings: TrackerSettings,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self> {
        // Fail at startup rather than on the first flush.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Unable to open tracker log at {}", path.display()))?;

        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let worker = tokio::spawn(run_worker(receiver, path.clone(), settings));
        info!(path = %path.display(), "Query tracker started");

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            metrics,
        })
    }

    /// Queue `domain`; never waits for space.
    pub fn save_domain(&self, domain: &str) {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return;
        };
        let entry = TrackEntry {
            domain: domain.trim_end_matches('.').to_ascii_lowercase(),
            seen_at: Utc::now(),
        };
        match sender.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => {
                self.metrics.inc_tracker_dropped();
                warn!(domain = %entry.domain, "Tracker queue full; dropping entry");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Tracker closed; dropping entry");
            }
        }
    }

    /// Close the queue and wait for the final flush.
    pub async fn shutdown(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                error!(error = %err, "Tracker worker panicked");
            }
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<TrackEntry>,
    path: PathBuf,
    settings: TrackerSettings,
) {
    let mut buffer = String::new();
    let mut ticker = time::interval(settings.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                flush(&path, &mut buffer).await;
            }
            entry = receiver.recv() => match entry {
                Some(entry) => {
                    buffer.push_str(&entry.line());
                    if buffer.len() >= settings.flush_threshold {
                        flush(&path, &mut buffer).await;
                    }
                }
                None => {
                    flush(&path, &mut buffer).await;
                    info!("Query tracker stopped");
                    return;
                }
            }
        }
    }
}

async fn flush(path: &Path, buffer: &mut String) {
    if buffer.is_empty() {
        return;
    }
    if let Err(err) = append(path, buffer.as_bytes()).await {
        // Entries are lost; tracking never blocks on a broken log.
        error!(path = %path.display(), error = %err, "Failed to flush tracker log");
    }
    buffer.clear();
}

async fn append(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}
