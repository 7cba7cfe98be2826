use std::{net::IpAddr, sync::Arc};

use anyhow::{Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use tracing::{debug, warn};

use crate::auth::JwtVerifier;
use crate::config::GatewayConfig;
use crate::error::QueryError;
use crate::lists::ListStore;
use crate::metrics::GatewayMetrics;
use crate::tracker::Tracker;
use crate::translate::{FailedQuery, RequestTranslator, Transport, parse_response};
use crate::upstream::{SharedClient, UpstreamPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Answered,
    /// Malformed query, never forwarded.
    Rejected,
    /// Upstream or serialisation failure, answered with SERVFAIL.
    Failed,
}

/// The reply for one query, already packed for its transport.
#[derive(Debug)]
pub struct QueryOutcome {
    pub bytes: Vec<u8>,
    pub message: Message,
    pub status: QueryStatus,
}

/// Everything a query needs, built once at startup and shared by listeners.
#[derive(Clone)]
pub struct Gateway {
    translator: RequestTranslator,
    lists: Arc<ListStore>,
    tracker: Option<Arc<Tracker>>,
    metrics: Arc<GatewayMetrics>,
    verifier: Option<JwtVerifier>,
}

impl Gateway {
    pub fn new(
        translator: RequestTranslator,
        lists: Arc<ListStore>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            translator,
            lists,
            tracker: None,
            metrics,
            verifier: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<Tracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_verifier(mut self, verifier: JwtVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Load keys, lists and the tracker log. Any failure here is fatal.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let metrics =
            Arc::new(GatewayMetrics::new().context("Failed to initialise gateway metrics")?);

        let pool = UpstreamPool::from_section(&config.upstream)?;
        let client = Arc::new(SharedClient::new(config.upstream.timeout())?);
        let translator = RequestTranslator::new(pool, client)
            .with_client_subnet(!config.upstream.no_ecs)
            .with_query_log(config.logging.log_queries);

        let lists = Arc::new(ListStore::open(config.lists.directory.clone())?);
        let mut gateway = Self::new(translator, lists, metrics.clone());

        if config.tracker.path.is_some() {
            let tracker = Tracker::start(&config.tracker, metrics).await?;
            gateway = gateway.with_tracker(Arc::new(tracker));
        }

        if config.auth.enabled {
            let verifier =
                JwtVerifier::load(&config.auth.public_key_path, config.auth.token_type.clone())?;
            gateway = gateway.with_verifier(verifier);
        } else {
            warn!("Token authentication is disabled; DoH endpoint is open");
        }

        Ok(gateway)
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn lists(&self) -> &Arc<ListStore> {
        &self.lists
    }

    pub fn verifier(&self) -> Option<&JwtVerifier> {
        self.verifier.as_ref()
    }

    /// Translate, forward, filter and pack one query. Failures are answered,
    /// never propagated.
    pub async fn resolve(
        &self,
        request: &Message,
        transport: Transport,
        peer: Option<IpAddr>,
    ) -> QueryOutcome {
        self.metrics.inc_request();

        let pending = match self.translator.generate_request(request, peer).await {
            Ok(pending) => pending,
            Err(failed) => return self.failed(failed),
        };

        let lists = self.lists.snapshot();
        match parse_response(pending, transport, &lists).await {
            Ok(translated) => {
                self.metrics.inc_upstream_response();
                self.metrics.add_filtered_records(translated.dropped);
                if translated.truncated {
                    self.metrics.inc_truncated();
                }
                if translated.message.response_code() == ResponseCode::ServFail {
                    self.metrics.inc_upstream_failure();
                }
                if let (Some(tracker), Some(query)) =
                    (&self.tracker, translated.message.queries().first())
                {
                    tracker.save_domain(&query.name().to_ascii());
                }
                QueryOutcome {
                    bytes: translated.bytes,
                    message: translated.message,
                    status: QueryStatus::Answered,
                }
            }
            Err(failed) => self.failed(failed),
        }
    }

    pub async fn shutdown(&self) {
        if let Some(tracker) = &self.tracker {
            tracker.shutdown().await;
        }
    }

    fn failed(&self, failed: FailedQuery) -> QueryOutcome {
        let status = match &failed.error {
            QueryError::Format(_) => {
                self.metrics.inc_format_error();
                QueryStatus::Rejected
            }
            QueryError::Transport { .. } => {
                self.metrics.inc_upstream_failure();
                self.metrics.inc_client_replacement();
                QueryStatus::Failed
            }
            _ => {
                self.metrics.inc_upstream_failure();
                QueryStatus::Failed
            }
        };
        debug!(error = %failed.error, "Answering failed query");
        QueryOutcome {
            bytes: failed.to_bytes(),
            message: failed.reply,
            status,
        }
    }
}
