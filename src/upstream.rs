use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use reqwest::Client;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{info, warn};
use url::Url;

use crate::config::UpstreamSection;

pub const USER_AGENT: &str = concat!("doh-gateway/", env!("CARGO_PKG_VERSION"));
pub const ACCEPT: &str = "application/json, application/dns-message, application/dns-udpwireformat";

pub(crate) const DEFAULT_UPSTREAM_PROFILE: &str = "google";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamProvider {
    pub name: &'static str,
    pub json_endpoints: &'static [&'static str],
    pub description: &'static str,
}

const UPSTREAM_PROVIDERS: &[UpstreamProvider] = &[
    UpstreamProvider {
        name: "google",
        json_endpoints: &["https://dns.google/resolve"],
        description: "Google Public DNS JSON API",
    },
    UpstreamProvider {
        name: "cloudflare",
        json_endpoints: &["https://cloudflare-dns.com/dns-query"],
        description: "Cloudflare (1.1.1.1) JSON API",
    },
    UpstreamProvider {
        name: "mixed",
        json_endpoints: &[
            "https://dns.google/resolve",
            "https://cloudflare-dns.com/dns-query",
        ],
        description: "Google and Cloudflare JSON APIs",
    },
];

pub(crate) fn resolve_upstream_profile(name: &str) -> Option<&'static UpstreamProvider> {
    let lower = name.trim().to_ascii_lowercase();
    UPSTREAM_PROVIDERS
        .iter()
        .find(|provider| provider.name == lower)
}

/// Ordered, non-empty set of JSON-API endpoints.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    endpoints: Arc<[Url]>,
}

impl UpstreamPool {
    pub fn new<I, S>(endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = endpoints
            .into_iter()
            .map(|raw| {
                let raw = raw.as_ref();
                Url::parse(raw).with_context(|| format!("Invalid upstream endpoint {raw}"))
            })
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            bail!("upstream endpoint pool must not be empty");
        }
        Ok(Self {
            endpoints: endpoints.into(),
        })
    }

    /// Explicit endpoints win; otherwise the named profile is expanded.
    pub fn from_section(section: &UpstreamSection) -> Result<Self> {
        if !section.endpoints.is_empty() {
            info!(endpoints = ?section.endpoints, "Using custom upstream endpoints");
            return Self::new(&section.endpoints);
        }
        let name = section.profile.as_deref().unwrap_or(DEFAULT_UPSTREAM_PROFILE);
        let Some(provider) = resolve_upstream_profile(name) else {
            bail!("Unknown upstream profile '{name}'");
        };
        info!(
            profile = provider.name,
            description = provider.description,
            "Using upstream profile"
        );
        Self::new(provider.json_endpoints.iter())
    }

    /// Uniformly random choice; no affinity between queries.
    pub fn pick(&self) -> &Url {
        &self.endpoints[fastrand::usize(..self.endpoints.len())]
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }
}

/// HTTP client shared by all queries, replaceable after transport failures.
#[derive(Debug)]
pub struct SharedClient {
    timeout: Duration,
    client: RwLock<Client>,
    generation: AtomicU64,
}

impl SharedClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            timeout,
            client: RwLock::new(build_client(timeout)?),
            generation: AtomicU64::new(0),
        })
    }

    /// Number of completed replacements.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    /// Held for the duration of one upstream exchange.
    pub async fn read(&self) -> RwLockReadGuard<'_, Client> {
        self.client.read().await
    }

    /// Build a fresh client and swap it in; in-flight readers keep the old one
    /// until they release the lock.
    pub async fn replace(&self) -> Result<()> {
        let fresh = build_client(self.timeout)?;
        let mut guard = self.client.write().await;
        *guard = fresh;
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fire-and-forget replacement used on the query path.
    pub fn replace_in_background(self: &Arc<Self>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match shared.replace().await {
                Ok(()) => info!(generation = shared.generation(), "Replaced upstream HTTP client"),
                Err(err) => warn!(error = %err, "Failed to replace upstream HTTP client"),
            }
        });
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .context("Failed to build HTTP client")
}
