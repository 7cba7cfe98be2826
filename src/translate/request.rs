use std::{net::IpAddr, sync::Arc};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use reqwest::header;
use tracing::{error, info};
use url::{Url, form_urlencoded};

use crate::error::QueryError;
use crate::filtering;
use crate::json_dns::{DNS_JSON_CONTENT_TYPE, prepare_reply};
use crate::translate::{DEFAULT_UDP_SIZE, DnsRequest, EcsSubnet, FailedQuery};
use crate::upstream::{ACCEPT, SharedClient, UpstreamPool};

/// Turns an inbound DNS question into a JSON-API upstream exchange.
#[derive(Debug, Clone)]
pub struct RequestTranslator {
    pool: UpstreamPool,
    client: Arc<SharedClient>,
    forward_subnet: bool,
    log_queries: bool,
}

impl RequestTranslator {
    pub fn new(pool: UpstreamPool, client: Arc<SharedClient>) -> Self {
        Self {
            pool,
            client,
            forward_subnet: true,
            log_queries: false,
        }
    }

    pub fn with_client_subnet(mut self, forward: bool) -> Self {
        self.forward_subnet = forward;
        self
    }

    pub fn with_query_log(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    /// Validate the query, pick an upstream and issue the GET.
    ///
    /// Transport failures answer ServFail and trigger a background swap of the
    /// shared HTTP client; the query itself is never retried.
    pub async fn generate_request(
        &self,
        request: &Message,
        peer: Option<IpAddr>,
    ) -> Result<DnsRequest, FailedQuery> {
        let reply = prepare_reply(request);

        if let Err(err) = filtering::pre_lookup(request) {
            info!(error = %err, "Rejecting malformed query");
            return Err(FailedQuery::new(reply, err));
        }
        let question = &request.queries()[0];

        // Inbound capitalisation is untrusted; keep upstream caches unfragmented.
        let question_name = question.name().to_ascii().to_ascii_lowercase();
        let question_type = question_type_param(question.query_type());

        if self.log_queries {
            info!(
                peer = ?peer,
                name = %question_name,
                qtype = %question_type,
                "DNS query"
            );
        }

        let upstream = self.pool.pick().clone();

        let (udp_size, edns) = match request.extensions() {
            Some(opt) => (opt.max_payload(), true),
            None => (DEFAULT_UDP_SIZE, false),
        };

        let client_subnet = if self.forward_subnet {
            EcsSubnet::find(request, peer)
        } else {
            None
        };

        let url = match build_request_url(
            &upstream,
            &question_name,
            &question_type,
            request.checking_disabled(),
            client_subnet.as_ref(),
        ) {
            Ok(url) => url,
            Err(err) => {
                error!(upstream = %upstream, error = %err, "Failed to build upstream URL");
                return Err(FailedQuery::new(reply, err.into()));
            }
        };

        let sent = {
            let client = self.client.read().await;
            client
                .get(url)
                .header(header::ACCEPT, ACCEPT)
                .send()
                .await
        };

        match sent {
            Ok(response) => Ok(DnsRequest {
                response,
                reply,
                udp_size,
                edns,
                client_subnet,
                upstream,
            }),
            Err(source) => {
                error!(upstream = %upstream, error = %source, "Upstream request failed");
                self.client.replace_in_background();
                Err(FailedQuery::new(
                    reply,
                    QueryError::Transport {
                        upstream: upstream.to_string(),
                        source,
                    },
                ))
            }
        }
    }
}

/// Mnemonic when known, numeric code otherwise.
pub fn question_type_param(record_type: RecordType) -> String {
    match record_type {
        RecordType::Unknown(code) => code.to_string(),
        other => other.to_string(),
    }
}

/// `{upstream}?ct=application/dns-json&name=..&type=..[&cd=1][&edns_client_subnet=ip/mask]`
pub fn build_request_url(
    upstream: &Url,
    name: &str,
    question_type: &str,
    checking_disabled: bool,
    client_subnet: Option<&EcsSubnet>,
) -> Result<Url, url::ParseError> {
    let encode = |value: &str| form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>();

    let separator = if upstream.query().is_some() { '&' } else { '?' };
    let mut raw = format!(
        "{upstream}{separator}ct={DNS_JSON_CONTENT_TYPE}&name={}&type={}",
        encode(name),
        encode(question_type)
    );
    if checking_disabled {
        raw.push_str("&cd=1");
    }
    if let Some(subnet) = client_subnet {
        raw.push_str(&format!(
            "&edns_client_subnet={}/{}",
            subnet.address, subnet.netmask
        ));
    }
    Url::parse(&raw)
}
