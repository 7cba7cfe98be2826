use hickory_proto::ProtoError;
use hickory_proto::op::{Message, ResponseCode};
use reqwest::header;
use tracing::{debug, error, warn};

use crate::error::QueryError;
use crate::filtering;
use crate::json_dns::JsonResponse;
use crate::lists::DomainLists;
use crate::translate::{DnsRequest, FailedQuery, Transport};

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Final reply for one query, ready to be written once.
#[derive(Debug)]
pub struct Translated {
    pub bytes: Vec<u8>,
    pub message: Message,
    /// Records removed by the lists.
    pub dropped: usize,
    pub truncated: bool,
}

/// Turn a completed upstream exchange into the wire reply for `transport`.
pub async fn parse_response(
    request: DnsRequest,
    transport: Transport,
    lists: &DomainLists,
) -> Result<Translated, FailedQuery> {
    let DnsRequest {
        response,
        reply,
        udp_size,
        edns,
        client_subnet,
        upstream,
    } = request;

    let status = response.status();
    let upstream_failed = !status.is_success();
    if upstream_failed {
        let json_body = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("json"));
        warn!(upstream = %upstream, status = %status, "Upstream answered with an error status");
        if !json_body {
            return Err(FailedQuery::new(
                reply,
                QueryError::UpstreamStatus {
                    upstream: upstream.to_string(),
                    status,
                },
            ));
        }
    }

    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => {
            error!(upstream = %upstream, error = %err, "Failed to read upstream body");
            return Err(FailedQuery::new(reply, QueryError::Body(err)));
        }
    };

    let parsed: JsonResponse = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            error!(upstream = %upstream, error = %err, "Failed to parse upstream JSON");
            return Err(FailedQuery::new(reply, err.into()));
        }
    };

    if parsed.status != 0 {
        if let Some(comment) = parsed.comment.as_deref() {
            warn!(
                upstream = %upstream,
                status = parsed.status,
                comment,
                "Upstream reported a DNS error"
            );
        }
    }

    let mut message = parsed.to_message(
        &reply,
        edns.then_some(udp_size),
        client_subnet.map(|subnet| subnet.netmask),
    );
    if upstream_failed {
        message.set_response_code(ResponseCode::ServFail);
    }

    let dropped = filtering::post_lookup(&mut message, lists);
    if dropped > 0 {
        debug!(dropped, "Filtered restricted records");
    }

    match pack_reply(&mut message, transport, udp_size) {
        Ok((bytes, truncated)) => Ok(Translated {
            bytes,
            message,
            dropped,
            truncated,
        }),
        Err(err) => {
            error!(error = %err, "Failed to serialise DNS reply");
            Err(FailedQuery::new(reply, err.into()))
        }
    }
}

/// Serialise `message`; over UDP an oversized reply gets TC set and is cut to
/// exactly `udp_size` bytes, never more than one datagram holds.
pub fn pack_reply(
    message: &mut Message,
    transport: Transport,
    udp_size: u16,
) -> Result<(Vec<u8>, bool), ProtoError> {
    let bytes = message.to_vec()?;
    let limit = usize::from(udp_size).min(MAX_UDP_PAYLOAD);
    if !transport.is_udp() || bytes.len() <= limit {
        return Ok((bytes, false));
    }

    message.set_truncated(true);
    let mut bytes = message.to_vec()?;
    bytes.truncate(limit);
    Ok((bytes, true))
}
