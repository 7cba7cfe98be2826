pub mod request;
pub mod response;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use tracing::error;
use url::Url;

use crate::error::QueryError;

pub use request::RequestTranslator;
pub use response::{Translated, parse_response};

/// Default responder buffer when the client does not speak EDNS0.
pub const DEFAULT_UDP_SIZE: u16 = 512;

const IPV4_SUBNET_PREFIX: u8 = 24;
const IPV6_SUBNET_PREFIX: u8 = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn is_udp(self) -> bool {
        matches!(self, Self::Udp)
    }
}

/// Client network forwarded upstream as `edns_client_subnet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcsSubnet {
    pub address: IpAddr,
    pub netmask: u8,
}

impl EcsSubnet {
    /// Prefer the client's own ECS option; otherwise derive from a public peer.
    pub fn find(request: &Message, peer: Option<IpAddr>) -> Option<Self> {
        if let Some(edns) = request.extensions() {
            if let Some(EdnsOption::Subnet(subnet)) = edns.option(EdnsCode::Subnet) {
                // Source prefix 0 is the client opting out.
                if subnet.source_prefix() == 0 {
                    return None;
                }
                return Some(Self {
                    address: subnet.addr(),
                    netmask: subnet.source_prefix(),
                });
            }
        }

        let peer = match peer? {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        if !is_global(peer) {
            return None;
        }
        Some(match peer {
            IpAddr::V4(v4) => Self {
                address: IpAddr::V4(mask_v4(v4, IPV4_SUBNET_PREFIX)),
                netmask: IPV4_SUBNET_PREFIX,
            },
            IpAddr::V6(v6) => Self {
                address: IpAddr::V6(mask_v6(v6, IPV6_SUBNET_PREFIX)),
                netmask: IPV6_SUBNET_PREFIX,
            },
        })
    }
}

fn is_global(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            let shared = a == 100 && (b & 0xc0) == 64;
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || shared)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}

fn mask_v4(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
    Ipv4Addr::from(u32::from(addr) & mask)
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> Ipv6Addr {
    let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
    Ipv6Addr::from(u128::from(addr) & mask)
}

/// A query accepted and sent upstream, awaiting response translation.
#[derive(Debug)]
pub struct DnsRequest {
    pub response: reqwest::Response,
    pub reply: Message,
    /// Responder buffer size; bounds UDP truncation.
    pub udp_size: u16,
    /// Whether the client advertised EDNS0.
    pub edns: bool,
    pub client_subnet: Option<EcsSubnet>,
    pub upstream: Url,
}

/// Terminal per-query failure with the reply the client receives.
#[derive(Debug)]
pub struct FailedQuery {
    pub reply: Message,
    pub error: QueryError,
}

impl FailedQuery {
    pub fn new(mut reply: Message, error: QueryError) -> Self {
        reply.set_response_code(error.response_code());
        Self { reply, error }
    }

    /// Wire form of the failure reply.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_failure(&self.reply)
    }
}

/// Serialise an error reply; drops the question if it alone cannot be packed.
pub fn encode_failure(reply: &Message) -> Vec<u8> {
    match reply.to_vec() {
        Ok(bytes) => bytes,
        Err(err) => {
            error!(error = %err, "Failed to serialise error reply; retrying without question");
            let mut bare = Message::new();
            bare.set_id(reply.id());
            bare.set_message_type(reply.message_type());
            bare.set_op_code(reply.op_code());
            bare.set_response_code(if reply.response_code() == ResponseCode::NoError {
                ResponseCode::ServFail
            } else {
                reply.response_code()
            });
            bare.to_vec().unwrap_or_default()
        }
    }
}
