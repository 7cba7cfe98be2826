use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, RawQuery, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::net::TcpListener;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::auth::{AuthGate, require_token};
use crate::gateway::{Gateway, QueryStatus};
use crate::json_dns::{DNS_JSON_CONTENT_TYPE, JsonResponse};
use crate::server::shutdown_signal;
use crate::translate::Transport;

pub const DNS_CONTENT_TYPE: &str = "application/dns-message";
const MAX_DNS_MESSAGE_BYTES: usize = 65_535;

pub struct DohResponseError {
    status: StatusCode,
    message: String,
}

impl DohResponseError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    fn payload_too_large() -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: "DNS message too large".into(),
        }
    }
}

impl IntoResponse for DohResponseError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// DoH routes, guarded by the token check when a verifier is configured.
pub fn router(gateway: Gateway, doh_path: &str) -> Router {
    let auth = gateway
        .verifier()
        .cloned()
        .map(|verifier| AuthGate::new(verifier, gateway.metrics().clone()));

    let router = Router::new()
        .route(doh_path, get(doh_get).post(doh_post))
        .with_state(gateway);

    match auth {
        Some(gate) => router.layer(middleware::from_fn_with_state(gate, require_token)),
        None => router,
    }
}

pub async fn run_doh_server(
    addr: SocketAddr,
    doh_path: String,
    tls: Option<(PathBuf, PathBuf)>,
    gateway: Gateway,
) -> Result<()> {
    let app = router(gateway, &doh_path).into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        Some((cert_path, key_path)) => {
            let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
                .await
                .with_context(|| {
                    format!(
                        "Invalid TLS certificate {} or key {}",
                        cert_path.display(),
                        key_path.display()
                    )
                })?;
            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            info!(listener = %addr, path = %doh_path, "Starting DoH server with TLS");
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app)
                .await
                .context("DoH server terminated unexpectedly")
        }
        None => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind DoH listener at {addr}"))?;
            info!(listener = %addr, path = %doh_path, "Starting DoH server");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("DoH server terminated unexpectedly")
        }
    }
}

/// `?dns=` selects wire mode; `?name=` selects JSON mode.
async fn doh_get(
    State(gateway): State<Gateway>,
    peer: Option<ConnectInfo<SocketAddr>>,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, DohResponseError> {
    let params = GetParams::parse(raw_query.as_deref().unwrap_or(""));
    let peer = peer.map(|ConnectInfo(addr)| addr);

    if let Some(dns) = params.dns {
        let payload = URL_SAFE_NO_PAD
            .decode(dns.trim_end_matches('='))
            .map_err(|_| DohResponseError::bad_request("invalid base64 payload"))?;
        return wire_response(gateway, &payload, peer).await;
    }

    if let Some(name) = params.name {
        let request = json_query(&name, params.record_type.as_deref(), params.cd)?;
        return Ok(json_response(gateway, request, peer).await);
    }

    Err(DohResponseError::bad_request("missing dns query parameter"))
}

async fn doh_post(
    State(gateway): State<Gateway>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DohResponseError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if content_type != DNS_CONTENT_TYPE {
        return Err(DohResponseError::bad_request(
            "missing application/dns-message content-type",
        ));
    }
    if body.len() > MAX_DNS_MESSAGE_BYTES {
        return Err(DohResponseError::payload_too_large());
    }
    wire_response(gateway, &body, peer.map(|ConnectInfo(addr)| addr)).await
}

#[derive(Debug, Default)]
struct GetParams {
    dns: Option<String>,
    name: Option<String>,
    record_type: Option<String>,
    cd: bool,
}

impl GetParams {
    fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "dns" => params.dns = Some(value.into_owned()),
                "name" => params.name = Some(value.into_owned()),
                "type" => params.record_type = Some(value.into_owned()),
                "cd" => params.cd = matches!(value.as_ref(), "1" | "true"),
                _ => {}
            }
        }
        params
    }
}

fn json_query(
    name: &str,
    record_type: Option<&str>,
    checking_disabled: bool,
) -> Result<Message, DohResponseError> {
    let mut name = Name::from_ascii(name.trim())
        .map_err(|_| DohResponseError::bad_request("invalid name"))?;
    name.set_fqdn(true);
    let record_type = parse_record_type(record_type.unwrap_or("A"))
        .ok_or_else(|| DohResponseError::bad_request("invalid type"))?;

    let mut request = Message::new();
    request.set_id(fastrand::u16(..));
    request.set_recursion_desired(true);
    request.set_checking_disabled(checking_disabled);
    request.add_query(Query::query(name, record_type));
    Ok(request)
}

fn parse_record_type(raw: &str) -> Option<RecordType> {
    match raw.parse::<u16>() {
        Ok(code) => Some(RecordType::from(code)),
        Err(_) => RecordType::from_str(&raw.to_ascii_uppercase()).ok(),
    }
}

async fn wire_response(
    gateway: Gateway,
    payload: &[u8],
    peer: Option<SocketAddr>,
) -> Result<Response, DohResponseError> {
    let request = Message::from_vec(payload).map_err(|err| {
        debug!(error = %err, "Failed to parse DNS message");
        DohResponseError::bad_request(format!("failed to parse DNS message: {err}"))
    })?;

    // HTTP is a reliable transport: replies are never truncated.
    let outcome = gateway
        .resolve(&request, Transport::Tcp, peer.map(|addr| addr.ip()))
        .await;
    let status = match outcome.status {
        QueryStatus::Rejected => StatusCode::BAD_REQUEST,
        QueryStatus::Answered | QueryStatus::Failed => StatusCode::OK,
    };
    Ok(dns_response(status, outcome.bytes))
}

async fn json_response(gateway: Gateway, request: Message, peer: Option<SocketAddr>) -> Response {
    let outcome = gateway
        .resolve(&request, Transport::Tcp, peer.map(|addr| addr.ip()))
        .await;
    let status = match outcome.status {
        QueryStatus::Rejected => StatusCode::BAD_REQUEST,
        QueryStatus::Answered | QueryStatus::Failed => StatusCode::OK,
    };
    let mut response = (status, Json(JsonResponse::from_message(&outcome.message))).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DNS_JSON_CONTENT_TYPE),
    );
    response
}

fn dns_response(status: StatusCode, bytes: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(DNS_CONTENT_TYPE),
    );
    response
}
