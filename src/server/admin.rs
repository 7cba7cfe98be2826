use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::gateway::Gateway;
use crate::lists::ListStore;
use crate::metrics::{GatewayMetrics, PROMETHEUS_CONTENT_TYPE};
use crate::server::shutdown_signal;

#[derive(Clone)]
struct AdminState {
    metrics: Arc<GatewayMetrics>,
    lists: Arc<ListStore>,
}

pub fn router(gateway: &Gateway) -> Router {
    let state = AdminState {
        metrics: gateway.metrics().clone(),
        lists: gateway.lists().clone(),
    };
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/lists/reload", any(reload_handler))
        .with_state(state)
}

pub async fn run_admin_server(addr: &str, gateway: Gateway) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid admin listener address: {addr}"))?;

    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind admin listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting admin server");

    axum::serve(listener, router(&gateway).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Admin server terminated unexpectedly")
}

async fn metrics_handler(State(state): State<AdminState>) -> Response {
    match state.metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => {
            error!(error = %err, "Failed to render gateway metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Acknowledge at once; the reload itself runs in the background.
async fn reload_handler(State(state): State<AdminState>, method: Method) -> Response {
    if method != Method::POST {
        return (StatusCode::BAD_REQUEST, "Bad request").into_response();
    }
    reload_in_background(state.lists);
    (StatusCode::OK, "Ok").into_response()
}

pub fn reload_in_background(lists: Arc<ListStore>) {
    tokio::spawn(async move {
        if let Err(err) = lists.reload().await {
            warn!(error = %format!("{err:#}"), "List reload failed; keeping previous lists");
        }
    });
}

/// SIGHUP reloads the lists, same as `POST /lists/reload`.
#[cfg(unix)]
pub fn reload_on_hangup(lists: Arc<ListStore>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "Unable to install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received; reloading lists");
            reload_in_background(lists.clone());
        }
    });
}
