use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Extension, Router};
use prometheus::{Encoder, TextEncoder};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::registry::ProcessRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStart {
    Started(SocketAddr),
    AlreadyRunning,
    BindFailed,
}

pub fn router(registry: Arc<ProcessRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .layer(Extension(registry))
        .layer(TraceLayer::new_for_http())
}

async fn render_metrics(registry: Extension<Arc<ProcessRegistry>>) -> Response {
    match registry.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_owned())],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Starts the process-wide `/metrics` listener on `port` unless some exporter
/// already did. Must be called from within a tokio runtime.
///
/// The bind happens before this returns; a bind failure is logged and
/// disables pull exposition for the rest of the process.
pub fn start(registry: &Arc<ProcessRegistry>, port: u16) -> ServerStart {
    let Some(_ticket) = registry.http_guard().try_begin() else {
        return ServerStart::AlreadyRunning;
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match bind(addr) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "failed to bind metrics listener");
            return ServerStart::BindFailed;
        }
    };
    let local_addr = listener.local_addr().unwrap_or(addr);

    let server = match axum::Server::from_tcp(listener) {
        Ok(builder) => builder.serve(router(registry.clone()).into_make_service()),
        Err(err) => {
            error!(%addr, error = %err, "failed to start metrics listener");
            return ServerStart::BindFailed;
        }
    };

    registry.set_http_addr(local_addr);
    info!(addr = %local_addr, "serving metrics");

    tokio::spawn(async move {
        if let Err(err) = server.await {
            error!(addr = %local_addr, error = %err, "metrics server terminated");
        }
    });

    ServerStart::Started(local_addr)
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
