//! Axum-based HTTP and WebSocket server.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::connection::handle_media_stream;
use crate::state::GatewayState;

/// Routes served by the gateway.
pub fn router(state: Arc<GatewayState>) -> Router {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/twiml", get(twiml_handler).post(twiml_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Bind the configured address and serve until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.bind_addr(),
        state.config.gateway_port()
    );
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves, then end
/// live calls and wait for their recordings to upload.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("Gateway listening on {addr}");
    if let Some(url) = state.config.gateway.as_ref().and_then(|g| g.public_url.as_deref()) {
        info!("Point the Twilio voice webhook at {}/twiml", url.trim_end_matches('/'));
    }

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            shutdown.await;
            let cancelled = shutdown_state.cancel_all().await;
            if cancelled > 0 {
                info!(cancelled, "Cancelled live sessions");
            }
        })
        .await?;

    // Connection tasks unregister once their pipeline has handed off its recording
    let drain = state.config.teardown_grace() * 2;
    let drained = tokio::time::timeout(drain, async {
        while state.active_sessions().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        let remaining = state.active_sessions().await;
        warn!(remaining, "Sessions still open at shutdown");
    }

    state.pool.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let sessions = state.active_sessions().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "sessions": sessions,
        "total_sessions": state.total_sessions(),
    }))
}

/// WebSocket URL Twilio should stream to: the configured public URL when
/// set, else the request's Host header.
fn stream_url(public_url: Option<&str>, host: Option<&str>) -> Option<String> {
    let base = public_url.filter(|u| !u.is_empty()).or(host)?;
    let authority = ["https://", "http://", "wss://", "ws://"]
        .iter()
        .find_map(|scheme| base.strip_prefix(scheme))
        .unwrap_or(base)
        .trim_end_matches('/');
    Some(format!("wss://{authority}/ws"))
}

fn twiml(stream_url: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  <Connect>
    <Stream url="{stream_url}"></Stream>
  </Connect>
  <Pause length="40"/>
</Response>
"#
    )
}

async fn twiml_handler(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let public_url = state
        .config
        .gateway
        .as_ref()
        .and_then(|g| g.public_url.as_deref());
    let host = headers.get(header::HOST).and_then(|h| h.to_str().ok());

    match stream_url(public_url, host) {
        Some(url) => (
            [(header::CONTENT_TYPE, "application/xml")],
            twiml(&url),
        )
            .into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            "no public URL configured and no Host header",
        )
            .into_response(),
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> Response {
    match crate::metrics::prometheus_handle() {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_prefers_public_url() {
        assert_eq!(
            stream_url(Some("https://voice.example.com/"), Some("10.0.0.1:8765")).as_deref(),
            Some("wss://voice.example.com/ws")
        );
        assert_eq!(
            stream_url(Some("abc.ngrok.app"), None).as_deref(),
            Some("wss://abc.ngrok.app/ws")
        );
    }

    #[test]
    fn test_stream_url_falls_back_to_host() {
        assert_eq!(
            stream_url(Some(""), Some("localhost:8765")).as_deref(),
            Some("wss://localhost:8765/ws")
        );
        assert_eq!(stream_url(None, None), None);
    }

    #[test]
    fn test_twiml_connects_stream() {
        let body = twiml("wss://voice.example.com/ws");
        assert!(body.contains(r#"<Stream url="wss://voice.example.com/ws"></Stream>"#));
        assert!(body.starts_with("<?xml"));
        assert!(body.contains("<Connect>"));
    }
}
