//! Connection handlers for Parley server.
//!
//! Credentials are checked on the HTTP upgrade request, so a rejected
//! client gets a plain HTTP error and never reaches the WebSocket loop.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    ConnectError, ConnectionManager, Dispatched, Outbox, PendingConnection, Session,
};
use parley_protocol::codec::{self, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
use parley_protocol::{
    codes, ClientEvent, Encoded, Encoding, FrameReader, ProtocolError, ServerEvent, Version,
    PROTOCOL_VERSION,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Connection lifecycle, presence, and relays.
    pub manager: Arc<ConnectionManager>,
    /// Server configuration.
    pub config: Config,
    encoding: Encoding,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if no auth secret is configured or the default
    /// encoding is unknown.
    pub fn new(config: Config) -> Result<Self> {
        let gate = config.auth_gate()?;
        let encoding = config.encoding()?;
        let manager = ConnectionManager::with_config(gate, config.manager_config());

        Ok(Self {
            manager: Arc::new(manager),
            config,
            encoding,
        })
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let websocket_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.manager.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "online": stats.online_users,
    }))
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Credential; falls back to `Authorization: Bearer`.
    pub token: Option<String>,
    /// Outbound encoding (`json` or `msgpack`).
    pub encoding: Option<String>,
    /// Client protocol version, `major.minor`.
    pub version: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(raw) = params.version.as_deref() {
        match Version::parse(raw) {
            Some(version) if version.is_compatible_with(&PROTOCOL_VERSION) => {}
            _ => {
                metrics::record_rejection("unsupported version");
                return reject(StatusCode::BAD_REQUEST, "unsupported protocol version");
            }
        }
    }

    let encoding = match params.encoding.as_deref().map(str::parse::<Encoding>) {
        None => state.encoding,
        Some(Ok(encoding)) => encoding,
        Some(Err(_)) => {
            metrics::record_rejection("unsupported encoding");
            return reject(StatusCode::BAD_REQUEST, "unsupported encoding");
        }
    };

    let token = params.token.or_else(|| bearer_token(&headers));
    let pending = match state.manager.authorize(token.as_deref()) {
        Ok(pending) => pending,
        Err(err) => {
            metrics::record_rejection(err.reason());
            let status = match err {
                ConnectError::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
                ConnectError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            };
            return reject(status, err.reason());
        }
    };

    // Oversized messages are answered in-band, so only the frame ceiling
    // is enforced by the transport.
    ws.max_message_size(MAX_FRAME_SIZE + LENGTH_PREFIX_SIZE)
        .on_upgrade(move |socket| handle_websocket(socket, pending, encoding, state))
}

fn reject(status: StatusCode, reason: &str) -> Response {
    (status, Json(serde_json::json!({ "error": reason }))).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    pending: PendingConnection,
    encoding: Encoding,
    state: Arc<AppState>,
) {
    let Some(connection_id) = pending.id().cloned() else {
        return;
    };

    let (outbox, mut outbound) = Outbox::channel(connection_id.clone());
    let (session, mut presence) = match pending.establish(outbox) {
        Ok(established) => established,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to establish session");
            return;
        }
    };

    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    metrics::set_online_users(state.manager.registry().len());

    debug!(connection = %connection_id, user = %session.user_id(), "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // MessagePack frames may span several binary messages
    let max_message_size = state.config.limits.max_message_size;
    let mut frames = FrameReader::new(max_message_size);

    loop {
        tokio::select! {
            biased;

            // Direct events: connected, relayed messages, acks, signals, errors
            Some(event) = outbound.recv() => {
                let superseded = matches!(event, ServerEvent::SessionSuperseded { .. });
                if send_event(&mut sender, &event, encoding).await.is_err() {
                    break;
                }
                if superseded {
                    info!(connection = %connection_id, "Session superseded by a newer connection");
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: "session superseded".into(),
                        })))
                        .await;
                    break;
                }
            }

            // Presence changes of other users
            Some(event) = presence.next() => {
                if send_event(&mut sender, &event, encoding).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_bytes(text.len(), "inbound");

                        if text.len() > max_message_size {
                            reject_oversized(&session, text.len(), max_message_size);
                            continue;
                        }

                        match codec::from_json::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&session, event),
                            Err(e) => reject_malformed(&session, &e),
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_bytes(data.len(), "inbound");

                        frames.extend(&data);
                        loop {
                            match frames.next_frame::<ClientEvent>() {
                                Ok(Some(event)) => dispatch(&session, event),
                                Ok(None) => break,
                                Err(ProtocolError::FrameTooLarge(size, limit)) => {
                                    reject_oversized(&session, size, limit);
                                }
                                Err(e) => reject_malformed(&session, &e),
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    session.close();
    metrics::set_online_users(state.manager.registry().len());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Route a decoded event and record the outcome.
fn dispatch(session: &Session, event: ClientEvent) {
    match session.handle(event) {
        Ok(Dispatched::Message(outcome)) => metrics::record_relay(outcome.delivered),
        Ok(Dispatched::Signal { kind, delivered }) => {
            metrics::record_signal(kind.event_name(), delivered);
        }
        Ok(Dispatched::Pong) => {}
        Err(_) => metrics::record_error("invalid_event"),
    }
}

fn reject_malformed(session: &Session, error: &ProtocolError) {
    warn!(connection = %session.id(), error = %error, "Malformed event");
    metrics::record_error("malformed_event");
    session.report_error(codes::MALFORMED_EVENT, error.to_string());
}

fn reject_oversized(session: &Session, size: usize, limit: usize) {
    warn!(connection = %session.id(), size, limit, "Message too large");
    metrics::record_error("message_too_large");
    session.report_error(
        codes::MESSAGE_TOO_LARGE,
        format!("message of {size} bytes exceeds limit of {limit}"),
    );
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    encoding: Encoding,
) -> Result<()> {
    let encoded = codec::encode_as(event, encoding)?;
    metrics::record_bytes(encoded.len(), "outbound");
    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}
