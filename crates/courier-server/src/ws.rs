//! WebSocket connection lifecycle.
//!
//! Admission happens before any frame flows: the credential from the query
//! string is verified, the connection is registered for its subject, and the
//! subject's bus subscription is attached. A failed credential closes the
//! socket with 1008 after the upgrade completes; a failed subscription closes
//! with 1011. Teardown always unregisters the connection and aborts the bus
//! forwarder, whichever side closed first.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use courier_core::error::RelayError;
use courier_core::limiter::budgets;
use courier_core::registry::ConnectionHandle;

use crate::metrics::{self, ConnectionMetricsGuard};
use crate::routes::AppState;

/// RFC 6455 close codes used at admission.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    token: String,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let admitted = state.gate.authenticate(&query.token).await;
    ws.on_upgrade(move |socket| async move {
        match admitted {
            Ok(subject) => handle_socket(socket, subject, state).await,
            Err(_) => {
                metrics::record_auth_failure();
                close_with(socket, CLOSE_POLICY_VIOLATION, "Authentication failed").await;
            }
        }
    })
}

async fn handle_socket(socket: WebSocket, subject: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (handle, mut outbound) = ConnectionHandle::new();
    let connection_id = handle.id().clone();
    state.registry.add(&subject, handle);

    // The attachment must exist before the client can observe the connection
    // as open, or cross-process events would race past it.
    let forwarder = match state.bridge.attach(&subject).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            warn!(subject = %subject, error = %e, "Bus subscription failed, refusing connection");
            metrics::record_error("subscribe");
            state.registry.remove(&subject, &connection_id);
            close_with(socket, CLOSE_INTERNAL_ERROR, "Subscription failed").await;
            return;
        }
    };

    debug!(subject = %subject, connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // Frames queued by the registry (local fan-out or bus forwarder).
            Some(frame) = outbound.recv() => {
                if sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Coarse per-frame throttle ahead of the per-kind budgets.
                        if let Err(RelayError::RateLimited { retry_after }) = state
                            .limiter
                            .allow(&subject, "ws:recv", budgets::RECEIVE)
                            .await
                        {
                            debug!(subject = %subject, retry_after = retry_after, "Receive throttle hit");
                            metrics::record_rate_limited();
                            continue;
                        }

                        let start = Instant::now();
                        match state.router.dispatch(&subject, &text).await {
                            Ok(action) => metrics::record_event(action),
                            Err(RelayError::RateLimited { retry_after }) => {
                                // The frame is dropped; the connection stays up.
                                debug!(subject = %subject, retry_after = retry_after, "Inbound event rate limited");
                                metrics::record_rate_limited();
                            }
                            Err(e) => {
                                warn!(subject = %subject, error = %e, "Dispatch failed");
                                metrics::record_error("dispatch");
                            }
                        }
                        metrics::record_dispatch_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(subject = %subject, "Binary frame ignored");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(subject = %subject, connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(subject = %subject, connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    forwarder.abort();
    let _ = forwarder.await;
    state.registry.remove(&subject, &connection_id);

    debug!(subject = %subject, connection = %connection_id, "WebSocket disconnected");
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}
