//! WebSocket session endpoint
//!
//! `/app/{key}`: resolve the application key (404 before upgrading,
//! any Origin accepted), create the user, send the
//! `pusher:connection_established` handshake, then run the
//! per-connection loop until the peer goes away.
//!
//! One task owns both socket halves. Inbound frames are handled in
//! arrival order and protocol replies are written directly; fan-out
//! frames from publishers and the pub/sub receiver arrive on the hub's
//! outbound queue and are written in queue order. Any read or write error
//! tears the connection down, which purges the user from every channel
//! and releases its ID.

use std::ops::ControlFlow;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::auth;
use crate::pusher::{self, ClientEvent};
use crate::supervisor::Supervisor;

pub fn router() -> Router<Arc<Supervisor>> {
    Router::new().route("/app/{key}", get(establish_connection))
}

async fn establish_connection(
    Path(key): Path<String>,
    State(supervisor): State<Arc<Supervisor>>,
    ws: WebSocketUpgrade,
) -> Response {
    // Reject unknown keys before upgrading.
    let app = match supervisor.app_by_key(&key) {
        Ok(app) => app.name.clone(),
        Err(err) => return err.into_response(),
    };

    ws.on_upgrade(move |socket| run_connection(socket, supervisor, app))
        .into_response()
}

async fn run_connection(socket: WebSocket, supervisor: Arc<Supervisor>, app: String) {
    let user = match supervisor.add_user(&app).await {
        Ok(user) => user,
        Err(err) => {
            error!(app, error = %err, "user registration failed");
            return;
        }
    };
    let uid = user.uid;
    let socket_id = user.socket_id;
    let mut outbound = user.outbound;

    info!(app, uid, "new connection");

    let (mut ws_tx, mut ws_rx) = socket.split();

    match pusher::encode_connection_established(&socket_id) {
        Ok(hello) => {
            if ws_tx.send(Message::Text(hello.into())).await.is_err() {
                finish(&supervisor, &app, uid, "handshake write error").await;
                return;
            }
        }
        Err(err) => {
            error!(app, uid, error = %err, "handshake encoding error");
            finish(&supervisor, &app, uid, "handshake encoding error").await;
            return;
        }
    }

    let reason = loop {
        tokio::select! {
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if handle_frame(&supervisor, &app, uid, &socket_id, &mut ws_tx, text.as_str())
                        .await
                        .is_break()
                    {
                        break "protocol error";
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, text) = frame
                        .map(|f| (f.code, f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    info!(app, uid, code, reason = %text, "peer closed connection");
                    break "peer close";
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(app, uid, error = %err, "read error");
                    break "read error";
                }
                None => break "socket closed",
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        debug!(app, uid, "write error");
                        break "write error";
                    }
                }
                None => break "unregistered",
            },
        }
    };

    finish(&supervisor, &app, uid, reason).await;
}

/// Dispatch one inbound text frame. Break ends the connection.
async fn handle_frame(
    supervisor: &Supervisor,
    app: &str,
    uid: u32,
    socket_id: &str,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    raw: &str,
) -> ControlFlow<()> {
    debug!(app, uid, message = raw, "received");

    let event = match pusher::parse_client_event(raw) {
        Ok(event) => event,
        Err(err) => {
            debug!(app, uid, error = %err, "message decode error");
            return ControlFlow::Break(());
        }
    };

    match event.event.as_str() {
        pusher::PING => reply(ws_tx, pusher::PONG, "", &json!("ok")).await,

        pusher::SUBSCRIBE => {
            let Some(payload) = pusher::subscription_payload(&event.data) else {
                return reply_invalid(ws_tx, &event).await;
            };
            debug!(channel = %payload.channel, "subscribe request");

            if payload.channel.starts_with(pusher::PRIVATE_PREFIX) {
                let authorized = match (&payload.auth, supervisor.app(app)) {
                    (Some(auth), Ok(config)) => {
                        auth::verify(config, socket_id, &payload.channel, auth)
                    }
                    _ => false,
                };
                if !authorized {
                    debug!(app, uid, socket_id, "user unauthorized");
                    return reply(ws_tx, pusher::ERROR, "", &json!("unauthorized")).await;
                }
            }

            if let Err(err) = supervisor.subscribe(app, uid, &payload.channel).await {
                error!(app, uid, channel = %payload.channel, error = %err, "subscribe failed");
                return ControlFlow::Break(());
            }

            reply(
                ws_tx,
                pusher::SUBSCRIPTION_SUCCEEDED,
                &payload.channel,
                &json!("ok"),
            )
            .await
        }

        pusher::UNSUBSCRIBE => {
            let Some(payload) = pusher::subscription_payload(&event.data) else {
                return reply_invalid(ws_tx, &event).await;
            };
            debug!(channel = %payload.channel, "unsubscribe request");

            if let Err(err) = supervisor.unsubscribe(app, uid, &payload.channel).await {
                info!(app, uid, channel = %payload.channel, error = %err, "unsubscribe failed");
            }
            ControlFlow::Continue(())
        }

        _ => reply(ws_tx, pusher::ERROR, "", &json!("not implemented")).await,
    }
}

/// Write a protocol reply. Break on encoding or write failure.
async fn reply(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    event: &str,
    channel: &str,
    data: &Value,
) -> ControlFlow<()> {
    let frame = match pusher::encode_frame(event, channel, data) {
        Ok(frame) => frame,
        Err(err) => {
            error!(error = %err, "reply encoding error");
            return ControlFlow::Break(());
        }
    };
    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
        debug!("reply write error");
        return ControlFlow::Break(());
    }
    ControlFlow::Continue(())
}

async fn reply_invalid(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    event: &ClientEvent,
) -> ControlFlow<()> {
    debug!(event = %event.event, data = %event.data, "invalid event");
    reply(ws_tx, pusher::ERROR, "", &json!("unrecognized message")).await
}

/// Orderly teardown: log, then remove the user from membership. The
/// socket itself closes when the halves drop.
async fn finish(supervisor: &Supervisor, app: &str, uid: u32, reason: &str) {
    info!(app, uid, reason, "connection finished");
    if let Err(err) = supervisor.remove_user(app, uid).await {
        info!(app, uid, error = %err, "remove_user failed");
    }
}
