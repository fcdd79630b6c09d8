/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn};

use xchat_protocol::{ClientFrame, ErrorCode, ServerFrame};

mod coordinator;
mod presence;
mod signal;
mod store;

use coordinator::{CallError, Coordinator, WatchOutcome};
use presence::PresenceStore;
use signal::SignalRelay;
use store::CallStore;

#[derive(Clone)]
struct RelayConfig {
    bind: SocketAddr,
    auth_token: Option<String>,
    ring_timeout_secs: u64,
    signal_queue_cap: usize,
    call_ttl_secs: u64,
    cleanup_interval_secs: u64,
}

#[derive(Clone)]
struct AppState {
    coordinator: Coordinator,
    store: CallStore,
    cfg: RelayConfig,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cfg = load_config();
    let db_path = std::env::var("XCHAT_RELAY_DB").unwrap_or_else(|_| "xchat_relay.db".to_string());
    let store = CallStore::open(PathBuf::from(db_path)).expect("db init");

    let presence = PresenceStore::new();
    let signals = Arc::new(SignalRelay::new(presence.clone(), cfg.signal_queue_cap));
    let coordinator = Coordinator::new(
        presence,
        signals,
        store.clone(),
        Duration::from_secs(cfg.ring_timeout_secs),
    );

    let state = AppState {
        coordinator,
        store,
        cfg,
    };

    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(
            cleanup_state.cfg.cleanup_interval_secs.max(10),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ttl = cleanup_state.cfg.call_ttl_secs;
        loop {
            interval.tick().await;
            match cleanup_state.store.cleanup_terminal(ttl).await {
                Ok(0) => {}
                Ok(n) => info!("archived {n} terminal call rows"),
                Err(e) => error!("call cleanup failed: {e:#}"),
            }
            cleanup_state.coordinator.prune_terminal(ttl).await;
        }
    });

    let addr = state.cfg.bind;
    let app = Router::new()
        .route("/ws/:user", get(call_ws))
        .route("/users/:user/call_logs", get(call_logs))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let request_id = req
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("req");
                info_span!(
                    "http",
                    method = %req.method(),
                    uri = %req.uri(),
                    request_id = %request_id
                )
            }),
        )
        .with_state(state);

    info!("xchat_relay listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app.into_make_service())
        .await
        .unwrap();
}

fn load_config() -> RelayConfig {
    let bind = std::env::var("XCHAT_RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:8989".to_string());
    let bind: SocketAddr = bind.parse().expect("XCHAT_RELAY_BIND invalid");
    let auth_token = std::env::var("XCHAT_RELAY_AUTH_TOKEN")
        .ok()
        .filter(|s| !s.is_empty());
    let ring_timeout_secs = std::env::var("XCHAT_RELAY_RING_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let signal_queue_cap = std::env::var("XCHAT_RELAY_SIGNAL_QUEUE_CAP")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    let call_ttl_secs = std::env::var("XCHAT_RELAY_CALL_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(24 * 3600);
    let cleanup_interval_secs = std::env::var("XCHAT_RELAY_CLEANUP_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(300);
    RelayConfig {
        bind,
        auth_token,
        ring_timeout_secs,
        signal_queue_cap,
        call_ttl_secs,
        cleanup_interval_secs,
    }
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.call("readyz-probe").await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => {
            error!("readyz probe failed: {e:#}");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_logs_limit")]
    limit: u32,
}

fn default_logs_limit() -> u32 {
    50
}

async fn call_logs(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Response {
    match state.store.list_logs(&user, q.limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(e) => {
            error!(%user, "list call logs failed: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn call_ws(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, user, q.token, socket))
}

async fn handle_socket(state: AppState, user: String, token: Option<String>, socket: WebSocket) {
    if user.is_empty() {
        error!("session rejected: empty user id");
        return;
    }
    if let Some(expected) = state.cfg.auth_token.as_deref() {
        if token.as_deref() != Some(expected) {
            error!(%user, "session rejected: bad token");
            return;
        }
    }

    info!(%user, "session connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(64);

    let user_writer = user.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(e) => {
                    error!(%user_writer, "serialize frame failed: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // The writer is already draining, so the register flush cannot stall on
    // a full channel; queued signals reach the socket ahead of live traffic.
    state.coordinator.register(&user, tx.clone()).await;

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(%user, "bad client frame: {e}");
                send_error(&tx, ErrorCode::BadRequest, "malformed frame", None).await;
                continue;
            }
        };
        dispatch(&state, &user, &tx, frame).await;
    }

    // Teardown in this order: drop the handle first so disconnect detection
    // sees the user offline, then let the coordinator end any live call.
    // The writer is aborted rather than joined: a watch forwarder may still
    // hold a sender clone, and the socket is gone anyway.
    state.coordinator.unregister(&user, &tx).await;
    drop(tx);
    writer.abort();
    info!(%user, "session disconnected");
}

async fn dispatch(state: &AppState, user: &str, tx: &mpsc::Sender<ServerFrame>, frame: ClientFrame) {
    match frame {
        ClientFrame::Initiate { receiver_id, is_video } => {
            match state.coordinator.initiate(user, &receiver_id, is_video).await {
                Ok(call) => {
                    let _ = tx.send(ServerFrame::CallStarted { call }).await;
                }
                Err(e) => send_call_error(tx, e, None).await,
            }
        }
        ClientFrame::Accept { call_id } => {
            if let Err(e) = state.coordinator.accept(&call_id, user).await {
                send_call_error(tx, e, Some(call_id)).await;
            }
        }
        ClientFrame::Decline { call_id } => {
            if let Err(e) = state.coordinator.decline(&call_id, user).await {
                send_call_error(tx, e, Some(call_id)).await;
            }
        }
        ClientFrame::End { call_id } => {
            if let Err(e) = state.coordinator.end(&call_id, user).await {
                send_call_error(tx, e, Some(call_id)).await;
            }
        }
        ClientFrame::Signal(mut msg) => {
            // The connection is the identity; never trust a client-supplied
            // sender id.
            msg.sender_id = user.to_string();
            state.coordinator.signal(msg).await;
        }
        ClientFrame::Watch { call_id } => match state.coordinator.watch(&call_id).await {
            WatchOutcome::Live(mut rx) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        let status = *rx.borrow_and_update();
                        if tx
                            .send(ServerFrame::CallStatus {
                                call_id: call_id.clone(),
                                status,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                        if status.is_terminal() || rx.changed().await.is_err() {
                            return;
                        }
                    }
                });
            }
            WatchOutcome::Finished(status) => {
                let _ = tx.send(ServerFrame::CallStatus { call_id, status }).await;
            }
            WatchOutcome::Unknown => {
                send_error(tx, ErrorCode::UnknownCall, "unknown call id", Some(call_id)).await;
            }
        },
    }
}

async fn send_call_error(tx: &mpsc::Sender<ServerFrame>, err: CallError, call_id: Option<String>) {
    let code = match err {
        CallError::UserBusy => ErrorCode::UserBusy,
        CallError::UnknownCall => ErrorCode::UnknownCall,
        CallError::NotParticipant => ErrorCode::NotParticipant,
        CallError::SelfCall | CallError::InvalidTransition(_) => ErrorCode::BadRequest,
    };
    send_error(tx, code, &err.to_string(), call_id).await;
}

async fn send_error(
    tx: &mpsc::Sender<ServerFrame>,
    code: ErrorCode,
    message: &str,
    call_id: Option<String>,
) {
    let _ = tx
        .send(ServerFrame::Error {
            code,
            message: message.to_string(),
            call_id,
        })
        .await;
}
