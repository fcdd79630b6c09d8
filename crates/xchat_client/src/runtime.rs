/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Relay connection runtime: one actor loop multiplexing the websocket, user
//! commands, and media events into the active call session. Socket drops
//! reconnect with backoff and never touch call state directly; the relay's
//! authoritative status resyncs via a watch frame after reconnect.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{error, info, warn};

use crate::media::{MediaEvent, MediaFactory};
use crate::session::{CallSession, Role};
use crate::ClientConfig;
use xchat_protocol::{CallRecord, CallStatus, ClientFrame, ErrorCode, ServerFrame};

/// User actions, fed from the app (or the dev binary's stdin loop).
#[derive(Debug, Clone)]
pub enum Command {
    Call { receiver_id: String, is_video: bool },
    Accept,
    Decline,
    End,
}

/// What the app observes.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Incoming(CallRecord),
    Started(CallRecord),
    StatusChanged { call_id: String, status: CallStatus },
    /// Media connected; start the in-call timer.
    Live { call_id: String },
    Busy { message: String },
    /// Local capability check refused the call before anything was sent.
    Denied { message: String },
    Closed { call_id: String, status: CallStatus },
    Error { code: ErrorCode, message: String },
}

enum LoopExit {
    Shutdown,
    Reconnect,
}

pub async fn run(
    cfg: ClientConfig,
    factory: Arc<dyn MediaFactory>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<CallEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff_secs = 1u64;
    let mut active: Option<CallSession> = None;

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        let token = cfg.token.as_deref().unwrap_or_default();
        let url = format!(
            "{}/ws/{}?token={}",
            cfg.relay_ws_url,
            cfg.user_id,
            urlencoding::encode(token)
        );
        info!(user = %cfg.user_id, "connecting to relay");

        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws, _)) => {
                backoff_secs = 1;
                match run_connection(
                    &cfg,
                    &factory,
                    ws,
                    &mut commands,
                    &events,
                    &mut shutdown,
                    &mut active,
                )
                .await
                {
                    Ok(LoopExit::Shutdown) => return Ok(()),
                    Ok(LoopExit::Reconnect) => {}
                    Err(e) => warn!("relay session error: {e:#}"),
                }
            }
            Err(e) => warn!("relay connect failed: {e}"),
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
        }
        backoff_secs = (backoff_secs * 2).min(30);
    }
}

async fn run_connection(
    cfg: &ClientConfig,
    factory: &Arc<dyn MediaFactory>,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    commands: &mut mpsc::Receiver<Command>,
    events: &mpsc::Sender<CallEvent>,
    shutdown: &mut watch::Receiver<bool>,
    active: &mut Option<CallSession>,
) -> Result<LoopExit> {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(64);
    let (media_tx, mut media_rx) = mpsc::channel::<MediaEvent>(64);

    // A call that survived a socket drop: ask the relay where it stands now.
    // The relay's disconnect detection may already have ended it.
    if let Some(session) = active.as_ref() {
        let _ = out_tx
            .send(ClientFrame::Watch {
                call_id: session.call_id().to_string(),
            })
            .await;
    }

    let mut ping = tokio::time::interval(Duration::from_secs(5));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    if let Some(mut session) = active.take() {
                        session.end_local().await;
                        drain_out(&mut out_rx, &mut ws_tx).await;
                    }
                    return Ok(LoopExit::Shutdown);
                }
            }
            _ = ping.tick() => {
                let now_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                if ws_tx.send(tungstenite::Message::Ping(now_ms.to_be_bytes().to_vec())).await.is_err() {
                    return Ok(LoopExit::Reconnect);
                }
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else { return Ok(LoopExit::Reconnect) };
                let json = serde_json::to_string(&frame)?;
                if ws_tx.send(tungstenite::Message::Text(json)).await.is_err() {
                    return Ok(LoopExit::Reconnect);
                }
            }
            ev = media_rx.recv() => {
                let Some(ev) = ev else { continue };
                if let Some(session) = active.as_mut() {
                    session.handle_media(ev).await;
                    if session.is_ended() {
                        *active = None;
                    }
                }
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    // App dropped the command channel: orderly shutdown.
                    if let Some(mut session) = active.take() {
                        session.end_local().await;
                        drain_out(&mut out_rx, &mut ws_tx).await;
                    }
                    return Ok(LoopExit::Shutdown);
                };
                handle_command(cfg, factory, cmd, &out_tx, events, active).await;
                if active.as_ref().is_some_and(|s| s.is_ended()) {
                    *active = None;
                }
            }
            msg = ws_rx.next() => {
                let Some(msg) = msg else { return Ok(LoopExit::Reconnect) };
                let msg = match msg {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("relay socket error: {e}");
                        return Ok(LoopExit::Reconnect);
                    }
                };
                let text = match msg {
                    tungstenite::Message::Text(t) => t,
                    tungstenite::Message::Ping(p) => {
                        let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                        continue;
                    }
                    tungstenite::Message::Close(_) => return Ok(LoopExit::Reconnect),
                    _ => continue,
                };
                let frame: ServerFrame = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("bad server frame: {e}");
                        continue;
                    }
                };
                handle_server_frame(factory, frame, &out_tx, &media_tx, events, active).await;
                if active.as_ref().is_some_and(|s| s.is_ended()) {
                    *active = None;
                }
            }
        }
    }
}

async fn handle_command(
    cfg: &ClientConfig,
    factory: &Arc<dyn MediaFactory>,
    cmd: Command,
    out: &mpsc::Sender<ClientFrame>,
    events: &mpsc::Sender<CallEvent>,
    active: &mut Option<CallSession>,
) {
    match cmd {
        Command::Call { receiver_id, is_video } => {
            if active.is_some() {
                let _ = events
                    .send(CallEvent::Busy {
                        message: "already in a call".into(),
                    })
                    .await;
                return;
            }
            // Probe before the relay sees anything: a denied capability
            // check leaves no call record behind.
            if let Err(e) = factory.probe(is_video).await {
                warn!(user = %cfg.user_id, "media probe refused call: {e}");
                let _ = events.send(CallEvent::Denied { message: e.to_string() }).await;
                return;
            }
            let _ = out
                .send(ClientFrame::Initiate { receiver_id, is_video })
                .await;
        }
        Command::Accept => match active.as_mut() {
            Some(session) => session.accept_local().await,
            None => warn!("accept ignored: no ringing call"),
        },
        Command::Decline => match active.as_mut() {
            Some(session) => session.decline_local().await,
            None => warn!("decline ignored: no ringing call"),
        },
        Command::End => match active.as_mut() {
            Some(session) => session.end_local().await,
            None => warn!("end ignored: no active call"),
        },
    }
}

async fn handle_server_frame(
    factory: &Arc<dyn MediaFactory>,
    frame: ServerFrame,
    out: &mpsc::Sender<ClientFrame>,
    media_tx: &mpsc::Sender<MediaEvent>,
    events: &mpsc::Sender<CallEvent>,
    active: &mut Option<CallSession>,
) {
    match frame {
        ServerFrame::CallStarted { call } => {
            if active.is_some() {
                warn!(call_id = %call.call_id, "call started while another is active, ignoring");
                return;
            }
            *active = Some(CallSession::new(
                call.clone(),
                Role::Caller,
                factory.clone(),
                media_tx.clone(),
                out.clone(),
                events.clone(),
            ));
            let _ = events.send(CallEvent::Started(call)).await;
        }
        ServerFrame::IncomingCall { call } => {
            if active.is_some() {
                // The relay's availability gate makes this unreachable in
                // practice; drop rather than hijack the live call.
                warn!(call_id = %call.call_id, "incoming call while busy, ignoring");
                return;
            }
            *active = Some(CallSession::new(
                call.clone(),
                Role::Callee,
                factory.clone(),
                media_tx.clone(),
                out.clone(),
                events.clone(),
            ));
            let _ = events.send(CallEvent::Incoming(call)).await;
        }
        ServerFrame::Signal(msg) => {
            match active.as_mut() {
                Some(session) if session.call_id() == msg.call_id => {
                    session.handle_signal(msg).await;
                }
                _ => warn!(call_id = %msg.call_id, "signal for inactive call dropped"),
            }
        }
        ServerFrame::CallStatus { call_id, status } => {
            let _ = events
                .send(CallEvent::StatusChanged {
                    call_id: call_id.clone(),
                    status,
                })
                .await;
            if let Some(session) = active.as_mut() {
                if session.call_id() == call_id {
                    session.handle_status(status).await;
                }
            }
        }
        ServerFrame::Error { code, message, call_id } => {
            warn!(?code, ?call_id, "relay error: {message}");
            // The relay has no memory of this call (its terminal record may
            // already be pruned after a long disconnect): the session is
            // dead, close it locally so the slot frees up.
            if code == ErrorCode::UnknownCall {
                if let Some(session) = active.as_mut() {
                    if call_id.as_deref() == Some(session.call_id()) {
                        session.handle_status(CallStatus::Ended).await;
                    }
                }
            }
            match code {
                ErrorCode::UserBusy => {
                    let _ = events.send(CallEvent::Busy { message }).await;
                }
                _ => {
                    let _ = events.send(CallEvent::Error { code, message }).await;
                }
            }
        }
    }
}

/// Flush frames the closing session queued (End, at most a couple more)
/// before the socket drops.
async fn drain_out<S>(out_rx: &mut mpsc::Receiver<ClientFrame>, ws_tx: &mut S)
where
    S: SinkExt<tungstenite::Message> + Unpin,
{
    while let Ok(frame) = out_rx.try_recv() {
        let Ok(json) = serde_json::to_string(&frame) else { continue };
        if ws_tx.send(tungstenite::Message::Text(json)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaError, MediaTransport};
    use async_trait::async_trait;

    struct NullFactory;

    #[async_trait]
    impl MediaFactory for NullFactory {
        async fn probe(&self, _is_video: bool) -> Result<(), MediaError> {
            Ok(())
        }
        async fn create(
            &self,
            _is_video: bool,
            _events: mpsc::Sender<MediaEvent>,
        ) -> Result<Arc<dyn MediaTransport>, MediaError> {
            Err(MediaError::Setup("no media in tests".into()))
        }
    }

    struct Rig {
        factory: Arc<dyn MediaFactory>,
        out_tx: mpsc::Sender<ClientFrame>,
        out_rx: mpsc::Receiver<ClientFrame>,
        media_tx: mpsc::Sender<MediaEvent>,
        ev_tx: mpsc::Sender<CallEvent>,
        ev_rx: mpsc::Receiver<CallEvent>,
        active: Option<CallSession>,
    }

    fn rig_with_caller_session() -> Rig {
        let factory: Arc<dyn MediaFactory> = Arc::new(NullFactory);
        let (out_tx, out_rx) = mpsc::channel(32);
        let (media_tx, _media_rx) = mpsc::channel(8);
        let (ev_tx, ev_rx) = mpsc::channel(32);
        let record = CallRecord {
            call_id: "c1".into(),
            caller_id: "alice".into(),
            receiver_id: "bob".into(),
            is_video: false,
            status: CallStatus::Ringing,
            timestamp_ms: 0,
        };
        let active = Some(CallSession::new(
            record,
            Role::Caller,
            factory.clone(),
            media_tx.clone(),
            out_tx.clone(),
            ev_tx.clone(),
        ));
        Rig {
            factory,
            out_tx,
            out_rx,
            media_tx,
            ev_tx,
            ev_rx,
            active,
        }
    }

    fn unknown_call_error(call_id: &str) -> ServerFrame {
        ServerFrame::Error {
            code: ErrorCode::UnknownCall,
            message: "unknown call id".into(),
            call_id: Some(call_id.into()),
        }
    }

    #[tokio::test]
    async fn unknown_call_error_closes_the_active_session() {
        let mut r = rig_with_caller_session();

        // An unknown-call error for some other id leaves the session alone.
        handle_server_frame(
            &r.factory,
            unknown_call_error("other"),
            &r.out_tx,
            &r.media_tx,
            &r.ev_tx,
            &mut r.active,
        )
        .await;
        assert!(r.active.as_ref().is_some_and(|s| !s.is_ended()));
        match r.ev_rx.try_recv().unwrap() {
            CallEvent::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownCall),
            other => panic!("unexpected event: {other:?}"),
        }

        // A watch resync answered with unknown-call for the live id: the
        // session closes as ended, with no End frame back to the relay.
        handle_server_frame(
            &r.factory,
            unknown_call_error("c1"),
            &r.out_tx,
            &r.media_tx,
            &r.ev_tx,
            &mut r.active,
        )
        .await;
        assert!(r.active.as_ref().is_some_and(|s| s.is_ended()));
        match r.ev_rx.try_recv().unwrap() {
            CallEvent::Closed { call_id, status } => {
                assert_eq!(call_id, "c1");
                assert_eq!(status, CallStatus::Ended);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match r.ev_rx.try_recv().unwrap() {
            CallEvent::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownCall),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(r.out_rx.try_recv().is_err());
    }
}
