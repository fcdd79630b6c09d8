/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-call state machine. All inputs arrive as typed events from the
//! runtime's single actor loop: relay frames, user actions, media events.
//! No state lives inside transport callbacks.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::media::{MediaEvent, MediaFactory, MediaTransport};
use crate::runtime::CallEvent;
use xchat_protocol::{CallRecord, CallStatus, ClientFrame, SignalKind, SignalMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

type PendingCandidate = (String, Option<String>, Option<u16>);

pub struct CallSession {
    record: CallRecord,
    role: Role,
    self_id: String,
    factory: Arc<dyn MediaFactory>,
    transport: Option<Arc<dyn MediaTransport>>,
    media_tx: mpsc::Sender<MediaEvent>,
    out: mpsc::Sender<ClientFrame>,
    events: mpsc::Sender<CallEvent>,
    // Callee: offer held until the local user accepts.
    pending_offer: Option<String>,
    // Candidates held until a remote description is set.
    pending_candidates: Vec<PendingCandidate>,
    accepted_locally: bool,
    remote_description_set: bool,
    ended: bool,
}

impl CallSession {
    pub fn new(
        record: CallRecord,
        role: Role,
        factory: Arc<dyn MediaFactory>,
        media_tx: mpsc::Sender<MediaEvent>,
        out: mpsc::Sender<ClientFrame>,
        events: mpsc::Sender<CallEvent>,
    ) -> Self {
        let self_id = match role {
            Role::Caller => record.caller_id.clone(),
            Role::Callee => record.receiver_id.clone(),
        };
        Self {
            record,
            role,
            self_id,
            factory,
            transport: None,
            media_tx,
            out,
            events,
            pending_offer: None,
            pending_candidates: Vec::new(),
            accepted_locally: false,
            remote_description_set: false,
            ended: false,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.record.call_id
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Local user accepted the incoming call. The media probe runs before
    /// the accept frame goes out: a denied probe turns into a decline, the
    /// relay never sees an accepted call without media.
    pub async fn accept_local(&mut self) {
        if self.ended || self.role != Role::Callee {
            return;
        }
        if let Err(e) = self.factory.probe(self.record.is_video).await {
            warn!(call_id = %self.record.call_id, "media probe failed, declining: {e}");
            let _ = self
                .out
                .send(ClientFrame::Decline {
                    call_id: self.record.call_id.clone(),
                })
                .await;
            self.finish(CallStatus::Declined).await;
            return;
        }
        self.accepted_locally = true;
        let _ = self
            .out
            .send(ClientFrame::Accept {
                call_id: self.record.call_id.clone(),
            })
            .await;
        if self.pending_offer.is_some() {
            self.answer_pending_offer().await;
        }
    }

    /// Local user declined the incoming call. Only the callee can decline;
    /// a caller "declining" is a hang-up, and the relay would reject the
    /// decline frame anyway.
    pub async fn decline_local(&mut self) {
        if self.ended {
            return;
        }
        if self.role != Role::Callee {
            self.end_local().await;
            return;
        }
        let _ = self
            .out
            .send(ClientFrame::Decline {
                call_id: self.record.call_id.clone(),
            })
            .await;
        self.finish(CallStatus::Declined).await;
    }

    /// Local hang-up, transport failure, or setup failure: all land here.
    pub async fn end_local(&mut self) {
        if self.ended {
            return;
        }
        let _ = self
            .out
            .send(ClientFrame::End {
                call_id: self.record.call_id.clone(),
            })
            .await;
        self.finish(CallStatus::Ended).await;
    }

    /// Authoritative status observed from the relay.
    pub async fn handle_status(&mut self, status: CallStatus) {
        if self.ended {
            return;
        }
        match status {
            CallStatus::Accepted if self.role == Role::Caller && self.transport.is_none() => {
                self.start_offer().await;
            }
            s if s.is_terminal() => self.finish(s).await,
            _ => {}
        }
    }

    pub async fn handle_signal(&mut self, msg: SignalMessage) {
        if self.ended || msg.call_id != self.record.call_id {
            return;
        }
        match msg.kind {
            SignalKind::Offer => {
                let Some(sdp) = msg.sdp else {
                    warn!(call_id = %self.record.call_id, "offer without sdp dropped");
                    return;
                };
                self.pending_offer = Some(sdp);
                if self.accepted_locally {
                    self.answer_pending_offer().await;
                }
            }
            SignalKind::Answer => {
                let Some(sdp) = msg.sdp else {
                    warn!(call_id = %self.record.call_id, "answer without sdp dropped");
                    return;
                };
                let Some(transport) = self.transport.clone() else {
                    warn!(call_id = %self.record.call_id, "answer before offer dropped");
                    return;
                };
                if let Err(e) = transport.apply_answer(&sdp).await {
                    self.fail_setup(&format!("apply answer: {e}")).await;
                    return;
                }
                self.remote_description_set = true;
                self.flush_candidates().await;
            }
            SignalKind::Candidate => {
                let Some(candidate) = msg.candidate else { return };
                let pending = (candidate, msg.sdp_mid, msg.sdp_mline_index);
                if self.remote_description_set {
                    if let Some(transport) = self.transport.clone() {
                        if let Err(e) = transport
                            .add_remote_candidate(&pending.0, pending.1, pending.2)
                            .await
                        {
                            warn!(call_id = %self.record.call_id, "add candidate failed: {e}");
                        }
                        return;
                    }
                }
                self.pending_candidates.push(pending);
            }
        }
    }

    pub async fn handle_media(&mut self, ev: MediaEvent) {
        if self.ended {
            return;
        }
        match ev {
            MediaEvent::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let _ = self
                    .out
                    .send(ClientFrame::Signal(SignalMessage {
                        kind: SignalKind::Candidate,
                        call_id: self.record.call_id.clone(),
                        sender_id: self.self_id.clone(),
                        sdp: None,
                        candidate: Some(candidate),
                        sdp_mid,
                        sdp_mline_index,
                    }))
                    .await;
            }
            MediaEvent::Connected => {
                info!(call_id = %self.record.call_id, "media connected");
                let _ = self
                    .events
                    .send(CallEvent::Live {
                        call_id: self.record.call_id.clone(),
                    })
                    .await;
            }
            MediaEvent::Disconnected | MediaEvent::Failed => {
                warn!(call_id = %self.record.call_id, "media transport lost, ending call");
                self.end_local().await;
            }
        }
    }

    async fn start_offer(&mut self) {
        let transport = match self.ensure_transport().await {
            Ok(t) => t,
            Err(e) => {
                self.fail_setup(&format!("create transport: {e}")).await;
                return;
            }
        };
        let sdp = match transport.create_offer().await {
            Ok(v) => v,
            Err(e) => {
                self.fail_setup(&format!("create offer: {e}")).await;
                return;
            }
        };
        let _ = self
            .out
            .send(ClientFrame::Signal(SignalMessage {
                kind: SignalKind::Offer,
                call_id: self.record.call_id.clone(),
                sender_id: self.self_id.clone(),
                sdp: Some(sdp),
                candidate: None,
                sdp_mid: None,
                sdp_mline_index: None,
            }))
            .await;
    }

    async fn answer_pending_offer(&mut self) {
        let Some(offer) = self.pending_offer.take() else {
            return;
        };
        let transport = match self.ensure_transport().await {
            Ok(t) => t,
            Err(e) => {
                self.fail_setup(&format!("create transport: {e}")).await;
                return;
            }
        };
        let sdp = match transport.answer_offer(&offer).await {
            Ok(v) => v,
            Err(e) => {
                self.fail_setup(&format!("answer offer: {e}")).await;
                return;
            }
        };
        self.remote_description_set = true;
        let _ = self
            .out
            .send(ClientFrame::Signal(SignalMessage {
                kind: SignalKind::Answer,
                call_id: self.record.call_id.clone(),
                sender_id: self.self_id.clone(),
                sdp: Some(sdp),
                candidate: None,
                sdp_mid: None,
                sdp_mline_index: None,
            }))
            .await;
        self.flush_candidates().await;
    }

    async fn ensure_transport(&mut self) -> Result<Arc<dyn MediaTransport>, crate::media::MediaError> {
        if let Some(t) = &self.transport {
            return Ok(t.clone());
        }
        let t = self
            .factory
            .create(self.record.is_video, self.media_tx.clone())
            .await?;
        self.transport = Some(t.clone());
        Ok(t)
    }

    async fn flush_candidates(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        for (candidate, sdp_mid, sdp_mline_index) in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = transport
                .add_remote_candidate(&candidate, sdp_mid, sdp_mline_index)
                .await
            {
                warn!(call_id = %self.record.call_id, "add buffered candidate failed: {e}");
            }
        }
    }

    async fn fail_setup(&mut self, what: &str) {
        warn!(call_id = %self.record.call_id, "setup failure, ending call: {what}");
        self.end_local().await;
    }

    /// Exactly-once local cleanup, regardless of which path got here first.
    async fn finish(&mut self, status: CallStatus) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.pending_offer = None;
        self.pending_candidates.clear();
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        let _ = self
            .events
            .send(CallEvent::Closed {
                call_id: self.record.call_id.clone(),
                status,
            })
            .await;
    }
}
