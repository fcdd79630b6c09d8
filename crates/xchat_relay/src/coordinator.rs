/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::presence::{ConnHandle, PresenceStore};
use crate::signal::SignalRelay;
use crate::store::{now_ms, CallStore};
use xchat_protocol::{
    CallLogEntry, CallLogKind, CallRecord, CallStatus, PresenceStatus, ServerFrame, SignalMessage,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("user is busy")]
    UserBusy,
    #[error("caller and receiver must differ")]
    SelfCall,
    #[error("unknown call id")]
    UnknownCall,
    #[error("not a participant of this call")]
    NotParticipant,
    #[error("{0}")]
    InvalidTransition(&'static str),
}

struct ActiveCall {
    record: CallRecord,
    accepted_at_ms: Option<i64>,
    ring_cancel: CancellationToken,
    status_tx: watch::Sender<CallStatus>,
}

#[derive(Default)]
struct Inner {
    calls: HashMap<String, ActiveCall>,
    // Terminal statuses linger here so a late signal classifies as stale
    // rather than unknown; pruned by the maintenance loop.
    terminal: HashMap<String, (CallStatus, i64)>,
}

pub enum WatchOutcome {
    Live(watch::Receiver<CallStatus>),
    Finished(CallStatus),
    Unknown,
}

/// Owns every call-state transition. All guards run under one async mutex so
/// "both parties available" is checked and the `in_call` flags set atomically
/// with respect to concurrent initiates; presence flags are never written by
/// anything else.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Mutex<Inner>>,
    presence: PresenceStore,
    signals: Arc<SignalRelay>,
    store: CallStore,
    ring_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        presence: PresenceStore,
        signals: Arc<SignalRelay>,
        store: CallStore,
        ring_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            presence,
            signals,
            store,
            ring_timeout,
        }
    }

    pub fn presence(&self) -> &PresenceStore {
        &self.presence
    }

    /// Session start. The presence flag resets to `available` only when no
    /// live call names this user; a reconnect mid-call keeps the busy flag,
    /// so the self-healing reset never opens a second call. Both writes run
    /// under the call-table lock, atomically with any concurrent initiate.
    /// Queued signals then flush in FIFO order, dropping dead calls.
    pub async fn register(&self, user_id: &str, sender: ConnHandle) {
        let live_ids: HashSet<String> = {
            let inner = self.inner.lock().await;
            self.presence.register(user_id, sender).await;
            if inner
                .calls
                .values()
                .any(|c| c.record.is_participant(user_id))
            {
                self.presence.set_call_status(user_id, PresenceStatus::InCall).await;
            }
            inner.calls.keys().cloned().collect()
        };
        self.signals
            .flush(user_id, |call_id| live_ids.contains(call_id))
            .await;
    }

    /// Connection teardown. Returns once disconnect detection has run; any
    /// live call this user participates in takes the End transition
    /// immediately (no grace period, matching the reference behavior).
    pub async fn unregister(&self, user_id: &str, sender: &ConnHandle) {
        if !self.presence.unregister(user_id, sender).await {
            // A newer session already replaced this handle; its calls are
            // not ours to end.
            return;
        }
        self.handle_disconnect(user_id).await;
    }

    pub async fn initiate(
        &self,
        caller_id: &str,
        receiver_id: &str,
        is_video: bool,
    ) -> Result<CallRecord, CallError> {
        if caller_id == receiver_id {
            return Err(CallError::SelfCall);
        }

        let record = {
            let mut inner = self.inner.lock().await;
            if self.presence.call_status(caller_id).await != PresenceStatus::Available
                || self.presence.call_status(receiver_id).await != PresenceStatus::Available
            {
                return Err(CallError::UserBusy);
            }

            let record = CallRecord {
                call_id: random_call_id(),
                caller_id: caller_id.to_string(),
                receiver_id: receiver_id.to_string(),
                is_video,
                status: CallStatus::Ringing,
                timestamp_ms: now_ms(),
            };
            let (status_tx, _) = watch::channel(CallStatus::Ringing);
            let ring_cancel = CancellationToken::new();
            inner.calls.insert(
                record.call_id.clone(),
                ActiveCall {
                    record: record.clone(),
                    accepted_at_ms: None,
                    ring_cancel: ring_cancel.clone(),
                    status_tx,
                },
            );
            self.presence.set_call_status(caller_id, PresenceStatus::InCall).await;
            self.presence.set_call_status(receiver_id, PresenceStatus::InCall).await;

            self.spawn_ring_timer(record.call_id.clone(), ring_cancel);
            record
        };

        if let Err(e) = self.store.put_call(&record).await {
            error!(call_id = %record.call_id, "persist call failed: {e:#}");
        }
        // Best-effort: an offline receiver simply never rings and the call
        // times out into a missed call.
        self.presence
            .send(receiver_id, ServerFrame::IncomingCall { call: record.clone() })
            .await;

        info!(call_id = %record.call_id, caller = %caller_id, receiver = %receiver_id, is_video, "call ringing");
        Ok(record)
    }

    /// Receiver accepts a ringing call; cancels the ringing timer and marks
    /// the point the call duration is measured from.
    pub async fn accept(&self, call_id: &str, user_id: &str) -> Result<(), CallError> {
        let record = {
            let mut inner = self.inner.lock().await;
            let call = inner.calls.get_mut(call_id).ok_or(CallError::UnknownCall)?;
            if call.record.receiver_id != user_id {
                return Err(CallError::NotParticipant);
            }
            if call.record.status != CallStatus::Ringing {
                return Err(CallError::InvalidTransition("accept is only valid while ringing"));
            }
            call.record.status = CallStatus::Accepted;
            call.accepted_at_ms = Some(now_ms());
            call.ring_cancel.cancel();
            let _ = call.status_tx.send(CallStatus::Accepted);
            call.record.clone()
        };

        if let Err(e) = self.store.set_status(call_id, CallStatus::Accepted, Some(now_ms()), None).await {
            error!(%call_id, "persist accept failed: {e:#}");
        }
        self.fan_out_status(&record, CallStatus::Accepted).await;
        info!(%call_id, "call accepted");
        Ok(())
    }

    /// Receiver declines a ringing call. Declining a call that is already
    /// over is a no-op: the local decline and the ringing timeout may race.
    pub async fn decline(&self, call_id: &str, user_id: &str) -> Result<(), CallError> {
        {
            let inner = self.inner.lock().await;
            match inner.calls.get(call_id) {
                Some(call) if call.record.receiver_id != user_id => {
                    return Err(CallError::NotParticipant)
                }
                Some(call) if call.record.status != CallStatus::Ringing => {
                    return Err(CallError::InvalidTransition("decline is only valid while ringing"))
                }
                Some(_) => {}
                None => return Ok(()),
            }
        }
        self.finish(call_id, CallStatus::Declined).await;
        Ok(())
    }

    /// Either participant hangs up, from ringing or accepted. Idempotent:
    /// ending a call that is already terminal (or gone) is a no-op, since
    /// the local action and the remote observation race to clean up.
    pub async fn end(&self, call_id: &str, user_id: &str) -> Result<(), CallError> {
        {
            let inner = self.inner.lock().await;
            match inner.calls.get(call_id) {
                Some(call) if !call.record.is_participant(user_id) => {
                    return Err(CallError::NotParticipant)
                }
                Some(_) => {}
                None => return Ok(()),
            }
        }
        self.finish(call_id, CallStatus::Ended).await;
        Ok(())
    }

    /// Routes one signal. Unknown call ids and terminal calls are log-only
    /// drops: this is a best-effort transport.
    pub async fn signal(&self, msg: SignalMessage) {
        let call = {
            let inner = self.inner.lock().await;
            if inner.terminal.contains_key(&msg.call_id) {
                warn!(call_id = %msg.call_id, kind = ?msg.kind, "stale signal dropped: call is terminal");
                return;
            }
            match inner.calls.get(&msg.call_id) {
                Some(c) => c.record.clone(),
                None => {
                    warn!(call_id = %msg.call_id, kind = ?msg.kind, "signal dropped: unknown call id");
                    return;
                }
            }
        };
        self.signals.route(msg, &call).await;
    }

    /// Subscribe-by-id read model over the call record: the receiver always
    /// yields the most recent status, collapsing intermediate values.
    pub async fn watch(&self, call_id: &str) -> WatchOutcome {
        let inner = self.inner.lock().await;
        if let Some(call) = inner.calls.get(call_id) {
            return WatchOutcome::Live(call.status_tx.subscribe());
        }
        if let Some((status, _)) = inner.terminal.get(call_id) {
            return WatchOutcome::Finished(*status);
        }
        WatchOutcome::Unknown
    }

    pub async fn status_of(&self, call_id: &str) -> Option<CallStatus> {
        let inner = self.inner.lock().await;
        inner
            .calls
            .get(call_id)
            .map(|c| c.record.status)
            .or_else(|| inner.terminal.get(call_id).map(|(s, _)| *s))
    }

    /// Drops terminal-status memory older than the TTL.
    pub async fn prune_terminal(&self, ttl_secs: u64) {
        let cutoff = now_ms().saturating_sub((ttl_secs as i64).saturating_mul(1000));
        let mut inner = self.inner.lock().await;
        inner.terminal.retain(|_, (_, at)| *at >= cutoff);
    }

    async fn handle_disconnect(&self, user_id: &str) {
        let affected: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .calls
                .values()
                .filter(|c| c.record.is_participant(user_id))
                .map(|c| c.record.call_id.clone())
                .collect()
        };
        for call_id in affected {
            info!(%call_id, %user_id, "participant disconnected, ending call");
            self.finish(&call_id, CallStatus::Ended).await;
        }
    }

    fn spawn_ring_timer(&self, call_id: String, cancel: CancellationToken) {
        let coordinator = self.clone();
        let timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    info!(%call_id, "ringing timed out");
                    coordinator.finish(&call_id, CallStatus::Declined).await;
                }
            }
        });
    }

    /// The single terminal path. Exactly one invocation per call wins the
    /// removal under the lock; every later one is a no-op, which is what
    /// makes End/decline/timeout/disconnect races safe.
    async fn finish(&self, call_id: &str, status: CallStatus) {
        debug_assert!(status.is_terminal());
        let ended_at = now_ms();
        let call = {
            let mut inner = self.inner.lock().await;
            let Some(call) = inner.calls.remove(call_id) else {
                return;
            };
            inner.terminal.insert(call_id.to_string(), (status, ended_at));
            self.presence
                .set_call_status(&call.record.caller_id, PresenceStatus::Available)
                .await;
            self.presence
                .set_call_status(&call.record.receiver_id, PresenceStatus::Available)
                .await;
            call
        };

        call.ring_cancel.cancel();
        let _ = call.status_tx.send(status);

        if let Err(e) = self.store.set_status(call_id, status, None, Some(ended_at)).await {
            error!(%call_id, "persist terminal status failed: {e:#}");
        }
        self.write_logs(&call, status, ended_at).await;
        self.fan_out_status(&call.record, status).await;
        self.signals.discard_stale_candidates(call_id).await;
        info!(%call_id, ?status, "call finished");
    }

    async fn write_logs(&self, call: &ActiveCall, status: CallStatus, ended_at: i64) {
        let record = &call.record;
        let duration_secs = call
            .accepted_at_ms
            .map(|t| (ended_at.saturating_sub(t).max(0) / 1000) as u64)
            .unwrap_or(0);
        let timestamp_ms = call.accepted_at_ms.unwrap_or(ended_at);

        let entries: Vec<(&str, &str, CallLogKind)> = match status {
            // Declined (by the receiver or by the ringing timeout) shows up
            // as a missed call on the receiver's side only.
            CallStatus::Declined => vec![(record.receiver_id.as_str(), record.caller_id.as_str(), CallLogKind::Missed)],
            CallStatus::Ended => vec![
                (record.caller_id.as_str(), record.receiver_id.as_str(), CallLogKind::Outgoing),
                (record.receiver_id.as_str(), record.caller_id.as_str(), CallLogKind::Incoming),
            ],
            _ => Vec::new(),
        };
        for (owner, peer, kind) in entries {
            let entry = CallLogEntry {
                call_id: record.call_id.clone(),
                peer_id: peer.to_string(),
                kind,
                is_video: record.is_video,
                timestamp_ms,
                duration_secs: if kind == CallLogKind::Missed { 0 } else { duration_secs },
            };
            if let Err(e) = self.store.put_log(owner, &entry).await {
                error!(call_id = %record.call_id, %owner, "write call log failed: {e:#}");
            }
        }
    }

    async fn fan_out_status(&self, record: &CallRecord, status: CallStatus) {
        for user in [&record.caller_id, &record.receiver_id] {
            self.presence
                .send(
                    user,
                    ServerFrame::CallStatus {
                        call_id: record.call_id.clone(),
                        status,
                    },
                )
                .await;
        }
    }
}

fn random_call_id() -> String {
    use rand::RngCore as _;
    let mut b = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::temp_store;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use xchat_protocol::SignalKind;

    const RING: Duration = Duration::from_secs(30);

    fn coordinator() -> Coordinator {
        let presence = PresenceStore::new();
        let signals = Arc::new(SignalRelay::new(presence.clone(), 64));
        Coordinator::new(presence, signals, temp_store(), RING)
    }

    async fn connect(coord: &Coordinator, user: &str) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(32);
        coord.register(user, tx).await;
        rx
    }

    async fn recv_status(rx: &mut mpsc::Receiver<ServerFrame>) -> CallStatus {
        loop {
            match rx.recv().await.expect("frame") {
                ServerFrame::CallStatus { status, .. } => return status,
                _ => continue,
            }
        }
    }

    fn candidate(call_id: &str, sender: &str) -> SignalMessage {
        SignalMessage {
            kind: SignalKind::Candidate,
            call_id: call_id.into(),
            sender_id: sender.into(),
            sdp: None,
            candidate: Some("candidate:0".into()),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn initiate_gates_on_both_parties_available() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let _c = connect(&coord, "carol").await;

        let call = coord.initiate("alice", "bob", false).await.unwrap();
        assert_eq!(call.status, CallStatus::Ringing);
        assert_eq!(coord.presence().call_status("alice").await, PresenceStatus::InCall);
        assert_eq!(coord.presence().call_status("bob").await, PresenceStatus::InCall);

        // Mutual exclusivity: everyone touching a live call is busy.
        assert_eq!(coord.initiate("carol", "bob", false).await, Err(CallError::UserBusy));
        assert_eq!(coord.initiate("alice", "carol", false).await, Err(CallError::UserBusy));
        // The failed attempts changed nothing.
        assert_eq!(coord.presence().call_status("carol").await, PresenceStatus::Available);
    }

    #[tokio::test]
    async fn self_call_is_rejected() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        assert_eq!(coord.initiate("alice", "alice", false).await, Err(CallError::SelfCall));
    }

    #[tokio::test]
    async fn receiver_is_notified_and_accept_fans_out() {
        let coord = coordinator();
        let mut a = connect(&coord, "alice").await;
        let mut b = connect(&coord, "bob").await;

        let call = coord.initiate("alice", "bob", true).await.unwrap();
        match b.recv().await.unwrap() {
            ServerFrame::IncomingCall { call: incoming } => {
                assert_eq!(incoming.call_id, call.call_id);
                assert!(incoming.is_video);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        assert_eq!(
            coord.accept(&call.call_id, "alice").await,
            Err(CallError::NotParticipant)
        );
        coord.accept(&call.call_id, "bob").await.unwrap();
        assert_eq!(recv_status(&mut a).await, CallStatus::Accepted);
        assert_eq!(recv_status(&mut b).await, CallStatus::Accepted);
        assert_eq!(coord.status_of(&call.call_id).await, Some(CallStatus::Accepted));
    }

    #[tokio::test(start_paused = true)]
    async fn ringing_times_out_into_declined_with_one_missed_log() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();

        tokio::time::sleep(RING + Duration::from_secs(1)).await;

        assert_eq!(coord.status_of(&call.call_id).await, Some(CallStatus::Declined));
        assert_eq!(coord.presence().call_status("alice").await, PresenceStatus::Available);
        assert_eq!(coord.presence().call_status("bob").await, PresenceStatus::Available);

        // Racing a decline after the timeout must not produce a second log.
        coord.decline(&call.call_id, "bob").await.unwrap();

        let logs = coord.store.list_logs("bob", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, CallLogKind::Missed);
        assert_eq!(logs[0].duration_secs, 0);
        assert!(coord.store.list_logs("alice", 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_cancels_the_ringing_timer() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();

        coord.accept(&call.call_id, "bob").await.unwrap();
        tokio::time::sleep(RING * 2).await;
        assert_eq!(coord.status_of(&call.call_id).await, Some(CallStatus::Accepted));
    }

    #[tokio::test(start_paused = true)]
    async fn end_after_accept_writes_one_log_per_party_with_duration() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();
        coord.accept(&call.call_id, "bob").await.unwrap();

        tokio::time::sleep(Duration::from_secs(7)).await;
        coord.end(&call.call_id, "alice").await.unwrap();
        // Second End (remote observation racing local action): no-op.
        coord.end(&call.call_id, "bob").await.unwrap();

        assert_eq!(coord.status_of(&call.call_id).await, Some(CallStatus::Ended));
        let alice_logs = coord.store.list_logs("alice", 10).await.unwrap();
        let bob_logs = coord.store.list_logs("bob", 10).await.unwrap();
        assert_eq!(alice_logs.len(), 1);
        assert_eq!(bob_logs.len(), 1);
        assert_eq!(alice_logs[0].kind, CallLogKind::Outgoing);
        assert_eq!(bob_logs[0].kind, CallLogKind::Incoming);
        assert_eq!(alice_logs[0].duration_secs, 7);
        assert_eq!(bob_logs[0].duration_secs, 7);

        assert_eq!(coord.presence().call_status("alice").await, PresenceStatus::Available);
        assert_eq!(coord.presence().call_status("bob").await, PresenceStatus::Available);
    }

    #[tokio::test]
    async fn end_while_ringing_logs_zero_duration() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();

        coord.end(&call.call_id, "alice").await.unwrap();
        let logs = coord.store.list_logs("alice", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].duration_secs, 0);
    }

    #[tokio::test]
    async fn disconnect_ends_the_live_call() {
        let coord = coordinator();
        let (tx_a, _rx_a) = mpsc::channel(32);
        coord.register("alice", tx_a.clone()).await;
        let _b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();

        coord.unregister("alice", &tx_a).await;
        assert_eq!(coord.status_of(&call.call_id).await, Some(CallStatus::Ended));
        assert_eq!(coord.presence().call_status("bob").await, PresenceStatus::Available);
    }

    #[tokio::test]
    async fn stale_unregister_does_not_end_a_new_sessions_call() {
        let coord = coordinator();
        let (old_tx, _old_rx) = mpsc::channel(32);
        coord.register("alice", old_tx.clone()).await;
        // Reconnect replaces the handle, then alice starts a call.
        let _new = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();

        // The old socket finally tears down; it must not kill the new call.
        coord.unregister("alice", &old_tx).await;
        assert_eq!(coord.status_of(&call.call_id).await, Some(CallStatus::Ringing));
    }

    #[tokio::test]
    async fn signals_for_terminal_or_unknown_calls_are_dropped() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let mut b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();
        // Drain the incoming-call frame.
        let _ = b.recv().await.unwrap();

        coord.end(&call.call_id, "alice").await.unwrap();
        let _ = recv_status(&mut b).await;

        coord.signal(candidate(&call.call_id, "alice")).await;
        coord.signal(candidate("nope", "alice")).await;
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn queued_signals_flush_in_order_on_register() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        // bob is known but offline.
        let (tx_b, rx_b) = mpsc::channel(32);
        coord.register("bob", tx_b.clone()).await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();
        drop(rx_b);
        coord.presence().unregister("bob", &tx_b).await;

        for i in 0..3 {
            let mut m = candidate(&call.call_id, "alice");
            m.candidate = Some(format!("cand-{i}"));
            coord.signal(m).await;
        }

        let mut b = connect(&coord, "bob").await;
        let mut seen = Vec::new();
        for _ in 0..3 {
            match b.recv().await.unwrap() {
                ServerFrame::Signal(m) => seen.push(m.candidate.unwrap()),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(seen, vec!["cand-0", "cand-1", "cand-2"]);
    }

    #[tokio::test]
    async fn reconnect_mid_ring_keeps_the_busy_flag() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let _c = connect(&coord, "carol").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();

        // Alice reconnects before her old socket tears down. The call is
        // still ringing, so the session-start reset must not free her.
        let _a2 = connect(&coord, "alice").await;
        assert_eq!(coord.presence().call_status("alice").await, PresenceStatus::InCall);
        assert_eq!(coord.initiate("alice", "carol", false).await, Err(CallError::UserBusy));
        assert_eq!(coord.status_of(&call.call_id).await, Some(CallStatus::Ringing));
    }

    #[tokio::test]
    async fn register_self_heals_a_stale_busy_flag() {
        let coord = coordinator();
        coord.presence().set_call_status("alice", PresenceStatus::InCall).await;
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        assert!(coord.initiate("alice", "bob", false).await.is_ok());
    }

    #[tokio::test]
    async fn watch_reports_live_then_terminal() {
        let coord = coordinator();
        let _a = connect(&coord, "alice").await;
        let _b = connect(&coord, "bob").await;
        let call = coord.initiate("alice", "bob", false).await.unwrap();

        let mut rx = match coord.watch(&call.call_id).await {
            WatchOutcome::Live(rx) => rx,
            _ => panic!("expected live watch"),
        };
        assert_eq!(*rx.borrow(), CallStatus::Ringing);

        coord.end(&call.call_id, "alice").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), CallStatus::Ended);

        match coord.watch(&call.call_id).await {
            WatchOutcome::Finished(CallStatus::Ended) => {}
            _ => panic!("expected finished watch"),
        }
    }
}
