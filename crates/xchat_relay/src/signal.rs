/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::presence::PresenceStore;
use xchat_protocol::{CallRecord, ServerFrame, SignalKind, SignalMessage};

/// Best-effort transport for offer/answer/candidate messages between the two
/// participants of a call. An offline recipient gets a capped FIFO queue,
/// flushed on the next registration; this is not a guaranteed-delivery log.
///
/// The queue lock covers both delivery paths. While a backlog exists for a
/// recipient, new messages line up behind it instead of going straight to
/// the connection, so a concurrent send cannot overtake the registration
/// flush and single-sender ordering holds across a reconnect.
pub struct SignalRelay {
    presence: PresenceStore,
    queues: Mutex<HashMap<String, VecDeque<SignalMessage>>>,
    max_queued_per_user: usize,
}

impl SignalRelay {
    pub fn new(presence: PresenceStore, max_queued_per_user: usize) -> Self {
        Self {
            presence,
            queues: Mutex::new(HashMap::new()),
            max_queued_per_user: max_queued_per_user.max(1),
        }
    }

    /// Forwards `msg` to the other participant of `call`. The caller has
    /// already resolved the call and checked it is non-terminal; this
    /// validates the sender and picks the recipient.
    pub async fn route(&self, msg: SignalMessage, call: &CallRecord) {
        let Some(recipient) = call.peer_of(&msg.sender_id) else {
            warn!(call_id = %msg.call_id, sender = %msg.sender_id, "signal dropped: sender is not a participant");
            return;
        };
        let recipient = recipient.to_string();

        let mut queues = self.queues.lock().await;
        // A queue entry always means undelivered messages (flush removes the
        // key, discard prunes empties), so direct delivery is only legal
        // when no entry exists.
        if !queues.contains_key(&recipient)
            && self.presence.send(&recipient, ServerFrame::Signal(msg.clone())).await
        {
            return;
        }

        // DeliveryPending: recipient offline or backlogged, queue in order.
        debug!(call_id = %msg.call_id, %recipient, "signal queued");
        let queue = queues.entry(recipient).or_default();
        queue.push_back(msg);
        while queue.len() > self.max_queued_per_user {
            queue.pop_front();
        }
    }

    /// Delivers everything queued for `user_id` to its current connection,
    /// oldest first, dropping messages whose call `is_live` rejects. The
    /// queue lock is held across delivery so concurrent routes queue behind
    /// the backlog rather than overtaking it.
    pub async fn flush(&self, user_id: &str, is_live: impl Fn(&str) -> bool) {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.remove(user_id) else {
            return;
        };
        for msg in queue {
            if !is_live(&msg.call_id) {
                warn!(call_id = %msg.call_id, %user_id, "queued signal dropped at flush: call no longer live");
                continue;
            }
            self.presence.send(user_id, ServerFrame::Signal(msg)).await;
        }
    }

    /// Called when a call goes terminal: queued candidates for it will never
    /// be applied, drop them now instead of at flush time.
    pub async fn discard_stale_candidates(&self, call_id: &str) {
        let mut queues = self.queues.lock().await;
        for queue in queues.values_mut() {
            queue.retain(|m| !(m.call_id == call_id && m.kind == SignalKind::Candidate));
        }
        queues.retain(|_, q| !q.is_empty());
    }

    #[cfg(test)]
    pub async fn queued_len(&self, user_id: &str) -> usize {
        self.queues.lock().await.get(user_id).map(|q| q.len()).unwrap_or(0)
    }
}
