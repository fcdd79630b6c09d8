/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use xchat_protocol::{PresenceStatus, ServerFrame};

pub type ConnHandle = mpsc::Sender<ServerFrame>;

struct UserPresence {
    sender: Option<ConnHandle>,
    call_status: PresenceStatus,
}

/// Single source of truth for "is user X reachable, and are they free to
/// take a call". The status flag is only ever written by the coordinator;
/// the one exception is the forced reset in `register`, which is the
/// session-start self-healing rule.
#[derive(Clone, Default)]
pub struct PresenceStore {
    inner: Arc<RwLock<HashMap<String, UserPresence>>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any prior connection handle and forces the call status back
    /// to `available`: a crashed session must not leave the user busy
    /// forever. The coordinator re-marks `in_call` right after when a live
    /// call still names this user.
    pub async fn register(&self, user_id: &str, sender: ConnHandle) {
        let mut inner = self.inner.write().await;
        inner.insert(
            user_id.to_string(),
            UserPresence {
                sender: Some(sender),
                call_status: PresenceStatus::Available,
            },
        );
    }

    /// Drops the connection handle, but only if it is still the one that
    /// registered `sender` — a reconnect may already have replaced it.
    /// The status flag survives; terminal cleanup is the coordinator's job.
    pub async fn unregister(&self, user_id: &str, sender: &ConnHandle) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(user_id) {
            if entry.sender.as_ref().is_some_and(|s| s.same_channel(sender)) {
                entry.sender = None;
                return true;
            }
        }
        false
    }

    pub async fn set_call_status(&self, user_id: &str, status: PresenceStatus) {
        let mut inner = self.inner.write().await;
        inner
            .entry(user_id.to_string())
            .or_insert_with(|| UserPresence {
                sender: None,
                call_status: status,
            })
            .call_status = status;
    }

    /// Defaults to `available` when no record exists.
    pub async fn call_status(&self, user_id: &str) -> PresenceStatus {
        self.inner
            .read()
            .await
            .get(user_id)
            .map(|e| e.call_status)
            .unwrap_or(PresenceStatus::Available)
    }

    #[cfg(test)]
    pub(crate) async fn is_online(&self, user_id: &str) -> bool {
        self.inner
            .read()
            .await
            .get(user_id)
            .is_some_and(|e| e.sender.is_some())
    }

    /// Best-effort delivery to the user's current connection. Returns false
    /// when the user is offline or the channel has gone away.
    pub async fn send(&self, user_id: &str, frame: ServerFrame) -> bool {
        let sender = {
            let inner = self.inner.read().await;
            inner.get(user_id).and_then(|e| e.sender.clone())
        };
        match sender {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => {
                debug!(%user_id, "presence send skipped: offline");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_forces_status_back_to_available() {
        let store = PresenceStore::new();
        store.set_call_status("alice", PresenceStatus::InCall).await;
        assert_eq!(store.call_status("alice").await, PresenceStatus::InCall);

        let (tx, _rx) = mpsc::channel(4);
        store.register("alice", tx).await;
        assert_eq!(store.call_status("alice").await, PresenceStatus::Available);
        assert!(store.is_online("alice").await);
    }

    #[tokio::test]
    async fn missing_user_reads_available_and_offline() {
        let store = PresenceStore::new();
        assert_eq!(store.call_status("ghost").await, PresenceStatus::Available);
        assert!(!store.is_online("ghost").await);
        assert!(!store.send("ghost", ServerFrame::CallStatus { call_id: "c".into(), status: xchat_protocol::CallStatus::Ended }).await);
    }

    #[tokio::test]
    async fn stale_unregister_does_not_clobber_newer_handle() {
        let store = PresenceStore::new();
        let (old_tx, _old_rx) = mpsc::channel(4);
        store.register("alice", old_tx.clone()).await;

        let (new_tx, _new_rx) = mpsc::channel(4);
        store.register("alice", new_tx).await;

        // The old socket tearing down after the reconnect must be a no-op.
        assert!(!store.unregister("alice", &old_tx).await);
        assert!(store.is_online("alice").await);
    }

    #[tokio::test]
    async fn unregister_keeps_call_status() {
        let store = PresenceStore::new();
        let (tx, _rx) = mpsc::channel(4);
        store.register("alice", tx.clone()).await;
        store.set_call_status("alice", PresenceStatus::InCall).await;

        assert!(store.unregister("alice", &tx).await);
        assert!(!store.is_online("alice").await);
        assert_eq!(store.call_status("alice").await, PresenceStatus::InCall);
    }
}
