/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by the signaling relay and the client runtime.
//! JSON field names match the shapes the mobile app already speaks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Accepted,
    Declined,
    Ended,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Declined | CallStatus::Ended)
    }
}

/// Presence flag gating new calls. Absent record reads as `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Available,
    InCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: String,
    pub receiver_id: String,
    pub is_video: bool,
    pub status: CallStatus,
    pub timestamp_ms: i64,
}

impl CallRecord {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.receiver_id == user_id
    }

    /// The participant on the other end, if `user_id` is one of the two.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.caller_id == user_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// One offer/answer/candidate hop. Ephemeral: the relay never retains a
/// delivered signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub call_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallLogKind {
    Incoming,
    Outgoing,
    Missed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLogEntry {
    pub call_id: String,
    pub peer_id: String,
    pub kind: CallLogKind,
    pub is_video: bool,
    pub timestamp_ms: i64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    UserBusy,
    UnknownCall,
    NotParticipant,
    BadRequest,
}

/// Client → relay frames, tagged on `"op"` so a signal's own `"type"` field
/// stays untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Initiate { receiver_id: String, is_video: bool },
    #[serde(rename_all = "camelCase")]
    Accept { call_id: String },
    #[serde(rename_all = "camelCase")]
    Decline { call_id: String },
    #[serde(rename_all = "camelCase")]
    End { call_id: String },
    Signal(SignalMessage),
    #[serde(rename_all = "camelCase")]
    Watch { call_id: String },
}

/// Relay → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Initiate succeeded; the caller owns this call now.
    CallStarted { call: CallRecord },
    /// Fanned out to the receiver when a call starts ringing.
    IncomingCall { call: CallRecord },
    Signal(SignalMessage),
    /// Subscribe-by-id read model: most-recent status, intermediate values
    /// may collapse.
    #[serde(rename_all = "camelCase")]
    CallStatus { call_id: String, status: CallStatus },
    #[serde(rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
}
