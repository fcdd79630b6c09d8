/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Client side of the calling stack: the peer session adapter over the
//! `webrtc` crate, the per-call session state machine, and the relay
//! connection runtime that feeds both.

pub mod media;
pub mod runtime;
pub mod session;

/// Plain config struct; binaries fill it from env vars.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_ws_url: String,
    pub user_id: String,
    pub token: Option<String>,
    pub ice_urls: Vec<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let relay_ws_url = std::env::var("XCHAT_RELAY_WS_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8989".to_string())
            .trim_end_matches('/')
            .to_string();
        let user_id = std::env::var("XCHAT_USER_ID").unwrap_or_else(|_| "dev".to_string());
        let token = std::env::var("XCHAT_RELAY_AUTH_TOKEN")
            .ok()
            .filter(|s| !s.is_empty());
        let ice_urls = std::env::var("XCHAT_ICE_URLS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec!["stun:stun.l.google.com:19302".to_string()]);
        let ice_username = std::env::var("XCHAT_ICE_USERNAME")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let ice_credential = std::env::var("XCHAT_ICE_CREDENTIAL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            relay_ws_url,
            user_id,
            token,
            ice_urls,
            ice_username,
            ice_credential,
        }
    }
}
