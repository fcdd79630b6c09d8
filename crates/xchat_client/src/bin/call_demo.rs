/*
 * SPDX-FileCopyrightText: 2026 XChat Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Manual end-to-end driver against a running relay. Two terminals:
//!   XCHAT_USER_ID=alice cargo run --bin call_demo
//!   XCHAT_USER_ID=bob   cargo run --bin call_demo
//! Commands on stdin: call <user> [video] | accept | decline | end | quit

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::info;

use xchat_client::media::WebrtcFactory;
use xchat_client::runtime::{self, CallEvent, Command};
use xchat_client::ClientConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let cfg = ClientConfig::from_env();
    info!(user = %cfg.user_id, relay = %cfg.relay_ws_url, "call demo starting");

    let factory = Arc::new(WebrtcFactory {
        ice_urls: cfg.ice_urls.clone(),
        ice_username: cfg.ice_username.clone(),
        ice_credential: cfg.ice_credential.clone(),
    });

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
    let (ev_tx, mut ev_rx) = mpsc::channel::<CallEvent>(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime_cfg = cfg.clone();
    let runtime = tokio::spawn(async move {
        if let Err(e) = runtime::run(runtime_cfg, factory, cmd_rx, ev_tx, shutdown_rx).await {
            eprintln!("runtime failed: {e:#}");
        }
    });

    tokio::spawn(async move {
        while let Some(ev) = ev_rx.recv().await {
            match ev {
                CallEvent::Incoming(call) => {
                    println!(
                        ">> incoming {} call from {} (accept / decline)",
                        if call.is_video { "video" } else { "audio" },
                        call.caller_id
                    );
                }
                CallEvent::Started(call) => println!(">> ringing {} ({})", call.receiver_id, call.call_id),
                CallEvent::StatusChanged { call_id, status } => {
                    println!(">> call {call_id} is now {status:?}");
                }
                CallEvent::Live { call_id } => println!(">> call {call_id} live"),
                CallEvent::Busy { message } => println!(">> busy: {message}"),
                CallEvent::Denied { message } => println!(">> denied: {message}"),
                CallEvent::Closed { call_id, status } => println!(">> call {call_id} closed ({status:?})"),
                CallEvent::Error { code, message } => println!(">> error {code:?}: {message}"),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("call") => {
                let Some(receiver) = parts.next() else {
                    println!("usage: call <user> [video]");
                    continue;
                };
                let is_video = parts.next() == Some("video");
                let _ = cmd_tx
                    .send(Command::Call {
                        receiver_id: receiver.to_string(),
                        is_video,
                    })
                    .await;
            }
            Some("accept") => {
                let _ = cmd_tx.send(Command::Accept).await;
            }
            Some("decline") => {
                let _ = cmd_tx.send(Command::Decline).await;
            }
            Some("end") => {
                let _ = cmd_tx.send(Command::End).await;
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = runtime.await;
    Ok(())
}
