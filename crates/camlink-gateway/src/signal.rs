use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use camlink_common::protocol::{decode, encode, SignalingMessage};

const WS_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
const MAX_SIGNAL_SDP_BYTES: usize = 32 * 1024;
const MAX_SIGNAL_CANDIDATE_BYTES: usize = 4096;
const MAX_DEVICE_ID_BYTES: usize = 128;
const WS_BIND_TIMEOUT: Duration = Duration::from_secs(10);

/// Sender id the gateway uses for its own frames.
pub const GATEWAY_DEVICE_ID: &str = "gateway";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Signaler {
    connection_id: u64,
    tx: mpsc::Sender<Message>,
}

/// Registered devices by id.
pub type ConnectionMap = Arc<RwLock<HashMap<String, Signaler>>>;

/// Queues `signal` without waiting; false if it could not be encoded or the
/// outbox is full.
fn try_send(tx: &mpsc::Sender<Message>, signal: &SignalingMessage) -> bool {
    match encode(signal) {
        Ok(json) => tx.try_send(Message::Text(json)).is_ok(),
        Err(_) => false,
    }
}

fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.trim().is_empty() && device_id.len() <= MAX_DEVICE_ID_BYTES
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(connections): State<ConnectionMap>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, connections, addr))
}

/// Waits for the `register` frame that must open every connection.
async fn await_registration(receiver: &mut SplitStream<WebSocket>, addr: SocketAddr) -> Option<String> {
    loop {
        let msg = receiver.next().await?.ok()?;
        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) | Message::Close(_) => return None,
        };
        return match decode(&text) {
            SignalingMessage::Register {
                device_id,
                device_type,
            } if is_valid_device_id(&device_id) => {
                info!("device {} registered as {} from {}", device_id, device_type, addr);
                Some(device_id)
            }
            other => {
                warn!("expected register from {}, got {}", addr, other.kind());
                None
            }
        };
    }
}

async fn handle_socket(stream: WebSocket, connections: ConnectionMap, addr: SocketAddr) {
    info!("client connecting from {}", addr);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOX_CAPACITY);

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let device_id =
        match tokio::time::timeout(WS_BIND_TIMEOUT, await_registration(&mut receiver, addr)).await {
            Ok(Some(device_id)) => device_id,
            Ok(None) => return,
            Err(_) => {
                warn!("register timeout for {}", addr);
                return;
            }
        };

    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (replaced, others) = {
        let mut guard = connections.write().await;
        let replaced = guard.insert(
            device_id.clone(),
            Signaler {
                connection_id,
                tx: tx.clone(),
            },
        );
        let others: Vec<(String, Signaler)> = guard
            .iter()
            .filter(|(id, _)| **id != device_id)
            .map(|(id, signaler)| (id.clone(), signaler.clone()))
            .collect();
        (replaced, others)
    };

    let mut roster: Vec<String> = others.iter().map(|(id, _)| id.clone()).collect();
    roster.sort();
    try_send(&tx, &SignalingMessage::DeviceList { devices: roster });

    match replaced {
        Some(previous) => {
            info!("device {} reconnected, replacing earlier socket", device_id);
            let _ = previous.tx.try_send(Message::Close(None));
        }
        None => {
            let online = SignalingMessage::DeviceOnline {
                device_id: device_id.clone(),
                device_name: device_id.clone(),
            };
            for (_, signaler) in &others {
                try_send(&signaler.tx, &online);
            }
        }
    }

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        warn!("binary frame from {}, closing", device_id);
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if text.len() > WS_MAX_TEXT_BYTES {
                    warn!("oversized frame from {}, closing", device_id);
                    break;
                }

                match decode(&text) {
                    SignalingMessage::Offer { to, sdp, .. } => {
                        if sdp.len() > MAX_SIGNAL_SDP_BYTES || !is_valid_device_id(&to) {
                            warn!("invalid offer payload from {}", device_id);
                            continue;
                        }
                        relay_message(
                            &connections,
                            SignalingMessage::Offer {
                                from: device_id.clone(),
                                to,
                                sdp,
                            },
                        )
                        .await;
                    }
                    SignalingMessage::Answer { to, sdp, .. } => {
                        if sdp.len() > MAX_SIGNAL_SDP_BYTES || !is_valid_device_id(&to) {
                            warn!("invalid answer payload from {}", device_id);
                            continue;
                        }
                        relay_message(
                            &connections,
                            SignalingMessage::Answer {
                                from: device_id.clone(),
                                to,
                                sdp,
                            },
                        )
                        .await;
                    }
                    SignalingMessage::IceCandidate {
                        to,
                        candidate,
                        sdp_mline_index,
                        sdp_mid,
                        ..
                    } => {
                        if candidate.len() > MAX_SIGNAL_CANDIDATE_BYTES || !is_valid_device_id(&to) {
                            warn!("invalid candidate payload from {}", device_id);
                            continue;
                        }
                        relay_message(
                            &connections,
                            SignalingMessage::IceCandidate {
                                from: device_id.clone(),
                                to,
                                candidate,
                                sdp_mline_index,
                                sdp_mid,
                            },
                        )
                        .await;
                    }
                    SignalingMessage::Ping { .. } => {
                        try_send(
                            &tx,
                            &SignalingMessage::Pong {
                                from: GATEWAY_DEVICE_ID.to_string(),
                            },
                        );
                    }
                    SignalingMessage::GetDevices { .. } => {
                        let devices = registered_devices(&connections, &device_id).await;
                        try_send(&tx, &SignalingMessage::DeviceList { devices });
                    }
                    SignalingMessage::Register { .. } => {
                        warn!("{} registered twice on one socket, closing", device_id);
                        break;
                    }
                    SignalingMessage::Pong { .. } => {}
                    other => {
                        debug!("ignoring {} frame from {}", other.kind(), device_id);
                    }
                }
            }
        }
    }

    let removed = {
        let mut guard = connections.write().await;
        match guard.get(&device_id) {
            Some(current) if current.connection_id == connection_id => {
                guard.remove(&device_id);
                true
            }
            _ => false,
        }
    };
    if removed {
        info!("device disconnected: {}", device_id);
        broadcast(
            &connections,
            &SignalingMessage::DeviceOffline {
                device_id: device_id.clone(),
            },
        )
        .await;
    }
}

/// Other registered device ids, sorted.
async fn registered_devices(connections: &ConnectionMap, except: &str) -> Vec<String> {
    let mut devices: Vec<String> = connections
        .read()
        .await
        .keys()
        .filter(|id| id.as_str() != except)
        .cloned()
        .collect();
    devices.sort();
    devices
}

async fn relay_message(connections: &ConnectionMap, signal: SignalingMessage) {
    let target = match &signal {
        SignalingMessage::Offer { to, .. }
        | SignalingMessage::Answer { to, .. }
        | SignalingMessage::IceCandidate { to, .. } => to.clone(),
        _ => return,
    };
    let guard = connections.read().await;
    match guard.get(&target) {
        Some(signaler) => {
            if !try_send(&signaler.tx, &signal) {
                warn!("outbox full for {}, dropping {}", target, signal.kind());
            }
        }
        None => warn!("target {} is offline, dropping {}", target, signal.kind()),
    }
}

async fn broadcast(connections: &ConnectionMap, signal: &SignalingMessage) {
    for signaler in connections.read().await.values() {
        try_send(&signaler.tx, signal);
    }
}
