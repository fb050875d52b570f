//! Observer WebSocket: snapshot pushes, story and log subscriptions, heartbeat.

use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use saga_core::ObserverId;
use saga_types::{LogsRef, StoryRef, WsClientMessage, WsServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Serve one observer until either side goes away.
pub async fn handle_observer(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (observer, mut outbound) = state.broadcaster.register();
    info!(target: "saga::ws", "Observer {} connected", observer);

    // Late joiners get the current state without waiting for a change.
    state.broadcaster.send_to(
        observer,
        WsServerMessage::SessionsUpdated(state.poller.current_sessions()),
    );

    // Cleared on every ping, set again by the observer's pong.
    let alive = Arc::new(AtomicBool::new(true));
    let period = state.config.heartbeat_interval();

    let send_alive = alive.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(target: "saga::ws", "Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if !send_alive.swap(false, Ordering::SeqCst) {
                        info!(target: "saga::ws", "Observer {} missed heartbeat, dropping", observer);
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    trace!(target: "saga::ws::ping", "Ping observer {}", observer);
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<WsClientMessage>(&text) {
                    Ok(message) => handle_client_message(&recv_state, observer, message).await,
                    Err(e) => {
                        debug!(target: "saga::ws", "Ignoring malformed message from {}: {}", observer, e);
                    }
                },
                Message::Pong(_) => {
                    trace!(target: "saga::ws::ping", "Pong from observer {}", observer);
                    alive.store(true, Ordering::SeqCst);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.broadcaster.unregister(observer);
    state.log_streams.handle_observer_disconnect(observer).await;
    info!(target: "saga::ws", "Observer {} disconnected", observer);
}

/// Apply one observer request.
pub async fn handle_client_message(
    state: &Arc<AppState>,
    observer: ObserverId,
    message: WsClientMessage,
) {
    match message {
        WsClientMessage::SubscribeStory(StoryRef { id }) => {
            debug!(target: "saga::ws", "Observer {} subscribed to story {}", observer, id);
            state.broadcaster.subscribe_story(observer, &id);
        }
        WsClientMessage::UnsubscribeStory(StoryRef { id }) => {
            state.broadcaster.unsubscribe_story(observer, &id);
        }
        WsClientMessage::SubscribeLogs(LogsRef { entity_key }) => {
            state.log_streams.subscribe(&entity_key, observer).await;
        }
        WsClientMessage::UnsubscribeLogs(LogsRef { entity_key }) => {
            state.log_streams.unsubscribe(&entity_key, observer).await;
        }
        WsClientMessage::Ping => {
            state.broadcaster.send_to(observer, WsServerMessage::Pong);
        }
    }
}
