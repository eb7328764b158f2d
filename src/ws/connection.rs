//! ConnectionHandler (spec §4.5): the per-socket event loop.
//!
//! One task per accepted connection owns both halves of the split
//! WebSocket, selecting over the client's inbound frames, this
//! connection's outbound event channel, and its own 30s transport-ping
//! ticker — directly generalized from the teacher's `handle_ws` task, which
//! does the same `tokio::select!` over incoming frames and a broadcast
//! channel, but funnels outgoing transport pings through the same select
//! loop instead of a separate forwarding task so a connection's ping
//! cadence survives independent of any other socket.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcast::{broadcast, push_buffered, ServerEvent};
use crate::dispatch::{dispatch_inbound, ImageAttachment};
use crate::history::{HistoryStore, MessageRole, StoredMessage};
use crate::ids::next_message_id;
use crate::state::{AppState, ClientInfo, UserKey, UserState};

const TRANSPORT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound client wire events (spec §6).
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientEvent {
    #[serde(rename = "message")]
    Message {
        text: String,
        #[serde(default)]
        images: Vec<ImageAttachment>,
    },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "resync")]
    Resync,
}

/// What the resume query parameters resolved to, if the client asked to
/// resume a prior connection.
pub struct ResumeRequest {
    pub connection_id: Uuid,
    pub sequence_number: u64,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Catch-up or full-sync, deciding which per spec §4.5 step 3 /
/// `UserState::covers`. `catch_up_since` is `Some(seq)` when the caller has
/// already determined (under this same lock) that the buffer covers the
/// client's last-seen seq; `None` means a full sync is required. Assigns
/// seq(s) and, for full sync, appends the buffer-worthy events — all under
/// the caller's already-held lock so the decision and the seq assignment
/// happen atomically.
async fn initial_sync(
    state: &mut UserState,
    history: &HistoryStore,
    user_key: &UserKey,
    connection_id: Uuid,
    catch_up_since: Option<u64>,
) -> Vec<ServerEvent> {
    match catch_up_since {
        Some(since) => catch_up(state, connection_id, since),
        None => full_sync(state, history, user_key, connection_id).await,
    }
}

fn catch_up(state: &mut UserState, connection_id: Uuid, since: u64) -> Vec<ServerEvent> {
    let hello_seq = state.sequence;
    state.sequence += 1;
    let mut events = vec![ServerEvent::Hello {
        connection_id,
        seq: hello_seq,
    }];
    events.extend(
        state
            .event_buffer
            .iter()
            .filter(|(seq, _)| *seq >= since)
            .map(|(_, event)| event.clone()),
    );
    events
}

async fn full_sync(
    state: &mut UserState,
    history: &HistoryStore,
    user_key: &UserKey,
    connection_id: Uuid,
) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let hello_seq = state.sequence;
    state.sequence += 1;
    events.push(ServerEvent::Hello {
        connection_id,
        seq: hello_seq,
    });

    events.extend(resync_events(state, history, user_key).await);
    events
}

/// `history{...}` (+ `streaming{...}` if present), with no `hello` — what
/// spec §4.5 step 6 and an on-demand `resync` client event (step 6's
/// "resync" branch) both require. A reconnect's full sync layers this on
/// top of its own `hello`; an in-session `resync` request emits exactly
/// this and nothing else, since a `hello` was already sent for the
/// connection it came in on.
async fn resync_events(
    state: &mut UserState,
    history: &HistoryStore,
    user_key: &UserKey,
) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let messages = history.read_history(user_key).await;
    let history_seq = state.sequence;
    state.sequence += 1;
    let history_event = ServerEvent::History {
        messages,
        seq: history_seq,
    };
    push_buffered(state, history_seq, history_event.clone());
    events.push(history_event);

    if let Some(streaming) = &state.streaming {
        let text = streaming.text.clone();
        let seq = state.sequence;
        state.sequence += 1;
        let event = ServerEvent::Streaming { text, seq };
        push_buffered(state, seq, event.clone());
        events.push(event);
    }

    events
}

/// Drive one accepted connection to completion.
pub async fn handle_socket(
    socket: WebSocket,
    app_state: AppState,
    user_key: UserKey,
    account_id: String,
    resume: Option<ResumeRequest>,
) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(256);

    let user_state = app_state.user_states.get_or_create(&user_key).await;

    // Spec §4.5 step 2: whether this is a catch-up or a full sync — and
    // hence which connectionId to use — depends on whether the buffer
    // *right now* covers the client's last-seen seq, so that decision, the
    // resulting seq assignment, and this client's own registration all
    // happen under one uninterrupted hold of the lock. Releasing and
    // re-acquiring the lock between steps would let a concurrent broadcast
    // for this user assign a seq and fan out to every already-registered
    // client without this one, opening a gap the seq-ordering invariant
    // (spec §8) forbids.
    let (connection_id, initial_events) = {
        let mut guard = user_state.lock().await;

        let catch_up_since = resume
            .as_ref()
            .filter(|r| guard.covers(r.sequence_number))
            .map(|r| r.sequence_number);
        let connection_id = match (&resume, catch_up_since) {
            (Some(resume), Some(_)) => resume.connection_id,
            _ => Uuid::new_v4(),
        };

        let events = initial_sync(
            &mut guard,
            &app_state.history,
            &user_key,
            connection_id,
            catch_up_since,
        )
        .await;

        guard.clients.push(ClientInfo {
            connection_id,
            sender: tx.clone(),
        });

        (connection_id, events)
    };

    for event in initial_events {
        if tx.send(event).await.is_err() {
            return;
        }
    }

    let mut ping_ticker = interval(TRANSPORT_PING_INTERVAL);
    ping_ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            incoming = ws_stream.next() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    Message::Text(text) => {
                        handle_client_event(
                            &text,
                            &app_state,
                            &user_key,
                            &account_id,
                            &user_state,
                            &tx,
                        )
                        .await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outbound = rx.recv() => {
                let Some(event) = outbound else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("failed to serialize outbound event: {e}");
                        continue;
                    }
                };
                if ws_sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping_ticker.tick() => {
                if ws_sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let mut guard = user_state.lock().await;
    guard.clients.retain(|c| c.connection_id != connection_id);
}

async fn handle_client_event(
    text: &str,
    app_state: &AppState,
    user_key: &UserKey,
    account_id: &str,
    user_state: &std::sync::Arc<tokio::sync::Mutex<UserState>>,
    tx: &mpsc::Sender<ServerEvent>,
) {
    let Ok(event) = serde_json::from_str::<ClientEvent>(text) else {
        return;
    };

    match event {
        // Bypasses the per-user lock entirely (spec §4.5): a pong must
        // never wait behind a slow-running dispatch for the same user.
        ClientEvent::Ping => {
            let _ = tx.send(ServerEvent::Pong).await;
        }
        ClientEvent::Resync => {
            let events = {
                let mut guard = user_state.lock().await;
                resync_events(&mut guard, &app_state.history, user_key).await
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }
        ClientEvent::Message { text, images } => {
            let trimmed = text.trim().to_string();
            if trimmed.is_empty() && images.is_empty() {
                return;
            }

            let has_images = if images.is_empty() { None } else { Some(true) };
            let image_count = if images.is_empty() {
                None
            } else {
                Some(images.len() as u32)
            };
            let stored = StoredMessage {
                id: next_message_id("in"),
                text: trimmed.clone(),
                timestamp: now_ms(),
                role: MessageRole::User,
                media_url: None,
                has_images,
                image_count,
            };

            if let Err(e) = app_state.history.append_message(user_key, stored.clone()).await {
                debug!(user = %user_key.as_str(), "failed to persist inbound message: {e}");
            }
            broadcast(user_state, |seq| ServerEvent::Message {
                msg: stored.clone(),
                seq,
            })
            .await;

            tokio::spawn(dispatch_inbound(
                user_key.clone(),
                account_id.to_string(),
                trimmed,
                images,
                std::sync::Arc::clone(user_state),
                std::sync::Arc::clone(&app_state.history),
                std::sync::Arc::clone(&app_state.push),
                std::sync::Arc::clone(&app_state.agent),
            ));
        }
    }
}
