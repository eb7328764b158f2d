//! Server-originated wire events and the fan-out broadcaster.
//!
//! Grounded on the teacher's `sessions::buffer::OutputBuffer::push` (assign
//! seq, evict oldest, notify) generalized from one ring buffer per shell
//! session to one per `UserKey`, and on `AppState::session_events`'s
//! broadcast-to-all-clients pattern generalized to per-client `mpsc`
//! senders so a single dead client can't stall delivery to the others
//! (spec §4.3).

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::history::StoredMessage;
use crate::state::{UserState, MAX_EVENT_BUFFER};

/// A server-to-client event. Every variant but [`ServerEvent::Pong`] carries
/// a `seq` assigned at broadcast time (spec §3).
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "connectionId")]
        connection_id: Uuid,
        seq: u64,
    },
    #[serde(rename = "history")]
    History {
        messages: Vec<StoredMessage>,
        seq: u64,
    },
    #[serde(rename = "message")]
    Message { msg: StoredMessage, seq: u64 },
    #[serde(rename = "streaming")]
    Streaming { text: String, seq: u64 },
    #[serde(rename = "streaming_end")]
    StreamingEnd { seq: u64 },
    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    pub fn seq(&self) -> Option<u64> {
        match self {
            ServerEvent::Hello { seq, .. }
            | ServerEvent::History { seq, .. }
            | ServerEvent::Message { seq, .. }
            | ServerEvent::Streaming { seq, .. }
            | ServerEvent::StreamingEnd { seq } => Some(*seq),
            ServerEvent::Pong => None,
        }
    }
}

/// Assign the next seq for `user_state`, append to its replay buffer
/// (evicting the oldest entry past [`MAX_EVENT_BUFFER`]), and fan out to
/// every currently-registered client. Returns the sequenced event.
///
/// Takes a builder rather than a finished event because the seq must be
/// known before the event can be constructed.
pub async fn broadcast<F>(user_state: &Mutex<UserState>, build: F) -> ServerEvent
where
    F: FnOnce(u64) -> ServerEvent,
{
    let mut state = user_state.lock().await;
    broadcast_locked(&mut state, build).await
}

/// Same as [`broadcast`] but operating on an already-locked [`UserState`].
/// Used by callers (e.g. `streaming.rs`) that need the seq assignment and a
/// subsequent state mutation to happen under one critical section.
pub async fn broadcast_locked<F>(state: &mut UserState, build: F) -> ServerEvent
where
    F: FnOnce(u64) -> ServerEvent,
{
    let seq = state.sequence;
    state.sequence += 1;
    let event = build(seq);
    push_buffered(state, seq, event.clone());

    for client in &state.clients {
        if client.sender.send(event.clone()).await.is_err() {
            debug!(connection_id = %client.connection_id, "failed to send event to client, will be cleaned up on close");
        }
    }

    event
}

/// Append a seq-bearing event to the replay buffer, evicting the oldest
/// entry past [`MAX_EVENT_BUFFER`]. Exposed so the connection handler can
/// buffer the per-connection `history`/`streaming` events it assigns during
/// a full sync (spec §4.5) without duplicating the eviction logic.
pub(crate) fn push_buffered(state: &mut UserState, seq: u64, event: ServerEvent) {
    state.event_buffer.push_back((seq, event));
    if state.event_buffer.len() > MAX_EVENT_BUFFER {
        state.event_buffer.pop_front();
    }
}
