//! Streaming-reply state machine (spec §4.4).
//!
//! "The agent is producing a reply" is represented per-user by
//! [`crate::state::StreamingState`]. A sliding inactivity deadline protects
//! against a hung agent that never signals `final`: if 30s pass with no
//! `set_streaming_text` call, the state is dropped and `streaming_end` is
//! broadcast automatically.
//!
//! Grounded on the teacher's idle-timeout sweep in
//! `SessionManager::sweep` (a deadline check against `last_activity`), but
//! implemented as a per-user armed timer task rather than a periodic global
//! sweep — spec §9 describes the streaming timeout as "a suspension point"
//! rather than something polled, so each `set_streaming_text` call rearms
//! its own `tokio::time::sleep` future instead of waiting for a shared tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::broadcast::{broadcast_locked, ServerEvent};
use crate::state::{StreamingState, UserState};

/// Inactivity window after which an unfinished stream is force-ended.
pub const STREAMING_TIMEOUT: Duration = Duration::from_secs(30);

/// Record a new cumulative streaming text for this user, broadcasting
/// `streaming{text}` and (re)arming the inactivity deadline. Always emits an
/// event even if `text` is unchanged from the prior call.
pub async fn set_streaming_text(user_state: &Arc<Mutex<UserState>>, text: String) {
    let mut guard = user_state.lock().await;
    broadcast_locked(&mut guard, |seq| ServerEvent::Streaming {
        text: text.clone(),
        seq,
    })
    .await;

    let deadline_target = Arc::clone(user_state);
    let timeout_task = tokio::spawn(async move {
        tokio::time::sleep(STREAMING_TIMEOUT).await;
        end_streaming(&deadline_target).await;
    });

    // Replacing `streaming` drops the prior `StreamingState`, whose `Drop`
    // impl aborts its now-superseded deadline task.
    guard.streaming = Some(StreamingState {
        text,
        timeout_task,
    });
}

/// Cancel the deadline, drop the streaming state, and broadcast
/// `streaming_end`. A no-op if no streaming state is present (reached when
/// the inactivity timer and an explicit end race, or when a safety flush
/// calls this after the state machine already went idle).
pub async fn end_streaming(user_state: &Arc<Mutex<UserState>>) {
    let mut guard = user_state.lock().await;
    if guard.streaming.take().is_none() {
        return;
    }
    broadcast_locked(&mut guard, |seq| ServerEvent::StreamingEnd { seq }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{UserKey, UserStates};

    #[tokio::test(start_paused = true)]
    async fn inactivity_timeout_clears_streaming_and_emits_once() {
        let registry = UserStates::new();
        let state = registry.get_or_create(&UserKey::new("u1", "default")).await;

        set_streaming_text(&state, "hel".to_string()).await;
        assert!(state.lock().await.streaming.is_some());

        tokio::time::advance(STREAMING_TIMEOUT + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        let guard = state.lock().await;
        assert!(guard.streaming.is_none());
        let last = guard.event_buffer.back().unwrap();
        assert!(matches!(last.1, ServerEvent::StreamingEnd { .. }));
    }

    #[tokio::test]
    async fn explicit_end_streaming_is_idempotent() {
        let registry = UserStates::new();
        let state = registry.get_or_create(&UserKey::new("u1", "default")).await;

        set_streaming_text(&state, "hi".to_string()).await;
        end_streaming(&state).await;
        let seq_after_first_end = state.lock().await.sequence;

        end_streaming(&state).await;
        assert_eq!(state.lock().await.sequence, seq_after_first_end);
    }

    #[tokio::test]
    async fn set_streaming_text_always_emits_even_if_text_unchanged() {
        let registry = UserStates::new();
        let state = registry.get_or_create(&UserKey::new("u1", "default")).await;

        set_streaming_text(&state, "same".to_string()).await;
        set_streaming_text(&state, "same".to_string()).await;

        assert_eq!(state.lock().await.sequence, 2);
    }
}
