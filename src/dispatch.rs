//! InboundDispatcher (spec §4.6): drives one agent reply per inbound user
//! message, streaming progress back through [`crate::streaming`] and
//! [`crate::broadcast`].
//!
//! Grounded on the teacher's `handle_session_exec` (build an execution
//! context, invoke the long-running operation, stream partial output back
//! to subscribers, always perform a final cleanup step regardless of how
//! the operation ended) generalized from a shell command's stdout chunks to
//! an agent's reply chunks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::agent::{AgentRuntime, DeliverKind, InboundContext};
use crate::broadcast::{broadcast, ServerEvent};
use crate::history::{HistoryStore, MessageRole, StoredMessage};
use crate::ids::next_message_id;
use crate::push::PushSink;
use crate::state::{UserKey, UserState};
use crate::streaming::{end_streaming, set_streaming_text};

/// An inbound image attachment, carried alongside `text` on a `message`
/// event (spec §3, §6). Persisted as metadata only — the image bytes
/// themselves are not retained by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Current wall-clock time in milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `pushOutboundMessage` (spec §4.6): persist and broadcast an
/// assistant-authored message, notifying via push if nobody is listening
/// live. `target` may carry a `"pwa-chat:"` prefix (stripped before use) —
/// the prefix lets an external caller address this relay's users alongside
/// other channels without ambiguity.
pub async fn push_outbound_message(
    target: &str,
    text: &str,
    media_url: Option<String>,
    user_state: &Arc<Mutex<UserState>>,
    history: &HistoryStore,
    push: &PushSink,
) {
    let user_key = UserKey::parse(target.strip_prefix("pwa-chat:").unwrap_or(target));

    let msg = StoredMessage {
        id: next_message_id("out"),
        text: text.to_string(),
        timestamp: now_ms(),
        role: MessageRole::Assistant,
        media_url,
        has_images: None,
        image_count: None,
    };

    if let Err(e) = history.append_message(&user_key, msg.clone()).await {
        warn!(user = %user_key.as_str(), "failed to persist outbound message: {e}");
    }

    broadcast(user_state, |seq| ServerEvent::Message {
        msg: msg.clone(),
        seq,
    })
    .await;

    let client_count = user_state.lock().await.clients.len();
    if client_count == 0 {
        let body = truncate_with_ellipsis(text, 100);
        push.send_push(&user_key, "New message", &body, "pwa-chat-message").await;
    }
}

fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

/// Drive one agent reply for `text`/`images` sent by `user_key`, streaming
/// progress back and performing the safety flush described in spec §4.6
/// step 7 regardless of how the dispatch ended.
///
/// `deliver` itself stays a plain synchronous closure (the runtime contract,
/// spec §6, drives it that way) but merely forwards each chunk onto an
/// unbounded channel; a single task drains that channel in arrival order and
/// does the actual accumulate-then-broadcast work. That keeps chunks strictly
/// ordered and — critically — lets us `.await` the drain task's completion
/// before the safety flush inspects `accumulatedText`/`finalDelivered`,
/// rather than racing against fire-and-forget tasks spawned per chunk.
pub async fn dispatch_inbound(
    user_key: UserKey,
    account_id: String,
    text: String,
    images: Vec<ImageAttachment>,
    user_state: Arc<Mutex<UserState>>,
    history: Arc<HistoryStore>,
    push: Arc<PushSink>,
    agent: Arc<dyn AgentRuntime>,
) {
    let ctx = InboundContext {
        user_key: user_key.clone(),
        account_id,
        text,
        images,
    };

    agent.record_session_metadata(&ctx).await;

    let (chunk_tx, mut chunk_rx) = tokio::sync::mpsc::unbounded_channel::<(String, DeliverKind)>();

    let deliver = Box::new(move |chunk: String, info: crate::agent::DeliverInfo| {
        let _ = chunk_tx.send((chunk, info.kind));
    });

    let on_error = Box::new(move |err: String| {
        error!("agent dispatch error: {err}");
    });

    let drain_task = {
        let user_state = Arc::clone(&user_state);
        let history = Arc::clone(&history);
        let push = Arc::clone(&push);
        let user_key = user_key.clone();

        tokio::spawn(async move {
            let mut accumulated = String::new();
            let mut final_delivered = false;

            while let Some((chunk, kind)) = chunk_rx.recv().await {
                match kind {
                    DeliverKind::Block => {
                        if chunk.is_empty() {
                            continue;
                        }
                        accumulated.push_str(&chunk);
                        set_streaming_text(&user_state, accumulated.clone()).await;
                    }
                    DeliverKind::Final => {
                        accumulated.push_str(&chunk);
                        final_delivered = true;
                        if !accumulated.is_empty() {
                            push_outbound_message(
                                &user_key.as_str(),
                                &accumulated,
                                None,
                                &user_state,
                                &history,
                                &push,
                            )
                            .await;
                            end_streaming(&user_state).await;
                        }
                    }
                }
            }

            (accumulated, final_delivered)
        })
    };

    agent.dispatch(ctx, deliver, on_error).await;

    // `deliver` (and the sender it closed over) was consumed by `dispatch`
    // above, so the channel closes here and `drain_task` finishes once it has
    // processed every chunk already sent.
    let (leftover, final_delivered) = drain_task.await.unwrap_or_default();

    // Safety flush (spec §4.6 step 7): if the dispatch returned without ever
    // delivering a final chunk but text had accumulated, flush it now so a
    // dropped/erroring agent invocation never silently loses a reply.
    if !final_delivered && !leftover.is_empty() {
        push_outbound_message(
            &user_key.as_str(),
            &leftover,
            None,
            &user_state,
            &history,
            &push,
        )
        .await;
        end_streaming(&user_state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::ScriptedAgent;
    use crate::agent::DeliverKind;
    use crate::push::{PushSink, PushSubscription, PushTransport};
    use crate::state::UserStates;
    use async_trait::async_trait;

    struct NoopTransport;
    #[async_trait]
    impl PushTransport for NoopTransport {
        async fn send(
            &self,
            _subscription: &PushSubscription,
            _vapid: &crate::push::VapidKeys,
            _payload: &crate::push::PushPayload,
        ) -> Result<(), crate::push::PushSendError> {
            Ok(())
        }
    }

    async fn test_push() -> Arc<PushSink> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(PushSink::load(dir.path(), Arc::new(NoopTransport)).await)
    }

    #[tokio::test]
    async fn truncate_with_ellipsis_leaves_short_text_untouched() {
        assert_eq!(truncate_with_ellipsis("hi", 100), "hi");
    }

    #[tokio::test]
    async fn truncate_with_ellipsis_adds_marker_past_limit() {
        let long = "a".repeat(150);
        let truncated = truncate_with_ellipsis(&long, 100);
        assert_eq!(truncated.chars().count(), 101);
        assert!(truncated.ends_with('…'));
    }

    #[tokio::test]
    async fn full_dispatch_streams_blocks_then_final_message() {
        let registry = UserStates::new();
        let key = UserKey::new("u1", "default");
        let state = registry.get_or_create(&key).await;
        let history_dir = tempfile::tempdir().unwrap();
        let history = Arc::new(HistoryStore::new(history_dir.path()));
        let push = test_push().await;
        let agent: Arc<dyn AgentRuntime> = Arc::new(ScriptedAgent {
            script: vec![
                ("hel".to_string(), DeliverKind::Block),
                ("lo".to_string(), DeliverKind::Final),
            ],
            error: None,
            recorded_contexts: Default::default(),
        });

        dispatch_inbound(
            key.clone(),
            "acct".to_string(),
            "hi".to_string(),
            vec![],
            Arc::clone(&state),
            Arc::clone(&history),
            push,
            agent,
        )
        .await;

        let history_rows = history.read_history(&key).await;
        assert_eq!(history_rows.len(), 1);
        assert_eq!(history_rows[0].text, "hello");
        assert_eq!(history_rows[0].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn safety_flush_delivers_text_when_final_never_arrives() {
        let registry = UserStates::new();
        let key = UserKey::new("u1", "default");
        let state = registry.get_or_create(&key).await;
        let history_dir = tempfile::tempdir().unwrap();
        let history = Arc::new(HistoryStore::new(history_dir.path()));
        let push = test_push().await;
        let agent: Arc<dyn AgentRuntime> = Arc::new(ScriptedAgent {
            script: vec![("partial".to_string(), DeliverKind::Block)],
            error: Some("agent crashed".to_string()),
            recorded_contexts: Default::default(),
        });

        dispatch_inbound(
            key.clone(),
            "acct".to_string(),
            "hi".to_string(),
            vec![],
            Arc::clone(&state),
            Arc::clone(&history),
            push,
            agent,
        )
        .await;

        let history_rows = history.read_history(&key).await;
        assert_eq!(history_rows.len(), 1);
        assert_eq!(history_rows[0].text, "partial");
    }

    #[tokio::test]
    async fn push_outbound_message_strips_channel_prefix() {
        let registry = UserStates::new();
        let key = UserKey::new("u1", "default");
        let state = registry.get_or_create(&key).await;
        let history_dir = tempfile::tempdir().unwrap();
        let history = HistoryStore::new(history_dir.path());
        let push = test_push().await;

        push_outbound_message("pwa-chat:u1", "hello", None, &state, &history, &push).await;

        let rows = history.read_history(&key).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].role, MessageRole::Assistant);
    }
}
