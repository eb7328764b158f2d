//! Per-user in-memory state and the registry that owns it.
//!
//! Mirrors the teacher's `SessionManager { sessions: Arc<RwLock<HashMap<..>>>
//! }` split: a coarse lock guards the map itself (looked up or inserted into
//! only on first reference to a `UserKey`), while each `UserState` is
//! individually guarded by its own `Mutex` so that operations for different
//! users never contend (spec §5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::agent::AgentRuntime;
use crate::broadcast::ServerEvent;
use crate::config::Config;
use crate::history::HistoryStore;
use crate::push::PushSink;

/// Maximum number of seq-bearing events retained in a user's replay buffer.
pub const MAX_EVENT_BUFFER: usize = 500;

/// The identity of a conversation: a base user plus an optional session
/// discriminator. `sessionId == "default"` collapses to the bare base id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserKey {
    base_user_id: String,
    session_id: String,
}

impl UserKey {
    pub fn new(base_user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            base_user_id: base_user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn base_user_id(&self) -> &str {
        &self.base_user_id
    }

    /// The canonical string form used for file names, lookups, and the
    /// `"pwa-chat:"`-prefixed target strings accepted by `pushOutboundMessage`.
    pub fn as_str(&self) -> String {
        if self.session_id == "default" {
            self.base_user_id.clone()
        } else {
            format!("{}:{}", self.base_user_id, self.session_id)
        }
    }

    /// Parse a canonical `"base"` or `"base:session"` string back into a key.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((base, session)) => Self::new(base, session),
            None => Self::new(raw, "default"),
        }
    }
}

/// A single connected browser tab.
pub struct ClientInfo {
    pub connection_id: Uuid,
    pub sender: mpsc::Sender<ServerEvent>,
}

/// "An assistant reply is currently being produced" for one user.
pub struct StreamingState {
    pub text: String,
    /// Aborts the previous inactivity-timeout task; a fresh one is spawned
    /// on every `setStreamingText` call.
    pub timeout_task: tokio::task::JoinHandle<()>,
}

impl Drop for StreamingState {
    fn drop(&mut self) {
        self.timeout_task.abort();
    }
}

/// In-memory state for one `UserKey`. Guarded by a single `Mutex` so that
/// sequence assignment, buffer mutation, and client fan-out happen
/// atomically with respect to each other (spec §5).
pub struct UserState {
    pub sequence: u64,
    pub event_buffer: VecDeque<(u64, ServerEvent)>,
    pub clients: Vec<ClientInfo>,
    pub streaming: Option<StreamingState>,
}

impl UserState {
    fn new() -> Self {
        Self {
            sequence: 0,
            event_buffer: VecDeque::new(),
            clients: Vec::new(),
            streaming: None,
        }
    }

    /// Smallest seq still held in the buffer, or the current sequence if the
    /// buffer is empty (spec §3 invariant: `min == max(0, sequence - len)`).
    pub fn buffer_min_seq(&self) -> u64 {
        self.event_buffer
            .front()
            .map_or(self.sequence, |(seq, _)| *seq)
    }

    pub fn buffer_max_seq(&self) -> Option<u64> {
        self.event_buffer.back().map(|(seq, _)| *seq)
    }

    /// Whether `since` falls within the currently buffered window, i.e. a
    /// catch-up replay (rather than a full resync) is possible.
    pub fn covers(&self, since: u64) -> bool {
        match self.buffer_max_seq() {
            Some(max) => since >= self.buffer_min_seq() && since <= max,
            None => false,
        }
    }
}

/// Registry owning every user's state, keyed coarsely and internally
/// fine-grained (spec §5).
#[derive(Clone)]
pub struct UserStates {
    inner: Arc<RwLock<HashMap<UserKey, Arc<Mutex<UserState>>>>>,
}

impl UserStates {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch the state for `key`, creating it lazily on first reference.
    pub async fn get_or_create(&self, key: &UserKey) -> Arc<Mutex<UserState>> {
        if let Some(state) = self.inner.read().await.get(key) {
            return Arc::clone(state);
        }
        let mut map = self.inner.write().await;
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(UserState::new()))),
        )
    }

    /// Number of distinct `UserKey`s ever referenced (process lifetime).
    ///
    /// This map grows without bound as distinct users connect; spec §9 notes
    /// this as an open gap (no LRU eviction is implemented here).
    pub async fn tracked_user_count(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for UserStates {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared application state, threaded through every axum handler via the
/// `State` extractor — directly mirroring the teacher's `AppState`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub user_states: UserStates,
    pub history: Arc<HistoryStore>,
    pub push: Arc<PushSink>,
    pub agent: Arc<dyn AgentRuntime>,
}
