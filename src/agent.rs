//! The agent runtime capability (spec §4.6, §6).
//!
//! The agent itself — message routing, model selection, reply generation —
//! is deliberately out of scope (spec §1): it is consumed here as an opaque,
//! process-wide capability injected once at startup, matching the teacher's
//! pattern of holding long-lived singletons (`AppState`) behind an `Arc` and
//! threading them through handlers rather than constructing them per call.
//! Spec §9 calls for "an initializer that fails loudly if called before
//! injection" — expressed here as the type system itself: `AppState::agent`
//! is a non-optional `Arc<dyn AgentRuntime>`, so a relay can't be assembled
//! without one.

use async_trait::async_trait;

use crate::state::UserKey;

/// Which phase of a reply a [`DeliverCallback`] invocation represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverKind {
    /// A partial chunk; more chunks (or a final) may follow.
    Block,
    /// The last chunk of this reply. May carry an empty `chunk`.
    Final,
}

/// Metadata accompanying a `deliver` callback invocation.
#[derive(Debug, Clone, Copy)]
pub struct DeliverInfo {
    pub kind: DeliverKind,
}

/// Everything [`AgentRuntime::dispatch`] needs to route and format one
/// user message (spec §6: "resolve a store path... format an inbound
/// envelope... finalize an inbound context object").
pub struct InboundContext {
    pub user_key: UserKey,
    pub account_id: String,
    pub text: String,
    pub images: Vec<crate::dispatch::ImageAttachment>,
}

/// The capability the relay consumes from the host agent process. The
/// contract is exactly what §4.6 drives: resolve routing, dispatch with a
/// `deliver`/`onError` pair, nothing more — variance in how the runtime
/// itself is constructed or configured is out of scope here.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Resolve the session key / agent id to dispatch this message to.
    /// Best-effort; failures are swallowed by the caller (spec §4.6 step 2).
    async fn record_session_metadata(&self, ctx: &InboundContext);

    /// Drive the reply. `deliver` is invoked zero or more times with
    /// `DeliverKind::Block` chunks followed by exactly one
    /// `DeliverKind::Final` (which may carry an empty chunk), and `on_error`
    /// is invoked if the runtime fails. Both callbacks are plain closures
    /// rather than a channel since the relay needs to react synchronously
    /// (append-then-broadcast) to each one.
    async fn dispatch(
        &self,
        ctx: InboundContext,
        deliver: Box<dyn FnMut(String, DeliverInfo) + Send>,
        on_error: Box<dyn FnMut(String) + Send>,
    );
}
