#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! pwa-chat-relay library — a per-user WebSocket chat relay fronting an
//! injected agent runtime.
//!
//! - `agent` — the `AgentRuntime` capability contract
//! - `auth` — connection/request authorization (AuthGate)
//! - `broadcast` — server-event fan-out and the replay buffer
//! - `config` — configuration loading
//! - `dispatch` — InboundDispatcher: drives one agent reply per message
//! - `error` — crate-level error type for surfaced failures
//! - `history` — per-user message history on disk
//! - `ids` — message id generation
//! - `push` — push-notification sink
//! - `state` — per-user in-memory state and the shared `AppState`
//! - `streaming` — the streaming-reply state machine
//! - `ws` — the WebSocket listener and per-connection handler

pub mod agent;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod ids;
pub mod push;
pub mod state;
pub mod streaming;
pub mod ws;

pub use config::Config;
pub use error::RelayError;
pub use state::AppState;
