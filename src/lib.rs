//! Session lifecycle, WebRTC transport, and conversation state machine core
//! for a voice-driven coding assistant.
//!
//! `core` holds the spec's C1–C9 components (retry/backoff, credentials,
//! timers, the session manager, transcript aggregation, WebRTC transport,
//! connection recovery, the conversation state machine, and the
//! interruption engine). [`ExtensionController`] is C10: it wires all of the
//! above in dependency order for an embedding host. `config`, `errors`,
//! `events` and `disposal` are the ambient stack every component builds on.
//! `state`, `middleware` and `routes` back the dev control server binary
//! only — see `src/main.rs`.

pub mod config;
pub mod controller;
pub mod core;
pub mod disposal;
pub mod errors;
pub mod events;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::AssistantConfig;
pub use controller::ExtensionController;
pub use core::*;
pub use errors::{AppError, AppResult};
pub use state::AppState;
