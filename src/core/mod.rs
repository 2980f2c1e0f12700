//! The hard core: retry/backoff, credentials, timers, sessions, transcript
//! aggregation, WebRTC transport, connection recovery, the conversation
//! state machine, and the interruption engine (C1–C9).

pub mod conversation;
pub mod credential;
pub mod interruption;
pub mod recovery;
pub mod retry;
pub mod session;
pub mod timers;
pub mod transcript;
pub mod transport;

pub use conversation::{ConversationInput, ConversationState, ConversationStateMachine, TurnContext, TurnRole};
pub use credential::{CredentialService, KeyInfo, KeyResult, SharedCredentialService};
pub use interruption::{InterruptionEngine, InterruptionEvent, InterruptionPolicy};
pub use recovery::{RecoveryEvent, RecoveryManager, RecoveryStrategy};
pub use retry::{BreakerState, JitterStrategy, RetryContext, RetryEnvelope, RetryExecutor, RetryPolicy};
pub use session::{RecoverySnapshot, SessionEvent, SessionInfo, SessionManager, SessionState};
pub use timers::{TimerManager, TimerStatus};
pub use transcript::{RawRealtimeEvent, TranscriptAggregator, TranscriptDeltaEvent, TranscriptFinalEvent};
pub use transport::{ConnectionState, ConnectionStats, TransportEvent, WebRtcTransport};
