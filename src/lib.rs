pub mod error;
pub mod feed;
pub mod idle;
pub mod mode;
pub mod session;
pub mod storage;
pub mod transport;

pub use parley_types as types;

pub use error::{IdleConfigError, ModeChangeError};
pub use feed::{ConversationFeedState, FeedStore, MessagePatch};
pub use idle::{IdleTimeoutConfig, IdleTimer, IdleTimerState};
pub use mode::{ModeNegotiator, NegotiationState};
pub use session::SessionController;
pub use storage::{KeyValueStorage, MemoryStorage};
pub use transport::{DisconnectHandler, SignalTransport, TransportError, TransportEvent};

/// State-change notifications fanned out by the session to whoever is
/// rendering it. Sent over a `tokio::sync::broadcast` channel; slow or
/// absent subscribers never block the engine.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A mode change was confirmed by the agent.
    ModeChanged(types::ResponseMode),
    /// A mode change failed; carries the user-facing message.
    ModeError(String),
    /// The conversation feed gained or changed an entry.
    FeedUpdated,
    /// The idle countdown entered the warning phase, with seconds left.
    IdleWarning(u32),
    /// The idle countdown reached zero; the disconnect handler has fired.
    IdleExpired,
    /// The session tore down and its state was cleared.
    SessionEnded,
}
