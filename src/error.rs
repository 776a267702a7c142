use std::time::Duration;

/// Failure modes of a mode-change request. All of these leave the negotiator
/// back in a confirmed state; none are fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum ModeChangeError {
    #[error("data channel is not available")]
    ChannelUnavailable,
    #[error("failed to send mode change request: {0}")]
    SendFailed(String),
    #[error("no confirmation received within {0:?}")]
    ConfirmationTimeout(Duration),
    #[error("request superseded by a newer mode change")]
    Superseded,
    #[error("failed to encode mode change request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Field-level rejection of an idle timeout configuration. The previous
/// configuration stays in effect when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid idle timeout config: {field}: {reason}")]
pub struct IdleConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl IdleConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}
