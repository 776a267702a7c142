use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parley_types::TranscriptionSegment;

#[derive(Debug, thiserror::Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// The slice of the realtime transport this engine depends on: reliable
/// broadcast of a data-channel payload. Connection lifecycle and media
/// tracks stay with the embedder.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn publish_reliable(&self, payload: &[u8]) -> Result<(), TransportError>;
}

/// Invoked exactly once by the idle timer when the silence window elapses.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DisconnectHandler: Send + Sync {
    async fn disconnect(&self);
}

/// Inbound transport activity, delivered to the session controller over an
/// mpsc channel by the embedder's transport binding.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Raw data-channel payload, expected to be UTF-8 JSON.
    Data(Vec<u8>),
    /// A speech-to-text segment, with whether it came from the local user.
    Transcription {
        segment: TranscriptionSegment,
        from_local: bool,
    },
    /// The data channel became usable.
    ChannelOpen,
    /// The data channel went away (reconnect pending or session over).
    ChannelClosed,
}
