pub mod events;
pub mod message;

pub use events::{ResponseMode, SignalMessage, TranscriptionSegment};
pub use message::{DeliveryMethod, MessageError, Sender, Timestamp, UnifiedMessage};
