use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Agent,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Agent => "agent",
        }
    }
}

/// How a chat message reached the client. Only the data channel exists today;
/// the enum leaves room for future delivery methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeliveryMethod {
    #[serde(rename = "data-channel")]
    DataChannel,
}

impl Default for DeliveryMethod {
    fn default() -> Self {
        DeliveryMethod::DataChannel
    }
}

/// A point in time accepted either as epoch milliseconds or as an already
/// structured value. Factories normalize everything to `DateTime<Utc>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(Utc::now())
    }

    pub fn into_inner(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Timestamp(value)
    }
}

impl From<i64> for Timestamp {
    fn from(epoch_ms: i64) -> Self {
        // Out-of-range values clamp to the epoch rather than panic.
        Timestamp(
            Utc.timestamp_millis_opt(epoch_ms)
                .single()
                .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap()),
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MessageError {
    #[error("message content must be a non-empty string")]
    EmptyContent,
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
}

/// A single entry in the unified conversation feed. Transcription entries come
/// from the speech-to-text stream; chat entries arrive over the data channel.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnifiedMessage {
    #[serde(rename_all = "camelCase")]
    Transcription {
        id: String,
        content: String,
        timestamp: DateTime<Utc>,
        sender: Sender,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        id: String,
        content: String,
        timestamp: DateTime<Utc>,
        sender: Sender,
        delivery_method: DeliveryMethod,
    },
}

impl UnifiedMessage {
    /// Builds a transcription entry with a fresh id, stamped now.
    pub fn transcription(content: &str, sender: Sender, is_final: bool) -> Self {
        Self::transcription_at(content, sender, is_final, Timestamp::now())
    }

    pub fn transcription_at(
        content: &str,
        sender: Sender,
        is_final: bool,
        timestamp: impl Into<Timestamp>,
    ) -> Self {
        UnifiedMessage::Transcription {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            timestamp: timestamp.into().into_inner(),
            sender,
            is_final,
            confidence: None,
            language: None,
        }
    }

    /// Builds a chat entry with a fresh id, stamped now.
    pub fn chat(content: &str, sender: Sender) -> Self {
        Self::chat_at(content, sender, Timestamp::now())
    }

    pub fn chat_at(content: &str, sender: Sender, timestamp: impl Into<Timestamp>) -> Self {
        UnifiedMessage::Chat {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            timestamp: timestamp.into().into_inner(),
            sender,
            delivery_method: DeliveryMethod::DataChannel,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        match &mut self {
            UnifiedMessage::Transcription { id: slot, .. }
            | UnifiedMessage::Chat { id: slot, .. } => *slot = id.to_string(),
        }
        self
    }

    pub fn with_confidence(mut self, value: f64) -> Self {
        if let UnifiedMessage::Transcription { confidence, .. } = &mut self {
            *confidence = Some(value);
        }
        self
    }

    pub fn with_language(mut self, tag: &str) -> Self {
        if let UnifiedMessage::Transcription { language, .. } = &mut self {
            *language = Some(tag.to_string());
        }
        self
    }

    pub fn id(&self) -> &str {
        match self {
            UnifiedMessage::Transcription { id, .. } | UnifiedMessage::Chat { id, .. } => id,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            UnifiedMessage::Transcription { content, .. }
            | UnifiedMessage::Chat { content, .. } => content,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            UnifiedMessage::Transcription { timestamp, .. }
            | UnifiedMessage::Chat { timestamp, .. } => *timestamp,
        }
    }

    pub fn sender(&self) -> Sender {
        match self {
            UnifiedMessage::Transcription { sender, .. }
            | UnifiedMessage::Chat { sender, .. } => *sender,
        }
    }

    pub fn is_transcription(&self) -> bool {
        matches!(self, UnifiedMessage::Transcription { .. })
    }

    pub fn is_chat(&self) -> bool {
        matches!(self, UnifiedMessage::Chat { .. })
    }

    /// Chat entries count as final; only an interim transcription is not.
    pub fn is_final(&self) -> bool {
        match self {
            UnifiedMessage::Transcription { is_final, .. } => *is_final,
            UnifiedMessage::Chat { .. } => true,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            UnifiedMessage::Transcription { confidence, .. } => *confidence,
            UnifiedMessage::Chat { .. } => None,
        }
    }

    pub fn language(&self) -> Option<&str> {
        match self {
            UnifiedMessage::Transcription { language, .. } => language.as_deref(),
            UnifiedMessage::Chat { .. } => None,
        }
    }

    pub fn set_content(&mut self, text: &str) {
        match self {
            UnifiedMessage::Transcription { content, .. }
            | UnifiedMessage::Chat { content, .. } => *content = text.to_string(),
        }
    }

    pub fn push_content(&mut self, chunk: &str) {
        match self {
            UnifiedMessage::Transcription { content, .. }
            | UnifiedMessage::Chat { content, .. } => content.push_str(chunk),
        }
    }

    pub fn set_timestamp(&mut self, at: impl Into<Timestamp>) {
        let at = at.into().into_inner();
        match self {
            UnifiedMessage::Transcription { timestamp, .. }
            | UnifiedMessage::Chat { timestamp, .. } => *timestamp = at,
        }
    }

    pub fn set_final(&mut self, value: bool) {
        if let UnifiedMessage::Transcription { is_final, .. } = self {
            *is_final = value;
        }
    }

    pub fn set_confidence(&mut self, value: Option<f64>) {
        if let UnifiedMessage::Transcription { confidence, .. } = self {
            *confidence = value;
        }
    }

    /// Strict structural check applied to persisted/restored entries. Interim
    /// and streaming entries may be empty transiently in memory, but an empty
    /// snapshot entry is treated as corrupt.
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.content().is_empty() {
            return Err(MessageError::EmptyContent);
        }
        if let Some(c) = self.confidence() {
            if !(0.0..=1.0).contains(&c) {
                return Err(MessageError::ConfidenceOutOfRange(c));
            }
        }
        Ok(())
    }
}

/// Standalone predicates mirroring the factory rules, for callers that
/// validate raw fields before constructing a message.
pub fn is_valid_content(content: &str) -> bool {
    !content.is_empty()
}

pub fn is_valid_confidence(confidence: Option<f64>) -> bool {
    confidence.map_or(true, |c| (0.0..=1.0).contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factories_assign_unique_ids_and_normalize_timestamps() {
        let a = UnifiedMessage::transcription("hello", Sender::User, false);
        let b = UnifiedMessage::transcription("hello", Sender::User, false);
        assert_ne!(a.id(), b.id());

        let at_epoch_ms = UnifiedMessage::chat_at("hi", Sender::Agent, 1_700_000_000_123i64);
        assert_eq!(at_epoch_ms.timestamp().timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn validate_rejects_empty_content_and_bad_confidence() {
        let empty = UnifiedMessage::chat("", Sender::User);
        assert_eq!(empty.validate(), Err(MessageError::EmptyContent));

        let bad = UnifiedMessage::transcription("ok", Sender::User, true).with_confidence(1.5);
        assert!(matches!(
            bad.validate(),
            Err(MessageError::ConfidenceOutOfRange(_))
        ));

        let good = UnifiedMessage::transcription("ok", Sender::User, true).with_confidence(0.93);
        assert!(good.validate().is_ok());
    }

    #[test]
    fn serde_uses_type_tag_and_camel_case_fields() {
        let msg = UnifiedMessage::transcription_at("bonjour", Sender::Agent, true, 0i64)
            .with_language("fr");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transcription");
        assert_eq!(json["isFinal"], true);
        assert_eq!(json["language"], "fr");
        assert!(json.get("confidence").is_none());

        let chat = UnifiedMessage::chat("hi", Sender::User);
        let json = serde_json::to_value(&chat).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["deliveryMethod"], "data-channel");
    }

    #[test]
    fn content_predicates() {
        assert!(is_valid_content("x"));
        assert!(!is_valid_content(""));
        assert!(is_valid_confidence(None));
        assert!(is_valid_confidence(Some(0.0)));
        assert!(is_valid_confidence(Some(1.0)));
        assert!(!is_valid_confidence(Some(-0.1)));
        assert!(!is_valid_confidence(Some(1.01)));
    }
}
