use std::fmt;
use std::str::FromStr;

/// Whether the agent answers with synthesized speech or written text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Voice,
    Chat,
}

impl ResponseMode {
    pub fn opposite(self) -> Self {
        match self {
            ResponseMode::Voice => ResponseMode::Chat,
            ResponseMode::Chat => ResponseMode::Voice,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Voice => "voice",
            ResponseMode::Chat => "chat",
        }
    }
}

impl Default for ResponseMode {
    fn default() -> Self {
        ResponseMode::Voice
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" => Ok(ResponseMode::Voice),
            "chat" => Ok(ResponseMode::Chat),
            other => Err(format!("unknown response mode: {other}")),
        }
    }
}

/// JSON payloads exchanged over the data channel, discriminated by `type`.
///
/// `set_response_mode` is the only outbound kind; everything else arrives
/// from the agent. Unknown `type` values fail to decode and are ignored by
/// the ingress handler.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    SetResponseMode {
        mode: ResponseMode,
    },
    ResponseModeUpdated {
        mode: ResponseMode,
    },
    ChatMessage {
        message: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ChatChunk {
        message_id: String,
        chunk: String,
        is_complete: bool,
        timestamp: i64,
    },
}

impl SignalMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A speech-to-text result pushed by the transport, outside the JSON channel.
/// Non-final segments are interim and will be superseded by a later final
/// segment with the same id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptionSegment {
    pub id: String,
    pub text: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}
