//! Replays a scripted conversation through the session engine with an
//! in-process loopback transport that plays an agreeable agent: every
//! `set_response_mode` request is confirmed immediately.
//!
//! Run with: `cargo run --example session_replay`

use std::sync::Arc;

use async_trait::async_trait;
use parley::types::{ResponseMode, SignalMessage, TranscriptionSegment};
use parley::{
    DisconnectHandler, MemoryStorage, SessionController, SignalTransport, TransportError,
    TransportEvent,
};
use tokio::sync::mpsc;

struct LoopbackTransport {
    // Weak so the session can still shut down once main drops its sender.
    inbound: mpsc::WeakSender<TransportEvent>,
}

#[async_trait]
impl SignalTransport for LoopbackTransport {
    async fn publish_reliable(&self, payload: &[u8]) -> Result<(), TransportError> {
        if let Ok(SignalMessage::SetResponseMode { mode }) = SignalMessage::decode(payload) {
            let confirmation = SignalMessage::ResponseModeUpdated { mode }
                .encode()
                .map_err(|e| TransportError(e.to_string()))?;
            let Some(inbound) = self.inbound.upgrade() else {
                return Ok(());
            };
            inbound
                .send(TransportEvent::Data(confirmation))
                .await
                .map_err(|e| TransportError(e.to_string()))?;
        }
        Ok(())
    }
}

struct LogDisconnect;

#[async_trait]
impl DisconnectHandler for LogDisconnect {
    async fn disconnect(&self) {
        println!("idle timer asked for a disconnect");
    }
}

fn segment(id: &str, text: &str, is_final: bool) -> TransportEvent {
    TransportEvent::Transcription {
        segment: TranscriptionSegment {
            id: id.to_string(),
            text: text.to_string(),
            is_final,
            language: Some("en".to_string()),
        },
        from_local: true,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let controller = SessionController::new(
        "demo-session",
        Arc::new(LoopbackTransport {
            inbound: inbound_tx.downgrade(),
        }),
        inbound_rx,
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryStorage::new()),
        Arc::new(LogDisconnect),
    );

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("session event: {event:?}");
        }
    });

    let negotiator = controller.negotiator();
    let session = tokio::spawn(controller.run());

    inbound_tx.send(TransportEvent::ChannelOpen).await?;

    // A spoken user utterance arriving as interim segments, then final.
    inbound_tx.send(segment("u-1", "switch to", false)).await?;
    inbound_tx
        .send(segment("u-1", "switch to text please", false))
        .await?;
    inbound_tx
        .send(segment("u-1", "Switch to text, please.", true))
        .await?;

    // Let the session loop see the channel open before requesting a mode.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The user flips the agent into chat mode; the loopback agent confirms.
    negotiator.set_mode(ResponseMode::Chat).await?;
    println!("negotiated mode: {}", negotiator.current_mode());

    // The agent now answers over the data channel, streamed in chunks.
    for (chunk, complete) in [("Sure, ", false), ("text it is.", false), ("", true)] {
        inbound_tx
            .send(TransportEvent::Data(
                SignalMessage::ChatChunk {
                    message_id: "a-1".to_string(),
                    chunk: chunk.to_string(),
                    is_complete: complete,
                    timestamp: 1_700_000_000_000,
                }
                .encode()?,
            ))
            .await?;
    }

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    drop(inbound_tx);
    session.await?;
    Ok(())
}
