use std::sync::Arc;

use parley_types::{ResponseMode, Sender, SignalMessage, TranscriptionSegment, UnifiedMessage};
use tokio::sync::{broadcast, mpsc};

use crate::feed::FeedStore;
use crate::idle::IdleTimer;
use crate::mode::ModeNegotiator;
use crate::storage::KeyValueStorage;
use crate::transport::{DisconnectHandler, SignalTransport, TransportEvent};
use crate::SessionEvent;

/// Wires the feed store, mode negotiation and idle timer to one inbound
/// transport stream. All cross-component propagation happens here by
/// explicit forwarding: confirmed modes are pushed into the feed, feed
/// activity resets the idle timer, and state changes fan out over a
/// broadcast channel.
pub struct SessionController {
    feed: FeedStore,
    negotiator: ModeNegotiator,
    idle: IdleTimer,
    events: broadcast::Sender<SessionEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
}

impl SessionController {
    pub fn new(
        session_id: &str,
        transport: Arc<dyn SignalTransport>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        session_storage: Arc<dyn KeyValueStorage>,
        durable_storage: Arc<dyn KeyValueStorage>,
        on_disconnect: Arc<dyn DisconnectHandler>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let feed = FeedStore::restore(session_id, session_storage.clone());
        let negotiator = ModeNegotiator::new(transport, durable_storage, events.clone());
        let idle = IdleTimer::new(session_storage, on_disconnect, events.clone());
        Self {
            feed,
            negotiator,
            idle,
            events,
            transport_rx,
        }
    }

    /// Receiver of session state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Cloneable handle for UI-driven mode changes (`set_mode`,
    /// `toggle_mode`).
    pub fn negotiator(&self) -> ModeNegotiator {
        self.negotiator.clone()
    }

    pub fn feed(&self) -> &FeedStore {
        &self.feed
    }

    pub fn idle(&self) -> &IdleTimer {
        &self.idle
    }

    /// Drives the session until the transport stream ends, then tears down.
    pub async fn run(mut self) {
        self.idle.start_timer();
        while let Some(event) = self.transport_rx.recv().await {
            self.handle_event(event).await;
        }
        self.teardown();
    }

    pub(crate) async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(payload) => self.handle_payload(&payload),
            TransportEvent::Transcription {
                segment,
                from_local,
            } => self.handle_transcription(segment, from_local),
            TransportEvent::ChannelOpen => {
                self.negotiator.set_channel_available(true);
                self.restore_mode_preference();
            }
            TransportEvent::ChannelClosed => {
                self.negotiator.set_channel_available(false);
            }
        }
    }

    /// Decodes one data-channel payload and routes it. Undecodable payloads
    /// are logged and dropped, never propagated.
    fn handle_payload(&mut self, payload: &[u8]) {
        let message = match SignalMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("ignoring undecodable data channel payload: {e}");
                return;
            }
        };
        match message {
            SignalMessage::ResponseModeUpdated { mode } => {
                if self.negotiator.on_confirmation(mode) {
                    self.feed.set_mode(mode);
                    let _ = self.events.send(SessionEvent::ModeChanged(mode));
                }
            }
            SignalMessage::ChatMessage { message, timestamp } => {
                let chat = UnifiedMessage::chat_at(&message, Sender::Agent, timestamp);
                if self.feed.add_message(chat) {
                    self.touch();
                }
            }
            SignalMessage::ChatChunk {
                message_id,
                chunk,
                is_complete,
                timestamp,
            } => {
                if !self.feed.contains(&message_id) {
                    self.feed
                        .start_streaming_message(&message_id, Sender::Agent, timestamp);
                }
                if !chunk.is_empty() {
                    self.feed.append_chunk(&message_id, &chunk);
                }
                if is_complete {
                    self.feed.complete_streaming_message(&message_id);
                }
                self.touch();
            }
            SignalMessage::SetResponseMode { .. } => {
                // Outbound-only kind; an agent should never send this.
                tracing::debug!("ignoring inbound set_response_mode payload");
            }
        }
    }

    fn handle_transcription(&mut self, segment: TranscriptionSegment, from_local: bool) {
        let sender = if from_local {
            Sender::User
        } else {
            Sender::Agent
        };
        let mut message =
            UnifiedMessage::transcription(&segment.text, sender, segment.is_final)
                .with_id(&segment.id);
        if let Some(language) = &segment.language {
            message = message.with_language(language);
        }
        if !self.feed.add_message(message) {
            return;
        }

        // While in chat mode the agent replies over the data channel, so a
        // finished user utterance is mirrored into the chat log to keep the
        // written conversation coherent. Agent speech is not mirrored; the
        // agent already has an explicit chat-message path.
        if segment.is_final
            && sender == Sender::User
            && self.feed.state().current_mode == ResponseMode::Chat
        {
            self.feed
                .add_message(UnifiedMessage::chat(&segment.text, Sender::User));
        }
        self.touch();
    }

    /// Re-issues the durably stored mode preference once the channel is up,
    /// when it differs from the built-in default.
    fn restore_mode_preference(&self) {
        let Some(preferred) = self.negotiator.stored_preference() else {
            return;
        };
        if preferred == ResponseMode::default() {
            return;
        }
        let negotiator = self.negotiator.clone();
        tokio::spawn(async move {
            if let Err(e) = negotiator.set_mode(preferred).await {
                tracing::warn!("failed to restore preferred response mode: {e}");
            }
        });
    }

    fn touch(&mut self) {
        self.idle.reset_timer();
        let _ = self.events.send(SessionEvent::FeedUpdated);
    }

    /// Cancels the pending mode request (its caller sees a failure), clears
    /// the conversation history, and resets everything to defaults.
    fn teardown(&mut self) {
        tracing::info!("session transport closed, tearing down");
        self.negotiator.reset();
        self.feed.clear_messages();
        self.idle.stop_timer();
        let _ = self.events.send(SessionEvent::SessionEnded);
    }
}
