use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_types::{ResponseMode, SignalMessage};
use tokio::sync::{broadcast, oneshot};

use crate::error::ModeChangeError;
use crate::storage::KeyValueStorage;
use crate::transport::SignalTransport;
use crate::SessionEvent;

/// How long to wait for the agent to confirm a mode change.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a transient error message stays visible before self-clearing.
pub const ERROR_DISPLAY: Duration = Duration::from_secs(5);
/// Durable storage key for the last confirmed mode.
pub const MODE_PREF_KEY: &str = "response-mode-preference";

/// Observable negotiation state. `is_confirmed` is false exactly while a
/// change request is outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationState {
    pub current_mode: ResponseMode,
    pub is_confirmed: bool,
    pub error_message: Option<String>,
    pub is_channel_available: bool,
}

struct PendingRequest {
    target: ResponseMode,
    generation: u64,
    confirm_tx: oneshot::Sender<()>,
}

struct Inner {
    state: NegotiationState,
    pending: Option<PendingRequest>,
    generation: u64,
    error_epoch: u64,
}

/// Request/confirm state machine for the agent's response mode.
///
/// Confirmed(mode) → `set_mode(target)` → Pending(target, deadline) → on a
/// matching `response_mode_updated` before the deadline → Confirmed(target);
/// on deadline → Confirmed(previous) with a transient error. A superseding
/// `set_mode` while Pending replaces the outstanding request; the superseded
/// caller gets an explicit `Superseded` error.
#[derive(Clone)]
pub struct ModeNegotiator {
    inner: Arc<Mutex<Inner>>,
    transport: Arc<dyn SignalTransport>,
    prefs: Arc<dyn KeyValueStorage>,
    events: broadcast::Sender<SessionEvent>,
}

impl ModeNegotiator {
    /// Initial mode comes from the durable preference when one is stored.
    /// The channel starts unavailable until the transport reports otherwise.
    pub fn new(
        transport: Arc<dyn SignalTransport>,
        prefs: Arc<dyn KeyValueStorage>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let initial = stored_preference(prefs.as_ref()).unwrap_or_default();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: NegotiationState {
                    current_mode: initial,
                    is_confirmed: true,
                    error_message: None,
                    is_channel_available: false,
                },
                pending: None,
                generation: 0,
                error_epoch: 0,
            })),
            transport,
            prefs,
            events,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn current_mode(&self) -> ResponseMode {
        self.inner.lock().unwrap().state.current_mode
    }

    /// The durable preference recorded at the last confirmation, if any.
    pub fn stored_preference(&self) -> Option<ResponseMode> {
        stored_preference(self.prefs.as_ref())
    }

    pub fn set_channel_available(&self, available: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.state.is_channel_available = available;
    }

    /// Requests the given mode from the agent and waits for confirmation.
    ///
    /// Fails fast when the data channel is unavailable. On a send failure or
    /// a missed deadline the state reverts to the previously confirmed mode
    /// and a self-clearing error message is set.
    pub async fn set_mode(&self, target: ResponseMode) -> Result<(), ModeChangeError> {
        let payload = SignalMessage::SetResponseMode { mode: target }.encode()?;

        let (confirm_rx, generation) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.is_channel_available {
                return Err(ModeChangeError::ChannelUnavailable);
            }
            inner.generation += 1;
            let generation = inner.generation;
            let (confirm_tx, confirm_rx) = oneshot::channel();
            // Dropping a replaced request's sender rejects its caller.
            inner.pending = Some(PendingRequest {
                target,
                generation,
                confirm_tx,
            });
            inner.state.is_confirmed = false;
            (confirm_rx, generation)
        };

        tracing::debug!(mode = %target, "requesting response mode change");
        if let Err(e) = self.transport.publish_reliable(&payload).await {
            self.fail_pending(generation, format!("Failed to request {target} mode: {e}"));
            return Err(ModeChangeError::SendFailed(e.to_string()));
        }

        match tokio::time::timeout(CONFIRM_TIMEOUT, confirm_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ModeChangeError::Superseded),
            Err(_) => {
                self.fail_pending(
                    generation,
                    format!("The agent did not confirm switching to {target} mode"),
                );
                Err(ModeChangeError::ConfirmationTimeout(CONFIRM_TIMEOUT))
            }
        }
    }

    /// Requests the opposite of the currently confirmed mode.
    pub async fn toggle_mode(&self) -> Result<(), ModeChangeError> {
        let target = self.current_mode().opposite();
        self.set_mode(target).await
    }

    /// Handles an inbound `response_mode_updated` confirmation. Returns true
    /// when it resolved the outstanding request; late or unsolicited
    /// confirmations are ignored.
    pub fn on_confirmation(&self, mode: ResponseMode) -> bool {
        let resolved = {
            let mut inner = self.inner.lock().unwrap();
            let matches = matches!(&inner.pending, Some(pending) if pending.target == mode);
            if matches {
                let pending = inner.pending.take().unwrap();
                inner.state.current_mode = mode;
                inner.state.is_confirmed = true;
                inner.state.error_message = None;
                inner.error_epoch += 1;
                Some(pending.confirm_tx)
            } else {
                tracing::debug!(mode = %mode, "ignoring stale mode confirmation");
                None
            }
        };
        let Some(confirm_tx) = resolved else {
            return false;
        };
        self.prefs.set(MODE_PREF_KEY, mode.as_str());
        // The requester may have been superseded and gone away already.
        let _ = confirm_tx.send(());
        true
    }

    /// Reverts an outstanding request after a send failure or timeout. A
    /// generation check keeps a stale deadline from touching a superseding
    /// request's state.
    fn fail_pending(&self, generation: u64, message: String) {
        let mut inner = self.inner.lock().unwrap();
        let matches = inner
            .pending
            .as_ref()
            .map(|p| p.generation == generation)
            .unwrap_or(false);
        if !matches {
            return;
        }
        inner.pending = None;
        inner.state.is_confirmed = true;
        self.set_error_locked(&mut inner, message);
    }

    fn set_error_locked(&self, inner: &mut Inner, message: String) {
        tracing::warn!("mode negotiation failed: {message}");
        inner.state.error_message = Some(message.clone());
        inner.error_epoch += 1;
        let epoch = inner.error_epoch;
        let shared = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ERROR_DISPLAY).await;
            let mut inner = shared.lock().unwrap();
            if inner.error_epoch == epoch {
                inner.state.error_message = None;
            }
        });
        let _ = self.events.send(SessionEvent::ModeError(message));
    }

    /// Session teardown: cancels any pending request (its caller sees
    /// `Superseded`) and resets to the default mode, confirmed, with the
    /// channel unavailable.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending = None;
        inner.error_epoch += 1;
        inner.state = NegotiationState {
            current_mode: ResponseMode::default(),
            is_confirmed: true,
            error_message: None,
            is_channel_available: false,
        };
    }
}

fn stored_preference(prefs: &dyn KeyValueStorage) -> Option<ResponseMode> {
    let raw = prefs.get(MODE_PREF_KEY)?;
    match ResponseMode::from_str(&raw) {
        Ok(mode) => Some(mode),
        Err(e) => {
            tracing::warn!("ignoring invalid stored mode preference: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::{MockSignalTransport, TransportError};

    fn negotiator(transport: MockSignalTransport) -> (ModeNegotiator, Arc<MemoryStorage>) {
        let prefs = Arc::new(MemoryStorage::new());
        let (events, _) = broadcast::channel(16);
        let negotiator = ModeNegotiator::new(
            Arc::new(transport),
            prefs.clone() as Arc<dyn KeyValueStorage>,
            events,
        );
        (negotiator, prefs)
    }

    fn accepting_transport() -> MockSignalTransport {
        let mut transport = MockSignalTransport::new();
        transport.expect_publish_reliable().returning(|_| Ok(()));
        transport
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_within_deadline_resolves() {
        let (negotiator, prefs) = negotiator(accepting_transport());
        negotiator.set_channel_available(true);

        let request = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.set_mode(ResponseMode::Chat).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!negotiator.state().is_confirmed);

        assert!(negotiator.on_confirmation(ResponseMode::Chat));
        request.await.unwrap().unwrap();

        let state = negotiator.state();
        assert_eq!(state.current_mode, ResponseMode::Chat);
        assert!(state.is_confirmed);
        assert_eq!(state.error_message, None);
        assert_eq!(prefs.get(MODE_PREF_KEY).as_deref(), Some("chat"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reverts_and_error_self_clears() {
        let (negotiator, _) = negotiator(accepting_transport());
        negotiator.set_channel_available(true);

        let request = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.set_mode(ResponseMode::Chat).await })
        };
        tokio::time::sleep(CONFIRM_TIMEOUT + Duration::from_millis(50)).await;
        assert!(matches!(
            request.await.unwrap(),
            Err(ModeChangeError::ConfirmationTimeout(_))
        ));

        let state = negotiator.state();
        assert_eq!(state.current_mode, ResponseMode::Voice);
        assert!(state.is_confirmed);
        assert!(state.error_message.is_some());

        tokio::time::sleep(ERROR_DISPLAY + Duration::from_millis(50)).await;
        assert_eq!(negotiator.state().error_message, None);
    }

    #[tokio::test(start_paused = true)]
    async fn late_confirmation_is_ignored() {
        let (negotiator, prefs) = negotiator(accepting_transport());
        negotiator.set_channel_available(true);

        let request = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.set_mode(ResponseMode::Chat).await })
        };
        tokio::time::sleep(CONFIRM_TIMEOUT + Duration::from_millis(50)).await;
        assert!(request.await.unwrap().is_err());

        assert!(!negotiator.on_confirmation(ResponseMode::Chat));
        assert_eq!(negotiator.current_mode(), ResponseMode::Voice);
        assert_eq!(prefs.get(MODE_PREF_KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_unavailable_fails_immediately() {
        let (negotiator, _) = negotiator(MockSignalTransport::new());
        let result = negotiator.set_mode(ResponseMode::Chat).await;
        assert!(matches!(result, Err(ModeChangeError::ChannelUnavailable)));
        assert!(negotiator.state().is_confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_reverts_without_waiting() {
        let mut transport = MockSignalTransport::new();
        transport
            .expect_publish_reliable()
            .returning(|_| Err(TransportError("peer gone".into())));
        let (negotiator, _) = negotiator(transport);
        negotiator.set_channel_available(true);

        let result = negotiator.set_mode(ResponseMode::Chat).await;
        assert!(matches!(result, Err(ModeChangeError::SendFailed(_))));

        let state = negotiator.state();
        assert_eq!(state.current_mode, ResponseMode::Voice);
        assert!(state.is_confirmed);
        assert!(state.error_message.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn superseding_request_rejects_the_first_caller() {
        let (negotiator, _) = negotiator(accepting_transport());
        negotiator.set_channel_available(true);

        let first = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.set_mode(ResponseMode::Chat).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.set_mode(ResponseMode::Voice).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            first.await.unwrap(),
            Err(ModeChangeError::Superseded)
        ));

        // The stale request's deadline must not revert the new request.
        tokio::time::sleep(CONFIRM_TIMEOUT - Duration::from_millis(150)).await;
        assert!(negotiator.on_confirmation(ResponseMode::Voice));
        second.await.unwrap().unwrap();
        assert_eq!(negotiator.current_mode(), ResponseMode::Voice);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_requests_the_opposite_mode() {
        let (negotiator, _) = negotiator(accepting_transport());
        negotiator.set_channel_available(true);

        let request = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.toggle_mode().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(negotiator.on_confirmation(ResponseMode::Chat));
        request.await.unwrap().unwrap();
        assert_eq!(negotiator.current_mode(), ResponseMode::Chat);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_preference_seeds_initial_mode() {
        let prefs = Arc::new(MemoryStorage::new());
        prefs.set(MODE_PREF_KEY, "chat");
        let (events, _) = broadcast::channel(16);
        let negotiator = ModeNegotiator::new(
            Arc::new(MockSignalTransport::new()),
            prefs.clone() as Arc<dyn KeyValueStorage>,
            events.clone(),
        );
        assert_eq!(negotiator.current_mode(), ResponseMode::Chat);

        prefs.set(MODE_PREF_KEY, "smoke-signals");
        let negotiator = ModeNegotiator::new(
            Arc::new(MockSignalTransport::new()),
            prefs as Arc<dyn KeyValueStorage>,
            events,
        );
        assert_eq!(negotiator.current_mode(), ResponseMode::Voice);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_and_restores_defaults() {
        let (negotiator, _) = negotiator(accepting_transport());
        negotiator.set_channel_available(true);

        let request = {
            let negotiator = negotiator.clone();
            tokio::spawn(async move { negotiator.set_mode(ResponseMode::Chat).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        negotiator.reset();
        assert!(matches!(
            request.await.unwrap(),
            Err(ModeChangeError::Superseded)
        ));

        let state = negotiator.state();
        assert_eq!(state.current_mode, ResponseMode::Voice);
        assert!(state.is_confirmed);
        assert!(!state.is_channel_available);
        assert_eq!(state.error_message, None);
    }
}
