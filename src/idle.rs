use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::error::IdleConfigError;
use crate::storage::KeyValueStorage;
use crate::transport::DisconnectHandler;
use crate::SessionEvent;

/// Session-scoped storage key for the idle timeout configuration.
pub const IDLE_CONFIG_KEY: &str = "idle-timeout-config";

const MIN_DURATION_SECONDS: u32 = 30;
const MAX_DURATION_SECONDS: u32 = 3600;
const MIN_WARNING_SECONDS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleTimeoutConfig {
    pub duration_seconds: u32,
    pub warning_threshold_seconds: u32,
    pub enabled: bool,
}

impl Default for IdleTimeoutConfig {
    fn default() -> Self {
        Self {
            duration_seconds: 300,
            warning_threshold_seconds: 30,
            enabled: true,
        }
    }
}

impl IdleTimeoutConfig {
    pub fn validate(&self) -> Result<(), IdleConfigError> {
        if !(MIN_DURATION_SECONDS..=MAX_DURATION_SECONDS).contains(&self.duration_seconds) {
            return Err(IdleConfigError::new(
                "duration_seconds",
                format!(
                    "must be between {MIN_DURATION_SECONDS} and {MAX_DURATION_SECONDS}, got {}",
                    self.duration_seconds
                ),
            ));
        }
        if self.warning_threshold_seconds < MIN_WARNING_SECONDS {
            return Err(IdleConfigError::new(
                "warning_threshold_seconds",
                format!(
                    "must be at least {MIN_WARNING_SECONDS}, got {}",
                    self.warning_threshold_seconds
                ),
            ));
        }
        if self.warning_threshold_seconds >= self.duration_seconds {
            return Err(IdleConfigError::new(
                "warning_threshold_seconds",
                format!(
                    "must be less than duration_seconds ({}), got {}",
                    self.duration_seconds, self.warning_threshold_seconds
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdleTimerState {
    pub is_active: bool,
    pub time_remaining: u32,
    pub is_warning: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

impl IdleTimerState {
    fn inactive() -> Self {
        Self {
            is_active: false,
            time_remaining: 0,
            is_warning: false,
            last_activity: None,
        }
    }
}

struct Shared {
    state: IdleTimerState,
    config: IdleTimeoutConfig,
}

/// Countdown that terminates the session after a silence window.
///
/// Inactive ⇄ Active (1 Hz tick) → Warning (once `time_remaining` drops to
/// the threshold) → expired: the disconnect collaborator fires exactly once
/// and the timer returns to Inactive. `reset_timer` is called on every feed
/// mutation to restart the window.
pub struct IdleTimer {
    shared: Arc<Mutex<Shared>>,
    storage: Arc<dyn KeyValueStorage>,
    on_disconnect: Arc<dyn DisconnectHandler>,
    events: broadcast::Sender<SessionEvent>,
    tick_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IdleTimer {
    /// Restores a previously persisted config from session-scoped storage,
    /// falling back to the default.
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        on_disconnect: Arc<dyn DisconnectHandler>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let config = load_config(storage.as_ref());
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: IdleTimerState::inactive(),
                config,
            })),
            storage,
            on_disconnect,
            events,
            tick_handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> IdleTimerState {
        self.shared.lock().unwrap().state.clone()
    }

    pub fn config(&self) -> IdleTimeoutConfig {
        self.shared.lock().unwrap().config
    }

    /// Transitions Inactive → Active and begins the one-second tick. Does
    /// nothing when the timer is disabled by config.
    pub fn start_timer(&self) {
        let config = {
            let mut shared = self.shared.lock().unwrap();
            if !shared.config.enabled {
                tracing::debug!("idle timer disabled, not starting");
                return;
            }
            shared.state = IdleTimerState {
                is_active: true,
                time_remaining: shared.config.duration_seconds,
                is_warning: false,
                last_activity: Some(Utc::now()),
            };
            shared.config
        };
        tracing::debug!(duration = config.duration_seconds, "idle timer started");

        let mut handle = self.tick_handle.lock().unwrap();
        if let Some(previous) = handle.take() {
            previous.abort();
        }
        *handle = Some(tokio::spawn(tick_loop(
            self.shared.clone(),
            self.on_disconnect.clone(),
            self.events.clone(),
        )));
    }

    /// Restores the full window while active. Called on feed activity.
    pub fn reset_timer(&self) {
        let mut shared = self.shared.lock().unwrap();
        if !shared.state.is_active {
            return;
        }
        shared.state.time_remaining = shared.config.duration_seconds;
        shared.state.is_warning = false;
        shared.state.last_activity = Some(Utc::now());
    }

    /// Transitions to Inactive unconditionally. Safe to call when already
    /// stopped.
    pub fn stop_timer(&self) {
        if let Some(handle) = self.tick_handle.lock().unwrap().take() {
            handle.abort();
        }
        let mut shared = self.shared.lock().unwrap();
        shared.state = IdleTimerState::inactive();
    }

    /// Validates and applies a new configuration, persisting it to
    /// session-scoped storage. On failure the previous configuration stays
    /// in effect. A running countdown keeps its current remaining time until
    /// the next reset.
    pub fn update_config(&self, config: IdleTimeoutConfig) -> Result<(), IdleConfigError> {
        config.validate()?;
        {
            let mut shared = self.shared.lock().unwrap();
            shared.config = config;
        }
        match serde_json::to_string(&config) {
            Ok(json) => self.storage.set(IDLE_CONFIG_KEY, &json),
            Err(e) => tracing::error!("failed to serialize idle config: {e}"),
        }
        Ok(())
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.tick_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

async fn tick_loop(
    shared: Arc<Mutex<Shared>>,
    on_disconnect: Arc<dyn DisconnectHandler>,
    events: broadcast::Sender<SessionEvent>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    // The first tick completes immediately; the countdown starts after a
    // full second.
    interval.tick().await;
    loop {
        interval.tick().await;
        let outcome = {
            let mut shared = shared.lock().unwrap();
            if !shared.state.is_active {
                break;
            }
            shared.state.time_remaining = shared.state.time_remaining.saturating_sub(1);
            let remaining = shared.state.time_remaining;
            let was_warning = shared.state.is_warning;
            shared.state.is_warning =
                remaining > 0 && remaining <= shared.config.warning_threshold_seconds;
            if remaining == 0 {
                shared.state = IdleTimerState::inactive();
                Tick::Expired
            } else if shared.state.is_warning && !was_warning {
                Tick::WarningEntered(remaining)
            } else {
                Tick::Counting
            }
        };
        match outcome {
            Tick::Counting => {}
            Tick::WarningEntered(remaining) => {
                tracing::info!(remaining, "idle timer entered warning phase");
                let _ = events.send(SessionEvent::IdleWarning(remaining));
            }
            Tick::Expired => {
                tracing::info!("idle timer expired, disconnecting session");
                let _ = events.send(SessionEvent::IdleExpired);
                // Fire and forget; the timer is already inactive so this
                // cannot run twice.
                let handler = on_disconnect.clone();
                tokio::spawn(async move { handler.disconnect().await });
                break;
            }
        }
    }
}

enum Tick {
    Counting,
    WarningEntered(u32),
    Expired,
}

fn load_config(storage: &dyn KeyValueStorage) -> IdleTimeoutConfig {
    let Some(raw) = storage.get(IDLE_CONFIG_KEY) else {
        return IdleTimeoutConfig::default();
    };
    match serde_json::from_str::<IdleTimeoutConfig>(&raw) {
        Ok(config) if config.validate().is_ok() => config,
        Ok(_) | Err(_) => {
            tracing::warn!("ignoring invalid persisted idle config");
            IdleTimeoutConfig::default()
        }
    }
}
