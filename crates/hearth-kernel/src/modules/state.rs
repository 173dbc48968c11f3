//! Companion state machine module.
//!
//! Tracks the companion's presence state and lets any permitted module (or
//! the boundary adapter) request transitions by emitting
//! `state.transition.<state>` events.  Every accepted transition is
//! announced as a `state.changed` event.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::KernelApi;
use crate::bus::{EventData, EventHandler, EventValue};
use crate::config::ConfigSection;
use crate::error::Result;
use crate::module::Module;
use crate::permission::Permission;

const NAME: &str = "state";

/// Companion presence states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionState {
    /// Normal state, light monitoring.
    Idle,
    /// Actively monitoring events.
    Scanning,
    /// An important event demands attention.
    Alert,
    /// A reminder is being surfaced.
    Reminder,
}

impl CompanionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Alert => "alert",
            Self::Reminder => "reminder",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "scanning" => Some(Self::Scanning),
            "alert" => Some(Self::Alert),
            "reminder" => Some(Self::Reminder),
            _ => None,
        }
    }

    /// Whether `self -> target` is a legal transition.  Idle and alert are
    /// reachable from anywhere; scanning only from idle; reminders do not
    /// interrupt an active alert.
    fn can_transition(self, target: Self) -> bool {
        if self == target {
            return false;
        }
        match target {
            Self::Idle | Self::Alert => true,
            Self::Scanning => self == Self::Idle,
            Self::Reminder => matches!(self, Self::Idle | Self::Scanning),
        }
    }
}

struct StateInner {
    state: CompanionState,
    active: bool,
}

/// State machine capability module.
pub struct StateModule {
    api: Arc<KernelApi>,
    inner: Mutex<StateInner>,
}

impl StateModule {
    pub fn new(api: Arc<KernelApi>) -> Self {
        Self {
            api,
            inner: Mutex::new(StateInner {
                state: CompanionState::Idle,
                active: false,
            }),
        }
    }

    /// The current state.
    pub fn state(&self) -> CompanionState {
        self.inner.lock().state
    }

    fn transition(&self, target: CompanionState, data: &EventData) {
        let from = {
            let mut inner = self.inner.lock();
            if !inner.active {
                return;
            }
            if !inner.state.can_transition(target) {
                tracing::debug!(
                    from = inner.state.as_str(),
                    to = target.as_str(),
                    "state transition ignored"
                );
                return;
            }
            let from = inner.state;
            inner.state = target;
            from
        };

        let message = data
            .get("message")
            .and_then(EventValue::as_str)
            .unwrap_or_default()
            .to_string();
        let priority = data.get("priority").and_then(EventValue::as_i64).unwrap_or(0);

        tracing::info!(from = from.as_str(), to = target.as_str(), "state changed");

        let mut event = EventData::new();
        event.insert("from".into(), from.as_str().into());
        event.insert("to".into(), target.as_str().into());
        event.insert("message".into(), EventValue::Str(message));
        event.insert("priority".into(), EventValue::Int(priority));
        self.api.emit_event(NAME, "state.changed", event);
    }
}

impl EventHandler for StateModule {
    fn handle_event(&self, event_type: &str, data: &EventData) {
        let target = match event_type {
            "state.transition.idle" => CompanionState::Idle,
            "state.transition.scanning" => CompanionState::Scanning,
            "state.transition.alert" => CompanionState::Alert,
            "state.transition.reminder" => CompanionState::Reminder,
            _ => return,
        };
        self.transition(target, data);
    }
}

impl Module for StateModule {
    fn name(&self) -> &str {
        NAME
    }

    fn required_permissions(&self) -> Permission {
        Permission::EVENT_EMIT
            | Permission::EVENT_SUBSCRIBE
            | Permission::STORAGE_READ
            | Permission::STORAGE_WRITE
    }

    fn load(&self, config: &ConfigSection) -> Result<()> {
        let initial = config
            .get_str("initial")
            .and_then(CompanionState::from_str)
            .unwrap_or(CompanionState::Idle);
        self.inner.lock().state = initial;
        tracing::info!(initial = initial.as_str(), "state module loaded");
        Ok(())
    }

    fn enable(&self) -> Result<()> {
        for event in [
            "state.transition.idle",
            "state.transition.scanning",
            "state.transition.alert",
            "state.transition.reminder",
        ] {
            self.api.subscribe_event(NAME, event);
        }

        let state = {
            let mut inner = self.inner.lock();
            inner.active = true;
            inner.state
        };

        // Announce the starting state so listeners can sync up.
        let mut event = EventData::new();
        event.insert("to".into(), state.as_str().into());
        event.insert("message".into(), "Ready".into());
        event.insert("priority".into(), EventValue::Int(0));
        self.api.emit_event(NAME, "state.changed", event);

        tracing::info!("state module enabled");
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        self.inner.lock().active = false;
        tracing::info!("state module disabled");
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.active = false;
        inner.state = CompanionState::Idle;
        tracing::info!("state module shut down");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
