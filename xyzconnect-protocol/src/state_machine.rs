//! Global application state machine (spec.md §4.H).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::error::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonState {
    Init,
    Disconnected,
    Discovering,
    Pairing,
    Connected,
    Syncing,
    Ready,
    Error,
}

impl DaemonState {
    fn allowed_next(self) -> &'static [DaemonState] {
        use DaemonState::*;
        match self {
            Init => &[Disconnected],
            Disconnected => &[Discovering, Error],
            Discovering => &[Pairing, Connected, Disconnected, Error],
            Pairing => &[Connected, Discovering, Error],
            Connected => &[Syncing, Disconnected, Error],
            Syncing => &[Ready, Connected, Disconnected, Error],
            Ready => &[Syncing, Connected, Disconnected, Error],
            Error => &[Disconnected],
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Contacts,
    Messages,
    Attachments,
}

/// Mutable context merged into the state machine on every transition.
/// Fields are `None`/unset unless the transition's caller supplies them;
/// unsupplied fields keep their previous value.
#[derive(Debug, Clone, Default)]
pub struct StateContext {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub previous_state: Option<DaemonState>,
    pub sync_phase: Option<SyncPhase>,
    pub pairing_device_id: Option<String>,
    pub pairing_device_name: Option<String>,
    pub last_transition_time: i64,
}

/// A partial update applied on top of the existing context; `None` fields
/// leave the corresponding context field untouched.
#[derive(Debug, Clone, Default)]
pub struct PartialContext {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub sync_phase: Option<SyncPhase>,
    pub pairing_device_id: Option<String>,
    pub pairing_device_name: Option<String>,
}

struct Inner {
    state: DaemonState,
    context: StateContext,
    started_at: i64,
    destroyed: bool,
}

type Listener = Box<dyn Fn(DaemonState, &StateContext) + Send + Sync>;

/// Guarded state transitions with listener fan-out. Listener panics are
/// caught and logged so one bad listener never blocks the rest, per
/// spec.md §9.
pub struct StateMachine {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Listener>>,
}

impl StateMachine {
    pub fn new() -> Self {
        let now = now_ms();
        Self {
            inner: Mutex::new(Inner {
                state: DaemonState::Init,
                context: StateContext {
                    last_transition_time: now,
                    ..Default::default()
                },
                started_at: now,
                destroyed: false,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> DaemonState {
        self.inner.lock().unwrap().state
    }

    pub fn context(&self) -> StateContext {
        self.inner.lock().unwrap().context.clone()
    }

    pub fn uptime_ms(&self) -> i64 {
        now_ms() - self.inner.lock().unwrap().started_at
    }

    /// Side-effect-free legality check.
    pub fn can_transition(&self, next: DaemonState) -> bool {
        let current = self.inner.lock().unwrap().state;
        current.allowed_next().contains(&next)
    }

    /// Apply `next`, merging `partial` into the context. Returns
    /// [`StateError`] (never silently no-ops) if the transition isn't legal.
    pub fn transition(
        &self,
        next: DaemonState,
        partial: Option<PartialContext>,
    ) -> Result<(), StateError> {
        let (new_context, new_state) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.allowed_next().contains(&next) {
                return Err(StateError {
                    from: inner.state.to_string(),
                    to: next.to_string(),
                });
            }

            let previous = inner.state;
            if let Some(partial) = partial {
                if partial.device_id.is_some() {
                    inner.context.device_id = partial.device_id;
                }
                if partial.device_name.is_some() {
                    inner.context.device_name = partial.device_name;
                }
                if partial.error_code.is_some() {
                    inner.context.error_code = partial.error_code;
                }
                if partial.error_message.is_some() {
                    inner.context.error_message = partial.error_message;
                }
                if partial.sync_phase.is_some() {
                    inner.context.sync_phase = partial.sync_phase;
                }
                if partial.pairing_device_id.is_some() {
                    inner.context.pairing_device_id = partial.pairing_device_id;
                }
                if partial.pairing_device_name.is_some() {
                    inner.context.pairing_device_name = partial.pairing_device_name;
                }
            }
            inner.context.previous_state = Some(previous);
            inner.context.last_transition_time = now_ms();
            inner.state = next;
            (inner.context.clone(), next)
        };

        self.notify(new_state, &new_context);
        Ok(())
    }

    /// Apply a context-only update without changing `state`, used for the
    /// SYNCING contacts→messages/attachments phase change (spec.md §9 Open
    /// Question 2).
    pub fn update_context(&self, partial: PartialContext) {
        let (state, context) = {
            let mut inner = self.inner.lock().unwrap();
            if partial.sync_phase.is_some() {
                inner.context.sync_phase = partial.sync_phase;
            }
            if partial.device_id.is_some() {
                inner.context.device_id = partial.device_id;
            }
            if partial.device_name.is_some() {
                inner.context.device_name = partial.device_name;
            }
            inner.context.last_transition_time = now_ms();
            (inner.state, inner.context.clone())
        };
        self.notify(state, &context);
    }

    pub fn on_transition<F>(&self, listener: F)
    where
        F: Fn(DaemonState, &StateContext) + Send + Sync + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn notify(&self, state: DaemonState, context: &StateContext) {
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| listener(state, context)));
            if result.is_err() {
                warn!("state machine listener panicked, continuing fan-out");
            }
        }
    }

    /// Clear listeners; state remains readable afterwards.
    pub fn destroy(&self) {
        self.listeners.lock().unwrap().clear();
        self.inner.lock().unwrap().destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().unwrap().destroyed
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn legal_transitions_succeed_and_update_previous_state() {
        let sm = StateMachine::new();
        sm.transition(DaemonState::Disconnected, None).unwrap();
        sm.transition(DaemonState::Discovering, None).unwrap();
        assert_eq!(sm.state(), DaemonState::Discovering);
        assert_eq!(
            sm.context().previous_state,
            Some(DaemonState::Disconnected)
        );
    }

    #[test]
    fn illegal_transition_is_rejected_and_does_not_mutate_state() {
        let sm = StateMachine::new();
        let err = sm.transition(DaemonState::Connected, None).unwrap_err();
        assert_eq!(err.from, "Init");
        assert_eq!(err.to, "Connected");
        assert_eq!(sm.state(), DaemonState::Init);
    }

    #[test]
    fn can_transition_matches_transition_legality() {
        let sm = StateMachine::new();
        assert!(sm.can_transition(DaemonState::Disconnected));
        assert!(!sm.can_transition(DaemonState::Ready));
    }

    #[test]
    fn listener_panic_does_not_block_fan_out() {
        let sm = StateMachine::new();
        let calls = Arc::new(AtomicUsize::new(0));

        sm.on_transition(|_, _| panic!("boom"));
        let calls2 = calls.clone();
        sm.on_transition(move |_, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
        });

        sm.transition(DaemonState::Disconnected, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_clears_listeners_but_state_stays_readable() {
        let sm = StateMachine::new();
        sm.transition(DaemonState::Disconnected, None).unwrap();
        sm.destroy();
        assert_eq!(sm.state(), DaemonState::Disconnected);
        assert!(sm.is_destroyed());
    }
}
