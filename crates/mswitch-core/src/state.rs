//! Controller State.
//!
//! `active_index` plus the switch-level knobs it is read and written
//! alongside. Guarded by a single mutex the way `FailoverManager` guards
//! `last_switch`, with one addition: a mirrored `AtomicUsize` carries
//! `active_index` alone so the UDP proxy's hot path never takes the
//! mutex, matching `InputMux`'s `AtomicU8 active` field.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::config::{CutPolicy, IngestMode, SwitchMode};

/// In-progress transition marker for the switch state machine:
/// `Stable(i)` or `Switching(i -> j)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPhase {
    Stable,
    Switching,
}

struct Locked {
    active_index: usize,
    switching: SwitchPhase,
    last_switch_time_us: u64,
}

/// Controller state shared between the actuator (sole writer) and every
/// reader (HTTP status endpoint, file-poll CLI, policy engine).
pub struct ControllerState {
    locked: Mutex<Locked>,
    /// Fast-path mirror of `active_index` for the proxy's per-packet read.
    active_index_atomic: AtomicUsize,

    pub mode: SwitchMode,
    pub on_cut: CutPolicy,
    pub freeze_on_cut_ms: u64,
    pub buffer_ms: u64,
    pub ingest_mode: IngestMode,
}

pub struct ControllerStateConfig {
    pub initial_active_index: usize,
    pub mode: SwitchMode,
    pub on_cut: CutPolicy,
    pub freeze_on_cut_ms: u64,
    pub buffer_ms: u64,
    pub ingest_mode: IngestMode,
}

impl Default for ControllerStateConfig {
    fn default() -> Self {
        Self {
            initial_active_index: 0,
            mode: SwitchMode::default(),
            on_cut: CutPolicy::default(),
            freeze_on_cut_ms: 1000,
            buffer_ms: 0,
            ingest_mode: IngestMode::default(),
        }
    }
}

impl ControllerState {
    pub fn new(config: ControllerStateConfig) -> Self {
        Self {
            locked: Mutex::new(Locked {
                active_index: config.initial_active_index,
                switching: SwitchPhase::Stable,
                last_switch_time_us: 0,
            }),
            active_index_atomic: AtomicUsize::new(config.initial_active_index),
            mode: config.mode,
            on_cut: config.on_cut,
            freeze_on_cut_ms: config.freeze_on_cut_ms,
            buffer_ms: config.buffer_ms,
            ingest_mode: config.ingest_mode,
        }
    }

    /// Lock-free read for the proxy's per-packet hot path.
    pub fn active_index(&self) -> usize {
        self.active_index_atomic.load(Ordering::Acquire)
    }

    pub fn switching(&self) -> bool {
        self.locked.lock().expect("state mutex poisoned").switching == SwitchPhase::Switching
    }

    pub fn last_switch_time_us(&self) -> u64 {
        self.locked.lock().expect("state mutex poisoned").last_switch_time_us
    }

    /// Begin a switch transition: `Stable(i) -> Switching(i -> j)`.
    /// Returns the previously active index for the caller's mode routine.
    pub fn begin_switch(&self) -> usize {
        let mut locked = self.locked.lock().expect("state mutex poisoned");
        locked.switching = SwitchPhase::Switching;
        locked.active_index
    }

    /// Commit the transition: write the new `active_index` (both the
    /// mutex-guarded copy and the atomic mirror), stamp the switch time,
    /// and return to `Stable`. Called regardless of whether the filter
    /// adapter step that preceded it succeeded — an adapter failure is
    /// reported but does not roll back the state change.
    pub fn commit_switch(&self, new_index: usize, now_us: u64) {
        let mut locked = self.locked.lock().expect("state mutex poisoned");
        locked.active_index = new_index;
        locked.last_switch_time_us = now_us;
        locked.switching = SwitchPhase::Stable;
        self.active_index_atomic.store(new_index, Ordering::Release);
    }

    /// Abort a pending switch without changing `active_index`, returning to
    /// `Stable(i)`. Not used by the default error-during-switch resolution
    /// (see `commit_switch`'s doc comment) but kept for callers that
    /// implement the stricter rollback alternative.
    pub fn abort_switch(&self) {
        let mut locked = self.locked.lock().expect("state mutex poisoned");
        locked.switching = SwitchPhase::Stable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_stable_at_configured_index() {
        let state = ControllerState::new(ControllerStateConfig {
            initial_active_index: 2,
            ..ControllerStateConfig::default()
        });
        assert_eq!(state.active_index(), 2);
        assert!(!state.switching());
    }

    #[test]
    fn switch_transitions_through_switching_phase() {
        let state = ControllerState::new(ControllerStateConfig::default());
        let previous = state.begin_switch();
        assert_eq!(previous, 0);
        assert!(state.switching());

        state.commit_switch(1, 42);
        assert_eq!(state.active_index(), 1);
        assert!(!state.switching());
        assert_eq!(state.last_switch_time_us(), 42);
    }

    #[test]
    fn abort_leaves_active_index_unchanged() {
        let state = ControllerState::new(ControllerStateConfig::default());
        state.begin_switch();
        state.abort_switch();
        assert_eq!(state.active_index(), 0);
        assert!(!state.switching());
    }
}
