//! Selection Actuator (C6).
//!
//! Sole consumer of the Command Queue, and the sole mutator of
//! `ControllerState::active_index`. Mirrors the shape of
//! `FailoverManager::trigger_switch`: resolve the target, commit the state
//! change first, then notify, so a downstream failure can never leave the
//! state and the notification out of sync.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use crate::config::SwitchMode;
use crate::error::ControllerError;
use crate::filter_adapter::FilterAdapter;
use crate::queue::CommandEntry;
use crate::source::SourceTable;
use crate::state::ControllerState;

/// Runs one dequeued command through resolution, the mode routine, and the
/// state commit. `now_us` is supplied by the caller so this stays testable
/// against a synthetic clock.
pub fn apply_command(
    entry: &CommandEntry,
    sources: &SourceTable,
    state: &ControllerState,
    filter: &dyn FilterAdapter,
    now_us: u64,
) -> Result<usize, ControllerError> {
    let target = sources
        .resolve(&entry.source_id)
        .ok_or_else(|| ControllerError::UnknownSource(entry.source_id.clone()))?;

    let current = state.active_index();
    if target == current {
        return Err(ControllerError::NoOp);
    }

    let previous = state.begin_switch();
    debug_assert_eq!(previous, current, "begin_switch must observe the pre-command active index");

    let target_meta = sources
        .get(target)
        .expect("resolve() only returns indices that exist in the table");

    // Seamless routes the filter-graph `map` update through the same
    // critical section as the state write; graceful and cutover flip the
    // index immediately and leave masking/keyframe-hold semantics to the
    // downstream graph, so the adapter call is identical for all three —
    // only the caller's framing of freeze/black timing differs, and that
    // lives in `mswitchd`'s pipeline wiring, not here.
    let filter_result = filter.set_active(target, &target_meta.meta.id);

    // State is committed regardless of filter_result: the resolution is
    // to leave the new state rather than roll back (see design notes).
    state.commit_switch(target, now_us);

    match filter_result {
        Ok(()) => {
            info!(
                target: crate::LOG_TARGET,
                from = previous,
                to = target,
                source = %target_meta.meta.id,
                "switch completed"
            );
        }
        Err(ref err) => {
            warn!(
                target: crate::LOG_TARGET,
                from = previous,
                to = target,
                source = %target_meta.meta.id,
                error = %err,
                "switch committed but filter adapter reported an error"
            );
        }
    }

    Ok(target)
}

/// Resolve the freeze/black overlay duration for a cutover switch. Seamless
/// and graceful modes return zero: masking is either unnecessary (seamless)
/// or handled by the downstream keyframe hold (graceful).
pub fn cutover_mask_duration_ms(mode: SwitchMode, freeze_on_cut_ms: u64) -> u64 {
    match mode {
        SwitchMode::Cutover => freeze_on_cut_ms,
        SwitchMode::Seamless | SwitchMode::Graceful => 0,
    }
}

/// Counts switches applied through this actuator, independent of
/// `PolicyState::failover_count` (which only counts automatic ones).
#[derive(Default)]
pub struct SwitchCounter(AtomicU64);

impl SwitchCounter {
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
