//! Failover Policy Engine (C4).
//!
//! Decides when and to which source to switch, and enqueues the decision
//! into the Command Queue rather than touching controller state directly —
//! the actuator remains the single mutator of `active_index`. Grounded on
//! the dwell-gated switch trigger in `FailoverManager`, generalized from a
//! binary primary/standby toggle to an N-way lowest-index candidate pick.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{AutoFailoverConfig, RevertConfig, RevertPolicy};
use crate::error::ControllerError;
use crate::queue::{CommandEntry, CommandQueue};
use crate::source::SourceTable;

/// Counters and dwell-time bookkeeping the policy engine owns. Kept apart
/// from `ControllerState` since nothing outside this engine ever needs to
/// mutate it, and it closely mirrors `FailoverManager`'s own
/// `last_switch: Mutex<Option<Instant>>` dwell guard.
pub struct PolicyState {
    last_failover_time_ms: AtomicU64,
    failover_count: AtomicU64,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            last_failover_time_ms: AtomicU64::new(0),
            failover_count: AtomicU64::new(0),
        }
    }
}

impl PolicyState {
    pub fn failover_count(&self) -> u64 {
        self.failover_count.load(Ordering::Relaxed)
    }

    pub fn last_failover_time_ms(&self) -> u64 {
        self.last_failover_time_ms.load(Ordering::Relaxed)
    }

    fn dwell_satisfied(&self, now_ms: u64, health_window_ms: u64) -> bool {
        let last = self.last_failover_time_ms.load(Ordering::Relaxed);
        last == 0 || now_ms.saturating_sub(last) >= health_window_ms
    }

    fn record_failover(&self, now_ms: u64) {
        self.last_failover_time_ms.store(now_ms, Ordering::Relaxed);
        self.failover_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pick the lowest-indexed healthy candidate other than `active_index`
/// whose recovery hysteresis window has elapsed. Index order is the
/// tie-break, so source insertion order doubles as failover priority.
fn pick_candidate(sources: &SourceTable, active_index: usize, recovery_delay_ms: u64, now_ms: u64) -> Option<usize> {
    for (idx, descriptor) in sources.iter().enumerate() {
        if idx == active_index {
            continue;
        }
        let health = descriptor.health.lock().expect("source health mutex poisoned");
        if !health.is_healthy {
            continue;
        }
        if crate::health::in_recovery_hysteresis(&health, now_ms, recovery_delay_ms) {
            continue;
        }
        return Some(idx);
    }
    None
}

/// Evaluate the auto-failover decision for one monitor tick. Enqueues a
/// switch request when warranted; does not mutate `active_index` itself.
pub fn evaluate_failover(
    state: &PolicyState,
    sources: &SourceTable,
    queue: &CommandQueue,
    active_index: usize,
    auto_failover: &AutoFailoverConfig,
    now_ms: u64,
) -> Result<(), ControllerError> {
    if !auto_failover.enabled {
        return Ok(());
    }

    let active_healthy = {
        let health = sources
            .get(active_index)
            .ok_or_else(|| ControllerError::UnknownSource(active_index.to_string()))?
            .health
            .lock()
            .expect("source health mutex poisoned");
        health.is_healthy
    };

    if active_healthy {
        return Ok(());
    }

    if !state.dwell_satisfied(now_ms, auto_failover.health_window_ms) {
        return Ok(());
    }

    let candidate = pick_candidate(sources, active_index, auto_failover.recovery_delay_ms, now_ms)
        .ok_or(ControllerError::NoCandidate)?;

    let target_id = sources
        .get(candidate)
        .expect("candidate index came from sources.iter()")
        .meta
        .id
        .clone();

    queue.enqueue(CommandEntry {
        source_id: target_id,
        enqueued_at_us: now_ms * 1000,
    })?;

    state.record_failover(now_ms);
    Ok(())
}

/// Evaluate an automatic revert: if policy is `auto`, the previously-active
/// source has recovered, and it has stayed healthy for `health_window_ms`,
/// enqueue a switch back. No-op under `manual` policy.
pub fn evaluate_revert(
    sources: &SourceTable,
    queue: &CommandQueue,
    active_index: usize,
    previous_index: usize,
    revert: &RevertConfig,
    now_ms: u64,
) -> Result<(), ControllerError> {
    if revert.policy != RevertPolicy::Auto || previous_index == active_index {
        return Ok(());
    }

    let previous = sources
        .get(previous_index)
        .ok_or_else(|| ControllerError::UnknownSource(previous_index.to_string()))?;

    let health = previous.health.lock().expect("source health mutex poisoned");
    if !health.is_healthy {
        return Ok(());
    }
    if now_ms.saturating_sub(health.last_recovery_time_ms) < revert.health_window_ms {
        return Ok(());
    }
    drop(health);

    queue.enqueue(CommandEntry {
        source_id: previous.meta.id.clone(),
        enqueued_at_us: now_ms * 1000,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceTable;

    fn table(ids: &[&str]) -> SourceTable {
        let spec = ids
            .iter()
            .map(|id| format!("{id}=udp://127.0.0.1:0"))
            .collect::<Vec<_>>()
            .join(";");
        SourceTable::parse(&spec).unwrap()
    }

    fn mark_unhealthy(table: &SourceTable, idx: usize) {
        table.get(idx).unwrap().health.lock().unwrap().is_healthy = false;
    }

    #[test]
    fn no_action_when_disabled() {
        let table = table(&["s0", "s1"]);
        mark_unhealthy(&table, 0);
        let state = PolicyState::default();
        let queue = CommandQueue::new(8);
        let cfg = AutoFailoverConfig {
            enabled: false,
            ..AutoFailoverConfig::default()
        };
        evaluate_failover(&state, &table, &queue, 0, &cfg, 1000).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn no_action_when_active_healthy() {
        let table = table(&["s0", "s1"]);
        let state = PolicyState::default();
        let queue = CommandQueue::new(8);
        evaluate_failover(&state, &table, &queue, 0, &AutoFailoverConfig::default(), 1000).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn picks_lowest_indexed_healthy_candidate() {
        let table = table(&["s0", "s1", "s2"]);
        mark_unhealthy(&table, 0);
        let state = PolicyState::default();
        let queue = CommandQueue::new(8);
        evaluate_failover(&state, &table, &queue, 0, &AutoFailoverConfig::default(), 100_000).unwrap();

        let entry = queue.try_dequeue().unwrap();
        assert_eq!(entry.source_id, "s1");
        assert_eq!(state.failover_count(), 1);
    }

    #[test]
    fn no_candidate_when_all_others_unhealthy() {
        let table = table(&["s0", "s1"]);
        mark_unhealthy(&table, 0);
        mark_unhealthy(&table, 1);
        let state = PolicyState::default();
        let queue = CommandQueue::new(8);
        let err = evaluate_failover(&state, &table, &queue, 0, &AutoFailoverConfig::default(), 100_000).unwrap_err();
        assert!(matches!(err, ControllerError::NoCandidate));
    }

    #[test]
    fn dwell_time_blocks_rapid_successive_failovers() {
        let table = table(&["s0", "s1"]);
        mark_unhealthy(&table, 0);
        let state = PolicyState::default();
        let queue = CommandQueue::new(8);
        let cfg = AutoFailoverConfig {
            health_window_ms: 5000,
            ..AutoFailoverConfig::default()
        };

        evaluate_failover(&state, &table, &queue, 0, &cfg, 100_000).unwrap();
        queue.drain();

        // Active index is still 0 in this test (actuator hasn't applied the
        // switch), so the second tick re-evaluates under dwell pressure.
        evaluate_failover(&state, &table, &queue, 0, &cfg, 100_500).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn revert_noop_under_manual_policy() {
        let table = table(&["s0", "s1"]);
        let queue = CommandQueue::new(8);
        let revert = RevertConfig {
            policy: RevertPolicy::Manual,
            health_window_ms: 1000,
        };
        evaluate_revert(&table, &queue, 1, 0, &revert, 50_000).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn revert_enqueues_after_stabilization_window() {
        let table = table(&["s0", "s1"]);
        table.get(0).unwrap().health.lock().unwrap().last_recovery_time_ms = 10_000;
        let queue = CommandQueue::new(8);
        let revert = RevertConfig {
            policy: RevertPolicy::Auto,
            health_window_ms: 5000,
        };
        evaluate_revert(&table, &queue, 1, 0, &revert, 16_000).unwrap();
        let entry = queue.try_dequeue().unwrap();
        assert_eq!(entry.source_id, "s0");
    }
}
