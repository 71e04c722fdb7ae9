//! The `Controller` handle: wires the Source Table, Command Queue,
//! Controller State, and Filter Adapter together behind one `Arc`-shareable
//! type. Constructed once in `main` and cloned by reference into every
//! spawned task, the same way `SharedState` is built once and handed to
//! each subsystem task as an `Arc` rather than reached for as a global
//! singleton.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::config::{AutoFailoverConfig, RevertConfig, Thresholds};
use crate::error::ControllerError;
use crate::filter_adapter::{FilterAdapter, NullFilterAdapter};
use crate::health::GracePeriod;
use crate::policy::PolicyState;
use crate::queue::{CommandEntry, CommandQueue};
use crate::source::SourceTable;
use crate::state::{ControllerState, ControllerStateConfig};

/// Everything the switching logic needs, minus the I/O-bound subsystems
/// (UDP proxy sockets, HTTP listener, file-poll task) that `mswitchd` owns
/// directly since they have no counterpart inside the library boundary.
pub struct Controller {
    pub sources: SourceTable,
    pub state: ControllerState,
    pub queue: CommandQueue,
    pub policy: PolicyState,
    pub thresholds: Thresholds,
    pub auto_failover: AutoFailoverConfig,
    pub revert: RevertConfig,
    pub filter: Box<dyn FilterAdapter>,
    pub grace: std::sync::Mutex<GracePeriod>,
    pub switch_count: crate::actuator::SwitchCounter,
}

pub struct ControllerConfig {
    pub sources: SourceTable,
    pub state: ControllerStateConfig,
    pub queue_capacity: usize,
    pub thresholds: Thresholds,
    pub auto_failover: AutoFailoverConfig,
    pub revert: RevertConfig,
    pub filter: Box<dyn FilterAdapter>,
    pub startup_grace_ms: u64,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            sources: config.sources,
            state: ControllerState::new(config.state),
            queue: CommandQueue::new(config.queue_capacity),
            policy: PolicyState::default(),
            thresholds: config.thresholds,
            auto_failover: config.auto_failover,
            revert: config.revert,
            filter: config.filter,
            grace: std::sync::Mutex::new(GracePeriod::new(config.startup_grace_ms)),
            switch_count: crate::actuator::SwitchCounter::default(),
        })
    }

    /// Enqueue a switch request by ID or numeric index. Thin validation
    /// only — resolution and the actual state change happen in the
    /// actuator once the command is dequeued, keeping the control surfaces
    /// that call this (HTTP, file-poll) from ever touching state directly.
    pub fn request_switch(&self, source_id: &str, now_us: u64) -> Result<(), ControllerError> {
        if self.sources.resolve(source_id).is_none() {
            return Err(ControllerError::UnknownSource(source_id.to_string()));
        }
        self.queue.enqueue(CommandEntry {
            source_id: source_id.to_string(),
            enqueued_at_us: now_us,
        })
    }

    /// Drain the queue, applying each command in order through the
    /// actuator. Called by the single task that owns actuator consumption.
    pub fn drain_and_apply(&self, now_us: u64) {
        while let Some(entry) = self.queue.try_dequeue() {
            match crate::actuator::apply_command(&entry, &self.sources, &self.state, self.filter.as_ref(), now_us) {
                Ok(new_index) => {
                    self.switch_count.increment();
                    tracing::info!(target: crate::LOG_TARGET, new_index, "command applied");
                }
                Err(err) if err.is_recoverable() => {
                    tracing::debug!(target: crate::LOG_TARGET, error = %err, "command dropped");
                }
                Err(err) => {
                    tracing::warn!(target: crate::LOG_TARGET, error = %err, "command failed");
                }
            }
        }
    }

    /// One health + failover tick: evaluate every source, then run the
    /// failover/revert policy. `now_ms` is the millisecond clock the
    /// caller's cadence loop supplies.
    pub fn health_tick(&self, now_ms: u64) {
        let grace = self.grace.lock().expect("grace period mutex poisoned");
        let active = self.state.active_index();

        for (idx, descriptor) in self.sources.iter().enumerate() {
            let verdict = crate::health::tick_source(descriptor, &self.thresholds, now_ms, idx == active, &grace);
            if matches!(verdict, crate::health::HealthVerdict::Unhealthy(_)) {
                tracing::warn!(
                    target: crate::LOG_TARGET,
                    source = %descriptor.meta.id,
                    reason = %match &verdict {
                        crate::health::HealthVerdict::Unhealthy(r) => r.to_string(),
                        crate::health::HealthVerdict::Healthy => unreachable!(),
                    },
                    "source marked unhealthy"
                );
            }
        }
        drop(grace);

        let previous_active = active;
        match crate::policy::evaluate_failover(
            &self.policy,
            &self.sources,
            &self.queue,
            active,
            &self.auto_failover,
            now_ms,
        ) {
            Ok(()) | Err(ControllerError::NoCandidate) | Err(ControllerError::QueueFull) => {}
            Err(err) => {
                tracing::warn!(target: crate::LOG_TARGET, error = %err, "failover evaluation error");
            }
        }

        if let Err(err) = crate::policy::evaluate_revert(
            &self.sources,
            &self.queue,
            self.state.active_index(),
            previous_active,
            &self.revert,
            now_ms,
        ) {
            tracing::debug!(target: crate::LOG_TARGET, error = %err, "revert evaluation error");
        }
    }

    /// Record that a source produced output, for the startup grace period.
    pub fn record_first_output(&self, now_ms: u64) {
        self.grace
            .lock()
            .expect("grace period mutex poisoned")
            .record_first_output(now_ms);
    }

    /// Stamp one datagram's arrival on `index`'s health block and mark the
    /// grace period's first-output condition satisfied. Called by the UDP
    /// proxy for every datagram it receives, active source or not, since
    /// arrival timestamps are one of the two fields the proxy thread is
    /// allowed to mutate directly. The proxy never inspects payload bytes,
    /// so loss is tracked only at the packet level (`lost_since_last` is
    /// always 0 here); sequence-level loss detection would need a demuxer.
    pub fn record_packet_arrival(&self, index: usize, now_ms: u64) {
        if let Some(descriptor) = self.sources.get(index) {
            let mut health = descriptor.health.lock().expect("source health mutex poisoned");
            crate::health::record_packet_arrival(
                &mut health,
                now_ms,
                0,
                std::time::Duration::from_secs(self.thresholds.packet_loss_window_sec),
            );
        }
        self.record_first_output(now_ms);
    }

    /// Record `index`'s PID presence, for a downstream demuxer to call as
    /// it observes the transport stream.
    pub fn record_pid_presence(&self, index: usize, present: bool, now_ms: u64) {
        if let Some(descriptor) = self.sources.get(index) {
            let mut health = descriptor.health.lock().expect("source health mutex poisoned");
            crate::health::record_pid_presence(&mut health, present, now_ms);
        }
    }

    /// Record one continuity-counter error on `index`, for a downstream
    /// demuxer to call as it observes the transport stream.
    pub fn record_cc_error(&self, index: usize, now_ms: u64) {
        if let Some(descriptor) = self.sources.get(index) {
            let mut health = descriptor.health.lock().expect("source health mutex poisoned");
            crate::health::record_cc_error(&mut health, now_ms);
        }
    }

    /// Record one decoded-frame sample on `index` as black or not, for a
    /// downstream decoder to call as it observes the active source's output.
    pub fn record_black_frame_sample(&self, index: usize, is_black: bool, now_ms: u64) {
        if let Some(descriptor) = self.sources.get(index) {
            let mut health = descriptor.health.lock().expect("source health mutex poisoned");
            crate::health::record_black_frame_sample(&mut health, is_black, now_ms);
        }
    }

    /// Dedicated actuator loop: the sole task that consumes the Command
    /// Queue, woken promptly by `CommandQueue::dequeue`'s `Notify` rather
    /// than waiting on the coarser health-tick cadence. This is the
    /// "separate actuator thread that is the sole consumer of C2" shape,
    /// kept distinct from health/failover evaluation so a manual HTTP or
    /// file-poll switch request is applied within one queue-wake, not one
    /// health tick.
    pub async fn run_actuator(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: crate::LOG_TARGET, "actuator shutting down");
                    return;
                }
                entry = self.queue.dequeue() => {
                    let now_us = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_micros() as u64;
                    match crate::actuator::apply_command(&entry, &self.sources, &self.state, self.filter.as_ref(), now_us) {
                        Ok(new_index) => {
                            self.switch_count.increment();
                            tracing::info!(target: crate::LOG_TARGET, new_index, "command applied");
                        }
                        Err(err) if err.is_recoverable() => {
                            tracing::debug!(target: crate::LOG_TARGET, error = %err, "command dropped");
                        }
                        Err(err) => {
                            tracing::warn!(target: crate::LOG_TARGET, error = %err, "command failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        ControllerConfig {
            sources: SourceTable::parse("s0=udp://a;s1=udp://b").unwrap(),
            state: ControllerStateConfig::default(),
            queue_capacity: 8,
            thresholds: Thresholds::default(),
            auto_failover: AutoFailoverConfig::default(),
            revert: RevertConfig::default(),
            filter: Box::new(NullFilterAdapter),
            startup_grace_ms: 0,
        }
    }

    #[test]
    fn request_switch_rejects_unknown_source() {
        let controller = Controller::new(config());
        let err = controller.request_switch("bogus", 0).unwrap_err();
        assert!(matches!(err, ControllerError::UnknownSource(_)));
    }

    #[test]
    fn request_and_drain_applies_switch() {
        let controller = Controller::new(config());
        controller.request_switch("s1", 0).unwrap();
        controller.drain_and_apply(1000);
        assert_eq!(controller.state.active_index(), 1);
    }

    #[test]
    fn health_tick_marks_stale_source_unhealthy() {
        let controller = Controller::new(config());
        controller.record_first_output(0);
        controller.health_tick(0);
        assert!(controller.sources.get(0).unwrap().health_snapshot().is_healthy);

        let far_future = controller.thresholds.stream_loss_ms + 1;
        controller.health_tick(far_future);
        assert!(!controller.sources.get(0).unwrap().health_snapshot().is_healthy);
    }

    #[tokio::test]
    async fn run_actuator_applies_enqueued_switch_without_a_health_tick() {
        let controller = Controller::new(config());
        let shutdown = CancellationToken::new();

        let task_shutdown = shutdown.clone();
        let task_controller = Arc::clone(&controller);
        let handle = tokio::spawn(async move { task_controller.run_actuator(task_shutdown).await });

        controller.request_switch("s1", 0).unwrap();

        for _ in 0..100 {
            if controller.state.active_index() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(controller.state.active_index(), 1);

        shutdown.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }
}
