//! Health Monitor (C3).
//!
//! A periodic evaluator, not a long-running task itself — `evaluate_source`
//! is called by the controller's monitor loop (owned by `mswitchd`) once
//! per tick for every source. Keeping the evaluation pure and stateless
//! beyond the source's own health block makes it trivial to unit-test
//! against synthetic clocks instead of real wall time.

use std::time::Duration;

use crate::config::Thresholds;
use crate::source::{SourceDescriptor, SourceHealth};

/// Outcome of evaluating one source at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    Unhealthy(UnhealthyReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnhealthyReason {
    StreamLoss,
    PidLoss,
    CcErrorRate,
    PacketLossPercent,
    BlackFrame,
}

impl std::fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnhealthyReason::StreamLoss => "stream_loss",
            UnhealthyReason::PidLoss => "pid_loss",
            UnhealthyReason::CcErrorRate => "cc_error_rate",
            UnhealthyReason::PacketLossPercent => "packet_loss_percent",
            UnhealthyReason::BlackFrame => "black_frame",
        };
        f.write_str(s)
    }
}

/// Tracks when monitoring started, to implement the startup grace period:
/// no unhealthy verdict is emitted until some source has produced output
/// and an additional stabilization window has elapsed since then.
pub struct GracePeriod {
    first_output_at_ms: Option<u64>,
    stabilization_ms: u64,
}

impl GracePeriod {
    pub fn new(stabilization_ms: u64) -> Self {
        Self {
            first_output_at_ms: None,
            stabilization_ms,
        }
    }

    /// Record that some source produced output at `now_ms`. Idempotent
    /// after the first call.
    pub fn record_first_output(&mut self, now_ms: u64) {
        if self.first_output_at_ms.is_none() {
            self.first_output_at_ms = Some(now_ms);
        }
    }

    /// True while the grace period is still in effect at `now_ms`.
    pub fn active(&self, now_ms: u64) -> bool {
        match self.first_output_at_ms {
            None => true,
            Some(start) => now_ms.saturating_sub(start) < self.stabilization_ms,
        }
    }
}

/// Evaluate one source's liveness at `now_ms`, in the fixed order laid out
/// for the monitor: stream loss, then PID loss, then continuity-counter
/// error rate, then packet-loss percent, then (active source only) black
/// frame. Returns the first failing check, or `Healthy` if none fail.
///
/// Stream-loss uses arrival-age directly (`now - last_packet_time_ms >
/// stream_loss_ms`) rather than "already unhealthy for N ms" — both are
/// valid derivations and this one needs no extra state.
pub fn evaluate_source(
    health: &SourceHealth,
    thresholds: &Thresholds,
    now_ms: u64,
    is_active: bool,
) -> HealthVerdict {
    if health.last_packet_time_ms > 0
        && now_ms.saturating_sub(health.last_packet_time_ms) > thresholds.stream_loss_ms
    {
        return HealthVerdict::Unhealthy(UnhealthyReason::StreamLoss);
    }

    // PID presence and black-frame state are demuxer/decoder-observed
    // conditions; the proxy itself never inspects payload bytes, so these
    // fields only move when something upstream calls `record_pid_presence`
    // / `record_black_frame_sample`. Absent that caller they simply never
    // trip, the same as a MIDI device that's never plugged in.
    if let Some(since) = health.pid_absent_since_ms {
        if now_ms.saturating_sub(since) > thresholds.pid_loss_ms {
            return HealthVerdict::Unhealthy(UnhealthyReason::PidLoss);
        }
    }

    if health.cc_error_rate > thresholds.cc_errors_per_sec {
        return HealthVerdict::Unhealthy(UnhealthyReason::CcErrorRate);
    }

    if health.packets_in_window > 0 && health.current_loss_percent > thresholds.packet_loss_percent
    {
        return HealthVerdict::Unhealthy(UnhealthyReason::PacketLossPercent);
    }

    if is_active {
        if let Some(since) = health.black_since_ms {
            if now_ms.saturating_sub(since) > thresholds.black_ms {
                return HealthVerdict::Unhealthy(UnhealthyReason::BlackFrame);
            }
        }
    }

    HealthVerdict::Healthy
}

/// Apply a verdict to a source's mutable health block, updating
/// `is_healthy`, the cumulative per-reason counters (display/diagnostics
/// only — evaluation itself reads the duration-tracking fields the
/// `record_*` functions maintain, not these counters), and
/// `last_recovery_time_ms` on a unhealthy -> healthy transition (so the
/// hysteresis window in the failover engine has something to measure
/// against).
pub fn apply_verdict(health: &mut SourceHealth, verdict: &HealthVerdict, now_ms: u64) {
    health.last_health_check_ms = now_ms;

    let was_healthy = health.is_healthy;
    match verdict {
        HealthVerdict::Healthy => {
            health.is_healthy = true;
            if !was_healthy {
                health.last_recovery_time_ms = now_ms;
            }
        }
        HealthVerdict::Unhealthy(reason) => {
            health.is_healthy = false;
            match reason {
                UnhealthyReason::StreamLoss => health.stream_loss_count += 1,
                UnhealthyReason::PidLoss => health.pid_loss_count += 1,
                UnhealthyReason::CcErrorRate => health.cc_error_count += 1,
                UnhealthyReason::PacketLossPercent => {}
                UnhealthyReason::BlackFrame => health.black_frame_count += 1,
            }
        }
    }
}

/// True when `source` remains ineligible for failover selection due to the
/// hysteresis window after its last recovery.
pub fn in_recovery_hysteresis(health: &SourceHealth, now_ms: u64, recovery_delay_ms: u64) -> bool {
    if health.last_recovery_time_ms == 0 {
        return false;
    }
    now_ms.saturating_sub(health.last_recovery_time_ms) < recovery_delay_ms
}

/// Record that `source`'s PID is or isn't currently present, for a
/// downstream demuxer to call as it observes the transport stream.
/// `evaluate_source` only trips `PidLoss` once the absence has persisted
/// past `thresholds.pid_loss_ms`.
pub fn record_pid_presence(health: &mut SourceHealth, present: bool, now_ms: u64) {
    if present {
        health.pid_absent_since_ms = None;
    } else if health.pid_absent_since_ms.is_none() {
        health.pid_absent_since_ms = Some(now_ms);
    }
}

/// Record one observed continuity-counter error, for a downstream demuxer
/// to call as it observes the transport stream. Accumulates into the
/// current 1 s bucket; call `roll_cc_error_window` once per tick to fold
/// the bucket into `cc_error_rate` and decay it back to zero once errors
/// stop arriving.
pub fn record_cc_error(health: &mut SourceHealth, now_ms: u64) {
    if health.cc_error_window_start_ms == 0 {
        health.cc_error_window_start_ms = now_ms;
    }
    health.cc_errors_in_window += 1;
}

/// Close out the current continuity-counter error window once at least a
/// second has elapsed since it opened, folding the accumulated count into
/// an errors/sec rate and starting a fresh window. Called once per health
/// tick regardless of whether any errors arrived, so the rate decays to
/// zero during a clean second rather than latching at its last value.
pub fn roll_cc_error_window(health: &mut SourceHealth, now_ms: u64) {
    if health.cc_error_window_start_ms == 0 {
        health.cc_error_window_start_ms = now_ms;
        return;
    }
    let elapsed = now_ms.saturating_sub(health.cc_error_window_start_ms);
    if elapsed >= 1000 {
        health.cc_error_rate = health.cc_errors_in_window as f64 * 1000.0 / elapsed as f64;
        health.cc_error_window_start_ms = now_ms;
        health.cc_errors_in_window = 0;
    }
}

/// Record one observed decoded-frame sample as black or not, for a
/// downstream decoder to call as it observes the active source's output.
/// `evaluate_source` only trips `BlackFrame` once the black run has
/// persisted past `thresholds.black_ms`.
pub fn record_black_frame_sample(health: &mut SourceHealth, is_black: bool, now_ms: u64) {
    if is_black {
        if health.black_since_ms.is_none() {
            health.black_since_ms = Some(now_ms);
        }
    } else {
        health.black_since_ms = None;
    }
}

/// Roll a source's packet-loss window forward, recomputing
/// `current_loss_percent` once the window has elapsed.
pub fn record_packet_arrival(
    health: &mut SourceHealth,
    now_ms: u64,
    lost_since_last: u64,
    window: Duration,
) {
    health.last_packet_time_ms = now_ms;

    if health.window_start_ms == 0 {
        health.window_start_ms = now_ms;
    }

    health.packets_in_window += 1;
    health.lost_in_window += lost_since_last;

    let elapsed = now_ms.saturating_sub(health.window_start_ms);
    if elapsed >= window.as_millis() as u64 {
        let expected = health.packets_in_window + health.lost_in_window;
        health.current_loss_percent = if expected > 0 {
            (health.lost_in_window as f64 / expected as f64) * 100.0
        } else {
            0.0
        };
        health.window_start_ms = now_ms;
        health.packets_in_window = 0;
        health.lost_in_window = 0;
    }
}

/// Snapshot + evaluate + apply in one step, for the monitor loop's
/// per-source iteration. Returns the verdict for logging.
pub fn tick_source(
    descriptor: &SourceDescriptor,
    thresholds: &Thresholds,
    now_ms: u64,
    is_active: bool,
    grace: &GracePeriod,
) -> HealthVerdict {
    let mut health = descriptor
        .health
        .lock()
        .expect("source health mutex poisoned");

    if grace.active(now_ms) {
        // No unhealthy verdict is surfaced during the grace period, but
        // arrival-age bookkeeping still proceeds underneath.
        health.is_healthy = true;
        health.last_health_check_ms = now_ms;
        return HealthVerdict::Healthy;
    }

    roll_cc_error_window(&mut health, now_ms);
    let verdict = evaluate_source(&health, thresholds, now_ms, is_active);
    apply_verdict(&mut health, &verdict, now_ms);
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_state(now_ms: u64) -> SourceHealth {
        SourceHealth {
            is_healthy: true,
            last_packet_time_ms: now_ms,
            ..SourceHealth::default()
        }
    }

    #[test]
    fn fresh_arrivals_stay_healthy() {
        let health = healthy_state(1000);
        let verdict = evaluate_source(&health, &Thresholds::default(), 1500, false);
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn stale_arrivals_trigger_stream_loss() {
        let health = healthy_state(1000);
        let thresholds = Thresholds::default();
        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.stream_loss_ms + 1, false);
        assert_eq!(verdict, HealthVerdict::Unhealthy(UnhealthyReason::StreamLoss));
    }

    #[test]
    fn exact_threshold_boundary_is_not_unhealthy() {
        // boundary_behavior: strict '>' comparison, not '>='.
        let health = healthy_state(1000);
        let thresholds = Thresholds::default();
        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.stream_loss_ms, false);
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn recovery_sets_timestamp_only_on_transition() {
        let mut health = SourceHealth {
            is_healthy: false,
            ..SourceHealth::default()
        };
        apply_verdict(&mut health, &HealthVerdict::Healthy, 5000);
        assert!(health.is_healthy);
        assert_eq!(health.last_recovery_time_ms, 5000);

        // Second healthy verdict while already healthy must not re-stamp.
        apply_verdict(&mut health, &HealthVerdict::Healthy, 9000);
        assert_eq!(health.last_recovery_time_ms, 5000);
    }

    #[test]
    fn hysteresis_blocks_recently_recovered_sources() {
        let health = SourceHealth {
            is_healthy: true,
            last_recovery_time_ms: 1000,
            ..SourceHealth::default()
        };
        assert!(in_recovery_hysteresis(&health, 2000, 5000));
        assert!(!in_recovery_hysteresis(&health, 6001, 5000));
    }

    #[test]
    fn grace_period_suppresses_unhealthy_verdicts() {
        let grace = GracePeriod::new(30_000);
        assert!(grace.active(0));

        let mut grace = GracePeriod::new(30_000);
        grace.record_first_output(1000);
        assert!(grace.active(1000 + 29_999));
        assert!(!grace.active(1000 + 30_001));
    }

    #[test]
    fn packet_loss_window_computes_percent_after_rollover() {
        let mut health = SourceHealth::default();
        let window = Duration::from_secs(10);

        for i in 0..9 {
            record_packet_arrival(&mut health, i * 100, 0, window);
        }
        // window hasn't elapsed yet
        assert_eq!(health.current_loss_percent, 0.0);

        record_packet_arrival(&mut health, 10_100, 1, window);
        assert!(health.current_loss_percent > 0.0);
    }

    #[test]
    fn pid_loss_trips_only_after_absence_exceeds_threshold() {
        let mut health = SourceHealth::default();
        let thresholds = Thresholds::default();

        record_pid_presence(&mut health, false, 1000);
        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.pid_loss_ms, false);
        assert_eq!(verdict, HealthVerdict::Healthy);

        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.pid_loss_ms + 1, false);
        assert_eq!(verdict, HealthVerdict::Unhealthy(UnhealthyReason::PidLoss));

        record_pid_presence(&mut health, true, 1000 + thresholds.pid_loss_ms + 1);
        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.pid_loss_ms + 2, false);
        assert_eq!(verdict, HealthVerdict::Healthy);
    }

    #[test]
    fn cc_error_rate_decays_once_errors_stop_arriving() {
        let mut health = SourceHealth::default();

        for _ in 0..10 {
            record_cc_error(&mut health, 1100);
        }
        roll_cc_error_window(&mut health, 2200);
        assert!(health.cc_error_rate > 5.0);

        // A full clean second with no further errors must decay the rate.
        roll_cc_error_window(&mut health, 3300);
        assert_eq!(health.cc_error_rate, 0.0);
    }

    #[test]
    fn cc_error_rate_trips_unhealthy_above_threshold() {
        let mut health = SourceHealth::default();
        let thresholds = Thresholds::default();

        for _ in 0..((thresholds.cc_errors_per_sec as u64) + 5) {
            record_cc_error(&mut health, 1100);
        }
        roll_cc_error_window(&mut health, 2200);

        let verdict = evaluate_source(&health, &thresholds, 2200, false);
        assert_eq!(verdict, HealthVerdict::Unhealthy(UnhealthyReason::CcErrorRate));
    }

    #[test]
    fn black_frame_trips_only_for_active_source_past_threshold() {
        let mut health = SourceHealth::default();
        let thresholds = Thresholds::default();

        record_black_frame_sample(&mut health, true, 1000);
        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.black_ms + 1, false);
        assert_eq!(verdict, HealthVerdict::Healthy, "inactive source is never failed on black frame");

        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.black_ms + 1, true);
        assert_eq!(verdict, HealthVerdict::Unhealthy(UnhealthyReason::BlackFrame));

        record_black_frame_sample(&mut health, false, 1000 + thresholds.black_ms + 1);
        let verdict = evaluate_source(&health, &thresholds, 1000 + thresholds.black_ms + 2, true);
        assert_eq!(verdict, HealthVerdict::Healthy);
    }
}
