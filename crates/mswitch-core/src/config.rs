//! Threshold parsing and the small closed-set enums that make up the rest
//! of the controller's external configuration surface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Threshold values driving the Health Monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub stream_loss_ms: u64,
    pub pid_loss_ms: u64,
    pub black_ms: u64,
    pub cc_errors_per_sec: f64,
    pub packet_loss_percent: f64,
    pub packet_loss_window_sec: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            stream_loss_ms: 2000,
            pid_loss_ms: 500,
            black_ms: 800,
            cc_errors_per_sec: 5.0,
            packet_loss_percent: 2.0,
            packet_loss_window_sec: 10,
        }
    }
}

impl Thresholds {
    /// Parse the `key=value,key=value,...` thresholds string. Unknown keys
    /// are silently ignored; missing keys keep their default.
    pub fn parse(spec: &str) -> Result<Self, ControllerError> {
        let mut thresholds = Self::default();

        for pair in spec.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ControllerError::ConfigInvalid(format!("malformed threshold entry: {pair:?}"))
            })?;
            let key = key.trim();
            let value = value.trim();

            match key {
                "stream_loss" => {
                    thresholds.stream_loss_ms = parse_u64(key, value)?;
                }
                "pid_loss" => {
                    thresholds.pid_loss_ms = parse_u64(key, value)?;
                }
                "black_ms" => {
                    thresholds.black_ms = parse_u64(key, value)?;
                }
                "cc_errors_per_sec" => {
                    thresholds.cc_errors_per_sec = parse_f64(key, value)?;
                }
                "packet_loss_percent" => {
                    thresholds.packet_loss_percent = parse_f64(key, value)?;
                }
                "packet_loss_window_sec" => {
                    thresholds.packet_loss_window_sec = parse_u64(key, value)?;
                }
                _ => {
                    tracing::debug!(target: crate::LOG_TARGET, key, "ignoring unknown threshold key");
                }
            }
        }

        Ok(thresholds)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ControllerError> {
    value
        .parse()
        .map_err(|_| ControllerError::ConfigInvalid(format!("threshold {key}={value:?} is not an integer")))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ControllerError> {
    value
        .parse()
        .map_err(|_| ControllerError::ConfigInvalid(format!("threshold {key}={value:?} is not a number")))
}

/// Switching granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchMode {
    Seamless,
    Graceful,
    Cutover,
}

impl Default for SwitchMode {
    fn default() -> Self {
        SwitchMode::Seamless
    }
}

impl FromStr for SwitchMode {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "seamless" => Ok(SwitchMode::Seamless),
            "graceful" => Ok(SwitchMode::Graceful),
            "cutover" => Ok(SwitchMode::Cutover),
            other => Err(ControllerError::ConfigInvalid(format!(
                "unknown switch mode: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for SwitchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SwitchMode::Seamless => "seamless",
            SwitchMode::Graceful => "graceful",
            SwitchMode::Cutover => "cutover",
        };
        f.write_str(s)
    }
}

/// Emission policy during a cutover gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutPolicy {
    Freeze,
    Black,
}

impl Default for CutPolicy {
    fn default() -> Self {
        CutPolicy::Freeze
    }
}

impl FromStr for CutPolicy {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "freeze" => Ok(CutPolicy::Freeze),
            "black" => Ok(CutPolicy::Black),
            other => Err(ControllerError::ConfigInvalid(format!(
                "unknown cut policy: {other:?}"
            ))),
        }
    }
}

/// Ingest discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    Hot,
    Standby,
}

impl Default for IngestMode {
    fn default() -> Self {
        IngestMode::Hot
    }
}

impl FromStr for IngestMode {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(IngestMode::Hot),
            "standby" => Ok(IngestMode::Standby),
            other => Err(ControllerError::ConfigInvalid(format!(
                "unknown ingest mode: {other:?}"
            ))),
        }
    }
}

/// Revert policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevertPolicy {
    Auto,
    Manual,
}

impl Default for RevertPolicy {
    fn default() -> Self {
        RevertPolicy::Manual
    }
}

impl FromStr for RevertPolicy {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(RevertPolicy::Auto),
            "manual" => Ok(RevertPolicy::Manual),
            other => Err(ControllerError::ConfigInvalid(format!(
                "unknown revert policy: {other:?}"
            ))),
        }
    }
}

/// Auto-failover knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoFailoverConfig {
    pub enabled: bool,
    pub health_window_ms: u64,
    pub recovery_delay_ms: u64,
}

impl Default for AutoFailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_window_ms: 5_000,
            recovery_delay_ms: crate::DEFAULT_RECOVERY_DELAY_MS,
        }
    }
}

/// Revert knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RevertConfig {
    pub policy: RevertPolicy,
    pub health_window_ms: u64,
}

impl Default for RevertConfig {
    fn default() -> Self {
        Self {
            policy: RevertPolicy::Manual,
            health_window_ms: 10_000,
        }
    }
}

/// Optional on-disk configuration file, loaded via `toml` when `--config`
/// is given. CLI flags (parsed separately in `mswitchd`) override any
/// value present here. This is ambient plumbing, not a core-controller
/// concern — `mswitch-core` only knows how to turn the resulting strings
/// into a `SourceTable`/`Thresholds`/`Controller`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MswitchFileConfig {
    pub sources: Option<String>,
    pub thresholds: Option<String>,
    pub mode: Option<String>,
    pub on_cut: Option<String>,
    pub freeze_ms: Option<u64>,
    pub buffer_ms: Option<u64>,
    pub ingest_mode: Option<String>,
    pub auto_failover: Option<bool>,
    pub revert_policy: Option<String>,
    pub health_window_ms: Option<u64>,
    pub recovery_delay_ms: Option<u64>,
    pub base_port: Option<u16>,
    pub output_port: Option<u16>,
    pub http_listen: Option<String>,
    pub cmd_file: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let t = Thresholds::default();
        assert_eq!(t.stream_loss_ms, 2000);
        assert_eq!(t.pid_loss_ms, 500);
        assert_eq!(t.black_ms, 800);
        assert_eq!(t.cc_errors_per_sec, 5.0);
        assert_eq!(t.packet_loss_percent, 2.0);
        assert_eq!(t.packet_loss_window_sec, 10);
    }

    #[test]
    fn parses_partial_overrides() {
        let t = Thresholds::parse("stream_loss=1000,packet_loss_percent=1.5").unwrap();
        assert_eq!(t.stream_loss_ms, 1000);
        assert_eq!(t.packet_loss_percent, 1.5);
        assert_eq!(t.pid_loss_ms, 500); // untouched default
    }

    #[test]
    fn ignores_unknown_keys() {
        let t = Thresholds::parse("made_up_key=42,stream_loss=1234").unwrap();
        assert_eq!(t.stream_loss_ms, 1234);
    }

    #[test]
    fn mode_from_str() {
        assert_eq!(SwitchMode::from_str("graceful").unwrap(), SwitchMode::Graceful);
        assert!(SwitchMode::from_str("bogus").is_err());
    }
}
