//! Source Descriptor Table (C1).
//!
//! Fixed-shape after construction: count, IDs, and URLs never change once
//! `SourceTable::parse` returns. Only the per-source mutable health block
//! varies, and each block is guarded by its own mutex so the Health
//! Monitor never serializes across sources.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Maximum length of a source ID, (command queue element).
pub const MAX_SOURCE_ID_LEN: usize = 15;

/// Static metadata for one source, fixed for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeta {
    pub id: String,
    pub url: String,
    pub name: String,
}

/// Mutable health state for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub is_healthy: bool,
    pub last_packet_time_ms: u64,
    pub last_health_check_ms: u64,
    pub last_recovery_time_ms: u64,
    pub stream_loss_count: u64,
    pub black_frame_count: u64,
    pub cc_error_count: u64,
    pub pid_loss_count: u64,
    pub window_start_ms: u64,
    pub packets_in_window: u64,
    pub lost_in_window: u64,
    pub current_loss_percent: f64,
    /// `None` while the source's PID is present; set to the timestamp PID
    /// presence was last lost, cleared the moment it's observed again.
    pub pid_absent_since_ms: Option<u64>,
    pub cc_error_window_start_ms: u64,
    pub cc_errors_in_window: u64,
    pub cc_error_rate: f64,
    /// `None` while the source's decoded output isn't black; set to the
    /// timestamp black output was first observed, cleared on any non-black
    /// sample.
    pub black_since_ms: Option<u64>,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_packet_time_ms: 0,
            last_health_check_ms: 0,
            last_recovery_time_ms: 0,
            stream_loss_count: 0,
            black_frame_count: 0,
            cc_error_count: 0,
            pid_loss_count: 0,
            window_start_ms: 0,
            packets_in_window: 0,
            lost_in_window: 0,
            current_loss_percent: 0.0,
            pid_absent_since_ms: None,
            cc_error_window_start_ms: 0,
            cc_errors_in_window: 0,
            cc_error_rate: 0.0,
            black_since_ms: None,
        }
    }
}

/// One entry in the Source Descriptor Table: immutable metadata plus an
/// independently-lockable mutable health block.
pub struct SourceDescriptor {
    pub meta: SourceMeta,
    pub health: Mutex<SourceHealth>,
}

impl SourceDescriptor {
    /// Atomic snapshot of the health block, for display/serialization.
    pub fn health_snapshot(&self) -> SourceHealth {
        self.health.lock().expect("source health mutex poisoned").clone()
    }
}

/// Ordered, fixed-shape table of source descriptors. Order fixes
/// tie-breaking for both initial selection and failover candidate choice.
pub struct SourceTable {
    sources: Vec<SourceDescriptor>,
}

impl SourceTable {
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SourceDescriptor> {
        self.sources.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.sources.iter()
    }

    /// Resolve a command's `source_id` string to a table index.
    /// Accepts either the canonical ID string or a single-digit numeric
    /// index.
    pub fn resolve(&self, source_id: &str) -> Option<usize> {
        if let Some(idx) = self.sources.iter().position(|s| s.meta.id == source_id) {
            return Some(idx);
        }
        if source_id.len() == 1 {
            if let Some(digit) = source_id.chars().next().and_then(|c| c.to_digit(10)) {
                let idx = digit as usize;
                if idx < self.sources.len() {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Parse the `id=url(;id=url)*` configuration string.
    /// Trailing/empty tokens are ignored. Fails on an empty result set or
    /// on a duplicate ID.
    pub fn parse(spec: &str) -> Result<Self, ControllerError> {
        let mut sources = Vec::new();
        let mut seen_ids = std::collections::HashSet::new();

        for token in spec.split(';') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }

            let (id, url) = token.split_once('=').ok_or_else(|| {
                ControllerError::ConfigInvalid(format!("malformed source entry: {token:?}"))
            })?;
            let id = id.trim();
            let url = url.trim();

            if id.is_empty() || url.is_empty() {
                return Err(ControllerError::ConfigInvalid(format!(
                    "empty id or url in entry: {token:?}"
                )));
            }
            if id.len() > MAX_SOURCE_ID_LEN {
                return Err(ControllerError::ConfigInvalid(format!(
                    "source id {id:?} exceeds {MAX_SOURCE_ID_LEN} characters"
                )));
            }
            if !seen_ids.insert(id.to_string()) {
                return Err(ControllerError::ConfigInvalid(format!(
                    "duplicate source id: {id:?}"
                )));
            }

            sources.push(SourceDescriptor {
                meta: SourceMeta {
                    id: id.to_string(),
                    url: url.to_string(),
                    name: id.to_string(),
                },
                health: Mutex::new(SourceHealth::default()),
            });
        }

        if sources.is_empty() {
            return Err(ControllerError::ConfigInvalid(
                "sources string yielded no entries".to_string(),
            ));
        }

        if sources.len() > crate::MSW_MAX_SOURCES {
            return Err(ControllerError::ConfigInvalid(format!(
                "{} sources exceeds MSW_MAX_SOURCES ({})",
                sources.len(),
                crate::MSW_MAX_SOURCES
            )));
        }

        Ok(Self { sources })
    }

    /// Serialize back to the canonical `id=url;...` form, preserving
    /// insertion order (round-trip property R2).
    pub fn to_config_string(&self) -> String {
        self.sources
            .iter()
            .map(|s| format!("{}={}", s.meta.id, s.meta.url))
            .collect::<Vec<_>>()
            .join(";")
    }
}
