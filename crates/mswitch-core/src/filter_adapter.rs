//! Filter Control Adapter (C7).
//!
//! A trait at the seam between the selection logic and whatever downstream
//! filter graph is (or isn't) attached, the same way MIDI output is kept
//! behind a thin owned writer type instead of hard-wiring a concrete
//! platform backend into the broadcaster.

use crate::error::ControllerError;

/// Pushes the active-source selection into a downstream filter graph.
/// Idempotent: calling with the same `index` twice in a row must be a
/// no-op on the second call.
pub trait FilterAdapter: Send + Sync {
    fn set_active(&self, index: usize, id: &str) -> Result<(), ControllerError>;
}

/// Default adapter for when no filter graph has been attached yet.
/// Selection stays purely logical — the call always succeeds, and is
/// logged at debug rather than info to avoid noise on every switch.
pub struct NullFilterAdapter;

impl FilterAdapter for NullFilterAdapter {
    fn set_active(&self, index: usize, id: &str) -> Result<(), ControllerError> {
        tracing::debug!(
            target: crate::LOG_TARGET,
            index,
            id,
            "no filter graph attached; selection recorded logically only"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_adapter_always_succeeds() {
        let adapter = NullFilterAdapter;
        assert!(adapter.set_active(0, "s0").is_ok());
        assert!(adapter.set_active(0, "s0").is_ok());
    }
}
