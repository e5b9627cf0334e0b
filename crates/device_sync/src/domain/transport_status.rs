use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared view of whether the broker connection is currently up
///
/// The subscriber loop sets it on ConnAck and clears it on connection
/// errors and shutdown; readers only observe.
#[derive(Debug, Clone, Default)]
pub struct TransportStatus {
    connected: Arc<AtomicBool>,
}

impl TransportStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
