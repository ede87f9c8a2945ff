use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shared_event_bus::TelemetryValue;

/// Snapshot of what a gate knows about its channel.
///
/// `received()` is derived from the value, so a value without the flag (or
/// the reverse) cannot be represented.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GateState {
    last_value: Option<TelemetryValue>,
    updates: u64,
    last_received_at: Option<DateTime<Utc>>,
}

impl GateState {
    /// Whether any sample has been accepted.
    #[must_use]
    pub const fn received(&self) -> bool {
        self.last_value.is_some()
    }

    /// Latest accepted value.
    #[must_use]
    pub const fn last_value(&self) -> Option<TelemetryValue> {
        self.last_value
    }

    /// Number of samples accepted so far.
    #[must_use]
    pub const fn updates(&self) -> u64 {
        self.updates
    }

    /// Arrival time of the latest sample.
    #[must_use]
    pub const fn last_received_at(&self) -> Option<DateTime<Utc>> {
        self.last_received_at
    }
}

/// Single-slot cache: one writer (the listener), many readers (ticks).
///
/// Writes replace the whole [`GateState`] under the lock and reads copy it
/// out, so readers always see one completed write. State is never reset.
#[derive(Debug, Default)]
pub struct LatestValueCell {
    state: RwLock<GateState>,
}

impl LatestValueCell {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the cached value, returning the new update count.
    pub fn store(&self, value: TelemetryValue, received_at: DateTime<Utc>) -> u64 {
        let mut state = self.state.write();
        state.last_value = Some(value);
        state.updates += 1;
        state.last_received_at = Some(received_at);
        state.updates
    }

    /// Copies the current state out.
    #[must_use]
    pub fn load(&self) -> GateState {
        *self.state.read()
    }
}
