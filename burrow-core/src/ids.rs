use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct UnitId(String);

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ListenerId(String);

impl UnitId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CorrelationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ListenerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for UnitId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UnitId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Process-unique identifier generator.
///
/// Combines a monotonic counter, wall-clock millis, a high-resolution timer
/// and a random fragment. Uniqueness is practical, not cryptographic: within
/// one generator's lifetime `next_id` never repeats (the counter alone
/// guarantees that), and the time/random components keep ids distinct across
/// generators in the same process.
///
/// Every component that mints ids owns or is handed a generator; there is no
/// ambient global.
#[derive(Debug)]
pub struct IdGen {
    counter: AtomicU64,
    epoch: Instant,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Mint the next identifier.
    pub fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let fine = self.epoch.elapsed().as_nanos();
        let salt = Uuid::new_v4().as_u128() as u32;
        format!("{seq:x}-{wall:x}-{fine:x}-{salt:08x}")
    }

    pub fn next_unit_id(&self) -> UnitId {
        UnitId::new(self.next_id())
    }

    pub fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId::new(self.next_id())
    }

    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId::new(self.next_id())
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit id that is assigned exactly once and read many times.
///
/// Workers start without an identity; the controller assigns one immediately
/// after spawn and it never changes afterwards.
#[derive(Debug, Clone, Default)]
pub struct SharedId {
    cell: Arc<OnceLock<UnitId>>,
}

impl SharedId {
    /// An unassigned id cell.
    pub fn unset() -> Self {
        Self::default()
    }

    /// A cell pre-assigned at construction (the controller knows its own id).
    pub fn preset(id: UnitId) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(id);
        Self {
            cell: Arc::new(cell),
        }
    }

    /// Assign the id. Returns false if one was already assigned.
    pub fn assign(&self, id: UnitId) -> bool {
        self.cell.set(id).is_ok()
    }

    pub fn get(&self) -> Option<&UnitId> {
        self.cell.get()
    }

    /// The assigned id, or a placeholder for the window before assignment.
    pub fn current(&self) -> UnitId {
        self.cell
            .get()
            .cloned()
            .unwrap_or_else(|| UnitId::new("unassigned"))
    }
}
