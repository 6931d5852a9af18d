//! Identity and clock primitives shared by every component.
//!
//! Per the design notes, the only permissible process-wide singleton is
//! an identity generator, and it must be injectable for tests. Clocks
//! are free functions rather than an injectable trait: nothing in this
//! crate needs to fake time beyond what `deadline_ms` parameters already
//! allow callers to control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, globally-unique 128-bit agent identifier. Ordering is
/// byte-lexicographic over the underlying value, which CNP's final bid
/// tie-break relies on for determinism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub u128);

impl AgentId {
    pub fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id.as_u128())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Opaque unique identifier used for message ids and correlation ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Id(pub u128);

impl Id {
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id.as_u128())
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Injectable id source. Production code uses [`UuidGenerator`]; tests
/// that need deterministic, orderable ids use [`SequentialGenerator`].
pub trait IdGenerator: Send + Sync {
    fn next_agent_id(&self) -> AgentId;
    fn next_id(&self) -> Id;
}

/// Default generator backed by random UUIDv4s.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn next_agent_id(&self) -> AgentId {
        AgentId::from_uuid(Uuid::new_v4())
    }

    fn next_id(&self) -> Id {
        Id::from_uuid(Uuid::new_v4())
    }
}

/// Deterministic generator for tests: hands out strictly increasing
/// ids so ordering assertions don't depend on UUID randomness.
#[derive(Debug, Default)]
pub struct SequentialGenerator {
    next: AtomicU64,
}

impl SequentialGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialGenerator {
    fn next_agent_id(&self) -> AgentId {
        AgentId::new(self.next.fetch_add(1, Ordering::Relaxed) as u128)
    }

    fn next_id(&self) -> Id {
        Id(self.next.fetch_add(1, Ordering::Relaxed) as u128)
    }
}

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since first use in this process. Used for
/// `Message::timestamp` and `Capability` task-completion bookkeeping —
/// values are only ever compared within a single process run.
pub fn now_monotonic_ms() -> u64 {
    let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// Wall-clock milliseconds since the Unix epoch. Used for
/// `TaskAnnouncement` deadlines, which are meaningful across process
/// boundaries conceptually even though this crate never persists them.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
