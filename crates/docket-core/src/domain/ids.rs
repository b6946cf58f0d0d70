//! Domain identifiers (strongly-typed IDs).
//!
//! ULID-based ids behind a phantom-typed wrapper: `TaskId`, `PipelineId` and
//! `ConnectionId` share one implementation but cannot be mixed up at compile
//! time. ULIDs sort by creation time, which makes logs and store dumps easy
//! to read in submission order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for id types. Provides the Display prefix ("task-", ...).
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic id type. `T` is a zero-sized marker, so `Id<T>` is exactly one
/// ULID (16 bytes) at runtime.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

/// Marker for tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Marker for analysis pipelines (multi-stage sagas).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pipeline {}

impl IdMarker for Pipeline {
    fn prefix() -> &'static str {
        "pipeline-"
    }
}

/// Marker for real-time connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Connection {}

impl IdMarker for Connection {
    fn prefix() -> &'static str {
        "conn-"
    }
}

/// Identifier of a Task (submit/status/cancel unit).
pub type TaskId = Id<Task>;

/// Identifier of a Pipeline (detect -> analyze saga).
pub type PipelineId = Id<Pipeline>;

/// Identifier of a real-time connection handle.
pub type ConnectionId = Id<Connection>;
