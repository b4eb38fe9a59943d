//! Value Objects for the read side
//!
//! Immutable, validated primitives shared by every crate in the workspace.
//! All value objects enforce invariants at construction time.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain errors for value object validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Tag must be non-empty
    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    /// Offset must not be negative
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),

    /// Shard count must be at least one
    #[error("Invalid shard count: {0}")]
    InvalidShardCount(u32),

    /// Worker identifier must be non-empty
    #[error("Invalid worker id: {0}")]
    InvalidWorkerId(String),
}

// =============================================================================
// Tag
// =============================================================================

/// Partition key for one disjoint shard of the event stream.
///
/// # Invariants
/// - Must be non-empty
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    /// Create a new Tag with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidTag` if the name is blank
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::InvalidTag("Tag must be non-empty".to_string()));
        }
        Ok(Self(name))
    }

    /// Get the tag name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Offset
// =============================================================================

/// Position of an event inside its tag, "processed up to and including".
///
/// Offsets are assigned at persist time, start at 1 for the first event of a
/// tag and grow by one per event. `Offset::BEGINNING` sits before the first
/// event.
///
/// # Invariants
/// - Must be >= 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Offset(i64);

impl Offset {
    /// Sentinel for "nothing processed yet"
    pub const BEGINNING: Offset = Offset(0);

    /// Create a new Offset with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidOffset` if value < 0
    pub fn new(value: i64) -> Result<Self, DomainError> {
        if value < 0 {
            return Err(DomainError::InvalidOffset(value));
        }
        Ok(Self(value))
    }

    /// Get the underlying sequence number
    pub fn value(&self) -> i64 {
        self.0
    }

    /// The offset directly after this one
    pub fn next(&self) -> Offset {
        Offset(self.0 + 1)
    }

    /// True for the `BEGINNING` sentinel
    pub fn is_beginning(&self) -> bool {
        self.0 == 0
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::BEGINNING
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// WorkerId
// =============================================================================

/// Identity of one worker process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a new WorkerId with validation
    ///
    /// # Errors
    /// Returns `DomainError::InvalidWorkerId` if the id is blank
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::InvalidWorkerId("Worker id must be non-empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Generate a unique worker id (`worker-<uuid v7>`)
    pub fn generate() -> Self {
        Self(format!("worker-{}", uuid::Uuid::now_v7()))
    }

    /// Get the worker id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// AggregateEventTag
// =============================================================================

/// Fixed set of sharded tags for one aggregate type.
///
/// Tags are named `<base><n>` for `n in 0..num_shards`. The tag of an entity
/// is derived from a stable hash of its id, so the assignment never changes
/// between processes or releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateEventTag {
    base: String,
    num_shards: u32,
}

impl AggregateEventTag {
    /// Create a shard set
    ///
    /// # Errors
    /// - `DomainError::InvalidTag` if `base` is blank
    /// - `DomainError::InvalidShardCount` if `num_shards` is zero
    pub fn sharded(base: impl Into<String>, num_shards: u32) -> Result<Self, DomainError> {
        let base = base.into();
        if base.trim().is_empty() {
            return Err(DomainError::InvalidTag("Tag base must be non-empty".to_string()));
        }
        if num_shards == 0 {
            return Err(DomainError::InvalidShardCount(num_shards));
        }
        Ok(Self { base, num_shards })
    }

    /// Number of shards
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Every tag of the set, in shard order
    pub fn all_tags(&self) -> Vec<Tag> {
        (0..self.num_shards).map(|n| self.tag_for_shard(n)).collect()
    }

    /// Tag owning the given entity
    pub fn tag_for(&self, entity_id: &str) -> Tag {
        self.tag_for_shard(shard_of(entity_id, self.num_shards))
    }

    fn tag_for_shard(&self, shard: u32) -> Tag {
        Tag(format!("{}{}", self.base, shard))
    }
}

/// Stable shard index: first 8 bytes of SHA-256(entity_id), big-endian, mod n.
fn shard_of(entity_id: &str, num_shards: u32) -> u32 {
    let digest = Sha256::digest(entity_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(num_shards)) as u32
}

// =============================================================================
// Tests
// =============================================================================
