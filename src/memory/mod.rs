//! Memory structure

pub mod cache;
pub mod hierarchy;
pub mod mmu;
pub mod replacement;

pub use cache::{AccessOutcome, Cache, CacheGeometry, CacheHistory};
pub use hierarchy::{CycleHistory, HierarchyPolicy, MemoryHierarchy, StallCounter};
pub use mmu::MMU;
pub use replacement::{AgingCounter, ReplacementPolicy, TimestampLru};

/// Fixed latency charged for every cache miss
pub const MISS_PENALTY: u32 = 50;

/// Width in bytes of one word moved between a cache and backing memory
pub const WORD_BYTES: u32 = 4;

/// Flat, byte-addressable memory accessed in 4-byte words.
///
/// Caches only ever hand word-aligned addresses to these methods.
/// Bounds and alignment policy beyond that belongs to the implementor.
pub trait BackingStore {
    fn read_word(&mut self, address: u32) -> u32;
    fn write_word(&mut self, address: u32, value: u32);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    Read,
    /// Store of the carried word
    Write(u32),
}

/// How a single access was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessKind {
    /// A valid way already held the tag
    Hit,
    /// The line was brought into an invalid way
    FillMiss,
    /// Every way was valid; a victim was evicted to make room
    EvictionMiss,
}

impl AccessKind {
    pub fn is_miss(&self) -> bool {
        *self != AccessKind::Hit
    }
}
