//! Pipeline-facing memory hierarchy
//!
//! An instruction cache and a data cache share one backing memory. Each
//! cache port has its own stall counter owned by the driver: a miss arms
//! it with the penalty and every later call drains one unit until the
//! request may be re-issued.

use log::debug;

use super::cache::{Cache, CacheGeometry, CacheHistory};
use super::mmu::MMU;
use super::{AccessType, MISS_PENALTY};

/// Remaining stall cycles for one cache port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StallCounter {
    remaining: u32,
}

impl StallCounter {
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn is_stalled(&self) -> bool {
        self.remaining > 0
    }

    pub fn arm(&mut self, cycles: u32) {
        self.remaining = cycles;
    }

    /// Consume one stall cycle.
    /// Returns true iff the call was absorbed by the stall.
    pub fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Hierarchy policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HierarchyPolicy {
    pub icache: CacheGeometry,
    pub dcache: CacheGeometry,
    pub miss_penalty: u32,
}

impl Default for HierarchyPolicy {
    /// Geometries and penalty of the reference lab
    fn default() -> Self {
        Self {
            icache: CacheGeometry::instruction(),
            dcache: CacheGeometry::data(),
            miss_penalty: MISS_PENALTY,
        }
    }
}

/// Cycle accounting shared by both ports
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct CycleHistory {
    /// Cycles charged for misses
    pub stat_cycles: u64,
    /// Driver calls absorbed by a stall
    pub stalled_calls: u64,
    /// Requests that completed and returned
    pub completed: u64,
}

pub struct MemoryHierarchy {
    pub icache: Cache,
    pub dcache: Cache,
    pub mmu: MMU,

    pub icache_stall: StallCounter,
    pub dcache_stall: StallCounter,

    pub history: CycleHistory,
}

impl Default for MemoryHierarchy {
    fn default() -> Self {
        Self::make(HierarchyPolicy::default())
    }
}

impl MemoryHierarchy {
    pub fn make(policy: HierarchyPolicy) -> Self {
        let mut icache = Cache::make(policy.icache);
        let mut dcache = Cache::make(policy.dcache);
        icache.miss_penalty = policy.miss_penalty;
        dcache.miss_penalty = policy.miss_penalty;

        Self {
            icache,
            dcache,
            mmu: MMU::make(),
            icache_stall: StallCounter::default(),
            dcache_stall: StallCounter::default(),
            history: CycleHistory::default(),
        }
    }

    /// Instruction fetch. `None` until the access completes.
    pub fn fetch(&mut self, address: u32) -> Option<u32> {
        stalled_access(
            "icache",
            &mut self.icache,
            &mut self.icache_stall,
            &mut self.mmu,
            &mut self.history,
            address,
            AccessType::Read,
        )
    }

    /// Data load. `None` until the access completes.
    pub fn load(&mut self, address: u32) -> Option<u32> {
        stalled_access(
            "dcache",
            &mut self.dcache,
            &mut self.dcache_stall,
            &mut self.mmu,
            &mut self.history,
            address,
            AccessType::Read,
        )
    }

    /// Data store. Returns true once the store completes.
    pub fn store(&mut self, address: u32, value: u32) -> bool {
        stalled_access(
            "dcache",
            &mut self.dcache,
            &mut self.dcache_stall,
            &mut self.mmu,
            &mut self.history,
            address,
            AccessType::Write(value),
        )
        .is_some()
    }

    /// Write every dirty line of both caches back to memory
    pub fn flush(&mut self) -> usize {
        self.icache.flush(&mut self.mmu) + self.dcache.flush(&mut self.mmu)
    }

    /// Return the list of cache histories
    pub fn get_history(&self) -> Vec<CacheHistory> {
        vec![self.icache.history, self.dcache.history]
    }
}

fn stalled_access(
    name: &str,
    cache: &mut Cache,
    stall: &mut StallCounter,
    mmu: &mut MMU,
    history: &mut CycleHistory,
    address: u32,
    access_type: AccessType,
) -> Option<u32> {
    if stall.tick() {
        history.stalled_calls += 1;
        debug!("{name}: stalled, {} cycles left", stall.remaining());
        return None;
    }

    let outcome = match access_type {
        AccessType::Read => cache.read(mmu, address),
        AccessType::Write(value) => cache.write(mmu, address, value),
    };

    if outcome.kind.is_miss() {
        debug!(
            "{name}: {:?} at {address:#010x}, stalling {} cycles",
            outcome.kind, outcome.cycles_charged
        );
        history.stat_cycles += outcome.cycles_charged as u64;
        stall.arm(outcome.cycles_charged);
        return None;
    }

    history.completed += 1;
    Some(outcome.data)
}
