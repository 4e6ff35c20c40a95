//! Replacement policies
//!
//! A policy classifies one request against the ways of a set and keeps
//! whatever recency bookkeeping it needs. The cache applies the decision
//! (filling, evicting) and then reports the way that served the request
//! through [`ReplacementPolicy::touch`].

use log::trace;

use super::cache::Block;

/// Decision taken for one request against one set
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// The way holds the requested tag
    Hit(usize),
    /// The way is invalid and takes the incoming line
    Fill(usize),
    /// Every way is valid; the way is the victim
    Evict(usize),
}

impl Probe {
    pub fn way(&self) -> usize {
        match *self {
            Probe::Hit(way) | Probe::Fill(way) | Probe::Evict(way) => way,
        }
    }
}

pub trait ReplacementPolicy {
    /// Build the policy state for a cache of the given shape
    fn make(sets: usize, ways: usize) -> Self
    where
        Self: Sized;

    /// Classify a request for `tag` against `set`, the blocks of set `index`
    fn probe(&mut self, index: usize, set: &mut [Block], tag: u32) -> Probe;

    /// Mark `way` as the most recent user of set `index`
    fn touch(&mut self, index: usize, set: &mut [Block], way: usize);
}

/// Counter-based approximation of LRU.
///
/// Every valid way that is passed over during a scan ages by one. The first
/// valid way carrying the tag ends the search; an invalid way ends it if
/// nothing has matched yet. Ways scanned after the search ended are still
/// aged but never considered as victims. When the search never ends, the
/// victim is the first way holding the largest counter seen.
#[derive(Debug, Default)]
pub struct AgingCounter;

impl ReplacementPolicy for AgingCounter {
    fn make(_sets: usize, _ways: usize) -> Self {
        AgingCounter
    }

    fn probe(&mut self, index: usize, set: &mut [Block], tag: u32) -> Probe {
        let mut resolved: Option<Probe> = None;
        let mut victim = 0;
        let mut max_counter = 0;

        for (way, block) in set.iter_mut().enumerate() {
            if !block.valid {
                if resolved.is_some() {
                    break;
                }
                trace!("set {index} way {way}: invalid, taking it");
                resolved = Some(Probe::Fill(way));
                continue;
            }

            // Background aging once the request is settled
            if resolved.is_some() {
                block.replacement_counter = block.replacement_counter.saturating_add(1);
                continue;
            }

            if block.tag == tag {
                trace!("set {index} way {way}: tag {tag:#x} matches");
                resolved = Some(Probe::Hit(way));
            } else {
                block.replacement_counter = block.replacement_counter.saturating_add(1);
                if block.replacement_counter > max_counter {
                    victim = way;
                    max_counter = block.replacement_counter;
                }
            }
        }

        resolved.unwrap_or(Probe::Evict(victim))
    }

    fn touch(&mut self, _index: usize, set: &mut [Block], way: usize) {
        set[way].replacement_counter = 0;
    }
}

/// True LRU: every reference stamps the way with a global reference
/// counter and the victim is the way with the oldest stamp.
#[derive(Debug)]
pub struct TimestampLru {
    ways: usize,
    stamps: Vec<u64>,
    ref_counter: u64,
}

impl ReplacementPolicy for TimestampLru {
    fn make(sets: usize, ways: usize) -> Self {
        Self {
            ways,
            stamps: vec![0; sets * ways],
            ref_counter: 0,
        }
    }

    fn probe(&mut self, index: usize, set: &mut [Block], tag: u32) -> Probe {
        if let Some(way) = set.iter().position(|b| b.valid && b.tag == tag) {
            return Probe::Hit(way);
        }
        if let Some(way) = set.iter().position(|b| !b.valid) {
            return Probe::Fill(way);
        }

        let stamps = &self.stamps[index * self.ways..(index + 1) * self.ways];
        let mut victim = 0;
        for (way, stamp) in stamps.iter().enumerate() {
            if *stamp < stamps[victim] {
                victim = way;
            }
        }
        Probe::Evict(victim)
    }

    fn touch(&mut self, index: usize, _set: &mut [Block], way: usize) {
        self.ref_counter += 1;
        self.stamps[index * self.ways + way] = self.ref_counter;
    }
}
