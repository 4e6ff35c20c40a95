//! Set-associative cache implementation

use log::debug;

use super::replacement::{AgingCounter, Probe, ReplacementPolicy};
use super::{AccessKind, BackingStore, MISS_PENALTY, WORD_BYTES};
use crate::error::ConfigError;

/// Position of the highest set bit, `None` for zero
pub fn clog2(value: u32) -> Option<u32> {
    value.checked_ilog2()
}

pub fn is_pow_2(value: u32) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Shape of a cache, validated once at construction.
///
/// Addresses are 32-bit and look like this:
/// | tag | index | offset |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheGeometry {
    block_size: u32,
    ways: u32,
    sets: u32,

    offset_bits: u32,
    index_bits: u32,
}

impl CacheGeometry {
    pub fn new(block_size: u32, ways: u32, sets: u32) -> Result<Self, ConfigError> {
        if ways == 0 {
            return Err(ConfigError::ZeroParameter { name: "ways" });
        }
        let offset_bits =
            clog2(block_size).ok_or(ConfigError::ZeroParameter { name: "block_size" })?;
        let index_bits = clog2(sets).ok_or(ConfigError::ZeroParameter { name: "sets" })?;

        for (name, value) in [("block_size", block_size), ("sets", sets)] {
            if !is_pow_2(value) {
                return Err(ConfigError::NotPowerOfTwo { name, value });
            }
        }
        if block_size < WORD_BYTES {
            return Err(ConfigError::BlockTooSmall(block_size));
        }
        if offset_bits + index_bits > u32::BITS {
            return Err(ConfigError::GeometryTooLarge(offset_bits + index_bits));
        }

        Ok(Self {
            block_size,
            ways,
            sets,
            offset_bits,
            index_bits,
        })
    }

    /// Instruction cache of the reference lab: 4-way, 64 sets, 32-byte blocks
    pub fn instruction() -> Self {
        Self {
            block_size: 32,
            ways: 4,
            sets: 64,
            offset_bits: 5,
            index_bits: 6,
        }
    }

    /// Data cache of the reference lab: 8-way, 256 sets, 32-byte blocks
    pub fn data() -> Self {
        Self {
            block_size: 32,
            ways: 8,
            sets: 256,
            offset_bits: 5,
            index_bits: 8,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn ways(&self) -> u32 {
        self.ways
    }

    pub fn sets(&self) -> u32 {
        self.sets
    }

    pub fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    pub fn index_bits(&self) -> u32 {
        self.index_bits
    }

    /// Number of 32-bit words in one block
    pub fn words_per_block(&self) -> usize {
        (self.block_size / WORD_BYTES) as usize
    }

    /// Total data capacity in bytes
    pub fn capacity(&self) -> u64 {
        self.block_size as u64 * self.ways as u64 * self.sets as u64
    }

    /// Split an address into tag, set index, block base and offset
    pub fn decode(&self, address: u32) -> DecodedAddress {
        let tag_shift = self.offset_bits + self.index_bits;
        DecodedAddress {
            tag: address.checked_shr(tag_shift).unwrap_or(0),
            index: ((address >> self.offset_bits) & (self.sets - 1)) as usize,
            block_base: address & !(self.block_size - 1),
            offset: address & (self.block_size - 1),
        }
    }

    /// Base address of the block holding `tag` in set `index`
    pub fn block_address(&self, tag: u32, index: usize) -> u32 {
        let tag_shift = self.offset_bits + self.index_bits;
        tag.checked_shl(tag_shift).unwrap_or(0) | ((index as u32) << self.offset_bits)
    }

    /// Inverse of [`CacheGeometry::decode`]
    pub fn compose(&self, decoded: &DecodedAddress) -> u32 {
        self.block_address(decoded.tag, decoded.index) | decoded.offset
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedAddress {
    pub tag: u32,
    pub index: usize,
    pub block_base: u32,
    pub offset: u32,
}

/// Per-way metadata; the data words live in the cache arena
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub valid: bool,
    pub dirty: bool,

    pub tag: u32,
    pub replacement_counter: u8,

    /// Base address of the last fill, for diagnostics
    pub fill_address: Option<u32>,
}

impl Block {
    fn make(way: usize) -> Self {
        Self {
            replacement_counter: way.min(u8::MAX as usize) as u8,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct CacheHistory {
    pub num_hit: u64,
    pub num_miss: u64,
    pub num_eviction: u64,
    pub num_writeback: u64,
}

impl CacheHistory {
    /// Computes the current miss rate of the cache
    pub fn get_miss_rate(&self) -> f64 {
        let total = self.num_hit + self.num_miss;
        if total == 0 {
            return 0.0;
        }
        self.num_miss as f64 / total as f64
    }
}

/// Result of one read or write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessOutcome {
    /// Word read, or the word just written
    pub data: u32,
    pub kind: AccessKind,
    /// Way that served the request
    pub way: usize,
    /// Latency the caller should charge for this access
    pub cycles_charged: u32,
}

/// Set-associative, write-back, write-allocate cache
pub struct Cache<P: ReplacementPolicy = AgingCounter> {
    geometry: CacheGeometry,
    policy: P,

    // sets * ways metadata entries, set-major
    blocks: Vec<Block>,
    // sets * ways * words_per_block data words, same order as blocks
    data: Vec<u32>,

    pub miss_penalty: u32,
    pub history: CacheHistory,
}

impl Cache {
    /// Allocate a cache with the counter-based replacement policy
    pub fn make(geometry: CacheGeometry) -> Self {
        Self::make_with_policy(geometry)
    }

    /// Validate the parameters and allocate a cache
    pub fn init(block_size: u32, ways: u32, sets: u32) -> Result<Self, ConfigError> {
        Ok(Self::make(CacheGeometry::new(block_size, ways, sets)?))
    }
}

impl<P: ReplacementPolicy> Cache<P> {
    pub fn make_with_policy(geometry: CacheGeometry) -> Self {
        let sets = geometry.sets() as usize;
        let ways = geometry.ways() as usize;
        let blocks = (0..sets * ways).map(|i| Block::make(i % ways)).collect();

        Self {
            geometry,
            policy: P::make(sets, ways),
            blocks,
            data: vec![0; sets * ways * geometry.words_per_block()],
            miss_penalty: MISS_PENALTY,
            history: CacheHistory::default(),
        }
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    fn slot(&self, index: usize, way: usize) -> usize {
        index * self.geometry.ways() as usize + way
    }

    fn set_range(&self, index: usize) -> std::ops::Range<usize> {
        let ways = self.geometry.ways() as usize;
        index * ways..(index + 1) * ways
    }

    fn data_range(&self, index: usize, way: usize) -> std::ops::Range<usize> {
        let words = self.geometry.words_per_block();
        let begin = self.slot(index, way) * words;
        begin..begin + words
    }

    pub fn block(&self, index: usize, way: usize) -> &Block {
        &self.blocks[self.slot(index, way)]
    }

    pub fn block_mut(&mut self, index: usize, way: usize) -> &mut Block {
        let slot = self.slot(index, way);
        &mut self.blocks[slot]
    }

    pub fn block_data(&self, index: usize, way: usize) -> &[u32] {
        &self.data[self.data_range(index, way)]
    }

    pub fn block_data_mut(&mut self, index: usize, way: usize) -> &mut [u32] {
        let range = self.data_range(index, way);
        &mut self.data[range]
    }

    /// The way holding `address`, if any. Replacement state is untouched.
    pub fn lookup(&self, address: u32) -> Option<usize> {
        let decoded = self.geometry.decode(address);
        self.blocks[self.set_range(decoded.index)]
            .iter()
            .position(|b| b.valid && b.tag == decoded.tag)
    }

    pub fn is_in_cache(&self, address: u32) -> bool {
        self.lookup(address).is_some()
    }

    /// Load a whole block from memory into the given way.
    /// Only the data words and the fill address change.
    pub fn fill_block(
        &mut self,
        mem: &mut impl BackingStore,
        index: usize,
        way: usize,
        block_base: u32,
    ) {
        let range = self.data_range(index, way);
        for (i, word) in self.data[range].iter_mut().enumerate() {
            *word = mem.read_word(block_base + i as u32 * WORD_BYTES);
        }
        self.block_mut(index, way).fill_address = Some(block_base);
    }

    /// Write the block back to memory if it is dirty.
    /// Returns true iff a write-back happened.
    pub fn evict_block(
        &mut self,
        mem: &mut impl BackingStore,
        index: usize,
        way: usize,
    ) -> bool {
        let block = self.block_mut(index, way);
        if !block.dirty {
            return false;
        }
        block.dirty = false;
        let tag = block.tag;

        let address = self.geometry.block_address(tag, index);
        debug!("writing back set {index} way {way} to {address:#010x}");
        let range = self.data_range(index, way);
        for (i, word) in self.data[range].iter().enumerate() {
            mem.write_word(address + i as u32 * WORD_BYTES, *word);
        }
        self.history.num_writeback += 1;
        true
    }

    /// Find or bring in the line for `address`, leaving it resident
    fn resolve(
        &mut self,
        mem: &mut impl BackingStore,
        address: u32,
    ) -> (usize, usize, AccessKind) {
        let decoded = self.geometry.decode(address);
        let index = decoded.index;
        let range = self.set_range(index);

        let probe = self.policy.probe(index, &mut self.blocks[range.clone()], decoded.tag);
        let kind = match probe {
            Probe::Hit(_) => AccessKind::Hit,
            Probe::Fill(way) => {
                debug!("{address:#010x}: miss, filling invalid way {way} of set {index}");
                let block = self.block_mut(index, way);
                block.valid = true;
                block.tag = decoded.tag;
                self.fill_block(mem, index, way, decoded.block_base);
                AccessKind::FillMiss
            }
            Probe::Evict(way) => {
                debug!("{address:#010x}: miss, evicting way {way} of set {index}");
                self.evict_block(mem, index, way);
                self.fill_block(mem, index, way, decoded.block_base);
                self.block_mut(index, way).tag = decoded.tag;
                self.history.num_eviction += 1;
                AccessKind::EvictionMiss
            }
        };

        let way = probe.way();
        self.policy.touch(index, &mut self.blocks[range], way);
        if kind.is_miss() {
            self.history.num_miss += 1;
        } else {
            self.history.num_hit += 1;
        }

        let word = (decoded.offset / WORD_BYTES) as usize;
        (way, self.data_range(index, way).start + word, kind)
    }

    fn outcome(&self, data: u32, way: usize, kind: AccessKind) -> AccessOutcome {
        AccessOutcome {
            data,
            kind,
            way,
            cycles_charged: if kind.is_miss() { self.miss_penalty } else { 0 },
        }
    }

    /// Read the word containing `address`
    pub fn read(&mut self, mem: &mut impl BackingStore, address: u32) -> AccessOutcome {
        let (way, word, kind) = self.resolve(mem, address);
        self.outcome(self.data[word], way, kind)
    }

    /// Write `value` to the word containing `address`
    pub fn write(
        &mut self,
        mem: &mut impl BackingStore,
        address: u32,
        value: u32,
    ) -> AccessOutcome {
        let (way, word, kind) = self.resolve(mem, address);
        self.data[word] = value;
        let index = self.geometry.decode(address).index;
        self.block_mut(index, way).dirty = true;
        self.outcome(value, way, kind)
    }

    /// Write every dirty block back to memory, keeping it resident.
    /// Returns the number of blocks written.
    pub fn flush(&mut self, mem: &mut impl BackingStore) -> usize {
        let ways = self.geometry.ways() as usize;
        let mut written = 0;
        for index in 0..self.geometry.sets() as usize {
            for way in 0..ways {
                if self.block(index, way).valid && self.evict_block(mem, index, way) {
                    written += 1;
                }
            }
        }
        written
    }

    /// Return every block to its constructed state without writing back
    pub fn invalidate_all(&mut self) {
        let ways = self.geometry.ways() as usize;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            *block = Block::make(i % ways);
        }
        self.data.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mmu::MMU;

    fn small_cache() -> Cache {
        // offset_bits = 4, index_bits = 2
        Cache::init(16, 4, 4).unwrap()
    }

    /// Deterministic address sweep
    fn addresses(n: usize) -> impl Iterator<Item = u32> {
        let mut x: u32 = 0x1234_5678;
        (0..n).map(move |_| {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            x
        })
    }

    #[test]
    fn test_clog2() {
        for n in 1..1234567u32 {
            let expected = {
                let mut count = 0;
                let mut t = n;
                while t > 1 {
                    count += 1;
                    t >>= 1;
                }
                count
            };
            assert_eq!(Some(expected), clog2(n));
        }
        assert_eq!(clog2(0), None);
    }

    #[test]
    fn test_geometry_rejects_bad_parameters() {
        assert_eq!(
            CacheGeometry::new(0, 4, 64),
            Err(ConfigError::ZeroParameter { name: "block_size" })
        );
        assert_eq!(
            CacheGeometry::new(32, 0, 64),
            Err(ConfigError::ZeroParameter { name: "ways" })
        );
        assert_eq!(
            CacheGeometry::new(32, 4, 0),
            Err(ConfigError::ZeroParameter { name: "sets" })
        );
        assert_eq!(
            CacheGeometry::new(24, 4, 64),
            Err(ConfigError::NotPowerOfTwo { name: "block_size", value: 24 })
        );
        assert_eq!(
            CacheGeometry::new(32, 4, 63),
            Err(ConfigError::NotPowerOfTwo { name: "sets", value: 63 })
        );
        assert_eq!(CacheGeometry::new(2, 1, 1), Err(ConfigError::BlockTooSmall(2)));
        assert_eq!(
            CacheGeometry::new(1 << 20, 1, 1 << 13),
            Err(ConfigError::GeometryTooLarge(33))
        );
        // Associativity need not be a power of two
        assert!(CacheGeometry::new(32, 3, 64).is_ok());
    }

    #[test]
    fn test_lab_presets_are_valid() {
        assert_eq!(CacheGeometry::new(32, 4, 64), Ok(CacheGeometry::instruction()));
        assert_eq!(CacheGeometry::new(32, 8, 256), Ok(CacheGeometry::data()));
        assert_eq!(CacheGeometry::data().capacity(), 64 * 1024);
    }

    #[test]
    fn test_decode() {
        let geometry = CacheGeometry::new(16, 4, 4).unwrap();
        let decoded = geometry.decode(0x1234_5678);
        assert_eq!(decoded.offset, 0x8);
        assert_eq!(decoded.index, 0x3);
        assert_eq!(decoded.tag, 0x1234_5678 >> 6);
        assert_eq!(decoded.block_base, 0x1234_5670);

        for (address, tag) in [(0x00, 0), (0x10, 1), (0x20, 2), (0x30, 3), (0x40, 4)] {
            let decoded = geometry.decode(address);
            assert_eq!(decoded.index, 0);
            assert_eq!(decoded.tag, tag);
        }
    }

    #[test]
    fn test_decode_round_trip() {
        for geometry in [
            CacheGeometry::instruction(),
            CacheGeometry::data(),
            CacheGeometry::new(4, 1, 1).unwrap(),
            CacheGeometry::new(1 << 16, 2, 1 << 16).unwrap(),
        ] {
            for address in addresses(10_000).chain([0, u32::MAX]) {
                let decoded = geometry.decode(address);
                assert_eq!(geometry.compose(&decoded), address);
                assert_eq!(
                    decoded.block_base,
                    geometry.block_address(decoded.tag, decoded.index)
                );
            }
        }
    }

    #[test]
    fn test_init_state() {
        let cache = small_cache();
        for index in 0..4 {
            for way in 0..4 {
                let block = cache.block(index, way);
                assert!(!block.valid);
                assert!(!block.dirty);
                assert_eq!(block.tag, 0);
                assert_eq!(block.replacement_counter, way as u8);
                assert!(cache.block_data(index, way).iter().all(|&w| w == 0));
            }
        }
    }

    #[test]
    fn test_five_reads_into_one_set() {
        let mut mem = MMU::make();
        let mut cache = small_cache();

        for (way, address) in [0x00, 0x10, 0x20, 0x30].into_iter().enumerate() {
            let outcome = cache.read(&mut mem, address);
            assert_eq!(outcome.kind, AccessKind::FillMiss);
            assert_eq!(outcome.way, way);
            assert_eq!(outcome.cycles_charged, MISS_PENALTY);
        }
        let counters: Vec<u8> =
            (0..4).map(|w| cache.block(0, w).replacement_counter).collect();
        assert_eq!(counters, vec![3, 2, 1, 0]);

        let outcome = cache.read(&mut mem, 0x40);
        assert_eq!(outcome.kind, AccessKind::EvictionMiss);
        assert_eq!(outcome.way, 0);
        assert_eq!(cache.block(0, 0).tag, 4);

        let outcome = cache.read(&mut mem, 0x00);
        assert!(outcome.kind.is_miss());
        assert_eq!(outcome.way, 1);

        assert_eq!(cache.history.num_miss, 6);
        assert_eq!(cache.history.num_eviction, 2);
        assert_eq!(cache.history.num_hit, 0);
    }

    #[test]
    fn test_hit_serves_data_without_memory() {
        let mut mem = MMU::make();
        mem.set32(0x104, 0xcafe_f00d).unwrap();
        let mut cache = small_cache();

        assert_eq!(cache.read(&mut mem, 0x104).kind, AccessKind::FillMiss);
        let words_read = mem.words_read;
        let outcome = cache.read(&mut mem, 0x104);
        assert_eq!(outcome.kind, AccessKind::Hit);
        assert_eq!(outcome.data, 0xcafe_f00d);
        assert_eq!(outcome.cycles_charged, 0);
        assert_eq!(mem.words_read, words_read);

        // Same block, other word
        assert_eq!(cache.read(&mut mem, 0x108).kind, AccessKind::Hit);
        assert_eq!(cache.block(0, 0).fill_address, Some(0x100));
    }

    #[test]
    fn test_read_after_write() {
        let mut mem = MMU::make();
        let mut cache = small_cache();

        for (i, address) in addresses(2_000).enumerate() {
            let address = address & !3;
            let value = i as u32 ^ 0x5a5a_5a5a;
            cache.write(&mut mem, address, value);
            assert_eq!(cache.read(&mut mem, address).data, value);
            assert_eq!(cache.read(&mut mem, address).kind, AccessKind::Hit);
        }
    }

    #[test]
    fn test_capacity_eviction_picks_oldest() {
        let mut mem = MMU::make();
        let mut cache = Cache::make(CacheGeometry::data());
        let set_stride = 32 * 256;
        let base = 0x40 * 32;
        let index = CacheGeometry::data().decode(base).index;

        for i in 0..8 {
            let outcome = cache.read(&mut mem, base + i * set_stride);
            assert_eq!(outcome.kind, AccessKind::FillMiss);
        }
        // Re-touch way 0 so way 1 becomes the oldest
        assert_eq!(cache.read(&mut mem, base).kind, AccessKind::Hit);

        let oldest = (0..8)
            .max_by_key(|&w| (cache.block(index, w).replacement_counter, std::cmp::Reverse(w)))
            .unwrap();
        assert_eq!(oldest, 1);

        let outcome = cache.read(&mut mem, base + 8 * set_stride);
        assert_eq!(outcome.kind, AccessKind::EvictionMiss);
        assert_eq!(outcome.way, oldest);
        assert_eq!(cache.history.num_eviction, 1);
        assert_eq!(cache.history.num_miss, 9);
        assert!(!cache.is_in_cache(base + set_stride));
        assert!(cache.is_in_cache(base));
    }

    #[test]
    fn test_dirty_block_written_back_on_eviction() {
        let mut mem = MMU::make();
        let mut cache = small_cache();

        let outcome = cache.write(&mut mem, 0x24, 0xdead_beef);
        assert_eq!(outcome.kind, AccessKind::FillMiss);
        assert!(cache.block(2, 0).dirty);
        // Write-back cache: memory is stale until eviction
        assert_eq!(mem.get32(0x24), Ok(0));

        for i in 1..=4 {
            cache.read(&mut mem, 0x24 + i * 0x40);
        }

        assert!(!cache.is_in_cache(0x24));
        assert_eq!(mem.get32(0x24), Ok(0xdead_beef));
        assert_eq!(mem.words_written, 4);
        assert_eq!(cache.history.num_writeback, 1);
        assert_eq!(cache.read(&mut mem, 0x24).data, 0xdead_beef);
    }

    #[test]
    fn test_reads_never_write_back() {
        let mut mem = MMU::make();
        let mut cache = small_cache();

        for address in addresses(5_000) {
            cache.read(&mut mem, address);
        }
        assert!(cache.history.num_eviction > 0);
        assert_eq!(cache.history.num_writeback, 0);
        assert_eq!(mem.words_written, 0);
    }

    #[test]
    fn test_write_hit_marks_dirty() {
        let mut mem = MMU::make();
        let mut cache = small_cache();

        cache.read(&mut mem, 0x80);
        assert!(!cache.block(0, 0).dirty);
        let outcome = cache.write(&mut mem, 0x8c, 7);
        assert_eq!(outcome.kind, AccessKind::Hit);
        assert_eq!(outcome.data, 7);
        assert!(cache.block(0, 0).dirty);
        assert_eq!(cache.block_data(0, 0), &[0, 0, 0, 7]);
    }

    #[test]
    fn test_evict_clean_block_is_noop() {
        let mut mem = MMU::make();
        let mut cache = small_cache();

        cache.read(&mut mem, 0x0);
        assert!(!cache.evict_block(&mut mem, 0, 0));
        assert_eq!(mem.words_written, 0);
    }

    #[test]
    fn test_flush_and_invalidate() {
        let mut mem = MMU::make();
        let mut cache = small_cache();

        cache.write(&mut mem, 0x10, 1);
        cache.write(&mut mem, 0x20, 2);
        cache.read(&mut mem, 0x30);

        assert_eq!(cache.flush(&mut mem), 2);
        assert_eq!(mem.get32(0x10), Ok(1));
        assert_eq!(mem.get32(0x20), Ok(2));
        assert_eq!(cache.flush(&mut mem), 0);
        assert!(cache.is_in_cache(0x10));

        cache.write(&mut mem, 0x10, 99);
        cache.invalidate_all();
        assert!(!cache.is_in_cache(0x10));
        assert_eq!(cache.block(1, 3).replacement_counter, 3);
        // The unflushed write is gone
        assert_eq!(cache.read(&mut mem, 0x10).data, 1);
    }

    #[test]
    fn test_timestamp_lru_cache() {
        use crate::memory::replacement::TimestampLru;

        let mut mem = MMU::make();
        let mut cache: Cache<TimestampLru> =
            Cache::make_with_policy(CacheGeometry::new(16, 2, 1).unwrap());

        cache.read(&mut mem, 0x00);
        cache.read(&mut mem, 0x10);
        cache.read(&mut mem, 0x00);
        let outcome = cache.read(&mut mem, 0x20);
        assert_eq!(outcome.kind, AccessKind::EvictionMiss);
        assert_eq!(outcome.way, 1);
        assert!(cache.is_in_cache(0x00));
    }
}
