//! Set-associative cache model: tag-indexed storage, hit/miss classification,
//! replacement, allocation, invalidation, and address reconstruction.

use static_assertions::const_assert;
use thiserror::Error;

/// Recurrence multiplier for the pseudo-random replacement policy:
/// `sₙ₊₁ = sₙ · 48271 (mod 2³²)`.
const RANDOM_MULTIPLIER: u32 = 48271;

/// Every this-many replacement selections, the pseudo-random policy advances
/// its state one extra step before picking a victim.
const RANDOM_EVICTION_BIAS_PERIOD: u32 = 13;

const_assert!(RANDOM_EVICTION_BIAS_PERIOD > 0);

/// Result of a cache access.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessResult {
    Hit,
    Miss,
}

impl AccessResult {
    pub fn is_hit(self) -> bool {
        matches!(self, AccessResult::Hit)
    }
}

/// Victim-selection policy used when a set is full on allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReplacePolicy {
    RoundRobin,
    Random,
}

/// Whether a store miss allocates a line.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AllocatePolicy {
    WriteAllocate,
    NoWriteAllocate,
}

/// Why [`CacheDescriptor::new`] refused to build a descriptor.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConfigError {
    #[error("cache {field} must be a positive power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: u32 },
    #[error(
        "cache size {size} does not equal ways ({ways}) * block size ({block_size}) * a power-of-two number of sets"
    )]
    SizeNotDivisible {
        size: u32,
        ways: u32,
        block_size: u32,
    },
}

/// Why [`CacheDescriptor::validate_injection`] rejected a coordinate.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum InjectionError {
    #[error("descriptor is not initialised")]
    NotInitialised,
    #[error("set/way/word coordinate is out of range for this cache's geometry")]
    OutOfRange,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Entry {
    tag: u32,
    /// Dirty-or-invalid marker: `true` means "do not match", `false` means
    /// "holds a valid tag". There is no second meaning, unlike the polysemous
    /// byte this is modelled on.
    invalid: bool,
}

impl Entry {
    const fn new() -> Self {
        Entry {
            tag: 0,
            invalid: true,
        }
    }
}

#[derive(Debug, Clone)]
enum ReplaceState {
    RoundRobin { next_way: Vec<u32> },
    Random { state: u32, advances: u32 },
}

/// Hit/miss/eviction counters for one cache instance.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Stats {
    pub load_hits: u64,
    pub load_misses: u64,
    pub store_hits: u64,
    pub store_misses: u64,
    pub compulsory_misses: u64,
    pub evictions: u64,
}

/// A single set-associative cache: I-cache, D-cache, and L2 are each one
/// instance of this model, configured independently.
#[derive(Debug, Clone)]
pub struct CacheDescriptor {
    sets: Vec<Vec<Entry>>,
    ways: u32,
    block_offset_bits: u32,
    set_mask: u32,
    tag_shift: u32,
    replace_state: ReplaceState,
    alloc_policy: AllocatePolicy,
    stats: Stats,
    /// Cleared by [`CacheDescriptor::shutdown`]; every public operation
    /// becomes a no-op (returning miss/zero/not-valid) once cleared.
    valid: bool,
}

fn log2_exact(value: u32) -> Option<u32> {
    if value == 0 || !value.is_power_of_two() {
        None
    } else {
        Some(value.trailing_zeros())
    }
}

impl CacheDescriptor {
    /// Allocates a descriptor in which every entry is invalid.
    ///
    /// `size`, `ways`, and `block_size` must all be positive powers of two,
    /// and `size` must equal `ways * block_size` times a power-of-two number
    /// of sets. Violating this is a fatal configuration error, not a
    /// recoverable runtime condition.
    pub fn new(
        size: u32,
        ways: u32,
        block_size: u32,
        replace_policy: ReplacePolicy,
        alloc_policy: AllocatePolicy,
    ) -> Result<Self, ConfigError> {
        let block_offset_bits = log2_exact(block_size).ok_or(ConfigError::NotPowerOfTwo {
            field: "block_size",
            value: block_size,
        })?;
        let ways_bits = log2_exact(ways).ok_or(ConfigError::NotPowerOfTwo {
            field: "ways",
            value: ways,
        })?;
        let _ = ways_bits;
        let row_bytes = ways
            .checked_mul(block_size)
            .ok_or(ConfigError::SizeNotDivisible {
                size,
                ways,
                block_size,
            })?;
        if row_bytes == 0 || !size.is_multiple_of(row_bytes) {
            return Err(ConfigError::SizeNotDivisible {
                size,
                ways,
                block_size,
            });
        }
        let num_sets = size / row_bytes;
        let set_index_bits = log2_exact(num_sets).ok_or(ConfigError::NotPowerOfTwo {
            field: "size / (ways * block_size)",
            value: num_sets,
        })?;

        let sets = vec![vec![Entry::new(); ways as usize]; num_sets as usize];
        let replace_state = match replace_policy {
            ReplacePolicy::RoundRobin => ReplaceState::RoundRobin {
                next_way: vec![0; num_sets as usize],
            },
            ReplacePolicy::Random => ReplaceState::Random {
                state: 1,
                advances: 0,
            },
        };

        Ok(CacheDescriptor {
            sets,
            ways,
            block_offset_bits,
            set_mask: (1u32 << set_index_bits) - 1,
            tag_shift: block_offset_bits + set_index_bits,
            replace_state,
            alloc_policy,
            stats: Stats::default(),
            valid: true,
        })
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn num_sets(&self) -> u32 {
        self.sets.len() as u32
    }

    pub fn ways(&self) -> u32 {
        self.ways
    }

    pub fn block_size(&self) -> u32 {
        1 << self.block_offset_bits
    }

    /// Marks this descriptor invalid; every subsequent operation becomes a
    /// no-op. Mirrors the reference implementation's end-of-run teardown.
    pub fn shutdown(&mut self) {
        self.valid = false;
    }

    fn split(&self, guest_address: u32) -> (u32, u32) {
        let set_index = (guest_address >> self.block_offset_bits) & self.set_mask;
        let tag = guest_address >> self.tag_shift;
        (set_index, tag)
    }

    fn find_resident(&self, set_index: u32, tag: u32) -> Option<usize> {
        self.sets[set_index as usize]
            .iter()
            .position(|entry| !entry.invalid && entry.tag == tag)
    }

    fn next_victim_way(&mut self, set_index: u32) -> u32 {
        match &mut self.replace_state {
            ReplaceState::Random { state, advances } => {
                *state = state.wrapping_mul(RANDOM_MULTIPLIER);
                *advances += 1;
                if advances.is_multiple_of(RANDOM_EVICTION_BIAS_PERIOD) {
                    *state = state.wrapping_mul(RANDOM_MULTIPLIER);
                }
                *state % self.ways
            }
            ReplaceState::RoundRobin { next_way } => {
                let way = next_way[set_index as usize];
                next_way[set_index as usize] = (way + 1) % self.ways;
                way
            }
        }
    }

    /// Picks an allocation target: the first invalid way, or a victim chosen
    /// by the replacement policy. Returns the way and whether it was an
    /// eviction (the victim held a valid entry) as opposed to a compulsory
    /// fill (the victim was already invalid).
    fn allocate(&mut self, set_index: u32, tag: u32) -> bool {
        let way = self.sets[set_index as usize]
            .iter()
            .position(|entry| entry.invalid)
            .map(|way| way as u32)
            .unwrap_or_else(|| self.next_victim_way(set_index));
        let entry = &mut self.sets[set_index as usize][way as usize];
        let was_valid = !entry.invalid;
        entry.invalid = false;
        entry.tag = tag;
        was_valid
    }

    /// Looks up `guest_address`; on miss, allocates a line for it.
    pub fn load(&mut self, guest_address: u32) -> AccessResult {
        if !self.valid {
            return AccessResult::Miss;
        }
        let (set_index, tag) = self.split(guest_address);
        if self.find_resident(set_index, tag).is_some() {
            self.stats.load_hits += 1;
            return AccessResult::Hit;
        }
        self.stats.load_misses += 1;
        if self.allocate(set_index, tag) {
            self.stats.evictions += 1;
        } else {
            self.stats.compulsory_misses += 1;
        }
        AccessResult::Miss
    }

    /// Looks up `guest_address` for a store; allocates on miss only under
    /// write-allocate.
    pub fn store(&mut self, guest_address: u32) -> AccessResult {
        if !self.valid {
            return AccessResult::Miss;
        }
        let (set_index, tag) = self.split(guest_address);
        if self.find_resident(set_index, tag).is_some() {
            self.stats.store_hits += 1;
            return AccessResult::Hit;
        }
        self.stats.store_misses += 1;
        if self.alloc_policy == AllocatePolicy::WriteAllocate {
            if self.allocate(set_index, tag) {
                self.stats.evictions += 1;
            } else {
                self.stats.compulsory_misses += 1;
            }
        }
        AccessResult::Miss
    }

    /// Marks the entry at `(set, way)` invalid unconditionally. A no-op if
    /// the coordinate is out of range or the descriptor is uninitialised.
    pub fn invalidate(&mut self, set: u32, way: u32) {
        if !self.valid {
            return;
        }
        if let Some(row) = self.sets.get_mut(set as usize) {
            if let Some(entry) = row.get_mut(way as usize) {
                entry.invalid = true;
            }
        }
    }

    /// Marks the line (if any) holding `guest_address` invalid. A no-op on
    /// a miss or an uninitialised descriptor.
    pub fn invalidate_address(&mut self, guest_address: u32) {
        if !self.valid {
            return;
        }
        let (set_index, tag) = self.split(guest_address);
        if let Some(way) = self.find_resident(set_index, tag) {
            self.sets[set_index as usize][way].invalid = true;
        }
    }

    /// Marks every line in every set invalid.
    pub fn invalidate_all(&mut self) {
        if !self.valid {
            return;
        }
        for row in &mut self.sets {
            for entry in row {
                entry.invalid = true;
            }
        }
    }

    /// Returns whether the entry at `(set, way)` is valid. Out-of-range
    /// coordinates and an uninitialised descriptor both report "not valid".
    pub fn is_valid(&self, set: u32, way: u32) -> bool {
        if !self.valid {
            return false;
        }
        self.sets
            .get(set as usize)
            .and_then(|row| row.get(way as usize))
            .map(|entry| !entry.invalid)
            .unwrap_or(false)
    }

    /// Reconstructs the guest address of the block held at `(set, way)`:
    /// `(tag << tag_shift) | (set << set_shift)`. Low block-offset bits are
    /// zero. Returns 0 for an uninitialised descriptor or an out-of-range
    /// coordinate.
    pub fn reconstruct_address(&self, set: u32, way: u32) -> u32 {
        if !self.valid {
            return 0;
        }
        let Some(entry) = self.sets.get(set as usize).and_then(|row| row.get(way as usize))
        else {
            return 0;
        };
        (entry.tag << self.tag_shift) | (set << self.block_offset_bits)
    }

    /// Validates an injection coordinate against this cache's geometry.
    pub fn validate_injection(&self, set: u32, way: u32, word_in_block: u32) -> Result<(), InjectionError> {
        if !self.valid {
            return Err(InjectionError::NotInitialised);
        }
        let words_per_block = self.block_size() / 4;
        if set >= self.num_sets() || way >= self.ways || word_in_block >= words_per_block {
            return Err(InjectionError::OutOfRange);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_mapped() -> CacheDescriptor {
        CacheDescriptor::new(
            16,
            1,
            4,
            ReplacePolicy::RoundRobin,
            AllocatePolicy::WriteAllocate,
        )
        .unwrap()
    }

    #[test]
    fn init_is_all_invalid_and_misses() {
        let mut cache = direct_mapped();
        for set in 0..cache.num_sets() {
            assert!(!cache.is_valid(set, 0));
        }
        assert_eq!(cache.load(0x1234), AccessResult::Miss);
    }

    #[test]
    fn scenario_direct_mapped_trivial() {
        let mut cache = direct_mapped();
        for addr in [0x00, 0x04, 0x08, 0x0C, 0x00] {
            cache.load(addr);
        }
        let stats = cache.stats();
        assert_eq!(stats.load_hits, 1);
        assert_eq!(stats.load_misses, 4);
        assert_eq!(stats.compulsory_misses, 4);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn scenario_two_way_thrash_round_robin() {
        let mut cache = CacheDescriptor::new(
            16,
            2,
            4,
            ReplacePolicy::RoundRobin,
            AllocatePolicy::WriteAllocate,
        )
        .unwrap();
        for addr in [0x00, 0x10, 0x20, 0x00] {
            cache.load(addr);
        }
        let stats = cache.stats();
        assert_eq!(stats.load_misses, 4);
        assert_eq!(stats.compulsory_misses, 2);
        assert_eq!(stats.evictions, 2);
    }

    #[test]
    fn write_no_allocate_then_load_still_misses() {
        let mut cache = CacheDescriptor::new(
            16,
            1,
            4,
            ReplacePolicy::RoundRobin,
            AllocatePolicy::NoWriteAllocate,
        )
        .unwrap();
        assert_eq!(cache.store(0x00), AccessResult::Miss);
        assert_eq!(cache.load(0x00), AccessResult::Miss);
    }

    #[test]
    fn write_allocate_then_load_hits() {
        let mut cache = direct_mapped();
        assert_eq!(cache.store(0x00), AccessResult::Miss);
        assert_eq!(cache.load(0x00), AccessResult::Hit);
    }

    #[test]
    fn reconstruct_address_masks_block_offset() {
        let mut cache = direct_mapped();
        cache.load(0x1234_5678);
        let rebuilt = cache.reconstruct_address(
            (0x1234_5678u32 >> 2) & (cache.num_sets() - 1),
            0,
        );
        assert_eq!(rebuilt, 0x1234_5678 & !(cache.block_size() - 1));
    }

    #[test]
    fn compulsory_plus_evictions_equals_misses() {
        let mut cache = CacheDescriptor::new(
            16,
            2,
            4,
            ReplacePolicy::RoundRobin,
            AllocatePolicy::WriteAllocate,
        )
        .unwrap();
        for addr in [0x00, 0x10, 0x20, 0x30, 0x00, 0x40] {
            cache.load(addr);
        }
        for addr in [0x00, 0x50] {
            cache.store(addr);
        }
        let stats = cache.stats();
        assert_eq!(
            stats.compulsory_misses + stats.evictions,
            stats.load_misses + stats.store_misses
        );
    }

    #[test]
    fn pseudo_random_sequence_matches_recurrence() {
        let mut cache = CacheDescriptor::new(
            64,
            4,
            4,
            ReplacePolicy::Random,
            AllocatePolicy::WriteAllocate,
        )
        .unwrap();
        // Fill every way in set 0 with compulsory misses first, forcing every
        // subsequent load of a new tag to exercise the replacement policy.
        for way in 0..4u32 {
            cache.load(way * 16 * 4);
        }
        let mut expected_state = 1u32;
        let mut advances = 0u32;
        let mut expect_next_way = |ways: u32| {
            expected_state = expected_state.wrapping_mul(RANDOM_MULTIPLIER);
            advances += 1;
            if advances.is_multiple_of(RANDOM_EVICTION_BIAS_PERIOD) {
                expected_state = expected_state.wrapping_mul(RANDOM_MULTIPLIER);
            }
            expected_state % ways
        };
        for n in 0..20u32 {
            let addr = (4 + n) * 16 * 4;
            cache.load(addr);
            let way = expect_next_way(4);
            assert!(cache.is_valid(0, way));
        }
    }

    #[test]
    fn invalidate_out_of_range_is_noop() {
        let mut cache = direct_mapped();
        cache.invalidate(999, 999);
        assert!(!cache.is_valid(999, 999));
    }

    #[test]
    fn rejects_non_power_of_two_geometry() {
        assert!(matches!(
            CacheDescriptor::new(48, 1, 4, ReplacePolicy::RoundRobin, AllocatePolicy::WriteAllocate),
            Err(ConfigError::NotPowerOfTwo { .. })
        ));
        assert!(matches!(
            CacheDescriptor::new(16, 3, 4, ReplacePolicy::RoundRobin, AllocatePolicy::WriteAllocate),
            Err(ConfigError::NotPowerOfTwo { .. })
        ));
    }

    #[test]
    fn shutdown_makes_every_operation_a_noop() {
        let mut cache = direct_mapped();
        cache.load(0x00);
        cache.shutdown();
        assert_eq!(cache.load(0x00), AccessResult::Miss);
        assert!(!cache.is_valid(0, 0));
        assert_eq!(cache.reconstruct_address(0, 0), 0);
        assert_eq!(
            cache.validate_injection(0, 0, 0),
            Err(InjectionError::NotInitialised)
        );
    }

    #[test]
    fn invalidate_address_clears_only_the_resident_line() {
        let mut cache = direct_mapped();
        cache.load(0x00);
        cache.load(0x04);
        cache.invalidate_address(0x00);
        assert!(!cache.is_valid(0, 0));
        // 0x04 maps to a different set in this 4-row direct-mapped cache.
        assert!(cache.is_valid((0x04 >> 2) & (cache.num_sets() - 1), 0));
    }

    #[test]
    fn invalidate_all_clears_every_set() {
        let mut cache = CacheDescriptor::new(
            16,
            2,
            4,
            ReplacePolicy::RoundRobin,
            AllocatePolicy::WriteAllocate,
        )
        .unwrap();
        for addr in [0x00, 0x10, 0x20, 0x30] {
            cache.load(addr);
        }
        cache.invalidate_all();
        for set in 0..cache.num_sets() {
            for way in 0..cache.ways() {
                assert!(!cache.is_valid(set, way));
            }
        }
    }

    #[test]
    fn validate_injection_rejects_out_of_range() {
        let cache = direct_mapped();
        assert_eq!(cache.validate_injection(0, 0, 0), Ok(()));
        assert_eq!(
            cache.validate_injection(99, 0, 0),
            Err(InjectionError::OutOfRange)
        );
        assert_eq!(
            cache.validate_injection(0, 99, 0),
            Err(InjectionError::OutOfRange)
        );
        assert_eq!(
            cache.validate_injection(0, 0, 99),
            Err(InjectionError::OutOfRange)
        );
    }
}
