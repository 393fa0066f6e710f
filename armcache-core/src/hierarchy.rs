//! Three-level I/D/L2 cache hierarchy: miss chaining I→L2 and D→L2, no
//! back-invalidation, no coherence.

use crate::cache::{AccessResult, AllocatePolicy, CacheDescriptor, ConfigError, ReplacePolicy};
use crate::decoder::{self, Instruction};
use crate::register_access::RegisterAccess;

/// Selects one of the three cache instances, e.g. for the injection
/// controller's target selection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheName {
    ICache,
    DCache,
    L2Cache,
}

/// Parameters for one level of the hierarchy.
#[derive(Debug, Copy, Clone)]
pub struct CacheParams {
    pub size: u32,
    pub ways: u32,
    pub block_size: u32,
    pub replace_policy: ReplacePolicy,
}

/// The I-cache/D-cache/L2 trio. The I-cache and D-cache are independent L1
/// peers; both forward misses to the shared L2, which does not cascade
/// further and is never invalidated by the L1s.
pub struct Hierarchy {
    icache: CacheDescriptor,
    dcache: CacheDescriptor,
    l2cache: CacheDescriptor,
}

impl Hierarchy {
    pub fn new(
        icache: CacheParams,
        dcache: CacheParams,
        l2cache: CacheParams,
    ) -> Result<Self, ConfigError> {
        Ok(Hierarchy {
            icache: CacheDescriptor::new(
                icache.size,
                icache.ways,
                icache.block_size,
                icache.replace_policy,
                // The instruction cache never stores; it is always
                // no-write-allocate.
                AllocatePolicy::NoWriteAllocate,
            )?,
            dcache: CacheDescriptor::new(
                dcache.size,
                dcache.ways,
                dcache.block_size,
                dcache.replace_policy,
                AllocatePolicy::WriteAllocate,
            )?,
            l2cache: CacheDescriptor::new(
                l2cache.size,
                l2cache.ways,
                l2cache.block_size,
                l2cache.replace_policy,
                AllocatePolicy::WriteAllocate,
            )?,
        })
    }

    pub fn cache(&self, name: CacheName) -> &CacheDescriptor {
        match name {
            CacheName::ICache => &self.icache,
            CacheName::DCache => &self.dcache,
            CacheName::L2Cache => &self.l2cache,
        }
    }

    pub fn cache_mut(&mut self, name: CacheName) -> &mut CacheDescriptor {
        match name {
            CacheName::ICache => &mut self.icache,
            CacheName::DCache => &mut self.dcache,
            CacheName::L2Cache => &mut self.l2cache,
        }
    }

    /// An instruction fetch. On an I-cache miss, the access is also applied
    /// to L2 (whose own hit/miss counters are the only observable effect).
    pub fn icache_load(&mut self, guest_address: u32) -> AccessResult {
        let result = self.icache.load(guest_address);
        if result == AccessResult::Miss {
            self.l2cache.load(guest_address);
        }
        result
    }

    /// A data load. On a D-cache miss, cascades to L2.
    pub fn dcache_load(&mut self, guest_address: u32) -> AccessResult {
        let result = self.dcache.load(guest_address);
        if result == AccessResult::Miss {
            self.l2cache.load(guest_address);
        }
        result
    }

    /// A data store. On a D-cache miss, cascades to L2.
    pub fn dcache_store(&mut self, guest_address: u32) -> AccessResult {
        let result = self.dcache.store(guest_address);
        if result == AccessResult::Miss {
            self.l2cache.store(guest_address);
        }
        result
    }

    pub fn shutdown(&mut self) {
        self.icache.shutdown();
        self.dcache.shutdown();
        self.l2cache.shutdown();
    }

    /// Recognises and applies the two cache-maintenance MCR encodings this
    /// model supports. Any other instruction (including every other MCR) is
    /// ignored. Needs register-read access because the D-cache-line variant
    /// carries its target coordinate in a GPR, not the opcode word: bits
    /// 13:4 (truncated to however many bits this cache's set count needs)
    /// name the set, and the top `log2(ways)` bits name the way.
    pub fn handle_cache_maintenance(&mut self, insn: &Instruction, regs: &dyn RegisterAccess) {
        if decoder::is_dcache_line_invalidate(insn) {
            let mva = regs.read_gpr(insn.operands.rt);
            let set_mask = self.dcache.num_sets() - 1;
            let set = (mva >> 4) & set_mask;
            let way_bits = self.dcache.ways().trailing_zeros();
            let way = if way_bits == 0 { 0 } else { mva >> (32 - way_bits) };
            self.dcache.invalidate(set, way);
        } else if decoder::is_icache_invalidate_all(insn) {
            self.icache.invalidate_all();
        }
    }
}
