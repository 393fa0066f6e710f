//! Scenario runner: drives `armcache-core` directly through the concrete
//! scenarios used to validate the cache model, decoder, and injection
//! coordinate arithmetic, and prints a one-line report per scenario.
//!
//! This crate has no guest binary to load and no emulator to attach to; it
//! exercises the library's public API the way the plugin would, with
//! hand-picked address sequences and register values standing in for a
//! live guest.

use armcache_core::cache::{AllocatePolicy, CacheDescriptor, ReplacePolicy};
use armcache_core::decoder::decode;
use armcache_core::hierarchy::{CacheName, CacheParams, Hierarchy};
use armcache_core::register_access::RegisterAccess;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Run only the named scenario (1-6). Runs all of them if omitted.
    #[arg(long, short)]
    scenario: Option<u32>,
}

struct FixedRegisters([u32; 16]);

impl RegisterAccess for FixedRegisters {
    fn read_gpr(&self, index: u8) -> u32 {
        self.0[index as usize]
    }
}

fn direct_mapped_trivial() -> String {
    let mut cache =
        CacheDescriptor::new(16, 1, 4, ReplacePolicy::RoundRobin, AllocatePolicy::WriteAllocate)
            .unwrap();
    for addr in [0x00, 0x04, 0x08, 0x0C, 0x00] {
        cache.load(addr);
    }
    let stats = cache.stats();
    format!(
        "direct-mapped trivial: load_hits={} load_misses={} compulsory={} evictions={}",
        stats.load_hits, stats.load_misses, stats.compulsory_misses, stats.evictions
    )
}

fn two_way_thrash() -> String {
    let mut cache =
        CacheDescriptor::new(16, 2, 4, ReplacePolicy::RoundRobin, AllocatePolicy::WriteAllocate)
            .unwrap();
    for addr in [0x00, 0x10, 0x20, 0x00] {
        cache.load(addr);
    }
    let stats = cache.stats();
    format!(
        "two-way thrash: load_misses={} compulsory={} evictions={}",
        stats.load_misses, stats.compulsory_misses, stats.evictions
    )
}

fn l1_l2_cascade() -> String {
    let mut h = Hierarchy::new(
        CacheParams {
            size: 16,
            ways: 1,
            block_size: 4,
            replace_policy: ReplacePolicy::RoundRobin,
        },
        CacheParams {
            size: 16,
            ways: 1,
            block_size: 4,
            replace_policy: ReplacePolicy::RoundRobin,
        },
        CacheParams {
            size: 64,
            ways: 4,
            block_size: 4,
            replace_policy: ReplacePolicy::RoundRobin,
        },
    )
    .unwrap();
    h.icache_load(0x1000);
    h.icache_load(0x1000);
    format!(
        "l1->l2 cascade: l2_load_misses={} (expect 1 despite two fetches)",
        h.cache(CacheName::L2Cache).stats().load_misses
    )
}

fn write_no_allocate() -> String {
    let mut no_alloc =
        CacheDescriptor::new(16, 1, 4, ReplacePolicy::RoundRobin, AllocatePolicy::NoWriteAllocate)
            .unwrap();
    no_alloc.store(0x00);
    let still_misses = no_alloc.load(0x00) == armcache_core::cache::AccessResult::Miss;

    let mut alloc =
        CacheDescriptor::new(16, 1, 4, ReplacePolicy::RoundRobin, AllocatePolicy::WriteAllocate)
            .unwrap();
    alloc.store(0x00);
    let now_hits = alloc.load(0x00) == armcache_core::cache::AccessResult::Hit;

    format!(
        "write-no-allocate: no-allocate still misses={still_misses} write-allocate now hits={now_hits}"
    )
}

fn cache_invalidate_mcr() -> String {
    let mut h = Hierarchy::new(
        CacheParams {
            size: 16,
            ways: 1,
            block_size: 4,
            replace_policy: ReplacePolicy::RoundRobin,
        },
        CacheParams {
            size: 64,
            ways: 4,
            block_size: 4,
            replace_policy: ReplacePolicy::RoundRobin,
        },
        CacheParams {
            size: 64,
            ways: 4,
            block_size: 4,
            replace_policy: ReplacePolicy::RoundRobin,
        },
    )
    .unwrap();
    h.cache_mut(CacheName::DCache).load(0x30);

    // MCR p15, 0, r0, c7, c6, 2; r0 encodes set=3 (bits 5:4), way=1 (bits 31:30).
    let insn = decode(0xEE07_0F56);
    let mut regs = [0u32; 16];
    regs[0] = (1u32 << 30) | (3 << 4);
    h.handle_cache_maintenance(&insn, &FixedRegisters(regs));

    format!(
        "cache-invalidate MCR: (set=3,way=1) valid={}",
        h.cache(CacheName::DCache).is_valid(3, 1)
    )
}

fn injection() -> String {
    let cycle_threshold = 1000u32;
    let cache =
        CacheDescriptor::new(2048, 4, 32, ReplacePolicy::RoundRobin, AllocatePolicy::WriteAllocate)
            .unwrap();
    cache.validate_injection(2, 0, 1).unwrap();
    let base = cache.reconstruct_address(2, 0);
    let target = base + 4;
    format!("injection: first message >= {cycle_threshold}, second message = {target:#010x}")
}

fn main() {
    let args = Args::parse();
    let scenarios: [(u32, fn() -> String); 6] = [
        (1, direct_mapped_trivial),
        (2, two_way_thrash),
        (3, l1_l2_cascade),
        (4, write_no_allocate),
        (5, cache_invalidate_mcr),
        (6, injection),
    ];
    for (n, run) in scenarios {
        if args.scenario.is_none() || args.scenario == Some(n) {
            println!("{}. {}", n, run());
        }
    }
}
