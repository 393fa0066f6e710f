//! QEMU TCG plugin glue: wires the cache model, decoder, and timing model
//! (`armcache-core`) to the real plugin ABI, owns the control-channel
//! socket, argument parsing, and the log sink.

mod channel;
mod injection;
mod logging;
mod profiling;

use std::sync::{Arc, Mutex, OnceLock};

use clap::Parser;
use log::{error, info, warn};

use qemu_plugin::install::{Args, Info};
use qemu_plugin::plugin::{HasCallbacks, Register};
use qemu_plugin::register::RegisterDescriptor;
use qemu_plugin::{Error as QemuError, MemRW, PluginId, Result as QemuResult, TranslationBlock, VCPUIndex};

use armcache_core::cache::ReplacePolicy;
use armcache_core::decoder::{self, decode};
use armcache_core::hierarchy::{CacheName, CacheParams, Hierarchy};
use armcache_core::register_access::RegisterAccess;
use armcache_core::timing::TimingModel;

use channel::ControlChannel;
use injection::InjectionController;
use profiling::{PhysicalMemoryRead, ProfileSink, SymbolTable};

/// Default geometry for each level, used when the command line does not
/// override it. Matches the reference plugin's 32KiB 4-way L1s and 256KiB
/// 8-way L2, all with 32-byte lines.
fn default_hierarchy() -> Hierarchy {
    let l1 = CacheParams {
        size: 32 * 1024,
        ways: 4,
        block_size: 32,
        replace_policy: ReplacePolicy::RoundRobin,
    };
    let l2 = CacheParams {
        size: 256 * 1024,
        ways: 8,
        block_size: 32,
        replace_policy: ReplacePolicy::RoundRobin,
    };
    Hierarchy::new(l1, l1, l2).expect("default hierarchy geometry is internally consistent")
}

/// Lazily-populated, process-wide register descriptor table. `register()`
/// may run before any vCPU exists, so descriptors are fetched on first use
/// from inside a register-capable callback instead.
static REGISTERS: OnceLock<Mutex<Option<Vec<RegisterDescriptor<'static>>>>> = OnceLock::new();

struct QemuRegisters;

impl RegisterAccess for QemuRegisters {
    fn read_gpr(&self, index: u8) -> u32 {
        let cell = REGISTERS.get_or_init(|| Mutex::new(None));
        let mut guard = cell.lock().expect("register descriptor cache poisoned");
        if guard.is_none() {
            *guard = qemu_plugin::qemu_plugin_get_registers().ok();
        }
        let Some(descriptors) = guard.as_ref() else {
            warn!("register descriptors unavailable, treating r{index} as 0");
            return 0;
        };
        let name = format!("r{index}");
        let Some(descriptor) = descriptors.iter().find(|d| d.name == name) else {
            warn!("no register descriptor named {name}, treating it as 0");
            return 0;
        };
        match descriptor.read() {
            Ok(bytes) if bytes.len() >= 4 => u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            Ok(_) | Err(_) => {
                warn!("failed to read {name}, treating it as 0");
                0
            }
        }
    }
}

struct NullPhysicalMemory;

impl PhysicalMemoryRead for NullPhysicalMemory {
    fn read_u32(&self, _physical_address: u64) -> Option<u32> {
        None
    }
}

/// Everything the per-instruction closures need, shared behind a mutex
/// because `register_execute_callback` closures are independent `'static`
/// callbacks, not further calls into the plugin struct.
struct Shared {
    text_begin: u64,
    text_end: u64,
    hierarchy: Hierarchy,
    timing: TimingModel,
    cycle: u64,
    load_count: u64,
    store_count: u64,
    channel: Option<ControlChannel>,
    injection: InjectionController,
    first_block_seen: bool,
    profiler: Option<ProfileSink>,
}

impl Shared {
    fn in_text(&self, vaddr: u64) -> bool {
        vaddr >= self.text_begin && vaddr < self.text_end
    }
}

fn parse_guest_address(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => raw.parse().map_err(|e: std::num::ParseIntError| e.to_string()),
    }
}

/// The five `key=value` arguments QEMU passes on `-plugin ...,arg=val,...`,
/// plus an optional sixth for the profiling sink. `Args::raw` already holds
/// each entry as `key=value`; reinterpreting that as `--key=value` lets
/// `clap` own parsing, defaults, and error messages instead of hand-rolling
/// them.
#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct PluginArgs {
    #[arg(long = "textBegin", default_value = "0", value_parser = parse_guest_address)]
    text_begin: u64,
    #[arg(long = "textEnd", default_value = "0", value_parser = parse_guest_address)]
    text_end: u64,
    #[arg(long = "portNum", default_value_t = 0)]
    port_num: u16,
    #[arg(long = "hostname", default_value = "127.0.0.1")]
    hostname: String,
    #[arg(long = "doInject", default_value_t = 0)]
    do_inject: u8,
    #[arg(long = "profileSymbols")]
    profile_symbols: Option<String>,
}

fn parse_plugin_args(args: &Args) -> PluginArgs {
    let argv = args.raw.iter().map(|kv| format!("--{kv}"));
    PluginArgs::try_parse_from(argv).unwrap_or_else(|err| {
        error!("failed to parse plugin arguments, using defaults: {err}");
        PluginArgs::parse_from(std::iter::empty::<String>())
    })
}

pub struct ArmCachePlugin {
    shared: Arc<Mutex<Shared>>,
}

impl Default for ArmCachePlugin {
    fn default() -> Self {
        ArmCachePlugin {
            shared: Arc::new(Mutex::new(Shared {
                text_begin: 0,
                text_end: 0,
                hierarchy: default_hierarchy(),
                timing: TimingModel::new(),
                cycle: 0,
                load_count: 0,
                store_count: 0,
                channel: None,
                injection: InjectionController::disabled(),
                first_block_seen: false,
                profiler: None,
            })),
        }
    }
}

impl Register for ArmCachePlugin {
    fn register(&mut self, id: PluginId, args: &Args, _info: &Info) -> QemuResult<()> {
        logging::init();

        let plugin_args = parse_plugin_args(args);

        let mut guard = self.shared.lock().expect("plugin state poisoned");
        guard.text_begin = plugin_args.text_begin;
        guard.text_end = plugin_args.text_end;

        if let Some(path) = plugin_args.profile_symbols.as_ref() {
            match SymbolTable::load(std::path::Path::new(path)) {
                Ok(table) => guard.profiler = Some(ProfileSink::new(table)),
                Err(err) => error!("failed to load profile symbols from {path}: {err}"),
            }
        }

        if plugin_args.do_inject != 0 {
            let port = plugin_args.port_num;
            let hostname = &plugin_args.hostname;
            match ControlChannel::connect(hostname, port) {
                Ok(channel) => guard.channel = Some(channel),
                Err(err) => error!("failed to connect control channel to {hostname}:{port}: {err}"),
            }
        } else {
            guard.injection = InjectionController::disabled();
        }
        drop(guard);

        let shared = Arc::clone(&self.shared);
        qemu_plugin::qemu_plugin_register_atexit_cb(id, move |_id: PluginId| {
            let mut guard = shared.lock().expect("plugin state poisoned");
            report_stats(&guard);
            guard.hierarchy.shutdown();
            if let Some(channel) = guard.channel.as_mut() {
                channel.shutdown();
            }
        })
        .map_err(|_: QemuError| QemuError::ConcurrentPluginUninstallCallbackSet)?;

        Ok(())
    }
}

fn report_stats(shared: &Shared) {
    for (label, name) in [
        ("icache", CacheName::ICache),
        ("dcache", CacheName::DCache),
        ("l2cache", CacheName::L2Cache),
    ] {
        let stats = shared.hierarchy.cache(name).stats();
        let accesses = stats.load_hits + stats.load_misses + stats.store_hits + stats.store_misses;
        let hit_rate = if accesses == 0 {
            0.0
        } else {
            (stats.load_hits + stats.store_hits) as f64 / accesses as f64
        };
        info!(
            "{label}: hits={} misses={} hit_rate={:.4} compulsory={} evictions={}",
            stats.load_hits + stats.store_hits,
            stats.load_misses + stats.store_misses,
            hit_rate,
            stats.compulsory_misses,
            stats.evictions,
        );
    }
    info!(
        "instructions={} loads={} stores={}",
        shared.cycle, shared.load_count, shared.store_count
    );
}

impl HasCallbacks for ArmCachePlugin {
    fn on_translation_block_translate(&mut self, _id: PluginId, tb: TranslationBlock) -> QemuResult<()> {
        let first_block = {
            let mut guard = self.shared.lock().expect("plugin state poisoned");
            let first = !guard.first_block_seen;
            guard.first_block_seen = true;
            first
        };
        if first_block {
            let mut guard = self.shared.lock().expect("plugin state poisoned");
            if guard.channel.is_some() {
                let mut channel = guard.channel.take().unwrap();
                guard.injection = InjectionController::armed(&mut channel).unwrap_or_else(|err| {
                    error!("failed to read sleepCycles from control channel: {err}");
                    InjectionController::disabled()
                });
                guard.channel = Some(channel);
            }
        }

        for idx in 0..tb.size() {
            let insn = tb.instruction(idx)?;
            let vaddr = insn.vaddr();
            let data = insn.data();
            let word = if data.len() >= 4 {
                u32::from_le_bytes(data[..4].try_into().unwrap())
            } else {
                0
            };
            let decoded = decode(word);

            {
                let guard = self.shared.lock().expect("plugin state poisoned");
                if guard.in_text(vaddr) {
                    let shared = Arc::clone(&self.shared);
                    insn.register_execute_callback(move |_vcpu: VCPUIndex| {
                        on_instruction_exec(&shared, vaddr, word);
                    });
                }
            }

            let shared_mem = Arc::clone(&self.shared);
            insn.register_memory_access_callback(
                move |_vcpu: VCPUIndex, info, vaddr: u64| {
                    on_memory_access(&shared_mem, vaddr, info.is_store());
                },
                MemRW::QEMU_PLUGIN_MEM_RW,
            );

            if decoder::is_dcache_line_invalidate(&decoded) || decoder::is_icache_invalidate_all(&decoded) {
                let shared_mcr = Arc::clone(&self.shared);
                insn.register_execute_callback_flags(
                    move |_vcpu: VCPUIndex| {
                        let mut guard = shared_mcr.lock().expect("plugin state poisoned");
                        guard.hierarchy.handle_cache_maintenance(&decoded, &QemuRegisters);
                    },
                    qemu_plugin::CallbackFlags::QEMU_PLUGIN_CB_R_REGS,
                );
            }
        }

        Ok(())
    }
}

fn on_instruction_exec(shared: &Arc<Mutex<Shared>>, vaddr: u64, word: u32) {
    let mut guard = shared.lock().expect("plugin state poisoned");
    let cost = guard.timing.step(word);
    guard.cycle += cost as u64;
    guard.hierarchy.icache_load(vaddr as u32);

    let cycle = guard.cycle;
    if let Some(profiler) = guard.profiler.as_mut() {
        profiler.record_hit(vaddr, cycle, 0, &NullPhysicalMemory);
    }

    let Shared {
        hierarchy, channel, injection, ..
    } = &mut *guard;
    if let Some(channel) = channel {
        injection.check(cycle, hierarchy, channel);
    }
}

fn on_memory_access(shared: &Arc<Mutex<Shared>>, vaddr: u64, is_store: bool) {
    let mut guard = shared.lock().expect("plugin state poisoned");
    if guard.in_text(vaddr) {
        return;
    }
    let addr = vaddr as u32;
    if is_store {
        guard.store_count += 1;
        guard.hierarchy.dcache_store(addr);
    } else {
        guard.load_count += 1;
        guard.hierarchy.dcache_load(addr);
    }
}

qemu_plugin::register!(ArmCachePlugin::default());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hierarchy_builds_without_panicking() {
        let _ = default_hierarchy();
    }

    #[test]
    fn plugin_args_read_hex_and_decimal_and_apply_defaults() {
        let args = Args {
            raw: vec![
                "textBegin=0x1000".to_string(),
                "textEnd=4096".to_string(),
                "portNum=5555".to_string(),
                "doInject=1".to_string(),
            ],
            parsed: Default::default(),
        };
        let parsed = parse_plugin_args(&args);
        assert_eq!(parsed.text_begin, 0x1000);
        assert_eq!(parsed.text_end, 4096);
        assert_eq!(parsed.port_num, 5555);
        assert_eq!(parsed.do_inject, 1);
        assert_eq!(parsed.hostname, "127.0.0.1");
    }

    #[test]
    fn plugin_args_default_when_argument_list_is_empty() {
        let args = Args {
            raw: vec![],
            parsed: Default::default(),
        };
        let parsed = parse_plugin_args(&args);
        assert_eq!(parsed.text_begin, 0);
        assert_eq!(parsed.do_inject, 0);
    }
}
