//! Optional profiling sink: resolves instruction addresses to function
//! labels from a symbols file and reports `(label, cycle, link-register)`
//! hits, plus RTOS task-switch detection keyed off `pxCurrentTCB`.
//!
//! Format: `<name> - <start>[; <end>[, <end>]*]`. A bare `<start>` names
//! exactly that address; `<start>; <end>` covers the inclusive range
//! `[start, end]`, repeated per comma-separated `<end>`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use log::info;

const CURRENT_TCB_SYMBOL: &str = "pxCurrentTCB";

pub struct SymbolTable {
    /// Sorted by address for future range-refinement; looked up by exact
    /// match, since every covered address is inserted individually.
    by_address: BTreeMap<u64, String>,
    current_tcb_address: Option<u64>,
}

impl SymbolTable {
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut by_address = BTreeMap::new();
        let mut current_tcb_address = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((name, rest)) = line.split_once('-') else {
                continue;
            };
            let name = name.trim();
            let mut bounds = rest.split(';');
            let Some(start) = bounds.next().and_then(|s| s.trim().parse::<u64>().ok()) else {
                continue;
            };

            if name == CURRENT_TCB_SYMBOL {
                current_tcb_address = Some(start);
                continue;
            }

            if let Some(ends) = bounds.next() {
                for end in ends.split(',') {
                    let Ok(end) = end.trim().parse::<u64>() else {
                        continue;
                    };
                    for addr in start..=end {
                        by_address.insert(addr, name.to_string());
                    }
                }
            } else {
                by_address.insert(start, name.to_string());
            }
        }

        Ok(SymbolTable {
            by_address,
            current_tcb_address,
        })
    }

    pub fn label_for(&self, address: u64) -> Option<&str> {
        self.by_address.get(&address).map(String::as_str)
    }

    pub fn label_for_pointer(&self, pointer: u64) -> Option<&str> {
        self.by_address.get(&pointer).map(String::as_str)
    }
}

/// Capability for resolving `pxCurrentTCB`'s guest pointer value, used for
/// the optional RTOS-aware task-switch detector. Distinct from
/// [`armcache_core::register_access::RegisterAccess`]: this reads guest
/// physical memory rather than a register.
pub trait PhysicalMemoryRead {
    fn read_u32(&self, physical_address: u64) -> Option<u32>;
}

pub struct ProfileSink {
    symbols: SymbolTable,
    last_tcb_pointer: Option<u32>,
}

impl ProfileSink {
    pub fn new(symbols: SymbolTable) -> Self {
        ProfileSink {
            symbols,
            last_tcb_pointer: None,
        }
    }

    /// Records a hit at `address` if the address is in the symbol table;
    /// polls `pxCurrentTCB` once per hit and reports a switch if its value
    /// changed since the previous poll.
    pub fn record_hit(&mut self, address: u64, cycle: u64, link_register: u32, mem: &dyn PhysicalMemoryRead) {
        let Some(label) = self.symbols.label_for(address) else {
            return;
        };
        info!("{label}, {cycle}, {link_register:#010x}");

        let Some(tcb_addr) = self.symbols.current_tcb_address else {
            return;
        };
        let Some(pointer) = mem.read_u32(tcb_addr) else {
            return;
        };
        if self.last_tcb_pointer != Some(pointer) {
            self.last_tcb_pointer = Some(pointer);
            let name = self
                .symbols
                .label_for_pointer(pointer as u64)
                .unwrap_or("<unknown>");
            info!("~ switch to {name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct FixedMemory(u32);
    impl PhysicalMemoryRead for FixedMemory {
        fn read_u32(&self, _physical_address: u64) -> Option<u32> {
            Some(self.0)
        }
    }

    fn write_symbols(text: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("armcache-symbols-{:?}.txt", std::thread::current().id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_bare_and_ranged_and_tcb_entries() {
        let path = write_symbols("vTaskSwitchContext - 100\nuxListRemove - 200; 205\npxCurrentTCB - 300\n");
        let table = SymbolTable::load(&path).unwrap();
        assert_eq!(table.label_for(100), Some("vTaskSwitchContext"));
        assert_eq!(table.label_for(202), Some("uxListRemove"));
        assert_eq!(table.label_for(206), None);
        assert_eq!(table.current_tcb_address, Some(300));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn detects_a_task_switch_on_changed_pointer() {
        let path = write_symbols("taskA - 100\npxCurrentTCB - 300\n");
        let table = SymbolTable::load(&path).unwrap();
        let mut sink = ProfileSink::new(table);
        sink.record_hit(100, 1, 0, &FixedMemory(0x1000));
        assert_eq!(sink.last_tcb_pointer, Some(0x1000));
        fs::remove_file(path).unwrap();
    }
}
