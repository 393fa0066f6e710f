//! Fault-injection handshake state machine: armed -> firing -> fired, or
//! disabled for the entire run when injection was not requested.
//!
//! Mirrors the reference plugin's two-phase protocol: the sleep-cycle
//! threshold is read once, at the first block translation; the four
//! injection-plan fields are read only once the cycle counter reaches it.

use log::{error, info};

use armcache_core::hierarchy::{CacheName, Hierarchy};

use crate::channel::{ChannelError, ControlChannel};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    Armed,
    Firing,
    Fired,
    Disabled,
}

pub struct InjectionController {
    state: State,
    sleep_cycles: u64,
}

impl InjectionController {
    pub fn disabled() -> Self {
        InjectionController {
            state: State::Disabled,
            sleep_cycles: 0,
        }
    }

    /// Reads the sleep-cycle threshold, the first message on the channel.
    /// Called once, at the first block-translation event, when injection
    /// was requested on the command line.
    pub fn armed(channel: &mut ControlChannel) -> Result<Self, ChannelError> {
        let raw = channel.recv_str()?;
        let sleep_cycles = raw.trim().parse().unwrap_or(0);
        info!("sleeping for {sleep_cycles} cycles before injecting a fault");
        Ok(InjectionController {
            state: State::Armed,
            sleep_cycles,
        })
    }

    /// Called on every instruction-exec event with the cycle counter as of
    /// that instruction (post-increment). Runs the full firing handshake
    /// in place when the threshold is reached.
    pub fn check(&mut self, cycle: u64, hierarchy: &Hierarchy, channel: &mut ControlChannel) {
        if self.state != State::Armed || cycle < self.sleep_cycles {
            return;
        }
        self.state = State::Firing;
        info!("injecting fault...");
        if let Err(err) = self.fire(cycle, hierarchy, channel) {
            error!("fault injection handshake failed: {err}");
            // Stays in `Firing`: the operator may retry the handshake.
            return;
        }
        self.state = State::Fired;
    }

    fn fire(
        &mut self,
        cycle: u64,
        hierarchy: &Hierarchy,
        channel: &mut ControlChannel,
    ) -> Result<(), ChannelError> {
        let set: u32 = channel.recv_str()?.trim().parse().unwrap_or(0);
        let way: u32 = channel.recv_str()?.trim().parse().unwrap_or(0);
        let cache_name = channel.recv_str()?;
        let name = match cache_name.trim() {
            "icache" => CacheName::ICache,
            "dcache" => CacheName::DCache,
            "l2cache" => CacheName::L2Cache,
            other => {
                error!("invalid cache name in injection plan: {other}");
                return Ok(());
            }
        };
        let cache = hierarchy.cache(name);

        if let Err(err) = cache.validate_injection(set, way, 0) {
            error!("invalid injection coordinate: {err}");
            return Ok(());
        }
        channel.send_byte(cache.is_valid(set, way) as u8)?;

        let word_in_block: u32 = channel.recv_str()?.trim().parse().unwrap_or(0);
        let base = cache.reconstruct_address(set, way);
        let target = base + word_in_block * 4;

        info!("injecting at set {set}, way {way}, target {target:#010x}");
        channel.send_str(&format!("{cycle:#010x}"))?;
        channel.send_str(&format!("{target:#010x}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armcache_core::cache::ReplacePolicy;
    use armcache_core::hierarchy::CacheParams;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn small_hierarchy() -> Hierarchy {
        let params = CacheParams {
            size: 16,
            ways: 1,
            block_size: 4,
            replace_policy: ReplacePolicy::RoundRobin,
        };
        Hierarchy::new(params, params, params).unwrap()
    }

    #[test]
    fn full_handshake_sends_cycle_and_target() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let send = |sock: &mut std::net::TcpStream, s: &str| {
                sock.write_all(&(s.len() as u32).to_be_bytes()).unwrap();
                sock.write_all(s.as_bytes()).unwrap();
            };
            let recv = |sock: &mut std::net::TcpStream| -> String {
                let mut len_buf = [0u8; 4];
                sock.read_exact(&mut len_buf).unwrap();
                let len = u32::from_be_bytes(len_buf) as usize;
                let mut buf = vec![0u8; len];
                sock.read_exact(&mut buf).unwrap();
                String::from_utf8(buf).unwrap()
            };

            send(&mut sock, "100"); // sleepCycles
            send(&mut sock, "0"); // set
            send(&mut sock, "0"); // way
            send(&mut sock, "dcache");
            let mut byte = [0u8; 4];
            sock.read_exact(&mut byte).unwrap();
            let len = u32::from_be_bytes(byte) as usize;
            let mut ok = vec![0u8; len];
            sock.read_exact(&mut ok).unwrap();
            send(&mut sock, "0"); // word_in_block

            assert_eq!(recv(&mut sock), "0x00000064");
            assert_eq!(recv(&mut sock), "0x00000000");
        });

        let mut channel = ControlChannel::connect("127.0.0.1", port).unwrap();
        let mut controller = InjectionController::armed(&mut channel).unwrap();
        let mut hierarchy = small_hierarchy();
        hierarchy.cache_mut(CacheName::DCache).load(0x00);
        controller.check(100, &hierarchy, &mut channel);

        server.join().unwrap();
    }
}
