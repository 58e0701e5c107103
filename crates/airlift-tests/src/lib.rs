//! Shared harness for the end-to-end migration scenarios: wires a real
//! source engine and destination daemon together over a socketpair, with
//! the fault plumbing running over real pipes.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use airlift_dest::{
    read_handshake, spawn_fault_forwarder, Daemon, DaemonChannels, DaemonConfig, DaemonState,
    DestBlock, Supervisor,
};
use airlift_pagemap::RamBlock;
use airlift_protocol::Options;
use airlift_umem::MemStore;

pub const PAGE: u64 = 4096;

/// Installs the env-filtered subscriber once; run tests with
/// `RUST_LOG=debug` to watch both engines narrate.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Per-page recognizable content: byte 0 tags the page, byte 1 the seed.
pub fn patterned_data(npages: u64, seed: u8) -> Vec<u8> {
    let mut data = vec![0u8; (npages * PAGE) as usize];
    for pg in 0..npages {
        let start = (pg * PAGE) as usize;
        data[start] = pg as u8;
        data[start + 1] = seed;
        data[start + 2] = 0x5A;
    }
    data
}

/// A destination daemon running against in-process stores, plus the
/// supervisor half of its control channel.
pub struct DestRig {
    pub daemon: JoinHandle<DaemonState>,
    pub supervisor: Supervisor,
    pub stores: Vec<Arc<MemStore>>,
    pub forwarder: JoinHandle<()>,
}

/// Consumes the handshake off `stream`, builds one `MemStore` per block and
/// starts the daemon with all four pipes in place. Blocks until the daemon
/// reports READY.
pub fn launch_dest(mut stream: UnixStream, blocks: Vec<RamBlock>) -> DestRig {
    let (options, device_state) = read_handshake(&mut stream).expect("handshake");
    assert_eq!(device_state, b"devstate");

    let stores: Vec<Arc<MemStore>> = blocks
        .iter()
        .map(|b| Arc::new(MemStore::new(b.length, PAGE).expect("store")))
        .collect();

    let (control_rx, sup_control_tx) = nix::unistd::pipe().expect("pipe");
    let (sup_control_rx, control_tx) = nix::unistd::pipe().expect("pipe");
    let (forward_rx, wake_tx) = nix::unistd::pipe().expect("pipe");
    let (fault_rx, forward_tx) = nix::unistd::pipe().expect("pipe");

    let forwarder = {
        let blocks = blocks.clone();
        let stores = stores.clone();
        spawn_fault_forwarder(forward_rx, forward_tx, move |abs_pgoff| {
            let addr = abs_pgoff * PAGE;
            if let Some(idx) = blocks.iter().position(|b| b.contains_addr(addr)) {
                // The benign read that materializes the page on this side.
                let _ = stores[idx].read_byte(addr - blocks[idx].offset);
            }
        })
        .expect("forwarder")
    };

    let dest_blocks: Vec<DestBlock> = blocks
        .iter()
        .zip(&stores)
        .map(|(ram, store)| DestBlock {
            ram: ram.clone(),
            store: store.clone(),
        })
        .collect();

    let config = DaemonConfig {
        target_page_size: PAGE,
        host_page_size: PAGE,
        precopy: options.contains(Options::PRECOPY),
    };
    let channels = DaemonChannels {
        stream: OwnedFd::from(stream),
        control_rx,
        control_tx,
        wake_tx,
        fault_rx,
    };
    let daemon = Daemon::new(config, dest_blocks, channels).expect("daemon");
    let daemon = std::thread::Builder::new()
        .name("daemon".into())
        .spawn(move || daemon.run().expect("daemon run"))
        .expect("spawn daemon");

    let mut supervisor = Supervisor::new(sup_control_tx, sup_control_rx);
    supervisor.wait_ready().expect("daemon ready");

    DestRig {
        daemon,
        supervisor,
        stores,
        forwarder,
    }
}

/// Polls `cond` until it holds or ten seconds pass.
pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Asserts a store's shadow holds exactly the source's bytes for `npages`.
pub fn assert_pages_match(store: &MemStore, data: &[u8], npages: u64) {
    for pg in 0..npages {
        let got = store.shadow_page(pg).expect("shadow page");
        let start = (pg * PAGE) as usize;
        assert_eq!(
            got,
            &data[start..start + PAGE as usize],
            "page {pg} differs"
        );
    }
}
