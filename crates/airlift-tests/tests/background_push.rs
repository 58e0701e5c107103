use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::thread;

use airlift_dest::DaemonState;
use airlift_pagemap::RamBlock;
use airlift_source::{MigrationParams, Outgoing, OutgoingPhase, SourceRam};
use airlift_umem::UMem;
use airlift_tests::{assert_pages_match, init_tracing, launch_dest, patterned_data, wait_for, PAGE};

/// With background pushes enabled and a guest that never faults, the whole
/// block drains opportunistically and the engines still converge on the
/// EOC/EOS handshake.
#[test]
fn background_alone_completes_the_migration() {
    init_tracing();
    let (src_stream, dst_stream) = UnixStream::pair().unwrap();
    let data = patterned_data(32, 0x66);
    let mut ram = SourceRam::new(PAGE);
    ram.add_block("ram0", 0, data.clone()).unwrap();
    let mut source =
        Outgoing::new(OwnedFd::from(src_stream), ram, MigrationParams::default()).unwrap();
    source.begin(b"devstate").unwrap();
    source.start_postcopy().unwrap();

    let blocks = vec![RamBlock {
        id: "ram0".into(),
        offset: 0,
        length: 32 * PAGE,
    }];
    let mut rig = launch_dest(dst_stream, blocks);
    let source = thread::spawn(move || source.run().unwrap());

    let store = rig.stores[0].clone();
    wait_for("background fills the block", || store.finished());

    assert_eq!(source.join().unwrap(), OutgoingPhase::Completed);
    assert!(!rig.supervisor.run_to_completion().unwrap());
    let state = rig.daemon.join().unwrap();
    assert_eq!(state & DaemonState::END_MASK, DaemonState::END_MASK);
    assert!(!state.intersects(DaemonState::ERROR_REQ));
    rig.forwarder.join().unwrap();

    assert_pages_match(&rig.stores[0], &data, 32);
}

/// A demand fault in the middle of a throttled background walk is served
/// promptly, and the migration still delivers every page exactly once.
#[test]
fn demand_interleaves_with_background() {
    init_tracing();
    let (src_stream, dst_stream) = UnixStream::pair().unwrap();
    let data = patterned_data(64, 0x77);
    let mut ram = SourceRam::new(PAGE);
    ram.add_block("ram0", 0, data.clone()).unwrap();
    let params = MigrationParams {
        // Slow enough that the fault on page 60 beats the walker there.
        max_bytes_per_second: Some(100 * (PAGE + 16)),
        ..MigrationParams::default()
    };
    let mut source = Outgoing::new(OwnedFd::from(src_stream), ram, params).unwrap();
    source.begin(b"devstate").unwrap();
    source.start_postcopy().unwrap();

    let blocks = vec![RamBlock {
        id: "ram0".into(),
        offset: 0,
        length: 64 * PAGE,
    }];
    let mut rig = launch_dest(dst_stream, blocks);
    let source = thread::spawn(move || source.run().unwrap());

    // Touch a page far ahead of the background cursor.
    rig.stores[0].touch(60).unwrap();
    let store = rig.stores[0].clone();
    wait_for("everything cached", || store.finished());

    assert_eq!(source.join().unwrap(), OutgoingPhase::Completed);
    assert!(!rig.supervisor.run_to_completion().unwrap());
    let state = rig.daemon.join().unwrap();
    assert_eq!(state & DaemonState::END_MASK, DaemonState::END_MASK);
    rig.forwarder.join().unwrap();

    assert_pages_match(&rig.stores[0], &data, 64);
}
