use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::thread;

use airlift_dest::DaemonState;
use airlift_pagemap::RamBlock;
use airlift_source::{MigrationParams, Outgoing, OutgoingPhase, SourceRam};
use airlift_umem::UMem;
use airlift_tests::{assert_pages_match, init_tracing, launch_dest, patterned_data, wait_for, PAGE};

/// Prefault window of forward 2 / backward 1: one fault on page 5 brings
/// pages 5, 6, 7 and 4 across without any further demand.
#[test]
fn neighbors_arrive_with_the_requested_page() {
    init_tracing();
    let (src_stream, dst_stream) = UnixStream::pair().unwrap();
    let data = patterned_data(10, 0x55);
    let mut ram = SourceRam::new(PAGE);
    ram.add_block("ram0", 0, data.clone()).unwrap();
    let params = MigrationParams {
        prefault_forward: 2,
        prefault_backward: 1,
        no_background: true,
        ..MigrationParams::default()
    };
    let mut source = Outgoing::new(OwnedFd::from(src_stream), ram, params).unwrap();
    source.begin(b"devstate").unwrap();
    source.start_postcopy().unwrap();

    let blocks = vec![RamBlock {
        id: "ram0".into(),
        offset: 0,
        length: 10 * PAGE,
    }];
    let mut rig = launch_dest(dst_stream, blocks);
    let source = thread::spawn(move || source.run().unwrap());

    rig.stores[0].touch(5).unwrap();
    let store = rig.stores[0].clone();
    // The neighbors were never faulted; they arrive as prefault pushes.
    wait_for("prefault window cached", || {
        store.is_cached(4) && store.is_cached(6) && store.is_cached(7)
    });
    assert!(!store.is_cached(0));
    assert!(!store.is_cached(8));

    for pg in [0, 1, 2, 3, 8, 9] {
        store.fault(pg).unwrap();
    }
    wait_for("all pages cached", || store.finished());

    assert_eq!(source.join().unwrap(), OutgoingPhase::Completed);
    assert!(!rig.supervisor.run_to_completion().unwrap());
    let state = rig.daemon.join().unwrap();
    assert_eq!(state & DaemonState::END_MASK, DaemonState::END_MASK);
    rig.forwarder.join().unwrap();

    assert_pages_match(&rig.stores[0], &data, 10);
}
