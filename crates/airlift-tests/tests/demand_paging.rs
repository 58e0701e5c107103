use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::thread;

use airlift_dest::DaemonState;
use airlift_pagemap::RamBlock;
use airlift_source::{MigrationParams, Outgoing, OutgoingPhase, SourceRam};
use airlift_umem::UMem;
use airlift_tests::{assert_pages_match, init_tracing, launch_dest, patterned_data, wait_for, PAGE};

/// No precopy, one 16 KiB block, guest touches page 2 first. Every page is
/// demand-fetched, then both sides run the EOC/EOS handshake to the end.
#[test]
fn demand_paging_without_precopy() {
    init_tracing();
    let (src_stream, dst_stream) = UnixStream::pair().unwrap();
    let data = patterned_data(4, 0x11);
    let mut ram = SourceRam::new(PAGE);
    ram.add_block("ram0", 0, data.clone()).unwrap();
    let params = MigrationParams {
        no_background: true,
        ..MigrationParams::default()
    };
    let mut source = Outgoing::new(OwnedFd::from(src_stream), ram, params).unwrap();
    source.begin(b"devstate").unwrap();
    source.start_postcopy().unwrap();

    let blocks = vec![RamBlock {
        id: "ram0".into(),
        offset: 0,
        length: 4 * PAGE,
    }];
    let mut rig = launch_dest(dst_stream, blocks);
    let source = thread::spawn(move || source.run().unwrap());

    // The guest blocks on page 2 until the round trip serves it.
    rig.stores[0].touch(2).unwrap();
    assert!(rig.stores[0].is_cached(2));
    assert!(!rig.stores[0].is_cached(0));

    for pg in [0, 1, 3] {
        rig.stores[0].fault(pg).unwrap();
    }
    let store = rig.stores[0].clone();
    wait_for("all pages cached", || store.finished());

    assert_eq!(source.join().unwrap(), OutgoingPhase::Completed);
    assert!(!rig.supervisor.run_to_completion().unwrap());
    let state = rig.daemon.join().unwrap();
    assert_eq!(state & DaemonState::END_MASK, DaemonState::END_MASK);
    assert!(!state.intersects(DaemonState::ERROR_REQ));
    rig.forwarder.join().unwrap();

    assert_pages_match(&rig.stores[0], &data, 4);
    // A later access to an arrived page never leaves the backing store.
    rig.stores[0].touch(2).unwrap();
}

/// Two blocks exercise the PAGE/PAGE_CONT block naming on the request
/// stream and the per-block completion accounting.
#[test]
fn demand_paging_two_blocks() {
    init_tracing();
    let (src_stream, dst_stream) = UnixStream::pair().unwrap();
    let ram0 = patterned_data(4, 0x21);
    let vga = patterned_data(2, 0x22);
    let mut ram = SourceRam::new(PAGE);
    ram.add_block("ram0", 0, ram0.clone()).unwrap();
    ram.add_block("vga", 4 * PAGE, vga.clone()).unwrap();
    let params = MigrationParams {
        no_background: true,
        ..MigrationParams::default()
    };
    let mut source = Outgoing::new(OwnedFd::from(src_stream), ram, params).unwrap();
    source.begin(b"devstate").unwrap();
    source.start_postcopy().unwrap();

    let blocks = vec![
        RamBlock {
            id: "ram0".into(),
            offset: 0,
            length: 4 * PAGE,
        },
        RamBlock {
            id: "vga".into(),
            offset: 4 * PAGE,
            length: 2 * PAGE,
        },
    ];
    let mut rig = launch_dest(dst_stream, blocks);
    let source = thread::spawn(move || source.run().unwrap());

    // Interleave demand across the two blocks.
    rig.stores[1].touch(1).unwrap();
    rig.stores[0].touch(3).unwrap();
    for pg in [0, 1, 2] {
        rig.stores[0].fault(pg).unwrap();
    }
    rig.stores[1].fault(0).unwrap();

    let (s0, s1) = (rig.stores[0].clone(), rig.stores[1].clone());
    wait_for("both blocks cached", || s0.finished() && s1.finished());

    assert_eq!(source.join().unwrap(), OutgoingPhase::Completed);
    assert!(!rig.supervisor.run_to_completion().unwrap());
    let state = rig.daemon.join().unwrap();
    assert_eq!(state & DaemonState::END_MASK, DaemonState::END_MASK);
    rig.forwarder.join().unwrap();

    assert_pages_match(&rig.stores[0], &ram0, 4);
    assert_pages_match(&rig.stores[1], &vga, 2);
}
