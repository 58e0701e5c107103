use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::shared::{pipe_batch, Shared};

/// The pending-clean drainer: wake-ups that could not be pushed through the
/// fault pipe are parked as bits; this thread retries them with blocking
/// writes. It deliberately sleeps a second after each wake so the fault
/// side drains and new bits accumulate into worthwhile batches.
pub(crate) fn drainer_loop(shared: Arc<Shared>) {
    debug!("pending-clean drainer running");
    let mut pending = shared.pending.lock().expect("pending-clean lock poisoned");
    loop {
        if pending.nr == 0 {
            if pending.exit {
                break;
            }
            pending = shared
                .pending_cv
                .wait(pending)
                .expect("pending-clean lock poisoned");
            continue;
        }

        let do_sleep = !pending.exit;
        drop(pending);
        if shared.wait_fault_writable().is_err() {
            return;
        }
        if do_sleep {
            std::thread::sleep(Duration::from_secs(1));
        }

        pending = shared.pending.lock().expect("pending-clean lock poisoned");
        let batches = {
            let max = pipe_batch() - 1;
            let mut batches: Vec<Vec<u64>> = Vec::new();
            let mut cur: Vec<u64> = Vec::new();
            for idx in 0..shared.blocks.len() {
                let base = shared.blocks[idx].ram.offset >> shared.geometry.host_page_bits();
                while let Some(bit) = pending.bitmaps[idx].next_set(0) {
                    pending.bitmaps[idx].test_and_clear(bit);
                    pending.nr -= 1;
                    cur.push(base + bit);
                    if cur.len() == max {
                        batches.push(std::mem::take(&mut cur));
                    }
                }
            }
            if !cur.is_empty() {
                batches.push(cur);
            }
            batches
        };
        // The pipe write blocks; never hold the bitmap lock across it.
        drop(pending);

        for batch in batches {
            if let Err(e) = shared.fault_request(&batch, true) {
                warn!(error = %e, "pending-clean drain failed");
                shared.close_fault_tx();
                return;
            }
        }
        pending = shared.pending.lock().expect("pending-clean lock poisoned");
    }
    drop(pending);
    debug!("pending-clean drainer exits");
}
