use std::fs::File;
use std::sync::Arc;

use airlift_pagemap::{BitmapReader, BitmapWriter};
use airlift_protocol::{clean_bitmap_len, read_clean_map, read_record, PageData, RamRecord};
use tracing::{debug, warn};

use crate::shared::{pipe_batch, Shared};
use crate::state::DaemonState;
use crate::{DestError, Flow, Result};

pub(crate) struct ReaderBlock {
    pub received: BitmapWriter,
    pub clean: BitmapWriter,
}

/// The mig-read worker: sequentially parses the incoming RAM stream, writes
/// pages into the backing stores and wakes the guest threads waiting on
/// them. Sole writer of the `received` and `clean` bitmaps.
pub(crate) struct MigReader {
    shared: Arc<Shared>,
    stream: Option<File>,
    blocks: Vec<ReaderBlock>,
    last_block: Option<usize>,
}

impl MigReader {
    pub fn new(shared: Arc<Shared>, stream: File, blocks: Vec<ReaderBlock>) -> Self {
        Self {
            shared,
            stream: Some(stream),
            blocks,
            last_block: None,
        }
    }

    /// Consumes the initial stream up to the first end-of-stream marker:
    /// the block manifest, plus the precopy pages when the source ran one.
    /// With precopy the clean-bitmap preamble follows; it is loaded into
    /// `received` and `clean` and the one-shot walker takes over marking.
    pub fn init(&mut self) -> Result<()> {
        let tps = self.shared.geometry.target_page_size();
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Err(DestError::UnexpectedRecord);
            };
            match read_record(stream, tps)? {
                RamRecord::MemSize(manifest) => self.verify_manifest(&manifest)?,
                RamRecord::Hook => {}
                RamRecord::Eos => break,
                RamRecord::Page { id, offset, data } if self.shared.precopy => {
                    let idx = self.resolve(id)?;
                    self.write_page(idx, offset, data)?;
                    // No bitmap bits yet: the clean map that follows is the
                    // authority on which precopy pages stayed clean.
                }
                RamRecord::Page { .. } => return Err(DestError::UnexpectedRecord),
            }
        }

        if self.shared.precopy {
            self.load_clean_map()?;
            self.spawn_walker()?;
            self.shared.check_done()?;
        } else {
            self.shared.start_drainer()?;
        }
        Ok(())
    }

    pub fn tick(&mut self) -> Result<Flow> {
        let tps = self.shared.geometry.target_page_size();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Flow::Exit);
        };
        match read_record(stream, tps)? {
            RamRecord::Eos => {
                debug!("end of page stream");
                self.shared.req_eoc();
                // Drop the read half before the state change so no tick can
                // race a read against teardown.
                self.stream.take();
                self.shared.set_state(DaemonState::EOS_RECEIVED);
                self.shared.queue_quit();
                Ok(Flow::Exit)
            }
            RamRecord::Hook => Ok(Flow::Continue),
            RamRecord::MemSize(_) => Err(DestError::UnexpectedRecord),
            RamRecord::Page { id, offset, data } => {
                let idx = self.resolve(id)?;
                self.write_page(idx, offset, data)?;
                self.loaded(idx, offset)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn resolve(&mut self, id: Option<String>) -> Result<usize> {
        let idx = match id {
            Some(id) => self
                .shared
                .blocks
                .iter()
                .position(|b| b.ram.id == id)
                .ok_or(DestError::UnknownBlock(id))?,
            None => self.last_block.ok_or(DestError::NoCurrentBlock)?,
        };
        self.last_block = Some(idx);
        Ok(idx)
    }

    fn write_page(&mut self, idx: usize, offset: u64, data: PageData) -> Result<()> {
        let store = &self.shared.blocks[idx].store;
        match data {
            PageData::Raw(bytes) => store.write_page(offset, &bytes)?,
            PageData::Fill(byte) => {
                store.fill_page(offset, self.shared.geometry.target_page_size(), byte)?
            }
        }
        Ok(())
    }

    /// Records a freshly arrived target page and marks whatever host pages
    /// it completes.
    fn loaded(&mut self, idx: usize, offset: u64) -> Result<()> {
        let geo = &self.shared.geometry;
        let bit = offset >> geo.target_page_bits();
        let block = &self.blocks[idx];
        if block.received.test_and_set(bit) {
            // Duplicate delivery (prefault overlapping a request); already
            // woken, nothing more to do.
            return Ok(());
        }

        let mut cached: Vec<u64> = Vec::new();
        if geo.target_covers_host() {
            cached.extend(geo.host_pages_of_target(bit));
        } else {
            let per_host = geo.target_pages_per_host_page();
            let first = bit & !(per_host - 1);
            if (first..first + per_host).all(|b| block.received.test(b)) {
                cached.push(geo.host_pages_of_target(bit).start);
            }
        }
        if !cached.is_empty() {
            self.shared.mark_cached_and_wake(idx, &cached)?;
        }
        Ok(())
    }

    fn verify_manifest(&self, manifest: &[(String, u64)]) -> Result<()> {
        if manifest.len() != self.shared.blocks.len() {
            let (id, length) = manifest.first().cloned().unwrap_or_default();
            return Err(DestError::ManifestMismatch { id, length });
        }
        for (id, length) in manifest {
            let ok = self
                .shared
                .blocks
                .iter()
                .any(|b| &b.ram.id == id && b.ram.length == *length);
            if !ok {
                return Err(DestError::ManifestMismatch {
                    id: id.clone(),
                    length: *length,
                });
            }
        }
        Ok(())
    }

    fn load_clean_map(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(DestError::UnexpectedRecord);
        };
        let records = read_clean_map(stream)?;
        for rec in records {
            let idx = self
                .shared
                .blocks
                .iter()
                .position(|b| b.ram.id == rec.id)
                .ok_or_else(|| DestError::UnknownBlock(rec.id.clone()))?;
            let block = &self.shared.blocks[idx].ram;
            let npages = block.target_pages(&self.shared.geometry);
            if rec.offset != block.offset
                || rec.length != block.length
                || rec.words.len() as u64 * 8 != clean_bitmap_len(npages)
            {
                return Err(DestError::ManifestMismatch {
                    id: rec.id,
                    length: rec.length,
                });
            }
            // A clean page needs no transfer, which is exactly what
            // `received` means to the request builder.
            self.blocks[idx].received.fill_from_words(&rec.words);
            self.blocks[idx].clean.fill_from_words(&rec.words);
            debug!(id = %block.id, "clean bitmap loaded");
        }
        Ok(())
    }

    /// One-shot walker that marks every already-usable host page cached.
    /// The pending-clean drainer starts once it finishes, so deferred
    /// wake-ups are batched behind the initial flood.
    fn spawn_walker(&self) -> Result<()> {
        let shared = self.shared.clone();
        let cleans: Vec<BitmapReader> = self.blocks.iter().map(|b| b.clean.reader()).collect();
        let handle = std::thread::Builder::new()
            .name("clean-bitmap".into())
            .spawn(move || {
                if let Err(e) = walk_clean(&shared, &cleans) {
                    warn!(error = %e, "clean-bitmap walk failed");
                    shared.error_req();
                }
                if let Err(e) = shared.start_drainer() {
                    warn!(error = %e, "starting the drainer failed");
                    shared.error_req();
                }
            })?;
        *self.shared.walker.lock().expect("walker slot poisoned") = Some(handle);
        Ok(())
    }
}


fn walk_clean(shared: &Arc<Shared>, cleans: &[BitmapReader]) -> Result<()> {
    let geo = shared.geometry;
    let max = pipe_batch();
    let needed = if geo.target_covers_host() {
        geo.host_pages_per_target_page() as usize
    } else {
        1
    };

    for (idx, clean) in cleans.iter().enumerate() {
        let mut batch: Vec<u64> = Vec::new();
        if geo.target_covers_host() {
            for tp in clean.iter_ones() {
                batch.extend(geo.host_pages_of_target(tp));
                if max - batch.len() < needed {
                    shared.mark_cached_and_wake(idx, &batch)?;
                    batch.clear();
                }
            }
        } else {
            // A host page is usable only when every target page inside it
            // is clean.
            for hp in 0..shared.blocks[idx].ram.host_pages(&geo) {
                if geo.target_pages_of_host(hp).all(|tp| clean.test(tp)) {
                    batch.push(hp);
                    if max - batch.len() < needed {
                        shared.mark_cached_and_wake(idx, &batch)?;
                        batch.clear();
                    }
                }
            }
        }
        if !batch.is_empty() {
            shared.mark_cached_and_wake(idx, &batch)?;
        }
    }
    debug!("clean-bitmap walk done");
    Ok(())
}
