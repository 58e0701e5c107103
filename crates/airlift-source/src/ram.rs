use airlift_pagemap::{Bitmap, BlockSet, PageGeometry, RamBlock};
use airlift_protocol::CleanMapRecord;

use crate::{Result, SourceError};

/// One RAM block on the source, with its contents and the dirty bitmap of
/// target pages still owed to the destination.
pub struct SourceBlock {
    pub ram: RamBlock,
    data: Vec<u8>,
    dirty: Bitmap,
}

impl SourceBlock {
    pub fn page(&self, pgoff: u64, target_page_size: u64) -> &[u8] {
        let start = (pgoff * target_page_size) as usize;
        &self.data[start..start + target_page_size as usize]
    }

    pub fn target_pages(&self, target_page_size: u64) -> u64 {
        self.ram.length / target_page_size
    }

    /// Consults and consumes the dirty bit: a page is sent at most once, so
    /// a redundant request is discarded right here.
    pub fn take_dirty(&mut self, pgoff: u64) -> bool {
        pgoff < self.dirty.len() && self.dirty.test_and_clear(pgoff)
    }

    pub fn next_dirty(&self, from: u64) -> Option<u64> {
        self.dirty.next_set(from)
    }

    pub fn dirty_pages(&self) -> u64 {
        self.dirty.count_ones()
    }

    pub fn clean_words(&self) -> Vec<u64> {
        self.dirty.complement_words()
    }
}

/// The source's frozen block list plus per-block dirty state. This is the
/// engine's view of the hypervisor's dirty log: the embedder feeds
/// re-dirtied pages in through [`SourceRam::mark_dirty`] between precopy
/// passes.
pub struct SourceRam {
    target_page_size: u64,
    blocks: Vec<SourceBlock>,
    ids: BlockSet,
}

impl SourceRam {
    pub fn new(target_page_size: u64) -> Self {
        Self {
            target_page_size,
            blocks: Vec::new(),
            ids: BlockSet::new(),
        }
    }

    pub fn target_page_size(&self) -> u64 {
        self.target_page_size
    }

    pub fn add_block(&mut self, id: &str, offset: u64, data: Vec<u8>) -> Result<()> {
        let geometry = PageGeometry::new(self.target_page_size, self.target_page_size)?;
        let ram = RamBlock {
            id: id.to_string(),
            offset,
            length: data.len() as u64,
        };
        self.ids.push(ram.clone(), &geometry)?;
        let npages = ram.length / self.target_page_size;
        let mut dirty = Bitmap::new(npages);
        for pg in 0..npages {
            dirty.set(pg);
        }
        self.blocks.push(SourceBlock { ram, data, dirty });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, idx: usize) -> &SourceBlock {
        &self.blocks[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut SourceBlock {
        &mut self.blocks[idx]
    }

    pub fn find_by_id(&self, id: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.ram.id == id)
    }

    /// Re-dirties pages the guest wrote while precopy ran.
    pub fn mark_dirty(&mut self, id: &str, pgoffs: &[u64]) -> Result<()> {
        let idx = self
            .find_by_id(id)
            .ok_or_else(|| SourceError::UnknownBlock(id.to_string()))?;
        let block = &mut self.blocks[idx];
        for &pg in pgoffs {
            if pg >= block.dirty.len() {
                return Err(SourceError::OutOfRangeRequest {
                    id: id.to_string(),
                    pgoff: pg,
                });
            }
            block.dirty.set(pg);
        }
        Ok(())
    }

    pub fn dirty_remaining(&self) -> u64 {
        self.blocks.iter().map(|b| b.dirty_pages()).sum()
    }

    /// Next dirty page at or after `cursor`, wrapping across the block list
    /// so pages behind the cursor are not orphaned.
    pub fn next_dirty_from(&self, cursor: (usize, u64)) -> Option<(usize, u64)> {
        let n = self.blocks.len();
        if n == 0 {
            return None;
        }
        let (cb, cpg) = (cursor.0 % n, cursor.1);
        for i in 0..=n {
            let b = (cb + i) % n;
            let from = if i == 0 { cpg } else { 0 };
            if let Some(pg) = self.blocks[b].next_dirty(from) {
                return Some((b, pg));
            }
        }
        None
    }

    pub fn manifest(&self) -> Vec<(String, u64)> {
        self.blocks
            .iter()
            .map(|b| (b.ram.id.clone(), b.ram.length))
            .collect()
    }

    /// The clean bitmap is the complement of what is still owed.
    pub fn clean_map(&self) -> Vec<CleanMapRecord> {
        self.blocks
            .iter()
            .map(|b| CleanMapRecord {
                id: b.ram.id.clone(),
                offset: b.ram.offset,
                length: b.ram.length,
                words: b.clean_words(),
            })
            .collect()
    }
}
