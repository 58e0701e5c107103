use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::{Condvar, Mutex};

use airlift_pagemap::Bitmap;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tracing::trace;

use crate::{Result, UMem, UMemError};

struct Shadow {
    data: Vec<u8>,
    mapped: bool,
    /// Host pages whose shadow copy has been handed back after wake-up.
    released: Bitmap,
}

struct PageState {
    /// Host pages present and visible to the guest.
    cached: Bitmap,
    /// Host pages with an outstanding demand notification, so a page is
    /// never announced twice.
    demanded: Bitmap,
}

/// In-process shared-memory page container.
///
/// Guest access is modeled by [`MemStore::touch`], which blocks the calling
/// thread until the page is marked cached, emitting one demand notification
/// through a real pipe the first time. The daemon side consumes the store
/// purely through the [`UMem`] trait.
pub struct MemStore {
    host_page_size: u64,
    length: u64,
    shadow: Mutex<Shadow>,
    pages: Mutex<PageState>,
    wake: Condvar,
    demand_rx: File,
    demand_tx: Mutex<Option<File>>,
}

impl MemStore {
    /// Maps `length` bytes of fault-capable memory.
    pub fn new(length: u64, host_page_size: u64) -> Result<Self> {
        assert!(host_page_size.is_power_of_two() && length % host_page_size == 0);
        let (demand_rx, demand_tx) = nix::unistd::pipe().map_err(std::io::Error::from)?;
        // The daemon drains demands opportunistically; its reads must not park.
        fcntl(demand_rx.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(std::io::Error::from)?;
        let npages = length / host_page_size;
        Ok(Self {
            host_page_size,
            length,
            shadow: Mutex::new(Shadow {
                data: vec![0; length as usize],
                mapped: true,
                released: Bitmap::new(npages),
            }),
            pages: Mutex::new(PageState {
                cached: Bitmap::new(npages),
                demanded: Bitmap::new(npages),
            }),
            wake: Condvar::new(),
            demand_rx: File::from(demand_rx),
            demand_tx: Mutex::new(Some(File::from(demand_tx))),
        })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn host_page_size(&self) -> u64 {
        self.host_page_size
    }

    fn npages(&self) -> u64 {
        self.length / self.host_page_size
    }

    fn check_pgoff(&self, host_pgoff: u64) -> Result<()> {
        if host_pgoff >= self.npages() {
            return Err(UMemError::OutOfRange(host_pgoff * self.host_page_size));
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        if offset % self.host_page_size != 0
            || offset.checked_add(length).map_or(true, |end| end > self.length)
        {
            return Err(UMemError::OutOfRange(offset));
        }
        Ok(())
    }

    fn announce(&self, host_pgoff: u64) -> Result<()> {
        let tx = self.demand_tx.lock().expect("demand pipe lock poisoned");
        if let Some(mut file) = tx.as_ref() {
            file.write_all(&host_pgoff.to_ne_bytes())
                .map_err(UMemError::Io)?;
        }
        Ok(())
    }

    /// Registers a guest fault without blocking: the demand is announced on
    /// the fault fd and the caller goes on.
    pub fn fault(&self, host_pgoff: u64) -> Result<()> {
        self.check_pgoff(host_pgoff)?;
        let need_announce = {
            let mut pages = self.pages.lock().expect("page state lock poisoned");
            !pages.cached.test(host_pgoff) && !pages.demanded.test_and_set(host_pgoff)
        };
        if need_announce {
            trace!(host_pgoff, "demand fault");
            self.announce(host_pgoff)?;
        }
        Ok(())
    }

    /// Simulated guest access: blocks until the host page is cached.
    pub fn touch(&self, host_pgoff: u64) -> Result<()> {
        self.fault(host_pgoff)?;
        let mut pages = self.pages.lock().expect("page state lock poisoned");
        while !pages.cached.test(host_pgoff) {
            pages = self.wake.wait(pages).expect("page state lock poisoned");
        }
        Ok(())
    }

    /// One-byte read of the shadow mapping, the benign access the fault
    /// forwarder uses to materialize a page.
    pub fn read_byte(&self, offset: u64) -> Result<u8> {
        if offset >= self.length {
            return Err(UMemError::OutOfRange(offset));
        }
        let shadow = self.shadow.lock().expect("shadow lock poisoned");
        Ok(shadow.data[offset as usize])
    }

    /// Copy of one host page of the shadow mapping.
    pub fn shadow_page(&self, host_pgoff: u64) -> Result<Vec<u8>> {
        self.check_pgoff(host_pgoff)?;
        let start = (host_pgoff * self.host_page_size) as usize;
        let shadow = self.shadow.lock().expect("shadow lock poisoned");
        Ok(shadow.data[start..start + self.host_page_size as usize].to_vec())
    }

    pub fn is_cached(&self, host_pgoff: u64) -> bool {
        self.pages
            .lock()
            .expect("page state lock poisoned")
            .cached
            .test(host_pgoff)
    }

    pub fn cached_pages(&self) -> u64 {
        self.pages
            .lock()
            .expect("page state lock poisoned")
            .cached
            .count_ones()
    }

    pub fn released_pages(&self) -> u64 {
        self.shadow
            .lock()
            .expect("shadow lock poisoned")
            .released
            .count_ones()
    }
}

impl UMem for MemStore {
    fn fault_fd(&self) -> BorrowedFd<'_> {
        self.demand_rx.as_fd()
    }

    fn take_faults(&self, max: usize) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        let mut rx = &self.demand_rx;
        let mut buf = [0u8; 4096];
        while out.len() < max {
            let want = ((max - out.len()) * 8).min(buf.len());
            // Demands are written as single u64s, so a pipe read returns a
            // whole number of records.
            match rx.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => {
                    debug_assert_eq!(n % 8, 0);
                    for chunk in buf[..n].chunks_exact(8) {
                        out.push(u64::from_ne_bytes(chunk.try_into().expect("8-byte chunk")));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(UMemError::Io(e)),
            }
        }
        Ok(out)
    }

    fn write_page(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset.checked_add(data.len() as u64).map_or(true, |end| end > self.length) {
            return Err(UMemError::OutOfRange(offset));
        }
        let mut shadow = self.shadow.lock().expect("shadow lock poisoned");
        let start = offset as usize;
        shadow.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn fill_page(&self, offset: u64, length: u64, byte: u8) -> Result<()> {
        if offset.checked_add(length).map_or(true, |end| end > self.length) {
            return Err(UMemError::OutOfRange(offset));
        }
        let mut shadow = self.shadow.lock().expect("shadow lock poisoned");
        shadow.data[offset as usize..(offset + length) as usize].fill(byte);
        Ok(())
    }

    fn mark_cached(&self, host_pgoffs: &[u64]) -> Result<()> {
        for &pgoff in host_pgoffs {
            self.check_pgoff(pgoff)?;
        }
        let mut pages = self.pages.lock().expect("page state lock poisoned");
        for &pgoff in host_pgoffs {
            pages.cached.set(pgoff);
        }
        drop(pages);
        self.wake.notify_all();
        Ok(())
    }

    fn unmark(&self, offset: u64, length: u64) -> Result<()> {
        self.check_range(offset, length)?;
        let mut pages = self.pages.lock().expect("page state lock poisoned");
        for pgoff in offset / self.host_page_size..(offset + length) / self.host_page_size {
            pages.cached.test_and_clear(pgoff);
            pages.demanded.test_and_clear(pgoff);
        }
        Ok(())
    }

    fn release(&self, offset: u64, length: u64) -> Result<()> {
        self.check_range(offset, length)?;
        let mut shadow = self.shadow.lock().expect("shadow lock poisoned");
        for pgoff in offset / self.host_page_size..(offset + length) / self.host_page_size {
            shadow.released.set(pgoff);
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.cached_pages() == self.npages()
    }

    fn unmap(&self) -> Result<()> {
        let mut shadow = self.shadow.lock().expect("shadow lock poisoned");
        if !shadow.mapped {
            return Err(UMemError::AlreadyUnmapped);
        }
        shadow.mapped = false;
        // Stop announcing new demands once torn down.
        self.demand_tx
            .lock()
            .expect("demand pipe lock poisoned")
            .take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fault_announces_once_and_mark_cached_wakes() {
        let store = Arc::new(MemStore::new(0x4000, 4096).unwrap());
        store.fault(2).unwrap();
        store.fault(2).unwrap();
        assert_eq!(store.take_faults(16).unwrap(), vec![2]);

        let toucher = {
            let store = store.clone();
            std::thread::spawn(move || store.touch(2).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        store.write_page(0x2000, &[7u8; 4096]).unwrap();
        store.mark_cached(&[2]).unwrap();
        toucher.join().unwrap();
        assert!(store.is_cached(2));
        assert_eq!(store.shadow_page(2).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn take_faults_honors_the_cap() {
        let store = MemStore::new(0x10000, 4096).unwrap();
        for pgoff in 0..10 {
            store.fault(pgoff).unwrap();
        }
        assert_eq!(store.take_faults(4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(store.take_faults(100).unwrap(), (4..10).collect::<Vec<_>>());
        assert!(store.take_faults(100).unwrap().is_empty());
    }

    #[test]
    fn unmark_makes_a_page_fault_again() {
        let store = MemStore::new(0x2000, 4096).unwrap();
        store.fault(1).unwrap();
        store.mark_cached(&[1]).unwrap();
        store.take_faults(16).unwrap();

        store.unmark(0x1000, 0x1000).unwrap();
        assert!(!store.is_cached(1));
        store.fault(1).unwrap();
        assert_eq!(store.take_faults(16).unwrap(), vec![1]);
    }

    #[test]
    fn finished_after_every_page_cached() {
        let store = MemStore::new(0x3000, 4096).unwrap();
        assert!(!store.finished());
        store.mark_cached(&[0, 1]).unwrap();
        assert!(!store.finished());
        store.mark_cached(&[2]).unwrap();
        assert!(store.finished());
    }

    #[test]
    fn unmap_is_single_shot() {
        let store = MemStore::new(0x1000, 4096).unwrap();
        store.unmap().unwrap();
        assert!(matches!(store.unmap(), Err(UMemError::AlreadyUnmapped)));
    }

    #[test]
    fn out_of_range_offsets_are_refused() {
        let store = MemStore::new(0x1000, 4096).unwrap();
        assert!(matches!(store.fault(1), Err(UMemError::OutOfRange(_))));
        assert!(matches!(
            store.mark_cached(&[3]),
            Err(UMemError::OutOfRange(_))
        ));
        assert!(matches!(
            store.write_page(0x800, &[0u8; 4096]),
            Err(UMemError::OutOfRange(_))
        ));
    }
}
