use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Plain single-owner bitmap, for state that already lives under a lock
/// (pending-clean sets) or inside one thread (source dirty maps).
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    nbits: u64,
    ones: u64,
}

impl Bitmap {
    pub fn new(nbits: u64) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(64) as usize],
            nbits,
            ones: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.ones == 0
    }

    pub fn count_ones(&self) -> u64 {
        self.ones
    }

    pub fn test(&self, bit: u64) -> bool {
        debug_assert!(bit < self.nbits);
        self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0
    }

    /// Sets `bit`; returns whether it was already set.
    pub fn test_and_set(&mut self, bit: u64) -> bool {
        debug_assert!(bit < self.nbits);
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1u64 << (bit % 64);
        let was = *word & mask != 0;
        *word |= mask;
        if !was {
            self.ones += 1;
        }
        was
    }

    pub fn set(&mut self, bit: u64) {
        self.test_and_set(bit);
    }

    /// Clears `bit`; returns whether it was set.
    pub fn test_and_clear(&mut self, bit: u64) -> bool {
        debug_assert!(bit < self.nbits);
        let word = &mut self.words[(bit / 64) as usize];
        let mask = 1u64 << (bit % 64);
        let was = *word & mask != 0;
        *word &= !mask;
        if was {
            self.ones -= 1;
        }
        was
    }

    /// First set bit at or after `from`.
    pub fn next_set(&self, from: u64) -> Option<u64> {
        if from >= self.nbits {
            return None;
        }
        let mut widx = (from / 64) as usize;
        let mut word = self.words[widx] & (!0u64 << (from % 64));
        loop {
            if word != 0 {
                let bit = widx as u64 * 64 + word.trailing_zeros() as u64;
                return (bit < self.nbits).then_some(bit);
            }
            widx += 1;
            if widx == self.words.len() {
                return None;
            }
            word = self.words[widx];
        }
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        let mut next = self.next_set(0);
        std::iter::from_fn(move || {
            let bit = next?;
            next = self.next_set(bit + 1);
            Some(bit)
        })
    }

    /// Complement of the valid bits, packed 64 per word; bits beyond
    /// `len()` in the last word stay zero.
    pub fn complement_words(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.words.iter().map(|w| !w).collect();
        let tail = self.nbits % 64;
        if tail != 0 {
            if let Some(last) = out.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
        out
    }
}

/// Shared bitmap with atomic bit operations. Constructed through
/// [`AtomicBitmap::split`], which fixes the writing side in the type system.
#[derive(Debug)]
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    nbits: u64,
}

impl AtomicBitmap {
    /// Builds a bitmap of `nbits` (rounded up to a whole word) and splits it
    /// into the single write handle and a cloneable read handle.
    pub fn split(nbits: u64) -> (BitmapWriter, BitmapReader) {
        let words = (0..nbits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        let shared = Arc::new(AtomicBitmap { words, nbits });
        (
            BitmapWriter {
                shared: shared.clone(),
            },
            BitmapReader { shared },
        )
    }

    pub fn len(&self) -> u64 {
        self.nbits
    }

    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    fn test(&self, bit: u64) -> bool {
        debug_assert!(bit < self.nbits);
        self.words[(bit / 64) as usize].load(Ordering::Acquire) & (1 << (bit % 64)) != 0
    }

    fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as u64)
            .sum()
    }
}

/// The one write handle of a shared bitmap. Deliberately not `Clone`:
/// whichever worker owns this value is the bitmap's only writer, so readers
/// need no lock.
#[derive(Debug)]
pub struct BitmapWriter {
    shared: Arc<AtomicBitmap>,
}

impl BitmapWriter {
    pub fn len(&self) -> u64 {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn test(&self, bit: u64) -> bool {
        self.shared.test(bit)
    }

    pub fn count_ones(&self) -> u64 {
        self.shared.count_ones()
    }

    /// Sets `bit`; returns whether it was already set.
    pub fn test_and_set(&self, bit: u64) -> bool {
        debug_assert!(bit < self.shared.nbits);
        let mask = 1u64 << (bit % 64);
        self.shared.words[(bit / 64) as usize].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    pub fn set(&self, bit: u64) {
        self.test_and_set(bit);
    }

    /// ORs whole words in, used when a wire bitmap is loaded in one shot.
    /// Word `i` covers bits `64 * i ..`.
    pub fn fill_from_words(&self, words: &[u64]) {
        for (i, word) in words.iter().enumerate().take(self.shared.words.len()) {
            self.shared.words[i].fetch_or(*word, Ordering::AcqRel);
        }
    }

    pub fn reader(&self) -> BitmapReader {
        BitmapReader {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only view of a shared bitmap. Reads are racy with respect to the
/// writer; callers tolerate stale answers (a stale `received` read costs one
/// redundant request, which the peer discards).
#[derive(Debug, Clone)]
pub struct BitmapReader {
    shared: Arc<AtomicBitmap>,
}

impl BitmapReader {
    pub fn len(&self) -> u64 {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }

    pub fn test(&self, bit: u64) -> bool {
        self.shared.test(bit)
    }

    pub fn count_ones(&self) -> u64 {
        self.shared.count_ones()
    }

    /// Set bits in ascending order, as of the moment each word is read.
    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        let nbits = self.shared.nbits;
        (0..self.shared.words.len()).flat_map(move |widx| {
            let word = self.shared.words[widx].load(Ordering::Acquire);
            (0..64).filter_map(move |i| {
                let bit = widx as u64 * 64 + i;
                (word & (1 << i) != 0 && bit < nbits).then_some(bit)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bitmap_set_clear_count() {
        let mut bm = Bitmap::new(130);
        assert!(bm.is_empty());
        assert!(!bm.test_and_set(0));
        assert!(bm.test_and_set(0));
        assert!(!bm.test_and_set(129));
        assert_eq!(bm.count_ones(), 2);
        assert!(bm.test_and_clear(0));
        assert!(!bm.test_and_clear(0));
        assert_eq!(bm.iter_ones().collect::<Vec<_>>(), vec![129]);
    }

    #[test]
    fn next_set_crosses_words() {
        let mut bm = Bitmap::new(200);
        bm.set(63);
        bm.set(64);
        bm.set(199);
        assert_eq!(bm.next_set(0), Some(63));
        assert_eq!(bm.next_set(64), Some(64));
        assert_eq!(bm.next_set(65), Some(199));
        assert_eq!(bm.next_set(200), None);
    }

    #[test]
    fn complement_masks_the_tail() {
        let mut bm = Bitmap::new(70);
        bm.set(0);
        let words = bm.complement_words();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0], !1u64);
        // Only bits 64..70 are valid in the second word.
        assert_eq!(words[1], 0x3f);
    }

    #[test]
    fn atomic_test_and_set_reports_prior_state() {
        let (w, r) = AtomicBitmap::split(100);
        assert!(!w.test_and_set(42));
        assert!(w.test_and_set(42));
        assert!(r.test(42));
        assert!(!r.test(41));
        assert_eq!(r.count_ones(), 1);
    }

    #[test]
    fn fill_from_words_is_an_or() {
        let (w, r) = AtomicBitmap::split(128);
        w.set(1);
        w.fill_from_words(&[0x4, 0x1]);
        assert_eq!(r.iter_ones().collect::<Vec<_>>(), vec![1, 2, 64]);
    }

    #[test]
    fn writer_is_send_reader_is_clone() {
        fn assert_send<T: Send>() {}
        assert_send::<BitmapWriter>();
        let (_, r) = AtomicBitmap::split(8);
        let _r2 = r.clone();
    }
}
