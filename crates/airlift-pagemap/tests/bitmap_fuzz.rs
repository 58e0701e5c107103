use airlift_pagemap::{AtomicBitmap, Bitmap, PageGeometry};

struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        ((x.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    fn gen_range(&mut self, max_exclusive: u32) -> u32 {
        if max_exclusive == 0 {
            return 0;
        }
        self.next_u32() % max_exclusive
    }
}

#[test]
fn bitmap_random_ops_match_a_model() {
    // Odd size to keep the partial last word in play.
    const NBITS: u64 = 517;
    let mut bm = Bitmap::new(NBITS);
    let mut model = vec![false; NBITS as usize];

    let mut rng = Rng::new(0x1234_5678_9ABC_DEF0);
    for _ in 0..50_000 {
        let bit = rng.gen_range(NBITS as u32) as u64;
        match rng.gen_range(4) {
            0 => {
                assert_eq!(bm.test_and_set(bit), model[bit as usize]);
                model[bit as usize] = true;
            }
            1 => {
                assert_eq!(bm.test_and_clear(bit), model[bit as usize]);
                model[bit as usize] = false;
            }
            2 => {
                assert_eq!(bm.test(bit), model[bit as usize]);
            }
            _ => {
                let expect = (bit..NBITS).find(|&b| model[b as usize]);
                assert_eq!(bm.next_set(bit), expect);
            }
        }
    }

    let ones: Vec<u64> = (0..NBITS).filter(|&b| model[b as usize]).collect();
    assert_eq!(bm.count_ones(), ones.len() as u64);
    assert_eq!(bm.iter_ones().collect::<Vec<_>>(), ones);

    // The complement agrees bit-for-bit and leaves the tail zeroed.
    let words = bm.complement_words();
    for bit in 0..NBITS {
        let set = words[(bit / 64) as usize] & (1 << (bit % 64)) != 0;
        assert_eq!(set, !model[bit as usize], "bit {bit}");
    }
    for bit in NBITS..words.len() as u64 * 64 {
        assert_eq!(words[(bit / 64) as usize] & (1 << (bit % 64)), 0);
    }
}

#[test]
fn shared_bitmap_random_ops_match_a_model() {
    const NBITS: u64 = 300;
    let (writer, reader) = AtomicBitmap::split(NBITS);
    let mut model = vec![false; NBITS as usize];

    let mut rng = Rng::new(0xFEED_FACE_CAFE_F00D);
    for _ in 0..50_000 {
        let bit = rng.gen_range(NBITS as u32) as u64;
        match rng.gen_range(3) {
            0 => {
                assert_eq!(writer.test_and_set(bit), model[bit as usize]);
                model[bit as usize] = true;
            }
            1 => assert_eq!(writer.test(bit), model[bit as usize]),
            _ => assert_eq!(reader.test(bit), model[bit as usize]),
        }
    }

    let ones: Vec<u64> = (0..NBITS).filter(|&b| model[b as usize]).collect();
    assert_eq!(reader.count_ones(), ones.len() as u64);
    assert_eq!(reader.iter_ones().collect::<Vec<_>>(), ones);
}

#[test]
fn geometry_random_ratio_mappings_hold() {
    let mut rng = Rng::new(0x0123_4567_89AB_CDEF);
    for _ in 0..10_000 {
        let target = 1u64 << (12 + rng.gen_range(5));
        let host = 1u64 << (12 + rng.gen_range(5));
        let g = PageGeometry::new(target, host).unwrap();
        assert_eq!(g.target_covers_host(), target >= host);

        let hp = rng.gen_range(4096) as u64;
        let siblings = g.target_pages_of_host(hp);
        let expect_len = if g.target_covers_host() {
            1
        } else {
            g.target_pages_per_host_page()
        };
        assert_eq!(siblings.end - siblings.start, expect_len);
        assert!(siblings.contains(&g.host_to_target(hp)));
        for tp in siblings {
            // The two mappings are mutual inverses.
            assert!(g.host_pages_of_target(tp).contains(&hp));
            if g.target_covers_host() {
                let covered = g.host_pages_of_target(tp);
                assert_eq!(covered.end - covered.start, g.host_pages_per_target_page());
                for covered_hp in covered {
                    assert_eq!(g.host_to_target(covered_hp), tp);
                }
            }
        }
    }
}
