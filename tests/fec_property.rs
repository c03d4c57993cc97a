//! Property tests for the erasure-recovery invariant: for any payload and
//! any damage not exceeding the parity, repair restores the original.

use proptest::prelude::*;

use lzrescue::fec::packet::FecIndex;
use lzrescue::fec::{find_bad_blocks, repair_prodata, write_fec, FecCount, FecCreateParams};

fn params() -> FecCreateParams {
    FecCreateParams {
        count: FecCount::Percent(20_000), // 20%
        cl_block_size: 0,
        num_workers: 1,
        fec_level: 9,
        gf16: false,
        random: false,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn repair_restores_any_recoverable_damage(
        payload in proptest::collection::vec(any::<u8>(), 600..20_000),
        seed in any::<u64>(),
    ) {
        let mut fecdata = Vec::new();
        write_fec(&mut fecdata, None, "payload", &payload, &params(), false).unwrap();
        let index = FecIndex::parse(&fecdata, false).unwrap();
        let blocks = index.prodata_blocks();
        let fec_blocks = index.fec_blocks() as u64;
        prop_assert!(fec_blocks >= 1);

        // damage up to fec_blocks distinct data blocks
        let n = 1 + seed % fec_blocks.min(blocks);
        let mut damaged = payload.clone();
        let mut chosen = Vec::new();
        let mut s = seed | 1;
        while (chosen.len() as u64) < n {
            s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let b = s % blocks;
            if !chosen.contains(&b) {
                chosen.push(b);
                let pos = index.block_pos(b) as usize;
                damaged[pos] ^= 0xA5; // one flipped byte per damaged block
            }
        }

        let bb = find_bad_blocks(&index, &damaged, false);
        prop_assert_eq!(bb.len() as u64, n);
        prop_assert!(repair_prodata(&index, &bb, &mut damaged).unwrap());
        prop_assert_eq!(damaged, payload);
    }

    #[test]
    fn excess_damage_is_always_detected(
        payload in proptest::collection::vec(any::<u8>(), 5_000..20_000),
    ) {
        let p = FecCreateParams { count: FecCount::Blocks(1), ..params() };
        let mut fecdata = Vec::new();
        write_fec(&mut fecdata, None, "payload", &payload, &p, false).unwrap();
        let index = FecIndex::parse(&fecdata, false).unwrap();
        prop_assume!(index.prodata_blocks() > 2);

        // two damaged blocks, one parity block: repair must refuse
        let mut damaged = payload.clone();
        damaged[index.block_pos(0) as usize] ^= 1;
        damaged[index.block_pos(2) as usize] ^= 1;
        let bb = find_bad_blocks(&index, &damaged, false);
        prop_assert_eq!(bb.len(), 2);
        prop_assert!(!repair_prodata(&index, &bb, &mut damaged).unwrap());
    }
}
