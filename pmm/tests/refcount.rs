mod common;

use common::*;
use pmm::config::{PAGE_SIZE, TABLE_SPAN, USER_BASE};
use pmm::{PTEFlags, PhysPageNum, VirtAddr};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SLOTS: usize = 48;

fn slot_va(i: usize) -> VirtAddr {
    // spread over three leaf tables
    VirtAddr::from(USER_BASE + (i % 3) * TABLE_SPAN + (i / 3) * PAGE_SIZE)
}

#[test]
fn counts_match_mappings_under_random_churn() {
    let (mm, _) = manager();
    let roots = [new_root(&mm), new_root(&mm)];
    let free = mm.nr_free_pages();
    let frames: Vec<PhysPageNum> = (0..8)
        .map(|_| mm.alloc_frame().unwrap().into_ppn())
        .collect();
    let perm = PTEFlags::R | PTEFlags::W | PTEFlags::U;
    let mut rng = StdRng::seed_from_u64(0x5139);

    for _ in 0..2000 {
        let root = roots[rng.gen_range(0..roots.len())];
        let va = slot_va(rng.gen_range(0..SLOTS));
        if rng.gen_bool(0.6) {
            let ppn = frames[rng.gen_range(0..frames.len())];
            mm.insert(root, ppn, va, perm).unwrap();
        } else {
            mm.remove(root, va);
        }
    }

    for &ppn in frames.iter() {
        let mapped: usize = roots.iter().map(|&root| count_mappings(&mm, root, ppn)).sum();
        // plus the reference taken at allocation
        assert_eq!(mm.page_ref(ppn), mapped + 1, "{:?}", ppn);
    }

    for &root in roots.iter() {
        mm.unmap_range(root, USER_BASE, USER_BASE + 3 * TABLE_SPAN).unwrap();
        mm.reclaim_empty_tables(root, USER_BASE, USER_BASE + 3 * TABLE_SPAN).unwrap();
    }
    for &ppn in frames.iter() {
        assert_eq!(mm.page_ref(ppn), 1);
        mm.free_pages(ppn, 1);
    }
    assert_eq!(mm.nr_free_pages(), free);
}
