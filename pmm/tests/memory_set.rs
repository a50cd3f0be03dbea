mod common;

use common::*;
use pmm::config::{PAGE_SIZE, USER_BASE, USER_TOP};
use pmm::{
    AllocatorKind, MapPermission, MemorySet, MmError, PTEFlags, PageFaultKind, PteSlot, VirtAddr,
    VirtPageNum,
};
use pretty_assertions::assert_eq;

fn va(offset: usize) -> VirtAddr {
    VirtAddr::from(USER_BASE + offset)
}

fn vpn(offset: usize) -> VirtPageNum {
    va(offset).floor()
}

#[test]
fn new_address_space_shares_the_kernel_half() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let kernel = mm.kernel_root().unwrap();
    let space = MemorySet::new_bare(&mm).unwrap();
    for index in 256..512 {
        assert_eq!(
            mm.read_pte(PteSlot::new(space.page_table().root_ppn(), index)).bits,
            mm.read_pte(PteSlot::new(kernel.root_ppn(), index)).bits,
        );
    }
    assert_eq!(
        mm.translate(space.page_table(), VirtAddr::from(UART.start)).map(|pa| pa.0),
        Some(UART.start)
    );
    assert_eq!(space.token() >> 60, 8);
}

#[test]
fn pages_are_populated_on_first_touch() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let mut space = MemorySet::new_bare(&mm).unwrap();
    space
        .insert_framed_area(va(0), va(4 * PAGE_SIZE), MapPermission::R | MapPermission::W)
        .unwrap();
    assert!(space.translate(vpn(PAGE_SIZE)).map_or(true, |pte| !pte.is_valid()));

    space.handle_page_fault(va(PAGE_SIZE + 0x10), PageFaultKind::Store).unwrap();
    let pte = space.translate(vpn(PAGE_SIZE)).unwrap();
    assert!(pte.is_valid());
    assert_eq!(pte.perm(), PTEFlags::R | PTEFlags::W | PTEFlags::U);
    assert!(mm.read_frame(pte.ppn(), |bytes| bytes.iter().all(|&b| b == 0)));
    assert_eq!(mm.page_ref(pte.ppn()), 1);

    // already mapped and allowed: nothing changes
    space.handle_page_fault(va(PAGE_SIZE), PageFaultKind::Load).unwrap();
    assert_eq!(space.translate(vpn(PAGE_SIZE)).unwrap().ppn(), pte.ppn());
}

#[test]
fn faults_outside_areas_or_permissions_are_rejected() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let mut space = MemorySet::new_bare(&mm).unwrap();
    space
        .insert_framed_area(va(0), va(PAGE_SIZE), MapPermission::R)
        .unwrap();
    assert!(matches!(
        space.handle_page_fault(va(PAGE_SIZE), PageFaultKind::Load),
        Err(MmError::InvalidAddress { .. })
    ));
    assert!(matches!(
        space.handle_page_fault(va(0), PageFaultKind::Store),
        Err(MmError::InvalidAddress { .. })
    ));
    assert!(matches!(
        space.handle_page_fault(va(0), PageFaultKind::Instruction),
        Err(MmError::InvalidAddress { .. })
    ));
    assert!(space.translate(vpn(0)).map_or(true, |pte| !pte.is_valid()));
}

#[test]
fn areas_must_not_overlap_anything() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let mut space = MemorySet::new_bare(&mm).unwrap();
    let rw = MapPermission::R | MapPermission::W;
    space.insert_framed_area(va(0), va(2 * PAGE_SIZE), rw).unwrap();
    assert!(space.insert_framed_area(va(PAGE_SIZE), va(3 * PAGE_SIZE), rw).is_err());
    assert!(space
        .insert_framed_area(VirtAddr::from(UART.start), VirtAddr::from(UART.end), rw)
        .is_err());
    assert!(space
        .insert_framed_area(VirtAddr::from(USER_TOP), VirtAddr::from(USER_TOP + PAGE_SIZE), rw)
        .is_err());
    assert!(space
        .insert_framed_area(VirtAddr::from(0), VirtAddr::from(PAGE_SIZE), rw)
        .is_err());
    space.insert_framed_area(va(2 * PAGE_SIZE), va(3 * PAGE_SIZE), rw).unwrap();
    assert_eq!(space.areas().len(), 2);
}

#[test]
fn fork_copies_every_populated_page() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let mut parent = MemorySet::new_bare(&mm).unwrap();
    let data: Vec<u8> = (0..3 * PAGE_SIZE - 100).map(|i| (i % 251) as u8).collect();
    parent
        .insert_framed_area_with_data(va(0), va(4 * PAGE_SIZE), MapPermission::R | MapPermission::W, &data)
        .unwrap();

    let child = MemorySet::from_existed_user(&parent).unwrap();
    assert_eq!(child.areas().len(), 1);
    for page in 0..3 {
        let from = parent.translate(vpn(page * PAGE_SIZE)).unwrap().ppn();
        let to = child.translate(vpn(page * PAGE_SIZE)).unwrap().ppn();
        assert_ne!(from, to);
        assert_eq!(mm.read_frame(from, |b| b.to_vec()), mm.read_frame(to, |b| b.to_vec()));
    }
    // the fourth page was never touched, so neither side has it
    assert!(child.translate(vpn(3 * PAGE_SIZE)).map_or(true, |pte| !pte.is_valid()));

    let to = child.translate(vpn(0)).unwrap().ppn();
    mm.write_frame(to, |b| b[0] = 0xff);
    let from = parent.translate(vpn(0)).unwrap().ppn();
    assert_eq!(mm.read_frame(from, |b| b[0]), 0);
}

#[test]
fn dropping_address_spaces_returns_every_frame() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let free = mm.nr_free_pages();
    {
        let mut parent = MemorySet::new_bare(&mm).unwrap();
        parent
            .insert_framed_area_with_data(va(0), va(PAGE_SIZE), MapPermission::R, &[1, 2, 3])
            .unwrap();
        parent
            .insert_framed_area(va(0x40_0000), va(0x40_0000 + 8 * PAGE_SIZE), MapPermission::R | MapPermission::W)
            .unwrap();
        parent.handle_page_fault(va(0x40_0000 + 5 * PAGE_SIZE), PageFaultKind::Store).unwrap();
        let _child = MemorySet::from_existed_user(&parent).unwrap();
        assert!(mm.nr_free_pages() < free);
    }
    assert_eq!(mm.nr_free_pages(), free);
}

#[test]
fn removing_an_area_releases_its_pages() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let mut space = MemorySet::new_bare(&mm).unwrap();
    let free = mm.nr_free_pages();
    space
        .insert_framed_area_with_data(va(0), va(2 * PAGE_SIZE), MapPermission::R, &[7; PAGE_SIZE + 1])
        .unwrap();
    assert!(space.find_area(va(PAGE_SIZE)).is_some());
    space.remove_area_with_start_vpn(vpn(0)).unwrap();
    assert!(space.find_area(va(0)).is_none());
    assert_eq!(mm.nr_free_pages(), free);
    assert!(space.remove_area_with_start_vpn(vpn(0)).is_err());
}

#[test]
fn failed_fork_is_torn_down() {
    let (mm, _) = manager_with(AllocatorKind::FirstFit, FRAMES - 12);
    let mut parent = MemorySet::new_bare(&mm).unwrap();
    parent
        .insert_framed_area_with_data(va(0), va(5 * PAGE_SIZE), MapPermission::R, &[9; 5 * PAGE_SIZE])
        .unwrap();
    // root, five pages, a directory and a leaf table
    assert_eq!(mm.nr_free_pages(), 4);
    assert_eq!(
        MemorySet::from_existed_user(&parent).err(),
        Some(MmError::OutOfMemory)
    );
    assert_eq!(mm.nr_free_pages(), 4);
    drop(parent);
    assert_eq!(mm.nr_free_pages(), 12);
}

#[test]
fn data_longer_than_the_area_is_rejected() {
    let (mm, _) = boot(AllocatorKind::FirstFit);
    let mut space = MemorySet::new_bare(&mm).unwrap();
    let free = mm.nr_free_pages();
    assert!(space
        .insert_framed_area_with_data(va(0), va(PAGE_SIZE), MapPermission::R, &[0; PAGE_SIZE + 1])
        .is_err());
    assert_eq!(mm.nr_free_pages(), free);
    assert!(space.areas().is_empty());
}
