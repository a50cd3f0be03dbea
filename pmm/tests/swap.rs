mod common;

use common::*;
use pmm::config::{PAGE_SIZE, USER_BASE};
use pmm::{
    AllocatorKind, FrameTracker, MapPermission, MemoryManager, MemorySet, MmError, MmResult,
    PageFaultKind, PageTable, PhysPageNum, SwapManager, VirtAddr,
};
use pretty_assertions::assert_eq;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// FIFO swap keeping evicted pages in a map.
struct FifoSwap {
    root: Cell<Option<PageTable>>,
    queue: RefCell<VecDeque<VirtAddr>>,
    store: RefCell<HashMap<usize, Vec<u8>>>,
    swap_outs: Cell<usize>,
}

impl FifoSwap {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            root: Cell::new(None),
            queue: RefCell::new(VecDeque::new()),
            store: RefCell::new(HashMap::new()),
            swap_outs: Cell::new(0),
        })
    }
}

impl SwapManager for FifoSwap {
    fn is_ready(&self) -> bool {
        true
    }

    fn swap_out(&self, mm: &MemoryManager, count: usize, _hint: usize) -> usize {
        self.swap_outs.set(self.swap_outs.get() + 1);
        let Some(root) = self.root.get() else {
            return 0;
        };
        let mut freed = 0;
        while freed < count {
            let Some(va) = self.queue.borrow_mut().pop_front() else {
                break;
            };
            let Some((ppn, _)) = mm.get_page(root, va) else {
                continue;
            };
            let bytes = mm.read_frame(ppn, |b| b.to_vec());
            self.store.borrow_mut().insert(usize::from(va), bytes);
            let entry = (usize::from(va) / PAGE_SIZE + 1) << 8;
            assert_eq!(mm.evict(root, va, entry), Ok(ppn));
            freed += 1;
        }
        freed
    }

    fn map_swappable(&self, va: VirtAddr, _ppn: PhysPageNum) {
        self.queue.borrow_mut().push_back(va);
    }

    fn swap_in<'a>(&self, mm: &'a MemoryManager, _root: PageTable, va: VirtAddr) -> MmResult<FrameTracker<'a>> {
        let addr = usize::from(va);
        // the copy on "disk" stays, other spaces may still refer to it
        let bytes = self
            .store
            .borrow()
            .get(&addr)
            .cloned()
            .ok_or(MmError::invalid(addr, addr + PAGE_SIZE))?;
        let frame = mm.alloc_frame()?;
        mm.write_frame(frame.ppn(), |b| b.copy_from_slice(&bytes));
        Ok(frame)
    }
}

/// `Rc` is not `SwapManager` itself; forward through a thin wrapper.
struct Shared(Rc<FifoSwap>);

impl SwapManager for Shared {
    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    fn swap_out(&self, mm: &MemoryManager, count: usize, hint: usize) -> usize {
        self.0.swap_out(mm, count, hint)
    }

    fn map_swappable(&self, va: VirtAddr, ppn: PhysPageNum) {
        self.0.map_swappable(va, ppn)
    }

    fn swap_in<'a>(&self, mm: &'a MemoryManager, root: PageTable, va: VirtAddr) -> MmResult<FrameTracker<'a>> {
        self.0.swap_in(mm, root, va)
    }
}

fn page(i: usize) -> VirtAddr {
    VirtAddr::from(USER_BASE + i * PAGE_SIZE)
}

#[test]
fn allocation_swaps_out_and_faults_swap_back_in() {
    // root, directory, leaf table and three data pages
    let (mm, _) = manager_with(AllocatorKind::FirstFit, FRAMES - 6);
    let swap = FifoSwap::new();
    mm.set_swap_manager(std::sync::Arc::new(Shared(swap.clone())));
    let mut space = MemorySet::new_bare(&mm).unwrap();
    swap.root.set(Some(space.page_table()));
    space
        .insert_framed_area(page(0), page(8), MapPermission::R | MapPermission::W)
        .unwrap();

    for i in 0..4 {
        space.handle_page_fault(page(i), PageFaultKind::Store).unwrap();
        let ppn = space.translate(page(i).floor()).unwrap().ppn();
        mm.write_frame(ppn, |b| b.fill(0x10 + i as u8));
        assert_eq!(mm.swap_link(ppn), Some(page(i)));
    }
    // the fourth page pushed the first one out
    let first = space.translate(page(0).floor()).unwrap();
    assert!(first.is_swapped());
    assert_eq!(mm.nr_free_pages(), 0);

    space.handle_page_fault(page(0), PageFaultKind::Load).unwrap();
    let back = space.translate(page(0).floor()).unwrap();
    assert!(back.is_valid());
    assert!(mm.read_frame(back.ppn(), |b| b.iter().all(|&x| x == 0x10)));
    assert_eq!(mm.page_ref(back.ppn()), 1);
    // and made room by evicting the next oldest
    assert!(space.translate(page(1).floor()).unwrap().is_swapped());
}

#[test]
fn retry_stops_when_nothing_can_be_swapped() {
    let (mm, _) = manager_with(AllocatorKind::FirstFit, FRAMES - 1);
    let swap = FifoSwap::new();
    mm.set_swap_manager(std::sync::Arc::new(Shared(swap.clone())));
    let held = mm.alloc_frame().unwrap();
    assert_eq!(mm.alloc_frame().unwrap_err(), MmError::OutOfMemory);
    assert_eq!(swap.swap_outs.get(), 1);
    // multi-frame requests never swap
    assert_eq!(mm.alloc_pages(2), None);
    assert_eq!(swap.swap_outs.get(), 1);
    drop(held);
}

#[test]
fn fork_reads_swapped_pages_back_for_the_child() {
    let (mm, _) = manager();
    let swap = FifoSwap::new();
    mm.set_swap_manager(std::sync::Arc::new(Shared(swap.clone())));
    let mut parent = MemorySet::new_bare(&mm).unwrap();
    swap.root.set(Some(parent.page_table()));
    parent
        .insert_framed_area(page(0), page(2), MapPermission::R | MapPermission::W)
        .unwrap();
    parent.handle_page_fault(page(0), PageFaultKind::Store).unwrap();
    let ppn = parent.translate(page(0).floor()).unwrap().ppn();
    mm.write_frame(ppn, |b| b.fill(0xab));
    assert_eq!(swap.swap_out(&mm, 1, 0), 1);
    assert!(parent.translate(page(0).floor()).unwrap().is_swapped());

    let child = MemorySet::from_existed_user(&parent).unwrap();
    let pte = child.translate(page(0).floor()).unwrap();
    assert!(pte.is_valid());
    assert_eq!(pte.perm(), pmm::PTEFlags::R | pmm::PTEFlags::W | pmm::PTEFlags::U);
    assert!(mm.read_frame(pte.ppn(), |b| b.iter().all(|&x| x == 0xab)));
    assert_eq!(mm.page_ref(pte.ppn()), 1);
    // the parent still has its own copy waiting in swap
    assert!(parent.translate(page(0).floor()).unwrap().is_swapped());

    parent.handle_page_fault(page(0), PageFaultKind::Load).unwrap();
    let back = parent.translate(page(0).floor()).unwrap();
    assert_ne!(back.ppn(), pte.ppn());
    assert!(mm.read_frame(back.ppn(), |b| b.iter().all(|&x| x == 0xab)));
}

#[test]
fn swapped_entry_without_swap_manager_is_an_invariant_violation() {
    let (mm, _) = manager();
    let mut space = MemorySet::new_bare(&mm).unwrap();
    space
        .insert_framed_area(page(0), page(1), MapPermission::R)
        .unwrap();
    space.handle_page_fault(page(0), PageFaultKind::Load).unwrap();
    mm.evict(space.page_table(), page(0), 0x100).unwrap();
    assert!(matches!(
        space.handle_page_fault(page(0), PageFaultKind::Load),
        Err(MmError::InvariantViolation(_))
    ));
    assert!(matches!(
        MemorySet::from_existed_user(&space),
        Err(MmError::InvariantViolation(_))
    ));
    // outside an area the page's permission is unknown
    let child = new_root(&mm);
    assert!(matches!(
        mm.copy_range(child, space.page_table(), usize::from(page(0)), usize::from(page(1))),
        Err(MmError::InvariantViolation(_))
    ));
}

#[test]
fn evict_rejects_entries_that_look_valid() {
    let (mm, _) = manager();
    let root = new_root(&mm);
    let ppn = mm
        .pgdir_alloc_page(root, page(0), pmm::PTEFlags::R | pmm::PTEFlags::U)
        .unwrap();
    assert!(mm.evict(root, page(0), 0x101).is_err());
    assert!(mm.evict(root, page(0), 0).is_err());
    assert!(mm.evict(root, page(1), 0x100).is_err());
    assert_eq!(mm.page_ref(ppn), 1);
}
