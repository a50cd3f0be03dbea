//! Page-table walker and the mapping operations built on it.
//!
//! Every mutation of a leaf entry that points at a tracked frame goes
//! through [`MemoryManager::insert`] or the private `remove_pte`, which keep
//! the frame's reference count equal to the number of leaves pointing at it.

use crate::config::{
    round_down, user_access, DIRECTORY_SPAN, PAGE_SIZE, PTE_PER_TABLE, TABLE_SPAN,
};
use crate::page_table::next_perm_run;
use crate::{
    MemoryManager, MmError, MmResult, PTEFlags, PageTable, PageTableEntry, PhysAddr, PhysPageNum,
    PteSlot, VirtAddr,
};
use core::fmt::{self, Display, Formatter};

impl MemoryManager {
    pub fn read_pte(&self, slot: PteSlot) -> PageTableEntry {
        self.exclusive_session(|inner| inner.memory.frame(slot.table).entries()[slot.index])
    }

    pub(crate) fn write_pte(&self, slot: PteSlot, pte: PageTableEntry) {
        self.exclusive_session(|inner| {
            inner.memory.frame_mut(slot.table).entries_mut()[slot.index] = pte;
        });
    }

    /// A copy of all 512 entries of `table`.
    pub(crate) fn read_table(&self, table: PhysPageNum) -> [PageTableEntry; PTE_PER_TABLE] {
        self.exclusive_session(|inner| *inner.memory.frame(table).entries())
    }

    /// Find the leaf slot for `va` under `root`.
    ///
    /// With `create`, a missing intermediate table is allocated, zeroed,
    /// given one reference and installed as `U | V`. Returns `None` when a
    /// level is missing and `create` is false, or when allocating a table
    /// fails. In the latter case a directory installed by this same call is
    /// taken out again, so a failed walk leaves the tables as it found them.
    pub fn locate(&self, root: PageTable, va: VirtAddr, create: bool) -> Option<PteSlot> {
        let idxs = va.floor().indexes();
        let mut table = root.root_ppn();
        let mut installed: Option<(PteSlot, PhysPageNum)> = None;
        for &idx in &idxs[..2] {
            let slot = PteSlot::new(table, idx);
            let pte = self.read_pte(slot);
            if pte.is_valid() {
                table = pte.ppn();
                continue;
            }
            if !create {
                return None;
            }
            let Ok(frame) = self.alloc_frame() else {
                if let Some((parent, directory)) = installed {
                    self.write_pte(parent, PageTableEntry::empty());
                    self.put_frame(directory);
                    log::debug!("table {:?} rolled back from {:?}", directory, parent);
                }
                return None;
            };
            let ppn = frame.into_ppn();
            self.write_pte(slot, PageTableEntry::new(ppn, PTEFlags::U | PTEFlags::V));
            log::debug!("table {:?} installed at {:?} for {:?}", ppn, slot, va);
            installed = Some((slot, ppn));
            table = ppn;
        }
        Some(PteSlot::new(table, idxs[2]))
    }

    /// Frame mapped at `va`, together with the leaf slot holding it.
    pub fn get_page(&self, root: PageTable, va: VirtAddr) -> Option<(PhysPageNum, PteSlot)> {
        let slot = self.locate(root, va, false)?;
        let pte = self.read_pte(slot);
        pte.is_valid().then(|| (pte.ppn(), slot))
    }

    pub fn translate(&self, root: PageTable, va: VirtAddr) -> Option<PhysAddr> {
        self.get_page(root, va).map(|(ppn, _)| {
            let pa: PhysAddr = ppn.into();
            PhysAddr(pa.0 + va.page_offset())
        })
    }

    /// Map `ppn` at `va` with `perm`.
    ///
    /// The new reference is taken before the old entry is looked at, so
    /// mapping a frame again at the address it already occupies never lets
    /// its count touch zero.
    pub fn insert(&self, root: PageTable, ppn: PhysPageNum, va: VirtAddr, perm: PTEFlags) -> MmResult<()> {
        let slot = self.locate(root, va, true).ok_or_else(|| {
            log::warn!("insert {:?}: no memory for page tables", va);
            MmError::OutOfMemory
        })?;
        self.get_frame(ppn);
        let old = self.read_pte(slot);
        if old.is_valid() {
            if old.ppn() == ppn {
                self.put_frame(ppn);
            } else {
                self.remove_pte(va, slot);
            }
        }
        self.write_pte(slot, PageTableEntry::new(ppn, perm | PTEFlags::V));
        self.platform().invalidate_page(va);
        Ok(())
    }

    /// Unmap `va`. Does nothing when no valid mapping exists.
    pub fn remove(&self, root: PageTable, va: VirtAddr) {
        if let Some(slot) = self.locate(root, va, false) {
            self.remove_pte(va, slot);
        }
    }

    fn remove_pte(&self, va: VirtAddr, slot: PteSlot) {
        let pte = self.read_pte(slot);
        if !pte.is_valid() {
            return;
        }
        self.put_frame(pte.ppn());
        self.write_pte(slot, PageTableEntry::empty());
        self.platform().invalidate_page(va);
    }

    /// Remove every mapping in the user range `[start, end)`.
    pub fn unmap_range(&self, root: PageTable, start: usize, end: usize) -> MmResult<()> {
        check_user_range(start, end)?;
        self.for_each_slot(root, start, end, |va, slot| self.remove_pte(va, slot));
        Ok(())
    }

    /// Clear the entries of an I/O window. The frames behind them are
    /// device memory, so no count is touched.
    pub fn unmap_range_io(&self, root: PageTable, start: usize, end: usize) -> MmResult<()> {
        check_aligned(start, end)?;
        self.for_each_slot(root, start, end, |va, slot| {
            if !self.read_pte(slot).is_empty() {
                self.write_pte(slot, PageTableEntry::empty());
                self.platform().invalidate_page(va);
            }
        });
        Ok(())
    }

    /// Call `f` on the leaf slot of every page in `[start, end)` whose leaf
    /// table exists, jumping a whole table span where it does not.
    fn for_each_slot(&self, root: PageTable, start: usize, end: usize, mut f: impl FnMut(VirtAddr, PteSlot)) {
        let mut va = start;
        while va < end {
            let next = match self.locate(root, VirtAddr::from(va), false) {
                Some(slot) => {
                    f(VirtAddr::from(va), slot);
                    va.checked_add(PAGE_SIZE)
                }
                None => va.checked_add(TABLE_SPAN).map(|v| round_down(v, TABLE_SPAN)),
            };
            match next {
                Some(next) => va = next,
                None => break,
            }
        }
    }

    /// Give back the page tables left empty under the user range
    /// `[start, end)`: first each leaf table, then the directory above it.
    pub fn reclaim_empty_tables(&self, root: PageTable, start: usize, end: usize) -> MmResult<()> {
        self.exit_range(root, start, end, true)
    }

    pub(crate) fn exit_range(&self, root: PageTable, start: usize, end: usize, check: bool) -> MmResult<()> {
        if check {
            check_user_range(start, end)?;
        } else {
            check_aligned(start, end)?;
        }
        let mut d1start = round_down(start, DIRECTORY_SPAN);
        let mut d0start = round_down(start, TABLE_SPAN);
        loop {
            let root_slot = PteSlot::new(root.root_ppn(), VirtAddr::from(d1start).floor().indexes()[0]);
            let pde1 = self.read_pte(root_slot);
            if pde1.is_valid() {
                let directory = pde1.ppn();
                let d1last = d1start.saturating_add(DIRECTORY_SPAN - 1);
                loop {
                    let slot = PteSlot::new(directory, VirtAddr::from(d0start).floor().indexes()[1]);
                    let pde0 = self.read_pte(slot);
                    if pde0.is_valid() {
                        self.try_free_table(pde0.ppn(), slot);
                    }
                    match d0start.checked_add(TABLE_SPAN) {
                        Some(next) if next <= d1last && next < end => d0start = next,
                        _ => break,
                    }
                }
                self.try_free_table(directory, root_slot);
            }
            match d1start.checked_add(DIRECTORY_SPAN) {
                Some(next) if next < end => {
                    d1start = next;
                    d0start = next;
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Free `table` and clear `parent` if no entry of `table` is valid.
    fn try_free_table(&self, table: PhysPageNum, parent: PteSlot) {
        let in_use = self.exclusive_session(|inner| {
            inner.memory.frame(table).entries().iter().any(PageTableEntry::is_valid)
        });
        if in_use {
            return;
        }
        self.write_pte(parent, PageTableEntry::empty());
        self.put_frame(table);
        log::debug!("table {:?} reclaimed from {:?}", table, parent);
    }

    /// Duplicate every mapped page of `[start, end)` from `src` into `dst`.
    ///
    /// Each page gets a fresh frame with the same contents and the same
    /// user permission bits. On failure `dst` keeps whatever was copied so
    /// far; tearing it down is up to the caller.
    ///
    /// A swapped-out source page carries no permission bits, so it can only
    /// be copied through [`MemorySet`](crate::MemorySet), which knows the
    /// area it belongs to. Here it fails with `InvariantViolation`.
    pub fn copy_range(&self, dst: PageTable, src: PageTable, start: usize, end: usize) -> MmResult<()> {
        self.copy_pages(dst, src, start, end, None)
    }

    /// [`MemoryManager::copy_range`] for one area mapped with `perm`.
    /// Swapped-out pages are read back through the swap manager into a
    /// fresh frame of `dst`; the source entry stays swapped.
    pub(crate) fn copy_area(&self, dst: PageTable, src: PageTable, start: usize, end: usize, perm: PTEFlags) -> MmResult<()> {
        self.copy_pages(dst, src, start, end, Some(perm))
    }

    fn copy_pages(
        &self,
        dst: PageTable,
        src: PageTable,
        start: usize,
        end: usize,
        swapped_perm: Option<PTEFlags>,
    ) -> MmResult<()> {
        check_user_range(start, end)?;
        let mut va = start;
        while va < end {
            let Some(slot) = self.locate(src, VirtAddr::from(va), false) else {
                va = round_down(va + TABLE_SPAN, TABLE_SPAN);
                continue;
            };
            let pte = self.read_pte(slot);
            let page = VirtAddr::from(va);
            if pte.is_valid() {
                let frame = self.alloc_frame()?;
                self.exclusive_session(|inner| inner.memory.copy_frame(frame.ppn(), pte.ppn()));
                self.insert(dst, frame.ppn(), page, pte.perm())?;
            } else if pte.is_swapped() {
                let perm = swapped_perm
                    .ok_or(MmError::InvariantViolation("swapped page copied without its area"))?;
                let swap = self
                    .swap_manager()
                    .ok_or(MmError::InvariantViolation("swapped entry without a swap manager"))?;
                let frame = swap.swap_in(self, src, page)?;
                self.insert(dst, frame.ppn(), page, perm)?;
                log::debug!("{:?} copied from swap into {:?}", page, frame.ppn());
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Allocate a zeroed frame and map it at `va`.
    ///
    /// When a swap manager is ready the frame is registered with it as
    /// swappable and remembers `va` as its swap linkage.
    pub fn pgdir_alloc_page(&self, root: PageTable, va: VirtAddr, perm: PTEFlags) -> MmResult<PhysPageNum> {
        let frame = self.alloc_frame()?;
        self.insert(root, frame.ppn(), va, perm)?;
        let ppn = frame.ppn();
        drop(frame);
        if let Some(swap) = self.swap_manager() {
            swap.map_swappable(va, ppn);
            self.set_swap_link(ppn, Some(va));
        }
        debug_assert_eq!(self.page_ref(ppn), 1);
        Ok(ppn)
    }

    /// Linearly map `[va, va + size)` onto `pa` without touching any
    /// reference count. Used for the kernel image and I/O windows.
    pub fn map_segment(&self, root: PageTable, va: usize, size: usize, pa: usize, perm: PTEFlags) -> MmResult<()> {
        if VirtAddr::from(va).page_offset() != PhysAddr::from(pa).page_offset() {
            return Err(MmError::invalid(va, va.wrapping_add(size)));
        }
        let offset = VirtAddr::from(va).page_offset();
        let pages = (size + offset + PAGE_SIZE - 1) / PAGE_SIZE;
        let (va, pa) = (va - offset, pa - offset);
        for i in 0..pages {
            let page_va = VirtAddr::from(va.wrapping_add(i * PAGE_SIZE));
            let slot = self.locate(root, page_va, true).ok_or(MmError::OutOfMemory)?;
            let ppn = PhysAddr::from(pa + i * PAGE_SIZE).floor();
            self.write_pte(slot, PageTableEntry::new(ppn, perm | PTEFlags::V));
        }
        Ok(())
    }

    /// Log the tables under `root` as runs of entries with equal
    /// permissions, one indentation step per level.
    pub fn print_pgdir(&self, root: PageTable) {
        log::info!("-------------------- BEGIN --------------------");
        self.dump_table(root.root_ppn(), 2, 0);
        log::info!("--------------------- END ---------------------");
    }

    fn dump_table(&self, table: PhysPageNum, level: usize, base: usize) {
        const LABELS: [&str; 3] = ["PTE", "PDE0", "PDE1"];
        let entries = self.read_table(table);
        let span = PAGE_SIZE << (9 * level);
        let mut start = 0;
        while let Some((left, right, perm)) = next_perm_run(&entries, start, PTE_PER_TABLE) {
            log::info!(
                "{:indent$}{}({:03x}) {:#018x}-{:#018x} {:#010x} {}",
                "",
                LABELS[level],
                right - left,
                usize::from(VirtAddr(base + left * span)),
                usize::from(VirtAddr(base + right * span)),
                (right - left) * span,
                PermDisplay(perm),
                indent = (2 - level) * 2,
            );
            if level > 0 {
                for (i, pte) in entries.iter().enumerate().take(right).skip(left) {
                    if !(pte.readable() || pte.writable() || pte.executable()) {
                        self.dump_table(pte.ppn(), level - 1, base + i * span);
                    }
                }
            }
            start = right;
        }
    }
}

fn check_aligned(start: usize, end: usize) -> MmResult<()> {
    if start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 {
        return Err(MmError::invalid(start, end));
    }
    Ok(())
}

fn check_user_range(start: usize, end: usize) -> MmResult<()> {
    check_aligned(start, end)?;
    if !user_access(start, end) {
        return Err(MmError::invalid(start, end));
    }
    Ok(())
}

/// `urwx` with `-` for missing bits.
struct PermDisplay(PTEFlags);

impl Display for PermDisplay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (flag, c) in [
            (PTEFlags::U, 'u'),
            (PTEFlags::R, 'r'),
            (PTEFlags::W, 'w'),
            (PTEFlags::X, 'x'),
        ] {
            f.write_fmt(format_args!("{}", if self.0.contains(flag) { c } else { '-' }))?;
        }
        Ok(())
    }
}
