//! Implementation of [`MapArea`] and [`MemorySet`].

use crate::config::{user_access, PAGE_SIZE, PTE_PER_TABLE};
use crate::fault::PageFaultKind;
use crate::{
    MemoryManager, MmError, MmResult, PTEFlags, PageTable, PageTableEntry, PteSlot, StepByOne,
    VPNRange, VirtAddr, VirtPageNum,
};
use alloc::vec::Vec;

/// Expressing the address space of one process.
///
/// The upper half of the root is shared with the kernel table, the I/O
/// windows are mapped like in the kernel, and user memory is described by
/// areas whose pages are only populated when first touched (or when data is
/// pushed into them).
pub struct MemorySet<'a> {
    mm: &'a MemoryManager,
    page_table: PageTable,
    /// Virtual areas of the program, never overlapping.
    areas: Vec<MapArea>,
}

impl<'a> MemorySet<'a> {
    /// Creates a new address space with no user area.
    pub fn new_bare(mm: &'a MemoryManager) -> MmResult<Self> {
        let root = mm.alloc_frame()?.into_ppn();
        let page_table = PageTable::from_ppn(root);
        // from here on `Drop` gives the root and the I/O tables back
        let memory_set = Self {
            mm,
            page_table,
            areas: Vec::new(),
        };
        if let Some(kernel) = mm.kernel_root() {
            for index in PTE_PER_TABLE / 2..PTE_PER_TABLE {
                let pte = mm.read_pte(PteSlot::new(kernel.root_ppn(), index));
                mm.write_pte(PteSlot::new(root, index), pte);
            }
        }
        mm.setup_io_mapping(page_table, mm.io_regions())?;
        Ok(memory_set)
    }

    /// The value to write into `satp` to run in this address space.
    pub fn token(&self) -> usize {
        self.page_table.token()
    }

    pub fn page_table(&self) -> PageTable {
        self.page_table
    }

    pub fn areas(&self) -> &[MapArea] {
        &self.areas
    }

    /// Switch the MMU to this address space.
    pub fn activate(&self) {
        self.mm.activate(self.page_table);
    }

    /// Declare a user area. Its pages are mapped lazily by
    /// [`MemorySet::handle_page_fault`].
    ///
    /// The range is widened to page boundaries and must lie in the user
    /// window without touching another area or an I/O window.
    pub fn insert_framed_area(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
    ) -> MmResult<()> {
        self.push(MapArea::new(start_va, end_va, permission | MapPermission::U), None)
    }

    /// Declare a user area and fill it with `data` right away, starting at
    /// its first page.
    pub fn insert_framed_area_with_data(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
        data: &[u8],
    ) -> MmResult<()> {
        self.push(MapArea::new(start_va, end_va, permission | MapPermission::U), Some(data))
    }

    fn push(&mut self, map_area: MapArea, data: Option<&[u8]>) -> MmResult<()> {
        let (start, end) = (usize::from(map_area.start()), usize::from(map_area.end()));
        if !user_access(start, end)
            || self.areas.iter().any(|area| area.overlaps(&map_area))
            || self.mm.io_regions().iter().any(|io| io.overlaps(start, end))
        {
            return Err(MmError::invalid(start, end));
        }
        if let Some(data) = data {
            if data.len() > end - start {
                return Err(MmError::invalid(start, start + data.len()));
            }
            if let Err(e) = map_area.copy_data(self.mm, self.page_table, data) {
                map_area.unmap(self.mm, self.page_table)?;
                return Err(e);
            }
        }
        self.areas.push(map_area);
        Ok(())
    }

    /// Area covering `va`, if any.
    pub fn find_area(&self, va: VirtAddr) -> Option<&MapArea> {
        self.areas.iter().find(|area| area.vpn_range.contains(va.floor()))
    }

    /// Unmap and forget the area starting at `start_vpn`, returning its
    /// frames and any table left empty.
    pub fn remove_area_with_start_vpn(&mut self, start_vpn: VirtPageNum) -> MmResult<()> {
        let idx = self
            .areas
            .iter()
            .position(|area| area.vpn_range.get_start() == start_vpn)
            .ok_or_else(|| {
                let start = usize::from(VirtAddr::from(start_vpn));
                MmError::invalid(start, start + PAGE_SIZE)
            })?;
        let area = self.areas.remove(idx);
        area.unmap(self.mm, self.page_table)
    }

    /// Page-fault callback: make `va` accessible for `kind`, or report why
    /// the access is not allowed.
    pub fn handle_page_fault(&self, va: VirtAddr, kind: PageFaultKind) -> MmResult<()> {
        let start = usize::from(va);
        let area = self
            .find_area(va)
            .ok_or_else(|| MmError::invalid(start, start + 1))?;
        if !area.pte_flags().contains(kind.required()) {
            log::warn!("{:?} of {:?} not allowed by {:?}", kind, va, area.map_perm);
            return Err(MmError::invalid(start, start + 1));
        }
        self.mm
            .resolve_fault(self.page_table, va, kind, area.pte_flags())
    }

    /// Duplicate `user_space`: same areas, every populated page copied into
    /// a fresh frame.
    ///
    /// When copying runs out of memory, the half-built copy is dropped,
    /// which tears it down again.
    pub fn from_existed_user(user_space: &MemorySet<'a>) -> MmResult<Self> {
        let mm = user_space.mm;
        let mut memory_set = Self::new_bare(mm)?;
        for area in user_space.areas.iter() {
            let new_area = MapArea::from_another(area);
            let (start, end) = (new_area.start().into(), new_area.end().into());
            let perm = new_area.pte_flags();
            memory_set.areas.push(new_area);
            mm.copy_area(memory_set.page_table, user_space.page_table, start, end, perm)?;
        }
        Ok(memory_set)
    }

    /// Makes a copy of the page table entry and returns it if found, or None if not found.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        let slot = self.mm.locate(self.page_table, vpn.into(), false)?;
        Some(self.mm.read_pte(slot))
    }

    /// Unmap every area and free the tables they used. The address space
    /// itself (root, kernel half, I/O windows) stays usable.
    pub fn recycle_data_pages(&mut self) -> MmResult<()> {
        for area in self.areas.drain(..) {
            area.unmap(self.mm, self.page_table)?;
        }
        Ok(())
    }
}

impl Drop for MemorySet<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.recycle_data_pages() {
            log::error!("tearing down {:?}: {}", self.page_table, e);
        }
        if let Err(e) = self.mm.free_io_mapping(self.page_table, self.mm.io_regions()) {
            log::error!("tearing down {:?}: {}", self.page_table, e);
        }
        self.mm.put_frame(self.page_table.root_ppn());
    }
}

/// Contiguous virtual address (logical segment)
#[derive(Clone, Debug)]
pub struct MapArea {
    /// Describes a contiguous section of virtual page number
    /// and indicates the location and length of logical segment in the address section.
    vpn_range: VPNRange,
    /// A field that controls how the logical segment is accessed.
    map_perm: MapPermission,
}

impl MapArea {
    pub fn new(start_va: VirtAddr, end_va: VirtAddr, map_perm: MapPermission) -> Self {
        let start_vpn: VirtPageNum = start_va.floor();
        let end_vpn: VirtPageNum = end_va.ceil();
        Self {
            vpn_range: VPNRange::new(start_vpn, end_vpn),
            map_perm,
        }
    }

    pub fn from_another(another: &MapArea) -> Self {
        Self {
            vpn_range: VPNRange::new(another.vpn_range.get_start(), another.vpn_range.get_end()),
            map_perm: another.map_perm,
        }
    }

    pub fn start(&self) -> VirtAddr {
        self.vpn_range.get_start().into()
    }

    pub fn end(&self) -> VirtAddr {
        self.vpn_range.get_end().into()
    }

    fn overlaps(&self, other: &MapArea) -> bool {
        self.vpn_range.get_start() < other.vpn_range.get_end()
            && other.vpn_range.get_start() < self.vpn_range.get_end()
    }

    fn pte_flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.map_perm.bits())
    }

    /// Remove every mapping of this area and the tables left empty.
    fn unmap(&self, mm: &MemoryManager, page_table: PageTable) -> MmResult<()> {
        let (start, end): (usize, usize) = (self.start().into(), self.end().into());
        mm.unmap_range(page_table, start, end)?;
        mm.reclaim_empty_tables(page_table, start, end)
    }

    /// Map the pages `data` covers, from the first page of the area on, and
    /// copy `data` into them.
    ///
    /// data: start-aligned but maybe with shorter length
    fn copy_data(&self, mm: &MemoryManager, page_table: PageTable, data: &[u8]) -> MmResult<()> {
        let mut current_vpn = self.vpn_range.get_start();
        for chunk in data.chunks(PAGE_SIZE) {
            let ppn = mm.pgdir_alloc_page(page_table, current_vpn.into(), self.pte_flags())?;
            mm.write_frame(ppn, |dst| dst[..chunk.len()].copy_from_slice(chunk));
            current_vpn.step();
        }
        Ok(())
    }
}

bitflags! {
    /// A subset of the page table entry flags PTEFlags, leaving only the U/R/W/X flags.
    ///
    /// - The other flags are only concerned with details of the hardware address translation mechanism,
    ///   thus avoiding the introduction of incorrect flags.
    pub struct MapPermission: u8 {
        /// Readable
        const R = 1 << 1;
        /// Writable
        const W = 1 << 2;
        /// Executable
        const X = 1 << 3;
        /// User:
        /// - Controls whether access to the corresponding virtual page indexed
        ///   in this page table entry is allowed or not when the CPU has U privilege.
        const U = 1 << 4;
    }
}
