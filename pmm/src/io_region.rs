//! Memory-mapped I/O windows shared by every address space.

use crate::{MemoryManager, MmResult, PTEFlags, PageTable};

/// One MMIO window `[start, end)`, identity mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRegion {
    pub start: usize,
    pub end: usize,
}

impl IoRegion {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub const fn size(&self) -> usize {
        self.end - self.start
    }

    /// `[start, end)` shares at least one byte with this window.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end && self.start < end
    }
}

impl MemoryManager {
    /// Map every window of `regions` read/write at its own address.
    pub fn setup_io_mapping(&self, root: PageTable, regions: &[IoRegion]) -> MmResult<()> {
        for region in regions {
            self.map_segment(root, region.start, region.size(), region.start, PTEFlags::R | PTEFlags::W)?;
        }
        Ok(())
    }

    /// Undo [`MemoryManager::setup_io_mapping`], including the tables the
    /// windows needed.
    pub fn free_io_mapping(&self, root: PageTable, regions: &[IoRegion]) -> MmResult<()> {
        for region in regions {
            self.unmap_range_io(root, region.start, region.end)?;
        }
        for region in regions {
            self.exit_range(root, region.start, region.end, false)?;
        }
        Ok(())
    }
}
