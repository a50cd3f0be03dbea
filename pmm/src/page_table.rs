//! ## A page table entry(64bit) in SV39 paging mode

use crate::config::PTE_PER_TABLE;
use crate::PhysPageNum;
use bitflags::*;

bitflags! {
    pub struct PTEFlags: u8 {
        /// Valid:
        /// - A page table entry is legal only if bit `V` is 1.
        const V = 1 << 0;
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
        /// Global
        const G = 1 << 5;
        /// Accessed:
        /// - The processor records whether the virtual page corresponding to the page table entry
        ///   has been accessed since this bit on the page table entry was cleared.
        const A = 1 << 6;
        /// Dirty:
        /// - Indicates that a virtual page has been written since the last time the `D` bit was cleared.
        const D = 1 << 7;
    }
}

impl PTEFlags {
    /// The bits a mapping carries over when it is copied to another space.
    pub const USER: Self = Self {
        bits: Self::R.bits | Self::W.bits | Self::X.bits | Self::U.bits,
    };
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
///
/// # Page table entry(64bit)
///
/// | Bit number  |63------54|53------28|27------19|18------10|9---8| 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
/// |-------------|----------|----------|----------|----------|-----|---|---|---|---|---|---|---|---|
/// | Bit meaning | Reserved | PPN\[2\] | PPN\[1\] | PPN\[0\] | RSW | D | A | G | U | X | W | R | V |
/// | Bit width   |    10    |    26    |     9    |     9    |  2  | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 |
///
/// With `V` set and `R`/`W`/`X` clear the PPN names the next-level table.
///
/// An entry that is not valid but not zero either holds a swap entry: the
/// frame was written out and the bits belong to the swap subsystem.
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    pub fn empty() -> Self {
        PageTableEntry { bits: 0 }
    }

    ///  get Physical Page Number.
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    /// Permission bits without `V` and the hardware-maintained `A`/`D`.
    pub fn perm(&self) -> PTEFlags {
        self.flags() & PTEFlags::USER
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// true if `V` flag is 1, false if it is 0.
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    /// Not valid, but still carrying swap bits.
    pub fn is_swapped(&self) -> bool {
        !self.is_valid() && !self.is_empty()
    }

    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }

    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }

    pub fn user(&self) -> bool {
        self.flags().contains(PTEFlags::U)
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PTE")
            .field("ppn", &self.ppn())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Where a walk ended: entry `index` of the table in frame `table`.
///
/// The walker hands these out instead of pointers; reading and writing
/// goes through the manager, which owns access to physical memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PteSlot {
    pub table: PhysPageNum,
    pub index: usize,
}

impl PteSlot {
    pub fn new(table: PhysPageNum, index: usize) -> Self {
        debug_assert!(index < PTE_PER_TABLE);
        Self { table, index }
    }
}

/// # Page table
///
/// Each address space is known by the frame of its root table. The handle
/// is plain data: the tables themselves are frames owned through the
/// registry, and the mapping operations of the manager work on them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageTable {
    root_ppn: PhysPageNum,
}

impl PageTable {
    pub fn from_ppn(root_ppn: PhysPageNum) -> Self {
        Self { root_ppn }
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// The satp value selecting SV39 mode (8 << 60) with this root.
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }
}

/// Find the next run of valid entries sharing the same user permission in
/// `table[start..right]`.
///
/// Returns `(left, right, perm)` of the run, or `None` when no valid entry
/// is left.
pub(crate) fn next_perm_run(
    table: &[PageTableEntry],
    mut start: usize,
    right: usize,
) -> Option<(usize, usize, PTEFlags)> {
    while start < right && !table[start].is_valid() {
        start += 1;
    }
    if start >= right {
        return None;
    }
    let left = start;
    let perm = table[start].perm();
    start += 1;
    while start < right && table[start].is_valid() && table[start].perm() == perm {
        start += 1;
    }
    Some((left, start, perm))
}
