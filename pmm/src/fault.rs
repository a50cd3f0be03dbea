//! Resolution of user page faults.

use crate::{MemoryManager, MmError, MmResult, PTEFlags, PageTable, VirtAddr};

/// The access that trapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFaultKind {
    Load,
    Store,
    Instruction,
}

impl PageFaultKind {
    /// Permission bit the faulting access needs.
    pub fn required(self) -> PTEFlags {
        match self {
            Self::Load => PTEFlags::R,
            Self::Store => PTEFlags::W,
            Self::Instruction => PTEFlags::X,
        }
    }
}

impl MemoryManager {
    /// Make the page holding `va` accessible for `kind`.
    ///
    /// The caller has already checked that an area allowing `kind` covers
    /// `va`; `perm` is the permission that area maps pages with.
    ///
    /// - an empty entry gets a fresh zeroed frame,
    /// - a swapped entry is brought back through the swap manager,
    /// - a valid entry that allows the access only had a stale translation.
    pub(crate) fn resolve_fault(
        &self,
        root: PageTable,
        va: VirtAddr,
        kind: PageFaultKind,
        perm: PTEFlags,
    ) -> MmResult<()> {
        let page: VirtAddr = va.floor().into();
        let slot = self.locate(root, page, true).ok_or(MmError::OutOfMemory)?;
        let pte = self.read_pte(slot);
        if pte.is_empty() {
            self.pgdir_alloc_page(root, page, perm)?;
        } else if pte.is_swapped() {
            let swap = self
                .swap_manager()
                .ok_or(MmError::InvariantViolation("swapped entry without a swap manager"))?;
            let frame = swap.swap_in(self, root, page)?;
            self.insert(root, frame.ppn(), page, perm)?;
            swap.map_swappable(page, frame.ppn());
            self.set_swap_link(frame.ppn(), Some(page));
        } else if pte.flags().contains(kind.required()) {
            self.platform().invalidate_page(page);
        } else {
            let start = usize::from(page);
            return Err(MmError::invalid(start, start + crate::config::PAGE_SIZE));
        }
        log::trace!("{:?} fault at {:?} resolved", kind, va);
        Ok(())
    }
}
