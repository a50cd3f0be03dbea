//! Implementation of [`FrameAllocator`] strategies which
//! hand out runs of physical frames.
//!
//! The manager only relies on the trait: a strategy never returns a frame
//! that is already handed out, and `dealloc` puts a run back exactly as it
//! was allocated. Everything else (fit policy, merging) is the strategy's
//! own business.

use crate::PhysPageNum;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

/// A pluggable strategy for allocating contiguous runs of frames.
pub trait FrameAllocator {
    /// Name printed at boot.
    fn name(&self) -> &'static str;
    /// Add the free run `[base, base + count)` to the pool.
    fn init_memmap(&mut self, base: PhysPageNum, count: usize);
    /// First frame of a free run of `count` frames, if any.
    fn alloc(&mut self, count: usize) -> Option<PhysPageNum>;
    /// Return a run previously obtained from `alloc(count)`.
    fn dealloc(&mut self, base: PhysPageNum, count: usize);
    /// Frames currently free.
    fn free_count(&self) -> usize;
}

/// Strategy selected at bootstrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AllocatorKind {
    #[default]
    FirstFit,
    Buddy,
}

impl AllocatorKind {
    pub fn build(self) -> Box<dyn FrameAllocator> {
        match self {
            Self::FirstFit => Box::new(FirstFitAllocator::new()),
            Self::Buddy => Box::new(BuddyFrameAllocator::new()),
        }
    }
}

/// First-fit over free runs kept in address order.
///
/// A freed run is merged with the runs directly before and after it, so the
/// map always holds maximal runs.
pub struct FirstFitAllocator {
    /// start ppn -> run length
    free: BTreeMap<usize, usize>,
    nr_free: usize,
    /// Lowest and one-past-highest frame ever handed to `init_memmap`.
    bounds: Option<(usize, usize)>,
}

impl FirstFitAllocator {
    pub fn new() -> Self {
        Self {
            free: BTreeMap::new(),
            nr_free: 0,
            bounds: None,
        }
    }

    /// Free runs as `(start, len)`, in address order.
    pub fn runs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free.iter().map(|(&start, &len)| (start, len))
    }

    /// Insert a run, merging with its neighbours.
    ///
    /// # Panic
    ///
    /// The run must not overlap any free run; overlapping means a frame is
    /// being freed twice.
    fn insert_run(&mut self, mut start: usize, mut len: usize) {
        let end = start + len;
        if let Some((&prev, &prev_len)) = self.free.range(..=start).next_back() {
            if prev + prev_len > start {
                panic!("Frame ppn={:#x} has not been allocated!", start);
            }
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some((&next, &next_len)) = self.free.range(start + 1..).next() {
            if next < end {
                panic!("Frame ppn={:#x} has not been allocated!", next);
            }
            if next == end {
                self.free.remove(&next);
                len += next_len;
            }
        }
        self.free.insert(start, len);
    }
}

impl Default for FirstFitAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for FirstFitAllocator {
    fn name(&self) -> &'static str {
        "first_fit_pmm_manager"
    }

    fn init_memmap(&mut self, base: PhysPageNum, count: usize) {
        assert!(count > 0);
        let (lo, hi) = self.bounds.unwrap_or((base.0, base.0 + count));
        self.bounds = Some((lo.min(base.0), hi.max(base.0 + count)));
        self.insert_run(base.0, count);
        self.nr_free += count;
    }

    fn alloc(&mut self, count: usize) -> Option<PhysPageNum> {
        assert!(count > 0);
        if count > self.nr_free {
            return None;
        }
        let (start, len) = self.runs().find(|&(_, len)| len >= count)?;
        self.free.remove(&start);
        if len > count {
            self.free.insert(start + count, len - count);
        }
        self.nr_free -= count;
        Some(PhysPageNum(start))
    }

    fn dealloc(&mut self, base: PhysPageNum, count: usize) {
        assert!(count > 0);
        match self.bounds {
            Some((lo, hi)) if lo <= base.0 && base.0 + count <= hi => {}
            _ => panic!("Frame ppn={:#x} has not been allocated!", base.0),
        }
        self.insert_run(base.0, count);
        self.nr_free += count;
    }

    fn free_count(&self) -> usize {
        self.nr_free
    }
}

/// Buddy system strategy backed by `buddy_system_allocator`.
///
/// Requests are rounded up to a power of two, so the free count is kept in
/// rounded units as well.
pub struct BuddyFrameAllocator {
    inner: buddy_system_allocator::FrameAllocator,
    nr_free: usize,
}

impl BuddyFrameAllocator {
    pub fn new() -> Self {
        Self {
            inner: buddy_system_allocator::FrameAllocator::new(),
            nr_free: 0,
        }
    }
}

impl Default for BuddyFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for BuddyFrameAllocator {
    fn name(&self) -> &'static str {
        "buddy_pmm_manager"
    }

    fn init_memmap(&mut self, base: PhysPageNum, count: usize) {
        self.inner.add_frame(base.0, base.0 + count);
        self.nr_free += count;
    }

    fn alloc(&mut self, count: usize) -> Option<PhysPageNum> {
        let start = self.inner.alloc(count)?;
        self.nr_free -= count.next_power_of_two();
        Some(PhysPageNum(start))
    }

    fn dealloc(&mut self, base: PhysPageNum, count: usize) {
        self.inner.dealloc(base.0, count);
        self.nr_free += count.next_power_of_two();
    }

    fn free_count(&self) -> usize {
        self.nr_free
    }
}
