//! Page geometry and fixed address windows

/// 4096byte == 4KiB
pub const PAGE_SIZE: usize = 0x1000;
/// Bit width of intra-page offset
pub const PAGE_SIZE_BITS: usize = 0xc;
/// Entries in one table of any level (8 bytes each, one page per table).
pub const PTE_PER_TABLE: usize = PAGE_SIZE / core::mem::size_of::<usize>();
/// Bytes mapped by one leaf table: 512 * 4KiB = 2MiB
pub const TABLE_SPAN: usize = PAGE_SIZE * PTE_PER_TABLE;
/// Bytes mapped by one level-0 directory: 512 * 2MiB = 1GiB
pub const DIRECTORY_SPAN: usize = TABLE_SPAN * PTE_PER_TABLE;

/// Lowest address a user area may start at.
pub const USER_BASE: usize = 0x0020_0000;
/// One past the highest user address.
pub const USER_TOP: usize = 0x8000_0000;

/// Scratch address used by the bootstrap self-tests.
///
/// It lies in the fourth gigabyte, which neither the boot table nor the
/// refined kernel table ever maps.
pub const SELF_TEST_VA: usize = 0xC000_0000;

/// `[start, end)` is a non-empty range inside the user window.
pub fn user_access(start: usize, end: usize) -> bool {
    USER_BASE <= start && start < end && end <= USER_TOP
}

/// Round `addr` down to a multiple of `align` (a power of two).
pub const fn round_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Round `addr` up to a multiple of `align` (a power of two).
pub const fn round_up(addr: usize, align: usize) -> usize {
    round_down(addr + align - 1, align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_follow_sv39_geometry() {
        assert_eq!(PTE_PER_TABLE, 512);
        assert_eq!(TABLE_SPAN, 2 << 20);
        assert_eq!(DIRECTORY_SPAN, 1 << 30);
    }

    #[test]
    fn user_window_bounds() {
        assert!(user_access(USER_BASE, USER_BASE + PAGE_SIZE));
        assert!(user_access(USER_BASE, USER_TOP));
        assert!(!user_access(0, PAGE_SIZE));
        assert!(!user_access(USER_BASE, USER_TOP + PAGE_SIZE));
        assert!(!user_access(USER_BASE, USER_BASE));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(0x2345, PAGE_SIZE), 0x2000);
        assert_eq!(round_up(0x2345, PAGE_SIZE), 0x3000);
        assert_eq!(round_up(0x3000, PAGE_SIZE), 0x3000);
        assert_eq!(round_down(0x0030_1000, TABLE_SPAN), 0x0020_0000);
    }
}
