use thiserror::Error;

/// ucore error numbers, returned negated to callers that speak errno.
const E_INVAL: isize = 3;
const E_NO_MEM: isize = 4;
const E_UNSPECIFIED: isize = 1;

/// Failures of the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmError {
    /// Frame allocation failed and swapping did not free anything.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The range is not permitted for this address space (or not page aligned).
    #[error("address range [{start:#x}, {end:#x}) is not permitted")]
    InvalidAddress { start: usize, end: usize },
    /// A bootstrap check found the tables or counters in an impossible state.
    #[error("memory invariant violated: {0}")]
    InvariantViolation(&'static str),
}

impl MmError {
    pub fn invalid(start: usize, end: usize) -> Self {
        Self::InvalidAddress { start, end }
    }

    /// Negative error code in the kernel's syscall convention.
    pub fn errno(&self) -> isize {
        match self {
            Self::OutOfMemory => -E_NO_MEM,
            Self::InvalidAddress { .. } => -E_INVAL,
            Self::InvariantViolation(_) => -E_UNSPECIFIED,
        }
    }
}

pub type MmResult<T> = Result<T, MmError>;

/// Fail the current check with `msg` unless `cond` holds.
pub(crate) fn ensure(cond: bool, msg: &'static str) -> MmResult<()> {
    if cond {
        Ok(())
    } else {
        Err(MmError::InvariantViolation(msg))
    }
}
