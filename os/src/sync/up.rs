use riscv::register::sstatus;

/// Wrap a static data structure inside it so that we are
/// able to share it without any `unsafe` at the use site.
///
/// We should only use it in uniprocessor. The wrapped value must keep its
/// own discipline for mutation (the memory manager masks interrupts around
/// every access it makes).
pub struct UPSafeCell<T> {
    /// inner data
    inner: T,
}

unsafe impl<T> Sync for UPSafeCell<T> {}

impl<T> UPSafeCell<T> {
    /// User is responsible to guarantee that inner struct is only used in
    /// uniprocessor.
    pub unsafe fn new(value: T) -> Self {
        Self { inner: value }
    }

    /// Shared reference to the wrapped value.
    pub fn get(&self) -> &T {
        &self.inner
    }
}

/// Clear the supervisor interrupt enable bit(sie), returning whether it was
/// set before.
pub fn intr_save() -> bool {
    let sie = sstatus::read().sie();
    if sie {
        unsafe {
            sstatus::clear_sie();
        }
    }
    sie
}

/// Set sie again if a matching [`intr_save`] found it set.
pub fn intr_restore(sie_before_masking: bool) {
    if sie_before_masking {
        unsafe {
            sstatus::set_sie();
        }
    }
}
