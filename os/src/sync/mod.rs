//! Synchronization for a uniprocessor kernel

mod up;

pub use up::{intr_restore, intr_save, UPSafeCell};
