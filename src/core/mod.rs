//! Core constants, error types and the device contract.

mod constants;
mod error;
mod traits;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use constants::*;
pub use error::*;
pub use traits::Device;

/// Lock a mutex, recovering the guard if a holder panicked.
///
/// Every mutex in this crate guards plain data that is never left half
/// updated, so a poisoned lock is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
