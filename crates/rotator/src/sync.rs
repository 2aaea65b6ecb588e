//! Lock helpers shared by the in-memory state holders.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::warn;

/// Lock a mutex, recovering from poison if necessary.
///
/// Every structure guarded this way holds derived or advisory state
/// (breaker windows, metrics, caches); a slightly stale value is better than
/// panicking the request path.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("{what} mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("{what} lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("{what} lock was poisoned, recovering");
        poisoned.into_inner()
    })
}
