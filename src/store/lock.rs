use std::sync::{LockResult, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Unwraps a lock result, keeping the guard of a poisoned lock.
///
/// Store state is advisory, so a panic in another holder never takes the
/// cache down with it.
fn recover<G>(result: LockResult<G>, op: &'static str, lock_kind: &'static str) -> G {
    result.unwrap_or_else(|poisoned| {
        warn!(
            target: "cylinder_cache::store",
            op,
            lock_kind,
            result = "poisoned_recovered",
            "recovered from poisoned store lock"
        );
        poisoned.into_inner()
    })
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
    recover(mutex.lock(), op, "mutex")
}

pub(crate) fn read<'a, T>(rw: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
    recover(rw.read(), op, "rwlock.read")
}

pub(crate) fn write<'a, T>(rw: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
    recover(rw.write(), op, "rwlock.write")
}
