use std::cell::RefCell;

use super::object::release_object;
use crate::RawRef;

thread_local! {
    static POOLS: RefCell<Vec<Vec<RawRef>>> = const { RefCell::new(Vec::new()) };
}

/// Adds `raw` to the innermost pool on this thread. Returns false when no pool
/// is in place, in which case the count is leaked.
pub(crate) fn push(raw: RawRef) -> bool {
    POOLS.with(|pools| match pools.borrow_mut().last_mut() {
        Some(pool) => {
            pool.push(raw);
            true
        }
        None => false,
    })
}

pub(crate) fn depth() -> usize {
    POOLS.with(|pools| pools.borrow().len())
}

/// Keeps a pool open for its lifetime and drains it on drop, including during
/// unwinding.
pub(crate) struct PoolGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl PoolGuard {
    pub(crate) fn push() -> Self {
        POOLS.with(|pools| pools.borrow_mut().push(Vec::new()));
        PoolGuard { _not_send: std::marker::PhantomData }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        let drained = POOLS.with(|pools| pools.borrow_mut().pop()).unwrap_or_default();
        log::trace!("draining autorelease pool of {} objects", drained.len());
        // Release outside the borrow: destroying an object may autorelease more.
        for raw in drained.into_iter().rev() {
            // SAFETY: every pooled reference carries one count handed over by autorelease.
            unsafe { release_object(raw) };
        }
    }
}
