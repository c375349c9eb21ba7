//! Reference Bridge: the only code that changes foreign reference counts.
//!
//! Every non-empty [`BridgedHandle`] owns exactly one foreign count and is
//! backed by a slot in a generation-tagged slab. Releasing a handle removes
//! its slot; a second release of the same handle finds its key no longer
//! resolves and fails with [`BridgeError::DoubleRelease`] without ever
//! touching the foreign runtime.
//!
//! Owned handles are also tracked by key so that whatever the host never
//! released can be released when the bridge shuts down.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use objbridge_foreign::{ForeignRuntime, RawRef};
use parking_lot::Mutex;
use sharded_slab::Slab;

use crate::error::{BridgeError, BridgeResult};
use crate::lifetime::Scope;

/// Who is responsible for the count a handle carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    /// The bridge retained on wrap; the count is dropped when the wrapping
    /// scope exits.
    Borrowed,
    /// The host owns the count and must release it (or transfer it) exactly once.
    Owned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nullability {
    NonNull,
    Nullable,
}

impl Nullability {
    pub fn from_nullable(nullable: bool) -> Self {
        if nullable {
            Nullability::Nullable
        } else {
            Nullability::NonNull
        }
    }
}

#[derive(Debug)]
struct HandleRecord {
    raw: RawRef,
    ownership: Ownership,
}

/// Host-side reference to a foreign object.
///
/// Two handles over the same foreign object compare unequal; use
/// [`BridgedHandle::same_reference`] to compare the objects themselves.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BridgedHandle {
    raw: RawRef,
    ownership: Ownership,
    key: Option<usize>,
}

impl BridgedHandle {
    /// The handle a null reference reads back as.
    pub fn empty() -> Self {
        BridgedHandle { raw: RawRef::NULL, ownership: Ownership::Borrowed, key: None }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// The address this handle was created for. Not validated; use
    /// [`ReferenceBridge::raw`] before dereferencing.
    pub fn address(&self) -> RawRef {
        self.raw
    }

    pub fn same_reference(&self, other: &BridgedHandle) -> bool {
        self.raw == other.raw
    }

    pub(crate) fn key(&self) -> Option<usize> {
        self.key
    }
}

impl fmt::Debug for BridgedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            None => write!(f, "BridgedHandle(empty)"),
            Some(key) => write!(f, "BridgedHandle({:?}, {:?}, key {:#x})", self.raw, self.ownership, key),
        }
    }
}

/// Owned handles whose host owner went away, waiting to be released.
pub(crate) enum ReclaimMsg {
    Release(BridgedHandle),
}

pub struct ReferenceBridge {
    runtime: Arc<dyn ForeignRuntime>,
    handles: Slab<HandleRecord>,
    live: AtomicUsize,
    owned: Mutex<HashSet<usize>>,
    reclaim_tx: Sender<ReclaimMsg>,
    reclaim_rx: Receiver<ReclaimMsg>,
}

impl ReferenceBridge {
    pub fn new(runtime: Arc<dyn ForeignRuntime>) -> Self {
        let (reclaim_tx, reclaim_rx) = channel::unbounded();
        ReferenceBridge {
            runtime,
            handles: Slab::new(),
            live: AtomicUsize::new(0),
            owned: Mutex::new(HashSet::new()),
            reclaim_tx,
            reclaim_rx,
        }
    }

    pub fn runtime(&self) -> &dyn ForeignRuntime {
        self.runtime.as_ref()
    }

    /// Opens a scope for borrowed handles on the current thread.
    pub fn scope(&self) -> Scope<'_> {
        Scope::new(self)
    }

    /// Wraps a raw reference read from foreign memory or received from a call.
    ///
    /// Owned references are adopted as they are. Borrowed references are
    /// retained once and released when `scope` exits.
    pub fn wrap(
        &self,
        raw: RawRef,
        hint: Ownership,
        nullability: Nullability,
        scope: &mut Scope<'_>,
    ) -> BridgeResult<BridgedHandle> {
        if !scope.belongs_to(self) {
            return Err(BridgeError::ForeignScope);
        }
        if raw.is_null() {
            return null_handle(nullability);
        }
        match hint {
            Ownership::Owned => self.register(raw, Ownership::Owned),
            Ownership::Borrowed => {
                // SAFETY: non-null references handed to the bridge are live
                // objects of its runtime.
                unsafe { self.runtime.retain(raw) };
                match self.register(raw, Ownership::Borrowed) {
                    Ok(handle) => {
                        scope.track(handle.clone());
                        Ok(handle)
                    }
                    Err(err) => {
                        unsafe { self.runtime.release(raw) };
                        Err(err)
                    }
                }
            }
        }
    }

    /// Adopts a +1 reference without a scope. The result is an Owned handle.
    pub fn adopt(&self, raw: RawRef, nullability: Nullability) -> BridgeResult<BridgedHandle> {
        if raw.is_null() {
            return null_handle(nullability);
        }
        self.register(raw, Ownership::Owned)
    }

    fn register(&self, raw: RawRef, ownership: Ownership) -> BridgeResult<BridgedHandle> {
        let key = self.handles.insert(HandleRecord { raw, ownership }).ok_or(BridgeError::RegistryFull)?;
        self.live.fetch_add(1, Ordering::Relaxed);
        if ownership == Ownership::Owned {
            self.owned.lock().insert(key);
        }
        log::trace!("wrapped {:?} as {:?} handle {:#x}", raw, ownership, key);
        Ok(BridgedHandle { raw, ownership, key: Some(key) })
    }

    /// Produces a reference the destination owns (+1).
    ///
    /// An Owned handle transfers its count and becomes invalid. A Borrowed
    /// handle stays valid and the reference is retained once more. The empty
    /// handle unwraps to null.
    pub fn unwrap(&self, handle: &BridgedHandle) -> BridgeResult<RawRef> {
        let Some(key) = handle.key else {
            return Ok(RawRef::NULL);
        };
        match handle.ownership {
            Ownership::Owned => {
                let record = self.handles.take(key).ok_or(BridgeError::StaleHandle { raw: handle.raw })?;
                self.forget(key, record.ownership);
                log::trace!("transferred {:?} out of handle {:#x}", record.raw, key);
                Ok(record.raw)
            }
            Ownership::Borrowed => {
                let record = self.handles.get(key).ok_or(BridgeError::StaleHandle { raw: handle.raw })?;
                // SAFETY: the record's own count keeps the object alive while
                // the entry guard is held.
                unsafe { self.runtime.retain(record.raw) };
                Ok(record.raw)
            }
        }
    }

    /// Produces a +0 reference for memory the host keeps ownership of.
    pub fn unwrap_unretained(&self, handle: &BridgedHandle) -> BridgeResult<RawRef> {
        self.raw(handle)
    }

    /// Produces a +0 reference parked in the current autorelease pool, as
    /// returned from a foreign method. Owned handles are consumed.
    pub fn autorelease(&self, handle: &BridgedHandle) -> BridgeResult<RawRef> {
        if handle.is_empty() {
            return Ok(RawRef::NULL);
        }
        let raw = self.unwrap(handle)?;
        // SAFETY: `unwrap` handed us one count on a live object.
        Ok(unsafe { self.runtime.autorelease(raw) })
    }

    /// Releases the count of an Owned handle.
    pub fn release(&self, handle: &BridgedHandle) -> BridgeResult<()> {
        if handle.is_empty() {
            return Ok(());
        }
        if handle.ownership == Ownership::Borrowed {
            return Err(BridgeError::NotOwned { raw: handle.raw });
        }
        self.release_slot(handle)
    }

    /// Releases a Borrowed handle at scope exit.
    pub(crate) fn release_borrowed(&self, handle: &BridgedHandle) -> BridgeResult<()> {
        debug_assert_eq!(handle.ownership, Ownership::Borrowed);
        self.release_slot(handle)
    }

    fn release_slot(&self, handle: &BridgedHandle) -> BridgeResult<()> {
        let Some(key) = handle.key else {
            return Ok(());
        };
        let record = self.handles.take(key).ok_or(BridgeError::DoubleRelease { raw: handle.raw })?;
        self.forget(key, record.ownership);
        log::trace!("releasing {:?} from handle {:#x}", record.raw, key);
        // SAFETY: the record held one count on a live object; taking it out of
        // the slab makes this the only release of that count.
        unsafe { self.runtime.release(record.raw) };
        Ok(())
    }

    /// Bookkeeping for a record just taken out of the slab.
    fn forget(&self, key: usize, ownership: Ownership) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        if ownership == Ownership::Owned {
            self.owned.lock().remove(&key);
        }
    }

    /// Drops a +1 reference that [`ReferenceBridge::unwrap`] handed out but
    /// that never reached its destination.
    pub(crate) fn release_unstored(&self, raw: RawRef) {
        if raw.is_null() {
            return;
        }
        log::trace!("returning unstored {:?}", raw);
        // SAFETY: the caller holds the count `unwrap` produced.
        unsafe { self.runtime.release(raw) };
    }

    /// Releases every Owned handle the host still holds. Their handles go
    /// stale. Returns how many counts were released.
    ///
    /// Releasing a block can drop host state that owns further handles, so
    /// this repeats until no Owned handle is left.
    pub fn release_outstanding(&self) -> usize {
        let mut released = 0;
        loop {
            let keys: Vec<usize> = self.owned.lock().drain().collect();
            if keys.is_empty() {
                return released;
            }
            for key in keys {
                // Raced with an explicit release or transfer.
                let Some(record) = self.handles.take(key) else {
                    continue;
                };
                self.live.fetch_sub(1, Ordering::Relaxed);
                log::trace!("releasing outstanding {:?} from handle {:#x}", record.raw, key);
                // SAFETY: as in `release_slot`, the record's count is released once.
                unsafe { self.runtime.release(record.raw) };
                released += 1;
            }
        }
    }

    /// Number of Owned handles not yet released or transferred.
    pub fn owned_handles(&self) -> usize {
        self.owned.lock().len()
    }

    /// Validated access to the referenced object, +0.
    pub fn raw(&self, handle: &BridgedHandle) -> BridgeResult<RawRef> {
        let Some(key) = handle.key else {
            return Ok(RawRef::NULL);
        };
        self.handles
            .get(key)
            .map(|record| record.raw)
            .ok_or(BridgeError::StaleHandle { raw: handle.raw })
    }

    /// True if the handle still resolves (always true for the empty handle).
    pub fn is_live(&self, handle: &BridgedHandle) -> bool {
        match handle.key {
            None => true,
            Some(key) => self.handles.contains(key),
        }
    }

    /// Number of handles currently holding a count.
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn schedule_release(&self, handle: BridgedHandle) {
        // Never disconnected: the bridge owns the receiving end too.
        let _ = self.reclaim_tx.send(ReclaimMsg::Release(handle));
    }

    pub(crate) fn reclaim_queue(&self) -> Receiver<ReclaimMsg> {
        self.reclaim_rx.clone()
    }

    /// Releases every handle waiting in the reclamation queue. Returns how
    /// many counts were actually released.
    pub fn reclaim(&self) -> usize {
        let mut released = 0;
        while let Ok(ReclaimMsg::Release(handle)) = self.reclaim_rx.try_recv() {
            if self.finalize(&handle) {
                released += 1;
            }
        }
        released
    }

    /// Release on behalf of the reclamation queue. A handle that was already
    /// released explicitly is skipped.
    pub(crate) fn finalize(&self, handle: &BridgedHandle) -> bool {
        match self.release(handle) {
            Ok(()) => true,
            Err(BridgeError::DoubleRelease { raw }) => {
                log::trace!("{:?} already released before reclamation", raw);
                false
            }
            Err(err) => {
                log::warn!("reclamation of {:?} failed: {}", handle, err);
                false
            }
        }
    }

    pub(crate) fn same_bridge(&self, other: &ReferenceBridge) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Drop for ReferenceBridge {
    fn drop(&mut self) {
        self.reclaim();
        let released = self.release_outstanding();
        if released > 0 {
            log::debug!("released {} owned handle(s) the host never released", released);
        }
    }
}

impl fmt::Debug for ReferenceBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceBridge")
            .field("live_handles", &self.live_handles())
            .field("owned_handles", &self.owned_handles())
            .finish()
    }
}

fn null_handle(nullability: Nullability) -> BridgeResult<BridgedHandle> {
    match nullability {
        Nullability::Nullable => Ok(BridgedHandle::empty()),
        Nullability::NonNull => Err(BridgeError::UnexpectedNull { field: String::new() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objbridge_foreign::ArcRuntime;

    fn bridge() -> (ArcRuntime, ReferenceBridge) {
        let runtime = ArcRuntime::new();
        let bridge = ReferenceBridge::new(Arc::new(runtime.clone()));
        (runtime, bridge)
    }

    #[test]
    fn borrowed_wrap_retains_until_scope_exit() {
        let (runtime, bridge) = bridge();
        let obj = runtime.new_object();
        {
            let mut scope = bridge.scope();
            let handle = scope.wrap(obj, Ownership::Borrowed, Nullability::NonNull).unwrap();
            assert_eq!(runtime.retain_count(obj), Some(2));
            assert_eq!(bridge.raw(&handle).unwrap(), obj);
            assert!(matches!(bridge.release(&handle), Err(BridgeError::NotOwned { .. })));
        }
        assert_eq!(runtime.retain_count(obj), Some(1));
        assert_eq!(bridge.live_handles(), 0);
    }

    #[test]
    fn owned_release_twice_is_detected() {
        let (runtime, bridge) = bridge();
        let obj = runtime.new_object();
        unsafe { runtime.retain(obj) };
        let handle = bridge.adopt(obj, Nullability::NonNull).unwrap();
        bridge.release(&handle).unwrap();
        assert_eq!(runtime.retain_count(obj), Some(1));
        assert!(matches!(bridge.release(&handle), Err(BridgeError::DoubleRelease { .. })));
        assert_eq!(runtime.retain_count(obj), Some(1));
    }

    #[test]
    fn owned_unwrap_transfers_the_count() {
        let (runtime, bridge) = bridge();
        let obj = runtime.new_object();
        let handle = bridge.adopt(obj, Nullability::NonNull).unwrap();
        assert_eq!(bridge.unwrap(&handle).unwrap(), obj);
        assert_eq!(runtime.retain_count(obj), Some(1));
        assert!(matches!(bridge.raw(&handle), Err(BridgeError::StaleHandle { .. })));
        unsafe { runtime.release(obj) };
    }

    #[test]
    fn null_follows_nullability() {
        let (_runtime, bridge) = bridge();
        let mut scope = bridge.scope();
        let empty = scope.wrap(RawRef::NULL, Ownership::Borrowed, Nullability::Nullable).unwrap();
        assert!(empty.is_empty());
        assert_eq!(bridge.unwrap(&empty).unwrap(), RawRef::NULL);
        bridge.release(&empty).unwrap();
        assert!(matches!(
            scope.wrap(RawRef::NULL, Ownership::Borrowed, Nullability::NonNull),
            Err(BridgeError::UnexpectedNull { .. })
        ));
    }

    #[test]
    fn scopes_from_another_bridge_are_refused() {
        let (_other_runtime, other) = bridge();
        let (runtime, bridge) = bridge();
        let obj = runtime.new_object();
        let mut foreign_scope = other.scope();
        let err = bridge.wrap(obj, Ownership::Borrowed, Nullability::NonNull, &mut foreign_scope).unwrap_err();
        assert!(matches!(err, BridgeError::ForeignScope));
        assert_eq!(runtime.retain_count(obj), Some(1));
        assert_eq!(bridge.live_handles(), 0);
        assert_eq!(foreign_scope.borrowed_len(), 0);
        unsafe { runtime.release(obj) };
    }

    #[test]
    fn unreleased_owned_handles_are_released_on_drop() {
        let (runtime, bridge) = bridge();
        let kept = runtime.new_object();
        let forgotten = runtime.new_object();
        unsafe { runtime.retain(kept) };
        let released = bridge.adopt(kept, Nullability::NonNull).unwrap();
        bridge.adopt(forgotten, Nullability::NonNull).unwrap();
        assert_eq!(bridge.owned_handles(), 2);

        bridge.release(&released).unwrap();
        assert_eq!(bridge.owned_handles(), 1);
        drop(bridge);
        assert!(!runtime.is_live(forgotten));
        assert_eq!(runtime.retain_count(kept), Some(1));
        unsafe { runtime.release(kept) };
        assert_eq!(runtime.stats().live_objects, 0);
    }

    #[test]
    fn transferred_handles_are_no_longer_outstanding() {
        let (runtime, bridge) = bridge();
        let obj = runtime.new_object();
        let handle = bridge.adopt(obj, Nullability::NonNull).unwrap();
        assert_eq!(bridge.unwrap(&handle).unwrap(), obj);
        assert_eq!(bridge.owned_handles(), 0);
        assert_eq!(bridge.release_outstanding(), 0);
        assert_eq!(runtime.retain_count(obj), Some(1));
        unsafe { runtime.release(obj) };
    }

    #[test]
    fn queued_release_after_explicit_release_is_skipped() {
        let (runtime, bridge) = bridge();
        let obj = runtime.new_object();
        let handle = bridge.adopt(obj, Nullability::NonNull).unwrap();
        unsafe { runtime.retain(obj) };
        bridge.release(&handle).unwrap();
        bridge.schedule_release(handle);
        assert_eq!(bridge.reclaim(), 0);
        assert_eq!(runtime.retain_count(obj), Some(1));
        unsafe { runtime.release(obj) };
    }
}
