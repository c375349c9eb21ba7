//! Lifetime coordination between host reclamation and foreign counts.
//!
//! Borrowed handles live exactly as long as the [`Scope`] they were wrapped
//! in. Owned handles live until they are released, transferred, or their
//! [`OwnedRef`] owner is dropped, at which point the release is queued for
//! the [`Reclaimer`] (or a manual [`ReferenceBridge::reclaim`]).

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use objbridge_foreign::RawRef;

use crate::error::{BridgeError, BridgeResult};
use crate::reference::{BridgedHandle, Nullability, Ownership, ReclaimMsg, ReferenceBridge};

/// One call frame's worth of borrowed handles.
///
/// Exiting the scope, by [`Scope::close`] or by drop, releases every handle
/// wrapped Borrowed through it, in reverse creation order. A scope is tied
/// to the thread that opened it.
pub struct Scope<'b> {
    bridge: &'b ReferenceBridge,
    borrowed: Vec<BridgedHandle>,
    _not_send: PhantomData<*const ()>,
}

impl<'b> Scope<'b> {
    pub(crate) fn new(bridge: &'b ReferenceBridge) -> Self {
        Scope { bridge, borrowed: Vec::new(), _not_send: PhantomData }
    }

    pub fn bridge(&self) -> &'b ReferenceBridge {
        self.bridge
    }

    /// Shorthand for [`ReferenceBridge::wrap`] with this scope.
    pub fn wrap(&mut self, raw: RawRef, hint: Ownership, nullability: Nullability) -> BridgeResult<BridgedHandle> {
        let bridge = self.bridge;
        bridge.wrap(raw, hint, nullability, self)
    }

    /// Number of borrowed handles this scope will release on exit.
    pub fn borrowed_len(&self) -> usize {
        self.borrowed.len()
    }

    pub(crate) fn track(&mut self, handle: BridgedHandle) {
        self.borrowed.push(handle);
    }

    pub(crate) fn belongs_to(&self, bridge: &ReferenceBridge) -> bool {
        self.bridge.same_bridge(bridge)
    }

    /// Exits the scope, reporting the first release failure.
    pub fn close(mut self) -> BridgeResult<()> {
        self.release_all()
    }

    fn release_all(&mut self) -> BridgeResult<()> {
        let mut first_error = None;
        while let Some(handle) = self.borrowed.pop() {
            if let Err(err) = self.bridge.release_borrowed(&handle) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release_all() {
            log::warn!("scope exit: {}", err);
        }
    }
}

/// Host owner of one Owned handle.
///
/// Dropping it queues the release instead of performing it, so the count is
/// dropped exactly once no matter which thread reclamation runs on.
pub struct OwnedRef {
    bridge: Arc<ReferenceBridge>,
    handle: Option<BridgedHandle>,
}

impl OwnedRef {
    pub fn new(bridge: Arc<ReferenceBridge>, handle: BridgedHandle) -> BridgeResult<Self> {
        if !handle.is_empty() && handle.ownership() != Ownership::Owned {
            return Err(BridgeError::NotOwned { raw: handle.address() });
        }
        Ok(OwnedRef { bridge, handle: Some(handle) })
    }

    pub fn handle(&self) -> &BridgedHandle {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("OwnedRef handle is only taken when consumed"),
        }
    }

    /// Releases now instead of at reclamation.
    pub fn release(mut self) -> BridgeResult<()> {
        match self.handle.take() {
            Some(handle) => self.bridge.release(&handle),
            None => Ok(()),
        }
    }

    /// Gives up ownership without releasing; the caller takes over the handle.
    pub fn into_handle(mut self) -> BridgedHandle {
        self.handle.take().unwrap_or_else(BridgedHandle::empty)
    }
}

impl Drop for OwnedRef {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_empty() {
                self.bridge.schedule_release(handle);
            }
        }
    }
}

impl std::fmt::Debug for OwnedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OwnedRef").field(self.handle()).finish()
    }
}

/// Background thread draining the reclamation queue.
pub struct Reclaimer {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Reclaimer {
    pub fn spawn(bridge: Arc<ReferenceBridge>) -> std::io::Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let queue = bridge.reclaim_queue();
        let thread = thread::Builder::new().name("objbridge-reclaimer".to_string()).spawn(move || {
            log::debug!("reclaimer started");
            loop {
                select! {
                    recv(queue) -> msg => match msg {
                        Ok(ReclaimMsg::Release(handle)) => {
                            bridge.finalize(&handle);
                        }
                        Err(_) => break,
                    },
                    recv(stopped) -> _ => break,
                }
            }
            // Drain whatever was queued before the stop request.
            bridge.reclaim();
            log::debug!("reclaimer stopped");
        })?;
        Ok(Reclaimer { stop, thread: Some(thread) })
    }

    /// Stops the thread after it has drained the queue.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.stop.send(());
            if thread.join().is_err() {
                log::error!("reclaimer thread panicked");
            }
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
