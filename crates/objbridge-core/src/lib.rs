//! Marshalling of C structs that reference foreign reference-counted objects.
//!
//! The pieces, bottom up:
//!
//! - [`ReferenceBridge`] turns raw foreign references into [`BridgedHandle`]s
//!   and is the only code that retains or releases.
//! - [`Scope`], [`OwnedRef`] and [`Reclaimer`] decide when those counts are
//!   dropped.
//! - [`ClosureBridge`] calls foreign blocks and exposes host functions as blocks.
//! - [`Marshaller`] reads and writes whole structs against a
//!   [`StructLayout`](objbridge_layout::StructLayout).
//!
//! [`Bridge`] ties them to a [`LayoutTable`] and is what most hosts use.

use std::sync::Arc;

use objbridge_foreign::{ForeignRuntime, RawRef};
use objbridge_layout::{ClosureSignature, LayoutTable, StructLayout, StructTypeId};

mod closure;
mod collection;
pub mod config;
mod error;
mod lifetime;
mod marshal;
mod reference;
mod value;

pub use closure::{ClosureBridge, ClosureHandle, HostFunction};
pub use collection::CollectionHandle;
pub use config::{BridgeConfig, ConfigError, FinalizerMode, ProjectConfig};
pub use error::{BridgeError, BridgeResult};
pub use lifetime::{OwnedRef, Reclaimer, Scope};
pub use marshal::Marshaller;
pub use reference::{BridgedHandle, Nullability, Ownership, ReferenceBridge};
pub use value::{HostStruct, HostValue, ScalarValue};

/// The host-facing bridge: layouts, references, closures and marshalling
/// over one foreign runtime.
pub struct Bridge {
    layouts: Arc<LayoutTable>,
    references: Arc<ReferenceBridge>,
    closures: ClosureBridge,
    marshaller: Marshaller,
    reclaimer: Option<Reclaimer>,
}

impl Bridge {
    pub fn new(runtime: Arc<dyn ForeignRuntime>, layouts: LayoutTable, config: &BridgeConfig) -> BridgeResult<Self> {
        let references = Arc::new(ReferenceBridge::new(runtime));
        let closures = ClosureBridge::new(references.clone());
        let marshaller = Marshaller::new(closures.clone());
        let reclaimer = match config.finalizer {
            FinalizerMode::Thread => Some(Reclaimer::spawn(references.clone()).map_err(BridgeError::ReclaimerSpawn)?),
            FinalizerMode::Manual => None,
        };
        log::debug!("bridge ready with {} layout(s), finalizer {:?}", layouts.len(), config.finalizer);
        Ok(Bridge { layouts: Arc::new(layouts), references, closures, marshaller, reclaimer })
    }

    pub fn layouts(&self) -> &LayoutTable {
        &self.layouts
    }

    pub fn references(&self) -> &Arc<ReferenceBridge> {
        &self.references
    }

    pub fn closures(&self) -> &ClosureBridge {
        &self.closures
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.marshaller
    }

    pub fn scope(&self) -> Scope<'_> {
        self.references.scope()
    }

    pub fn describe(&self, type_id: &StructTypeId) -> BridgeResult<Arc<StructLayout>> {
        Ok(self.layouts.describe(type_id)?)
    }

    pub fn read_struct(&self, scope: &mut Scope<'_>, type_id: &StructTypeId, memory: &[u8]) -> BridgeResult<HostStruct> {
        let layout = self.describe(type_id)?;
        self.marshaller.read_struct(scope, memory, &layout)
    }

    /// Writes `value` using the layout registered for its type.
    pub fn write_struct(&self, value: &HostStruct, memory: &mut [u8], destination: Ownership) -> BridgeResult<()> {
        let layout = self.describe(value.type_id())?;
        self.marshaller.write_struct(value, memory, &layout, destination)
    }

    pub fn invoke(
        &self,
        scope: &mut Scope<'_>,
        closure: &ClosureHandle,
        args: &[HostValue],
    ) -> BridgeResult<Option<HostValue>> {
        self.closures.invoke(scope, closure, args)
    }

    pub fn release(&self, handle: &BridgedHandle) -> BridgeResult<()> {
        self.references.release(handle)
    }

    /// Hands an Owned handle to an owner that releases it on drop.
    pub fn own(&self, handle: BridgedHandle) -> BridgeResult<OwnedRef> {
        OwnedRef::new(self.references.clone(), handle)
    }

    pub fn expose_host_function<F>(&self, signature: ClosureSignature, function: F) -> BridgeResult<RawRef>
    where
        F: Fn(&mut Scope<'_>, &[HostValue]) -> BridgeResult<Option<HostValue>> + Send + Sync + 'static,
    {
        self.closures.expose_host_function(signature, function)
    }

    /// Drains the reclamation queue on the calling thread.
    pub fn reclaim(&self) -> usize {
        self.references.reclaim()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let Some(reclaimer) = self.reclaimer.take() {
            reclaimer.shutdown();
        }
        let released = self.references.reclaim();
        if released > 0 {
            log::debug!("released {} queued handle(s) on shutdown", released);
        }
        // Blocks exposed by this bridge keep the reference bridge alive, so
        // its own drop may never run while they are outstanding.
        let outstanding = self.references.release_outstanding();
        if outstanding > 0 {
            log::debug!("released {} owned handle(s) the host never released", outstanding);
        }
    }
}
