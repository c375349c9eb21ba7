#![allow(dead_code)]

use std::sync::Arc;

use objbridge_core::{Bridge, BridgeConfig, FinalizerMode, HostValue, ProjectConfig, ScalarValue};
use objbridge_foreign::{ArcRuntime, ForeignRuntime, RawRef};
use objbridge_layout::{ClosureSignature, ScalarKind, StructLayout, ValueType};

pub const FIXTURE: &str = include_str!("../../../demos/fixture.toml");

pub const PLAIN: &str = "CStructWithNSObjects";
pub const WITH_ANY: &str = "CStructWithNSObjectsAndAny";
pub const WITHOUT_BLOCK: &str = "CStructWithoutBlock";

pub const BLOCK_RESULT: i32 = 42;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn bridge_with(finalizer: FinalizerMode) -> (ArcRuntime, Bridge) {
    init_logging();
    let project = ProjectConfig::from_toml(FIXTURE).unwrap();
    let runtime = ArcRuntime::new();
    let bridge = Bridge::new(
        Arc::new(runtime.clone()),
        project.layout_table().unwrap(),
        &BridgeConfig { finalizer },
    )
    .unwrap();
    (runtime, bridge)
}

/// A bridge whose queued releases only happen on `reclaim`.
pub fn bridge() -> (ArcRuntime, Bridge) {
    bridge_with(FinalizerMode::Manual)
}

/// One foreign object per fixture field, each holding a single count owned by
/// the test.
pub struct FixtureObjects {
    pub any: RawRef,
    pub ns_string: RawRef,
    pub object: RawRef,
    pub block: RawRef,
    pub array: RawRef,
    pub mutable_array: RawRef,
    pub set: RawRef,
    pub dictionary: RawRef,
    pub elements: Vec<RawRef>,
}

impl FixtureObjects {
    pub fn new(runtime: &ArcRuntime, bridge: &Bridge) -> Self {
        let elements = vec![runtime.new_string("one"), runtime.new_string("two")];
        let block = bridge
            .expose_host_function(ClosureSignature::nullary(ValueType::Scalar(ScalarKind::I32)), |_, _| {
                Ok(Some(HostValue::Scalar(ScalarValue::I32(BLOCK_RESULT))))
            })
            .unwrap();
        unsafe {
            FixtureObjects {
                any: runtime.new_object(),
                ns_string: runtime.new_string("hello"),
                object: runtime.new_object(),
                block,
                array: runtime.new_array(&elements),
                mutable_array: runtime.new_mutable_array(&elements),
                set: runtime.new_set(&elements),
                dictionary: runtime.new_dictionary(&[(elements[0], elements[1])]),
                elements,
            }
        }
    }

    pub fn by_field(&self, name: &str) -> RawRef {
        match name {
            "any" => self.any,
            "nsString" => self.ns_string,
            "object" => self.object,
            "block" => self.block,
            "array" => self.array,
            "mutableArray" => self.mutable_array,
            "set" => self.set,
            "dictionary" => self.dictionary,
            other => panic!("no fixture object for field {}", other),
        }
    }

    pub fn all(&self) -> Vec<RawRef> {
        let mut all = vec![
            self.any,
            self.ns_string,
            self.object,
            self.block,
            self.array,
            self.mutable_array,
            self.set,
            self.dictionary,
        ];
        all.extend(&self.elements);
        all
    }

    pub fn counts(&self, runtime: &ArcRuntime) -> Vec<Option<usize>> {
        self.all().into_iter().map(|raw| runtime.retain_count(raw)).collect()
    }

    /// Drops the test's own counts. Collections go first so their elements
    /// are released by them before the test lets go.
    pub fn release(self, runtime: &ArcRuntime) {
        unsafe {
            for raw in self.all() {
                runtime.release(raw);
            }
        }
    }
}

/// A buffer laid out as `layout` with each field pointing at its fixture object.
pub fn populate(layout: &StructLayout, objects: &FixtureObjects) -> Vec<u8> {
    let mut memory = vec![0u8; layout.size()];
    for field in layout.fields() {
        set_field(&mut memory, layout, &field.name, objects.by_field(&field.name));
    }
    memory
}

pub fn set_field(memory: &mut [u8], layout: &StructLayout, name: &str, raw: RawRef) {
    let field = layout.field(name).unwrap();
    memory[field.byte_offset..field.end()].copy_from_slice(&raw.addr().to_ne_bytes());
}

pub fn get_field(memory: &[u8], layout: &StructLayout, name: &str) -> RawRef {
    let field = layout.field(name).unwrap();
    let mut word = [0u8; std::mem::size_of::<usize>()];
    word.copy_from_slice(&memory[field.byte_offset..field.end()]);
    RawRef::from_addr(usize::from_ne_bytes(word))
}
