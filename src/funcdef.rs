//! Function model (spec §3.4): `FuncDef`, `FuncEnv`, `Function`, `CFunction`.

use std::cell::RefCell;

use crate::containers::string_intern::StringData;
use crate::fiber::Fiber;
use crate::gc::{GcRef, Heap, Trace};
use crate::value::{CFunctionPtr, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct FuncDefFlags {
    pub variadic: bool,
    pub needs_environment: bool,
}

/// Says where a closure's capture of environment index `i` comes from: walk
/// `relative_depth` frames up the caller chain from the frame creating the
/// closure and either share or install a FuncEnv there (spec §4.3 `CLOSURE`).
#[derive(Debug, Clone, Copy)]
pub struct EnvCaptureDescriptor {
    pub relative_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

/// Immutable function template (spec §3.4). Shared by every `Function`
/// closing over it — `FuncDef` itself never changes after the verifier
/// (`crate::verify`) accepts it.
#[derive(Debug)]
pub struct FuncDef {
    pub bytecode: Vec<u32>,
    pub constants: Vec<Value>,
    pub nested_defs: Vec<GcRef<FuncDef>>,
    pub env_captures: Vec<EnvCaptureDescriptor>,
    pub arity_min: u32,
    pub arity_max: Option<u32>,
    pub flags: FuncDefFlags,
    pub slot_count: u32,
    pub name: Option<GcRef<StringData>>,
    pub source_map: Option<Vec<SourceLoc>>,
    pub source_id: Option<GcRef<StringData>>,
    /// Set once `crate::verify::verify` accepts this def (spec §4.4: "a
    /// FuncDef can be closed over only after verification").
    pub verified: bool,
}

impl FuncDef {
    pub fn new(bytecode: Vec<u32>, constants: Vec<Value>, slot_count: u32) -> Self {
        FuncDef {
            bytecode,
            constants,
            nested_defs: Vec::new(),
            env_captures: Vec::new(),
            arity_min: 0,
            arity_max: None,
            flags: FuncDefFlags::default(),
            slot_count,
            name: None,
            source_map: None,
            source_id: None,
            verified: false,
        }
    }

    #[cfg(test)]
    pub fn new_for_test(slot_count: u32) -> Self {
        FuncDef::new(vec![], vec![], slot_count)
    }
}

impl Trace for FuncDef {
    fn trace(&self, heap: &Heap) {
        for c in &self.constants {
            c.trace_children(heap);
        }
        for d in &self.nested_defs {
            heap.mark(*d);
        }
        if let Some(n) = self.name {
            heap.mark(n);
        }
        if let Some(s) = self.source_id {
            heap.mark(s);
        }
    }
}

/// Where a `FuncEnv`'s captured values currently live (spec §3.4).
#[derive(Debug)]
enum EnvStorage {
    Live { fiber: GcRef<Fiber>, offset: usize, length: usize },
    Detached(Vec<Value>),
}

/// A captured upvalue frame. While the owning fiber is alive and the frame
/// still on its stack, reads/writes go through the fiber's register array;
/// once the frame pops or the fiber dies, the values are copied out and the
/// env becomes self-contained (spec §3.4 "detached").
#[derive(Debug)]
pub struct FuncEnv {
    storage: RefCell<EnvStorage>,
}

impl FuncEnv {
    pub fn new_live(fiber: GcRef<Fiber>, offset: usize, length: usize) -> Self {
        FuncEnv { storage: RefCell::new(EnvStorage::Live { fiber, offset, length }) }
    }

    pub fn is_detached(&self) -> bool {
        matches!(*self.storage.borrow(), EnvStorage::Detached(_))
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        match &*self.storage.borrow() {
            EnvStorage::Live { fiber, offset, length } => {
                if index >= *length {
                    return None;
                }
                fiber.data.get(offset + index).cloned()
            }
            EnvStorage::Detached(values) => values.get(index).cloned(),
        }
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        match &mut *self.storage.borrow_mut() {
            EnvStorage::Live { .. } => false,
            EnvStorage::Detached(values) => {
                if let Some(slot) = values.get_mut(index) {
                    *slot = value;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// # Safety
    /// Called only by [`crate::fiber::Fiber::pop_frame`]/tailcall detach on
    /// the env actually attached to the frame being popped; `values` must
    /// be that frame's register window, already copied out.
    pub unsafe fn detach(env: GcRef<FuncEnv>, values: Vec<Value>) {
        *env.storage.borrow_mut() = EnvStorage::Detached(values);
    }
}

impl Trace for FuncEnv {
    fn trace(&self, heap: &Heap) {
        match &*self.storage.borrow() {
            EnvStorage::Live { fiber, .. } => heap.mark(*fiber),
            EnvStorage::Detached(values) => {
                for v in values {
                    v.trace_children(heap);
                }
            }
        }
    }
}

/// A `FuncDef` plus the environments it captured at closure-creation time
/// (spec §3.4). The fields are private: [`Function::new`] is the only way
/// to build one, so a live `Function` always closes over a verified def
/// (spec §4.4: "a FuncDef can be closed over only after verification" —
/// "failure is surfaced at closure creation time, before any execution").
#[derive(Debug)]
pub struct Function {
    def: GcRef<FuncDef>,
    envs: Vec<GcRef<FuncEnv>>,
}

impl Function {
    /// Verifies `def` if it hasn't been already, then closes over it. A def
    /// that fails verification never becomes a runnable closure.
    pub fn new(def: GcRef<FuncDef>, envs: Vec<GcRef<FuncEnv>>) -> crate::error::VmResult<Function> {
        if !def.verified {
            unsafe {
                crate::verify::verify(def.as_mut())?;
            }
        }
        Ok(Function { def, envs })
    }

    pub fn def(&self) -> GcRef<FuncDef> {
        self.def
    }

    pub fn envs(&self) -> &[GcRef<FuncEnv>] {
        &self.envs
    }
}

impl Trace for Function {
    fn trace(&self, heap: &Heap) {
        heap.mark(self.def);
        for e in &self.envs {
            heap.mark(*e);
        }
    }
}

/// Registration metadata for a native function (spec §6.4): "a name,
/// optional prefix, and optional source location, so stack traces and
/// pretty-printing can identify the native frame".
#[derive(Debug, Clone)]
pub struct CFunctionReg {
    pub ptr: CFunctionPtr,
    pub name: String,
    pub prefix: Option<String>,
    pub source: Option<SourceLoc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::MemType;

    #[test]
    fn detach_copies_values_out() {
        let heap = Heap::new(1 << 20);
        let mut func_def = FuncDef::new_for_test(2);
        func_def.bytecode = vec![crate::bytecode::encode_zero(crate::bytecode::Opcode::ReturnNil)];
        let def_ref = heap.alloc(MemType::FuncDef, func_def).unwrap();
        heap.enable_gc(def_ref);
        let function = Function::new(def_ref, vec![]).unwrap();
        let func_ref = heap.alloc(MemType::Function, function).unwrap();
        heap.enable_gc(func_ref);
        let fiber = Fiber::new(func_ref, 16);
        let fiber_ref = heap.alloc(MemType::Fiber, fiber).unwrap();
        heap.enable_gc(fiber_ref);

        let env = FuncEnv::new_live(fiber_ref, 0, 2);
        let env_ref = heap.alloc(MemType::FuncEnv, env).unwrap();
        heap.enable_gc(env_ref);
        assert!(!env_ref.is_detached());

        unsafe {
            FuncEnv::detach(env_ref, vec![Value::Number(1.0), Value::Number(2.0)]);
        }
        assert!(env_ref.is_detached());
        assert_eq!(env_ref.get(0), Some(Value::Number(1.0)));
    }
}
