//! Public VM API (spec §6.2): the embedder-facing surface wrapping
//! [`crate::interp::VmContext`]. One [`Vm`] per OS thread, matching the
//! teacher's one-scheduler-per-process model (`scheduler.rs`) scaled down
//! to one-heap-per-thread since this runtime has no cross-thread shared
//! heap (spec §5).

use crate::error::VmResult;
use crate::fiber::{Fiber, Signal};
use crate::funcdef::Function;
use crate::gc::{GcRef, Heap, MemType};
use crate::interp::{self, VmContext};
use crate::value::Value;
use crate::VmConfig;

/// Opaque handle returned by [`Vm::gc_root`]; pass back to [`Vm::gc_unroot`]
/// to release. Backed by a slot in the context's root table (spec §4.1
/// "Roots (ii)") rather than a raw pointer, so a stale handle used twice
/// is a harmless no-op instead of undefined behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootHandle(u64);

/// A snapshot of the state `vm_save`/`vm_load` exchange (spec §6.2):
/// "snapshot the entire per-thread VM, allowing reentrant hosting". The
/// heap and root table are not part of the snapshot — only which fiber (if
/// any) is currently executing and the interrupt-arm count, the two bits
/// of state a reentrant embedder call would otherwise clobber.
#[derive(Debug, Clone, Copy)]
pub struct VmSnapshot {
    current_fiber: Option<GcRef<Fiber>>,
    interrupt_armed: bool,
}

/// Per-thread VM state (spec §4 "one VM state per thread; shared only
/// within").
pub struct Vm {
    ctx: VmContext,
    next_root_id: u64,
    fiber_stack: usize,
}

impl Vm {
    /// `init()` (spec §6.2): sets up per-thread VM state from `config`.
    pub fn init(config: VmConfig) -> Vm {
        Vm {
            ctx: VmContext::new(config.gc_interval, config.max_frames),
            next_root_id: 0,
            fiber_stack: config.fiber_stack,
        }
    }

    /// `deinit()` (spec §6.2): tears down per-thread VM state. Dropping
    /// `Vm` frees the heap's blocks through each one's `drop_fn`
    /// (spec §4.1 "Sweep"); an explicit method exists to mirror the paired
    /// `init`/`deinit` the spec names, even though Rust's `Drop` would do
    /// the same work on scope exit.
    pub fn deinit(self) {
        drop(self);
    }

    pub fn heap(&self) -> &Heap {
        &self.ctx.heap
    }

    pub fn context(&self) -> &VmContext {
        &self.ctx
    }

    /// `vm_save(into)` (spec §6.2).
    pub fn vm_save(&self) -> VmSnapshot {
        VmSnapshot { current_fiber: self.ctx.current_fiber(), interrupt_armed: false }
    }

    /// `vm_load(from)` (spec §6.2). Restoring a snapshot taken while an
    /// interrupt was armed re-arms it, so a nested reentrant call cannot
    /// silently swallow an interrupt the outer caller was waiting on.
    pub fn vm_load(&mut self, snapshot: VmSnapshot) {
        self.ctx.set_current_fiber(snapshot.current_fiber);
        if snapshot.interrupt_armed {
            self.ctx.interrupt();
        }
    }

    /// `interpreter_interrupt(vm)` (spec §6.2).
    pub fn interpreter_interrupt(&self) {
        self.ctx.interrupt();
    }

    /// `interpreter_interrupt_handled(vm)` (spec §6.2).
    pub fn interpreter_interrupt_handled(&self) {
        self.ctx.interrupt_handled();
    }

    /// `run(callee, &result)` (spec §6.2): executes `callee` as a nullary
    /// call on a freshly spawned fiber.
    pub fn run(&mut self, callee: Value) -> VmResult<(Signal, Value)> {
        let function = match callee {
            Value::Function(f) => f,
            other => {
                return Err(crate::error::VmError::Type { expected: "function", got: other.type_of().name() });
            }
        };
        let fiber = self.spawn_fiber(function)?;
        Ok(interp::resume(&self.ctx, fiber, Value::Nil))
    }

    /// `continue_(fiber, in, &out)` (spec §6.2): resumes a suspended or
    /// freshly spawned fiber.
    pub fn continue_(&mut self, fiber: GcRef<Fiber>, value: Value) -> (Signal, Value) {
        interp::resume(&self.ctx, fiber, value)
    }

    /// `step(fiber, in, &out)` (spec §6.2): runs exactly one instruction.
    pub fn step(&mut self, fiber: GcRef<Fiber>, value: Value) -> (Signal, Value) {
        interp::step(&self.ctx, fiber, value)
    }

    fn spawn_fiber(&self, function: GcRef<Function>) -> VmResult<GcRef<Fiber>> {
        let fiber = Fiber::new(function, self.fiber_stack);
        let fiber_ref = self.ctx.heap.alloc(MemType::Fiber, fiber)?;
        self.ctx.heap.enable_gc(fiber_ref);
        Ok(fiber_ref)
    }

    /// `panic(msg)` (spec §6.2): raises `msg` as the current fiber's error.
    /// Returns the constructed error `Value` so a native caller can return
    /// it directly from a `CFunction` (spec §6.4 "panic-on-error").
    pub fn panic(&self, msg: &str) -> Value {
        let value = self.intern_error_string(msg);
        if let Some(fiber) = self.ctx.current_fiber() {
            unsafe {
                fiber.as_mut().cancel(value.clone());
            }
        }
        value
    }

    /// `panicf(fmt, …)` (spec §6.2), adapted to Rust's `format_args!`
    /// instead of a C varargs list.
    pub fn panicf(&self, args: std::fmt::Arguments<'_>) -> Value {
        self.panic(&args.to_string())
    }

    fn intern_error_string(&self, msg: &str) -> Value {
        match self.ctx.heap.intern_string(msg.as_bytes()) {
            Ok(r) => Value::String(r),
            Err(_) => Value::Nil,
        }
    }

    /// `gc_root(v)` (spec §6.2): roots `v` independent of any fiber's
    /// register window until [`Vm::gc_unroot`] releases it.
    pub fn gc_root(&mut self, v: Value) -> VmResult<RootHandle> {
        let id = self.next_root_id;
        self.next_root_id += 1;
        unsafe {
            self.ctx.root_table.as_mut().put(Value::Number(id as f64), v)?;
        }
        Ok(RootHandle(id))
    }

    /// `gc_unroot(v)` (spec §6.2).
    pub fn gc_unroot(&mut self, handle: RootHandle) {
        unsafe {
            self.ctx.root_table.as_mut().remove(&Value::Number(handle.0 as f64));
        }
    }

    /// `pin(v)` (spec §6.2): marks the heap block `v` refers to
    /// unconditionally reachable, bypassing the root-table indirection
    /// `gc_root` uses. A no-op for non-heap `Value` variants.
    pub fn pin(&self, v: &Value) {
        pin_value(&self.ctx.heap, v, true);
    }

    /// `unpin(v)` (spec §6.2).
    pub fn unpin(&self, v: &Value) {
        pin_value(&self.ctx.heap, v, false);
    }
}

/// Dispatches `heap.pin`/`heap.unpin` over whichever heap-backed variant
/// `v` holds; a no-op for `Nil`/`Boolean`/`Number`/`CFunction`/`Pointer`,
/// which carry no `GcRef`.
fn pin_value(heap: &Heap, v: &Value, pinned: bool) {
    macro_rules! apply {
        ($r:expr) => {
            if pinned {
                heap.pin($r)
            } else {
                heap.unpin($r)
            }
        };
    }
    match v {
        Value::String(r) | Value::Symbol(r) | Value::Keyword(r) => apply!(*r),
        Value::Array(r) => apply!(*r),
        Value::Tuple(r) => apply!(*r),
        Value::Table(r) => apply!(*r),
        Value::Struct(r) => apply!(*r),
        Value::Buffer(r) => apply!(*r),
        Value::Function(r) => apply!(*r),
        Value::Fiber(r) => apply!(*r),
        Value::Abstract(r) => apply!(*r),
        Value::Nil | Value::Boolean(_) | Value::Number(_) | Value::CFunction(_) | Value::Pointer(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{encode_zero, Opcode};
    use crate::funcdef::FuncDef;
    use crate::gc::MemType;
    use crate::verify::verify;

    fn build_function(vm: &Vm) -> GcRef<Function> {
        let mut def = FuncDef::new(vec![encode_zero(Opcode::ReturnNil)], vec![], 1);
        def.arity_min = 0;
        def.arity_max = Some(0);
        verify(&mut def).unwrap();
        let def_ref = vm.heap().alloc(MemType::FuncDef, def).unwrap();
        vm.heap().enable_gc(def_ref);
        let function = Function::new(def_ref, vec![]).unwrap();
        let f_ref = vm.heap().alloc(MemType::Function, function).unwrap();
        vm.heap().enable_gc(f_ref);
        f_ref
    }

    #[test]
    fn run_nullary_function_returns_nil() {
        let mut vm = Vm::init(VmConfig::default());
        let f = build_function(&vm);
        let (signal, value) = vm.run(Value::Function(f)).unwrap();
        assert!(matches!(signal, Signal::Ok(_)));
        assert_eq!(value, Value::Nil);
    }

    #[test]
    fn gc_root_keeps_value_reachable_across_collection() {
        let mut vm = Vm::init(VmConfig::default());
        let s = {
            let r = vm.heap().intern_string(b"rooted").unwrap();
            vm.heap().enable_gc(r);
            Value::String(r)
        };
        let handle = vm.gc_root(s.clone()).unwrap();
        vm.context().collect_now();
        assert_eq!(vm.context().root_table.get(&Value::Number(handle.0 as f64)), Some(s));
        vm.gc_unroot(handle);
        assert_eq!(vm.context().root_table.get(&Value::Number(handle.0 as f64)), None);
    }

    #[test]
    fn interrupt_suspends_before_first_instruction() {
        let mut vm = Vm::init(VmConfig::default());
        let f = build_function(&vm);
        vm.interpreter_interrupt();
        let (signal, _) = vm.run(Value::Function(f)).unwrap();
        assert!(matches!(signal, Signal::Debug(_)));
    }
}
