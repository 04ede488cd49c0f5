//! Register-based bytecode interpreter (spec §4.3) and the fiber
//! resume/transfer contract (spec §4.2, §6.6).
//!
//! Dispatch here is a plain `match` over [`Opcode`] — the simplest of the
//! "any implementation is admissible" options spec §4.3 allows, and the one
//! that keeps a straight line to the verifier's own per-opcode table. The
//! loop never holds a `&Fiber` borrow across a step that can itself mutate
//! the fiber (allocation, nested `resume`) — mutation goes through
//! [`crate::gc::GcRef::as_mut`] instead, the same discipline `verify.rs`
//! uses for its nested-def recursion.

use crate::bytecode::{
    decode, decode_l, decode_sc, decode_sd, decode_ses, decode_si, decode_sl, decode_ss, decode_ssi, decode_ssu, decode_su, decode_sss,
    Opcode,
};
use crate::containers::table::Table;
use crate::error::{VmError, VmResult};
use crate::fiber::{Fiber, Signal, Status};
use crate::funcdef::{EnvCaptureDescriptor, FuncDef, FuncEnv, Function};
use crate::gc::{GcRef, Heap, MemType, RootValue};
use crate::value::{Type, TypeSet, Value};

/// Per-thread VM state: the heap, the fiber currently executing, and the
/// cooperative-interrupt counter (spec §4.3 "Interruption", §5). One
/// `VmContext` per OS thread — `api::Vm` owns exactly one.
pub struct VmContext {
    pub heap: Heap,
    current_fiber: std::cell::Cell<Option<GcRef<Fiber>>>,
    auto_suspend: std::cell::Cell<u32>,
    /// Cap on simultaneous frames — the embedder-configurable recursion
    /// guard from `VmConfig::max_frames`.
    pub max_frames: usize,
    /// Root table accepting temporary pins (spec §4.1 "Roots (ii)").
    pub root_table: GcRef<Table>,
}

impl VmContext {
    pub fn new(initial_gc_interval: usize, max_frames: usize) -> Self {
        let heap = Heap::new(initial_gc_interval);
        let root_table = heap.alloc(MemType::Table, Table::new()).expect("bootstrap root table allocation");
        heap.pin(root_table);
        VmContext { heap, current_fiber: std::cell::Cell::new(None), auto_suspend: std::cell::Cell::new(0), max_frames, root_table }
    }

    pub fn current_fiber(&self) -> Option<GcRef<Fiber>> {
        self.current_fiber.get()
    }

    /// `vm_load` (spec §6.2): restores the fiber a snapshot was taken
    /// against.
    pub fn set_current_fiber(&self, fiber: Option<GcRef<Fiber>>) {
        self.current_fiber.set(fiber);
    }

    /// `interpreter_interrupt` (spec §6.2): arms cooperative interruption.
    pub fn interrupt(&self) {
        self.auto_suspend.set(self.auto_suspend.get() + 1);
    }

    /// `interpreter_interrupt_handled` (spec §6.2): disarms one pending
    /// interrupt.
    pub fn interrupt_handled(&self) {
        let n = self.auto_suspend.get();
        if n > 0 {
            self.auto_suspend.set(n - 1);
        }
    }

    fn roots(&self) -> Vec<RootValue> {
        let mut roots = vec![RootValue::Table(self.root_table)];
        if let Some(f) = self.current_fiber.get() {
            // `Fiber::trace` marks `parent`/`child` transitively, so rooting
            // the currently-running fiber alone covers the whole chain
            // (spec §4.1 "Roots (i)").
            roots.push(RootValue::Fiber(f));
        }
        roots
    }

    pub fn maybe_collect(&self) -> bool {
        let roots = self.roots();
        self.heap.maybe_collect(&roots)
    }

    pub fn collect_now(&self) {
        let roots = self.roots();
        self.heap.collect(&roots);
    }
}

fn error_value(ctx: &VmContext, msg: &str) -> Value {
    match ctx.heap.intern_string(msg.as_bytes()) {
        Ok(r) => Value::String(r),
        Err(_) => Value::Nil,
    }
}

/// `resume(fiber, value)` (spec §4.2). Drives the interpreter until the
/// fiber yields, returns, or errors, then restores `current_fiber`.
pub fn resume(ctx: &VmContext, fiber: GcRef<Fiber>, value: Value) -> (Signal, Value) {
    resume_impl(ctx, fiber, value, false)
}

/// `step(fiber, in)` (spec §6.2): runs exactly one bytecode instruction
/// instead of driving to the next suspension point.
pub fn step(ctx: &VmContext, fiber: GcRef<Fiber>, value: Value) -> (Signal, Value) {
    resume_impl(ctx, fiber, value, true)
}

fn resume_impl(ctx: &VmContext, fiber: GcRef<Fiber>, value: Value, single_step: bool) -> (Signal, Value) {
    if matches!(fiber.status, Status::Dead | Status::Alive) {
        let err = VmError::CannotResume { status: fiber.status.name() };
        return (Signal::Error(error_value(ctx, &err.to_string())), value);
    }

    let was_new = fiber.status == Status::New;
    let previous = ctx.current_fiber.replace(Some(fiber));
    unsafe {
        let f = fiber.as_mut();
        f.parent = previous;
        f.status = Status::Alive;
        if let Some(p) = previous {
            p.as_mut().child = Some(fiber);
        }
    }

    let outcome = if was_new {
        enter_initial_call(ctx, fiber, value, single_step)
    } else {
        // A suspended fiber is resumed by writing `value` into the register
        // its suspending `TRANSFER`/breakpoint recorded as the handoff slot
        // (stashed in that frame's `return_slot`, unused while merely
        // suspended) and continuing from the saved `pc`.
        deliver_pending(fiber, value);
        drive(ctx, fiber, single_step)
    };

    unsafe {
        ctx.current_fiber.set(previous);
        if let Some(p) = previous {
            p.as_mut().child = None;
        }
    }
    outcome
}

fn deliver_pending(fiber: GcRef<Fiber>, value: Value) {
    if let Some(frame) = fiber.current_frame() {
        let slot = frame.return_slot;
        unsafe {
            let _ = fiber.as_mut().set_register(slot as u32, value);
        }
    }
}

/// A zero-arity entry function never sees the resume value as an argument
/// (spec §4.2 "passing `value` as the argument ... if the function's arity
/// admits it") — a nullary toplevel thunk has nowhere to put it.
fn entry_nargs(def: &FuncDef) -> u32 {
    if def.arity_max == Some(0) { 0 } else { 1 }
}

fn enter_initial_call(ctx: &VmContext, fiber: GcRef<Fiber>, value: Value, single_step: bool) -> (Signal, Value) {
    let entry = match unsafe { fiber.as_mut() }.take_pending_entry() {
        Some(f) => f,
        None => return (Signal::Error(error_value(ctx, "fiber has no pending entry")), value),
    };
    let def = entry.def();
    let nargs = entry_nargs(&def);
    let staged_base = fiber.frame_top;
    if nargs > 0 {
        unsafe {
            let _ = fiber.as_mut().push_arg(value);
        }
    }
    if let Err(e) = check_arity(def.arity_min, def.arity_max, nargs) {
        return (signal_for_err(ctx, fiber, e), Value::Nil);
    }
    let slot_count = def.slot_count as usize;
    let pushed = unsafe { fiber.as_mut() }.push_call_frame(entry, staged_base, slot_count, 0, 0);
    if let Err(e) = pushed {
        return (signal_for_err(ctx, fiber, e), Value::Nil);
    }
    drive(ctx, fiber, single_step)
}

fn check_arity(min: u32, max: Option<u32>, got: u32) -> VmResult<()> {
    let expected_max = max.unwrap_or(got.max(min));
    if got < min || max.is_some_and(|m| got > m) {
        return Err(VmError::Arity { expected_min: min, expected_max, got });
    }
    Ok(())
}

fn signal_for_err(ctx: &VmContext, fiber: GcRef<Fiber>, err: VmError) -> Signal {
    let value = error_value(ctx, &err.to_string());
    unsafe {
        let _ = fiber.as_mut().cancel(value.clone());
    }
    Signal::Error(value)
}

/// The interpreter's fetch/decode/execute cycle. With `single_step = false`
/// runs until the fiber's entry frame returns (`Dead`), it suspends via
/// `TRANSFER`/breakpoint (`Pending`), or an error propagates (`Errored`).
/// With `single_step = true` (spec §6.2 `step`) executes exactly one
/// instruction and returns — `Signal::Debug(Nil)` if the function did not
/// itself complete on that instruction.
fn drive(ctx: &VmContext, fiber: GcRef<Fiber>, single_step: bool) -> (Signal, Value) {
    loop {
        if ctx.auto_suspend.get() > 0 {
            unsafe { fiber.as_mut().status = Status::Pending };
            return (Signal::Debug(Value::Nil), Value::Nil);
        }

        let (def, pc, is_c_frame) = {
            let frame = match fiber.current_frame() {
                Some(f) => f,
                None => {
                    unsafe { fiber.as_mut().status = Status::Dead };
                    return (Signal::Ok(Value::Nil), Value::Nil);
                }
            };
            if frame.flags.is_c_frame {
                (None, frame.pc, true)
            } else {
                (frame.function.map(|f| f.def()), frame.pc, false)
            }
        };
        if is_c_frame {
            unsafe { fiber.as_mut().status = Status::Errored };
            return (Signal::Error(error_value(ctx, "stepped into a native frame with no continuation")), Value::Nil);
        }
        let def = match def {
            Some(d) => d,
            None => {
                unsafe { fiber.as_mut().status = Status::Errored };
                return (Signal::Error(error_value(ctx, "frame has no function")), Value::Nil);
            }
        };

        let word = match def.bytecode.get(pc) {
            Some(w) => *w,
            None => {
                unsafe { fiber.as_mut().status = Status::Errored };
                return (Signal::Error(error_value(ctx, "pc ran past verified bytecode")), Value::Nil);
            }
        };
        let decoded = decode(word).expect("verifier guarantees every opcode is known");

        if decoded.breakpoint {
            unsafe { fiber.as_mut().status = Status::Pending };
            return (Signal::Debug(Value::Nil), Value::Nil);
        }

        match dispatch(ctx, fiber, def, pc, decoded.opcode, decoded.raw_operands) {
            Ok(Step::Continue(next_pc)) => {
                if let Some(f) = unsafe { fiber.as_mut() }.current_frame_mut() {
                    f.pc = next_pc;
                }
                if single_step {
                    return (Signal::Debug(Value::Nil), Value::Nil);
                }
            }
            Ok(Step::Return(signal, value)) => return (signal, value),
            Err(e) => {
                let value = error_value(ctx, &e.to_string());
                unsafe { fiber.as_mut().status = Status::Errored };
                return (Signal::Error(value), Value::Nil);
            }
        }

        ctx.maybe_collect();
    }
}

enum Step {
    Continue(usize),
    Return(Signal, Value),
}

fn reg(fiber: GcRef<Fiber>, slot: u32) -> VmResult<Value> {
    fiber.register(slot).cloned()
}

fn set_reg(fiber: GcRef<Fiber>, slot: u32, v: Value) -> VmResult<()> {
    unsafe { fiber.as_mut().set_register(slot, v) }
}

fn as_number(v: &Value) -> VmResult<f64> {
    match v {
        Value::Number(n) => Ok(*n),
        other => Err(VmError::Type { expected: "number", got: other.type_of().name() }),
    }
}

fn as_i64(v: &Value) -> VmResult<i64> {
    Ok(as_number(v)? as i64)
}

fn dispatch(ctx: &VmContext, fiber: GcRef<Fiber>, def: GcRef<FuncDef>, pc: usize, op: Opcode, operands: u32) -> VmResult<Step> {
    let next = pc + 1;
    match op {
        Opcode::Noop => Ok(Step::Continue(next)),

        Opcode::Error => {
            let value = reg(fiber, operands & 0x00ff_ffff)?;
            unsafe { fiber.as_mut().status = Status::Errored };
            Ok(Step::Return(Signal::Error(value.clone()), value))
        }

        Opcode::Typecheck => {
            let (slot, mask_bits) = decode_su(operands);
            let v = reg(fiber, slot as u32)?;
            let mask = typeset_from_bits(mask_bits);
            if !v.check_types(mask) {
                return Err(VmError::Type { expected: "matching typecheck mask", got: v.type_of().name() });
            }
            Ok(Step::Continue(next))
        }

        Opcode::Return | Opcode::ReturnNil => {
            let value = if op == Opcode::Return { reg(fiber, operands & 0x00ff_ffff)? } else { Value::Nil };
            do_return(fiber, value)
        }

        Opcode::AddInteger | Opcode::SubtractInteger | Opcode::MultiplyInteger | Opcode::DivideInteger => {
            let (d, a, b) = decode_sss(operands);
            let (x, y) = (as_i64(&reg(fiber, a as u32)?)?, as_i64(&reg(fiber, b as u32)?)?);
            let result = match op {
                Opcode::AddInteger => x.wrapping_add(y),
                Opcode::SubtractInteger => x.wrapping_sub(y),
                Opcode::MultiplyInteger => x.wrapping_mul(y),
                Opcode::DivideInteger => {
                    if y == 0 {
                        return Err(VmError::DivisionByZero);
                    }
                    x.wrapping_div(y)
                }
                _ => unreachable!(),
            };
            set_reg(fiber, d as u32, Value::Number(result as f64))?;
            Ok(Step::Continue(next))
        }

        Opcode::AddReal
        | Opcode::SubtractReal
        | Opcode::MultiplyReal
        | Opcode::DivideReal
        | Opcode::Add
        | Opcode::Subtract
        | Opcode::Multiply
        | Opcode::Divide => {
            let (d, a, b) = decode_sss(operands);
            let (x, y) = (as_number(&reg(fiber, a as u32)?)?, as_number(&reg(fiber, b as u32)?)?);
            let result = match op {
                Opcode::AddReal | Opcode::Add => x + y,
                Opcode::SubtractReal | Opcode::Subtract => x - y,
                Opcode::MultiplyReal | Opcode::Multiply => x * y,
                Opcode::DivideReal | Opcode::Divide => {
                    if y == 0.0 {
                        return Err(VmError::DivisionByZero);
                    }
                    x / y
                }
                _ => unreachable!(),
            };
            set_reg(fiber, d as u32, Value::Number(result))?;
            Ok(Step::Continue(next))
        }

        Opcode::AddImmediate | Opcode::MultiplyImmediate => {
            let (d, s, imm) = decode_ssi(operands);
            let x = as_number(&reg(fiber, s as u32)?)?;
            let result = if op == Opcode::AddImmediate { x + imm as f64 } else { x * imm as f64 };
            set_reg(fiber, d as u32, Value::Number(result))?;
            Ok(Step::Continue(next))
        }

        Opcode::Band | Opcode::Bor | Opcode::Bxor => {
            let (d, a, b) = decode_sss(operands);
            let (x, y) = (as_i64(&reg(fiber, a as u32)?)?, as_i64(&reg(fiber, b as u32)?)?);
            let result = match op {
                Opcode::Band => x & y,
                Opcode::Bor => x | y,
                Opcode::Bxor => x ^ y,
                _ => unreachable!(),
            };
            set_reg(fiber, d as u32, Value::Number(result as f64))?;
            Ok(Step::Continue(next))
        }

        Opcode::Bnot => {
            let (d, s) = decode_ss(operands);
            let x = as_i64(&reg(fiber, s as u32)?)?;
            set_reg(fiber, d as u32, Value::Number(!x as f64))?;
            Ok(Step::Continue(next))
        }

        Opcode::ShiftLeft | Opcode::ShiftRight | Opcode::ShiftRightUnsigned => {
            let (d, a, b) = decode_sss(operands);
            let x = as_i64(&reg(fiber, a as u32)?)?;
            let shift = (as_i64(&reg(fiber, b as u32)?)? & 63) as u32;
            let result = match op {
                Opcode::ShiftLeft => x.wrapping_shl(shift),
                Opcode::ShiftRight => x.wrapping_shr(shift),
                Opcode::ShiftRightUnsigned => ((x as u64).wrapping_shr(shift)) as i64,
                _ => unreachable!(),
            };
            set_reg(fiber, d as u32, Value::Number(result as f64))?;
            Ok(Step::Continue(next))
        }

        Opcode::ShiftLeftImmediate | Opcode::ShiftRightImmediate | Opcode::ShiftRightUnsignedImmediate => {
            let (d, s, imm) = decode_ssi(operands);
            let x = as_i64(&reg(fiber, s as u32)?)?;
            let shift = (imm as i32 & 63) as u32;
            let result = match op {
                Opcode::ShiftLeftImmediate => x.wrapping_shl(shift),
                Opcode::ShiftRightImmediate => x.wrapping_shr(shift),
                Opcode::ShiftRightUnsignedImmediate => ((x as u64).wrapping_shr(shift)) as i64,
                _ => unreachable!(),
            };
            set_reg(fiber, d as u32, Value::Number(result as f64))?;
            Ok(Step::Continue(next))
        }

        // `MOVE_NEAR (dest:u8, src:u16)` vs. `MOVE_FAR (src:u8, dest:u16)` —
        // the wide field always carries whichever operand needs more than
        // 255 distinct values; for MOVE_NEAR that's the source (copying
        // down from a far temporary), for MOVE_FAR the destination.
        Opcode::MoveNear => {
            let (dest, src) = decode_ss(operands);
            let value = reg(fiber, src as u32)?;
            set_reg(fiber, dest as u32, value)?;
            Ok(Step::Continue(next))
        }
        Opcode::MoveFar => {
            let (src, dest) = decode_ss(operands);
            let value = reg(fiber, src as u32)?;
            set_reg(fiber, dest as u32, value)?;
            Ok(Step::Continue(next))
        }

        Opcode::Jump => {
            let offset = decode_l(operands);
            Ok(Step::Continue(((next as i64) + offset as i64) as usize))
        }

        Opcode::JumpIf | Opcode::JumpIfNot => {
            let (slot, offset) = decode_sl(operands);
            let v = reg(fiber, slot as u32)?;
            let take = if op == Opcode::JumpIf { v.truthy() } else { !v.truthy() };
            if take {
                Ok(Step::Continue(((next as i64) + offset as i64) as usize))
            } else {
                Ok(Step::Continue(next))
            }
        }

        Opcode::GreaterThan | Opcode::LessThan | Opcode::Equals => {
            let (d, a, b) = decode_sss(operands);
            let (x, y) = (reg(fiber, a as u32)?, reg(fiber, b as u32)?);
            let result = match op {
                Opcode::GreaterThan => x.compare(&y) == std::cmp::Ordering::Greater,
                Opcode::LessThan => x.compare(&y) == std::cmp::Ordering::Less,
                Opcode::Equals => x.value_eq(&y),
                _ => unreachable!(),
            };
            set_reg(fiber, d as u32, Value::Boolean(result))?;
            Ok(Step::Continue(next))
        }

        Opcode::Compare => {
            let (d, a, b) = decode_sss(operands);
            let (x, y) = (reg(fiber, a as u32)?, reg(fiber, b as u32)?);
            let n = match x.compare(&y) {
                std::cmp::Ordering::Less => -1.0,
                std::cmp::Ordering::Equal => 0.0,
                std::cmp::Ordering::Greater => 1.0,
            };
            set_reg(fiber, d as u32, Value::Number(n))?;
            Ok(Step::Continue(next))
        }

        Opcode::LoadNil => {
            set_reg(fiber, operands & 0x00ff_ffff, Value::Nil)?;
            Ok(Step::Continue(next))
        }
        Opcode::LoadTrue => {
            set_reg(fiber, operands & 0x00ff_ffff, Value::Boolean(true))?;
            Ok(Step::Continue(next))
        }
        Opcode::LoadFalse => {
            set_reg(fiber, operands & 0x00ff_ffff, Value::Boolean(false))?;
            Ok(Step::Continue(next))
        }
        Opcode::LoadInteger => {
            let (s, imm) = decode_si(operands);
            set_reg(fiber, s as u32, Value::Number(imm as f64))?;
            Ok(Step::Continue(next))
        }
        Opcode::LoadConstant => {
            let (s, idx) = decode_sc(operands);
            let c = def.constants.get(idx as usize).cloned().ok_or(VmError::Bounds { index: idx as i64, len: def.constants.len() })?;
            set_reg(fiber, s as u32, c)?;
            Ok(Step::Continue(next))
        }
        Opcode::LoadSelf => {
            let slot = operands & 0x00ff_ffff;
            let current_function = fiber.current_frame().and_then(|f| f.function).ok_or(VmError::Panic("LOAD_SELF outside a function frame".into()))?;
            set_reg(fiber, slot, Value::Function(current_function))?;
            Ok(Step::Continue(next))
        }

        Opcode::LoadUpvalue | Opcode::SetUpvalue => {
            let (a, env_idx, b) = decode_ses(operands);
            let current_function = fiber.current_frame().and_then(|f| f.function).ok_or(VmError::Panic("upvalue op outside a function frame".into()))?;
            let env = *current_function
                .envs()
                .get(env_idx as usize)
                .ok_or(VmError::Bounds { index: env_idx as i64, len: current_function.envs().len() })?;
            if op == Opcode::LoadUpvalue {
                let value = env.get(b as usize).ok_or(VmError::Bounds { index: b as i64, len: 0 })?;
                set_reg(fiber, a as u32, value)?;
            } else {
                let value = reg(fiber, a as u32)?;
                if !env.set(b as usize, value) {
                    return Err(VmError::Panic("SET_UPVALUE on a detached-only environment slot".into()));
                }
            }
            Ok(Step::Continue(next))
        }

        Opcode::Closure => {
            let (slot, def_idx) = decode_sd(operands);
            let nested = *def.nested_defs.get(def_idx as usize).ok_or(VmError::Bounds { index: def_idx as i64, len: def.nested_defs.len() })?;
            let envs = capture_envs(ctx, fiber, &nested.env_captures)?;
            let function = Function::new(nested, envs)?;
            let func_ref = ctx.heap.alloc(MemType::Function, function)?;
            ctx.heap.enable_gc(func_ref);
            set_reg(fiber, slot as u32, Value::Function(func_ref))?;
            Ok(Step::Continue(next))
        }

        Opcode::Push => {
            let v = reg(fiber, operands & 0x00ff_ffff)?;
            unsafe { fiber.as_mut().push_arg(v)? };
            Ok(Step::Continue(next))
        }
        Opcode::Push2 => {
            let (a, b) = decode_ss(operands);
            let (va, vb) = (reg(fiber, a as u32)?, reg(fiber, b as u32)?);
            unsafe {
                let f = fiber.as_mut();
                f.push_arg(va)?;
                f.push_arg(vb)?;
            }
            Ok(Step::Continue(next))
        }
        Opcode::Push3 => {
            let (a, b, c) = decode_sss(operands);
            let (va, vb, vc) = (reg(fiber, a as u32)?, reg(fiber, b as u32)?, reg(fiber, c as u32)?);
            unsafe {
                let f = fiber.as_mut();
                f.push_arg(va)?;
                f.push_arg(vb)?;
                f.push_arg(vc)?;
            }
            Ok(Step::Continue(next))
        }
        Opcode::PushArray => {
            let v = reg(fiber, operands & 0x00ff_ffff)?;
            match v {
                Value::Array(r) => {
                    let items: Vec<Value> = r.as_slice().to_vec();
                    for item in items {
                        unsafe { fiber.as_mut().push_arg(item)? };
                    }
                }
                Value::Tuple(r) => {
                    let items: Vec<Value> = r.as_slice().to_vec();
                    for item in items {
                        unsafe { fiber.as_mut().push_arg(item)? };
                    }
                }
                other => return Err(VmError::Type { expected: "array or tuple", got: other.type_of().name() }),
            }
            Ok(Step::Continue(next))
        }

        Opcode::Call => {
            let (dest, callee_slot) = decode_ss(operands);
            let callee = reg(fiber, callee_slot as u32)?;
            do_call(ctx, fiber, dest as u32, callee, next)
        }

        Opcode::Tailcall => {
            let callee_slot = operands & 0x00ff_ffff;
            let callee = reg(fiber, callee_slot)?;
            do_tailcall(fiber, callee)
        }

        Opcode::Transfer => {
            let (dest, target_slot, value_slot) = decode_sss(operands);
            let target = reg(fiber, target_slot as u32)?;
            let value = reg(fiber, value_slot as u32)?;
            do_transfer(ctx, fiber, dest as u32, target, value, next)
        }

        Opcode::Get => {
            let (d, ds, key_slot) = decode_sss(operands);
            let (container, key) = (reg(fiber, ds as u32)?, reg(fiber, key_slot as u32)?);
            let result = get_polymorphic(&container, &key)?;
            set_reg(fiber, d as u32, result)?;
            Ok(Step::Continue(next))
        }
        Opcode::Put => {
            let (ds, key_slot, val_slot) = decode_sss(operands);
            let (container, key, val) = (reg(fiber, ds as u32)?, reg(fiber, key_slot as u32)?, reg(fiber, val_slot as u32)?);
            put_polymorphic(&container, key, val)?;
            Ok(Step::Continue(next))
        }
        Opcode::GetIndex => {
            let (d, ds, idx) = decode_ssu(operands);
            let container = reg(fiber, ds as u32)?;
            let result = get_polymorphic(&container, &Value::Number(idx as f64))?;
            set_reg(fiber, d as u32, result)?;
            Ok(Step::Continue(next))
        }
        Opcode::PutIndex => {
            let (ds, idx, val_slot) = decode_ssu(operands);
            let (container, val) = (reg(fiber, ds as u32)?, reg(fiber, val_slot as u32)?);
            put_polymorphic(&container, Value::Number(idx as f64), val)?;
            Ok(Step::Continue(next))
        }
        Opcode::Length => {
            let (d, ds) = decode_ss(operands);
            let container = reg(fiber, ds as u32)?;
            let len = length_of(&container)?;
            set_reg(fiber, d as u32, Value::Number(len as f64))?;
            Ok(Step::Continue(next))
        }
        Opcode::Next => {
            let (d, ds, key_slot) = decode_sss(operands);
            let (container, key) = (reg(fiber, ds as u32)?, reg(fiber, key_slot as u32)?);
            let result = next_polymorphic(&container, &key)?;
            set_reg(fiber, d as u32, result)?;
            Ok(Step::Continue(next))
        }
    }
}

fn capture_envs(ctx: &VmContext, fiber: GcRef<Fiber>, captures: &[EnvCaptureDescriptor]) -> VmResult<Vec<GcRef<FuncEnv>>> {
    let mut envs = Vec::with_capacity(captures.len());
    for cap in captures {
        let mut frame_idx = fiber.frame;
        for _ in 0..cap.relative_depth {
            frame_idx = fiber
                .frame_by_index(frame_idx)
                .and_then(|f| f.prev_frame)
                .ok_or(VmError::Panic("CLOSURE capture depth exceeds call chain".into()))?;
        }
        let frame = *fiber.frame_by_index(frame_idx).ok_or(VmError::Panic("CLOSURE capture frame vanished".into()))?;
        let env = match frame.attached_env {
            Some(existing) => existing,
            None => {
                let new_env = FuncEnv::new_live(fiber, frame.base, frame.slot_count);
                let env_ref = ctx.heap.alloc(MemType::FuncEnv, new_env)?;
                ctx.heap.enable_gc(env_ref);
                if let Some(f) = unsafe { fiber.as_mut() }.frame_by_index_mut(frame_idx) {
                    f.attached_env = Some(env_ref);
                }
                env_ref
            }
        };
        envs.push(env);
    }
    Ok(envs)
}

fn do_return(fiber: GcRef<Fiber>, value: Value) -> VmResult<Step> {
    let was_entry = fiber.is_entry_frame();
    let return_slot = fiber.current_frame().map(|f| f.return_slot).unwrap_or(0);
    unsafe { fiber.as_mut() }.pop_frame()?;
    if was_entry {
        unsafe { fiber.as_mut().status = Status::Dead };
        return Ok(Step::Return(Signal::Ok(value.clone()), value));
    }
    set_reg(fiber, return_slot as u32, value)?;
    let pc = fiber.current_frame().map(|f| f.pc).unwrap_or(0);
    Ok(Step::Continue(pc))
}

fn do_call(ctx: &VmContext, fiber: GcRef<Fiber>, dest: u32, callee: Value, return_pc: usize) -> VmResult<Step> {
    let staged_base = fiber.frame_top;
    match callee {
        Value::CFunction(ptr) => {
            let args: Vec<Value> = fiber.staged_args(staged_base).to_vec();
            unsafe { fiber.as_mut().clear_staged(staged_base) };
            let view = crate::value::CArgs::new(&args);
            ptr(&view)?;
            set_reg(fiber, dest, view.take_ret())?;
            Ok(Step::Continue(return_pc))
        }
        Value::Function(f) => {
            let def = f.def();
            let nargs = (fiber.stack_top - staged_base) as u32;
            check_arity(def.arity_min, def.arity_max, nargs)?;
            unsafe { fiber.as_mut() }.push_call_frame(f, staged_base, def.slot_count as usize, return_pc, dest as u8)?;
            if fiber.frame_depth() > ctx.max_frames {
                return Err(VmError::StackOverflow { depth: fiber.frame_depth(), cap: ctx.max_frames });
            }
            Ok(Step::Continue(0))
        }
        other => Err(VmError::Type { expected: "function or cfunction", got: other.type_of().name() }),
    }
}

fn do_tailcall(fiber: GcRef<Fiber>, callee: Value) -> VmResult<Step> {
    let staged_base = fiber.frame_top;
    match callee {
        Value::CFunction(ptr) => {
            let args: Vec<Value> = fiber.staged_args(staged_base).to_vec();
            unsafe { fiber.as_mut().clear_staged(staged_base) };
            let view = crate::value::CArgs::new(&args);
            ptr(&view)?;
            do_return(fiber, view.take_ret())
        }
        Value::Function(f) => {
            let def = f.def();
            let nargs = (fiber.stack_top - staged_base) as u32;
            check_arity(def.arity_min, def.arity_max, nargs)?;
            unsafe { fiber.as_mut() }.push_tailcall_frame(f, staged_base, def.slot_count as usize)?;
            Ok(Step::Continue(0))
        }
        other => Err(VmError::Type { expected: "function or cfunction", got: other.type_of().name() }),
    }
}

/// `TRANSFER` (spec §4.2 resume contract folded into an instruction, spec
/// §5 "suspension only at ... TRANSFER"): `target == Nil` suspends this
/// fiber outward to its resumer (a `yield`); `target` a `Fiber` resumes
/// that fiber synchronously and writes its result back before continuing.
fn do_transfer(ctx: &VmContext, fiber: GcRef<Fiber>, dest: u32, target: Value, value: Value, return_pc: usize) -> VmResult<Step> {
    match target {
        Value::Nil => {
            if let Some(f) = unsafe { fiber.as_mut() }.current_frame_mut() {
                f.pc = return_pc;
                f.return_slot = dest as u8;
            }
            unsafe { fiber.as_mut().status = Status::Pending };
            Ok(Step::Return(Signal::Yield(value.clone()), value))
        }
        Value::Fiber(target_fiber) => {
            let (signal, result) = resume(ctx, target_fiber, value);
            if let Signal::Error(e) = signal {
                return Err(VmError::Panic(crate::format::print_value(&e)));
            }
            set_reg(fiber, dest, result)?;
            Ok(Step::Continue(return_pc))
        }
        _other => Err(VmError::InvalidTransferTarget),
    }
}

pub(crate) fn get_polymorphic(container: &Value, key: &Value) -> VmResult<Value> {
    match container {
        Value::Table(t) => Ok(t.get(key).unwrap_or(Value::Nil)),
        Value::Struct(s) => Ok(s.get(key).cloned().unwrap_or(Value::Nil)),
        Value::Array(a) => {
            let i = as_i64(key)?;
            Ok(index_seq(a.len(), i).and_then(|idx| a.get(idx).cloned()).unwrap_or(Value::Nil))
        }
        Value::Tuple(t) => {
            let i = as_i64(key)?;
            Ok(index_seq(t.len(), i).and_then(|idx| t.get(idx).cloned()).unwrap_or(Value::Nil))
        }
        Value::Buffer(b) => {
            let i = as_i64(key)?;
            Ok(index_seq(b.len(), i).and_then(|idx| b.as_bytes().get(idx)).map(|&byte| Value::Number(byte as f64)).unwrap_or(Value::Nil))
        }
        Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => {
            let i = as_i64(key)?;
            Ok(index_seq(s.len(), i).and_then(|idx| s.as_bytes().get(idx)).map(|&byte| Value::Number(byte as f64)).unwrap_or(Value::Nil))
        }
        Value::Abstract(av) => Ok(av.get(key)?.unwrap_or(Value::Nil)),
        other => Err(VmError::Type { expected: "indexable", got: other.type_of().name() }),
    }
}

pub(crate) fn put_polymorphic(container: &Value, key: Value, value: Value) -> VmResult<()> {
    match container {
        Value::Table(t) => unsafe { t.as_mut().put(key, value) },
        Value::Array(a) => {
            let i = as_i64(&key)?;
            let idx = index_seq(a.len(), i).ok_or(VmError::Bounds { index: i, len: a.len() })?;
            if unsafe { a.as_mut() }.set(idx, value) {
                Ok(())
            } else {
                Err(VmError::Bounds { index: i, len: a.len() })
            }
        }
        Value::Buffer(b) => {
            let i = as_i64(&key)?;
            let idx = index_seq(b.len(), i).ok_or(VmError::Bounds { index: i, len: b.len() })?;
            let byte = as_i64(&value)? as u8;
            if unsafe { b.as_mut() }.set_byte(idx, byte) {
                Ok(())
            } else {
                Err(VmError::Bounds { index: i, len: b.len() })
            }
        }
        Value::Abstract(av) => unsafe { av.as_mut() }.put(&key, value),
        other => Err(VmError::Type { expected: "mutable container", got: other.type_of().name() }),
    }
}

/// `next(ds, key)` (spec §9): a single primitive polymorphic over every
/// container kind. `key == Nil` starts iteration; for `Table`/`Struct` the
/// key that comes back is whatever key type the entry was stored under,
/// for the sequence types (`Array`/`Tuple`/`Buffer`/string kinds) it's the
/// next integer index. Exhausted iteration yields `Nil` either way, so a
/// caller can drive a loop with `next` alone without a separate "has more"
/// check.
fn next_polymorphic(container: &Value, key: &Value) -> VmResult<Value> {
    match container {
        Value::Table(t) => Ok(t.next_key(key).unwrap_or(Value::Nil)),
        Value::Struct(s) => Ok(s.next_key(key).unwrap_or(Value::Nil)),
        Value::Array(a) => Ok(next_seq_key(a.len(), key)?.unwrap_or(Value::Nil)),
        Value::Tuple(t) => Ok(next_seq_key(t.len(), key)?.unwrap_or(Value::Nil)),
        Value::Buffer(b) => Ok(next_seq_key(b.len(), key)?.unwrap_or(Value::Nil)),
        Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => Ok(next_seq_key(s.len(), key)?.unwrap_or(Value::Nil)),
        other => Err(VmError::Type { expected: "iterable", got: other.type_of().name() }),
    }
}

/// Shared by every sequence-shaped container's `next`: `Nil` starts at
/// index 0, otherwise `key` must be the previous index and the result is
/// `key + 1`, or `None` once that runs off the end.
fn next_seq_key(len: usize, key: &Value) -> VmResult<Option<Value>> {
    let idx = match key {
        Value::Nil => 0i64,
        other => as_i64(other)?.checked_add(1).ok_or(VmError::Bounds { index: i64::MAX, len })?,
    };
    if idx >= 0 && (idx as usize) < len {
        Ok(Some(Value::Number(idx as f64)))
    } else {
        Ok(None)
    }
}

pub(crate) fn length_of(v: &Value) -> VmResult<usize> {
    match v {
        Value::Array(a) => Ok(a.len()),
        Value::Tuple(t) => Ok(t.len()),
        Value::Table(t) => Ok(t.len()),
        Value::Struct(s) => Ok(s.len()),
        Value::Buffer(b) => Ok(b.len()),
        Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => Ok(s.len()),
        other => Err(VmError::Type { expected: "sequence or dict", got: other.type_of().name() }),
    }
}

/// Negative indices count from the end (a common Lisp-family convention
/// left to the implementation); out-of-range indices return `None` so
/// callers can map them to `nil` (GET) or a bounds error (PUT).
fn index_seq(len: usize, i: i64) -> Option<usize> {
    if i >= 0 {
        let idx = i as usize;
        if idx < len {
            Some(idx)
        } else {
            None
        }
    } else {
        let back = (-i) as usize;
        if back <= len {
            Some(len - back)
        } else {
            None
        }
    }
}

fn typeset_from_bits(bits: u16) -> TypeSet {
    let mut set = TypeSet::EMPTY;
    for ty in [
        Type::Nil,
        Type::Boolean,
        Type::Number,
        Type::String,
        Type::Symbol,
        Type::Keyword,
        Type::Array,
        Type::Tuple,
        Type::Table,
        Type::Struct,
        Type::Buffer,
        Type::Function,
        Type::CFunction,
        Type::Fiber,
        Type::Abstract,
        Type::Pointer,
    ] {
        if bits & (1 << (ty as u32)) != 0 {
            set = set.with(ty);
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::*;
    use crate::funcdef::FuncDef;
    use crate::verify::verify;

    fn build_function(ctx: &VmContext, bytecode: Vec<u32>, constants: Vec<Value>, slot_count: u32, arity: u32) -> GcRef<Function> {
        let mut def = FuncDef::new(bytecode, constants, slot_count);
        def.arity_min = arity;
        def.arity_max = Some(arity);
        verify(&mut def).unwrap();
        let def_ref = ctx.heap.alloc(MemType::FuncDef, def).unwrap();
        ctx.heap.enable_gc(def_ref);
        let function = Function::new(def_ref, vec![]).unwrap();
        let f_ref = ctx.heap.alloc(MemType::Function, function).unwrap();
        ctx.heap.enable_gc(f_ref);
        f_ref
    }

    #[test]
    fn runs_return_nil_entry() {
        let ctx = VmContext::new(1 << 20, 1000);
        let f = build_function(&ctx, vec![encode_zero(Opcode::ReturnNil)], vec![], 1, 0);
        let fiber = Fiber::new(f, 16);
        let fiber_ref = ctx.heap.alloc(MemType::Fiber, fiber).unwrap();
        ctx.heap.enable_gc(fiber_ref);
        let (signal, value) = resume(&ctx, fiber_ref, Value::Nil);
        assert!(matches!(signal, Signal::Ok(_)));
        assert_eq!(value, Value::Nil);
    }

    #[test]
    fn add_integer_and_return() {
        let ctx = VmContext::new(1 << 20, 1000);
        let bytecode = vec![
            encode_sc(Opcode::LoadConstant, 0, 0),
            encode_sc(Opcode::LoadConstant, 1, 1),
            encode_sss(Opcode::AddInteger, 2, 0, 1),
            encode_s(Opcode::Return, 2),
        ];
        let f = build_function(&ctx, bytecode, vec![Value::Number(2.0), Value::Number(3.0)], 3, 0);
        let fiber = Fiber::new(f, 16);
        let fiber_ref = ctx.heap.alloc(MemType::Fiber, fiber).unwrap();
        ctx.heap.enable_gc(fiber_ref);
        let (signal, value) = resume(&ctx, fiber_ref, Value::Nil);
        assert!(matches!(signal, Signal::Ok(_)));
        assert_eq!(value, Value::Number(5.0));
    }

    #[test]
    fn cannot_resume_dead_fiber() {
        let ctx = VmContext::new(1 << 20, 1000);
        let f = build_function(&ctx, vec![encode_zero(Opcode::ReturnNil)], vec![], 1, 0);
        let fiber = Fiber::new(f, 16);
        let fiber_ref = ctx.heap.alloc(MemType::Fiber, fiber).unwrap();
        ctx.heap.enable_gc(fiber_ref);
        resume(&ctx, fiber_ref, Value::Nil);
        let (signal, _) = resume(&ctx, fiber_ref, Value::Nil);
        assert!(matches!(signal, Signal::Error(_)));
    }

    #[test]
    fn next_walks_array_indices_then_nil() {
        let ctx = VmContext::new(1 << 20, 1000);
        let mut array = crate::containers::array::Array::new();
        array.push(Value::Number(10.0));
        array.push(Value::Number(20.0));
        let array_ref = ctx.heap.alloc(MemType::Array, array).unwrap();
        ctx.heap.enable_gc(array_ref);
        let container = Value::Array(array_ref);
        let first = next_polymorphic(&container, &Value::Nil).unwrap();
        assert_eq!(first, Value::Number(0.0));
        let second = next_polymorphic(&container, &first).unwrap();
        assert_eq!(second, Value::Number(1.0));
        let done = next_polymorphic(&container, &second).unwrap();
        assert_eq!(done, Value::Nil);
    }

    #[test]
    fn next_over_table_walks_keys_then_nil() {
        let ctx = VmContext::new(1 << 20, 1000);
        let mut table = crate::containers::table::Table::new();
        table.put(Value::Number(1.0), Value::Number(100.0)).unwrap();
        let table_ref = ctx.heap.alloc(MemType::Table, table).unwrap();
        ctx.heap.enable_gc(table_ref);
        let container = Value::Table(table_ref);
        let key = next_polymorphic(&container, &Value::Nil).unwrap();
        assert_eq!(key, Value::Number(1.0));
        let done = next_polymorphic(&container, &key).unwrap();
        assert_eq!(done, Value::Nil);
    }
}
