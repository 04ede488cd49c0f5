//! Fiber: a stackful coroutine that is also the call stack (spec §3.5, §4.2).
//!
//! Janet-family runtimes interleave `StackFrame` headers directly into the
//! same flat array as the value registers they precede. Rust has no safe way
//! to interleave a header struct and a `Value` payload inside one `Vec` slot
//! without an enum tag on every slot, so frame headers live in their own
//! `Vec<StackFrame>` here instead, indexed in lockstep with offsets into
//! `data`. The observable fields spec §3.5 lists (`frame`, `frame_top`,
//! `stack_top`, `parent`, `child`, `status`, `env`) and the frame operations
//! of §4.2 behave identically either way — this is a storage-layout
//! decision, not a semantic one. The geometric-growth discipline mirrors
//! the teacher's own stack growth in `stack.rs`, and the env-var-tunable
//! default capacity mirrors `scheduler.rs`'s `SEQ_STACK_SIZE`/
//! `parse_stack_size` pattern (wired up in [`crate::VmConfig`]).

use crate::containers::table::Table;
use crate::error::{VmError, VmResult};
use crate::funcdef::Function;
use crate::gc::{GcRef, Heap, Trace};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Alive,
    Pending,
    Dead,
    Errored,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Alive => "alive",
            Status::Pending => "pending",
            Status::Dead => "dead",
            Status::Errored => "errored",
        }
    }
}

/// Signal surfaced to whoever resumed a fiber (spec §6.6).
#[derive(Debug, Clone)]
pub enum Signal {
    Ok(Value),
    Error(Value),
    Debug(Value),
    Yield(Value),
    User(u8, Value),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags {
    pub tailcall: bool,
    /// Set on C frames (spec §3.5 invariant: "if a frame's function is null
    /// the `pc` slot stores an opaque cookie").
    pub is_c_frame: bool,
}

/// A frame header (spec §3.5). `function = None` marks a C frame.
#[derive(Debug, Clone, Copy)]
pub struct StackFrame {
    pub function: Option<GcRef<Function>>,
    pub pc: usize,
    pub prev_frame: Option<usize>,
    pub base: usize,
    pub slot_count: usize,
    pub flags: FrameFlags,
    /// FuncEnv this frame is currently backing, if any closure captured it
    /// before the frame popped (spec §3.4 "detached on pop").
    pub attached_env: Option<GcRef<crate::funcdef::FuncEnv>>,
    /// Register in the *caller's* frame that `RETURN`/`RETURN_NIL` deposits
    /// this call's result into (spec §4.3 "deposit value in the caller's
    /// result register"). Unused on the entry frame, which has no caller.
    pub return_slot: u8,
}

pub struct Fiber {
    pub data: Vec<Value>,
    pub capacity: usize,
    frames: Vec<StackFrame>,
    pub frame: usize,
    pub frame_top: usize,
    pub stack_top: usize,
    pub parent: Option<GcRef<Fiber>>,
    pub child: Option<GcRef<Fiber>>,
    pub status: Status,
    pub env: Option<GcRef<Table>>,
    /// The fiber's entry function, called once on the first `resume` while
    /// `status == New` (spec §4.2 "a single pending call to `function`").
    pending_entry: Option<GcRef<Function>>,
}

impl Fiber {
    pub fn new(function: GcRef<Function>, capacity: usize) -> Self {
        let capacity = capacity.max(16);
        Fiber {
            data: Vec::with_capacity(capacity),
            capacity,
            frames: Vec::new(),
            frame: 0,
            frame_top: 0,
            stack_top: 0,
            parent: None,
            child: None,
            status: Status::New,
            env: None,
            pending_entry: Some(function),
        }
    }

    pub fn take_pending_entry(&mut self) -> Option<GcRef<Function>> {
        self.pending_entry.take()
    }

    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.get(self.frame)
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.get_mut(self.frame)
    }

    pub fn frame_by_index(&self, idx: usize) -> Option<&StackFrame> {
        self.frames.get(idx)
    }

    pub fn frame_by_index_mut(&mut self, idx: usize) -> Option<&mut StackFrame> {
        self.frames.get_mut(idx)
    }

    /// Geometric growth (spec §4.2 "Stack growth"). Callers hold indices,
    /// never raw pointers, across this — the `Vec` may reallocate.
    pub fn ensure_capacity(&mut self, needed: usize) -> VmResult<()> {
        if needed <= self.capacity {
            return Ok(());
        }
        let mut new_cap = self.capacity.max(16);
        while new_cap < needed {
            new_cap = new_cap
                .checked_mul(2)
                .ok_or(VmError::OutOfMemory { requested: needed })?;
        }
        self.data.reserve(new_cap - self.data.len());
        self.capacity = new_cap;
        Ok(())
    }

    /// Pushes a value into the marshalling area above `stack_top`, ahead of
    /// the next `CALL`/`push_call_frame` (spec §4.3 "Argument staging").
    pub fn push_arg(&mut self, v: Value) -> VmResult<()> {
        self.ensure_capacity(self.stack_top + 1)?;
        if self.data.len() <= self.stack_top {
            self.data.resize(self.stack_top + 1, Value::Nil);
        }
        self.data[self.stack_top] = v;
        self.stack_top += 1;
        Ok(())
    }

    pub fn staged_args(&self, base: usize) -> &[Value] {
        &self.data[base..self.stack_top]
    }

    pub fn clear_staged(&mut self, base: usize) {
        self.stack_top = base;
    }

    /// `push_call_frame(function)` (spec §4.2): promotes staged args
    /// (`staged_base..stack_top`) into the new register window, zero-fills
    /// the rest up to `slot_count`.
    pub fn push_call_frame(
        &mut self,
        function: GcRef<Function>,
        staged_base: usize,
        slot_count: usize,
        return_pc: usize,
        return_slot: u8,
    ) -> VmResult<usize> {
        let base = self.frame_top;
        let nargs = self.stack_top.saturating_sub(staged_base);
        self.ensure_capacity(base + slot_count)?;
        if self.data.len() < base + slot_count {
            self.data.resize(base + slot_count, Value::Nil);
        }
        for i in 0..nargs.min(slot_count) {
            self.data[base + i] = self.data[staged_base + i].clone();
        }
        for i in nargs.min(slot_count)..slot_count {
            self.data[base + i] = Value::Nil;
        }
        self.stack_top = staged_base;

        let prev = if self.frames.is_empty() { None } else { Some(self.frame) };
        if let Some(f) = self.current_frame_mut() {
            f.pc = return_pc;
        }
        self.frames.push(StackFrame {
            function: Some(function),
            pc: 0,
            prev_frame: prev,
            base,
            slot_count,
            flags: FrameFlags::default(),
            attached_env: None,
            return_slot,
        });
        self.frame = self.frames.len() - 1;
        self.frame_top = base + slot_count;
        Ok(self.frame)
    }

    /// `push_tailcall_frame(function)` (spec §4.2): overwrites the current
    /// frame in place after detaching any env attached to it.
    pub fn push_tailcall_frame(
        &mut self,
        function: GcRef<Function>,
        staged_base: usize,
        slot_count: usize,
    ) -> VmResult<()> {
        self.detach_current_env();
        let base = self.current_frame().map(|f| f.base).unwrap_or(0);
        let nargs = self.stack_top.saturating_sub(staged_base);
        self.ensure_capacity(base + slot_count)?;
        if self.data.len() < base + slot_count {
            self.data.resize(base + slot_count, Value::Nil);
        }
        let mut tmp = Vec::with_capacity(nargs.min(slot_count));
        for i in 0..nargs.min(slot_count) {
            tmp.push(self.data[staged_base + i].clone());
        }
        for (i, v) in tmp.into_iter().enumerate() {
            self.data[base + i] = v;
        }
        for i in nargs.min(slot_count)..slot_count {
            self.data[base + i] = Value::Nil;
        }
        self.stack_top = staged_base;
        if let Some(f) = self.current_frame_mut() {
            f.function = Some(function);
            f.slot_count = slot_count;
            f.flags.tailcall = true;
            f.pc = 0;
        }
        self.frame_top = base + slot_count;
        Ok(())
    }

    /// `push_c_frame()` (spec §4.2): a frame with no function, carrying an
    /// opaque re-entry cookie in place of a bytecode `pc`.
    pub fn push_c_frame(&mut self, cookie: usize) {
        let base = self.frame_top;
        let prev = if self.frames.is_empty() { None } else { Some(self.frame) };
        self.frames.push(StackFrame {
            function: None,
            pc: cookie,
            prev_frame: prev,
            base,
            slot_count: 0,
            flags: FrameFlags { tailcall: false, is_c_frame: true },
            attached_env: None,
            return_slot: 0,
        });
        self.frame = self.frames.len() - 1;
    }

    /// Detaches any FuncEnv this frame currently backs, copying its values
    /// out of `data` (spec §3.4 "detached ... copied to a freshly allocated
    /// values array").
    fn detach_current_env(&mut self) {
        let (env, base, len) = match self.current_frame() {
            Some(f) => match f.attached_env {
                Some(env) => (env, f.base, f.slot_count),
                None => return,
            },
            None => return,
        };
        let values: Vec<Value> = self.data[base..base + len].to_vec();
        unsafe {
            crate::funcdef::FuncEnv::detach(env, values);
        }
        if let Some(f) = self.current_frame_mut() {
            f.attached_env = None;
        }
    }

    /// `pop_frame()` (spec §4.2): detaches any env, restores `frame`/
    /// `frame_top` to the previous frame. Returns the popped frame.
    pub fn pop_frame(&mut self) -> VmResult<StackFrame> {
        self.detach_current_env();
        let popped = self.frames.pop().ok_or(VmError::Panic("pop_frame on empty fiber".into()))?;
        match popped.prev_frame {
            Some(idx) => {
                self.frame = idx;
                let prev = &self.frames[idx];
                self.frame_top = prev.base + prev.slot_count;
            }
            None => {
                self.frame = 0;
                self.frame_top = 0;
            }
        }
        Ok(popped)
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_entry_frame(&self) -> bool {
        self.frames.len() <= 1
    }

    pub fn register(&self, slot: u32) -> VmResult<&Value> {
        let f = self.current_frame().ok_or(VmError::Bounds { index: slot as i64, len: 0 })?;
        self.data.get(f.base + slot as usize).ok_or(VmError::Bounds { index: slot as i64, len: f.slot_count })
    }

    pub fn set_register(&mut self, slot: u32, v: Value) -> VmResult<()> {
        let base = self.current_frame().ok_or(VmError::Bounds { index: slot as i64, len: 0 })?.base;
        let idx = base + slot as usize;
        if idx >= self.data.len() {
            return Err(VmError::Bounds { index: slot as i64, len: self.data.len() });
        }
        self.data[idx] = v;
        Ok(())
    }

    /// `cancel(fiber, error)` (spec §4.2): arranges for the fiber's next
    /// instruction to observe `error` as its signal.
    pub fn cancel(&mut self, error: Value) -> Value {
        self.status = Status::Errored;
        error
    }
}

impl Trace for Fiber {
    fn trace(&self, heap: &Heap) {
        for v in &self.data {
            v.trace_children(heap);
        }
        for f in &self.frames {
            if let Some(func) = f.function {
                heap.mark(func);
            }
            if let Some(env) = f.attached_env {
                heap.mark(env);
            }
        }
        if let Some(p) = self.parent {
            heap.mark(p);
        }
        if let Some(c) = self.child {
            heap.mark(c);
        }
        if let Some(e) = self.env {
            heap.mark(e);
        }
        if let Some(entry) = self.pending_entry {
            heap.mark(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcdef::{FuncDef, Function};
    use crate::gc::MemType;

    fn make_function(heap: &Heap, slot_count: u32) -> GcRef<Function> {
        let mut def = FuncDef::new_for_test(slot_count);
        def.bytecode = vec![crate::bytecode::encode_zero(crate::bytecode::Opcode::ReturnNil)];
        let def_ref = heap.alloc(MemType::FuncDef, def).unwrap();
        heap.enable_gc(def_ref);
        let f = Function::new(def_ref, Vec::new()).unwrap();
        let r = heap.alloc(MemType::Function, f).unwrap();
        heap.enable_gc(r);
        r
    }

    #[test]
    fn push_pop_frame_restores_top() {
        let heap = Heap::new(1 << 20);
        let func = make_function(&heap, 4);
        let mut fiber = Fiber::new(func, 32);
        fiber.push_arg(Value::Number(1.0)).unwrap();
        fiber.push_call_frame(func, 0, 4, 0, 0).unwrap();
        assert_eq!(fiber.frame_top, 4);
        assert_eq!(*fiber.register(0).unwrap(), Value::Number(1.0));
        fiber.pop_frame().unwrap();
        assert_eq!(fiber.frame_top, 0);
    }

    #[test]
    fn grows_geometrically() {
        let heap = Heap::new(1 << 20);
        let func = make_function(&heap, 4);
        let mut fiber = Fiber::new(func, 16);
        fiber.ensure_capacity(100).unwrap();
        assert!(fiber.capacity >= 100);
        assert!(fiber.capacity.is_power_of_two());
    }
}
