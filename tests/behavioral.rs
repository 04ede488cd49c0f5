//! End-to-end behavioral scenarios (spec §8) exercising the public `Vm`
//! surface rather than `interp`'s internals directly — the same split the
//! teacher draws between its `src/*.rs` unit tests and its own
//! `tests/test_closures.rs` integration suite.

use lispvm_core::api::Vm;
use lispvm_core::bytecode::{encode_s, encode_sc, encode_sl, encode_ss, encode_sss, Opcode};
use lispvm_core::funcdef::{FuncDef, Function};
use lispvm_core::gc::{GcRef, MemType};
use lispvm_core::value::Value;
use lispvm_core::verify::verify;
use lispvm_core::{Fiber, Signal, VmConfig};

fn build_function(vm: &Vm, bytecode: Vec<u32>, constants: Vec<Value>, slot_count: u32, arity_min: u32, arity_max: u32) -> GcRef<Function> {
    let mut def = FuncDef::new(bytecode, constants, slot_count);
    def.arity_min = arity_min;
    def.arity_max = Some(arity_max);
    verify(&mut def).expect("hand-built bytecode must satisfy the verifier");
    let def_ref = vm.heap().alloc(MemType::FuncDef, def).unwrap();
    vm.heap().enable_gc(def_ref);
    let function = Function::new(def_ref, vec![]).unwrap();
    let f_ref = vm.heap().alloc(MemType::Function, function).unwrap();
    vm.heap().enable_gc(f_ref);
    f_ref
}

fn spawn(vm: &Vm, entry: GcRef<Function>) -> GcRef<Fiber> {
    let fiber = Fiber::new(entry, 16);
    let fiber_ref = vm.heap().alloc(MemType::Fiber, fiber).unwrap();
    vm.heap().enable_gc(fiber_ref);
    fiber_ref
}

/// Scenario 1 (spec §8): `sum(1,2,3) → 6`.
#[test]
fn sum_of_three_integers() {
    let mut vm = Vm::init(VmConfig::default());
    let bytecode = vec![
        encode_sc(Opcode::LoadConstant, 0, 0),
        encode_sc(Opcode::LoadConstant, 1, 1),
        encode_sc(Opcode::LoadConstant, 2, 2),
        encode_sss(Opcode::AddInteger, 0, 0, 1),
        encode_sss(Opcode::AddInteger, 0, 0, 2),
        encode_s(Opcode::Return, 0),
    ];
    let constants = vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)];
    let f = build_function(&vm, bytecode, constants, 3, 0, 0);
    let fiber = spawn(&vm, f);
    let (signal, value) = vm.continue_(fiber, Value::Nil);
    assert!(matches!(signal, Signal::Ok(_)));
    assert_eq!(value, Value::Number(6.0));
}

/// Scenario 2 (spec §8): a fiber whose body is `(yield 10)(yield 20)(return
/// 30)` produces `(Yield,10)`, `(Yield,20)`, `(Ok,30)` on successive
/// resumes, then a fourth resume raises `CannotResume`.
#[test]
fn fiber_yield_sequence() {
    let mut vm = Vm::init(VmConfig::default());
    // r0 = payload, r1 = transfer dest (unused), r2 = nil (transfer target)
    let bytecode = vec![
        encode_sc(Opcode::LoadConstant, 2, 0), // r2 = nil
        encode_sc(Opcode::LoadConstant, 0, 1), // r0 = 10
        encode_sss(Opcode::Transfer, 1, 2, 0), // yield r0
        encode_sc(Opcode::LoadConstant, 0, 2), // r0 = 20
        encode_sss(Opcode::Transfer, 1, 2, 0), // yield r0
        encode_sc(Opcode::LoadConstant, 0, 3), // r0 = 30
        encode_s(Opcode::Return, 0),
    ];
    let constants = vec![Value::Nil, Value::Number(10.0), Value::Number(20.0), Value::Number(30.0)];
    let f = build_function(&vm, bytecode, constants, 3, 0, 0);
    let fiber = spawn(&vm, f);

    let (signal, value) = vm.continue_(fiber, Value::Nil);
    assert!(matches!(signal, Signal::Yield(_)));
    assert_eq!(value, Value::Number(10.0));

    let (signal, value) = vm.continue_(fiber, Value::Nil);
    assert!(matches!(signal, Signal::Yield(_)));
    assert_eq!(value, Value::Number(20.0));

    let (signal, value) = vm.continue_(fiber, Value::Nil);
    assert!(matches!(signal, Signal::Ok(_)));
    assert_eq!(value, Value::Number(30.0));

    let (signal, _) = vm.continue_(fiber, Value::Nil);
    assert!(matches!(signal, Signal::Error(_)), "resuming a dead fiber must report CannotResume");
}

/// Scenario 3 (spec §8): a function that tail-calls itself many times with
/// an integer accumulator returns the expected total while the fiber's
/// frame stack never grows past the entry frame — the tail call overwrites
/// its own frame in place rather than pushing a new one.
#[test]
fn tail_call_stays_at_one_frame() {
    let mut vm = Vm::init(VmConfig::default());

    // counter(n, acc): n == 0 ? acc : counter(n - 1, acc + 1)
    let counter_bytecode = vec![
        encode_sc(Opcode::LoadConstant, 2, 0),     // 0: r2 = 0
        encode_sss(Opcode::Equals, 3, 0, 2),       // 1: r3 = (n == 0)
        encode_sl(Opcode::JumpIfNot, 3, 1),        // 2: if !r3 jump to 4
        encode_s(Opcode::Return, 1),               // 3: return acc
        encode_sc(Opcode::LoadConstant, 4, 1),     // 4: r4 = 1
        encode_sss(Opcode::SubtractInteger, 0, 0, 4), // 5: n -= 1
        encode_sss(Opcode::AddInteger, 1, 1, 4),   // 6: acc += 1
        encode_s(Opcode::LoadSelf, 5),             // 7: r5 = self
        encode_ss(Opcode::Push2, 0, 1),            // 8: stage (n, acc)
        encode_s(Opcode::Tailcall, 5),             // 9: tailcall self
    ];
    let counter = build_function(&vm, counter_bytecode, vec![Value::Number(0.0), Value::Number(1.0)], 6, 2, 2);

    // driver(): counter(1000, 0) as a tail call, so the whole run stays
    // within one frame from the very first instruction.
    let driver_bytecode = vec![
        encode_sc(Opcode::LoadConstant, 0, 0), // r0 = 1000
        encode_sc(Opcode::LoadConstant, 1, 1), // r1 = 0
        encode_sc(Opcode::LoadConstant, 2, 2), // r2 = counter
        encode_ss(Opcode::Push2, 0, 1),
        encode_s(Opcode::Tailcall, 2),
    ];
    let driver = build_function(&vm, driver_bytecode, vec![Value::Number(1000.0), Value::Number(0.0), Value::Function(counter)], 3, 0, 0);

    let fiber = spawn(&vm, driver);
    let (signal, value) = vm.continue_(fiber, Value::Nil);
    assert!(matches!(signal, Signal::Ok(_)), "expected Ok, got {signal:?}");
    assert_eq!(value, Value::Number(1000.0));
    assert_eq!(fiber.frame_depth(), 0, "every tail call must overwrite the entry frame, never push a new one");
}

/// Scenario 5 (spec §8): a `FuncDef` whose last instruction is not a
/// terminator must fail verification at closure-creation time with
/// `VerifierError`.
#[test]
fn verifier_rejects_non_terminal_exit() {
    let mut def = FuncDef::new(vec![encode_sss(Opcode::AddInteger, 0, 0, 0)], vec![], 1);
    def.arity_min = 0;
    def.arity_max = Some(0);
    let err = verify(&mut def).expect_err("bytecode ending in ADD_INTEGER must be rejected");
    match err {
        lispvm_core::error::VmError::Verifier(_) => {}
        other => panic!("expected a VerifierError, got {other:?}"),
    }
}

/// Interrupting a VM before it runs surfaces a debug signal instead of
/// driving to completion (spec §4.3 "Interruption").
#[test]
fn interrupt_suspends_before_entry() {
    let mut vm = Vm::init(VmConfig::default());
    let f = build_function(&vm, vec![encode_s(Opcode::ReturnNil, 0)], vec![], 1, 0, 0);
    let fiber = spawn(&vm, f);
    vm.interpreter_interrupt();
    let (signal, _) = vm.continue_(fiber, Value::Nil);
    assert!(matches!(signal, Signal::Debug(_)));
    vm.interpreter_interrupt_handled();
}
