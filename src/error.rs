//! Error taxonomy (spec §7) and the verifier's structural failure kinds.
//!
//! Unlike the teacher's `set_runtime_error`/`take_runtime_error` thread-local
//! string channel (`error.rs` in `seq-runtime`, built for an FFI boundary
//! crossed from LLVM-generated code), every fallible operation in this crate
//! returns a typed `Result<_, VmError>` propagated with `?`. The thread-local
//! shape is the right fit when the caller is foreign code that cannot unwind
//! a Rust `Result`; here caller and callee are both Rust, so a propagated
//! error is the idiomatic equivalent.

use std::fmt;

/// Why the verifier (§4.4) rejected a `FuncDef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierError {
    UnknownOpcode { pc: usize, byte: u8 },
    SlotOutOfRange { pc: usize, slot: u32 },
    JumpOutOfRange { pc: usize, target: i64 },
    ConstantOutOfRange { pc: usize, index: u32 },
    DefOutOfRange { pc: usize, index: u32 },
    EnvOutOfRange { pc: usize, index: u32 },
    /// The final instruction is not one of RETURN/RETURN_NIL/TAILCALL/JUMP/ERROR.
    NonTerminalExit,
    ArityExceedsSlots { arity: u32, slot_count: u32 },
    EmptyBytecode,
}

impl fmt::Display for VerifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifierError::UnknownOpcode { pc, byte } => {
                write!(f, "unknown opcode 0x{byte:02x} at pc {pc}")
            }
            VerifierError::SlotOutOfRange { pc, slot } => {
                write!(f, "slot {slot} out of range at pc {pc}")
            }
            VerifierError::JumpOutOfRange { pc, target } => {
                write!(f, "jump target {target} out of range at pc {pc}")
            }
            VerifierError::ConstantOutOfRange { pc, index } => {
                write!(f, "constant index {index} out of range at pc {pc}")
            }
            VerifierError::DefOutOfRange { pc, index } => {
                write!(f, "nested def index {index} out of range at pc {pc}")
            }
            VerifierError::EnvOutOfRange { pc, index } => {
                write!(f, "upvalue env index {index} out of range at pc {pc}")
            }
            VerifierError::NonTerminalExit => {
                write!(f, "function does not end in a terminating instruction")
            }
            VerifierError::ArityExceedsSlots { arity, slot_count } => write!(
                f,
                "declared arity {arity} exceeds slot count {slot_count}"
            ),
            VerifierError::EmptyBytecode => write!(f, "function has no instructions"),
        }
    }
}

impl std::error::Error for VerifierError {}

/// Everything that can go wrong while compiling, verifying, or running.
///
/// Maps directly onto spec §7's taxonomy: Type, Arity, Bounds, Arithmetic,
/// Verifier, runtime Panic, Fiber-state, OOM, and stack-overflow errors.
#[derive(Debug, Clone)]
pub enum VmError {
    /// Operand was not of the expected type.
    Type { expected: &'static str, got: &'static str },
    /// Wrong number of arguments to a call.
    Arity { expected_min: u32, expected_max: u32, got: u32 },
    /// Index out of range (sequence, buffer, or byte offset).
    Bounds { index: i64, len: usize },
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// Static verification failed before the function could be closed over.
    Verifier(VerifierError),
    /// `ERROR` instruction or `panic`/`panicf` raised a value.
    Panic(String),
    /// Fiber was resumed in a state that does not accept resumption.
    CannotResume { status: &'static str },
    /// `TRANSFER`/resume named a fiber that cannot accept this handoff.
    InvalidTransferTarget,
    /// Allocator failed to satisfy a request; the configured OOM hook ran.
    OutOfMemory { requested: usize },
    /// Fiber's value stack grew past the configured cap.
    StackOverflow { depth: usize, cap: usize },
    /// A key violated a container's key invariant (nil/NaN as table/struct key).
    InvalidKey,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Type { expected, got } => {
                write!(f, "type error: expected {expected}, got {got}")
            }
            VmError::Arity { expected_min, expected_max, got } => {
                if expected_min == expected_max {
                    write!(f, "arity error: expected {expected_min} args, got {got}")
                } else {
                    write!(
                        f,
                        "arity error: expected {expected_min}..={expected_max} args, got {got}"
                    )
                }
            }
            VmError::Bounds { index, len } => {
                write!(f, "index {index} out of bounds for length {len}")
            }
            VmError::DivisionByZero => write!(f, "division by zero"),
            VmError::Verifier(e) => write!(f, "verifier error: {e}"),
            VmError::Panic(msg) => write!(f, "{msg}"),
            VmError::CannotResume { status } => {
                write!(f, "cannot resume a fiber in status {status}")
            }
            VmError::InvalidTransferTarget => write!(f, "invalid transfer target"),
            VmError::OutOfMemory { requested } => {
                write!(f, "out of memory: failed to allocate {requested} bytes")
            }
            VmError::StackOverflow { depth, cap } => {
                write!(f, "stack overflow: depth {depth} exceeds cap {cap}")
            }
            VmError::InvalidKey => write!(f, "nil or NaN used as a table/struct key"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<VerifierError> for VmError {
    fn from(e: VerifierError) -> Self {
        VmError::Verifier(e)
    }
}

/// Result alias used throughout the interpreter.
pub type VmResult<T> = Result<T, VmError>;
