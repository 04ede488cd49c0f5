//! Core runtime for a dynamically typed Lisp-family language: tagged
//! values, a generational mark/sweep heap, fiber-based stackful
//! coroutines, and a verified register-bytecode interpreter (spec §1).
//!
//! Out of scope here, same as the teacher's own `runtime` crate draws the
//! line against its `lsp`/`repl`/`compiler` siblings: no parser, no
//! compiler/assembler, no I/O or FFI surface, no CLI or REPL (spec §1
//! Non-goals).

pub mod abstract_type;
pub mod api;
pub mod bytecode;
pub mod containers;
pub mod error;
pub mod fiber;
pub mod format;
pub mod funcdef;
pub mod gc;
pub mod interp;
pub mod marshal;
#[cfg(feature = "nanbox")]
pub mod nanbox;
pub mod numeric;
pub mod value;
pub mod value_api;
pub mod verify;

pub use api::{RootHandle, Vm, VmSnapshot};
pub use error::{VerifierError, VmError, VmResult};
pub use fiber::{Fiber, Signal, Status};
pub use funcdef::{FuncDef, Function};
pub use value::{CArgs, Type, TypeSet, Value};

/// Default coroutine stack size in register slots (spec §4.2 "Stack
/// growth"). Mirrors the teacher's `DEFAULT_STACK_SIZE` / `SEQ_STACK_SIZE`
/// pair in `scheduler.rs`, scaled from bytes to slots since a `Fiber`'s
/// stack is a `Vec<Value>`, not raw memory.
pub const DEFAULT_FIBER_STACK: usize = 1024;

/// Default interval, in bytes allocated, between collections (spec §4.1
/// "Trigger").
const DEFAULT_GC_INTERVAL: usize = 1 << 20;

/// Default cap on simultaneous fiber frames (spec §4.2 "Stack overflow").
const DEFAULT_MAX_FRAMES: usize = 4096;

/// Per-thread VM tuning, overridable via environment variables at
/// [`Vm::init`](api::Vm::init) time. Reading env vars here rather than
/// wiring a config file or CLI flags mirrors the teacher's own
/// `SEQ_STACK_SIZE`/`SEQ_STRAND_REGISTRY_SIZE`/`SEQ_WATCHDOG_SECS`
/// conventions (`scheduler.rs`, `watchdog.rs`) — there is no parser or CLI
/// in this crate to carry configuration any other way (spec §1 Non-goals).
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// `LISPVM_GC_INTERVAL`: bytes allocated between collections.
    pub gc_interval: usize,
    /// `LISPVM_FIBER_STACK`: default fiber stack capacity, in slots.
    pub fiber_stack: usize,
    /// `LISPVM_MAX_FRAMES`: cap on simultaneous call frames per fiber.
    pub max_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            gc_interval: DEFAULT_GC_INTERVAL,
            fiber_stack: DEFAULT_FIBER_STACK,
            max_frames: DEFAULT_MAX_FRAMES,
        }
    }
}

impl VmConfig {
    /// Reads `LISPVM_GC_INTERVAL`/`LISPVM_FIBER_STACK`/`LISPVM_MAX_FRAMES`
    /// from the environment, falling back to defaults (with a warning on
    /// stderr) for any that are missing, zero, or unparseable — the same
    /// fallback discipline as the teacher's `parse_stack_size`.
    pub fn from_env() -> Self {
        VmConfig {
            gc_interval: parse_env_usize("LISPVM_GC_INTERVAL", DEFAULT_GC_INTERVAL),
            fiber_stack: parse_env_usize("LISPVM_FIBER_STACK", DEFAULT_FIBER_STACK),
            max_frames: parse_env_usize("LISPVM_MAX_FRAMES", DEFAULT_MAX_FRAMES),
        }
    }
}

fn parse_env_usize(var: &str, default: usize) -> usize {
    match std::env::var(var) {
        Ok(val) => match val.parse::<usize>() {
            Ok(0) => {
                eprintln!("Warning: {var}=0 is invalid, using default {default}");
                default
            }
            Ok(n) => n,
            Err(_) => {
                eprintln!("Warning: {var}='{val}' is not a valid number, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_nonzero() {
        let config = VmConfig::default();
        assert!(config.gc_interval > 0);
        assert!(config.fiber_stack > 0);
        assert!(config.max_frames > 0);
    }

    #[test]
    fn from_env_falls_back_on_invalid_value() {
        std::env::set_var("LISPVM_GC_INTERVAL", "not-a-number");
        let config = VmConfig::from_env();
        assert_eq!(config.gc_interval, DEFAULT_GC_INTERVAL);
        std::env::remove_var("LISPVM_GC_INTERVAL");
    }
}
