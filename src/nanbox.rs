//! NaN-boxed `Value` encoding (spec §3.1), feature-gated behind `nanbox`.
//!
//! Mirrors `seq-runtime`'s `NanBoxedValue` (`nanbox.rs`): non-NaN bit
//! patterns are floats; NaN bit patterns are repurposed to carry a type tag
//! plus payload. The difference from the teacher's scheme is in what the
//! tag distinguishes: the teacher gives every heap variant (`String`,
//! `Variant`, `Map`, ...) its own 4-bit tag because none of its heap blocks
//! share a common header. Here every heap block already carries a
//! `MemType` byte in its [`crate::gc::GcHeader`] (spec §3.2), so one
//! "pointer" tag plus that byte is enough to recover the exact `Value`
//! variant — leaving the 3-bit tag space (spec §3.1: "a 3-bit type tag")
//! to separate heap pointers, cfunction pointers, the opaque `pointer`
//! type, and small boxed integers.
//!
//! `nil`/`false`/`true` get their own canonical NaN bit patterns rather
//! than a tag+payload slot (spec §3.1: "a canonical quiet NaN encodes
//! nil/false/true distinctly") since they carry no payload at all.

use crate::abstract_type::AbstractValue;
use crate::containers::array::Array;
use crate::containers::buffer::Buffer;
use crate::containers::string_intern::StringData;
use crate::containers::struct_::Struct;
use crate::containers::table::Table;
use crate::containers::tuple::Tuple;
use crate::fiber::Fiber;
use crate::funcdef::Function;
use crate::gc::{GcBox, GcHeader, GcRef, MemType};
use crate::value::{CFunctionPtr, Value};

/// Every `f64` bit pattern at or above this threshold is a NaN we've
/// repurposed; everything below is a float (matches the teacher's
/// `NANBOX_THRESHOLD` but narrowed to negative quiet NaNs so +NaN/+Inf
/// read-through float paths are untouched).
const NANBOX_BASE: u64 = 0xFFF8_0000_0000_0000;
const TAG_MASK: u64 = 0x0007_0000_0000_0000;
const TAG_SHIFT: u32 = 48;
const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const CANONICAL_NIL: u64 = 0xFFF9_0000_0000_0000;
const CANONICAL_FALSE: u64 = 0xFFF9_0000_0000_0001;
const CANONICAL_TRUE: u64 = 0xFFF9_0000_0000_0002;

/// The float NaN every arithmetic op that produces NaN canonicalizes to
/// (spec §3.1 invariant (c)) — distinct from the three canonical patterns
/// above and from every tagged pattern below.
pub const CANONICAL_FLOAT_NAN: u64 = 0x7FF8_0000_0000_0000;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NanTag {
    HeapPointer = 0,
    CFunction = 1,
    OpaquePointer = 2,
}

/// An 8-byte NaN-boxed `Value`.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct NanBoxedValue(u64);

impl NanBoxedValue {
    pub fn from_f64(n: f64) -> Self {
        if n.is_nan() {
            NanBoxedValue(CANONICAL_FLOAT_NAN)
        } else {
            NanBoxedValue(n.to_bits())
        }
    }

    pub fn nil() -> Self {
        NanBoxedValue(CANONICAL_NIL)
    }

    pub fn bool(b: bool) -> Self {
        NanBoxedValue(if b { CANONICAL_TRUE } else { CANONICAL_FALSE })
    }

    fn tagged(tag: NanTag, payload: u64) -> Self {
        debug_assert!(payload & !PAYLOAD_MASK == 0, "payload overflows 48 bits");
        NanBoxedValue(NANBOX_BASE | ((tag as u64) << TAG_SHIFT) | (payload & PAYLOAD_MASK))
    }

    fn is_boxed(self) -> bool {
        (self.0 & NANBOX_BASE) == NANBOX_BASE && f64::from_bits(self.0).is_nan()
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        NanBoxedValue(bits)
    }

    /// Encode a full `Value` (tagged-struct representation) into 8 bytes.
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::Nil => NanBoxedValue::nil(),
            Value::Boolean(b) => NanBoxedValue::bool(*b),
            Value::Number(n) => NanBoxedValue::from_f64(*n),
            Value::String(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Symbol(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Keyword(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Array(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Tuple(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Table(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Struct(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Buffer(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Function(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Fiber(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::Abstract(r) => Self::tagged(NanTag::HeapPointer, r.as_ptr() as u64),
            Value::CFunction(f) => Self::tagged(NanTag::CFunction, *f as usize as u64),
            Value::Pointer(p) => Self::tagged(NanTag::OpaquePointer, *p as u64),
        }
    }

    /// Decode back to a `Value`.
    ///
    /// # Safety
    /// Every heap-pointer-tagged payload must point to a live `GcBox<T>`
    /// allocated by the heap that produced it, with a `GcHeader::mem_type`
    /// matching the `T` this reconstructs — true for any bit pattern this
    /// module itself produced via [`NanBoxedValue::from_value`].
    pub unsafe fn to_value(self) -> Value {
        if !self.is_boxed() {
            return Value::Number(f64::from_bits(self.0));
        }
        match self.0 {
            CANONICAL_NIL => return Value::Nil,
            CANONICAL_FALSE => return Value::Boolean(false),
            CANONICAL_TRUE => return Value::Boolean(true),
            CANONICAL_FLOAT_NAN => return Value::Number(f64::NAN),
            _ => {}
        }
        let tag = (self.0 & TAG_MASK) >> TAG_SHIFT;
        let payload = self.0 & PAYLOAD_MASK;
        match tag as u8 {
            t if t == NanTag::HeapPointer as u8 => unsafe { Self::decode_heap_pointer(payload) },
            t if t == NanTag::CFunction as u8 => {
                let f: CFunctionPtr = unsafe { std::mem::transmute::<usize, CFunctionPtr>(payload as usize) };
                Value::CFunction(f)
            }
            t if t == NanTag::OpaquePointer as u8 => Value::Pointer(payload as usize),
            _ => unreachable!("nan-box tag space is fully covered"),
        }
    }

    unsafe fn decode_heap_pointer(payload: u64) -> Value {
        let header = payload as *mut GcHeader;
        let mem_type = unsafe { (*header).mem_type };
        macro_rules! reinterpret {
            ($t:ty) => {
                unsafe { GcRef::<$t>::from_raw(std::ptr::NonNull::new_unchecked(header as *mut GcBox<$t>)) }
            };
        }
        match mem_type {
            MemType::String => Value::String(reinterpret!(StringData)),
            MemType::Symbol => Value::Symbol(reinterpret!(StringData)),
            MemType::Keyword => Value::Keyword(reinterpret!(StringData)),
            MemType::Array => Value::Array(reinterpret!(Array)),
            MemType::Tuple => Value::Tuple(reinterpret!(Tuple)),
            MemType::Table => Value::Table(reinterpret!(Table)),
            MemType::Struct => Value::Struct(reinterpret!(Struct)),
            MemType::Buffer => Value::Buffer(reinterpret!(Buffer)),
            MemType::Function => Value::Function(reinterpret!(Function)),
            MemType::Fiber => Value::Fiber(reinterpret!(Fiber)),
            MemType::Abstract => Value::Abstract(reinterpret!(AbstractValue)),
            MemType::FuncDef | MemType::FuncEnv => {
                unreachable!("FuncDef/FuncEnv are never boxed directly into a Value")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_bool_roundtrip() {
        unsafe {
            assert!(matches!(NanBoxedValue::nil().to_value(), Value::Nil));
            assert!(matches!(NanBoxedValue::bool(true).to_value(), Value::Boolean(true)));
            assert!(matches!(NanBoxedValue::bool(false).to_value(), Value::Boolean(false)));
        }
    }

    #[test]
    fn number_roundtrip() {
        unsafe {
            let v = NanBoxedValue::from_f64(3.5);
            match v.to_value() {
                Value::Number(n) => assert_eq!(n, 3.5),
                _ => panic!("expected number"),
            }
        }
    }

    #[test]
    fn nan_canonicalized() {
        let v = NanBoxedValue::from_f64(f64::NAN);
        assert_eq!(v.bits(), CANONICAL_FLOAT_NAN);
    }

    #[test]
    fn opaque_pointer_roundtrip() {
        unsafe {
            let v = NanBoxedValue::from_value(&Value::Pointer(0x1234));
            match v.to_value() {
                Value::Pointer(p) => assert_eq!(p, 0x1234),
                _ => panic!("expected pointer"),
            }
        }
    }
}
