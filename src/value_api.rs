//! Value API (spec §6.1): the type-agnostic surface consumed by a parser,
//! compiler, or any C-embedded code sitting on top of the interpreter.
//! Everything here is a thin, total wrapper over what [`crate::value::Value`]
//! and the container modules already expose — this module exists so that
//! surface is `pub` and named the way embedders expect, rather than private
//! to [`crate::interp`]'s dispatch loop.

use crate::abstract_type::AbstractValue;
use crate::containers::array::Array;
use crate::containers::buffer::Buffer;
use crate::containers::string_intern::StringData;
use crate::containers::struct_::Struct;
use crate::containers::table::Table;
use crate::containers::tuple::Tuple;
use crate::error::{VmError, VmResult};
use crate::fiber::Fiber;
use crate::funcdef::Function;
use crate::gc::GcRef;
use crate::value::{hash_value, CFunctionPtr, Type, TypeSet, Value};

macro_rules! wrap_unwrap_heap {
    ($wrap:ident, $unwrap:ident, $variant:ident, $repr:ty, $name:expr) => {
        #[doc = concat!("`wrap_", $name, "(x)` (spec §6.1): total.")]
        pub fn $wrap(x: GcRef<$repr>) -> Value {
            Value::$variant(x)
        }

        #[doc = concat!("`unwrap_", $name, "(v)` (spec §6.1): panics if `v` is not a ", $name, ".")]
        pub fn $unwrap(v: &Value) -> GcRef<$repr> {
            match v {
                Value::$variant(r) => *r,
                other => panic!("unwrap_{}: expected {}, got {}", $name, $name, other.type_of().name()),
            }
        }
    };
}

wrap_unwrap_heap!(wrap_string, unwrap_string, String, StringData, "string");
wrap_unwrap_heap!(wrap_symbol, unwrap_symbol, Symbol, StringData, "symbol");
wrap_unwrap_heap!(wrap_keyword, unwrap_keyword, Keyword, StringData, "keyword");
wrap_unwrap_heap!(wrap_array, unwrap_array, Array, Array, "array");
wrap_unwrap_heap!(wrap_tuple, unwrap_tuple, Tuple, Tuple, "tuple");
wrap_unwrap_heap!(wrap_table, unwrap_table, Table, Table, "table");
wrap_unwrap_heap!(wrap_struct, unwrap_struct, Struct, Struct, "struct");
wrap_unwrap_heap!(wrap_buffer, unwrap_buffer, Buffer, Buffer, "buffer");
wrap_unwrap_heap!(wrap_function, unwrap_function, Function, Function, "function");
wrap_unwrap_heap!(wrap_fiber, unwrap_fiber, Fiber, Fiber, "fiber");
wrap_unwrap_heap!(wrap_abstract, unwrap_abstract, Abstract, AbstractValue, "abstract");

/// `wrap_nil()` (spec §6.1).
pub fn wrap_nil() -> Value {
    Value::Nil
}

/// `wrap_boolean(x)` (spec §6.1).
pub fn wrap_boolean(x: bool) -> Value {
    Value::Boolean(x)
}

/// `wrap_number(x)` (spec §6.1).
pub fn wrap_number(x: f64) -> Value {
    Value::Number(x)
}

/// `wrap_pointer(x)` (spec §6.1).
pub fn wrap_pointer(x: usize) -> Value {
    Value::Pointer(x)
}

/// `wrap_cfunction(x)` (spec §6.1).
pub fn wrap_cfunction(x: CFunctionPtr) -> Value {
    Value::CFunction(x)
}

/// `unwrap_boolean(v)` (spec §6.1): panics if `v` is not a boolean.
pub fn unwrap_boolean(v: &Value) -> bool {
    match v {
        Value::Boolean(b) => *b,
        other => panic!("unwrap_boolean: expected boolean, got {}", other.type_of().name()),
    }
}

/// `unwrap_number(v)` (spec §6.1): panics if `v` is not a number.
pub fn unwrap_number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => *n,
        other => panic!("unwrap_number: expected number, got {}", other.type_of().name()),
    }
}

/// `unwrap_pointer(v)` (spec §6.1): panics if `v` is not a pointer.
pub fn unwrap_pointer(v: &Value) -> usize {
    match v {
        Value::Pointer(p) => *p,
        other => panic!("unwrap_pointer: expected pointer, got {}", other.type_of().name()),
    }
}

/// `unwrap_cfunction(v)` (spec §6.1): panics if `v` is not a cfunction.
pub fn unwrap_cfunction(v: &Value) -> CFunctionPtr {
    match v {
        Value::CFunction(f) => *f,
        other => panic!("unwrap_cfunction: expected cfunction, got {}", other.type_of().name()),
    }
}

/// `type_of(v)` (spec §6.1).
pub fn type_of(v: &Value) -> Type {
    v.type_of()
}

/// `check_type(v, T)` (spec §6.1).
pub fn check_type(v: &Value, ty: Type) -> bool {
    v.check_type(ty)
}

/// `check_types(v, mask)` (spec §6.1).
pub fn check_types(v: &Value, mask: TypeSet) -> bool {
    v.check_types(mask)
}

/// `truthy(v)` (spec §6.1).
pub fn truthy(v: &Value) -> bool {
    v.truthy()
}

/// `equals(x, y)` (spec §6.1).
pub fn equals(x: &Value, y: &Value) -> bool {
    x.value_eq(y)
}

/// `compare(x, y)` (spec §6.1): total order across types, tie-broken by
/// type tag.
pub fn compare(x: &Value, y: &Value) -> std::cmp::Ordering {
    x.compare(y)
}

/// `hash(v)` (spec §6.1): consistent with `equals`.
pub fn hash(v: &Value) -> u64 {
    hash_value(v)
}

/// `get(ds, key)` (spec §6.1): polymorphic read over every indexable
/// container. Out-of-range and missing keys read back as `Nil` rather than
/// erroring, matching the `GET`/`GET_INDEX` bytecode ops this wraps.
pub fn get(ds: &Value, key: &Value) -> VmResult<Value> {
    crate::interp::get_polymorphic(ds, key)
}

/// `put(ds, key, val)` (spec §6.1).
pub fn put(ds: &Value, key: Value, val: Value) -> VmResult<()> {
    crate::interp::put_polymorphic(ds, key, val)
}

/// `length(v)` (spec §6.1).
pub fn length(v: &Value) -> VmResult<usize> {
    crate::interp::length_of(v)
}

/// `get_index(v, i)` (spec §6.1): equivalent to `get(v, wrap_number(i))`,
/// named separately because integer indexing is the common case.
pub fn get_index(v: &Value, i: i64) -> VmResult<Value> {
    crate::interp::get_polymorphic(v, &Value::Number(i as f64))
}

/// `seq_view(v)` (spec §6.1): the backing slice for an array or tuple.
pub fn seq_view(v: &Value) -> VmResult<&[Value]> {
    match v {
        Value::Array(a) => Ok(a.as_slice()),
        Value::Tuple(t) => Ok(t.as_slice()),
        other => Err(VmError::Type { expected: "array or tuple", got: other.type_of().name() }),
    }
}

/// `byte_view(v)` (spec §6.1): the backing bytes for a string-family value
/// or a buffer.
pub fn byte_view(v: &Value) -> VmResult<&[u8]> {
    match v {
        Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => Ok(s.as_bytes()),
        Value::Buffer(b) => Ok(b.as_bytes()),
        other => Err(VmError::Type {
            expected: "string, symbol, keyword, or buffer",
            got: other.type_of().name(),
        }),
    }
}

/// `dict_view(v)` (spec §6.1): `(kv, len, cap)` for a table or struct,
/// expressed as a small borrowing view rather than a raw `(ptr, len, cap)`
/// triple, since `Table`/`Struct` keep their slot array private.
pub enum DictView<'a> {
    Table(GcRef<Table>, std::marker::PhantomData<&'a ()>),
    Struct(GcRef<Struct>, std::marker::PhantomData<&'a ()>),
}

impl<'a> DictView<'a> {
    pub fn len(&self) -> usize {
        match self {
            DictView::Table(t, _) => t.len(),
            DictView::Struct(s, _) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match self {
            DictView::Table(t, _) => t.capacity(),
            DictView::Struct(s, _) => s.capacity(),
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = (&Value, &Value)> + '_> {
        match self {
            DictView::Table(t, _) => Box::new(t.iter()),
            DictView::Struct(s, _) => Box::new(s.iter()),
        }
    }
}

/// `dict_view(v)` (spec §6.1): panics path is avoided — callers that don't
/// know up front whether `v` is dict-shaped get a typed error instead.
pub fn dict_view(v: &Value) -> VmResult<DictView<'_>> {
    match v {
        Value::Table(t) => Ok(DictView::Table(*t, std::marker::PhantomData)),
        Value::Struct(s) => Ok(DictView::Struct(*s, std::marker::PhantomData)),
        other => Err(VmError::Type { expected: "table or struct", got: other.type_of().name() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::{Heap, MemType};

    #[test]
    fn wrap_unwrap_roundtrip_scalars() {
        assert_eq!(unwrap_number(&wrap_number(3.5)), 3.5);
        assert!(unwrap_boolean(&wrap_boolean(true)));
        assert_eq!(unwrap_pointer(&wrap_pointer(42)), 42);
        assert!(matches!(wrap_nil(), Value::Nil));
    }

    #[test]
    #[should_panic(expected = "unwrap_number")]
    fn unwrap_wrong_type_panics() {
        unwrap_number(&wrap_boolean(true));
    }

    #[test]
    fn seq_view_reads_array_contents() {
        let heap = Heap::new(1 << 20);
        let mut array = Array::new();
        array.push(Value::Number(1.0));
        array.push(Value::Number(2.0));
        let r = heap.alloc(MemType::Array, array).unwrap();
        heap.enable_gc(r);
        let v = wrap_array(r);
        assert_eq!(seq_view(&v).unwrap(), &[Value::Number(1.0), Value::Number(2.0)]);
    }

    #[test]
    fn byte_view_reads_string_bytes() {
        let heap = Heap::new(1 << 20);
        let r = heap.intern_string(b"hi").unwrap();
        let v = wrap_string(r);
        assert_eq!(byte_view(&v).unwrap(), b"hi");
    }

    #[test]
    fn dict_view_reports_len_and_entries() {
        let heap = Heap::new(1 << 20);
        let mut table = Table::new();
        table.put(Value::Number(1.0), Value::Number(9.0)).unwrap();
        let r = heap.alloc(MemType::Table, table).unwrap();
        heap.enable_gc(r);
        let v = wrap_table(r);
        let view = dict_view(&v).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.iter().count(), 1);
    }

    #[test]
    fn get_put_length_dispatch_polymorphically() {
        let heap = Heap::new(1 << 20);
        let mut table = Table::new();
        table.put(Value::Number(1.0), Value::Number(9.0)).unwrap();
        let r = heap.alloc(MemType::Table, table).unwrap();
        heap.enable_gc(r);
        let v = wrap_table(r);
        assert_eq!(length(&v).unwrap(), 1);
        put(&v, Value::Number(2.0), Value::Number(8.0)).unwrap();
        assert_eq!(get(&v, &Value::Number(2.0)).unwrap(), Value::Number(8.0));
        assert_eq!(get_index(&v, 99).unwrap(), Value::Nil);
    }
}
