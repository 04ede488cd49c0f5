//! Abstract type interface (spec §6.3): a vtable of optional hooks plus a
//! block of opaque data immediately following it, the way a native module
//! plugs a new heap-resident type into the runtime without the core
//! knowing its shape. This is the value-level counterpart to the
//! dispatch-by-function-pointer trick [`crate::gc::GcHeader`] already uses
//! internally for `drop`/`trace`.

use std::any::Any;

use crate::error::VmResult;
use crate::gc::{Heap, Trace};
use crate::value::Value;

/// Each hook may be absent (`None`) for "use the default behavior" (spec
/// §6.3: "Each may be null for the default behavior").
pub struct AbstractVTable {
    pub name: &'static str,
    pub gc: Option<fn(&mut dyn Any)>,
    pub gcmark: Option<fn(&dyn Any, &Heap)>,
    pub get: Option<fn(&dyn Any, &Value) -> VmResult<Option<Value>>>,
    pub put: Option<fn(&mut dyn Any, &Value, Value) -> VmResult<()>>,
    pub marshal: Option<fn(&dyn Any) -> VmResult<Vec<u8>>>,
    pub unmarshal: Option<fn(&[u8]) -> VmResult<Box<dyn Any>>>,
    pub tostring: Option<fn(&dyn Any) -> String>,
    pub compare: Option<fn(&dyn Any, &dyn Any) -> std::cmp::Ordering>,
    pub hash: Option<fn(&dyn Any) -> u64>,
    pub next: Option<fn(&dyn Any, &Value) -> Option<Value>>,
    pub call: Option<fn(&dyn Any, &[Value]) -> VmResult<Value>>,
}

/// A heap-resident abstract value: vtable pointer plus opaque payload (spec
/// §6.3: "value data lies immediately after the header"). Here the payload
/// is a boxed `dyn Any` rather than a raw trailing byte blob — idiomatic
/// Rust for "opaque data of a type only the registering module knows",
/// with the vtable providing the operations that would otherwise require
/// transmuting raw bytes.
pub struct AbstractValue {
    pub vtable: &'static AbstractVTable,
    pub data: Box<dyn Any>,
}

impl AbstractValue {
    pub fn new(vtable: &'static AbstractVTable, data: Box<dyn Any>) -> Self {
        AbstractValue { vtable, data }
    }

    pub fn name(&self) -> &'static str {
        self.vtable.name
    }

    pub fn tostring(&self) -> String {
        match self.vtable.tostring {
            Some(f) => f(self.data.as_ref()),
            None => format!("<{} 0x{:x}>", self.vtable.name, self.data.as_ref() as *const dyn Any as *const () as usize),
        }
    }

    pub fn hash(&self) -> u64 {
        match self.vtable.hash {
            Some(f) => f(self.data.as_ref()),
            None => self.data.as_ref() as *const dyn Any as *const () as usize as u64,
        }
    }

    pub fn compare(&self, other: &AbstractValue) -> std::cmp::Ordering {
        if let Some(f) = self.vtable.compare {
            if std::ptr::eq(self.vtable, other.vtable) {
                return f(self.data.as_ref(), other.data.as_ref());
            }
        }
        (self.vtable.name).cmp(other.vtable.name)
    }

    pub fn get(&self, key: &Value) -> VmResult<Option<Value>> {
        match self.vtable.get {
            Some(f) => f(self.data.as_ref(), key),
            None => Ok(None),
        }
    }

    pub fn put(&mut self, key: &Value, value: Value) -> VmResult<()> {
        match self.vtable.put {
            Some(f) => f(self.data.as_mut(), key, value),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AbstractValue({})", self.vtable.name)
    }
}

impl Trace for AbstractValue {
    fn trace(&self, heap: &Heap) {
        if let Some(f) = self.vtable.gcmark {
            f(self.data.as_ref(), heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(i64);

    fn tostring_counter(data: &dyn Any) -> String {
        format!("{}", data.downcast_ref::<Counter>().unwrap().0)
    }

    static COUNTER_VTABLE: AbstractVTable = AbstractVTable {
        name: "counter",
        gc: None,
        gcmark: None,
        get: None,
        put: None,
        marshal: None,
        unmarshal: None,
        tostring: Some(tostring_counter),
        compare: None,
        hash: None,
        next: None,
        call: None,
    };

    #[test]
    fn default_hooks_are_inert() {
        let v = AbstractValue::new(&COUNTER_VTABLE, Box::new(Counter(42)));
        assert_eq!(v.tostring(), "42");
        assert_eq!(v.name(), "counter");
        assert!(v.get(&Value::Nil).unwrap().is_none());
    }
}
