//! Struct: immutable `Value -> Value` map (spec §3.3).
//!
//! Entries are placed by open addressing into a fixed table sized
//! `4 * length` (rounded up to a power of two) at construction time, in
//! hash order rather than insertion order. Two structs built from the same
//! entries in different orders therefore land in identical slots and hash
//! bit-for-bit identically — the invariant spec §3.3 calls out explicitly
//! ("content-equal structs must hash identically regardless of
//! construction order").

use crate::containers::tuple::hash_sequence;
use crate::gc::{Heap, Trace};
use crate::value::Value;

#[derive(Debug)]
pub struct Struct {
    slots: Box<[Option<(Value, Value)>]>,
    length: usize,
    hash: u64,
}

impl Struct {
    pub fn new(mut entries: Vec<(Value, Value)>) -> Self {
        let length = entries.len();
        let capacity = (length * 4).max(4).next_power_of_two();
        let mask = capacity - 1;

        // Deterministic placement: sort by (hash, then a stable tiebreak)
        // so construction order never affects final slot layout.
        entries.sort_by(|(ka, _), (kb, _)| {
            crate::value::hash_value(ka).cmp(&crate::value::hash_value(kb))
        });

        let mut slots: Vec<Option<(Value, Value)>> = vec![None; capacity];
        for (k, v) in entries.into_iter() {
            let mut idx = (crate::value::hash_value(&k) as usize) & mask;
            loop {
                if slots[idx].is_none() {
                    slots[idx] = Some((k, v));
                    break;
                }
                idx = (idx + 1) & mask;
            }
        }

        let flat: Vec<Value> = slots
            .iter()
            .flat_map(|s| match s {
                Some((k, v)) => vec![k.clone(), v.clone()],
                None => vec![Value::Nil],
            })
            .collect();
        let hash = hash_sequence(&flat);

        Struct { slots: slots.into_boxed_slice(), length, hash }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut idx = (crate::value::hash_value(key) as usize) & mask;
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Some((k, v)) if k.value_eq(key) => return Some(v),
                Some(_) => idx = (idx + 1) & mask,
                None => return None,
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.slots.iter().filter_map(|s| s.as_ref().map(|(k, v)| (k, v)))
    }

    pub fn next_key(&self, key: &Value) -> Option<Value> {
        let keys: Vec<&Value> = self.slots.iter().filter_map(|s| s.as_ref().map(|(k, _)| k)).collect();
        if matches!(key, Value::Nil) {
            return keys.first().map(|k| (*k).clone());
        }
        let pos = keys.iter().position(|k| k.value_eq(key))?;
        keys.get(pos + 1).map(|k| (*k).clone())
    }
}

impl PartialEq for Struct {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.length == other.length
            && self.iter().all(|(k, v)| other.get(k).is_some_and(|ov| ov.value_eq(v)))
    }
}

impl Trace for Struct {
    fn trace(&self, heap: &Heap) {
        for (k, v) in self.iter() {
            k.trace_children(heap);
            v.trace_children(heap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_order_independent_hash() {
        let a = Struct::new(vec![
            (Value::Number(1.0), Value::Number(10.0)),
            (Value::Number(2.0), Value::Number(20.0)),
        ]);
        let b = Struct::new(vec![
            (Value::Number(2.0), Value::Number(20.0)),
            (Value::Number(1.0), Value::Number(10.0)),
        ]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
    }

    #[test]
    fn get_roundtrip() {
        let s = Struct::new(vec![(Value::Number(3.0), Value::Number(9.0))]);
        assert_eq!(s.get(&Value::Number(3.0)), Some(&Value::Number(9.0)));
        assert_eq!(s.get(&Value::Number(4.0)), None);
    }
}
