//! Approximate in-memory size of cached values.
//!
//! The estimates only need to be proportionate, not exact: they drive the
//! cache's memory cap. Types the heuristics cannot see inside (handles,
//! foreign objects) should pass their own estimator to the cache.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;

/// Cost of `None` / JSON `null`.
pub const NULL_BYTES: usize = 0;
/// Cost of a boolean.
pub const BOOL_BYTES: usize = 4;
/// Cost of a number.
pub const NUMBER_BYTES: usize = 8;
/// Fallback for values that are too large or cannot be serialized.
pub const UNKNOWN_OBJECT_BYTES: usize = 1024;
/// JSON objects with more fields than this get the fallback estimate.
pub const MAX_SERIALIZED_FIELDS: usize = 100;
/// Collections longer than this are extrapolated from a sample.
const SAMPLE_LEN: usize = 32;

pub trait EstimateSize {
    fn estimated_bytes(&self) -> usize;
}

/// Serialized JSON length of `value`, or [`UNKNOWN_OBJECT_BYTES`] when serialization fails.
pub fn estimate_serialized<T: Serialize + ?Sized>(value: &T) -> usize {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len(),
        Err(e) => {
            tracing::trace!(error = %e, "size estimate fell back to constant");
            UNKNOWN_OBJECT_BYTES
        }
    }
}

fn estimate_items<'a, T, I>(len: usize, items: I) -> usize
where
    T: EstimateSize + 'a + ?Sized,
    I: Iterator<Item = &'a T>,
{
    if len <= SAMPLE_LEN {
        return items.map(EstimateSize::estimated_bytes).sum();
    }
    let sampled: usize = items.take(SAMPLE_LEN).map(EstimateSize::estimated_bytes).sum();
    sampled / SAMPLE_LEN * len
}

impl EstimateSize for str {
    fn estimated_bytes(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for String {
    fn estimated_bytes(&self) -> usize {
        self.len()
    }
}

impl EstimateSize for bool {
    fn estimated_bytes(&self) -> usize {
        BOOL_BYTES
    }
}

impl EstimateSize for () {
    fn estimated_bytes(&self) -> usize {
        NULL_BYTES
    }
}

macro_rules! number_size {
    ($($t:ty),*) => {
        $(impl EstimateSize for $t {
            fn estimated_bytes(&self) -> usize {
                NUMBER_BYTES
            }
        })*
    };
}

number_size!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, char);

impl<T: EstimateSize> EstimateSize for Option<T> {
    fn estimated_bytes(&self) -> usize {
        self.as_ref().map_or(NULL_BYTES, EstimateSize::estimated_bytes)
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Box<T> {
    fn estimated_bytes(&self) -> usize {
        (**self).estimated_bytes()
    }
}

impl<T: EstimateSize + ?Sized> EstimateSize for Arc<T> {
    fn estimated_bytes(&self) -> usize {
        (**self).estimated_bytes()
    }
}

impl<T: EstimateSize> EstimateSize for [T] {
    fn estimated_bytes(&self) -> usize {
        estimate_items(self.len(), self.iter())
    }
}

impl<T: EstimateSize> EstimateSize for Vec<T> {
    fn estimated_bytes(&self) -> usize {
        self.as_slice().estimated_bytes()
    }
}

impl<T: EstimateSize> EstimateSize for VecDeque<T> {
    fn estimated_bytes(&self) -> usize {
        estimate_items(self.len(), self.iter())
    }
}

impl<T: EstimateSize, S> EstimateSize for HashSet<T, S> {
    fn estimated_bytes(&self) -> usize {
        estimate_items(self.len(), self.iter())
    }
}

impl<K: EstimateSize, V: EstimateSize, S> EstimateSize for HashMap<K, V, S> {
    fn estimated_bytes(&self) -> usize {
        estimate_items(self.len(), self.keys()) + estimate_items(self.len(), self.values())
    }
}

impl<K: EstimateSize, V: EstimateSize> EstimateSize for BTreeMap<K, V> {
    fn estimated_bytes(&self) -> usize {
        estimate_items(self.len(), self.keys()) + estimate_items(self.len(), self.values())
    }
}

impl EstimateSize for serde_json::Value {
    fn estimated_bytes(&self) -> usize {
        use serde_json::Value;
        match self {
            Value::Null => NULL_BYTES,
            Value::Bool(_) => BOOL_BYTES,
            Value::Number(_) => NUMBER_BYTES,
            Value::String(s) => s.len(),
            Value::Array(items) => items.estimated_bytes(),
            Value::Object(map) if map.len() <= MAX_SERIALIZED_FIELDS => estimate_serialized(map),
            Value::Object(_) => UNKNOWN_OBJECT_BYTES,
        }
    }
}
