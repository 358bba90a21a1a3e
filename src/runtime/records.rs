//! Closure records: fixed-arity heap records with `item1..itemN` fields,
//! an arity count, and a boxed get/set indexer. The same family backs
//! hoisted-variable storage, quote cell-environments, and the
//! runtime-variables handles.
//!
//! Arities up to 16 use the pre-generated family below; larger arities
//! use [`RecordN`] with a process-wide shape cache keyed by arity.

use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use super::{RuntimeError, Value};

/// Index-addressable, polymorphic, read/write view over a set of values.
/// Closure records, marshalled variable handles, and merged handles all
/// implement this.
pub trait RuntimeVariables: fmt::Debug + Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Value, RuntimeError>;

    fn set(&self, index: usize, value: Value) -> Result<(), RuntimeError>;

    /// The stable field name for an index (`item1..itemN`), used by
    /// record debugging and the emit-layer disassembler.
    fn field_name(&self, index: usize) -> Option<&str>;
}

fn out_of_range(index: usize, len: usize) -> RuntimeError {
    RuntimeError::IndexOutOfRange {
        index: index as i64,
        len,
    }
}

// ============================================================================
// Pre-generated family (arity 1..=16)
// ============================================================================

macro_rules! record_family {
    ($($name:ident => $count:literal { $($field:ident : $idx:tt),+ });+ $(;)?) => {$(
        pub struct $name {
            $(pub $field: RwLock<Value>,)+
        }

        impl $name {
            pub fn new() -> $name {
                $name {
                    $($field: RwLock::new(Value::Nil),)+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl RuntimeVariables for $name {
            fn len(&self) -> usize {
                $count
            }

            fn get(&self, index: usize) -> Result<Value, RuntimeError> {
                match index {
                    $($idx => Ok(self.$field.read().unwrap().clone()),)+
                    _ => Err(out_of_range(index, $count)),
                }
            }

            fn set(&self, index: usize, value: Value) -> Result<(), RuntimeError> {
                match index {
                    $($idx => {
                        *self.$field.write().unwrap() = value;
                        Ok(())
                    })+
                    _ => Err(out_of_range(index, $count)),
                }
            }

            fn field_name(&self, index: usize) -> Option<&str> {
                match index {
                    $($idx => Some(stringify!($field)),)+
                    _ => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}[{}]", stringify!($name), $count)
            }
        }
    )+};
}

record_family! {
    Record1 => 1 { item1: 0 };
    Record2 => 2 { item1: 0, item2: 1 };
    Record3 => 3 { item1: 0, item2: 1, item3: 2 };
    Record4 => 4 { item1: 0, item2: 1, item3: 2, item4: 3 };
    Record5 => 5 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4 };
    Record6 => 6 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5 };
    Record7 => 7 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6 };
    Record8 => 8 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7 };
    Record9 => 9 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8 };
    Record10 => 10 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8, item10: 9 };
    Record11 => 11 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8, item10: 9, item11: 10 };
    Record12 => 12 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8, item10: 9, item11: 10, item12: 11 };
    Record13 => 13 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8, item10: 9, item11: 10, item12: 11, item13: 12 };
    Record14 => 14 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8, item10: 9, item11: 10, item12: 11, item13: 12, item14: 13 };
    Record15 => 15 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8, item10: 9, item11: 10, item12: 11, item13: 12, item14: 13,
        item15: 14 };
    Record16 => 16 { item1: 0, item2: 1, item3: 2, item4: 3, item5: 4, item6: 5, item7: 6,
        item8: 7, item9: 8, item10: 9, item11: 10, item12: 11, item13: 12, item14: 13,
        item15: 14, item16: 15 };
}

// ============================================================================
// Dynamic records (arity > 16)
// ============================================================================

/// Field-name table for one large-record arity. Cached process-wide so
/// every record of an arity shares one table.
pub(crate) struct RecordShape {
    names: Box<[Box<str>]>,
}

static LARGE_SHAPES: Lazy<Mutex<FxHashMap<usize, Arc<RecordShape>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

pub(crate) fn shape_for_arity(arity: usize) -> Arc<RecordShape> {
    let mut cache = LARGE_SHAPES.lock().unwrap();
    cache
        .entry(arity)
        .or_insert_with(|| {
            let names = (1..=arity)
                .map(|i| format!("item{i}").into_boxed_str())
                .collect();
            Arc::new(RecordShape { names })
        })
        .clone()
}

#[cfg(test)]
pub(crate) fn large_shape_cached(arity: usize) -> bool {
    LARGE_SHAPES.lock().unwrap().contains_key(&arity)
}

/// A record of arbitrary arity, used beyond the pre-generated family.
pub struct RecordN {
    shape: Arc<RecordShape>,
    items: Box<[RwLock<Value>]>,
}

impl RecordN {
    pub fn new(arity: usize) -> RecordN {
        RecordN {
            shape: shape_for_arity(arity),
            items: (0..arity).map(|_| RwLock::new(Value::Nil)).collect(),
        }
    }
}

impl RuntimeVariables for RecordN {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn get(&self, index: usize) -> Result<Value, RuntimeError> {
        match self.items.get(index) {
            Some(slot) => Ok(slot.read().unwrap().clone()),
            None => Err(out_of_range(index, self.items.len())),
        }
    }

    fn set(&self, index: usize, value: Value) -> Result<(), RuntimeError> {
        match self.items.get(index) {
            Some(slot) => {
                *slot.write().unwrap() = value;
                Ok(())
            }
            None => Err(out_of_range(index, self.items.len())),
        }
    }

    fn field_name(&self, index: usize) -> Option<&str> {
        self.shape.names.get(index).map(|n| n.as_ref())
    }
}

impl fmt::Debug for RecordN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordN[{}]", self.items.len())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Allocate a record of the given arity, all fields nil. Arities within
/// the pre-generated family get a family instance; larger arities fall
/// back to [`RecordN`].
pub fn new_record(arity: usize) -> Arc<dyn RuntimeVariables> {
    match arity {
        1 => Arc::new(Record1::new()),
        2 => Arc::new(Record2::new()),
        3 => Arc::new(Record3::new()),
        4 => Arc::new(Record4::new()),
        5 => Arc::new(Record5::new()),
        6 => Arc::new(Record6::new()),
        7 => Arc::new(Record7::new()),
        8 => Arc::new(Record8::new()),
        9 => Arc::new(Record9::new()),
        10 => Arc::new(Record10::new()),
        11 => Arc::new(Record11::new()),
        12 => Arc::new(Record12::new()),
        13 => Arc::new(Record13::new()),
        14 => Arc::new(Record14::new()),
        15 => Arc::new(Record15::new()),
        16 => Arc::new(Record16::new()),
        n => Arc::new(RecordN::new(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_get_set() {
        let rec = new_record(3);
        assert_eq!(rec.len(), 3);
        rec.set(1, Value::Int(42)).unwrap();
        assert_eq!(rec.get(1).unwrap().to_int(), Some(42));
        assert!(rec.get(0).unwrap().is_nil());
    }

    #[test]
    fn test_index_out_of_range() {
        let rec = new_record(2);
        assert!(rec.get(2).is_err());
        assert!(rec.set(5, Value::Nil).is_err());
    }

    #[test]
    fn test_field_names_are_stable() {
        let rec = new_record(4);
        assert_eq!(rec.field_name(0), Some("item1"));
        assert_eq!(rec.field_name(3), Some("item4"));
        assert_eq!(rec.field_name(4), None);
    }

    #[test]
    fn test_arity_sixteen_uses_family() {
        let rec = new_record(16);
        assert_eq!(rec.len(), 16);
        assert_eq!(rec.field_name(15), Some("item16"));
        assert!(!large_shape_cached(16));
    }

    #[test]
    fn test_arity_seventeen_uses_dynamic_records() {
        let rec = new_record(17);
        assert_eq!(rec.len(), 17);
        assert_eq!(rec.field_name(16), Some("item17"));
        assert!(large_shape_cached(17));
    }

    #[test]
    fn test_large_shapes_are_shared() {
        let a = RecordN::new(20);
        let b = RecordN::new(20);
        assert!(Arc::ptr_eq(&a.shape, &b.shape));
    }

    #[test]
    fn test_mixed_types_in_one_record() {
        let rec = new_record(2);
        rec.set(0, Value::Str("hi".into())).unwrap();
        rec.set(1, Value::Bool(true)).unwrap();
        assert_eq!(rec.get(0).unwrap().as_str(), Some("hi"));
        assert_eq!(rec.get(1).unwrap().to_bool(), Some(true));
    }
}
