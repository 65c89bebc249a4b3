use std::any::Any;
use std::fmt;

use super::field::FieldValue;

/// Named getter/setter pair for one field of a record type.
pub struct FieldAccess<R> {
    pub name: &'static str,
    pub get: fn(&R) -> FieldValue,
    pub set: fn(&mut R, FieldValue),
}

impl<R> fmt::Debug for FieldAccess<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccess").field("name", &self.name).finish()
    }
}

/// A structured record that can be delta-compressed. The accessor list is
/// the complete set of names a description may refer to, and its order
/// defines the field index used by table-definition messages.
pub trait DeltaRecord: Clone + Default + 'static {
    fn fields() -> &'static [FieldAccess<Self>];

    fn field_index(name: &str) -> Option<usize> {
        Self::fields().iter().position(|f| f.name == name)
    }

    fn get(&self, slot: usize) -> Option<FieldValue> {
        Self::fields().get(slot).map(|f| (f.get)(self))
    }

    fn set(&mut self, slot: usize, value: FieldValue) {
        if let Some(f) = Self::fields().get(slot) {
            (f.set)(self, value);
        }
    }
}

/// Type-erased read access handed to custom encoders.
pub trait RecordView {
    fn field(&self, name: &str) -> Option<FieldValue>;
    fn field_at(&self, slot: usize) -> Option<FieldValue>;
    fn as_any(&self) -> &dyn Any;
}

impl<R: DeltaRecord> RecordView for R {
    fn field(&self, name: &str) -> Option<FieldValue> {
        R::field_index(name).and_then(|slot| self.get(slot))
    }

    fn field_at(&self, slot: usize) -> Option<FieldValue> {
        self.get(slot)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Implements [`DeltaRecord`] from a list of `"wire name": kind(path)`
/// entries, where kind is `int`, `float` or `text`.
macro_rules! delta_record {
    (@access $ty:ty, $name:literal, int, $($path:tt)+) => {
        $crate::delta::FieldAccess {
            name: $name,
            get: |r: &$ty| $crate::delta::FieldValue::Int(r.$($path)+ as i32),
            set: |r: &mut $ty, v: $crate::delta::FieldValue| {
                if let $crate::delta::FieldValue::Int(v) = v {
                    r.$($path)+ = v as _;
                }
            },
        }
    };

    (@access $ty:ty, $name:literal, float, $($path:tt)+) => {
        $crate::delta::FieldAccess {
            name: $name,
            get: |r: &$ty| $crate::delta::FieldValue::Float(r.$($path)+),
            set: |r: &mut $ty, v: $crate::delta::FieldValue| {
                if let $crate::delta::FieldValue::Float(v) = v {
                    r.$($path)+ = v;
                }
            },
        }
    };

    (@access $ty:ty, $name:literal, text, $($path:tt)+) => {
        $crate::delta::FieldAccess {
            name: $name,
            get: |r: &$ty| $crate::delta::FieldValue::Text(r.$($path)+.clone()),
            set: |r: &mut $ty, v: $crate::delta::FieldValue| {
                if let $crate::delta::FieldValue::Text(v) = v {
                    r.$($path)+ = v;
                }
            },
        }
    };

    ($ty:ty { $($name:literal : $kind:ident ( $($path:tt)+ )),* $(,)? }) => {
        impl $crate::delta::DeltaRecord for $ty {
            fn fields() -> &'static [$crate::delta::FieldAccess<Self>] {
                static FIELDS: &[$crate::delta::FieldAccess<$ty>] = &[
                    $( delta_record!(@access $ty, $name, $kind, $($path)+) ),*
                ];
                FIELDS
            }
        }
    };
}

pub(crate) use delta_record;
