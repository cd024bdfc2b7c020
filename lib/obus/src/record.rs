//! The runtime value side of the data model: [`FieldValue`], the Rust
//! sum type standing in for the source's offset-based raw-memory writes
//! (Design Notes §9), and [`Record`], a presence-tracked info struct.

use crate::descriptor::{FieldRole, PrimitiveType, RecordDescriptor};

/// One decoded (or about-to-be-encoded) field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),
    Enum(i64),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    pub fn primitive_type(&self) -> Option<PrimitiveType> {
        Some(match self {
            FieldValue::U8(_) => PrimitiveType::U8,
            FieldValue::I8(_) => PrimitiveType::I8,
            FieldValue::U16(_) => PrimitiveType::U16,
            FieldValue::I16(_) => PrimitiveType::I16,
            FieldValue::U32(_) => PrimitiveType::U32,
            FieldValue::I32(_) => PrimitiveType::I32,
            FieldValue::U64(_) => PrimitiveType::U64,
            FieldValue::I64(_) => PrimitiveType::I64,
            FieldValue::F32(_) => PrimitiveType::F32,
            FieldValue::F64(_) => PrimitiveType::F64,
            FieldValue::Bool(_) => PrimitiveType::Bool,
            FieldValue::Str(_) => PrimitiveType::String,
            FieldValue::Enum(_) => PrimitiveType::Enum,
            FieldValue::Array(_) => return None,
        })
    }
}

/// A record instance: one `Option<FieldValue>` slot per field in the
/// backing [`RecordDescriptor`], in descriptor order. `Option::is_some`
/// *is* the presence bit; there is no separate bitmask to keep in sync.
#[derive(Debug, Clone)]
pub struct Record {
    descriptor: RecordDescriptor,
    values: Vec<Option<FieldValue>>,
}

impl Record {
    /// Builds an all-absent record for `descriptor`.
    pub fn empty(descriptor: RecordDescriptor) -> Record {
        Record {
            descriptor,
            values: vec![None; descriptor.len()],
        }
    }

    pub fn descriptor(&self) -> RecordDescriptor {
        self.descriptor
    }

    fn index_of(&self, field_uid: u16) -> Option<usize> {
        self.descriptor.iter().position(|f| f.uid == field_uid)
    }

    /// Sets the field identified by `field_uid`, marking it present.
    /// Returns `false` (and does nothing) if the uid is not in this
    /// record's descriptor.
    pub fn set(&mut self, field_uid: u16, value: FieldValue) -> bool {
        match self.index_of(field_uid) {
            Some(idx) => {
                self.values[idx] = Some(value);
                true
            }
            None => false,
        }
    }

    /// Clears the presence bit for `field_uid`, if present in the
    /// descriptor.
    pub fn unset(&mut self, field_uid: u16) {
        if let Some(idx) = self.index_of(field_uid) {
            self.values[idx] = None;
        }
    }

    pub fn get(&self, field_uid: u16) -> Option<&FieldValue> {
        self.index_of(field_uid).and_then(|idx| self.values[idx].as_ref())
    }

    pub fn is_set(&self, field_uid: u16) -> bool {
        self.get(field_uid).is_some()
    }

    /// Iterates over the fields that are present, in descriptor order.
    pub fn set_fields(&self) -> impl Iterator<Item = (&'static crate::descriptor::FieldDescriptor, &FieldValue)> {
        self.descriptor
            .iter()
            .zip(self.values.iter())
            .filter_map(|(field, value)| value.as_ref().map(|v| (field, v)))
    }

    pub fn set_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Merges `other`'s set fields into `self`, overwriting. Unset
    /// fields in `other` leave the corresponding field in `self`
    /// untouched.
    pub fn merge(&mut self, other: &Record) {
        for (idx, value) in other.values.iter().enumerate() {
            if let Some(v) = value {
                self.values[idx] = Some(v.clone());
            }
        }
    }

    /// Strips any set field not permitted by `updates`, returning the
    /// uids that were stripped. Used by the server's `send_event`
    /// sanitization and the client's warn-and-keep path
    /// — the caller decides whether to discard or just
    /// log the returned list.
    pub fn illegal_fields(&self, permitted: &dyn Fn(u16) -> bool) -> Vec<u16> {
        self.descriptor
            .iter()
            .zip(self.values.iter())
            .filter(|(field, value)| value.is_some() && !permitted(field.uid))
            .map(|(field, _)| field.uid)
            .collect()
    }

    pub fn strip(&mut self, field_uids: &[u16]) {
        for uid in field_uids {
            self.unset(*uid);
        }
    }

    pub fn role_fields(&self, role: FieldRole) -> impl Iterator<Item = &crate::descriptor::FieldDescriptor> {
        self.descriptor.iter().filter(move |f| f.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldDescriptor;

    static FIELDS: &[FieldDescriptor] = &[
        FieldDescriptor {
            uid: 1,
            name: "state",
            role: FieldRole::Property,
            ty: PrimitiveType::String,
            is_array: false,
            enum_driver: None,
        },
        FieldDescriptor {
            uid: 2,
            name: "speed",
            role: FieldRole::Property,
            ty: PrimitiveType::U32,
            is_array: false,
            enum_driver: None,
        },
    ];

    #[test]
    fn empty_record_round_trips_as_empty() {
        let record = Record::empty(FIELDS);
        assert_eq!(record.set_count(), 0);
        assert!(!record.is_set(1));
    }

    #[test]
    fn merge_only_overwrites_set_fields() {
        let mut dest = Record::empty(FIELDS);
        dest.set(1, FieldValue::Str("UP".into()));
        dest.set(2, FieldValue::U32(10));

        let mut patch = Record::empty(FIELDS);
        patch.set(2, FieldValue::U32(99));

        dest.merge(&patch);

        assert_eq!(dest.get(1), Some(&FieldValue::Str("UP".into())));
        assert_eq!(dest.get(2), Some(&FieldValue::U32(99)));
    }

    #[test]
    fn illegal_fields_and_strip() {
        let mut record = Record::empty(FIELDS);
        record.set(1, FieldValue::Str("UP".into()));
        record.set(2, FieldValue::U32(1));

        let illegal = record.illegal_fields(&|uid| uid == 1);
        assert_eq!(illegal, vec![2]);

        record.strip(&illegal);
        assert!(record.is_set(1));
        assert!(!record.is_set(2));
    }
}
