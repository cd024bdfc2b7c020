//! Events: a partial [`Record`] naming the fields one object update
//! touches, bound to an [`EventDescriptor`].

use crate::descriptor::EventDescriptor;
use crate::record::Record;

/// One emitted event: the fields it updates, plus the descriptor that
/// says which fields it's allowed to touch.
pub struct Event {
    descriptor: &'static EventDescriptor,
    fields: Record,
}

impl Event {
    pub fn new(descriptor: &'static EventDescriptor, fields: Record) -> Event {
        Event { descriptor, fields }
    }

    pub fn descriptor(&self) -> &'static EventDescriptor {
        self.descriptor
    }

    pub fn fields(&self) -> &Record {
        &self.fields
    }

    pub fn uid(&self) -> u16 {
        self.descriptor.uid
    }

    /// Fields set on this event but not named in its descriptor's update
    /// set.
    pub fn illegal_fields(&self) -> Vec<u16> {
        self.fields.illegal_fields(&|uid| self.descriptor.permits(uid))
    }

    /// Server-side sanitization: illegal fields are
    /// stripped from the wire copy before it's broadcast. Returns the
    /// stripped uids for the caller to log.
    pub fn strip_illegal(&mut self) -> Vec<u16> {
        let illegal = self.illegal_fields();
        self.fields.strip(&illegal);
        illegal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FieldDescriptor, FieldRole, PrimitiveType};
    use crate::record::FieldValue;

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

    static EVENT: EventDescriptor = EventDescriptor {
        uid: 10,
        name: "speed_changed",
        updates: &[2],
    };

    #[test]
    fn illegal_field_is_detected_and_stripped() {
        let mut fields = Record::empty(FIELDS);
        fields.set(1, FieldValue::Str("UP".into()));
        fields.set(2, FieldValue::U32(42));

        let mut event = Event::new(&EVENT, fields);
        assert_eq!(event.illegal_fields(), vec![1]);

        let stripped = event.strip_illegal();
        assert_eq!(stripped, vec![1]);
        assert!(!event.fields().is_set(1));
        assert!(event.fields().is_set(2));
    }

    #[test]
    fn permitted_event_has_no_illegal_fields() {
        let mut fields = Record::empty(FIELDS);
        fields.set(2, FieldValue::U32(42));
        let event = Event::new(&EVENT, fields);
        assert!(event.illegal_fields().is_empty());
    }
}
