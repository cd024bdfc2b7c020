//! Bus events: the atomic add/event/remove batch.
//! describe as the unit of commit. One bus event carries zero or more
//! object adds, zero or more per-object events, and zero or more object
//! removes, applied in that fixed order so observers never see a
//! partial state.

use crate::descriptor::BusEventDescriptor;
use crate::event::Event;
use crate::handle::ObjectHandle;
use crate::record::Record;

/// A single object creation inside a bus event.
pub struct Addition {
    pub handle: ObjectHandle,
    pub object_uid: u16,
    pub info: Record,
}

/// A single object destruction inside a bus event.
pub struct Removal {
    pub handle: ObjectHandle,
    pub object_uid: u16,
}

/// A per-object event inside a bus event.
pub struct EventEntry {
    pub handle: ObjectHandle,
    pub object_uid: u16,
    pub event: Event,
}

/// The atomic batch itself. Commit order is fixed: additions, then
/// events, then removals — an object added in this same
/// batch can be the target of one of its events, and an object removed
/// in this batch has already delivered all of its events.
#[derive(Default)]
pub struct BusEvent {
    descriptor: Option<&'static BusEventDescriptor>,
    additions: Vec<Addition>,
    events: Vec<EventEntry>,
    removals: Vec<Removal>,
}

impl BusEvent {
    pub fn new() -> BusEvent {
        BusEvent::default()
    }

    /// A bus event tagged with a descriptor, matching what arrives over
    /// the wire (or gets sent over it).
    pub fn tagged(descriptor: &'static BusEventDescriptor) -> BusEvent {
        BusEvent {
            descriptor: Some(descriptor),
            ..BusEvent::default()
        }
    }

    pub fn descriptor(&self) -> Option<&'static BusEventDescriptor> {
        self.descriptor
    }

    pub fn add(&mut self, handle: ObjectHandle, object_uid: u16, info: Record) {
        self.additions.push(Addition { handle, object_uid, info });
    }

    pub fn event(&mut self, handle: ObjectHandle, object_uid: u16, event: Event) {
        self.events.push(EventEntry { handle, object_uid, event });
    }

    pub fn remove(&mut self, handle: ObjectHandle, object_uid: u16) {
        self.removals.push(Removal { handle, object_uid });
    }

    pub fn additions(&self) -> &[Addition] {
        &self.additions
    }

    pub fn events(&self) -> &[EventEntry] {
        &self.events
    }

    pub fn removals(&self) -> &[Removal] {
        &self.removals
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.events.is_empty() && self.removals.is_empty()
    }
}

/// Synthetic bus events the client engine raises locally around
/// connection state transitions, built directly instead of decoded
/// from a `BusEvent` packet — they never cross the wire.
pub mod synthetic {
    use super::BusEvent;
    use crate::descriptor::synthetic_bus_event;
    use crate::descriptor::BusEventDescriptor;

    pub static CONNECTED: BusEventDescriptor = BusEventDescriptor {
        uid: synthetic_bus_event::CONNECTED,
        name: "connected",
    };
    pub static DISCONNECTED: BusEventDescriptor = BusEventDescriptor {
        uid: synthetic_bus_event::DISCONNECTED,
        name: "disconnected",
    };
    pub static CONNECTION_REFUSED: BusEventDescriptor = BusEventDescriptor {
        uid: synthetic_bus_event::CONNECTION_REFUSED,
        name: "connection_refused",
    };

    pub fn connected() -> BusEvent {
        BusEvent::tagged(&CONNECTED)
    }

    pub fn disconnected() -> BusEvent {
        BusEvent::tagged(&DISCONNECTED)
    }

    pub fn connection_refused() -> BusEvent {
        BusEvent::tagged(&CONNECTION_REFUSED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EventDescriptor, FieldDescriptor, FieldRole, PrimitiveType};

    static INFO_FIELDS: &[FieldDescriptor] = &[FieldDescriptor {
        uid: 1,
        name: "state",
        role: FieldRole::Property,
        ty: PrimitiveType::String,
        is_array: false,
        enum_driver: None,
    }];

    static EVENT_DESC: EventDescriptor = EventDescriptor {
        uid: 10,
        name: "state_changed",
        updates: &[1],
    };

    #[test]
    fn empty_bus_event_reports_empty() {
        let event = BusEvent::new();
        assert!(event.is_empty());
    }

    #[test]
    fn commit_order_preserves_insertion_within_each_list() {
        let mut bus_event = BusEvent::new();
        bus_event.add(ObjectHandle(1), 1, Record::empty(INFO_FIELDS));
        bus_event.add(ObjectHandle(2), 1, Record::empty(INFO_FIELDS));
        bus_event.event(ObjectHandle(1), 1, Event::new(&EVENT_DESC, Record::empty(INFO_FIELDS)));
        bus_event.remove(ObjectHandle(2), 1);

        assert_eq!(bus_event.additions().len(), 2);
        assert_eq!(bus_event.events().len(), 1);
        assert_eq!(bus_event.removals().len(), 1);
        assert!(!bus_event.is_empty());
    }

    #[test]
    fn synthetic_events_carry_reserved_uids() {
        assert_eq!(synthetic::connected().descriptor().unwrap().uid, 1);
        assert_eq!(synthetic::disconnected().descriptor().unwrap().uid, 2);
        assert_eq!(synthetic::connection_refused().descriptor().unwrap().uid, 3);
    }
}
