//! Static, compile-time schema metadata.
//!
//! Descriptors are produced by a generator that sits outside this crate
//! — `obus` only consumes them as `'static` data. Everything here is
//! `Copy`/`Eq` so descriptor identity can be compared by pointer.

/// Primitive wire types a field can hold.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PrimitiveType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Bool,
    String,
    Enum,
}

impl PrimitiveType {
    /// The low-7-bits type byte on the wire.
    pub fn wire_code(self) -> u8 {
        match self {
            PrimitiveType::U8 => 0,
            PrimitiveType::I8 => 1,
            PrimitiveType::U16 => 2,
            PrimitiveType::I16 => 3,
            PrimitiveType::U32 => 4,
            PrimitiveType::I32 => 5,
            PrimitiveType::U64 => 6,
            PrimitiveType::I64 => 7,
            PrimitiveType::F32 => 8,
            PrimitiveType::F64 => 9,
            PrimitiveType::Bool => 10,
            PrimitiveType::String => 11,
            PrimitiveType::Enum => 12,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<PrimitiveType> {
        Some(match code {
            0 => PrimitiveType::U8,
            1 => PrimitiveType::I8,
            2 => PrimitiveType::U16,
            3 => PrimitiveType::I16,
            4 => PrimitiveType::U32,
            5 => PrimitiveType::I32,
            6 => PrimitiveType::U64,
            7 => PrimitiveType::I64,
            8 => PrimitiveType::F32,
            9 => PrimitiveType::F64,
            10 => PrimitiveType::Bool,
            11 => PrimitiveType::String,
            12 => PrimitiveType::Enum,
            _ => return None,
        })
    }
}

/// The role a field plays in its enclosing record.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum FieldRole {
    Property,
    Method,
    Argument,
}

/// Describes an enum field's backing type and behavior. Descriptor
/// authors provide one `&'static EnumDriver` per enum type; several
/// fields may share the same driver.
#[derive(Debug)]
pub struct EnumDriver {
    pub name: &'static str,
    pub size: u8,
    /// The value an unset enum field should be treated as, which is not
    /// necessarily `0` (e.g. `net_interface_state::DOWN = -3`
    /// example).
    pub default_value: i64,
    pub validate: fn(i64) -> bool,
    pub format: fn(i64) -> &'static str,
}

/// One field of a record (an object's info struct, an event's update
/// set, or a method's argument struct).
#[derive(Debug)]
pub struct FieldDescriptor {
    pub uid: u16,
    pub name: &'static str,
    pub role: FieldRole,
    pub ty: PrimitiveType,
    pub is_array: bool,
    pub enum_driver: Option<&'static EnumDriver>,
}

/// An ordered, static list of fields making up one record shape.
pub type RecordDescriptor = &'static [FieldDescriptor];

/// One event an object descriptor exposes: a UID, a name, and the set
/// of fields the event is permitted to mutate.
pub struct EventDescriptor {
    pub uid: u16,
    pub name: &'static str,
    pub updates: &'static [u16],
}

impl EventDescriptor {
    /// Whether `field_uid` is listed in this event's update set.
    pub fn permits(&self, field_uid: u16) -> bool {
        self.updates.contains(&field_uid)
    }
}

/// One method an object descriptor exposes.
pub struct MethodDescriptor {
    pub uid: u16,
    pub name: &'static str,
    pub args: RecordDescriptor,
}

/// Describes one kind of object on a bus.
pub struct ObjectDescriptor {
    pub uid: u16,
    pub name: &'static str,
    pub info: RecordDescriptor,
    pub events: &'static [EventDescriptor],
    pub methods: &'static [MethodDescriptor],
}

impl ObjectDescriptor {
    pub fn event_by_uid(&self, uid: u16) -> Option<&'static EventDescriptor> {
        self.events.iter().find(|e| e.uid == uid)
    }

    pub fn method_by_uid(&self, uid: u16) -> Option<&'static MethodDescriptor> {
        self.methods.iter().find(|m| m.uid == uid)
    }
}

/// Reserved bus-event UIDs, synthesized by the client engine and never
/// sent on the wire.
pub mod synthetic_bus_event {
    pub const CONNECTED: u16 = 1;
    pub const DISCONNECTED: u16 = 2;
    pub const CONNECTION_REFUSED: u16 = 3;
}

/// One named bus-event kind, tagging a group of atomic mutations.
pub struct BusEventDescriptor {
    pub uid: u16,
    pub name: &'static str,
}

/// The whole static schema graph for one bus.
pub struct BusDescriptor {
    pub name: &'static str,
    pub schema_crc: u32,
    pub objects: &'static [ObjectDescriptor],
    pub bus_events: &'static [BusEventDescriptor],
}

impl BusDescriptor {
    pub fn object_by_uid(&self, uid: u16) -> Option<&'static ObjectDescriptor> {
        self.objects.iter().find(|o| o.uid == uid)
    }

    pub fn bus_event_by_uid(&self, uid: u16) -> Option<&'static BusEventDescriptor> {
        self.bus_events.iter().find(|e| e.uid == uid)
    }
}
