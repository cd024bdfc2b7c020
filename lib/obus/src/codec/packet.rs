//! Frame delimitation and per-packet encode/decode.

use std::convert::TryFrom;
use std::io::{self, Cursor, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::record_codec::{decode_record, encode_record};
use crate::descriptor::BusDescriptor;
use crate::record::Record;

pub const MAGIC: u32 = 0x6F62_7573;
pub const HEADER_LEN: usize = 9;
pub const PROTOCOL_VERSION: u8 = 0x02;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    ConReq = 0,
    ConResp = 1,
    Add = 2,
    Remove = 3,
    BusEvent = 4,
    Event = 5,
    Call = 6,
    Ack = 7,
}

impl PacketType {
    pub const COUNT: u8 = 8;
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        Ok(match value {
            0 => PacketType::ConReq,
            1 => PacketType::ConResp,
            2 => PacketType::Add,
            3 => PacketType::Remove,
            4 => PacketType::BusEvent,
            5 => PacketType::Event,
            6 => PacketType::Call,
            7 => PacketType::Ack,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum AckStatus {
    Invalid = 0,
    Acked = 1,
    Aborted = 2,
    MethodDisabled = 3,
    MethodNotSupported = 4,
    InvalidArguments = 5,
    Refused = 6,
}

impl TryFrom<u8> for AckStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        Ok(match value {
            0 => AckStatus::Invalid,
            1 => AckStatus::Acked,
            2 => AckStatus::Aborted,
            3 => AckStatus::MethodDisabled,
            4 => AckStatus::MethodNotSupported,
            5 => AckStatus::InvalidArguments,
            6 => AckStatus::Refused,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ObjectAdd {
    pub object_uid: u16,
    pub handle: u16,
    pub info: Record,
}

#[derive(Debug, Clone, Copy)]
pub struct ObjectRemove {
    pub object_uid: u16,
    pub handle: u16,
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub object_uid: u16,
    pub handle: u16,
    pub event_uid: u16,
    pub fields: Record,
}

#[derive(Debug, Clone)]
pub enum ConnStatus {
    Accepted { objects: Vec<ObjectAdd> },
    Refused,
}

#[derive(Debug, Clone)]
pub enum Packet {
    ConReq {
        version: u8,
        bus_name: String,
        schema_crc: u32,
        client_name: String,
    },
    ConResp(ConnStatus),
    Add(ObjectAdd),
    Remove(ObjectRemove),
    BusEvent {
        uid: u16,
        adds: Vec<ObjectAdd>,
        removes: Vec<ObjectRemove>,
        events: Vec<EventRecord>,
    },
    Event(EventRecord),
    Call {
        object_uid: u16,
        handle: u16,
        method_uid: u16,
        call_handle: u16,
        args: Record,
    },
    Ack {
        call_handle: u16,
        status: AckStatus,
    },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConReq { .. } => PacketType::ConReq,
            Packet::ConResp(_) => PacketType::ConResp,
            Packet::Add(_) => PacketType::Add,
            Packet::Remove(_) => PacketType::Remove,
            Packet::BusEvent { .. } => PacketType::BusEvent,
            Packet::Event(_) => PacketType::Event,
            Packet::Call { .. } => PacketType::Call,
            Packet::Ack { .. } => PacketType::Ack,
        }
    }
}

fn write_object_add<W: Write>(out: &mut W, add: &ObjectAdd) -> io::Result<()> {
    out.write_u16::<BigEndian>(add.object_uid)?;
    out.write_u16::<BigEndian>(add.handle)?;
    let mut body = Vec::new();
    encode_record(&mut body, &add.info)?;
    out.write_u32::<BigEndian>(body.len() as u32)?;
    out.write_all(&body)
}

fn read_object_add(cur: &mut Cursor<&[u8]>, bus: &BusDescriptor) -> io::Result<Option<ObjectAdd>> {
    let object_uid = cur.read_u16::<BigEndian>()?;
    let handle = cur.read_u16::<BigEndian>()?;
    let struct_len = cur.read_u32::<BigEndian>()? as u64;
    let start = cur.position();

    let result = match bus.object_by_uid(object_uid) {
        Some(desc) => match decode_record(cur, desc.info) {
            Ok(info) => Some(ObjectAdd { object_uid, handle, info }),
            Err(_) => None,
        },
        None => None,
    };

    cur.set_position(start + struct_len);
    Ok(result)
}

fn write_object_remove<W: Write>(out: &mut W, remove: &ObjectRemove) -> io::Result<()> {
    out.write_u16::<BigEndian>(remove.object_uid)?;
    out.write_u16::<BigEndian>(remove.handle)
}

fn read_object_remove(cur: &mut Cursor<&[u8]>) -> io::Result<ObjectRemove> {
    Ok(ObjectRemove {
        object_uid: cur.read_u16::<BigEndian>()?,
        handle: cur.read_u16::<BigEndian>()?,
    })
}

fn write_event_record<W: Write>(out: &mut W, event: &EventRecord) -> io::Result<()> {
    out.write_u16::<BigEndian>(event.object_uid)?;
    out.write_u16::<BigEndian>(event.handle)?;
    out.write_u16::<BigEndian>(event.event_uid)?;
    let mut body = Vec::new();
    encode_record(&mut body, &event.fields)?;
    out.write_u32::<BigEndian>(body.len() as u32)?;
    out.write_all(&body)
}

fn read_event_record(cur: &mut Cursor<&[u8]>, bus: &BusDescriptor) -> io::Result<Option<EventRecord>> {
    let object_uid = cur.read_u16::<BigEndian>()?;
    let handle = cur.read_u16::<BigEndian>()?;
    let event_uid = cur.read_u16::<BigEndian>()?;
    let struct_len = cur.read_u32::<BigEndian>()? as u64;
    let start = cur.position();

    let result = match bus.object_by_uid(object_uid) {
        Some(desc) => match decode_record(cur, desc.info) {
            Ok(fields) => Some(EventRecord {
                object_uid,
                handle,
                event_uid,
                fields,
            }),
            Err(_) => None,
        },
        None => None,
    };

    cur.set_position(start + struct_len);
    Ok(result)
}

/// Encodes `packet`'s full frame (header + body) into `out`.
pub fn encode_packet(out: &mut Vec<u8>, packet: &Packet) -> io::Result<()> {
    let mut body = Vec::new();

    match packet {
        Packet::ConReq {
            version,
            bus_name,
            schema_crc,
            client_name,
        } => {
            body.write_u8(*version)?;
            super::field::write_string(&mut body, Some(bus_name))?;
            body.write_u32::<BigEndian>(*schema_crc)?;
            super::field::write_string(&mut body, Some(client_name))?;
        }
        Packet::ConResp(ConnStatus::Refused) => {
            body.write_u8(1)?;
        }
        Packet::ConResp(ConnStatus::Accepted { objects }) => {
            body.write_u8(0)?;
            body.write_u32::<BigEndian>(objects.len() as u32)?;
            for add in objects {
                write_object_add(&mut body, add)?;
            }
        }
        Packet::Add(add) => write_object_add(&mut body, add)?,
        Packet::Remove(remove) => write_object_remove(&mut body, remove)?,
        Packet::BusEvent { uid, adds, removes, events } => {
            body.write_u16::<BigEndian>(*uid)?;
            body.write_u32::<BigEndian>(adds.len() as u32)?;
            body.write_u32::<BigEndian>(removes.len() as u32)?;
            body.write_u32::<BigEndian>(events.len() as u32)?;
            for add in adds {
                write_object_add(&mut body, add)?;
            }
            for remove in removes {
                write_object_remove(&mut body, remove)?;
            }
            for event in events {
                write_event_record(&mut body, event)?;
            }
        }
        Packet::Event(event) => write_event_record(&mut body, event)?,
        Packet::Call {
            object_uid,
            handle,
            method_uid,
            call_handle,
            args,
        } => {
            body.write_u16::<BigEndian>(*object_uid)?;
            body.write_u16::<BigEndian>(*handle)?;
            body.write_u16::<BigEndian>(*method_uid)?;
            body.write_u16::<BigEndian>(*call_handle)?;
            let mut arg_body = Vec::new();
            encode_record(&mut arg_body, args)?;
            body.write_u32::<BigEndian>(arg_body.len() as u32)?;
            body.write_all(&arg_body)?;
        }
        Packet::Ack { call_handle, status } => {
            body.write_u16::<BigEndian>(*call_handle)?;
            body.write_u8(*status as u8)?;
        }
    }

    out.write_u32::<BigEndian>(MAGIC)?;
    out.write_u32::<BigEndian>((HEADER_LEN + body.len()) as u32)?;
    out.write_u8(packet.packet_type() as u8)?;
    out.write_all(&body)
}

/// Decodes one packet body, given its declared type, from `cur`
/// (positioned right after the 9-byte header). `bus` resolves object,
/// event and method uids to their field descriptors. `args_desc`
/// resolves a `Call` packet's argument record shape, looked up by the
/// caller via `(object_uid, method_uid)` since the wire format doesn't
/// repeat the method name.
pub fn decode_body(cur: &mut Cursor<&[u8]>, ty: PacketType, bus: &BusDescriptor) -> io::Result<Option<Packet>> {
    Ok(match ty {
        PacketType::ConReq => {
            let version = cur.read_u8()?;
            let bus_name = super::field::read_string(cur)?.unwrap_or_default();
            let schema_crc = cur.read_u32::<BigEndian>()?;
            let client_name = super::field::read_string(cur)?.unwrap_or_default();
            Some(Packet::ConReq {
                version,
                bus_name,
                schema_crc,
                client_name,
            })
        }
        PacketType::ConResp => {
            let status = cur.read_u8()?;
            if status == 1 {
                Some(Packet::ConResp(ConnStatus::Refused))
            } else {
                let count = cur.read_u32::<BigEndian>()?;
                let mut objects = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    if let Some(add) = read_object_add(cur, bus)? {
                        objects.push(add);
                    }
                }
                Some(Packet::ConResp(ConnStatus::Accepted { objects }))
            }
        }
        PacketType::Add => read_object_add(cur, bus)?.map(Packet::Add),
        PacketType::Remove => Some(Packet::Remove(read_object_remove(cur)?)),
        PacketType::BusEvent => {
            let uid = cur.read_u16::<BigEndian>()?;
            let n_add = cur.read_u32::<BigEndian>()?;
            let n_remove = cur.read_u32::<BigEndian>()?;
            let n_events = cur.read_u32::<BigEndian>()?;

            let mut adds = Vec::with_capacity(n_add as usize);
            for _ in 0..n_add {
                if let Some(add) = read_object_add(cur, bus)? {
                    adds.push(add);
                }
            }

            let mut removes = Vec::with_capacity(n_remove as usize);
            for _ in 0..n_remove {
                removes.push(read_object_remove(cur)?);
            }

            let mut events = Vec::with_capacity(n_events as usize);
            for _ in 0..n_events {
                if let Some(event) = read_event_record(cur, bus)? {
                    events.push(event);
                }
            }

            Some(Packet::BusEvent { uid, adds, removes, events })
        }
        PacketType::Event => read_event_record(cur, bus)?.map(Packet::Event),
        PacketType::Call => {
            let object_uid = cur.read_u16::<BigEndian>()?;
            let handle = cur.read_u16::<BigEndian>()?;
            let method_uid = cur.read_u16::<BigEndian>()?;
            let call_handle = cur.read_u16::<BigEndian>()?;
            let struct_len = cur.read_u32::<BigEndian>()? as u64;
            let start = cur.position();

            let args_desc = bus
                .object_by_uid(object_uid)
                .and_then(|obj| obj.method_by_uid(method_uid))
                .map(|m| m.args);

            let packet = match args_desc {
                Some(desc) => match decode_record(cur, desc) {
                    Ok(args) => Some(Packet::Call {
                        object_uid,
                        handle,
                        method_uid,
                        call_handle,
                        args,
                    }),
                    Err(_) => None,
                },
                None => None,
            };

            cur.set_position(start + struct_len);
            packet
        }
        PacketType::Ack => {
            let call_handle = cur.read_u16::<BigEndian>()?;
            let status = AckStatus::try_from(cur.read_u8()?).unwrap_or(AckStatus::Invalid);
            Some(Packet::Ack { call_handle, status })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{EventDescriptor, FieldDescriptor, FieldRole, MethodDescriptor, ObjectDescriptor, PrimitiveType};
    use crate::record::FieldValue;

    static INFO_FIELDS: &[FieldDescriptor] = &[FieldDescriptor {
        uid: 1,
        name: "state",
        role: FieldRole::Property,
        ty: PrimitiveType::String,
        is_array: false,
        enum_driver: None,
    }];

    static EVENTS: &[EventDescriptor] = &[EventDescriptor {
        uid: 10,
        name: "up",
        updates: &[1],
    }];

    static METHODS: &[MethodDescriptor] = &[];

    static OBJECTS: &[ObjectDescriptor] = &[ObjectDescriptor {
        uid: 1,
        name: "iface",
        info: INFO_FIELDS,
        events: EVENTS,
        methods: METHODS,
    }];

    fn bus() -> BusDescriptor {
        BusDescriptor {
            name: "test",
            schema_crc: 0xdead_beef,
            objects: OBJECTS,
            bus_events: &[],
        }
    }

    #[test]
    fn con_req_roundtrip() {
        let packet = Packet::ConReq {
            version: PROTOCOL_VERSION,
            bus_name: "test".into(),
            schema_crc: 0xdead_beef,
            client_name: "client-a".into(),
        };
        let mut buf = Vec::new();
        encode_packet(&mut buf, &packet).unwrap();

        assert_eq!(&buf[0..4], &MAGIC.to_be_bytes());
        let mut cur = Cursor::new(&buf[HEADER_LEN..]);
        let decoded = decode_body(&mut cur, PacketType::ConReq, &bus()).unwrap().unwrap();
        match decoded {
            Packet::ConReq { version, bus_name, schema_crc, client_name } => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert_eq!(bus_name, "test");
                assert_eq!(schema_crc, 0xdead_beef);
                assert_eq!(client_name, "client-a");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn add_record_roundtrip() {
        let mut info = Record::empty(INFO_FIELDS);
        info.set(1, FieldValue::Str("UP".into()));

        let packet = Packet::Add(ObjectAdd { object_uid: 1, handle: 42, info });
        let mut buf = Vec::new();
        encode_packet(&mut buf, &packet).unwrap();

        let mut cur = Cursor::new(&buf[HEADER_LEN..]);
        let decoded = decode_body(&mut cur, PacketType::Add, &bus()).unwrap().unwrap();
        match decoded {
            Packet::Add(add) => {
                assert_eq!(add.object_uid, 1);
                assert_eq!(add.handle, 42);
                assert_eq!(add.info.get(1), Some(&FieldValue::Str("UP".into())));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_object_uid_in_add_skips_via_declared_length() {
        let info = Record::empty(INFO_FIELDS);
        let packet = Packet::Add(ObjectAdd { object_uid: 999, handle: 1, info });
        let mut buf = Vec::new();
        encode_packet(&mut buf, &packet).unwrap();
        buf.write_u16::<BigEndian>(0xAB_CD).unwrap(); // trailing marker

        let mut cur = Cursor::new(&buf[HEADER_LEN..]);
        let decoded = decode_body(&mut cur, PacketType::Add, &bus()).unwrap();
        assert!(decoded.is_none());
        // cursor realigned past the declared struct length
        assert_eq!(cur.read_u16::<BigEndian>().unwrap(), 0xAB_CD);
    }

    #[test]
    fn bus_event_roundtrip() {
        let mut add_info = Record::empty(INFO_FIELDS);
        add_info.set(1, FieldValue::Str("UP".into()));
        let mut event_fields = Record::empty(INFO_FIELDS);
        event_fields.set(1, FieldValue::Str("DOWN".into()));

        let packet = Packet::BusEvent {
            uid: 99,
            adds: vec![ObjectAdd { object_uid: 1, handle: 2, info: add_info }],
            removes: vec![ObjectRemove { object_uid: 1, handle: 3 }],
            events: vec![EventRecord {
                object_uid: 1,
                handle: 4,
                event_uid: 10,
                fields: event_fields,
            }],
        };

        let mut buf = Vec::new();
        encode_packet(&mut buf, &packet).unwrap();
        let mut cur = Cursor::new(&buf[HEADER_LEN..]);
        let decoded = decode_body(&mut cur, PacketType::BusEvent, &bus()).unwrap().unwrap();

        match decoded {
            Packet::BusEvent { uid, adds, removes, events } => {
                assert_eq!(uid, 99);
                assert_eq!(adds.len(), 1);
                assert_eq!(removes.len(), 1);
                assert_eq!(events.len(), 1);
            }
            _ => panic!("wrong variant"),
        }
    }
}
