//! Encode/decode of a whole record (count-prefixed fields), layered on
//! top of [`super::field`].

use std::io::{self, Cursor, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::field::{read_field_header, read_field_value, skip_field_value, write_field};
use crate::descriptor::RecordDescriptor;
use crate::record::Record;

/// Writes a struct body: `u16` field-count, then one field record per
/// set field, in descriptor order.
pub fn encode_record<W: Write>(out: &mut W, record: &Record) -> io::Result<()> {
    out.write_u16::<BigEndian>(record.set_count() as u16)?;
    for (field, value) in record.set_fields() {
        write_field(out, field, value)?;
    }
    Ok(())
}

/// Decodes a struct body into a fresh [`Record`] against `descriptor`.
/// Unknown field uids are consumed and discarded; any
/// field whose bytes cannot be parsed (unknown type byte, truncated
/// stream) is reported so the caller can realign to the struct's
/// declared length and keep decoding subsequent packets.
pub fn decode_record(cur: &mut Cursor<&[u8]>, descriptor: RecordDescriptor) -> io::Result<Record> {
    let mut record = Record::empty(descriptor);
    let count = cur.read_u16::<BigEndian>()?;

    for _ in 0..count {
        let header = read_field_header(cur)?;

        match descriptor.iter().find(|f| f.uid == header.uid) {
            Some(field) if Some(field.ty) == header.ty && field.is_array == header.is_array => {
                let value = read_field_value(cur, field.ty, header.is_array, field.enum_driver)?;
                record.set(field.uid, value);
            }
            _ => {
                // Unknown uid, or a known uid whose wire type no longer
                // matches this endpoint's descriptor (schema drift):
                // consume the value by its declared wire type and move on.
                skip_field_value(cur, header.ty, header.is_array)?;
            }
        }
    }

    Ok(record)
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

    #[test]
    fn empty_struct_round_trips_to_empty() {
        let record = Record::empty(FIELDS);
        let mut buf = Vec::new();
        encode_record(&mut buf, &record).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let decoded = decode_record(&mut cur, FIELDS).unwrap();
        assert_eq!(decoded.set_count(), 0);
    }

    #[test]
    fn full_struct_round_trips_identically() {
        let mut record = Record::empty(FIELDS);
        record.set(1, FieldValue::Str("UP".into()));
        record.set(2, FieldValue::U32(9001));

        let mut buf = Vec::new();
        encode_record(&mut buf, &record).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let decoded = decode_record(&mut cur, FIELDS).unwrap();
        assert_eq!(decoded.get(1), record.get(1));
        assert_eq!(decoded.get(2), record.get(2));
        assert_eq!(decoded.set_count(), record.set_count());
    }

    #[test]
    fn unknown_field_uid_is_skipped_not_fatal() {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(1).unwrap();
        buf.write_u16::<BigEndian>(999).unwrap(); // unknown uid
        buf.write_u8(PrimitiveType::U32.wire_code()).unwrap();
        buf.write_u32::<BigEndian>(123).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let decoded = decode_record(&mut cur, FIELDS).unwrap();
        assert_eq!(decoded.set_count(), 0);
    }
}
