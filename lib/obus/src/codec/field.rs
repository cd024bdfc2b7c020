//! Encode/decode of one typed field against a [`FieldDescriptor`].
//!
//! Grounded in `neutronium::net::frame`'s per-category read/write split,
//! generalized from four hardcoded control-frame shapes to the full set
//! of primitive types the wire format names.

use std::io::{self, Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::descriptor::{EnumDriver, FieldDescriptor, PrimitiveType};
use crate::record::FieldValue;

const ARRAY_FLAG: u8 = 0x80;
const TYPE_MASK: u8 = 0x7f;

/// Combines a primitive type and the array flag into the wire type byte.
pub fn type_byte(ty: PrimitiveType, is_array: bool) -> u8 {
    ty.wire_code() | if is_array { ARRAY_FLAG } else { 0 }
}

pub fn split_type_byte(byte: u8) -> (Option<PrimitiveType>, bool) {
    (PrimitiveType::from_wire_code(byte & TYPE_MASK), byte & ARRAY_FLAG != 0)
}

/// Writes a length-prefixed string: a `u32` byte length *including* the
/// trailing NUL, followed by the bytes and the NUL. Zero length encodes
/// a null string.
pub fn write_string<W: Write>(out: &mut W, value: Option<&str>) -> io::Result<()> {
    match value {
        None => out.write_u32::<BigEndian>(0),
        Some(s) => {
            out.write_u32::<BigEndian>(s.len() as u32 + 1)?;
            out.write_all(s.as_bytes())?;
            out.write_u8(0)
        }
    }
}

pub fn read_string(cur: &mut Cursor<&[u8]>) -> io::Result<Option<String>> {
    let len = cur.read_u32::<BigEndian>()? as usize;
    if len == 0 {
        return Ok(None);
    }
    let mut bytes = vec![0u8; len - 1];
    cur.read_exact(&mut bytes)?;
    let mut nul = [0u8; 1];
    cur.read_exact(&mut nul)?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "field string is not valid utf-8"))
}

/// Writes one scalar value's raw bytes (no uid/type-byte header).
pub fn write_scalar<W: Write>(out: &mut W, value: &FieldValue, enum_driver: Option<&EnumDriver>) -> io::Result<()> {
    match value {
        FieldValue::U8(v) => out.write_u8(*v),
        FieldValue::I8(v) => out.write_i8(*v),
        FieldValue::U16(v) => out.write_u16::<BigEndian>(*v),
        FieldValue::I16(v) => out.write_i16::<BigEndian>(*v),
        FieldValue::U32(v) => out.write_u32::<BigEndian>(*v),
        FieldValue::I32(v) => out.write_i32::<BigEndian>(*v),
        FieldValue::U64(v) => out.write_u64::<BigEndian>(*v),
        FieldValue::I64(v) => out.write_i64::<BigEndian>(*v),
        FieldValue::F32(v) => out.write_u32::<BigEndian>(v.to_bits()),
        FieldValue::F64(v) => out.write_u64::<BigEndian>(v.to_bits()),
        FieldValue::Bool(v) => out.write_u8(if *v { 1 } else { 0 }),
        FieldValue::Str(s) => write_string(out, Some(s)),
        FieldValue::Enum(v) => write_enum(out, *v, enum_driver),
        FieldValue::Array(_) => Err(io::Error::new(io::ErrorKind::InvalidInput, "nested arrays are not supported")),
    }
}

fn write_enum<W: Write>(out: &mut W, value: i64, driver: Option<&EnumDriver>) -> io::Result<()> {
    let size = driver.map(|d| d.size).unwrap_or(4);
    match size {
        1 => out.write_i8(value as i8),
        2 => out.write_i16::<BigEndian>(value as i16),
        8 => out.write_i64::<BigEndian>(value),
        _ => out.write_i32::<BigEndian>(value as i32),
    }
}

fn read_enum(cur: &mut Cursor<&[u8]>, driver: Option<&EnumDriver>) -> io::Result<i64> {
    let size = driver.map(|d| d.size).unwrap_or(4);
    Ok(match size {
        1 => cur.read_i8()? as i64,
        2 => cur.read_i16::<BigEndian>()? as i64,
        8 => cur.read_i64::<BigEndian>()?,
        _ => cur.read_i32::<BigEndian>()? as i64,
    })
}

pub fn read_scalar(cur: &mut Cursor<&[u8]>, ty: PrimitiveType, enum_driver: Option<&EnumDriver>) -> io::Result<FieldValue> {
    Ok(match ty {
        PrimitiveType::U8 => FieldValue::U8(cur.read_u8()?),
        PrimitiveType::I8 => FieldValue::I8(cur.read_i8()?),
        PrimitiveType::U16 => FieldValue::U16(cur.read_u16::<BigEndian>()?),
        PrimitiveType::I16 => FieldValue::I16(cur.read_i16::<BigEndian>()?),
        PrimitiveType::U32 => FieldValue::U32(cur.read_u32::<BigEndian>()?),
        PrimitiveType::I32 => FieldValue::I32(cur.read_i32::<BigEndian>()?),
        PrimitiveType::U64 => FieldValue::U64(cur.read_u64::<BigEndian>()?),
        PrimitiveType::I64 => FieldValue::I64(cur.read_i64::<BigEndian>()?),
        PrimitiveType::F32 => FieldValue::F32(f32::from_bits(cur.read_u32::<BigEndian>()?)),
        PrimitiveType::F64 => FieldValue::F64(f64::from_bits(cur.read_u64::<BigEndian>()?)),
        PrimitiveType::Bool => FieldValue::Bool(cur.read_u8()? != 0),
        PrimitiveType::String => FieldValue::Str(read_string(cur)?.unwrap_or_default()),
        PrimitiveType::Enum => FieldValue::Enum(read_enum(cur, enum_driver)?),
    })
}

fn scalar_width(ty: PrimitiveType, enum_driver: Option<&EnumDriver>) -> Option<usize> {
    Some(match ty {
        PrimitiveType::U8 | PrimitiveType::I8 | PrimitiveType::Bool => 1,
        PrimitiveType::U16 | PrimitiveType::I16 => 2,
        PrimitiveType::U32 | PrimitiveType::I32 | PrimitiveType::F32 => 4,
        PrimitiveType::U64 | PrimitiveType::I64 | PrimitiveType::F64 => 8,
        PrimitiveType::Enum => enum_driver.map(|d| d.size as usize).unwrap_or(4),
        PrimitiveType::String => return None,
    })
}

/// Writes a field record: uid, type byte, then value or count+values
///
pub fn write_field<W: Write>(out: &mut W, field: &FieldDescriptor, value: &FieldValue) -> io::Result<()> {
    out.write_u16::<BigEndian>(field.uid)?;

    match value {
        FieldValue::Array(items) => {
            out.write_u8(type_byte(field.ty, true))?;
            out.write_u32::<BigEndian>(items.len() as u32)?;
            for item in items {
                write_scalar(out, item, field.enum_driver)?;
            }
            Ok(())
        }
        scalar => {
            out.write_u8(type_byte(field.ty, false))?;
            write_scalar(out, scalar, field.enum_driver)
        }
    }
}

/// Decodes one field record's uid/type-byte header. The caller resolves
/// the uid against the current descriptor (it may be unknown — the
/// value still has to be consumed to keep the stream aligned).
pub struct FieldHeader {
    pub uid: u16,
    pub ty: Option<PrimitiveType>,
    pub is_array: bool,
}

pub fn read_field_header(cur: &mut Cursor<&[u8]>) -> io::Result<FieldHeader> {
    let uid = cur.read_u16::<BigEndian>()?;
    let (ty, is_array) = split_type_byte(cur.read_u8()?);
    Ok(FieldHeader { uid, ty, is_array })
}

/// Decodes a scalar or array value following a [`FieldHeader`] whose
/// type is known to this endpoint's descriptor.
pub fn read_field_value(cur: &mut Cursor<&[u8]>, ty: PrimitiveType, is_array: bool, enum_driver: Option<&EnumDriver>) -> io::Result<FieldValue> {
    if is_array {
        let count = cur.read_u32::<BigEndian>()? as usize;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(read_scalar(cur, ty, enum_driver)?);
        }
        Ok(FieldValue::Array(items))
    } else {
        read_scalar(cur, ty, enum_driver)
    }
}

/// Consumes (without interpreting) a field value whose type byte names
/// an unknown primitive, or whose uid this descriptor doesn't carry.
/// Strings and arrays are self-delimiting; fixed-width scalars use
/// [`scalar_width`]. Returns an error only if the stream runs out.
pub fn skip_field_value(cur: &mut Cursor<&[u8]>, ty: Option<PrimitiveType>, is_array: bool) -> io::Result<()> {
    let ty = match ty {
        Some(ty) => ty,
        None => return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown field type")),
    };

    if is_array {
        let count = cur.read_u32::<BigEndian>()? as usize;
        match ty {
            PrimitiveType::String => {
                for _ in 0..count {
                    read_string(cur)?;
                }
            }
            other => {
                let width = scalar_width(other, None).unwrap_or(4);
                let mut discard = vec![0u8; width * count];
                cur.read_exact(&mut discard)?;
            }
        }
        return Ok(());
    }

    match ty {
        PrimitiveType::String => {
            read_string(cur)?;
        }
        other => {
            let width = scalar_width(other, None).unwrap_or(4);
            let mut discard = vec![0u8; width];
            cur.read_exact(&mut discard)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldRole;

    fn field(uid: u16, ty: PrimitiveType) -> FieldDescriptor {
        FieldDescriptor {
            uid,
            name: "f",
            role: FieldRole::Property,
            ty,
            is_array: false,
            enum_driver: None,
        }
    }

    #[test]
    fn scalar_roundtrip() {
        let f = field(1, PrimitiveType::U32);
        let mut buf = Vec::new();
        write_field(&mut buf, &f, &FieldValue::U32(42)).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let header = read_field_header(&mut cur).unwrap();
        assert_eq!(header.uid, 1);
        assert!(!header.is_array);
        let value = read_field_value(&mut cur, header.ty.unwrap(), header.is_array, None).unwrap();
        assert_eq!(value, FieldValue::U32(42));
    }

    #[test]
    fn string_roundtrip_including_null() {
        let f = field(2, PrimitiveType::String);
        let mut buf = Vec::new();
        write_field(&mut buf, &f, &FieldValue::Str("UP".into())).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let header = read_field_header(&mut cur).unwrap();
        let value = read_field_value(&mut cur, header.ty.unwrap(), header.is_array, None).unwrap();
        assert_eq!(value, FieldValue::Str("UP".into()));
    }

    #[test]
    fn array_roundtrip() {
        let f = field(3, PrimitiveType::U8);
        let mut buf = Vec::new();
        let arr = FieldValue::Array(vec![FieldValue::U8(1), FieldValue::U8(2), FieldValue::U8(3)]);
        write_field(&mut buf, &f, &arr).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let header = read_field_header(&mut cur).unwrap();
        assert!(header.is_array);
        let value = read_field_value(&mut cur, header.ty.unwrap(), header.is_array, None).unwrap();
        assert_eq!(value, arr);
    }

    #[test]
    fn unknown_type_byte_is_reported() {
        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(9).unwrap();
        buf.write_u8(0x7f).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let header = read_field_header(&mut cur).unwrap();
        assert!(header.ty.is_none());
    }

    #[test]
    fn skip_unknown_scalar_field_realigns_stream() {
        let f = field(4, PrimitiveType::U32);
        let mut buf = Vec::new();
        write_field(&mut buf, &f, &FieldValue::U32(7)).unwrap();
        buf.write_u16::<BigEndian>(99).unwrap();

        let mut cur = Cursor::new(&buf[..]);
        let header = read_field_header(&mut cur).unwrap();
        skip_field_value(&mut cur, header.ty, header.is_array).unwrap();

        let next = cur.read_u16::<BigEndian>().unwrap();
        assert_eq!(next, 99);
    }
}
