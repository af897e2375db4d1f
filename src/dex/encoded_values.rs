use crate::dex::class::RefSink;
use crate::dex::error::DexError;
use crate::dex::{read_u1, read_uleb128, read_x, write_u1, write_uleb128, write_x};
use crate::types::{FieldRef, MethodRef, Proto};

const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_METHOD_TYPE: u8 = 0x15;
const VALUE_METHOD_HANDLE: u8 = 0x16;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_FIELD: u8 = 0x19;
const VALUE_METHOD: u8 = 0x1a;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_ANNOTATION: u8 = 0x1d;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

/// Turns pool indices of the container being read into symbols.
pub(crate) trait SymbolResolver {
    fn string(&self, idx: u32) -> Result<String, DexError>;
    fn type_desc(&self, idx: u32) -> Result<String, DexError>;
    fn proto(&self, idx: u32) -> Result<Proto, DexError>;
    fn field(&self, idx: u32) -> Result<FieldRef, DexError>;
    fn method(&self, idx: u32) -> Result<MethodRef, DexError>;
}

/// Turns symbols into pool indices of the container being written.
pub(crate) trait IndexResolver {
    fn string_index(&self, value: &str) -> Result<u32, DexError>;
    fn type_index(&self, descriptor: &str) -> Result<u32, DexError>;
    fn proto_index(&self, proto: &Proto) -> Result<u32, DexError>;
    fn field_index(&self, field: &FieldRef) -> Result<u32, DexError>;
    fn method_index(&self, method: &MethodRef) -> Result<u32, DexError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotationElement {
    pub name: String,
    pub value: EncodedValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedAnnotation {
    pub type_desc: String,
    pub elements: Vec<AnnotationElement>,
}

impl EncodedAnnotation {
    pub(crate) fn read(bytes: &[u8], ix: &mut usize, pools: &impl SymbolResolver) -> Result<Self, DexError> {
        let type_desc = pools.type_desc(read_uleb128(bytes, ix)?)?;
        let size = read_uleb128(bytes, ix)? as usize;
        let mut elements = Vec::with_capacity(size.min(256));
        for _ in 0..size {
            let name = pools.string(read_uleb128(bytes, ix)?)?;
            let value = EncodedValue::read(bytes, ix, pools)?;
            elements.push(AnnotationElement { name, value });
        }
        Ok(EncodedAnnotation { type_desc, elements })
    }

    /// Elements are emitted in name-index order, as the format requires.
    pub(crate) fn write(&self, bytes: &mut Vec<u8>, pools: &impl IndexResolver) -> Result<usize, DexError> {
        let mut c = write_uleb128(bytes, pools.type_index(&self.type_desc)?);
        c += write_uleb128(bytes, self.elements.len() as u32);

        let mut indexed = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            indexed.push((pools.string_index(&element.name)?, &element.value));
        }
        indexed.sort_by_key(|(idx, _)| *idx);
        for (name_idx, value) in indexed {
            c += write_uleb128(bytes, name_idx);
            c += value.write(bytes, pools)?;
        }
        Ok(c)
    }

    pub(crate) fn visit_refs(&self, sink: &mut impl RefSink) {
        sink.type_desc(&self.type_desc);
        for element in &self.elements {
            sink.string(&element.name);
            element.value.visit_refs(sink);
        }
    }
}

/// A constant as stored in static initializers and annotations.
///
/// Floating point values keep their raw IEEE-754 bits so values compare and hash exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EncodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    MethodType(Proto),
    String(String),
    Type(String),
    Field(FieldRef),
    Method(MethodRef),
    Enum(FieldRef),
    Array(Vec<EncodedValue>),
    Annotation(EncodedAnnotation),
    Null,
    Boolean(bool),
}

impl EncodedValue {
    /// The implicit value of a static field of type `descriptor` with no initializer.
    pub fn default_for(descriptor: &str) -> EncodedValue {
        match descriptor {
            "Z" => EncodedValue::Boolean(false),
            "B" => EncodedValue::Byte(0),
            "S" => EncodedValue::Short(0),
            "C" => EncodedValue::Char(0),
            "I" => EncodedValue::Int(0),
            "J" => EncodedValue::Long(0),
            "F" => EncodedValue::Float(0),
            "D" => EncodedValue::Double(0),
            _ => EncodedValue::Null,
        }
    }

    pub(crate) fn read(bytes: &[u8], ix: &mut usize, pools: &impl SymbolResolver) -> Result<Self, DexError> {
        let header = read_u1(bytes, ix)?;
        let value_arg = header >> 5;
        let value_type = header & 0x1f;
        let size = value_arg as usize + 1;

        let value = match value_type {
            VALUE_BYTE => EncodedValue::Byte(read_u1(bytes, ix)? as i8),
            VALUE_SHORT => EncodedValue::Short(read_signed(bytes, ix, size, 2)? as i16),
            VALUE_CHAR => EncodedValue::Char(read_unsigned(bytes, ix, size, 2)? as u16),
            VALUE_INT => EncodedValue::Int(read_signed(bytes, ix, size, 4)? as i32),
            VALUE_LONG => EncodedValue::Long(read_signed(bytes, ix, size, 8)?),
            VALUE_FLOAT => EncodedValue::Float(read_right_extended(bytes, ix, size, 4)? as u32),
            VALUE_DOUBLE => EncodedValue::Double(read_right_extended(bytes, ix, size, 8)?),
            VALUE_METHOD_TYPE => EncodedValue::MethodType(pools.proto(read_index(bytes, ix, size)?)?),
            VALUE_METHOD_HANDLE => fail!("method handle constants are not supported"),
            VALUE_STRING => EncodedValue::String(pools.string(read_index(bytes, ix, size)?)?),
            VALUE_TYPE => EncodedValue::Type(pools.type_desc(read_index(bytes, ix, size)?)?),
            VALUE_FIELD => EncodedValue::Field(pools.field(read_index(bytes, ix, size)?)?),
            VALUE_METHOD => EncodedValue::Method(pools.method(read_index(bytes, ix, size)?)?),
            VALUE_ENUM => EncodedValue::Enum(pools.field(read_index(bytes, ix, size)?)?),
            VALUE_ARRAY => EncodedValue::Array(read_encoded_array(bytes, ix, pools)?),
            VALUE_ANNOTATION => EncodedValue::Annotation(EncodedAnnotation::read(bytes, ix, pools)?),
            VALUE_NULL => EncodedValue::Null,
            VALUE_BOOLEAN => EncodedValue::Boolean(value_arg != 0),
            other => fail!("unknown encoded value type {:#04x}", other),
        };
        Ok(value)
    }

    pub(crate) fn write(&self, bytes: &mut Vec<u8>, pools: &impl IndexResolver) -> Result<usize, DexError> {
        let c = match self {
            EncodedValue::Byte(v) => write_u1(bytes, VALUE_BYTE) + write_u1(bytes, *v as u8),
            EncodedValue::Short(v) => write_signed(bytes, VALUE_SHORT, *v as i64, 2),
            EncodedValue::Char(v) => write_unsigned(bytes, VALUE_CHAR, *v as u64),
            EncodedValue::Int(v) => write_signed(bytes, VALUE_INT, *v as i64, 4),
            EncodedValue::Long(v) => write_signed(bytes, VALUE_LONG, *v, 8),
            EncodedValue::Float(bits) => write_right_extended(bytes, VALUE_FLOAT, *bits as u64, 4),
            EncodedValue::Double(bits) => write_right_extended(bytes, VALUE_DOUBLE, *bits, 8),
            EncodedValue::MethodType(p) => write_unsigned(bytes, VALUE_METHOD_TYPE, pools.proto_index(p)? as u64),
            EncodedValue::String(s) => write_unsigned(bytes, VALUE_STRING, pools.string_index(s)? as u64),
            EncodedValue::Type(t) => write_unsigned(bytes, VALUE_TYPE, pools.type_index(t)? as u64),
            EncodedValue::Field(f) => write_unsigned(bytes, VALUE_FIELD, pools.field_index(f)? as u64),
            EncodedValue::Method(m) => write_unsigned(bytes, VALUE_METHOD, pools.method_index(m)? as u64),
            EncodedValue::Enum(f) => write_unsigned(bytes, VALUE_ENUM, pools.field_index(f)? as u64),
            EncodedValue::Array(values) => write_u1(bytes, VALUE_ARRAY) + write_encoded_array(values, bytes, pools)?,
            EncodedValue::Annotation(a) => write_u1(bytes, VALUE_ANNOTATION) + a.write(bytes, pools)?,
            EncodedValue::Null => write_u1(bytes, VALUE_NULL),
            EncodedValue::Boolean(b) => write_u1(bytes, VALUE_BOOLEAN | (*b as u8) << 5),
        };
        Ok(c)
    }

    pub(crate) fn visit_refs(&self, sink: &mut impl RefSink) {
        match self {
            EncodedValue::MethodType(p) => sink.proto(p),
            EncodedValue::String(s) => sink.string(s),
            EncodedValue::Type(t) => sink.type_desc(t),
            EncodedValue::Field(f) | EncodedValue::Enum(f) => sink.field(f),
            EncodedValue::Method(m) => sink.method(m),
            EncodedValue::Array(values) => values.iter().for_each(|v| v.visit_refs(sink)),
            EncodedValue::Annotation(a) => a.visit_refs(sink),
            _ => {}
        }
    }
}

fn read_unsigned(bytes: &[u8], ix: &mut usize, size: usize, max: usize) -> Result<u64, DexError> {
    if size > max {
        fail!("encoded value of {} bytes exceeds {} byte type", size, max);
    }
    let raw = read_x(bytes, ix, size)?;
    Ok(raw.iter().rev().fold(0u64, |acc, &b| acc << 8 | b as u64))
}

fn read_signed(bytes: &[u8], ix: &mut usize, size: usize, max: usize) -> Result<i64, DexError> {
    let raw = read_unsigned(bytes, ix, size, max)?;
    let shift = 64 - 8 * size as u32;
    Ok(((raw << shift) as i64) >> shift)
}

fn read_right_extended(bytes: &[u8], ix: &mut usize, size: usize, max: usize) -> Result<u64, DexError> {
    let raw = read_unsigned(bytes, ix, size, max)?;
    Ok(raw << (8 * (max - size)))
}

fn read_index(bytes: &[u8], ix: &mut usize, size: usize) -> Result<u32, DexError> {
    read_unsigned(bytes, ix, size, 4).map(|v| v as u32)
}

fn write_header(bytes: &mut Vec<u8>, value_type: u8, size: usize) -> usize {
    write_u1(bytes, ((size as u8 - 1) << 5) | value_type)
}

fn write_signed(bytes: &mut Vec<u8>, value_type: u8, value: i64, max: usize) -> usize {
    let size = (1..max)
        .find(|&n| {
            let shift = 64 - 8 * n as u32;
            (value << shift) >> shift == value
        })
        .unwrap_or(max);
    write_header(bytes, value_type, size) + write_x(bytes, &value.to_le_bytes()[..size])
}

fn write_unsigned(bytes: &mut Vec<u8>, value_type: u8, value: u64) -> usize {
    let size = ((64 - value.leading_zeros() as usize + 7) / 8).max(1);
    write_header(bytes, value_type, size) + write_x(bytes, &value.to_le_bytes()[..size])
}

fn write_right_extended(bytes: &mut Vec<u8>, value_type: u8, value: u64, max: usize) -> usize {
    let significant = max - (value.trailing_zeros() as usize / 8).min(max - 1);
    let le = value.to_le_bytes();
    write_header(bytes, value_type, significant) + write_x(bytes, &le[max - significant..max])
}

pub(crate) fn read_encoded_array(
    bytes: &[u8],
    ix: &mut usize,
    pools: &impl SymbolResolver,
) -> Result<Vec<EncodedValue>, DexError> {
    let size = read_uleb128(bytes, ix)? as usize;
    let mut values = Vec::with_capacity(size.min(1024));
    for _ in 0..size {
        values.push(EncodedValue::read(bytes, ix, pools)?);
    }
    Ok(values)
}

pub(crate) fn write_encoded_array(
    values: &[EncodedValue],
    bytes: &mut Vec<u8>,
    pools: &impl IndexResolver,
) -> Result<usize, DexError> {
    let mut c = write_uleb128(bytes, values.len() as u32);
    for value in values {
        c += value.write(bytes, pools)?;
    }
    Ok(c)
}
