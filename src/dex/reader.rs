//! Decodes a DEX file into symbolic [`ClassDef`] records.
//!
//! Debug info is not carried over; everything else a class definition owns is.
use crate::dex::class::{
    Annotation, CatchHandler, ClassDef, Code, FieldDef, InsnRef, MethodDef, RefSlot, RefTarget, TryBlock,
};
use crate::dex::encoded_values::{read_encoded_array, EncodedAnnotation, SymbolResolver};
use crate::dex::error::{DexError, DexResultExt};
use crate::dex::opcodes::{self, RefKind};
use crate::dex::{read_sleb128, read_u1, read_u2, read_u4, read_uleb128, NO_INDEX};
use crate::types::{AccessFlags, FieldRef, MethodRef, Proto};
use std::collections::HashMap;

pub const HEADER_SIZE: usize = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;

/// Section counts and offsets from the file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub checksum: u32,
    pub file_size: u32,
    pub map_off: u32,
    pub string_ids: (u32, u32),
    pub type_ids: (u32, u32),
    pub proto_ids: (u32, u32),
    pub field_ids: (u32, u32),
    pub method_ids: (u32, u32),
    pub class_defs: (u32, u32),
    pub data: (u32, u32),
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Header, DexError> {
        if bytes.len() < HEADER_SIZE {
            fail!("file of {} bytes is shorter than a DEX header", bytes.len());
        }
        if &bytes[0..4] != b"dex\n" || bytes[7] != 0 {
            fail!("bad DEX magic");
        }
        let version = std::str::from_utf8(&bytes[4..7])
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .ok_or_else(|| dex_err!("bad DEX version"))?;
        if !(35..=41).contains(&version) {
            fail!("unsupported DEX version {:03}", version);
        }

        let mut ix = 8;
        let checksum = read_u4(bytes, &mut ix)?;
        ix += 20;
        let file_size = read_u4(bytes, &mut ix)?;
        let header_size = read_u4(bytes, &mut ix)?;
        let endian = read_u4(bytes, &mut ix)?;
        if header_size as usize != HEADER_SIZE || endian != ENDIAN_CONSTANT {
            fail!("unsupported header size {:#x} or endian tag {:#x}", header_size, endian);
        }
        ix += 8; // link section
        let map_off = read_u4(bytes, &mut ix)?;
        let pair = |ix: &mut usize| -> Result<(u32, u32), DexError> {
            Ok((read_u4(bytes, ix)?, read_u4(bytes, ix)?))
        };
        Ok(Header {
            version,
            checksum,
            file_size,
            map_off,
            string_ids: pair(&mut ix)?,
            type_ids: pair(&mut ix)?,
            proto_ids: pair(&mut ix)?,
            field_ids: pair(&mut ix)?,
            method_ids: pair(&mut ix)?,
            class_defs: pair(&mut ix)?,
            data: pair(&mut ix)?,
        })
    }
}

/// Parse every class definition of a DEX file, in file order.
pub fn read_classes(bytes: &[u8]) -> Result<Vec<ClassDef>, DexError> {
    let reader = DexReader::new(bytes)?;
    let (count, offset) = reader.header.class_defs;
    let mut classes = Vec::with_capacity(table_len(bytes, offset as usize, count, 32)?);
    for i in 0..count as usize {
        let class = reader
            .read_class_def(offset as usize + i * 32)
            .context(|| format!("class_def {}", i))?;
        classes.push(class);
    }
    Ok(classes)
}

struct DexReader<'a> {
    bytes: &'a [u8],
    header: Header,
    strings: Vec<String>,
    types: Vec<String>,
    protos: Vec<Proto>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
}

impl<'a> DexReader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, DexError> {
        let header = Header::parse(bytes)?;
        let mut reader = DexReader {
            bytes,
            header,
            strings: Vec::new(),
            types: Vec::new(),
            protos: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        };

        let (count, off) = reader.header.string_ids;
        let mut ix = off as usize;
        for i in 0..count {
            let data_off = read_u4(bytes, &mut ix)?;
            let s = read_string_data(bytes, data_off as usize).context(|| format!("string {}", i))?;
            reader.strings.push(s);
        }

        let (count, off) = reader.header.type_ids;
        let mut ix = off as usize;
        for _ in 0..count {
            let idx = read_u4(bytes, &mut ix)?;
            let desc = reader.string(idx)?;
            reader.types.push(desc);
        }

        let (count, off) = reader.header.proto_ids;
        let mut ix = off as usize;
        for _ in 0..count {
            let _shorty = read_u4(bytes, &mut ix)?;
            let return_type = reader.type_desc(read_u4(bytes, &mut ix)?)?;
            let params = reader.read_type_list(read_u4(bytes, &mut ix)?)?;
            reader.protos.push(Proto { return_type, params });
        }

        let (count, off) = reader.header.field_ids;
        let mut ix = off as usize;
        for _ in 0..count {
            let class = reader.type_desc(read_u2(bytes, &mut ix)? as u32)?;
            let ty = reader.type_desc(read_u2(bytes, &mut ix)? as u32)?;
            let name = reader.string(read_u4(bytes, &mut ix)?)?;
            reader.fields.push(FieldRef { class, name, ty });
        }

        let (count, off) = reader.header.method_ids;
        let mut ix = off as usize;
        for _ in 0..count {
            let class = reader.type_desc(read_u2(bytes, &mut ix)? as u32)?;
            let proto = reader.proto(read_u2(bytes, &mut ix)? as u32)?;
            let name = reader.string(read_u4(bytes, &mut ix)?)?;
            reader.methods.push(MethodRef { class, name, proto });
        }

        Ok(reader)
    }

    fn read_type_list(&self, offset: u32) -> Result<Vec<String>, DexError> {
        if offset == 0 {
            return Ok(Vec::new());
        }
        let mut ix = offset as usize;
        let size = read_u4(self.bytes, &mut ix)?;
        (0..size)
            .map(|_| self.type_desc(read_u2(self.bytes, &mut ix)? as u32))
            .collect()
    }

    fn read_class_def(&self, offset: usize) -> Result<ClassDef, DexError> {
        let mut ix = offset;
        let b = self.bytes;
        let descriptor = self.type_desc(read_u4(b, &mut ix)?)?;
        let access = AccessFlags::from_bits_retain(read_u4(b, &mut ix)?);
        let superclass_idx = read_u4(b, &mut ix)?;
        let interfaces_off = read_u4(b, &mut ix)?;
        let source_file_idx = read_u4(b, &mut ix)?;
        let annotations_off = read_u4(b, &mut ix)?;
        let class_data_off = read_u4(b, &mut ix)?;
        let static_values_off = read_u4(b, &mut ix)?;

        let mut class = ClassDef::new(&descriptor, access, None);
        if superclass_idx != NO_INDEX {
            class.superclass = Some(self.type_desc(superclass_idx)?);
        }
        class.interfaces = self.read_type_list(interfaces_off)?;
        if source_file_idx != NO_INDEX {
            class.source_file = Some(self.string(source_file_idx)?);
        }

        let mut directory = if annotations_off != 0 {
            self.read_annotations_directory(annotations_off as usize)?
        } else {
            AnnotationsDirectory::default()
        };
        class.annotations = std::mem::take(&mut directory.class);

        if class_data_off != 0 {
            self.read_class_data(class_data_off as usize, &mut class, &directory)
                .context(|| descriptor.clone())?;
        }

        if static_values_off != 0 {
            let mut ix = static_values_off as usize;
            let values = read_encoded_array(b, &mut ix, self)?;
            if values.len() > class.static_fields.len() {
                fail!("{} static values for {} static fields", values.len(), class.static_fields.len());
            }
            for (field, value) in class.static_fields.iter_mut().zip(values) {
                field.initial_value = Some(value);
            }
        }

        Ok(class)
    }

    fn read_class_data(
        &self,
        offset: usize,
        class: &mut ClassDef,
        directory: &AnnotationsDirectory,
    ) -> Result<(), DexError> {
        let b = self.bytes;
        let mut ix = offset;
        let static_fields = read_uleb128(b, &mut ix)?;
        let instance_fields = read_uleb128(b, &mut ix)?;
        let direct_methods = read_uleb128(b, &mut ix)?;
        let virtual_methods = read_uleb128(b, &mut ix)?;

        for (count, target) in [
            (static_fields, &mut class.static_fields),
            (instance_fields, &mut class.instance_fields),
        ] {
            let mut field_idx = 0u32;
            for _ in 0..count {
                field_idx += read_uleb128(b, &mut ix)?;
                let access = AccessFlags::from_bits_retain(read_uleb128(b, &mut ix)?);
                let mut field = FieldDef::new(self.field(field_idx)?, access);
                if let Some(a) = directory.fields.get(&field_idx) {
                    field.annotations = a.clone();
                }
                target.push(field);
            }
        }

        for (count, target) in [
            (direct_methods, &mut class.direct_methods),
            (virtual_methods, &mut class.virtual_methods),
        ] {
            let mut method_idx = 0u32;
            for _ in 0..count {
                method_idx += read_uleb128(b, &mut ix)?;
                let access = AccessFlags::from_bits_retain(read_uleb128(b, &mut ix)?);
                let code_off = read_uleb128(b, &mut ix)?;
                let method_ref = self.method(method_idx)?;
                let code = if code_off != 0 {
                    Some(
                        self.read_code(code_off as usize)
                            .context(|| format!("code of {}", method_ref))?,
                    )
                } else {
                    None
                };
                let mut method = MethodDef::new(method_ref, access, code);
                if let Some(a) = directory.methods.get(&method_idx) {
                    method.annotations = a.clone();
                }
                if let Some(p) = directory.parameters.get(&method_idx) {
                    method.parameter_annotations = p.clone();
                }
                target.push(method);
            }
        }
        Ok(())
    }

    fn read_code(&self, offset: usize) -> Result<Code, DexError> {
        let b = self.bytes;
        let mut ix = offset;
        let registers = read_u2(b, &mut ix)?;
        let ins = read_u2(b, &mut ix)?;
        let outs = read_u2(b, &mut ix)?;
        let tries_size = read_u2(b, &mut ix)?;
        let _debug_info_off = read_u4(b, &mut ix)?;
        let insns_size = read_u4(b, &mut ix)?;
        let insns_size = table_len(b, ix, insns_size, 2)?;
        let mut insns = Vec::with_capacity(insns_size);
        for _ in 0..insns_size {
            insns.push(read_u2(b, &mut ix)?);
        }

        let refs = self.relocate(&mut insns)?;

        let mut tries = Vec::new();
        if tries_size > 0 {
            if insns_size % 2 == 1 {
                ix += 2;
            }
            let handlers_base = ix + tries_size as usize * 8;
            for _ in 0..tries_size {
                let start = read_u4(b, &mut ix)?;
                let count = read_u2(b, &mut ix)?;
                let handler_off = read_u2(b, &mut ix)?;
                let mut hx = handlers_base + handler_off as usize;
                let size = read_sleb128(b, &mut hx)?;
                let mut handlers = Vec::new();
                for _ in 0..size.unsigned_abs() {
                    let exception = self.type_desc(read_uleb128(b, &mut hx)?)?;
                    let address = read_uleb128(b, &mut hx)?;
                    handlers.push(CatchHandler { exception, address });
                }
                let catch_all = if size <= 0 { Some(read_uleb128(b, &mut hx)?) } else { None };
                tries.push(TryBlock {
                    start,
                    count,
                    handlers,
                    catch_all,
                });
            }
        }

        Ok(Code {
            registers,
            ins,
            outs,
            insns,
            refs,
            tries,
        })
    }

    /// Resolve every index operand to its symbol and zero the operand.
    fn relocate(&self, insns: &mut [u16]) -> Result<Vec<InsnRef>, DexError> {
        let mut refs = Vec::new();
        let mut pos = 0;
        while pos < insns.len() {
            let width = opcodes::insn_units(insns, pos)?;
            let unit = insns[pos];
            let op = opcodes::opcode((unit & 0xff) as u8);
            let is_payload = op.value == opcodes::OP_NOP && unit != 0;
            if !is_payload && op.refs != RefKind::None {
                let slot = if op.format == opcodes::Format::F31c { RefSlot::Unit1Wide } else { RefSlot::Unit1 };
                let idx = match slot {
                    RefSlot::Unit1Wide => insns[pos + 1] as u32 | (insns[pos + 2] as u32) << 16,
                    _ => insns[pos + 1] as u32,
                };
                let target = match op.refs {
                    RefKind::String => RefTarget::String(self.string(idx)?),
                    RefKind::Type => RefTarget::Type(self.type_desc(idx)?),
                    RefKind::Field => RefTarget::Field(self.field(idx)?),
                    RefKind::Method | RefKind::MethodAndProto => RefTarget::Method(self.method(idx)?),
                    RefKind::Proto => RefTarget::Proto(self.proto(idx)?),
                    RefKind::CallSite | RefKind::MethodHandle | RefKind::None => {
                        fail!("{} at {} is not supported", op.name, pos)
                    }
                };
                refs.push(InsnRef {
                    position: pos as u32,
                    slot,
                    target,
                });
                insns[pos + 1] = 0;
                if slot == RefSlot::Unit1Wide {
                    insns[pos + 2] = 0;
                }
                if op.refs == RefKind::MethodAndProto {
                    let proto = self.proto(insns[pos + 3] as u32)?;
                    refs.push(InsnRef {
                        position: pos as u32,
                        slot: RefSlot::Unit3,
                        target: RefTarget::Proto(proto),
                    });
                    insns[pos + 3] = 0;
                }
            }
            pos += width;
        }
        if pos != insns.len() {
            fail!("last instruction overruns code by {} units", pos - insns.len());
        }
        Ok(refs)
    }

    fn read_annotations_directory(&self, offset: usize) -> Result<AnnotationsDirectory, DexError> {
        let b = self.bytes;
        let mut ix = offset;
        let class_off = read_u4(b, &mut ix)?;
        let fields_size = read_u4(b, &mut ix)?;
        let methods_size = read_u4(b, &mut ix)?;
        let params_size = read_u4(b, &mut ix)?;

        let mut dir = AnnotationsDirectory {
            class: self.read_annotation_set(class_off)?,
            ..Default::default()
        };
        for _ in 0..fields_size {
            let idx = read_u4(b, &mut ix)?;
            let off = read_u4(b, &mut ix)?;
            dir.fields.insert(idx, self.read_annotation_set(off)?);
        }
        for _ in 0..methods_size {
            let idx = read_u4(b, &mut ix)?;
            let off = read_u4(b, &mut ix)?;
            dir.methods.insert(idx, self.read_annotation_set(off)?);
        }
        for _ in 0..params_size {
            let idx = read_u4(b, &mut ix)?;
            let mut rx = read_u4(b, &mut ix)? as usize;
            let size = read_u4(b, &mut rx)?;
            let mut params = Vec::with_capacity(table_len(b, rx, size, 4)?);
            for _ in 0..size {
                params.push(self.read_annotation_set(read_u4(b, &mut rx)?)?);
            }
            dir.parameters.insert(idx, params);
        }
        Ok(dir)
    }

    fn read_annotation_set(&self, offset: u32) -> Result<Vec<Annotation>, DexError> {
        if offset == 0 {
            return Ok(Vec::new());
        }
        let b = self.bytes;
        let mut ix = offset as usize;
        let size = read_u4(b, &mut ix)?;
        let mut set = Vec::with_capacity(table_len(b, ix, size, 4)?);
        for _ in 0..size {
            let mut ax = read_u4(b, &mut ix)? as usize;
            let visibility = read_u1(b, &mut ax)?;
            let annotation = EncodedAnnotation::read(b, &mut ax, self)?;
            set.push(Annotation { visibility, annotation });
        }
        Ok(set)
    }
}

#[derive(Default)]
struct AnnotationsDirectory {
    class: Vec<Annotation>,
    fields: HashMap<u32, Vec<Annotation>>,
    methods: HashMap<u32, Vec<Annotation>>,
    parameters: HashMap<u32, Vec<Vec<Annotation>>>,
}

/// Entry count of a table of `count` items of `item_size` bytes at `offset`, once it is known to fit.
fn table_len(bytes: &[u8], offset: usize, count: u32, item_size: usize) -> Result<usize, DexError> {
    let end = (count as usize)
        .checked_mul(item_size)
        .and_then(|len| len.checked_add(offset));
    match end {
        Some(end) if end <= bytes.len() => Ok(count as usize),
        _ => fail!(
            "table of {} entries at {:#x} runs past the end of the file ({} bytes)",
            count,
            offset,
            bytes.len()
        ),
    }
}

fn read_string_data(bytes: &[u8], offset: usize) -> Result<String, DexError> {
    let mut ix = offset;
    let _utf16_len = read_uleb128(bytes, &mut ix)?;
    let tail = bytes.get(ix..).unwrap_or_default();
    let Some(end) = tail.iter().position(|&c| c == 0) else {
        fail!("unterminated string data at {:#x}", offset);
    };
    match cesu8::from_java_cesu8(&tail[..end]) {
        Ok(s) => Ok(s.into_owned()),
        Err(_) => fail!("invalid MUTF-8 string data at {:#x}", offset),
    }
}

fn lookup<'t, T>(table: &'t [T], idx: u32, what: &str) -> Result<&'t T, DexError> {
    table
        .get(idx as usize)
        .ok_or_else(|| dex_err!("{} index {} out of range ({} entries)", what, idx, table.len()))
}

impl SymbolResolver for DexReader<'_> {
    fn string(&self, idx: u32) -> Result<String, DexError> {
        lookup(&self.strings, idx, "string").cloned()
    }

    fn type_desc(&self, idx: u32) -> Result<String, DexError> {
        lookup(&self.types, idx, "type").cloned()
    }

    fn proto(&self, idx: u32) -> Result<Proto, DexError> {
        lookup(&self.protos, idx, "proto").cloned()
    }

    fn field(&self, idx: u32) -> Result<FieldRef, DexError> {
        lookup(&self.fields, idx, "field").cloned()
    }

    fn method(&self, idx: u32) -> Result<MethodRef, DexError> {
        lookup(&self.methods, idx, "method").cloned()
    }
}
