//! Lays out a set of symbolic classes as a DEX file.
//!
//! Pools are sorted the way the verifier expects and every data item is written before the
//! items that point at it, so offsets are always known when they are needed.
use crate::dex::class::{Annotation, ClassDef, Code, FieldDef, MethodDef, RefSink, RefSlot, RefTarget};
use crate::dex::container::RefPools;
use crate::dex::encoded_values::{EncodedValue, IndexResolver};
use crate::dex::error::{DexError, DexResultExt};
use crate::dex::reader::{ENDIAN_CONSTANT, HEADER_SIZE};
use crate::dex::{pad_to, write_sleb128, write_u1, write_u2, write_u4, write_uleb128, write_x, NO_INDEX};
use crate::types::{FieldRef, MethodRef, Proto};
use adler::adler32_slice;
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::collections::HashMap;

const TYPE_HEADER_ITEM: u16 = 0x0000;
const TYPE_STRING_ID_ITEM: u16 = 0x0001;
const TYPE_TYPE_ID_ITEM: u16 = 0x0002;
const TYPE_PROTO_ID_ITEM: u16 = 0x0003;
const TYPE_FIELD_ID_ITEM: u16 = 0x0004;
const TYPE_METHOD_ID_ITEM: u16 = 0x0005;
const TYPE_CLASS_DEF_ITEM: u16 = 0x0006;
const TYPE_MAP_LIST: u16 = 0x1000;
const TYPE_TYPE_LIST: u16 = 0x1001;
const TYPE_ANNOTATION_SET_REF_LIST: u16 = 0x1002;
const TYPE_ANNOTATION_SET_ITEM: u16 = 0x1003;
const TYPE_CLASS_DATA_ITEM: u16 = 0x2000;
const TYPE_CODE_ITEM: u16 = 0x2001;
const TYPE_STRING_DATA_ITEM: u16 = 0x2002;
const TYPE_ANNOTATION_ITEM: u16 = 0x2004;
const TYPE_ENCODED_ARRAY_ITEM: u16 = 0x2005;
const TYPE_ANNOTATIONS_DIRECTORY_ITEM: u16 = 0x2006;

/// Serialize `classes` into a complete DEX file with checksum and signature.
pub fn write_dex(classes: &[ClassDef]) -> Result<Vec<u8>, DexError> {
    let mut pools = RefPools::default();
    let mut uses_protos = ProtoUse(false);
    for class in classes {
        class.visit_refs(&mut pools);
        class.visit_refs(&mut uses_protos);
    }
    let index = IndexTables::build(&pools)?;
    let order = definition_order(classes)?;
    let ordered: Vec<&ClassDef> = order.iter().map(|&i| &classes[i]).collect();

    let ids = IdLayout::new(&index, ordered.len());
    let mut data = DataSection::new(ids.data_off);
    let layout = data.write_all(&index, &ordered)?;

    let map_off = data.write_map(&ids);
    let data_size = data.bytes.len() as u32;

    let mut file = Vec::with_capacity(ids.data_off as usize + data.bytes.len());
    file.resize(HEADER_SIZE, 0);
    for s in &index.strings {
        write_u4(&mut file, layout.string_data[s]);
    }
    for t in &index.types {
        write_u4(&mut file, index.string_index(t)?);
    }
    for p in &index.protos {
        write_u4(&mut file, index.string_index(&p.shorty())?);
        write_u4(&mut file, index.type_index(&p.return_type)?);
        let params = index.type_list(&p.params)?;
        write_u4(&mut file, layout.type_list_offset(&params));
    }
    for f in &index.fields {
        write_u2(&mut file, index.narrow_type_index(&f.class)?);
        write_u2(&mut file, index.narrow_type_index(&f.ty)?);
        write_u4(&mut file, index.string_index(&f.name)?);
    }
    for m in &index.methods {
        write_u2(&mut file, index.narrow_type_index(&m.class)?);
        let proto = index.proto_index(&m.proto)?;
        if proto > 0xffff {
            fail!("proto index {} of {} exceeds 16 bits", proto, m);
        }
        write_u2(&mut file, proto as u16);
        write_u4(&mut file, index.string_index(&m.name)?);
    }
    for (i, class) in ordered.iter().enumerate() {
        let offs = &layout.classes[i];
        write_u4(&mut file, index.type_index(&class.descriptor)?);
        write_u4(&mut file, class.access.bits());
        match &class.superclass {
            Some(s) => write_u4(&mut file, index.type_index(s)?),
            None => write_u4(&mut file, NO_INDEX),
        };
        let interfaces = index.type_list(&class.interfaces)?;
        write_u4(&mut file, layout.type_list_offset(&interfaces));
        match &class.source_file {
            Some(s) => write_u4(&mut file, index.string_index(s)?),
            None => write_u4(&mut file, NO_INDEX),
        };
        write_u4(&mut file, offs.annotations);
        write_u4(&mut file, offs.class_data);
        write_u4(&mut file, offs.static_values);
    }
    if file.len() != ids.data_off as usize {
        fail!("id sections end at {:#x}, expected {:#x}", file.len(), ids.data_off);
    }
    file.extend_from_slice(&data.bytes);

    let version: &[u8; 3] = if uses_protos.0 { b"038" } else { b"035" };
    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(b"dex\n");
    header.extend_from_slice(version);
    header.push(0);
    write_u4(&mut header, 0); // checksum
    header.extend_from_slice(&[0u8; 20]); // signature
    write_u4(&mut header, file.len() as u32);
    write_u4(&mut header, HEADER_SIZE as u32);
    write_u4(&mut header, ENDIAN_CONSTANT);
    write_u4(&mut header, 0); // link_size
    write_u4(&mut header, 0); // link_off
    write_u4(&mut header, map_off);
    for (count, off) in ids.sections() {
        write_u4(&mut header, count);
        write_u4(&mut header, if count == 0 { 0 } else { off });
    }
    write_u4(&mut header, data_size);
    write_u4(&mut header, ids.data_off);
    file[..HEADER_SIZE].copy_from_slice(&header);

    let signature = compute_sha1(&file[32..]);
    file[12..32].copy_from_slice(&signature);
    let checksum = adler32_slice(&file[12..]);
    file[8..12].copy_from_slice(&checksum.to_le_bytes());

    Ok(file)
}

fn compute_sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Flags prototypes referenced directly by code or constants, which need format 038.
struct ProtoUse(bool);

impl RefSink for ProtoUse {
    fn string(&mut self, _: &str) {}
    fn type_desc(&mut self, _: &str) {}
    fn proto(&mut self, _: &Proto) {
        self.0 = true;
    }
    fn field(&mut self, _: &FieldRef) {}
    fn method(&mut self, _: &MethodRef) {}
}

/// Superclasses and interfaces defined in the same file must precede their subclasses.
fn definition_order(classes: &[ClassDef]) -> Result<Vec<usize>, DexError> {
    let mut by_descriptor = HashMap::with_capacity(classes.len());
    for (i, c) in classes.iter().enumerate() {
        if by_descriptor.insert(c.descriptor.as_str(), i).is_some() {
            fail!("class {} is defined twice", c.descriptor);
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Visiting,
        Done,
    }
    let mut marks = vec![Mark::New; classes.len()];
    let mut order = Vec::with_capacity(classes.len());

    for root in 0..classes.len() {
        // explicit stack of (class, next supertype to look at)
        let mut stack = vec![(root, 0usize)];
        while let Some(&mut (i, ref mut next)) = stack.last_mut() {
            if *next == 0 {
                match marks[i] {
                    Mark::Done => {
                        stack.pop();
                        continue;
                    }
                    Mark::Visiting => fail!("class hierarchy cycle through {}", classes[i].descriptor),
                    Mark::New => marks[i] = Mark::Visiting,
                }
            }
            let supers: Vec<&str> = classes[i]
                .superclass
                .iter()
                .chain(classes[i].interfaces.iter())
                .map(String::as_str)
                .collect();
            if let Some(s) = supers.get(*next) {
                *next += 1;
                if let Some(&j) = by_descriptor.get(s) {
                    match marks[j] {
                        Mark::Done => {}
                        Mark::Visiting => fail!("class hierarchy cycle through {}", classes[j].descriptor),
                        Mark::New => stack.push((j, 0)),
                    }
                }
            } else {
                marks[i] = Mark::Done;
                order.push(i);
                stack.pop();
            }
        }
    }
    Ok(order)
}

/// Sorted pools and the reverse maps used while writing.
///
/// The same tables index any code generated alongside the container, so native code and the
/// DEX file agree on every pool index.
pub(crate) struct IndexTables {
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    types: Vec<String>,
    type_index: HashMap<String, u32>,
    protos: Vec<Proto>,
    proto_index: HashMap<Proto, u32>,
    fields: Vec<FieldRef>,
    field_index: HashMap<FieldRef, u32>,
    methods: Vec<MethodRef>,
    method_index: HashMap<MethodRef, u32>,
}

fn utf16_order(a: &str, b: &str) -> Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

fn index_map<T: Clone + Eq + std::hash::Hash>(items: &[T]) -> HashMap<T, u32> {
    items.iter().enumerate().map(|(i, t)| (t.clone(), i as u32)).collect()
}

/// The index tables `write_dex` would use for `classes`.
pub(crate) fn index_tables(classes: &[ClassDef]) -> Result<IndexTables, DexError> {
    let mut pools = RefPools::default();
    for class in classes {
        class.visit_refs(&mut pools);
    }
    IndexTables::build(&pools)
}

/// The code units of `code` with every index operand filled in.
pub(crate) fn resolve_insns(code: &Code, index: &impl IndexResolver) -> Result<Vec<u16>, DexError> {
    let mut insns = code.insns.clone();
    for r in &code.refs {
        let idx = match &r.target {
            RefTarget::String(s) => index.string_index(s)?,
            RefTarget::Type(t) => index.type_index(t)?,
            RefTarget::Field(f) => index.field_index(f)?,
            RefTarget::Method(m) => index.method_index(m)?,
            RefTarget::Proto(p) => index.proto_index(p)?,
        };
        let pos = r.position as usize + r.slot.offset();
        let width = if r.slot == RefSlot::Unit1Wide { 2 } else { 1 };
        if pos + width > insns.len() {
            fail!("reference slot at {} lies outside the code", r.position);
        }
        if r.slot == RefSlot::Unit1Wide {
            insns[pos] = idx as u16;
            insns[pos + 1] = (idx >> 16) as u16;
        } else {
            if idx > 0xffff {
                fail!("index {} at {} does not fit a 16-bit operand", idx, r.position);
            }
            insns[pos] = idx as u16;
        }
    }
    Ok(insns)
}

impl IndexTables {
    pub(crate) fn strings(&self) -> &[String] {
        &self.strings
    }

    pub(crate) fn types(&self) -> &[String] {
        &self.types
    }

    pub(crate) fn protos(&self) -> &[Proto] {
        &self.protos
    }

    pub(crate) fn fields(&self) -> &[FieldRef] {
        &self.fields
    }

    pub(crate) fn methods(&self) -> &[MethodRef] {
        &self.methods
    }

    fn build(pools: &RefPools) -> Result<Self, DexError> {
        let mut strings: Vec<String> = pools.strings.iter().cloned().collect();
        strings.sort_by(|a, b| utf16_order(a, b));
        let string_index = index_map(&strings);

        // type ids sort by descriptor string index, which is the same order
        let mut types: Vec<String> = pools.types.iter().cloned().collect();
        types.sort_by(|a, b| utf16_order(a, b));
        let type_index = index_map(&types);

        let mut tables = IndexTables {
            strings,
            string_index,
            types,
            type_index,
            protos: Vec::new(),
            proto_index: HashMap::new(),
            fields: Vec::new(),
            field_index: HashMap::new(),
            methods: Vec::new(),
            method_index: HashMap::new(),
        };

        let mut protos = Vec::with_capacity(pools.protos.len());
        for p in &pools.protos {
            let key = (tables.type_index(&p.return_type)?, tables.type_list(&p.params)?);
            protos.push((key, p.clone()));
        }
        protos.sort_by(|a, b| a.0.cmp(&b.0));
        tables.protos = protos.into_iter().map(|(_, p)| p).collect();
        tables.proto_index = index_map(&tables.protos);

        let mut fields = Vec::with_capacity(pools.fields.len());
        for f in &pools.fields {
            let key = (
                tables.type_index(&f.class)?,
                tables.string_index(&f.name)?,
                tables.type_index(&f.ty)?,
            );
            fields.push((key, f.clone()));
        }
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        tables.fields = fields.into_iter().map(|(_, f)| f).collect();
        tables.field_index = index_map(&tables.fields);

        let mut methods = Vec::with_capacity(pools.methods.len());
        for m in &pools.methods {
            let key = (
                tables.type_index(&m.class)?,
                tables.string_index(&m.name)?,
                tables.proto_index(&m.proto)?,
            );
            methods.push((key, m.clone()));
        }
        methods.sort_by(|a, b| a.0.cmp(&b.0));
        tables.methods = methods.into_iter().map(|(_, m)| m).collect();
        tables.method_index = index_map(&tables.methods);

        Ok(tables)
    }

    pub(crate) fn type_list(&self, types: &[String]) -> Result<Vec<u32>, DexError> {
        types.iter().map(|t| self.type_index(t)).collect()
    }

    fn narrow_type_index(&self, descriptor: &str) -> Result<u16, DexError> {
        let idx = self.type_index(descriptor)?;
        u16::try_from(idx).map_err(|_| dex_err!("type index {} of {} exceeds 16 bits", idx, descriptor))
    }
}

impl IndexResolver for IndexTables {
    fn string_index(&self, value: &str) -> Result<u32, DexError> {
        self.string_index
            .get(value)
            .copied()
            .ok_or_else(|| dex_err!("missing string index for {:?}", value))
    }

    fn type_index(&self, descriptor: &str) -> Result<u32, DexError> {
        self.type_index
            .get(descriptor)
            .copied()
            .ok_or_else(|| dex_err!("missing type index for {}", descriptor))
    }

    fn proto_index(&self, proto: &Proto) -> Result<u32, DexError> {
        self.proto_index
            .get(proto)
            .copied()
            .ok_or_else(|| dex_err!("missing proto index for {}", proto))
    }

    fn field_index(&self, field: &FieldRef) -> Result<u32, DexError> {
        self.field_index
            .get(field)
            .copied()
            .ok_or_else(|| dex_err!("missing field index for {}", field))
    }

    fn method_index(&self, method: &MethodRef) -> Result<u32, DexError> {
        self.method_index
            .get(method)
            .copied()
            .ok_or_else(|| dex_err!("missing method index for {}", method))
    }
}

/// Offsets of the fixed-size id sections that follow the header.
struct IdLayout {
    counts: [u32; 6],
    offsets: [u32; 6],
    data_off: u32,
}

impl IdLayout {
    const ITEM_SIZES: [u32; 6] = [4, 4, 12, 8, 8, 32];
    const MAP_TYPES: [u16; 6] = [
        TYPE_STRING_ID_ITEM,
        TYPE_TYPE_ID_ITEM,
        TYPE_PROTO_ID_ITEM,
        TYPE_FIELD_ID_ITEM,
        TYPE_METHOD_ID_ITEM,
        TYPE_CLASS_DEF_ITEM,
    ];

    fn new(index: &IndexTables, class_count: usize) -> Self {
        let counts = [
            index.strings.len() as u32,
            index.types.len() as u32,
            index.protos.len() as u32,
            index.fields.len() as u32,
            index.methods.len() as u32,
            class_count as u32,
        ];
        let mut offsets = [0u32; 6];
        let mut cursor = HEADER_SIZE as u32;
        for i in 0..6 {
            offsets[i] = cursor;
            cursor += counts[i] * Self::ITEM_SIZES[i];
        }
        IdLayout {
            counts,
            offsets,
            data_off: cursor,
        }
    }

    fn sections(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.counts.iter().copied().zip(self.offsets.iter().copied())
    }
}

#[derive(Debug, Clone, Copy)]
struct MapItem {
    type_code: u16,
    size: u32,
    offset: u32,
}

#[derive(Default, Clone, Copy)]
struct ClassOffsets {
    annotations: u32,
    class_data: u32,
    static_values: u32,
}

#[derive(Default)]
struct DataLayout {
    type_lists: HashMap<Vec<u32>, u32>,
    string_data: HashMap<String, u32>,
    classes: Vec<ClassOffsets>,
}

impl DataLayout {
    fn type_list_offset(&self, list: &[u32]) -> u32 {
        if list.is_empty() {
            0
        } else {
            self.type_lists.get(list).copied().unwrap_or(0)
        }
    }
}

/// Members of a class with their pool indices, sorted as class_data requires.
struct SortedMembers<'c> {
    static_fields: Vec<(u32, &'c FieldDef)>,
    instance_fields: Vec<(u32, &'c FieldDef)>,
    direct_methods: Vec<(u32, &'c MethodDef)>,
    virtual_methods: Vec<(u32, &'c MethodDef)>,
}

impl<'c> SortedMembers<'c> {
    fn new(class: &'c ClassDef, index: &IndexTables) -> Result<Self, DexError> {
        let fields = |list: &'c [FieldDef]| -> Result<Vec<(u32, &'c FieldDef)>, DexError> {
            let mut v = list
                .iter()
                .map(|f| index.field_index(&f.field).map(|i| (i, f)))
                .collect::<Result<Vec<_>, DexError>>()?;
            v.sort_by_key(|(i, _)| *i);
            Ok(v)
        };
        let methods = |list: &'c [MethodDef]| -> Result<Vec<(u32, &'c MethodDef)>, DexError> {
            let mut v = list
                .iter()
                .map(|m| index.method_index(&m.method).map(|i| (i, m)))
                .collect::<Result<Vec<_>, DexError>>()?;
            v.sort_by_key(|(i, _)| *i);
            Ok(v)
        };
        Ok(SortedMembers {
            static_fields: fields(&class.static_fields)?,
            instance_fields: fields(&class.instance_fields)?,
            direct_methods: methods(&class.direct_methods)?,
            virtual_methods: methods(&class.virtual_methods)?,
        })
    }

    fn is_empty(&self) -> bool {
        self.static_fields.is_empty()
            && self.instance_fields.is_empty()
            && self.direct_methods.is_empty()
            && self.virtual_methods.is_empty()
    }

    fn methods(&self) -> impl Iterator<Item = &(u32, &'c MethodDef)> {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    fn fields(&self) -> impl Iterator<Item = &(u32, &'c FieldDef)> {
        self.static_fields.iter().chain(self.instance_fields.iter())
    }
}

struct DataSection {
    base: u32,
    bytes: Vec<u8>,
    map: Vec<MapItem>,
}

impl DataSection {
    fn new(base: u32) -> Self {
        DataSection {
            base,
            bytes: Vec::new(),
            map: Vec::new(),
        }
    }

    fn offset(&self) -> u32 {
        self.base + self.bytes.len() as u32
    }

    /// Align for and account one more item of `type_code`, returning its offset.
    fn start_item(&mut self, type_code: u16, align: usize) -> u32 {
        pad_to(&mut self.bytes, align);
        let offset = self.offset();
        match self.map.last_mut() {
            Some(m) if m.type_code == type_code => m.size += 1,
            _ => self.map.push(MapItem {
                type_code,
                size: 1,
                offset,
            }),
        }
        offset
    }

    fn write_all(&mut self, index: &IndexTables, classes: &[&ClassDef]) -> Result<DataLayout, DexError> {
        let mut layout = DataLayout {
            classes: vec![ClassOffsets::default(); classes.len()],
            ..Default::default()
        };
        let members = classes
            .iter()
            .map(|c| SortedMembers::new(c, index))
            .collect::<Result<Vec<_>, DexError>>()?;

        // type lists
        let mut lists: Vec<Vec<u32>> = Vec::new();
        for p in &index.protos {
            lists.push(index.type_list(&p.params)?);
        }
        for c in classes {
            lists.push(index.type_list(&c.interfaces)?);
        }
        lists.sort();
        lists.dedup();
        for list in lists.into_iter().filter(|l| !l.is_empty()) {
            let off = self.start_item(TYPE_TYPE_LIST, 4);
            write_u4(&mut self.bytes, list.len() as u32);
            for t in &list {
                if *t > 0xffff {
                    fail!("type index {} in type list exceeds 16 bits", t);
                }
                write_u2(&mut self.bytes, *t as u16);
            }
            layout.type_lists.insert(list, off);
        }

        // annotation items, sets, set ref lists, directories
        let mut items: HashMap<&Annotation, u32> = HashMap::new();
        for (c, m) in classes.iter().zip(&members) {
            for a in all_annotations(c, m) {
                if !items.contains_key(a) {
                    let off = self.start_item(TYPE_ANNOTATION_ITEM, 1);
                    write_u1(&mut self.bytes, a.visibility);
                    a.annotation.write(&mut self.bytes, index)?;
                    items.insert(a, off);
                }
            }
        }

        let set_key = |set: &[Annotation]| -> Result<Vec<u32>, DexError> {
            let mut keyed = set
                .iter()
                .map(|a| index.type_index(&a.annotation.type_desc).map(|t| (t, items[a])))
                .collect::<Result<Vec<_>, DexError>>()?;
            keyed.sort_by_key(|(t, _)| *t);
            Ok(keyed.into_iter().map(|(_, off)| off).collect())
        };
        let mut sets: HashMap<Vec<u32>, u32> = HashMap::new();
        for (c, m) in classes.iter().zip(&members) {
            for set in annotation_sets(c, m) {
                let key = set_key(set)?;
                if !sets.contains_key(&key) {
                    let off = self.start_item(TYPE_ANNOTATION_SET_ITEM, 4);
                    write_u4(&mut self.bytes, key.len() as u32);
                    for item in &key {
                        write_u4(&mut self.bytes, *item);
                    }
                    sets.insert(key, off);
                }
            }
        }
        let set_offset = |set: &[Annotation]| -> Result<u32, DexError> {
            if set.is_empty() {
                return Ok(0);
            }
            Ok(sets[&set_key(set)?])
        };

        let mut ref_lists: HashMap<u32, u32> = HashMap::new();
        for m in &members {
            for (idx, method) in m.methods() {
                if method.parameter_annotations.is_empty() {
                    continue;
                }
                let off = self.start_item(TYPE_ANNOTATION_SET_REF_LIST, 4);
                write_u4(&mut self.bytes, method.parameter_annotations.len() as u32);
                for set in &method.parameter_annotations {
                    let set_off = set_offset(set)?;
                    write_u4(&mut self.bytes, set_off);
                }
                ref_lists.insert(*idx, off);
            }
        }

        for (i, (c, m)) in classes.iter().zip(&members).enumerate() {
            let fields: Vec<_> = m.fields().filter(|(_, f)| !f.annotations.is_empty()).collect();
            let methods: Vec<_> = m.methods().filter(|(_, x)| !x.annotations.is_empty()).collect();
            let params: Vec<_> = m.methods().filter(|(idx, _)| ref_lists.contains_key(idx)).collect();
            if c.annotations.is_empty() && fields.is_empty() && methods.is_empty() && params.is_empty() {
                continue;
            }
            let class_set = set_offset(&c.annotations)?;
            let mut fields = fields
                .into_iter()
                .map(|(idx, f)| set_offset(&f.annotations).map(|off| (*idx, off)))
                .collect::<Result<Vec<_>, DexError>>()?;
            let mut methods = methods
                .into_iter()
                .map(|(idx, x)| set_offset(&x.annotations).map(|off| (*idx, off)))
                .collect::<Result<Vec<_>, DexError>>()?;
            let mut params: Vec<(u32, u32)> = params.into_iter().map(|(idx, _)| (*idx, ref_lists[idx])).collect();
            fields.sort();
            methods.sort();
            params.sort();

            let off = self.start_item(TYPE_ANNOTATIONS_DIRECTORY_ITEM, 4);
            write_u4(&mut self.bytes, class_set);
            write_u4(&mut self.bytes, fields.len() as u32);
            write_u4(&mut self.bytes, methods.len() as u32);
            write_u4(&mut self.bytes, params.len() as u32);
            for (idx, off) in fields.iter().chain(methods.iter()).chain(params.iter()) {
                write_u4(&mut self.bytes, *idx);
                write_u4(&mut self.bytes, *off);
            }
            layout.classes[i].annotations = off;
        }

        // code items
        let mut code_offsets: HashMap<u32, u32> = HashMap::new();
        for (c, m) in classes.iter().zip(&members) {
            for (idx, method) in m.methods() {
                if let Some(code) = &method.code {
                    let off = self.start_item(TYPE_CODE_ITEM, 4);
                    self.write_code(code, index)
                        .context(|| format!("code of {}", method.method))
                        .context(|| c.descriptor.clone())?;
                    code_offsets.insert(*idx, off);
                }
            }
        }

        for s in &index.strings {
            let off = self.start_item(TYPE_STRING_DATA_ITEM, 1);
            write_uleb128(&mut self.bytes, s.encode_utf16().count() as u32);
            write_x(&mut self.bytes, &cesu8::to_java_cesu8(s));
            write_u1(&mut self.bytes, 0);
            layout.string_data.insert(s.clone(), off);
        }

        for (i, m) in members.iter().enumerate() {
            if let Some(values) = static_values(&m.static_fields) {
                let off = self.start_item(TYPE_ENCODED_ARRAY_ITEM, 1);
                write_uleb128(&mut self.bytes, values.len() as u32);
                for v in values {
                    v.write(&mut self.bytes, index)?;
                }
                layout.classes[i].static_values = off;
            }
        }

        for (i, m) in members.iter().enumerate() {
            if m.is_empty() {
                continue;
            }
            let off = self.start_item(TYPE_CLASS_DATA_ITEM, 1);
            write_uleb128(&mut self.bytes, m.static_fields.len() as u32);
            write_uleb128(&mut self.bytes, m.instance_fields.len() as u32);
            write_uleb128(&mut self.bytes, m.direct_methods.len() as u32);
            write_uleb128(&mut self.bytes, m.virtual_methods.len() as u32);
            for list in [&m.static_fields, &m.instance_fields] {
                let mut prev = 0;
                for (idx, f) in list {
                    write_uleb128(&mut self.bytes, idx - prev);
                    write_uleb128(&mut self.bytes, f.access.bits());
                    prev = *idx;
                }
            }
            for list in [&m.direct_methods, &m.virtual_methods] {
                let mut prev = 0;
                for (idx, x) in list {
                    write_uleb128(&mut self.bytes, idx - prev);
                    write_uleb128(&mut self.bytes, x.access.bits());
                    write_uleb128(&mut self.bytes, code_offsets.get(idx).copied().unwrap_or(0));
                    prev = *idx;
                }
            }
            layout.classes[i].class_data = off;
        }

        Ok(layout)
    }

    fn write_code(&mut self, code: &Code, index: &IndexTables) -> Result<(), DexError> {
        let insns = resolve_insns(code, index)?;

        write_u2(&mut self.bytes, code.registers);
        write_u2(&mut self.bytes, code.ins);
        write_u2(&mut self.bytes, code.outs);
        write_u2(&mut self.bytes, code.tries.len() as u16);
        write_u4(&mut self.bytes, 0); // debug_info_off
        write_u4(&mut self.bytes, insns.len() as u32);
        for unit in &insns {
            write_u2(&mut self.bytes, *unit);
        }
        if code.tries.is_empty() {
            return Ok(());
        }
        if insns.len() % 2 == 1 {
            write_u2(&mut self.bytes, 0);
        }

        let mut handler_offsets: HashMap<(Vec<(u32, u32)>, Option<u32>), u16> = HashMap::new();
        let mut try_handler = Vec::with_capacity(code.tries.len());
        let mut encoded = Vec::new();
        for t in &code.tries {
            let pairs = t
                .handlers
                .iter()
                .map(|h| index.type_index(&h.exception).map(|t| (t, h.address)))
                .collect::<Result<Vec<_>, DexError>>()?;
            let key = (pairs, t.catch_all);
            let off = match handler_offsets.get(&key) {
                Some(off) => *off,
                None => {
                    let off = encoded.len() as u16;
                    let size = key.0.len() as i32;
                    write_sleb128(&mut encoded, if key.1.is_some() { -size } else { size });
                    for (ty, addr) in &key.0 {
                        write_uleb128(&mut encoded, *ty);
                        write_uleb128(&mut encoded, *addr);
                    }
                    if let Some(addr) = key.1 {
                        write_uleb128(&mut encoded, addr);
                    }
                    handler_offsets.insert(key, off);
                    off
                }
            };
            try_handler.push(off);
        }

        // handler offsets are relative to the list start, after its size prefix
        let mut list = Vec::new();
        let prefix = write_uleb128(&mut list, handler_offsets.len() as u32) as u16;
        for (t, off) in code.tries.iter().zip(try_handler) {
            write_u4(&mut self.bytes, t.start);
            write_u2(&mut self.bytes, t.count);
            write_u2(&mut self.bytes, off + prefix);
        }
        list.extend_from_slice(&encoded);
        self.bytes.extend_from_slice(&list);
        Ok(())
    }

    fn write_map(&mut self, ids: &IdLayout) -> u32 {
        let mut items = vec![MapItem {
            type_code: TYPE_HEADER_ITEM,
            size: 1,
            offset: 0,
        }];
        for (i, (count, off)) in ids.sections().enumerate() {
            if count > 0 {
                items.push(MapItem {
                    type_code: IdLayout::MAP_TYPES[i],
                    size: count,
                    offset: off,
                });
            }
        }
        items.extend(self.map.iter().copied());

        pad_to(&mut self.bytes, 4);
        let map_off = self.offset();
        items.push(MapItem {
            type_code: TYPE_MAP_LIST,
            size: 1,
            offset: map_off,
        });
        write_u4(&mut self.bytes, items.len() as u32);
        for item in &items {
            write_u2(&mut self.bytes, item.type_code);
            write_u2(&mut self.bytes, 0);
            write_u4(&mut self.bytes, item.size);
            write_u4(&mut self.bytes, item.offset);
        }
        map_off
    }
}

/// Every annotation of a class in the order items are laid out.
fn all_annotations<'c>(class: &'c ClassDef, members: &SortedMembers<'c>) -> Vec<&'c Annotation> {
    annotation_sets(class, members).into_iter().flatten().collect()
}

/// Every non-empty annotation set of a class: class, fields, methods, then parameters.
fn annotation_sets<'c>(class: &'c ClassDef, members: &SortedMembers<'c>) -> Vec<&'c [Annotation]> {
    let mut sets: Vec<&'c [Annotation]> = vec![&class.annotations];
    sets.extend(members.fields().map(|(_, f)| f.annotations.as_slice()));
    sets.extend(members.methods().map(|(_, m)| m.annotations.as_slice()));
    for (_, m) in members.methods() {
        sets.extend(m.parameter_annotations.iter().map(Vec::as_slice));
    }
    sets.retain(|s| !s.is_empty());
    sets
}

/// Static initial values in field order, with trailing defaults dropped.
fn static_values(fields: &[(u32, &FieldDef)]) -> Option<Vec<EncodedValue>> {
    fn explicit(f: &FieldDef) -> Option<&EncodedValue> {
        f.initial_value
            .as_ref()
            .filter(|v| **v != EncodedValue::default_for(&f.field.ty))
    }
    let last = fields.iter().rposition(|(_, f)| explicit(f).is_some())?;
    Some(
        fields[..=last]
            .iter()
            .map(|(_, f)| {
                f.initial_value
                    .clone()
                    .unwrap_or_else(|| EncodedValue::default_for(&f.field.ty))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::reader::{read_classes, Header};
    use crate::types::AccessFlags;

    fn class(desc: &str, sup: &str) -> ClassDef {
        ClassDef::new(desc, AccessFlags::PUBLIC, Some(sup))
    }

    #[test]
    fn superclasses_are_written_first() {
        let classes = vec![
            class("La/C;", "La/B;"),
            class("La/B;", "La/A;"),
            class("La/A;", "Ljava/lang/Object;"),
        ];
        assert_eq!(definition_order(&classes).unwrap(), vec![2, 1, 0]);

        let bytes = write_dex(&classes).unwrap();
        let read: Vec<String> = read_classes(&bytes).unwrap().into_iter().map(|c| c.descriptor).collect();
        assert_eq!(read, vec!["La/A;", "La/B;", "La/C;"]);
    }

    #[test]
    fn hierarchy_cycles_are_rejected() {
        let classes = vec![class("La/A;", "La/B;"), class("La/B;", "La/A;")];
        assert!(definition_order(&classes).is_err());
    }

    #[test]
    fn header_checksum_and_sizes_are_consistent() {
        let bytes = write_dex(&[class("La/A;", "Ljava/lang/Object;")]).unwrap();
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.version, 35);
        assert_eq!(header.file_size as usize, bytes.len());
        assert_eq!(header.checksum, adler32_slice(&bytes[12..]));
        assert_eq!(&bytes[12..32], &compute_sha1(&bytes[32..]));
        assert_eq!(header.class_defs.0, 1);
        assert_eq!(header.data.0 % 4, 0);
        assert_eq!(header.data.1 + header.data.0, header.file_size);
    }

    #[test]
    fn strings_sort_by_utf16_units() {
        // U+FFFF sorts after a surrogate pair in UTF-16 but before it in UTF-8
        let mut v = vec!["\u{10000}".to_string(), "\u{ffff}".to_string(), "z".to_string()];
        v.sort_by(|a, b| utf16_order(a, b));
        assert_eq!(v, vec!["z", "\u{10000}", "\u{ffff}"]);
    }

    #[test]
    fn trailing_default_static_values_are_dropped() {
        let f = |name: &str, v: Option<EncodedValue>| {
            let mut fd = FieldDef::new(FieldRef::new("La/A;", name, "I"), AccessFlags::STATIC);
            fd.initial_value = v;
            fd
        };
        let a = f("a", None);
        let b = f("b", Some(EncodedValue::Int(3)));
        let c = f("c", Some(EncodedValue::Int(0)));
        let fields = vec![(0, &a), (1, &b), (2, &c)];
        assert_eq!(
            static_values(&fields),
            Some(vec![EncodedValue::Int(0), EncodedValue::Int(3)])
        );
        assert_eq!(static_values(&fields[2..]), None);
    }
}
