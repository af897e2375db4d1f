use crate::dex::class::{ClassDef, RefSink};
use crate::dex::error::DexError;
use crate::dex::{reader, writer, DEX_INDEX_LIMIT};
use crate::types::{FieldRef, MethodRef, Proto};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// The distinct symbols a set of classes references, one set per DEX pool.
#[derive(Debug, Default, Clone)]
pub struct RefPools {
    pub(crate) strings: BTreeSet<String>,
    pub(crate) types: BTreeSet<String>,
    pub(crate) protos: BTreeSet<Proto>,
    pub(crate) fields: BTreeSet<FieldRef>,
    pub(crate) methods: BTreeSet<MethodRef>,
}

impl RefPools {
    pub fn counts(&self) -> PoolCounts {
        PoolCounts {
            strings: self.strings.len(),
            types: self.types.len(),
            protos: self.protos.len(),
            fields: self.fields.len(),
            methods: self.methods.len(),
        }
    }
}

impl RefSink for RefPools {
    fn string(&mut self, value: &str) {
        if !self.strings.contains(value) {
            self.strings.insert(value.to_string());
        }
    }

    fn type_desc(&mut self, descriptor: &str) {
        if !self.types.contains(descriptor) {
            self.types.insert(descriptor.to_string());
            self.string(descriptor);
        }
    }

    fn proto(&mut self, proto: &Proto) {
        if !self.protos.contains(proto) {
            self.protos.insert(proto.clone());
            self.string(&proto.shorty());
            self.type_desc(&proto.return_type);
            for p in &proto.params {
                self.type_desc(p);
            }
        }
    }

    fn field(&mut self, field: &FieldRef) {
        if !self.fields.contains(field) {
            self.fields.insert(field.clone());
            self.type_desc(&field.class);
            self.string(&field.name);
            self.type_desc(&field.ty);
        }
    }

    fn method(&mut self, method: &MethodRef) {
        if !self.methods.contains(method) {
            self.methods.insert(method.clone());
            self.type_desc(&method.class);
            self.string(&method.name);
            self.proto(&method.proto);
        }
    }
}

/// Collects only the symbols a class would add on top of an existing pool set.
struct Delta<'a> {
    base: &'a RefPools,
    added: RefPools,
}

impl RefSink for Delta<'_> {
    fn string(&mut self, value: &str) {
        if !self.base.strings.contains(value) {
            self.added.string(value);
        }
    }

    fn type_desc(&mut self, descriptor: &str) {
        if !self.base.types.contains(descriptor) && !self.added.types.contains(descriptor) {
            self.added.types.insert(descriptor.to_string());
            self.string(descriptor);
        }
    }

    fn proto(&mut self, proto: &Proto) {
        if !self.base.protos.contains(proto) && !self.added.protos.contains(proto) {
            self.added.protos.insert(proto.clone());
            self.string(&proto.shorty());
            self.type_desc(&proto.return_type);
            for p in &proto.params {
                self.type_desc(p);
            }
        }
    }

    fn field(&mut self, field: &FieldRef) {
        if !self.base.fields.contains(field) && !self.added.fields.contains(field) {
            self.added.fields.insert(field.clone());
            self.type_desc(&field.class);
            self.string(&field.name);
            self.type_desc(&field.ty);
        }
    }

    fn method(&mut self, method: &MethodRef) {
        if !self.base.methods.contains(method) && !self.added.methods.contains(method) {
            self.added.methods.insert(method.clone());
            self.type_desc(&method.class);
            self.string(&method.name);
            self.proto(&method.proto);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    pub strings: usize,
    pub types: usize,
    pub protos: usize,
    pub fields: usize,
    pub methods: usize,
}

impl PoolCounts {
    pub fn largest(&self) -> usize {
        [self.strings, self.types, self.protos, self.fields, self.methods]
            .into_iter()
            .max()
            .unwrap_or(0)
    }

    pub fn exceeds(&self, capacity: usize) -> bool {
        self.largest() > capacity
    }

    fn plus(self, other: PoolCounts) -> PoolCounts {
        PoolCounts {
            strings: self.strings + other.strings,
            types: self.types + other.types,
            protos: self.protos + other.protos,
            fields: self.fields + other.fields,
            methods: self.methods + other.methods,
        }
    }
}

impl fmt::Display for PoolCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "strings={} types={} protos={} fields={} methods={}",
            self.strings, self.types, self.protos, self.fields, self.methods
        )
    }
}

/// An ordered set of classes plus the reference pools they need.
///
/// Interning only grows the pools; serialization lays out whatever the classes reference.
#[derive(Debug, Clone)]
pub struct Container {
    classes: Vec<ClassDef>,
    by_descriptor: HashMap<String, usize>,
    pools: RefPools,
    capacity: usize,
}

impl Default for Container {
    fn default() -> Self {
        Container::new(DEX_INDEX_LIMIT)
    }
}

impl Container {
    pub fn new(capacity: usize) -> Self {
        Container {
            classes: Vec::new(),
            by_descriptor: HashMap::new(),
            pools: RefPools::default(),
            capacity,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DexError> {
        let mut container = Container::default();
        for class in reader::read_classes(bytes)? {
            container.intern(class)?;
        }
        Ok(container)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn classes(&self) -> &[ClassDef] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, descriptor: &str) -> Option<&ClassDef> {
        self.by_descriptor.get(descriptor).map(|&i| &self.classes[i])
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.by_descriptor.contains_key(descriptor)
    }

    /// Add a class and grow the pools with everything it references.
    pub fn intern(&mut self, class: ClassDef) -> Result<(), DexError> {
        if self.by_descriptor.contains_key(&class.descriptor) {
            fail!("class {} interned twice", class.descriptor);
        }
        class.visit_refs(&mut self.pools);
        self.by_descriptor.insert(class.descriptor.clone(), self.classes.len());
        self.classes.push(class);
        Ok(())
    }

    /// Replace an interned class with a new definition of the same type.
    ///
    /// Pools are rebuilt since the old definition's references may no longer be needed.
    pub fn replace(&mut self, class: ClassDef) -> Result<(), DexError> {
        let Some(&pos) = self.by_descriptor.get(&class.descriptor) else {
            fail!("class {} is not in the container", class.descriptor);
        };
        self.classes[pos] = class;
        self.pools = RefPools::default();
        for c in &self.classes {
            c.visit_refs(&mut self.pools);
        }
        Ok(())
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.pools.counts()
    }

    /// True once any reference pool holds more entries than the capacity.
    pub fn has_overflowed(&self) -> bool {
        self.pool_counts().exceeds(self.capacity)
    }

    /// Pool counts after interning `class`, without interning it.
    pub fn counts_with(&self, class: &ClassDef) -> PoolCounts {
        let mut delta = Delta {
            base: &self.pools,
            added: RefPools::default(),
        };
        class.visit_refs(&mut delta);
        self.pool_counts().plus(delta.added.counts())
    }

    /// True when interning `class` would push any pool past the capacity.
    pub fn would_overflow(&self, class: &ClassDef) -> bool {
        self.counts_with(class).exceeds(self.capacity)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DexError> {
        writer::write_dex(&self.classes)
    }

    pub fn into_classes(self) -> Vec<ClassDef> {
        self.classes
    }
}
