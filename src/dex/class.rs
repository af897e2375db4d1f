//! Position-independent class records.
//!
//! Nothing in here holds a pool index: instructions keep their opcode and register units
//! with the index operands zeroed, and a relocation list says which symbol belongs in each
//! slot. That is what lets a class be lifted out of one container and interned into another.
use crate::dex::encoded_values::{EncodedAnnotation, EncodedValue};
use crate::dex::error::DexError;
use crate::dex::opcodes;
use crate::types::{AccessFlags, FieldRef, MethodRef, Proto};

/// Receives every symbolic reference an item depends on.
pub trait RefSink {
    fn string(&mut self, value: &str);
    fn type_desc(&mut self, descriptor: &str);
    fn proto(&mut self, proto: &Proto);
    fn field(&mut self, field: &FieldRef);
    fn method(&mut self, method: &MethodRef);
}

pub const VISIBILITY_BUILD: u8 = 0x00;
pub const VISIBILITY_RUNTIME: u8 = 0x01;
pub const VISIBILITY_SYSTEM: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Annotation {
    pub visibility: u8,
    pub annotation: EncodedAnnotation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub field: FieldRef,
    pub access: AccessFlags,
    /// Only meaningful for static fields.
    pub initial_value: Option<EncodedValue>,
    pub annotations: Vec<Annotation>,
}

impl FieldDef {
    pub fn new(field: FieldRef, access: AccessFlags) -> Self {
        FieldDef {
            field,
            access,
            initial_value: None,
            annotations: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }
}

/// Which code units of an instruction hold its index operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefSlot {
    /// 16-bit index in the unit after the opcode (21c, 22c, 35c, 3rc, and the method of 45cc/4rcc).
    Unit1,
    /// 32-bit index spanning the two units after the opcode (31c).
    Unit1Wide,
    /// 16-bit proto index in the fourth unit (45cc, 4rcc).
    Unit3,
}

impl RefSlot {
    pub fn offset(self) -> usize {
        match self {
            RefSlot::Unit1 | RefSlot::Unit1Wide => 1,
            RefSlot::Unit3 => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefTarget {
    String(String),
    Type(String),
    Field(FieldRef),
    Method(MethodRef),
    Proto(Proto),
}

/// The symbol referenced by the instruction starting at `position` (in code units).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InsnRef {
    pub position: u32,
    pub slot: RefSlot,
    pub target: RefTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatchHandler {
    pub exception: String,
    pub address: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TryBlock {
    pub start: u32,
    pub count: u16,
    pub handlers: Vec<CatchHandler>,
    pub catch_all: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Code {
    pub registers: u16,
    pub ins: u16,
    pub outs: u16,
    pub insns: Vec<u16>,
    pub refs: Vec<InsnRef>,
    pub tries: Vec<TryBlock>,
}

impl Code {
    /// Insert `prefix` ahead of the existing instructions.
    ///
    /// Branches are relative and survive untouched; try ranges, handler addresses and
    /// relocations are shifted. The prefix length must be even so that switch and array
    /// payloads stay 4-byte aligned.
    pub fn prepend(&mut self, prefix: CodeBuilder) -> Result<(), DexError> {
        let shift = prefix.insns.len() as u32;
        if shift % 2 != 0 {
            fail!("code prefix of {} units would misalign payloads", shift);
        }

        for r in self.refs.iter_mut() {
            r.position += shift;
        }
        for t in self.tries.iter_mut() {
            t.start += shift;
            for h in t.handlers.iter_mut() {
                h.address += shift;
            }
            if let Some(addr) = t.catch_all.as_mut() {
                *addr += shift;
            }
        }

        let mut insns = prefix.insns;
        insns.extend_from_slice(&self.insns);
        self.insns = insns;

        let mut refs = prefix.refs;
        refs.append(&mut self.refs);
        self.refs = refs;

        self.registers = self.registers.max(prefix.registers);
        self.outs = self.outs.max(prefix.outs);
        Ok(())
    }

    pub(crate) fn visit_refs(&self, sink: &mut impl RefSink) {
        for r in &self.refs {
            match &r.target {
                RefTarget::String(s) => sink.string(s),
                RefTarget::Type(t) => sink.type_desc(t),
                RefTarget::Field(f) => sink.field(f),
                RefTarget::Method(m) => sink.method(m),
                RefTarget::Proto(p) => sink.proto(p),
            }
        }
        for t in &self.tries {
            for h in &t.handlers {
                sink.type_desc(&h.exception);
            }
        }
    }
}

/// Assembles the handful of instructions the protection passes synthesize.
///
/// Registers are limited to `v0`..`v15`, which is all the 35c invoke format can name.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    insns: Vec<u16>,
    refs: Vec<InsnRef>,
    registers: u16,
    outs: u16,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self, reg: u8) {
        self.registers = self.registers.max(reg as u16 + 1);
    }

    fn push_ref(&mut self, slot: RefSlot, target: RefTarget) {
        self.refs.push(InsnRef {
            position: self.insns.len() as u32,
            slot,
            target,
        });
    }

    /// `const vAA, #+BBBBBBBB`
    pub fn const_int(mut self, reg: u8, value: i32) -> Self {
        self.touch(reg);
        let v = value as u32;
        self.insns.extend_from_slice(&[
            opcodes::OP_CONST as u16 | (reg as u16) << 8,
            v as u16,
            (v >> 16) as u16,
        ]);
        self
    }

    /// `const-string/jumbo vAA, string@BBBBBBBB`
    pub fn const_string_jumbo(mut self, reg: u8, value: &str) -> Self {
        self.touch(reg);
        self.push_ref(RefSlot::Unit1Wide, RefTarget::String(value.to_string()));
        self.insns.extend_from_slice(&[opcodes::OP_CONST_STRING_JUMBO as u16 | (reg as u16) << 8, 0, 0]);
        self
    }

    pub fn invoke_static(self, regs: &[u8], method: MethodRef) -> Self {
        self.invoke(opcodes::OP_INVOKE_STATIC, regs, method)
    }

    pub fn invoke_direct(self, regs: &[u8], method: MethodRef) -> Self {
        self.invoke(opcodes::OP_INVOKE_DIRECT, regs, method)
    }

    fn invoke(mut self, opcode: u8, regs: &[u8], method: MethodRef) -> Self {
        debug_assert!(regs.len() <= 5 && regs.iter().all(|&r| r < 16));
        let mut packed = [0u16; 5];
        for (slot, &r) in packed.iter_mut().zip(regs) {
            *slot = r as u16 & 0xF;
            self.touch(r);
        }
        self.outs = self.outs.max(regs.len() as u16);
        self.push_ref(RefSlot::Unit1, RefTarget::Method(method));
        self.insns.extend_from_slice(&[
            opcode as u16 | (regs.len() as u16) << 12 | packed[4] << 8,
            0,
            packed[0] | packed[1] << 4 | packed[2] << 8 | packed[3] << 12,
        ]);
        self
    }

    pub fn return_void(mut self) -> Self {
        self.insns.push(opcodes::OP_RETURN_VOID as u16);
        self
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Finish a complete method body. `ins` registers are placed at the top of the frame.
    pub fn build(self, ins: u16) -> Code {
        Code {
            registers: self.registers.max(ins),
            ins,
            outs: self.outs,
            insns: self.insns,
            refs: self.refs,
            tries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    pub method: MethodRef,
    pub access: AccessFlags,
    pub code: Option<Code>,
    pub annotations: Vec<Annotation>,
    pub parameter_annotations: Vec<Vec<Annotation>>,
}

impl MethodDef {
    pub fn new(method: MethodRef, access: AccessFlags, code: Option<Code>) -> Self {
        MethodDef {
            method,
            access,
            code,
            annotations: Vec::new(),
            parameter_annotations: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.access.contains(AccessFlags::STATIC)
    }

    pub fn is_native(&self) -> bool {
        self.access.contains(AccessFlags::NATIVE)
    }

    pub fn is_class_initializer(&self) -> bool {
        self.method.name == "<clinit>"
    }

    /// Direct methods are static, private or constructors; everything else dispatches virtually.
    pub fn is_direct(&self) -> bool {
        self.access
            .intersects(AccessFlags::STATIC | AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    pub descriptor: String,
    pub access: AccessFlags,
    pub superclass: Option<String>,
    pub interfaces: Vec<String>,
    pub source_file: Option<String>,
    pub annotations: Vec<Annotation>,
    pub static_fields: Vec<FieldDef>,
    pub instance_fields: Vec<FieldDef>,
    pub direct_methods: Vec<MethodDef>,
    pub virtual_methods: Vec<MethodDef>,
}

impl ClassDef {
    pub fn new(descriptor: &str, access: AccessFlags, superclass: Option<&str>) -> Self {
        ClassDef {
            descriptor: descriptor.to_string(),
            access,
            superclass: superclass.map(str::to_string),
            interfaces: Vec::new(),
            source_file: None,
            annotations: Vec::new(),
            static_fields: Vec::new(),
            instance_fields: Vec::new(),
            direct_methods: Vec::new(),
            virtual_methods: Vec::new(),
        }
    }

    /// The same class with no members: type, flags, supertypes and source file only.
    pub fn shell(&self) -> ClassDef {
        ClassDef {
            annotations: Vec::new(),
            static_fields: Vec::new(),
            instance_fields: Vec::new(),
            direct_methods: Vec::new(),
            virtual_methods: Vec::new(),
            ..self.clone()
        }
    }

    pub fn methods(&self) -> impl Iterator<Item = &MethodDef> {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.static_fields.iter().chain(self.instance_fields.iter())
    }

    /// Add a method to the direct or virtual list according to its flags.
    pub fn add_method(&mut self, method: MethodDef) {
        if method.is_direct() {
            self.direct_methods.push(method);
        } else {
            self.virtual_methods.push(method);
        }
    }

    pub fn add_field(&mut self, field: FieldDef) {
        if field.is_static() {
            self.static_fields.push(field);
        } else {
            self.instance_fields.push(field);
        }
    }

    pub fn class_initializer_mut(&mut self) -> Option<&mut MethodDef> {
        self.direct_methods.iter_mut().find(|m| m.is_class_initializer())
    }

    /// The class initializer, synthesized as an empty `return-void` body when absent.
    pub fn ensure_class_initializer(&mut self) -> &mut MethodDef {
        let pos = match self.direct_methods.iter().position(|m| m.is_class_initializer()) {
            Some(pos) => pos,
            None => {
                let method = MethodRef::new(&self.descriptor, "<clinit>", Proto::new("V", &[]));
                let code = CodeBuilder::new().return_void().build(0);
                self.direct_methods.push(MethodDef::new(
                    method,
                    AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
                    Some(code),
                ));
                self.direct_methods.len() - 1
            }
        };
        &mut self.direct_methods[pos]
    }

    pub(crate) fn visit_refs(&self, sink: &mut impl RefSink) {
        sink.type_desc(&self.descriptor);
        if let Some(s) = &self.superclass {
            sink.type_desc(s);
        }
        for i in &self.interfaces {
            sink.type_desc(i);
        }
        if let Some(src) = &self.source_file {
            sink.string(src);
        }
        for a in &self.annotations {
            a.annotation.visit_refs(sink);
        }
        for f in self.fields() {
            sink.field(&f.field);
            if let Some(v) = &f.initial_value {
                v.visit_refs(sink);
            }
            for a in &f.annotations {
                a.annotation.visit_refs(sink);
            }
        }
        for m in self.methods() {
            sink.method(&m.method);
            if let Some(code) = &m.code {
                code.visit_refs(sink);
            }
            for a in m.annotations.iter().chain(m.parameter_annotations.iter().flatten()) {
                a.annotation.visit_refs(sink);
            }
        }
    }
}
