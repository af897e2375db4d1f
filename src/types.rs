//! Symbolic references shared by the DEX codec and the protection passes.
//!
//! Types are carried as JNI descriptors (`Lcom/example/Foo;`, `[I`), class names in the
//! internal form used by JNI (`com/example/Foo`) or the dotted Java form
//! (`com.example.Foo`) depending on the consumer.
use bitflags::bitflags;
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag};
use nom::character::complete::{char, one_of};
use nom::combinator::{all_consuming, map, recognize};
use nom::multi::{many0, many0_count};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::{IResult, Parser};
use std::fmt;

bitflags! {
    /// Access flags shared by classes, fields and methods.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct AccessFlags: u32 {
        const PUBLIC = 0x1;
        const PRIVATE = 0x2;
        const PROTECTED = 0x4;
        const STATIC = 0x8;
        const FINAL = 0x10;
        const SYNCHRONIZED = 0x20;
        const VOLATILE = 0x40;
        const BRIDGE = 0x40;
        const TRANSIENT = 0x80;
        const VARARGS = 0x80;
        const NATIVE = 0x100;
        const INTERFACE = 0x200;
        const ABSTRACT = 0x400;
        const STRICT = 0x800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const CONSTRUCTOR = 0x1_0000;
        const DECLARED_SYNCHRONIZED = 0x2_0000;
    }
}

/// A method prototype: return type and parameter types, all as descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Proto {
    pub return_type: String,
    pub params: Vec<String>,
}

impl Proto {
    pub fn new(return_type: &str, params: &[&str]) -> Self {
        Proto {
            return_type: return_type.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Parse `(Ljava/lang/String;I)V`.
    pub fn parse(signature: &str) -> Option<Proto> {
        all_consuming(parse_proto)(signature).ok().map(|(_, p)| p)
    }

    /// The shorty descriptor: one character per type, reference types collapsed to `L`.
    pub fn shorty(&self) -> String {
        std::iter::once(&self.return_type)
            .chain(self.params.iter())
            .map(|t| shorty_char(t))
            .collect()
    }

    /// Number of 16-bit registers the arguments occupy, excluding `this`.
    pub fn param_registers(&self) -> u16 {
        self.params
            .iter()
            .map(|p| if p == "J" || p == "D" { 2 } else { 1 })
            .sum()
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}){}", self.params.concat(), self.return_type)
    }
}

/// A field reference: defining class, name and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldRef {
    pub class: String,
    pub name: String,
    pub ty: String,
}

impl FieldRef {
    pub fn new(class: &str, name: &str, ty: &str) -> Self {
        FieldRef {
            class: class.to_string(),
            name: name.to_string(),
            ty: ty.to_string(),
        }
    }

    /// Parse `Lcom/example/Foo;->count:I`.
    pub fn parse(text: &str) -> Option<FieldRef> {
        let parsed: IResult<&str, FieldRef> = all_consuming(map(
            tuple((
                terminated(recognize(parse_descriptor), tag("->")),
                terminated(is_not(":"), char(':')),
                recognize(parse_descriptor),
            )),
            |(class, name, ty)| FieldRef::new(class, name, ty),
        ))(text);
        parsed.ok().map(|(_, f)| f)
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.class, self.name, self.ty)
    }
}

/// A method reference: defining class, name and prototype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodRef {
    pub class: String,
    pub name: String,
    pub proto: Proto,
}

impl MethodRef {
    pub fn new(class: &str, name: &str, proto: Proto) -> Self {
        MethodRef {
            class: class.to_string(),
            name: name.to_string(),
            proto,
        }
    }

    /// Parse `Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V`.
    pub fn parse(text: &str) -> Option<MethodRef> {
        let parsed: IResult<&str, MethodRef> = all_consuming(map(
            tuple((
                terminated(recognize(parse_descriptor), tag("->")),
                is_not("("),
                parse_proto,
            )),
            |(class, name, proto)| MethodRef::new(class, name, proto),
        ))(text);
        parsed.ok().map(|(_, m)| m)
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>" || self.name == "<clinit>"
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}{}", self.class, self.name, self.proto)
    }
}

fn shorty_char(descriptor: &str) -> char {
    match descriptor.chars().next() {
        Some('L') | Some('[') | None => 'L',
        Some(c) => c,
    }
}

/// Recognize a single field descriptor.
pub(crate) fn parse_descriptor(input: &str) -> IResult<&str, ()> {
    let object = map(delimited(char('L'), is_not(";"), char(';')), |_| ());
    let primitive = map(one_of("ZBCSIJFDV"), |_| ());
    map(
        pair(many0_count(char('[')), alt((object, primitive))),
        |_| (),
    )
    .parse(input)
}

pub(crate) fn parse_proto(input: &str) -> IResult<&str, Proto> {
    map(
        pair(
            delimited(char('('), many0(recognize(parse_descriptor)), char(')')),
            recognize(parse_descriptor),
        ),
        |(params, ret): (Vec<&str>, &str)| Proto {
            return_type: ret.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        },
    )
    .parse(input)
}

/// True when `text` is exactly one valid type descriptor.
pub fn is_valid_descriptor(text: &str) -> bool {
    all_consuming(parse_descriptor)(text).is_ok()
}

/// `com.example.Foo` -> `Lcom/example/Foo;`
pub fn java_to_descriptor(name: &str) -> String {
    format!("L{};", name.replace('.', "/"))
}

/// `Lcom/example/Foo;` -> `com.example.Foo`; `None` for non-class descriptors.
pub fn descriptor_to_java(descriptor: &str) -> Option<String> {
    internal_name(descriptor).map(|n| n.replace('/', "."))
}

/// `Lcom/example/Foo;` -> `com/example/Foo`
pub fn internal_name(descriptor: &str) -> Option<&str> {
    preceded(char::<&str, nom::error::Error<&str>>('L'), is_not(";"))
        .parse(descriptor)
        .ok()
        .filter(|(rest, _)| *rest == ";")
        .map(|(_, name)| name)
}

/// `com/example/Foo` -> `Lcom/example/Foo;`
pub fn internal_to_descriptor(name: &str) -> String {
    format!("L{};", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_references() {
        let m = MethodRef::parse("Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V").unwrap();
        assert_eq!(m.class, "Ljava/lang/System;");
        assert_eq!(m.name, "loadLibrary");
        assert_eq!(m.proto, Proto::new("V", &["Ljava/lang/String;"]));
        assert_eq!(
            m.to_string(),
            "Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V"
        );

        let m = MethodRef::parse("La/B;->f([[IJLa/C;)[La/D;").unwrap();
        assert_eq!(m.proto.params, vec!["[[I", "J", "La/C;"]);
        assert_eq!(m.proto.return_type, "[La/D;");
        assert_eq!(m.proto.shorty(), "LLJL");
        assert_eq!(m.proto.param_registers(), 4);

        assert!(MethodRef::parse("La/B;->f(Q)V").is_none());
        assert!(MethodRef::parse("La/B;->f()V trailing").is_none());
    }

    #[test]
    fn wide_parameters_take_two_registers() {
        let proto = Proto::new("D", &["J", "Ljava/lang/String;", "D", "[J"]);
        assert_eq!(proto.shorty(), "DJLDL");
        assert_eq!(proto.param_registers(), 6);
        assert_eq!(Proto::new("J", &[]).shorty(), "J");
    }

    #[test]
    fn parses_field_references() {
        let f = FieldRef::parse("Lcom/example/Foo;->count:I").unwrap();
        assert_eq!(f, FieldRef::new("Lcom/example/Foo;", "count", "I"));
        assert!(FieldRef::parse("Lcom/example/Foo;->count").is_none());
    }

    #[test]
    fn converts_class_names() {
        assert_eq!(java_to_descriptor("com.example.App"), "Lcom/example/App;");
        assert_eq!(
            descriptor_to_java("Lcom/example/App;").as_deref(),
            Some("com.example.App")
        );
        assert_eq!(internal_name("Lcom/example/App;"), Some("com/example/App"));
        assert_eq!(internal_name("[Lcom/example/App;"), None);
        assert_eq!(internal_name("I"), None);
        assert!(is_valid_descriptor("[[Ljava/lang/Object;"));
        assert!(!is_valid_descriptor("Ljava/lang/Object"));
    }

    #[test]
    fn access_flags_keep_unknown_bits() {
        let flags = AccessFlags::from_bits_retain(0x8_0001);
        assert!(flags.contains(AccessFlags::PUBLIC));
        assert_eq!(flags.bits(), 0x8_0001);
    }
}
