//! Acceptance policies: which classes and methods get moved into native code.
use crate::config::FilterConfig;
use crate::dex::class::{ClassDef, MethodDef};
use crate::error::{ProtectError, ProtectResult};
use crate::types::{descriptor_to_java, AccessFlags};
use log::debug;
use regex::Regex;

pub trait AcceptancePolicy {
    fn accept_class(&self, class: &ClassDef) -> bool;
    fn accept_method(&self, method: &MethodDef) -> bool;
}

/// Nativize every method that is structurally eligible.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl AcceptancePolicy for AcceptAll {
    fn accept_class(&self, _class: &ClassDef) -> bool {
        true
    }

    fn accept_method(&self, _method: &MethodDef) -> bool {
        true
    }
}

/// Leave everything as bytecode.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptNone;

impl AcceptancePolicy for AcceptNone {
    fn accept_class(&self, _class: &ClassDef) -> bool {
        false
    }

    fn accept_method(&self, _method: &MethodDef) -> bool {
        false
    }
}

/// Methods that can become native at all, whatever the policy says.
///
/// A method needs a body to move, and constructors stay in bytecode because `<clinit>`
/// carries the register-natives call.
pub fn is_eligible(method: &MethodDef) -> bool {
    method.code.is_some()
        && !method.method.is_constructor()
        && !method.access.intersects(AccessFlags::ABSTRACT | AccessFlags::NATIVE)
}

/// Include/exclude rules over dotted class names and method names.
#[derive(Debug, Clone)]
pub struct RuleFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    exclude_methods: Vec<Regex>,
}

fn compile(patterns: &[String]) -> ProtectResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|source| ProtectError::Pattern {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

impl RuleFilter {
    pub fn from_config(config: &FilterConfig) -> ProtectResult<Self> {
        Ok(RuleFilter {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
            exclude_methods: compile(&config.exclude_methods)?,
        })
    }
}

impl AcceptancePolicy for RuleFilter {
    fn accept_class(&self, class: &ClassDef) -> bool {
        // Interfaces and annotations have nothing worth moving
        if class.access.intersects(AccessFlags::INTERFACE | AccessFlags::ANNOTATION) {
            return false;
        }
        let Some(name) = descriptor_to_java(&class.descriptor) else {
            return false;
        };
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(&name));
        let accepted = included && !self.exclude.iter().any(|r| r.is_match(&name));
        if !accepted {
            debug!("class {} left as bytecode", name);
        }
        accepted
    }

    fn accept_method(&self, method: &MethodDef) -> bool {
        !method.access.contains(AccessFlags::BRIDGE)
            && !method.access.contains(AccessFlags::SYNTHETIC)
            && !self.exclude_methods.iter().any(|r| r.is_match(&method.method.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::class::CodeBuilder;
    use crate::types::{MethodRef, Proto};

    fn class(desc: &str) -> ClassDef {
        ClassDef::new(desc, AccessFlags::PUBLIC, Some("Ljava/lang/Object;"))
    }

    fn method(name: &str, access: AccessFlags) -> MethodDef {
        MethodDef::new(
            MethodRef::new("La/B;", name, Proto::new("V", &[])),
            access,
            Some(CodeBuilder::new().return_void().build(0)),
        )
    }

    fn filter(include: &[&str], exclude: &[&str], methods: &[&str]) -> RuleFilter {
        let to_vec = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        RuleFilter::from_config(&FilterConfig {
            include: to_vec(include),
            exclude: to_vec(exclude),
            exclude_methods: to_vec(methods),
        })
        .unwrap()
    }

    #[test]
    fn class_rules_use_dotted_names() {
        let f = filter(&[r"^com\.example\."], &[r"\.BuildConfig$"], &[]);
        assert!(f.accept_class(&class("Lcom/example/Main;")));
        assert!(!f.accept_class(&class("Lcom/example/BuildConfig;")));
        assert!(!f.accept_class(&class("Lorg/other/Main;")));

        let mut iface = class("Lcom/example/Api;");
        iface.access |= AccessFlags::INTERFACE | AccessFlags::ABSTRACT;
        assert!(!f.accept_class(&iface));
    }

    #[test]
    fn empty_include_accepts_everything() {
        let f = filter(&[], &[], &[]);
        assert!(f.accept_class(&class("Lanything/At/All;")));
    }

    #[test]
    fn method_rules() {
        let f = filter(&[], &[], &["^toString$"]);
        assert!(f.accept_method(&method("run", AccessFlags::PUBLIC)));
        assert!(!f.accept_method(&method("toString", AccessFlags::PUBLIC)));
        assert!(!f.accept_method(&method("access$000", AccessFlags::STATIC | AccessFlags::SYNTHETIC)));
        assert!(!f.accept_method(&method("bridge", AccessFlags::PUBLIC | AccessFlags::BRIDGE)));
    }

    #[test]
    fn eligibility() {
        assert!(is_eligible(&method("run", AccessFlags::PUBLIC)));
        assert!(!is_eligible(&method("<init>", AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR)));
        assert!(!is_eligible(&method("<clinit>", AccessFlags::STATIC | AccessFlags::CONSTRUCTOR)));
        let mut abstract_method = method("run", AccessFlags::PUBLIC | AccessFlags::ABSTRACT);
        abstract_method.code = None;
        assert!(!is_eligible(&abstract_method));
    }

    #[test]
    fn bad_patterns_are_reported() {
        let err = RuleFilter::from_config(&FilterConfig {
            include: vec!["(".into()],
            ..FilterConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, ProtectError::Pattern { .. }));
    }
}
