//! Class initializer prefixes that bind native methods and load the native library.
use crate::dex::class::{ClassDef, CodeBuilder};
use crate::error::{ProtectError, ProtectResult};
use crate::types::{MethodRef, Proto};

pub const SYSTEM_TYPE: &str = "Ljava/lang/System;";

/// Run `prefix` before the existing body of the class initializer, creating one if needed.
pub fn prepend_to_class_initializer(class: &mut ClassDef, prefix: CodeBuilder) -> ProtectResult<()> {
    let descriptor = class.descriptor.clone();
    let clinit = class.ensure_class_initializer();
    let code = clinit
        .code
        .as_mut()
        .ok_or_else(|| ProtectError::invariant(format!("class initializer of {} has no code", descriptor)))?;
    code.prepend(prefix)?;
    Ok(())
}

/// `const v0, offset; invoke-static {v0}, register` ahead of the original `<clinit>`.
pub fn inject_trampoline(class: &ClassDef, offset: usize, register: &MethodRef) -> ProtectResult<ClassDef> {
    let offset = i32::try_from(offset)
        .map_err(|_| ProtectError::invariant(format!("native class offset {} out of range", offset)))?;
    let mut class = class.clone();
    let prefix = CodeBuilder::new()
        .const_int(0, offset)
        .invoke_static(&[0], register.clone());
    prepend_to_class_initializer(&mut class, prefix)?;
    Ok(class)
}

pub fn load_library_method() -> MethodRef {
    MethodRef::new(SYSTEM_TYPE, "loadLibrary", Proto::new("V", &["Ljava/lang/String;"]))
}

/// `System.loadLibrary(library)` as the very first thing the class initializer does.
pub fn inject_load_library(class: &ClassDef, library: &str) -> ProtectResult<ClassDef> {
    let mut class = class.clone();
    let prefix = CodeBuilder::new()
        .const_string_jumbo(0, library)
        .invoke_static(&[0], load_library_method());
    prepend_to_class_initializer(&mut class, prefix)?;
    Ok(class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::class::{MethodDef, RefTarget};
    use crate::dex::opcodes::{OP_CONST, OP_CONST_STRING_JUMBO, OP_INVOKE_STATIC, OP_RETURN_VOID};
    use crate::types::AccessFlags;

    fn register() -> MethodRef {
        MethodRef::new("Lcom/dexnative/protect/NativeUtil;", "initClass1", Proto::new("V", &["I"]))
    }

    fn class_with_clinit() -> ClassDef {
        let mut class = ClassDef::new("Lcom/a/B;", AccessFlags::PUBLIC, Some("Ljava/lang/Object;"));
        let setup = MethodRef::new("Lcom/a/B;", "setup", Proto::new("V", &[]));
        class.add_method(MethodDef::new(
            MethodRef::new("Lcom/a/B;", "<clinit>", Proto::new("V", &[])),
            AccessFlags::STATIC | AccessFlags::CONSTRUCTOR,
            Some(CodeBuilder::new().invoke_static(&[], setup).return_void().build(0)),
        ));
        class
    }

    fn opcodes_of(class: &ClassDef) -> Vec<u8> {
        let code = class.direct_methods[0].code.as_ref().unwrap();
        let mut ops = Vec::new();
        let mut pos = 0;
        while pos < code.insns.len() {
            ops.push((code.insns[pos] & 0xff) as u8);
            pos += crate::dex::opcodes::insn_units(&code.insns, pos).unwrap();
        }
        ops
    }

    #[test]
    fn trampoline_runs_before_the_original_body() {
        let class = inject_trampoline(&class_with_clinit(), 4, &register()).unwrap();
        assert_eq!(
            opcodes_of(&class),
            vec![OP_CONST, OP_INVOKE_STATIC, OP_INVOKE_STATIC, OP_RETURN_VOID]
        );
        let code = class.direct_methods[0].code.as_ref().unwrap();
        assert_eq!(&code.insns[1..3], &[4, 0]);
        assert_eq!(code.refs[0].target, RefTarget::Method(register()));
        assert_eq!(code.refs[1].position, 6);
        assert_eq!(class.superclass.as_deref(), Some("Ljava/lang/Object;"));
    }

    #[test]
    fn missing_class_initializer_is_synthesized() {
        let class = ClassDef::new("Lcom/a/C;", AccessFlags::PUBLIC, Some("Ljava/lang/Object;"));
        let class = inject_trampoline(&class, 0, &register()).unwrap();
        assert_eq!(class.direct_methods.len(), 1);
        assert_eq!(opcodes_of(&class), vec![OP_CONST, OP_INVOKE_STATIC, OP_RETURN_VOID]);
    }

    #[test]
    fn load_library_goes_first() {
        let class = inject_trampoline(&class_with_clinit(), 0, &register()).unwrap();
        let class = inject_load_library(&class, "dexnative").unwrap();
        assert_eq!(
            opcodes_of(&class),
            vec![
                OP_CONST_STRING_JUMBO,
                OP_INVOKE_STATIC,
                OP_CONST,
                OP_INVOKE_STATIC,
                OP_INVOKE_STATIC,
                OP_RETURN_VOID
            ]
        );
        let code = class.direct_methods[0].code.as_ref().unwrap();
        assert_eq!(code.refs[0].target, RefTarget::String("dexnative".into()));
        assert_eq!(code.refs[1].target, RefTarget::Method(load_library_method()));
    }
}
