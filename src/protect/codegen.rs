//! C source generation for nativized methods.
//!
//! Every nativized method becomes a bytecode array for the embedded interpreter plus a JNI
//! stub that hands its arguments to `vmInterpret`. Pool indices inside the bytecode refer to
//! the shard's symbol container, which is mirrored into C as the shard's resolver tables.
//! The interpreter's `vm.h` declares the `vm*` types used here.
use crate::dex::class::{ClassDef, Code, MethodDef};
use crate::dex::container::Container;
use crate::dex::encoded_values::IndexResolver;
use crate::dex::opcodes::{insn_units, OP_NOP};
use crate::dex::writer::{self, IndexTables};
use crate::error::{ProtectError, ProtectResult};
use crate::protect::shard::ShardConfig;
use crate::protect::strategy::RewriteStrategy;
use crate::types::internal_to_descriptor;
use log::debug;

pub const VM_HEADER: &str = "vm.h";

/// What the aggregate init source needs to know about a generated shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHandle {
    pub index: usize,
    /// C function registering the natives of one class: `void f(JNIEnv *, jint offset)`.
    pub register_function: String,
    /// Java method on the register class that reaches `register_function`.
    pub register_method: String,
    pub classes: usize,
    pub methods: usize,
}

#[derive(Debug, Clone)]
pub struct Generated {
    pub resolver: String,
    pub native: String,
    pub handle: ShardHandle,
}

pub trait CodeGenerator {
    /// Resolver tables and native functions for one shard's symbol container.
    fn generate(
        &self,
        symbols: &Container,
        shard: &ShardConfig,
        strategy: &dyn RewriteStrategy,
    ) -> ProtectResult<Generated>;

    /// `JNI_OnLoad` and the per-shard register natives bound to `register_class`.
    fn generate_init(&self, handles: &[ShardHandle], register_class: &str) -> ProtectResult<String>;
}

/// Renumber every opcode in `insns`; switch and array payloads are data and stay as they are.
pub fn rewrite_opcodes(insns: &mut [u16], strategy: &dyn RewriteStrategy) -> ProtectResult<()> {
    let mut pos = 0;
    while pos < insns.len() {
        let unit = insns[pos];
        let size = insn_units(insns, pos)?;
        let op = (unit & 0xff) as u8;
        if op != OP_NOP || unit == 0 {
            insns[pos] = (unit & 0xff00) | strategy.map(op) as u16;
        }
        pos += size;
    }
    Ok(())
}

/// A C string literal holding the modified UTF-8 form of `text`.
pub fn c_string(text: &str) -> String {
    let bytes = cesu8::to_java_cesu8(text);
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes.iter() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            // keeps `??x` from reading as a trigraph
            b'?' => out.push_str("\\?"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{:03o}", b)),
        }
    }
    out.push('"');
    out
}

fn jni_type(shorty: char) -> &'static str {
    match shorty {
        'V' => "void",
        'Z' => "jboolean",
        'B' => "jbyte",
        'C' => "jchar",
        'S' => "jshort",
        'I' => "jint",
        'J' => "jlong",
        'F' => "jfloat",
        'D' => "jdouble",
        _ => "jobject",
    }
}

fn jvalue_member(shorty: char) -> char {
    match shorty {
        'Z' | 'B' | 'C' | 'S' | 'I' | 'J' | 'F' | 'D' => shorty.to_ascii_lowercase(),
        _ => 'l',
    }
}

/// Emit `static const <ty> <name>[] = {...};` and return the expression referring to it.
/// C has no empty arrays, so an empty table is `NULL`.
fn emit_array(out: &mut String, ty: &str, name: &str, items: &[String]) -> String {
    if items.is_empty() {
        return "NULL".to_string();
    }
    out.push_str(&format!("static const {} {}[] = {{\n", ty, name));
    for item in items {
        out.push_str(&format!("    {},\n", item));
    }
    out.push_str("};\n\n");
    name.to_string()
}

fn emit_units(out: &mut String, name: &str, units: &[u16]) {
    out.push_str(&format!("static const u2 {}[] = {{\n", name));
    for row in units.chunks(8) {
        out.push_str("   ");
        for u in row {
            out.push_str(&format!(" 0x{:04x},", u));
        }
        out.push('\n');
    }
    out.push_str("};\n\n");
}

/// Writes the `vm.h` flavored glue: resolver tables, interpreter stubs, `RegisterNatives` tables.
#[derive(Debug, Clone)]
pub struct JniGlueGenerator {
    header: String,
}

impl Default for JniGlueGenerator {
    fn default() -> Self {
        JniGlueGenerator {
            header: VM_HEADER.to_string(),
        }
    }
}

impl JniGlueGenerator {
    fn resolver_source(&self, prefix: &str, tables: &IndexTables) -> ProtectResult<String> {
        let mut out = format!("#include \"{}\"\n\n", self.header);

        let strings: Vec<String> = tables.strings().iter().map(|s| c_string(s)).collect();
        let types = tables
            .types()
            .iter()
            .map(|t| -> ProtectResult<String> { Ok(tables.string_index(t)?.to_string()) })
            .collect::<ProtectResult<Vec<_>>>()?;

        let mut params = Vec::new();
        let mut protos = Vec::new();
        for proto in tables.protos() {
            let list = tables.type_list(&proto.params)?;
            protos.push(format!(
                "{{{}, {}, {}, {}}}",
                tables.string_index(&proto.shorty())?,
                tables.type_index(&proto.return_type)?,
                params.len(),
                list.len()
            ));
            params.extend(list.into_iter().map(|i| i.to_string()));
        }

        let fields = tables
            .fields()
            .iter()
            .map(|f| -> ProtectResult<String> {
                Ok(format!(
                    "{{{}, {}, {}}}",
                    tables.type_index(&f.class)?,
                    tables.type_index(&f.ty)?,
                    tables.string_index(&f.name)?
                ))
            })
            .collect::<ProtectResult<Vec<_>>>()?;
        let methods = tables
            .methods()
            .iter()
            .map(|m| -> ProtectResult<String> {
                Ok(format!(
                    "{{{}, {}, {}}}",
                    tables.type_index(&m.class)?,
                    tables.proto_index(&m.proto)?,
                    tables.string_index(&m.name)?
                ))
            })
            .collect::<ProtectResult<Vec<_>>>()?;

        let strings_ref = emit_array(&mut out, "char *const", &format!("{}_strings", prefix), &strings);
        let types_ref = emit_array(&mut out, "u4", &format!("{}_types", prefix), &types);
        let protos_ref = emit_array(&mut out, "vmProtoId", &format!("{}_protos", prefix), &protos);
        let params_ref = emit_array(&mut out, "u4", &format!("{}_proto_params", prefix), &params);
        let fields_ref = emit_array(&mut out, "vmFieldId", &format!("{}_fields", prefix), &fields);
        let methods_ref = emit_array(&mut out, "vmMethodId", &format!("{}_methods", prefix), &methods);

        out.push_str(&format!("const vmResolver {}_resolver = {{\n", prefix));
        out.push_str(&format!("    .strings = {},\n    .stringCount = {},\n", strings_ref, strings.len()));
        out.push_str(&format!("    .types = {},\n    .typeCount = {},\n", types_ref, types.len()));
        out.push_str(&format!("    .protos = {},\n    .protoCount = {},\n", protos_ref, protos.len()));
        out.push_str(&format!("    .protoParams = {},\n", params_ref));
        out.push_str(&format!("    .fields = {},\n    .fieldCount = {},\n", fields_ref, fields.len()));
        out.push_str(&format!("    .methods = {},\n    .methodCount = {},\n", methods_ref, methods.len()));
        out.push_str("};\n");
        Ok(out)
    }

    fn code_struct(
        &self,
        out: &mut String,
        name: &str,
        code: &Code,
        tables: &IndexTables,
        strategy: &dyn RewriteStrategy,
    ) -> ProtectResult<()> {
        let mut insns = writer::resolve_insns(code, tables)?;
        rewrite_opcodes(&mut insns, strategy)?;
        let insns_name = format!("{}_insns", name);
        emit_units(out, &insns_name, &insns);

        let mut tries = Vec::new();
        let mut handlers = Vec::new();
        for t in &code.tries {
            tries.push(format!(
                "{{{}, {}, {}, {}, {}}}",
                t.start,
                t.count,
                t.catch_all.map_or(-1i64, i64::from),
                handlers.len(),
                t.handlers.len()
            ));
            for h in &t.handlers {
                handlers.push(format!("{{{}, {}}}", tables.type_index(&h.exception)?, h.address));
            }
        }
        let tries_ref = emit_array(out, "vmTry", &format!("{}_tries", name), &tries);
        let handlers_ref = emit_array(out, "vmCatch", &format!("{}_handlers", name), &handlers);

        out.push_str(&format!("static const vmCode {} = {{\n", name));
        out.push_str(&format!(
            "    .registersSize = {},\n    .insSize = {},\n    .outsSize = {},\n",
            code.registers, code.ins, code.outs
        ));
        out.push_str(&format!("    .insnsSize = {},\n    .insns = {},\n", insns.len(), insns_name));
        out.push_str(&format!(
            "    .triesSize = {},\n    .tries = {},\n    .handlers = {},\n",
            tries.len(),
            tries_ref,
            handlers_ref
        ));
        out.push_str("};\n\n");
        Ok(())
    }

    fn stub(&self, out: &mut String, prefix: &str, fn_name: &str, code_name: &str, method: &MethodDef) {
        let shorty: Vec<char> = method.method.proto.shorty().chars().collect();
        let ret = shorty[0];
        let mut params = vec![
            "JNIEnv *env".to_string(),
            if method.is_static() { "jclass clazz" } else { "jobject thiz" }.to_string(),
        ];
        let mut args = Vec::new();
        if !method.is_static() {
            args.push(('l', "thiz".to_string()));
        }
        for (i, &c) in shorty[1..].iter().enumerate() {
            params.push(format!("{} p{}", jni_type(c), i));
            args.push((jvalue_member(c), format!("p{}", i)));
        }

        out.push_str(&format!("/* {} */\n", method.method));
        out.push_str(&format!("static {} JNICALL {}({}) {{\n", jni_type(ret), fn_name, params.join(", ")));
        let args_expr = if args.is_empty() {
            "NULL"
        } else {
            out.push_str(&format!("    jvalue args[{}];\n", args.len()));
            for (i, (member, value)) in args.iter().enumerate() {
                out.push_str(&format!("    args[{}].{} = {};\n", i, member, value));
            }
            "args"
        };
        let call = format!("vmInterpret(env, &{}, &{}_resolver, {})", code_name, prefix, args_expr);
        if ret == 'V' {
            out.push_str(&format!("    {};\n", call));
        } else {
            out.push_str(&format!("    jvalue result = {};\n", call));
            out.push_str(&format!("    return result.{};\n", jvalue_member(ret)));
        }
        out.push_str("}\n\n");
    }
}

impl CodeGenerator for JniGlueGenerator {
    fn generate(
        &self,
        symbols: &Container,
        shard: &ShardConfig,
        strategy: &dyn RewriteStrategy,
    ) -> ProtectResult<Generated> {
        let prefix = format!("shard{}", shard.index);
        let tables = writer::index_tables(symbols.classes())?;
        let resolver = self.resolver_source(&prefix, &tables)?;

        let mut native = format!(
            "#include <jni.h>\n#include \"{}\"\n\nextern const vmResolver {}_resolver;\n\n",
            self.header, prefix
        );
        let mut class_tables = Vec::new();
        let mut method_count = 0usize;
        for (offset, name) in shard.native_classes().iter().enumerate() {
            let descriptor = internal_to_descriptor(name);
            let class: &ClassDef = symbols.get(&descriptor).ok_or_else(|| {
                ProtectError::invariant(format!("native class {} has no symbol definition", descriptor))
            })?;
            let mut entries = Vec::new();
            for method in class.methods() {
                let code = method.code.as_ref().ok_or_else(|| {
                    ProtectError::invariant(format!("symbol method {} has no code", method.method))
                })?;
                let code_name = format!("{}_code_{}", prefix, method_count);
                let fn_name = format!("{}_native_{}", prefix, method_count);
                self.code_struct(&mut native, &code_name, code, &tables, strategy)?;
                self.stub(&mut native, &prefix, &fn_name, &code_name, method);
                entries.push(format!(
                    "{{{}, {}, (void *) {}}}",
                    c_string(&method.method.name),
                    c_string(&method.method.proto.to_string()),
                    fn_name
                ));
                method_count += 1;
            }
            let table = format!("{}_class_{}", prefix, offset);
            emit_array(&mut native, "JNINativeMethod", &table, &entries);
            class_tables.push((name.clone(), table, entries.len()));
        }

        let classes: Vec<String> = class_tables.iter().map(|(n, _, _)| c_string(n)).collect();
        let tables_list: Vec<String> = class_tables.iter().map(|(_, t, _)| t.clone()).collect();
        let counts: Vec<String> = class_tables.iter().map(|(_, _, c)| c.to_string()).collect();
        let classes_ref = emit_array(&mut native, "char *const", &format!("{}_class_names", prefix), &classes);
        let tables_ref = emit_array(&mut native, "JNINativeMethod *const", &format!("{}_class_tables", prefix), &tables_list);
        let counts_ref = emit_array(&mut native, "jint", &format!("{}_class_counts", prefix), &counts);

        let register_function = format!("{}_register", prefix);
        native.push_str(&format!("void {}(JNIEnv *env, jint offset) {{\n", register_function));
        native.push_str(&format!("    if (offset < 0 || offset >= {}) {{\n        return;\n    }}\n", class_tables.len()));
        if !class_tables.is_empty() {
            native.push_str(&format!("    jclass clazz = (*env)->FindClass(env, {}[offset]);\n", classes_ref));
            native.push_str("    if (clazz == NULL) {\n        return;\n    }\n");
            native.push_str(&format!(
                "    (*env)->RegisterNatives(env, clazz, {}[offset], {}[offset]);\n",
                tables_ref, counts_ref
            ));
            native.push_str("    (*env)->DeleteLocalRef(env, clazz);\n");
        }
        native.push_str("}\n");

        debug!("{}: {} classes, {} native methods", shard.name, class_tables.len(), method_count);
        Ok(Generated {
            resolver,
            native,
            handle: ShardHandle {
                index: shard.index,
                register_function,
                register_method: shard.register_method.clone(),
                classes: class_tables.len(),
                methods: method_count,
            },
        })
    }

    fn generate_init(&self, handles: &[ShardHandle], register_class: &str) -> ProtectResult<String> {
        let mut out = String::from("#include <jni.h>\n\n");
        for h in handles {
            out.push_str(&format!("void {}(JNIEnv *env, jint offset);\n", h.register_function));
        }
        out.push('\n');
        let mut entries = Vec::new();
        for h in handles {
            let fn_name = format!("init_{}", h.register_method);
            out.push_str(&format!(
                "static void JNICALL {}(JNIEnv *env, jclass clazz, jint offset) {{\n    {}(env, offset);\n}}\n\n",
                fn_name, h.register_function
            ));
            entries.push(format!("{{{}, \"(I)V\", (void *) {}}}", c_string(&h.register_method), fn_name));
        }
        let methods_ref = emit_array(&mut out, "JNINativeMethod", "init_methods", &entries);

        out.push_str("JNIEXPORT jint JNICALL JNI_OnLoad(JavaVM *vm, void *reserved) {\n");
        out.push_str("    JNIEnv *env = NULL;\n");
        out.push_str("    if ((*vm)->GetEnv(vm, (void **) &env, JNI_VERSION_1_6) != JNI_OK) {\n        return JNI_ERR;\n    }\n");
        if !entries.is_empty() {
            out.push_str(&format!("    jclass clazz = (*env)->FindClass(env, {});\n", c_string(register_class)));
            out.push_str("    if (clazz == NULL) {\n        return JNI_ERR;\n    }\n");
            out.push_str(&format!(
                "    if ((*env)->RegisterNatives(env, clazz, {}, {}) != JNI_OK) {{\n        return JNI_ERR;\n    }}\n",
                methods_ref,
                entries.len()
            ));
            out.push_str("    (*env)->DeleteLocalRef(env, clazz);\n");
        }
        out.push_str("    return JNI_VERSION_1_6;\n}\n");
        Ok(out)
    }
}
