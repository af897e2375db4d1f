//! Preparing the native source tree: the interpreter template plus build-specific fragments.
use crate::error::{IoResultExt, ProtectError, ProtectResult};
use crate::protect::strategy::RewriteStrategy;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const OPCODE_HEADER: &str = "DexOpcodes.h";
pub const VERIFIER_SOURCE: &str = "apk_verifier.c";
pub const GENERATED_SOURCES: &str = "dexnative_sources.cmake";

static OPCODE_ENUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)enum Opcode \{.*?\};").unwrap());
static GOTO_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)_name\[kNumPackedOpcodes\] = \{.*?\};").unwrap());
static PACKAGE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(#define PACKAGE_NAME) .*\n").unwrap());
const PUBLIC_KEY_PLACEHOLDER: &str = "#define publicKeyPlaceHolder";

/// Produces the data the signature verifier is compiled with.
pub trait VerifyCodeGenerator {
    fn generate(&self, package: &str) -> ProtectResult<String>;
}

/// Embeds a DER public key as a byte array.
#[derive(Debug, Clone)]
pub struct PublicKeyVerifier {
    key: Vec<u8>,
}

impl PublicKeyVerifier {
    pub fn new(key: Vec<u8>) -> Self {
        PublicKeyVerifier { key }
    }

    pub fn from_file(path: &Path) -> ProtectResult<Self> {
        Ok(Self::new(fs::read(path).at_path(path)?))
    }
}

impl VerifyCodeGenerator for PublicKeyVerifier {
    fn generate(&self, package: &str) -> ProtectResult<String> {
        if self.key.is_empty() {
            return Err(ProtectError::config("verifier public key is empty"));
        }
        let mut out = format!("/* signer of {} */\nstatic const unsigned char publicKey[] = {{\n", package);
        for row in self.key.chunks(12) {
            out.push_str("   ");
            for b in row {
                out.push_str(&format!(" 0x{:02x},", b));
            }
            out.push('\n');
        }
        out.push_str("};\n");
        out.push_str(&format!("static const unsigned int publicKeyLength = {};\n", self.key.len()));
        Ok(out)
    }
}

/// Copy `src` into `dst` recursively.
pub fn copy_tree(src: &Path, dst: &Path) -> ProtectResult<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(io::Error::from).at_path(src)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| ProtectError::invariant(format!("{} escapes {}", entry.path().display(), src.display())))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).at_path(&target)?;
        } else {
            fs::copy(entry.path(), &target).at_path(&target)?;
        }
    }
    Ok(())
}

fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.into_path())
}

/// Rewrite the opcode enum and goto table in the interpreter's opcode header.
pub fn template_opcode_header(text: &str, strategy: &dyn RewriteStrategy) -> String {
    let enum_body = format!("enum Opcode {{\n{}}};\n", strategy.opcode_enum());
    let table_body = format!(
        "_name[kNumPackedOpcodes] = {{        \\\n{}}};\n",
        strategy.goto_table()
    );
    let text = OPCODE_ENUM.replace(text, NoExpand(&enum_body));
    GOTO_TABLE.replace(&text, NoExpand(&table_body)).into_owned()
}

/// Insert the verifier data and the package name into the verifier source.
pub fn template_verifier(text: &str, fragment: &str, package: &str) -> String {
    let text = text.replacen(
        PUBLIC_KEY_PLACEHOLDER,
        &format!("{}\n{}", PUBLIC_KEY_PLACEHOLDER, fragment),
        1,
    );
    let define = format!("${{1}} \"{}\"\n", package.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "$$"));
    PACKAGE_NAME.replace(&text, define.as_str()).into_owned()
}

/// Populate `source_root` from the template directory and apply the build-specific fragments.
pub fn template_sources(
    template_dir: Option<&Path>,
    source_root: &Path,
    strategy: &dyn RewriteStrategy,
    verifier: Option<&dyn VerifyCodeGenerator>,
    package: &str,
) -> ProtectResult<()> {
    fs::create_dir_all(source_root).at_path(source_root)?;
    let Some(template_dir) = template_dir else {
        warn!("no native template directory configured, the interpreter sources must be supplied separately");
        return Ok(());
    };
    info!("copying native templates from {}", template_dir.display());
    copy_tree(template_dir, source_root)?;

    // rewritten bytecode is only runnable by an interpreter built from the same mapping
    let path = find_file(source_root, OPCODE_HEADER).ok_or_else(|| {
        ProtectError::config(format!("{} has no {}", template_dir.display(), OPCODE_HEADER))
    })?;
    let text = fs::read_to_string(&path).at_path(&path)?;
    fs::write(&path, template_opcode_header(&text, strategy)).at_path(&path)?;
    debug!("rewrote opcodes in {}", path.display());

    if let Some(verifier) = verifier {
        let path = find_file(source_root, VERIFIER_SOURCE).ok_or_else(|| {
            ProtectError::config(format!(
                "a verifier key is configured but {} has no {}",
                template_dir.display(),
                VERIFIER_SOURCE
            ))
        })?;
        let fragment = verifier.generate(package)?;
        let text = fs::read_to_string(&path).at_path(&path)?;
        fs::write(&path, template_verifier(&text, &fragment, package)).at_path(&path)?;
        debug!("wrote verifier data into {}", path.display());
    }
    Ok(())
}

/// Write the CMake fragment listing generated sources, and a default build script when the
/// template brings none.
pub fn write_build_files(source_root: &Path, library_name: &str, sources: &[PathBuf]) -> ProtectResult<()> {
    let mut list = String::from("set(DEXNATIVE_SOURCES\n");
    for source in sources {
        let rel = source.strip_prefix(source_root).unwrap_or(source);
        list.push_str(&format!("    ${{CMAKE_CURRENT_LIST_DIR}}/{}\n", rel.display()));
    }
    list.push_str(")\n");
    let list_path = source_root.join(GENERATED_SOURCES);
    fs::write(&list_path, list).at_path(&list_path)?;

    let script = source_root.join("CMakeLists.txt");
    if !script.exists() {
        let text = format!(
            "cmake_minimum_required(VERSION 3.10)\n\
             project({name} C)\n\
             include(${{CMAKE_CURRENT_SOURCE_DIR}}/{list})\n\
             file(GLOB_RECURSE VM_SOURCES ${{CMAKE_CURRENT_SOURCE_DIR}}/vm/*.c)\n\
             add_library({name} SHARED ${{DEXNATIVE_SOURCES}} ${{VM_SOURCES}})\n\
             target_include_directories({name} PRIVATE ${{CMAKE_CURRENT_SOURCE_DIR}} ${{CMAKE_CURRENT_SOURCE_DIR}}/vm)\n\
             target_link_libraries({name} log)\n",
            name = library_name,
            list = GENERATED_SOURCES,
        );
        fs::write(&script, text).at_path(&script)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::strategy::ShuffledOpcodes;

    const HEADER: &str = "#pragma once\n\
        enum Opcode {\n    OP_NOP = 0x00,\n    OP_MOVE = 0x01,\n};\n\
        #define DEFINE_GOTO_TABLE(_name) \\\n    static const void* _name[kNumPackedOpcodes] = { \\\n        H(OP_NOP), \\\n    };\n\
        int tail;\n";

    #[test]
    fn opcode_header_is_rewritten() {
        let s = ShuffledOpcodes::from_seed(3);
        let out = template_opcode_header(HEADER, &s);
        assert!(out.starts_with("#pragma once\nenum Opcode {\n"));
        assert!(out.contains(&format!("    OP_MOVE = 0x{:02x},\n", s.map(0x01))));
        assert!(out.contains("_name[kNumPackedOpcodes] = {        \\\n        H(OP_NOP),"));
        assert!(out.ends_with("int tail;\n"));
        assert_eq!(out.matches("enum Opcode").count(), 1);
    }

    #[test]
    fn verifier_gets_key_and_package() {
        let src = "#define PACKAGE_NAME \"placeholder\"\n#define publicKeyPlaceHolder\nint verify();\n";
        let fragment = PublicKeyVerifier::new(vec![0x30, 0x82]).generate("com.example").unwrap();
        let out = template_verifier(src, &fragment, "com.example");
        assert!(out.starts_with("#define PACKAGE_NAME \"com.example\"\n"));
        assert!(out.contains("#define publicKeyPlaceHolder\n/* signer of com.example */"));
        assert!(out.contains(" 0x30, 0x82,"));
        assert!(out.contains("publicKeyLength = 2;"));
        assert!(out.ends_with("int verify();\n"));
    }

    #[test]
    fn templates_are_copied_and_patched() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        fs::create_dir_all(template.join("vm")).unwrap();
        fs::write(template.join("vm").join(OPCODE_HEADER), HEADER).unwrap();
        fs::write(template.join("vm").join("interp.c"), "int x;\n").unwrap();

        let root = dir.path().join("native");
        let s = ShuffledOpcodes::from_seed(9);
        template_sources(Some(&template), &root, &s, None, "com.example").unwrap();

        let header = fs::read_to_string(root.join("vm").join(OPCODE_HEADER)).unwrap();
        assert!(header.contains(&format!("OP_MOVE = 0x{:02x},", s.map(0x01))));
        assert_eq!(fs::read_to_string(root.join("vm/interp.c")).unwrap(), "int x;\n");

        write_build_files(&root, "dexnative", &[root.join("generated/jni_init.c")]).unwrap();
        let list = fs::read_to_string(root.join(GENERATED_SOURCES)).unwrap();
        assert!(list.contains("${CMAKE_CURRENT_LIST_DIR}/generated/jni_init.c"));
        let script = fs::read_to_string(root.join("CMakeLists.txt")).unwrap();
        assert!(script.contains("add_library(dexnative SHARED"));
    }

    #[test]
    fn template_without_opcode_header_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        fs::create_dir_all(&template).unwrap();
        fs::write(template.join("interp.c"), "int x;\n").unwrap();

        let s = ShuffledOpcodes::from_seed(9);
        let err = template_sources(Some(&template), &dir.path().join("native"), &s, None, "com.example").unwrap_err();
        assert!(matches!(err, ProtectError::Config(_)), "{}", err);
    }

    #[test]
    fn verifier_needs_its_source() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        fs::create_dir_all(&template).unwrap();
        fs::write(template.join(OPCODE_HEADER), HEADER).unwrap();

        let s = ShuffledOpcodes::from_seed(9);
        let key = PublicKeyVerifier::new(vec![0x30]);
        let err = template_sources(Some(&template), &dir.path().join("a"), &s, Some(&key), "com.example").unwrap_err();
        assert!(matches!(err, ProtectError::Config(_)), "{}", err);

        fs::write(template.join(VERIFIER_SOURCE), "#define publicKeyPlaceHolder\n").unwrap();
        let root = dir.path().join("b");
        template_sources(Some(&template), &root, &s, Some(&key), "com.example").unwrap();
        assert!(fs::read_to_string(root.join(VERIFIER_SOURCE)).unwrap().contains("publicKeyLength = 1;"));
    }
}
