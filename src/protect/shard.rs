//! Per-container split into a native container and a symbol container.
use crate::dex::class::{ClassDef, FieldDef, MethodDef};
use crate::dex::container::Container;
use crate::dex::error::DexResultExt;
use crate::error::{IoResultExt, ProtectResult};
use crate::protect::codegen::{CodeGenerator, ShardHandle};
use crate::protect::filter::{is_eligible, AcceptancePolicy};
use crate::protect::strategy::RewriteStrategy;
use crate::types::{internal_name, internal_to_descriptor, AccessFlags, MethodRef, Proto};
use log::{debug, info};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const JNI_INIT_SOURCE: &str = "jni_init.c";

/// Artifacts and native class bookkeeping of one processed input container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    pub index: usize,
    /// Input file stem, `classes2` for `classes2.dex`.
    pub name: String,
    pub native_dex: PathBuf,
    pub symbol_dex: PathBuf,
    pub resolver_source: PathBuf,
    pub native_source: PathBuf,
    /// Internal name of the class declaring the register natives.
    pub register_class: String,
    pub register_method: String,
    native_classes: Vec<String>,
    offsets: HashMap<String, usize>,
}

impl ShardConfig {
    pub fn new(
        index: usize,
        name: &str,
        dex_dir: &Path,
        source_dir: &Path,
        register_class: &str,
        register_method: &str,
    ) -> Self {
        ShardConfig {
            index,
            name: name.to_string(),
            native_dex: dex_dir.join(format!("{}_native.dex", name)),
            symbol_dex: dex_dir.join(format!("{}_sym.dex", name)),
            resolver_source: source_dir.join(format!("{}_resolver.c", name)),
            native_source: source_dir.join(format!("{}_native.c", name)),
            register_class: register_class.to_string(),
            register_method: register_method.to_string(),
            native_classes: Vec::new(),
            offsets: HashMap::new(),
        }
    }

    pub fn with_native_classes(mut self, classes: Vec<String>) -> Self {
        self.offsets = classes.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect();
        self.native_classes = classes;
        self
    }

    /// Internal names (`a/b/C`) of the classes that received native methods, in offset order.
    pub fn native_classes(&self) -> &[String] {
        &self.native_classes
    }

    pub fn offset_of(&self, internal_name: &str) -> Option<usize> {
        self.offsets.get(internal_name).copied()
    }

    /// The static `(I)V` method a class initializer calls to bind its natives.
    pub fn register_method_ref(&self) -> MethodRef {
        MethodRef::new(
            &internal_to_descriptor(&self.register_class),
            &self.register_method,
            Proto::new("V", &["I"]),
        )
    }
}

/// All shards of a run plus the aggregate JNI init source.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub shards: Vec<ShardConfig>,
    pub handles: Vec<ShardHandle>,
    pub jni_init: PathBuf,
}

impl GlobalConfig {
    pub fn native_method_count(&self) -> usize {
        self.handles.iter().map(|h| h.methods).sum()
    }

    /// Every generated C source, for the build script.
    pub fn sources(&self) -> Vec<PathBuf> {
        let mut sources: Vec<PathBuf> = self
            .shards
            .iter()
            .flat_map(|s| [s.resolver_source.clone(), s.native_source.clone()])
            .collect();
        sources.push(self.jni_init.clone());
        sources
    }
}

/// Result of splitting one container.
#[derive(Debug)]
pub struct Split {
    pub native: Container,
    pub symbols: Container,
    pub native_classes: Vec<String>,
}

fn to_native(method: &MethodDef) -> MethodDef {
    let mut access = method.access | AccessFlags::NATIVE;
    if access.contains(AccessFlags::DECLARED_SYNCHRONIZED) {
        access.remove(AccessFlags::DECLARED_SYNCHRONIZED);
        access.insert(AccessFlags::SYNCHRONIZED);
    }
    MethodDef {
        access,
        code: None,
        ..method.clone()
    }
}

fn symbol_method(method: &MethodDef) -> MethodDef {
    MethodDef::new(method.method.clone(), method.access, method.code.clone())
}

/// Native and symbol variants of an accepted class; `None` when nothing in it can move.
pub fn split_class(class: &ClassDef, policy: &dyn AcceptancePolicy) -> Option<(ClassDef, ClassDef)> {
    let moves = |m: &MethodDef| is_eligible(m) && policy.accept_method(m);
    if !class.methods().any(|m| moves(m)) {
        return None;
    }

    let rewrite = |methods: &[MethodDef]| -> Vec<MethodDef> {
        methods
            .iter()
            .map(|m| if moves(m) { to_native(m) } else { m.clone() })
            .collect()
    };
    let native = ClassDef {
        direct_methods: rewrite(&class.direct_methods),
        virtual_methods: rewrite(&class.virtual_methods),
        ..class.clone()
    };

    let mut symbols = class.shell();
    for field in class.fields() {
        symbols.add_field(FieldDef::new(field.field.clone(), field.access));
    }
    symbols.direct_methods = class.direct_methods.iter().filter(|m| moves(m)).map(symbol_method).collect();
    symbols.virtual_methods = class.virtual_methods.iter().filter(|m| moves(m)).map(symbol_method).collect();
    Some((native, symbols))
}

/// Partition `container` by `policy`. Rejected classes go to the native container unchanged.
pub fn split(container: &Container, policy: &dyn AcceptancePolicy) -> ProtectResult<Split> {
    let mut native = Container::default();
    let mut symbols = Container::default();
    let mut native_classes = Vec::new();

    for class in container.classes() {
        let parts = if policy.accept_class(class) {
            split_class(class, policy)
        } else {
            None
        };
        match parts {
            Some((native_class, symbol_class)) => {
                debug!("nativizing methods of {}", class.descriptor);
                if let Some(name) = internal_name(&class.descriptor) {
                    native_classes.push(name.to_string());
                }
                native.intern(native_class)?;
                symbols.intern(symbol_class)?;
            }
            None => native.intern(class.clone())?,
        }
    }
    Ok(Split {
        native,
        symbols,
        native_classes,
    })
}

/// Drives the split and code generation over every input container.
pub struct ShardProcessor<'a> {
    pub policy: &'a dyn AcceptancePolicy,
    pub generator: &'a dyn CodeGenerator,
    pub strategy: &'a dyn RewriteStrategy,
    /// Internal name of the class the register natives are declared on.
    pub register_class: &'a str,
}

impl ShardProcessor<'_> {
    /// Split one container, write both containers, then generate its native sources.
    pub fn process(
        &self,
        index: usize,
        input: &Path,
        dex_dir: &Path,
        source_dir: &Path,
    ) -> ProtectResult<(ShardConfig, ShardHandle)> {
        let name = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("classes")
            .to_string();
        let bytes = fs::read(input).at_path(input)?;
        let container = Container::from_bytes(&bytes).context(|| input.display().to_string())?;
        let parts = split(&container, self.policy)?;

        let config = ShardConfig::new(
            index,
            &name,
            dex_dir,
            source_dir,
            self.register_class,
            &format!("initClass{}", index),
        )
        .with_native_classes(parts.native_classes);

        fs::write(&config.native_dex, parts.native.to_bytes()?).at_path(&config.native_dex)?;
        let symbol_bytes = parts.symbols.to_bytes()?;
        fs::write(&config.symbol_dex, &symbol_bytes).at_path(&config.symbol_dex)?;

        // generate from the container as written, not the in-memory one
        let symbols = Container::from_bytes(&symbol_bytes).context(|| config.symbol_dex.display().to_string())?;
        let generated = self.generator.generate(&symbols, &config, self.strategy)?;
        fs::write(&config.resolver_source, generated.resolver).at_path(&config.resolver_source)?;
        fs::write(&config.native_source, generated.native).at_path(&config.native_source)?;

        info!(
            "{}: {} classes, {} with native methods",
            name,
            container.len(),
            config.native_classes().len()
        );
        Ok((config, generated.handle))
    }

    /// Process every input in order and write the aggregate init source.
    pub fn process_all(&self, inputs: &[PathBuf], dex_dir: &Path, source_dir: &Path) -> ProtectResult<GlobalConfig> {
        fs::create_dir_all(dex_dir).at_path(dex_dir)?;
        fs::create_dir_all(source_dir).at_path(source_dir)?;
        let mut shards = Vec::with_capacity(inputs.len());
        let mut handles = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let (config, handle) = self.process(index, input, dex_dir, source_dir)?;
            shards.push(config);
            handles.push(handle);
        }

        let jni_init = source_dir.join(JNI_INIT_SOURCE);
        let init = self.generator.generate_init(&handles, self.register_class)?;
        fs::write(&jni_init, init).at_path(&jni_init)?;
        Ok(GlobalConfig {
            shards,
            handles,
            jni_init,
        })
    }
}
