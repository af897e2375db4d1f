//! Making the application class load the native library before anything else runs.
use crate::dex::class::{ClassDef, CodeBuilder, MethodDef};
use crate::dex::container::Container;
use crate::dex::error::DexResultExt;
use crate::error::{IoResultExt, ProtectError, ProtectResult};
use crate::protect::resolver::MainClasses;
use crate::protect::shard::GlobalConfig;
use crate::protect::trampoline::inject_load_library;
use crate::protect::PLATFORM_APPLICATION_TYPE;
use crate::types::{descriptor_to_java, internal_to_descriptor, AccessFlags, MethodRef, Proto};
use log::{info, warn};
use std::fs;
use std::path::Path;

/// Application class synthesized when the app declares none of its own.
pub const LOAD_LIB_APP: &str = "Lcom/dexnative/protect/LoadLibApp;";

/// Which class ended up loading the native library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    /// An existing class of the app; the manifest stays as it is.
    Existing(String),
    /// `LOAD_LIB_APP` was added and the manifest must name it.
    Synthesized(String),
}

impl EntryPoint {
    pub fn descriptor(&self) -> &str {
        match self {
            EntryPoint::Existing(d) | EntryPoint::Synthesized(d) => d,
        }
    }

    /// Dotted class name for the manifest.
    pub fn class_name(&self) -> String {
        descriptor_to_java(self.descriptor()).unwrap_or_default()
    }
}

/// The chain class that receives the `loadLibrary` call.
///
/// That is the direct subclass of the platform application class. When the chain ends at a
/// class outside the app, the topmost ancestor the container defines is used instead.
fn library_loader<'a>(container: &Container, main: &'a MainClasses) -> Option<&'a str> {
    let direct = main.chain.iter().find(|d| {
        container
            .get(d)
            .and_then(|c| c.superclass.as_deref())
            .is_some_and(|s| s == PLATFORM_APPLICATION_TYPE)
    });
    if let Some(direct) = direct {
        return Some(direct);
    }
    let topmost = main.chain.iter().rev().find(|d| container.contains(d))?;
    warn!(
        "{} does not extend {} directly, loading the native library from it",
        topmost, PLATFORM_APPLICATION_TYPE
    );
    Some(topmost)
}

/// `public class LoadLibApp extends Application` whose initializer loads `library`.
pub fn synthesize_load_lib_app(library: &str) -> ProtectResult<ClassDef> {
    let mut class = ClassDef::new(LOAD_LIB_APP, AccessFlags::PUBLIC, Some(PLATFORM_APPLICATION_TYPE));
    let super_init = MethodRef::new(PLATFORM_APPLICATION_TYPE, "<init>", Proto::new("V", &[]));
    class.add_method(MethodDef::new(
        MethodRef::new(LOAD_LIB_APP, "<init>", Proto::new("V", &[])),
        AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
        Some(CodeBuilder::new().invoke_direct(&[0], super_init).return_void().build(1)),
    ));
    inject_load_library(&class, library)
}

/// The class declaring `public static native void initClassN(int)` for every shard.
pub fn register_natives_class(global: &GlobalConfig) -> ProtectResult<ClassDef> {
    let first = global
        .shards
        .first()
        .ok_or_else(|| ProtectError::invariant("no shards to register natives for"))?;
    let descriptor = internal_to_descriptor(&first.register_class);
    let mut class = ClassDef::new(
        &descriptor,
        AccessFlags::PUBLIC | AccessFlags::FINAL,
        Some("Ljava/lang/Object;"),
    );
    for shard in &global.shards {
        class.add_method(MethodDef::new(
            MethodRef::new(&descriptor, &shard.register_method, Proto::new("V", &["I"])),
            AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::NATIVE,
            None,
        ));
    }
    Ok(class)
}

/// The primary container with the library load in place and the register class added.
pub fn rewrite_container(
    container: &Container,
    main: &MainClasses,
    global: &GlobalConfig,
    library: &str,
) -> ProtectResult<(Container, EntryPoint)> {
    let register = register_natives_class(global)?;
    if container.contains(&register.descriptor) {
        return Err(ProtectError::invariant(format!(
            "{} already exists, the input looks protected already",
            register.descriptor
        )));
    }

    let mut rewritten = container.clone();
    let entry = match library_loader(container, main) {
        Some(descriptor) => {
            let class = container
                .get(descriptor)
                .ok_or_else(|| ProtectError::invariant(format!("{} vanished from the container", descriptor)))?;
            rewritten.replace(inject_load_library(class, library)?)?;
            EntryPoint::Existing(descriptor.to_string())
        }
        None if !main.is_platform_root() => {
            return Err(ProtectError::invariant(format!(
                "application class {} is declared by the manifest but defined in no container",
                main.application_name()
            )));
        }
        None => {
            if rewritten.contains(LOAD_LIB_APP) {
                return Err(ProtectError::invariant(format!("{} already exists", LOAD_LIB_APP)));
            }
            rewritten.intern(synthesize_load_lib_app(library)?)?;
            EntryPoint::Synthesized(LOAD_LIB_APP.to_string())
        }
    };
    rewritten.intern(register)?;
    if rewritten.pool_counts().exceeds(crate::dex::DEX_INDEX_LIMIT) {
        return Err(ProtectError::invariant(format!(
            "primary container overflows after adding the loader ({})",
            rewritten.pool_counts()
        )));
    }
    Ok((rewritten, entry))
}

/// Rewrite the primary container file in place.
///
/// The replacement is written next to it, the original deleted and the replacement renamed.
/// A failed rename at that point leaves no primary container behind and is reported as such.
pub fn rewrite_primary(
    path: &Path,
    main: &MainClasses,
    global: &GlobalConfig,
    library: &str,
) -> ProtectResult<EntryPoint> {
    let bytes = fs::read(path).at_path(path)?;
    let container = Container::from_bytes(&bytes).context(|| path.display().to_string())?;
    let (rewritten, entry) = rewrite_container(&container, main, global, library)?;

    let temp = path.with_file_name(".temp.dex");
    fs::write(&temp, rewritten.to_bytes()?).at_path(&temp)?;
    fs::remove_file(path).at_path(path)?;
    fs::rename(&temp, path).map_err(|source| ProtectError::PrimaryContainerLost {
        path: path.to_path_buf(),
        source,
    })?;
    info!("native library is loaded by {}", entry.descriptor());
    Ok(entry)
}
