//! Reassembly of the native containers into size-bounded output containers.
use crate::dex::class::ClassDef;
use crate::dex::container::Container;
use crate::error::{IoResultExt, ProtectError, ProtectResult};
use crate::protect::index::ClassIndex;
use crate::protect::resolver::MainClasses;
use crate::protect::shard::{GlobalConfig, ShardConfig};
use crate::protect::trampoline::inject_trampoline;
use crate::types::internal_name;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// `classes.dex`, `classes2.dex`, `classes3.dex`, ...
pub fn container_file_name(position: usize) -> String {
    if position == 0 {
        "classes.dex".to_string()
    } else {
        format!("classes{}.dex", position + 1)
    }
}

/// The class as it goes into an output container: with the register call when it has natives.
fn prepare(class: &ClassDef, shard: &ShardConfig) -> ProtectResult<ClassDef> {
    let offset = internal_name(&class.descriptor).and_then(|name| shard.offset_of(name));
    match offset {
        Some(offset) => inject_trampoline(class, offset, &shard.register_method_ref()),
        None => Ok(class.clone()),
    }
}

/// Owns the working container and the finished ones.
struct Accumulator {
    capacity: usize,
    working: Container,
    finished: Vec<Container>,
}

impl Accumulator {
    fn new(capacity: usize) -> Self {
        Accumulator {
            capacity,
            working: Container::new(capacity),
            finished: Vec::new(),
        }
    }

    /// Intern into the working container, finishing it first if `class` would not fit.
    fn add(&mut self, class: ClassDef) -> ProtectResult<()> {
        if self.working.would_overflow(&class) {
            if self.working.is_empty() {
                return Err(ProtectError::invariant(format!(
                    "{} alone exceeds the pool capacity of {} ({})",
                    class.descriptor,
                    self.capacity,
                    self.working.counts_with(&class)
                )));
            }
            self.finish_working();
        }
        self.working.intern(class)?;
        Ok(())
    }

    /// Intern into the working container, which must not need splitting.
    fn add_main(&mut self, class: ClassDef) -> ProtectResult<()> {
        if self.working.would_overflow(&class) {
            return Err(ProtectError::invariant(format!(
                "main classes exceed the pool capacity of {} at {}",
                self.capacity, class.descriptor
            )));
        }
        self.working.intern(class)?;
        Ok(())
    }

    fn finish_working(&mut self) {
        let full = std::mem::replace(&mut self.working, Container::new(self.capacity));
        debug!("container {} full: {}", self.finished.len() + 1, full.pool_counts());
        self.finished.push(full);
    }

    fn finish(mut self) -> Vec<Container> {
        if !self.working.is_empty() {
            self.finish_working();
        }
        self.finished
    }
}

/// Merge every shard into containers of at most `capacity` entries per pool.
///
/// Main classes go first so that they all land in the first container.
pub fn assemble(
    index: &ClassIndex,
    global: &GlobalConfig,
    main: &MainClasses,
    capacity: usize,
) -> ProtectResult<Vec<Container>> {
    if index.shards().len() != global.shards.len() {
        return Err(ProtectError::invariant(format!(
            "{} native containers for {} shards",
            index.shards().len(),
            global.shards.len()
        )));
    }
    let mut acc = Accumulator::new(capacity);

    for (i, (container, shard)) in index.shards().iter().zip(&global.shards).enumerate() {
        for class in container.classes() {
            if main.contains(&class.descriptor) && index.is_owner(i, &class.descriptor) {
                acc.add_main(prepare(class, shard)?)?;
            }
        }
    }

    for (i, (container, shard)) in index.shards().iter().zip(&global.shards).enumerate() {
        for class in container.classes() {
            if main.contains(&class.descriptor) {
                continue;
            }
            if !index.is_owner(i, &class.descriptor) {
                warn!("dropping duplicate definition of {} from {}", class.descriptor, shard.name);
                continue;
            }
            acc.add(prepare(class, shard)?)?;
        }
    }

    let containers = acc.finish();
    if containers.is_empty() {
        return Err(ProtectError::invariant("assembly produced no containers"));
    }
    info!("assembled {} output containers", containers.len());
    Ok(containers)
}

/// Serialize `containers` into `dir` under their multidex names.
pub fn write_containers(containers: &[Container], dir: &Path) -> ProtectResult<Vec<PathBuf>> {
    fs::create_dir_all(dir).at_path(dir)?;
    let mut files = Vec::with_capacity(containers.len());
    for (i, container) in containers.iter().enumerate() {
        let path = dir.join(container_file_name(i));
        fs::write(&path, container.to_bytes()?).at_path(&path)?;
        files.push(path);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::class::{CodeBuilder, MethodDef};
    use crate::protect::resolver::ChainEnd;
    use crate::types::{AccessFlags, MethodRef, Proto};

    fn class(desc: &str, sup: &str, calls: usize) -> ClassDef {
        let mut class = ClassDef::new(desc, AccessFlags::PUBLIC, Some(sup));
        let mut code = CodeBuilder::new();
        for i in 0..calls {
            let target = MethodRef::new(desc, &format!("call{}", i), Proto::new("V", &[]));
            code = code.invoke_static(&[], target);
        }
        class.add_method(MethodDef::new(
            MethodRef::new(desc, "run", Proto::new("V", &[])),
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            Some(code.return_void().build(0)),
        ));
        class
    }

    fn container(classes: Vec<ClassDef>) -> Container {
        let mut c = Container::default();
        for class in classes {
            c.intern(class).unwrap();
        }
        c
    }

    fn global(natives: &[Vec<&str>]) -> GlobalConfig {
        let dir = PathBuf::from("/work");
        let shards = natives
            .iter()
            .enumerate()
            .map(|(i, names)| {
                ShardConfig::new(
                    i,
                    &container_file_name(i).replace(".dex", ""),
                    &dir,
                    &dir,
                    "com/dexnative/protect/NativeUtil",
                    &format!("initClass{}", i),
                )
                .with_native_classes(names.iter().map(|s| s.to_string()).collect())
            })
            .collect();
        GlobalConfig {
            shards,
            handles: Vec::new(),
            jni_init: dir.join("jni_init.c"),
        }
    }

    fn no_main() -> MainClasses {
        MainClasses::new(vec!["Lnone/App;".into()], ChainEnd::Unresolved("Lnone/App;".into()))
    }

    fn descriptors(containers: &[Container]) -> Vec<Vec<String>> {
        containers
            .iter()
            .map(|c| c.classes().iter().map(|k| k.descriptor.clone()).collect())
            .collect()
    }

    #[test]
    fn main_classes_come_first() {
        let index = ClassIndex::new(vec![
            container(vec![class("La/One;", "Ljava/lang/Object;", 0), class("La/Base;", "Landroid/app/Application;", 0)]),
            container(vec![class("La/App;", "La/Base;", 0)]),
        ]);
        let main = MainClasses::new(vec!["La/App;".into(), "La/Base;".into()], ChainEnd::PlatformRoot);
        let out = assemble(&index, &global(&[vec![], vec![]]), &main, 60000).unwrap();
        assert_eq!(descriptors(&out), vec![vec!["La/Base;", "La/App;", "La/One;"]]);
    }

    #[test]
    fn native_classes_get_their_trampoline() {
        let index = ClassIndex::new(vec![container(vec![
            class("La/Plain;", "Ljava/lang/Object;", 0),
            class("La/Native;", "Ljava/lang/Object;", 0),
        ])]);
        let out = assemble(&index, &global(&[vec!["a/Native"]]), &no_main(), 60000).unwrap();
        let native = out[0].get("La/Native;").unwrap();
        assert!(native.methods().any(|m| m.is_class_initializer()));
        let plain = out[0].get("La/Plain;").unwrap();
        assert!(!plain.methods().any(|m| m.is_class_initializer()));
    }

    #[test]
    fn splits_on_capacity() {
        let classes: Vec<ClassDef> = (0..6)
            .map(|i| class(&format!("La/C{};", i), "Ljava/lang/Object;", 4))
            .collect();
        let index = ClassIndex::new(vec![container(classes)]);
        let out = assemble(&index, &global(&[vec![]]), &no_main(), 20).unwrap();
        assert!(out.len() > 1);
        for c in &out {
            assert!(!c.pool_counts().exceeds(20), "{}", c.pool_counts());
        }
        let total: usize = out.iter().map(|c| c.len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn oversized_class_is_fatal() {
        let index = ClassIndex::new(vec![container(vec![class("La/Big;", "Ljava/lang/Object;", 30)])]);
        let err = assemble(&index, &global(&[vec![]]), &no_main(), 20).unwrap_err();
        assert!(matches!(err, ProtectError::Invariant(_)));
    }

    #[test]
    fn empty_input_is_fatal() {
        let index = ClassIndex::new(vec![container(vec![])]);
        assert!(assemble(&index, &global(&[vec![]]), &no_main(), 20).is_err());
    }

    #[test]
    fn duplicates_keep_the_first_definition() {
        let index = ClassIndex::new(vec![
            container(vec![class("La/Dup;", "Ljava/lang/Object;", 0)]),
            container(vec![class("La/Dup;", "Ljava/lang/Object;", 1)]),
        ]);
        let out = assemble(&index, &global(&[vec![], vec![]]), &no_main(), 60000).unwrap();
        assert_eq!(descriptors(&out), vec![vec!["La/Dup;"]]);
        let kept = out[0].get("La/Dup;").unwrap();
        assert!(kept.direct_methods[0].code.as_ref().unwrap().refs.is_empty());
    }

    #[test]
    fn file_names() {
        assert_eq!(container_file_name(0), "classes.dex");
        assert_eq!(container_file_name(1), "classes2.dex");
        assert_eq!(container_file_name(9), "classes10.dex");
    }
}
