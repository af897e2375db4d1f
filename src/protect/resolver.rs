//! Which classes must live in the primary container.
//!
//! The application class is instantiated before secondary containers are installed, so it and
//! every ancestor defined by the app have to be in `classes.dex`.
use crate::error::{ProtectError, ProtectResult};
use crate::protect::index::ClassIndex;
use crate::protect::PLATFORM_APPLICATION_TYPE;
use crate::types::{descriptor_to_java, java_to_descriptor};
use log::{debug, warn};
use std::collections::HashSet;

/// How the superclass walk stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEnd {
    /// The last class of the chain extends the platform application class directly.
    PlatformRoot,
    /// The descriptor is not defined by any shard; the chain ends with it.
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MainClasses {
    /// Entry class first, then its ancestors up to (excluding) the platform root.
    pub chain: Vec<String>,
    pub end: ChainEnd,
    members: HashSet<String>,
}

impl MainClasses {
    pub fn new(chain: Vec<String>, end: ChainEnd) -> Self {
        let members = chain.iter().cloned().collect();
        MainClasses { chain, end, members }
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.members.contains(descriptor)
    }

    /// The application class the manifest ends up naming, in dotted form.
    pub fn application_name(&self) -> String {
        self.chain
            .last()
            .and_then(|d| descriptor_to_java(d))
            .unwrap_or_else(|| crate::android::manifest::PLATFORM_APPLICATION.to_string())
    }

    pub fn is_platform_root(&self) -> bool {
        self.chain.last().map(String::as_str) == Some(PLATFORM_APPLICATION_TYPE)
    }
}

/// Walk superclasses from `entry_class` (dotted) until the platform root or an unknown class.
pub fn resolve_main_classes(index: &ClassIndex, entry_class: &str) -> ProtectResult<MainClasses> {
    let entry = java_to_descriptor(entry_class);
    if entry == PLATFORM_APPLICATION_TYPE {
        return Ok(MainClasses::new(vec![entry], ChainEnd::PlatformRoot));
    }

    let mut chain = vec![entry.clone()];
    let mut current = entry;
    let end = loop {
        let Some((_, class)) = index.lookup(&current) else {
            warn!("{} is not defined in any container, main class chain stops there", current);
            break ChainEnd::Unresolved(current);
        };
        let Some(superclass) = class.superclass.as_deref() else {
            warn!("{} has no superclass, main class chain stops there", current);
            break ChainEnd::Unresolved(current);
        };
        if superclass == PLATFORM_APPLICATION_TYPE {
            break ChainEnd::PlatformRoot;
        }
        if chain.iter().any(|c| c == superclass) {
            return Err(ProtectError::invariant(format!("superclass cycle through {}", superclass)));
        }
        chain.push(superclass.to_string());
        current = superclass.to_string();
    };
    debug!("main classes: {:?}", chain);
    Ok(MainClasses::new(chain, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::class::ClassDef;
    use crate::dex::container::Container;
    use crate::types::AccessFlags;

    fn container(classes: &[(&str, &str)]) -> Container {
        let mut c = Container::default();
        for (desc, sup) in classes {
            c.intern(ClassDef::new(desc, AccessFlags::PUBLIC, Some(sup))).unwrap();
        }
        c
    }

    #[test]
    fn chain_spans_shards() {
        let index = ClassIndex::new(vec![
            container(&[("Lcom/a/Base;", PLATFORM_APPLICATION_TYPE)]),
            container(&[("Lcom/a/App;", "Lcom/a/Base;")]),
        ]);
        let main = resolve_main_classes(&index, "com.a.App").unwrap();
        assert_eq!(main.chain, vec!["Lcom/a/App;", "Lcom/a/Base;"]);
        assert_eq!(main.end, ChainEnd::PlatformRoot);
        assert!(main.contains("Lcom/a/Base;"));
        assert_eq!(main.application_name(), "com.a.Base");
    }

    #[test]
    fn unknown_entry_is_a_single_element_chain() {
        let index = ClassIndex::new(vec![container(&[("Lcom/a/Other;", "Ljava/lang/Object;")])]);
        let main = resolve_main_classes(&index, "com.a.Missing").unwrap();
        assert_eq!(main.chain, vec!["Lcom/a/Missing;"]);
        assert_eq!(main.end, ChainEnd::Unresolved("Lcom/a/Missing;".into()));
    }

    #[test]
    fn platform_root_entry() {
        let index = ClassIndex::new(vec![container(&[])]);
        let main = resolve_main_classes(&index, "android.app.Application").unwrap();
        assert_eq!(main.chain, vec![PLATFORM_APPLICATION_TYPE]);
        assert!(main.is_platform_root());
        assert_eq!(main.application_name(), "android.app.Application");
    }

    #[test]
    fn external_ancestor_ends_the_chain() {
        let index = ClassIndex::new(vec![container(&[(
            "Lcom/a/App;",
            "Landroidx/multidex/MultiDexApplication;",
        )])]);
        let main = resolve_main_classes(&index, "com.a.App").unwrap();
        assert_eq!(main.chain, vec!["Lcom/a/App;", "Landroidx/multidex/MultiDexApplication;"]);
        assert_eq!(
            main.end,
            ChainEnd::Unresolved("Landroidx/multidex/MultiDexApplication;".into())
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let index = ClassIndex::new(vec![container(&[("La/A;", "La/B;"), ("La/B;", "La/A;")])]);
        assert!(resolve_main_classes(&index, "a.A").is_err());
    }
}
