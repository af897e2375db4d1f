//! Cross-shard class lookup.
use crate::dex::class::ClassDef;
use crate::dex::container::Container;
use crate::dex::error::DexResultExt;
use crate::error::{IoResultExt, ProtectResult};
use crate::protect::shard::GlobalConfig;
use log::warn;
use std::collections::HashMap;
use std::fs;

/// Every native container of a run, with descriptors resolved to the first shard defining them.
#[derive(Debug, Default)]
pub struct ClassIndex {
    shards: Vec<Container>,
    owners: HashMap<String, usize>,
}

impl ClassIndex {
    pub fn new(shards: Vec<Container>) -> Self {
        let mut owners = HashMap::new();
        for (i, shard) in shards.iter().enumerate() {
            for class in shard.classes() {
                if let Some(first) = owners.get(&class.descriptor) {
                    warn!(
                        "{} is defined in shards {} and {}, keeping the first",
                        class.descriptor, first, i
                    );
                    continue;
                }
                owners.insert(class.descriptor.clone(), i);
            }
        }
        ClassIndex { shards, owners }
    }

    /// Read back the native containers the shard pass wrote.
    pub fn load(global: &GlobalConfig) -> ProtectResult<Self> {
        let mut shards = Vec::with_capacity(global.shards.len());
        for shard in &global.shards {
            let bytes = fs::read(&shard.native_dex).at_path(&shard.native_dex)?;
            let container = Container::from_bytes(&bytes).context(|| shard.native_dex.display().to_string())?;
            shards.push(container);
        }
        Ok(Self::new(shards))
    }

    pub fn shards(&self) -> &[Container] {
        &self.shards
    }

    /// The defining shard and definition of `descriptor`.
    pub fn lookup(&self, descriptor: &str) -> Option<(usize, &ClassDef)> {
        let shard = *self.owners.get(descriptor)?;
        self.shards[shard].get(descriptor).map(|class| (shard, class))
    }

    /// True when `class` in `shard` is the definition lookups resolve to.
    pub fn is_owner(&self, shard: usize, descriptor: &str) -> bool {
        self.owners.get(descriptor) == Some(&shard)
    }

    pub fn class_count(&self) -> usize {
        self.owners.len()
    }
}
