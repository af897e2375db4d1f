//! One protection run from input APK to output APK.
use crate::android::apk::{self, ANDROID_MANIFEST, DEFAULT_ABIS};
use crate::android::manifest::{BinaryManifest, ManifestError};
use crate::android::repackage::{repackage, NewEntry, DEFAULT_EXCLUSIONS};
use crate::config::ProtectConfig;
use crate::error::{IoResultExt, ProtectError, ProtectResult};
use crate::protect::assembler::{assemble, write_containers};
use crate::protect::codegen::{CodeGenerator, JniGlueGenerator};
use crate::protect::entry_point::{rewrite_primary, EntryPoint};
use crate::protect::filter::{AcceptancePolicy, RuleFilter};
use crate::protect::index::ClassIndex;
use crate::protect::native_build::{BuildOptions, CMakeBuilder, NativeBuilder};
use crate::protect::resolver::resolve_main_classes;
use crate::protect::shard::ShardProcessor;
use crate::protect::strategy::{IdentityOpcodes, RewriteStrategy, ShuffledOpcodes};
use crate::protect::templates::{template_sources, write_build_files, PublicKeyVerifier, VerifyCodeGenerator};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectReport {
    pub package: String,
    /// Application class named by the output manifest, dotted.
    pub application: String,
    pub entry_point: EntryPoint,
    pub input_containers: usize,
    pub output_containers: usize,
    pub native_classes: usize,
    pub native_methods: usize,
    pub abis: Vec<String>,
    /// Archive names of the native libraries added, `lib/<abi>/<file>`.
    pub libraries: Vec<String>,
}

/// Scratch directories of one run, removed when dropped.
struct WorkDir {
    root: TempDir,
}

impl WorkDir {
    fn create(parent: Option<&Path>) -> ProtectResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dexnative-");
        let root = match parent {
            Some(parent) => {
                fs::create_dir_all(parent).at_path(parent)?;
                builder.tempdir_in(parent).at_path(parent)?
            }
            None => builder.tempdir().at_path(std::env::temp_dir())?,
        };
        Ok(WorkDir { root })
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }
}

type StrategyFactory = Box<dyn Fn() -> Box<dyn RewriteStrategy>>;

/// Configured pipeline. Collaborators default to the shipped implementations and can be swapped.
pub struct Protector {
    config: ProtectConfig,
    policy: Box<dyn AcceptancePolicy>,
    generator: Box<dyn CodeGenerator>,
    strategy: StrategyFactory,
    verifier: Option<Box<dyn VerifyCodeGenerator>>,
    builder: Option<Box<dyn NativeBuilder>>,
    work_dir: Option<PathBuf>,
}

impl Protector {
    pub fn new(config: ProtectConfig) -> ProtectResult<Self> {
        config.validate()?;
        let policy = RuleFilter::from_config(&config.filter)?;
        let verifier: Option<Box<dyn VerifyCodeGenerator>> = match &config.verifier_public_key {
            Some(path) => Some(Box::new(PublicKeyVerifier::from_file(path)?)),
            None => None,
        };
        let builder = CMakeBuilder::new(BuildOptions::from_config(&config));
        Ok(Protector {
            config,
            policy: Box::new(policy),
            generator: Box::new(JniGlueGenerator::default()),
            strategy: Box::new(|| -> Box<dyn RewriteStrategy> { Box::new(ShuffledOpcodes::new()) }),
            verifier,
            builder: Some(Box::new(builder)),
            work_dir: None,
        })
    }

    pub fn with_policy(mut self, policy: impl AcceptancePolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_generator(mut self, generator: impl CodeGenerator + 'static) -> Self {
        self.generator = Box::new(generator);
        self
    }

    /// Every run calls `factory` for its own opcode mapping.
    pub fn with_strategy<S, F>(mut self, factory: F) -> Self
    where
        S: RewriteStrategy + 'static,
        F: Fn() -> S + 'static,
    {
        self.strategy = Box::new(move || -> Box<dyn RewriteStrategy> { Box::new(factory()) });
        self
    }

    pub fn with_verifier(mut self, verifier: impl VerifyCodeGenerator + 'static) -> Self {
        self.verifier = Some(Box::new(verifier));
        self
    }

    pub fn with_builder(mut self, builder: impl NativeBuilder + 'static) -> Self {
        self.builder = Some(Box::new(builder));
        self
    }

    /// Skip compiling native libraries; the output then ships none of its own.
    pub fn without_native_build(mut self) -> Self {
        self.builder = None;
        self
    }

    /// Create the scratch directory under `dir` instead of the system temp directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &ProtectConfig {
        &self.config
    }

    /// The opcode mapping of one run.
    ///
    /// Without a template directory the interpreter is built elsewhere against the standard
    /// numbering, so the bytecode keeps it as well.
    fn run_strategy(&self) -> Box<dyn RewriteStrategy> {
        if self.config.template_dir.is_none() {
            warn!("no native template directory, bytecode keeps the standard opcode numbering");
            return Box::new(IdentityOpcodes);
        }
        (self.strategy)()
    }

    pub fn protect(&self, input: &Path, output: &Path) -> ProtectResult<ProtectReport> {
        let manifest_bytes = apk::read_entry(input, ANDROID_MANIFEST)?
            .ok_or_else(|| ManifestError::Malformed(format!("{} is not an APK", input.display())))?;
        let mut manifest = BinaryManifest::from_bytes(&manifest_bytes)?;
        let package = manifest.package_name()?;
        let entry_class = manifest.application_name()?;
        info!("protecting {} (application {})", package, entry_class);

        let work = WorkDir::create(self.work_dir.as_deref())?;
        let extract_dir = work.dir("extract");
        let dex_dir = work.dir("dex");
        let source_root = work.dir("native");
        let generated_dir = source_root.join("generated");
        let out_dir = work.dir("out");
        let build_root = work.dir("build");
        let staging = work.dir("staging");

        let strategy = self.run_strategy();
        template_sources(
            self.config.template_dir.as_deref(),
            &source_root,
            strategy.as_ref(),
            self.verifier.as_deref(),
            &package,
        )?;

        let inputs = apk::extract_dex_files(input, &extract_dir)?;
        if inputs.is_empty() {
            return Err(ProtectError::invariant(format!("{} contains no classes.dex", input.display())));
        }
        info!("{} input containers", inputs.len());

        let processor = ShardProcessor {
            policy: self.policy.as_ref(),
            generator: self.generator.as_ref(),
            strategy: strategy.as_ref(),
            register_class: &self.config.register_class,
        };
        let global = processor.process_all(&inputs, &dex_dir, &generated_dir)?;
        write_build_files(&source_root, &self.config.library_name, &global.sources())?;

        let index = ClassIndex::load(&global)?;
        let main = resolve_main_classes(&index, &entry_class)?;
        let containers = assemble(&index, &global, &main, self.config.max_pool_size)?;
        let files = write_containers(&containers, &out_dir)?;

        let primary = files
            .first()
            .ok_or_else(|| ProtectError::invariant("no primary container written"))?;
        let entry_point = rewrite_primary(primary, &main, &global, &self.config.library_name)?;
        let application = match &entry_point {
            EntryPoint::Synthesized(_) => {
                let name = entry_point.class_name();
                manifest.set_application_name(&name)?;
                info!("manifest application class set to {}", name);
                name
            }
            EntryPoint::Existing(_) => entry_class.clone(),
        };

        let abis = self.target_abis(input)?;
        let mut additions = Vec::new();
        let manifest_path = work.dir(ANDROID_MANIFEST);
        fs::write(&manifest_path, manifest.to_bytes()).at_path(&manifest_path)?;
        additions.push(NewEntry::new(ANDROID_MANIFEST, &manifest_path));
        for file in &files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| ProtectError::invariant(format!("bad container path {}", file.display())))?;
            additions.push(NewEntry::new(name, file));
        }

        let mut libraries = Vec::new();
        match &self.builder {
            Some(builder) => {
                for abi in &abis {
                    for library in builder.build(&source_root, &build_root, abi)? {
                        let Some(file_name) = library.file_name().and_then(|n| n.to_str()) else {
                            continue;
                        };
                        let name = format!("lib/{}/{}", abi, file_name);
                        additions.push(NewEntry::new(name.clone(), &library));
                        libraries.push(name);
                    }
                }
            }
            None => warn!("native build skipped, the output does not contain lib{}.so", self.config.library_name),
        }

        repackage(input, &staging, output, &DEFAULT_EXCLUSIONS, &additions)?;
        info!("wrote {}", output.display());

        Ok(ProtectReport {
            package,
            application,
            entry_point,
            input_containers: inputs.len(),
            output_containers: files.len(),
            native_classes: global.shards.iter().map(|s| s.native_classes().len()).sum(),
            native_methods: global.native_method_count(),
            abis,
            libraries,
        })
    }

    /// Configured ABIs, else those the input ships, else the defaults.
    fn target_abis(&self, input: &Path) -> ProtectResult<Vec<String>> {
        if !self.config.abis.is_empty() {
            return Ok(self.config.abis.clone());
        }
        let shipped = apk::list_abis(input)?;
        if !shipped.is_empty() {
            return Ok(shipped);
        }
        Ok(DEFAULT_ABIS.iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_numbering_without_templates() {
        let protector = Protector::new(ProtectConfig::default())
            .unwrap()
            .with_strategy(|| ShuffledOpcodes::from_seed(3));
        let strategy = protector.run_strategy();
        assert!((0..=255u8).all(|op| strategy.map(op) == op));
    }

    #[test]
    fn each_run_gets_a_fresh_mapping() {
        let config = ProtectConfig {
            template_dir: Some(PathBuf::from("template")),
            ..ProtectConfig::default()
        };
        let protector = Protector::new(config).unwrap();
        let a = protector.run_strategy();
        let b = protector.run_strategy();
        assert!((0..=255u8).any(|op| a.map(op) != b.map(op)));
    }
}
