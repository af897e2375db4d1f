//! Run configuration, read from a JSON file.
//!
//! Every field is optional; missing ones fall back to the defaults below. Toolchain locations
//! default to the `CMAKE_PATH`, `ANDROID_SDK_HOME` and `ANDROID_NDK_HOME` environment variables.
use crate::error::{IoResultExt, ProtectError, ProtectResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_LIBRARY_NAME: &str = "dexnative";
pub const DEFAULT_MAX_POOL_SIZE: usize = 60000;
pub const DEFAULT_MIN_SDK: u32 = 21;
pub const DEFAULT_REGISTER_CLASS: &str = "com/dexnative/protect/NativeUtil";
pub const DEFAULT_SDK_HOME: &str = "/opt/android-sdk";
pub const DEFAULT_NDK_HOME: &str = "/opt/android-sdk/ndk/22.1.7171670";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    #[default]
    Release,
    Debug,
}

impl BuildType {
    /// The `CMAKE_BUILD_TYPE` value.
    pub fn cmake_name(self) -> &'static str {
        match self {
            BuildType::Release => "Release",
            BuildType::Debug => "Debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// CMake installation directory; `cmake` is looked up on `PATH` when unset.
    pub cmake: Option<PathBuf>,
    pub sdk_home: PathBuf,
    pub ndk_home: PathBuf,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        ToolchainConfig {
            cmake: env::var_os("CMAKE_PATH")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            sdk_home: env_path("ANDROID_SDK_HOME", DEFAULT_SDK_HOME),
            ndk_home: env_path("ANDROID_NDK_HOME", DEFAULT_NDK_HOME),
        }
    }
}

fn env_path(var: &str, default: &str) -> PathBuf {
    env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Regular expressions selecting what gets moved to native code.
///
/// Class patterns match dotted names (`com.example.Foo`), method patterns match the method name.
/// An empty include list accepts every class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub exclude_methods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectConfig {
    /// Name passed to `System.loadLibrary`.
    pub library_name: String,
    /// Largest reference pool an output container may hold.
    pub max_pool_size: usize,
    /// ABIs to build; empty means those shipped by the input, or the defaults.
    pub abis: Vec<String>,
    pub min_sdk: u32,
    pub build_type: BuildType,
    /// Interpreter sources copied into the native build tree.
    pub template_dir: Option<PathBuf>,
    /// Public key embedded into the signature verifier source.
    pub verifier_public_key: Option<PathBuf>,
    /// Internal name of the class that receives the per-shard register natives.
    pub register_class: String,
    pub toolchain: ToolchainConfig,
    pub filter: FilterConfig,
}

impl Default for ProtectConfig {
    fn default() -> Self {
        ProtectConfig {
            library_name: DEFAULT_LIBRARY_NAME.to_string(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            abis: Vec::new(),
            min_sdk: DEFAULT_MIN_SDK,
            build_type: BuildType::default(),
            template_dir: None,
            verifier_public_key: None,
            register_class: DEFAULT_REGISTER_CLASS.to_string(),
            toolchain: ToolchainConfig::default(),
            filter: FilterConfig::default(),
        }
    }
}

impl ProtectConfig {
    pub fn load(path: &Path) -> ProtectResult<Self> {
        let content = std::fs::read_to_string(path).at_path(path)?;
        let config: ProtectConfig = serde_json::from_str(&content)
            .map_err(|e| ProtectError::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProtectResult<()> {
        if self.library_name.is_empty()
            || !self
                .library_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ProtectError::config(format!(
                "library_name {:?} is not a valid library name",
                self.library_name
            )));
        }
        if self.max_pool_size == 0 || self.max_pool_size > crate::dex::DEX_INDEX_LIMIT {
            return Err(ProtectError::config(format!(
                "max_pool_size must be between 1 and {}, got {}",
                crate::dex::DEX_INDEX_LIMIT,
                self.max_pool_size
            )));
        }
        if self.register_class.is_empty()
            || self.register_class.contains('.')
            || self.register_class.contains(';')
        {
            return Err(ProtectError::config(format!(
                "register_class {:?} must be an internal name such as a/b/C",
                self.register_class
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: ProtectConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.library_name, "dexnative");
        assert_eq!(config.max_pool_size, 60000);
        assert_eq!(config.min_sdk, 21);
        assert_eq!(config.build_type, BuildType::Release);
        assert!(config.abis.is_empty());
        assert!(config.filter.include.is_empty());
    }

    #[test]
    fn loads_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protect.json");
        std::fs::write(
            &path,
            r#"{
                "library_name": "guard",
                "abis": ["arm64-v8a"],
                "build_type": "debug",
                "toolchain": { "ndk_home": "/ndk" },
                "filter": { "include": ["^com\\.example\\."], "exclude_methods": ["^toString$"] }
            }"#,
        )
        .unwrap();
        let config = ProtectConfig::load(&path).unwrap();
        assert_eq!(config.library_name, "guard");
        assert_eq!(config.abis, vec!["arm64-v8a"]);
        assert_eq!(config.build_type.cmake_name(), "Debug");
        assert_eq!(config.toolchain.ndk_home, PathBuf::from("/ndk"));
        assert_eq!(config.filter.exclude_methods, vec!["^toString$"]);
        assert_eq!(config.max_pool_size, DEFAULT_MAX_POOL_SIZE);
    }

    #[test]
    fn rejects_bad_values() {
        let config = ProtectConfig {
            max_pool_size: 70000,
            ..ProtectConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProtectError::Config(_))));

        let config = ProtectConfig {
            register_class: "com.example.Util".into(),
            ..ProtectConfig::default()
        };
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ProtectConfig::load(&path), Err(ProtectError::Config(_))));
    }
}
