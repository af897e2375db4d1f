//! Compiling the generated native sources into one shared library per ABI.
use crate::config::{BuildType, ProtectConfig};
use crate::error::{IoResultExt, ProtectError, ProtectResult};
use log::{debug, info};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// CMake installation directory; `cmake` from `PATH` when unset.
    pub cmake: Option<PathBuf>,
    pub sdk_home: PathBuf,
    pub ndk_home: PathBuf,
    pub min_sdk: u32,
    pub build_type: BuildType,
    pub library_name: String,
}

impl BuildOptions {
    pub fn from_config(config: &ProtectConfig) -> Self {
        BuildOptions {
            cmake: config.toolchain.cmake.clone(),
            sdk_home: config.toolchain.sdk_home.clone(),
            ndk_home: config.toolchain.ndk_home.clone(),
            min_sdk: config.min_sdk,
            build_type: config.build_type,
            library_name: config.library_name.clone(),
        }
    }

    pub fn cmake_binary(&self) -> PathBuf {
        match &self.cmake {
            Some(dir) => dir.join("bin").join("cmake"),
            None => PathBuf::from("cmake"),
        }
    }

    pub fn toolchain_file(&self) -> PathBuf {
        self.ndk_home.join("build").join("cmake").join("android.toolchain.cmake")
    }

    /// Arguments of the configure step for `abi`.
    pub fn configure_args(&self, source_root: &Path, build_dir: &Path, output_dir: &Path, abi: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-S".into(), source_root.into(), "-B".into(), build_dir.into()];
        let mut define = |key: &str, value: &dyn AsRef<std::ffi::OsStr>| {
            let mut arg = OsString::from(format!("-D{}=", key));
            arg.push(value.as_ref());
            args.push(arg);
        };
        define("CMAKE_TOOLCHAIN_FILE", &self.toolchain_file());
        define("ANDROID_ABI", &abi);
        define("ANDROID_PLATFORM", &format!("android-{}", self.min_sdk));
        define("ANDROID_NDK", &self.ndk_home);
        define("ANDROID_SDK_ROOT", &self.sdk_home);
        define("CMAKE_BUILD_TYPE", &self.build_type.cmake_name());
        define("CMAKE_LIBRARY_OUTPUT_DIRECTORY", &output_dir);
        args
    }
}

/// Compiles `source_root` for one ABI and returns the shared libraries produced.
pub trait NativeBuilder {
    fn build(&self, source_root: &Path, build_root: &Path, abi: &str) -> ProtectResult<Vec<PathBuf>>;
}

pub struct CMakeBuilder {
    options: BuildOptions,
}

impl CMakeBuilder {
    pub fn new(options: BuildOptions) -> Self {
        CMakeBuilder { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    fn run(&self, abi: &str, args: &[OsString]) -> ProtectResult<()> {
        let cmake = self.options.cmake_binary();
        debug!("{} {:?}", cmake.display(), args);
        let output = Command::new(&cmake).args(args).output().map_err(|e| ProtectError::NativeBuild {
            abi: abi.to_string(),
            message: format!("failed to run {}: {}", cmake.display(), e),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProtectError::NativeBuild {
                abi: abi.to_string(),
                message: format!("{} exited with {}: {}", cmake.display(), output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

impl NativeBuilder for CMakeBuilder {
    fn build(&self, source_root: &Path, build_root: &Path, abi: &str) -> ProtectResult<Vec<PathBuf>> {
        let build_dir = build_root.join(abi).join("cmake");
        let output_dir = build_root.join(abi).join("lib");
        fs::create_dir_all(&build_dir).at_path(&build_dir)?;
        fs::create_dir_all(&output_dir).at_path(&output_dir)?;

        info!("building {} for {}", self.options.library_name, abi);
        self.run(abi, &self.options.configure_args(source_root, &build_dir, &output_dir, abi))?;
        let build_args: Vec<OsString> = vec![
            "--build".into(),
            build_dir.clone().into_os_string(),
            "--config".into(),
            self.options.build_type.cmake_name().into(),
        ];
        self.run(abi, &build_args)?;

        let libraries = shared_libraries(&output_dir);
        if libraries.is_empty() {
            return Err(ProtectError::NativeBuild {
                abi: abi.to_string(),
                message: format!("no shared library produced in {}", output_dir.display()),
            });
        }
        Ok(libraries)
    }
}

/// Every `*.so` file below `dir`, sorted.
pub fn shared_libraries(dir: &Path) -> Vec<PathBuf> {
    let mut libraries: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "so"))
        .collect();
    libraries.sort();
    libraries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolchainConfig;

    fn options() -> BuildOptions {
        let mut config = ProtectConfig {
            toolchain: ToolchainConfig {
                cmake: Some(PathBuf::from("/opt/cmake")),
                sdk_home: PathBuf::from("/sdk"),
                ndk_home: PathBuf::from("/ndk"),
            },
            ..ProtectConfig::default()
        };
        config.min_sdk = 24;
        BuildOptions::from_config(&config)
    }

    #[test]
    fn configure_arguments() {
        let opts = options();
        assert_eq!(opts.cmake_binary(), PathBuf::from("/opt/cmake/bin/cmake"));
        let args: Vec<String> = opts
            .configure_args(Path::new("/src"), Path::new("/b"), Path::new("/out"), "arm64-v8a")
            .into_iter()
            .map(|a| a.into_string().unwrap())
            .collect();
        assert_eq!(&args[..4], &["-S", "/src", "-B", "/b"]);
        assert!(args.contains(&"-DCMAKE_TOOLCHAIN_FILE=/ndk/build/cmake/android.toolchain.cmake".to_string()));
        assert!(args.contains(&"-DANDROID_ABI=arm64-v8a".to_string()));
        assert!(args.contains(&"-DANDROID_PLATFORM=android-24".to_string()));
        assert!(args.contains(&"-DCMAKE_BUILD_TYPE=Release".to_string()));
        assert!(args.contains(&"-DCMAKE_LIBRARY_OUTPUT_DIRECTORY=/out".to_string()));
    }

    #[test]
    fn cmake_from_path_by_default() {
        let opts = BuildOptions {
            cmake: None,
            ..options()
        };
        assert_eq!(opts.cmake_binary(), PathBuf::from("cmake"));
    }

    #[test]
    fn missing_cmake_is_a_build_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = CMakeBuilder::new(BuildOptions {
            cmake: Some(dir.path().join("no-such-cmake")),
            ..options()
        });
        let err = builder.build(dir.path(), &dir.path().join("build"), "x86").unwrap_err();
        assert!(matches!(err, ProtectError::NativeBuild { ref abi, .. } if abi == "x86"));
    }

    #[test]
    fn collects_shared_libraries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/libdexnative.so"), b"ELF").unwrap();
        fs::write(dir.path().join("libdexnative.a"), b"!<arch>").unwrap();
        let libs = shared_libraries(dir.path());
        assert_eq!(libs, vec![dir.path().join("nested/libdexnative.so")]);
    }
}
