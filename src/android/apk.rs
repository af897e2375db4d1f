use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use zip::read::ZipArchive;
use zip::result::ZipError;

pub const ANDROID_MANIFEST: &str = "AndroidManifest.xml";

/// ABIs built when the input ships no native libraries.
pub const DEFAULT_ABIS: [&str; 4] = ["armeabi-v7a", "arm64-v8a", "x86", "x86_64"];

static DEX_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^classes(\d*)\.dex$").unwrap());
static LIB_ENTRY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^lib/([^/]+)/[^/]+\.so$").unwrap());

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the APK reading and packing helpers.
#[derive(Error, Debug)]
pub enum ApkZipError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] ZipError),

    #[error("{0}")]
    InvalidInput(String),
}

pub(crate) fn open_archive(path: &Path) -> ApkZipResult<ZipArchive<File>> {
    let file = File::open(path)?;
    Ok(ZipArchive::new(file)?)
}

/// Read a whole entry into memory; `None` when the archive has no such entry.
pub fn read_entry(apk: &Path, name: &str) -> ApkZipResult<Option<Vec<u8>>> {
    let mut archive = open_archive(apk)?;
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    // the declared size is untrusted; let the buffer grow with what is actually read
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok(Some(data))
}

/// Extract every file entry whose name matches `pattern` into `dir`, keeping relative paths.
pub fn extract_matching(apk: &Path, pattern: &Regex, dir: &Path) -> ApkZipResult<Vec<PathBuf>> {
    let mut archive = open_archive(apk)?;
    let mut extracted = Vec::new();
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if entry.is_dir() || !pattern.is_match(entry.name()) {
            continue;
        }
        let name = path_to_entry_name(Path::new(entry.name()))?;
        let path = dir.join(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&path)?;
        io::copy(&mut entry, &mut out)?;
        extracted.push(path);
    }
    Ok(extracted)
}

/// Position of a DEX entry in the multidex sequence: `classes.dex` is 0, `classesN.dex` is N.
pub fn dex_ordinal(name: &str) -> Option<u32> {
    let caps = DEX_ENTRY.captures(name)?;
    match caps.get(1).map(|m| m.as_str()) {
        None | Some("") => Some(0),
        Some(n) => n.parse().ok(),
    }
}

/// Extract the top-level DEX containers, ordered by their multidex position.
pub fn extract_dex_files(apk: &Path, dir: &Path) -> ApkZipResult<Vec<PathBuf>> {
    let mut files = extract_matching(apk, &DEX_ENTRY, dir)?;
    files.sort_by_key(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .and_then(dex_ordinal)
            .unwrap_or(u32::MAX)
    });
    Ok(files)
}

/// The ABIs the archive ships native libraries for, sorted.
pub fn list_abis(apk: &Path) -> ApkZipResult<Vec<String>> {
    let archive = open_archive(apk)?;
    let abis: BTreeSet<String> = archive
        .file_names()
        .filter_map(|name| LIB_ENTRY.captures(name))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    Ok(abis.into_iter().collect())
}

/// Normalize an entry path to `a/b/c`, rejecting anything that could escape a directory.
pub(crate) fn path_to_entry_name(path: &Path) -> ApkZipResult<String> {
    let mut components = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(ApkZipError::InvalidInput(format!(
                    "invalid entry path component in {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                return Err(ApkZipError::InvalidInput(format!(
                    "entry path {} may not contain parent components",
                    path.display()
                )));
            }
        }
    }
    if components.is_empty() {
        return Err(ApkZipError::InvalidInput("entry name must not be empty".to_string()));
    }
    Ok(components.join("/"))
}
