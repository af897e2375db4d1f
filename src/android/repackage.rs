//! Rebuilds the output archive from the original one.
//!
//! Retained entries are staged to disk and written back in their original order with their
//! original compression method; stored entries keep the CRC and size computed while staging,
//! so their bytes come through unchanged. Regenerated entries are appended afterwards.
use crate::android::apk::{open_archive, path_to_entry_name, ApkZipError, ApkZipResult};
use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Entries regenerated by the pipeline, or invalidated by it (signatures).
pub static DEFAULT_EXCLUSIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(classes(\d)*\.dex|META-INF/.*\.(RSA|DSA|EC|SF|MF)|AndroidManifest\.xml)$").unwrap()
});

/// Compression method of an APK entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApkCompression {
    Stored,
    Deflated,
}

impl ApkCompression {
    fn method(self) -> u16 {
        match self {
            ApkCompression::Stored => 0,
            ApkCompression::Deflated => 8,
        }
    }
}

/// A retained entry extracted to the staging directory.
#[derive(Clone, Debug)]
pub struct StagedEntry {
    pub name: String,
    pub path: PathBuf,
    pub compression: ApkCompression,
    pub crc32: u32,
    pub size: u64,
    pub unix_mode: Option<u32>,
}

/// A regenerated file to add under `name`.
#[derive(Clone, Debug)]
pub struct NewEntry {
    pub name: String,
    pub path: PathBuf,
}

impl NewEntry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        NewEntry {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Passes bytes through to `inner` while computing their CRC-32.
struct CrcWriter<W> {
    inner: W,
    hasher: Crc32,
    len: u64,
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Extract every file entry not matched by `exclude` into `staging`, in archive order.
pub fn stage_entries(source: &Path, staging: &Path, exclude: &Regex) -> ApkZipResult<Vec<StagedEntry>> {
    let mut archive = open_archive(source)?;
    let mut staged = Vec::new();
    for idx in 0..archive.len() {
        let mut entry = archive.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let name = path_to_entry_name(Path::new(entry.name()))?;
        if exclude.is_match(&name) {
            debug!("dropping {}", name);
            continue;
        }
        let compression = match entry.compression() {
            zip::CompressionMethod::Stored => ApkCompression::Stored,
            _ => ApkCompression::Deflated,
        };
        let path = staging.join(&name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = CrcWriter {
            inner: BufWriter::new(File::create(&path)?),
            hasher: Crc32::new(),
            len: 0,
        };
        io::copy(&mut entry, &mut out)?;
        out.flush()?;
        staged.push(StagedEntry {
            name,
            path,
            compression,
            crc32: out.hasher.finalize(),
            size: out.len,
            unix_mode: entry.unix_mode(),
        });
    }
    Ok(staged)
}

/// Write `output` from the staged entries followed by the regenerated ones.
///
/// The archive is written to a temporary file next to `output` and moved into place once
/// complete; on failure `output` is left as it was.
pub fn write_archive(output: &Path, staged: &[StagedEntry], additions: &[NewEntry]) -> ApkZipResult<()> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        _ => PathBuf::from("."),
    };
    let temp = tempfile::Builder::new()
        .prefix(".dexnative-")
        .suffix(".apk")
        .tempfile_in(&dir)?;
    write_entries(temp.as_file(), staged, additions)?;
    temp.persist(output).map_err(|e| e.error)?;
    Ok(())
}

fn write_entries(file: &File, staged: &[StagedEntry], additions: &[NewEntry]) -> ApkZipResult<()> {
    let mut writer = ApkWriter::new(BufWriter::new(file));
    for entry in staged {
        let data = fs::read(&entry.path)?;
        match entry.compression {
            ApkCompression::Stored => {
                let align = stored_alignment(&entry.name);
                writer.add_stored(&entry.name, &data, entry.crc32, entry.unix_mode, align)?
            }
            ApkCompression::Deflated => writer.add_deflated(&entry.name, &data, entry.unix_mode)?,
        }
    }
    for addition in additions {
        let name = path_to_entry_name(Path::new(&addition.name))?;
        let data = fs::read(&addition.path)?;
        if should_store_uncompressed(&name) {
            let mut crc = Crc32::new();
            crc.update(&data);
            writer.add_stored(&name, &data, crc.finalize(), None, stored_alignment(&name))?;
        } else {
            writer.add_deflated(&name, &data, None)?;
        }
    }
    writer.finish()?.flush()?;
    Ok(())
}

/// Stage, filter and rewrite `source` into `output`.
pub fn repackage(
    source: &Path,
    staging: &Path,
    output: &Path,
    exclude: &Regex,
    additions: &[NewEntry],
) -> ApkZipResult<()> {
    let staged = stage_entries(source, staging, exclude)?;
    debug!("retaining {} entries", staged.len());
    write_archive(output, &staged, additions)
}

#[derive(Clone)]
struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    compression: ApkCompression,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
    external_attrs: u32,
}

/// Streams local entries and then the central directory.
struct ApkWriter<W: Write> {
    out: W,
    offset: u64,
    records: Vec<CentralDirectoryRecord>,
}

impl<W: Write> ApkWriter<W> {
    fn new(out: W) -> Self {
        ApkWriter {
            out,
            offset: 0,
            records: Vec::new(),
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn narrow(&self, value: u64, what: &str) -> ApkZipResult<u32> {
        u32::try_from(value).map_err(|_| ApkZipError::InvalidInput(format!("{what} exceeds the ZIP32 limit")))
    }

    fn add_stored(
        &mut self,
        name: &str,
        data: &[u8],
        crc32: u32,
        unix_mode: Option<u32>,
        alignment: u32,
    ) -> ApkZipResult<()> {
        let offset = self.narrow(self.offset, "archive offset")?;
        let padding = alignment_padding(offset, name.len(), alignment);
        self.add_entry(name, data, data.len(), crc32, ApkCompression::Stored, unix_mode, padding)
    }

    fn add_deflated(&mut self, name: &str, data: &[u8], unix_mode: Option<u32>) -> ApkZipResult<()> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        let mut crc = Crc32::new();
        crc.update(data);
        self.add_entry(name, &compressed, data.len(), crc.finalize(), ApkCompression::Deflated, unix_mode, 0)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_entry(
        &mut self,
        name: &str,
        payload: &[u8],
        uncompressed_len: usize,
        crc32: u32,
        compression: ApkCompression,
        unix_mode: Option<u32>,
        extra_len: u32,
    ) -> ApkZipResult<()> {
        let local_header_offset = self.narrow(self.offset, "archive offset")?;
        let compressed_size = self.narrow(payload.len() as u64, name)?;
        let uncompressed_size = self.narrow(uncompressed_len as u64, name)?;

        let mut header = Vec::with_capacity(30 + name.len() + extra_len as usize);
        write_u32(&mut header, 0x04034b50);
        write_u16(&mut header, 20);
        write_u16(&mut header, 0);
        write_u16(&mut header, compression.method());
        write_u16(&mut header, 0);
        write_u16(&mut header, 0);
        write_u32(&mut header, crc32);
        write_u32(&mut header, compressed_size);
        write_u32(&mut header, uncompressed_size);
        write_u16(&mut header, name.len() as u16);
        write_u16(&mut header, extra_len as u16);
        header.extend_from_slice(name.as_bytes());
        header.resize(header.len() + extra_len as usize, 0);
        self.emit(&header)?;
        self.emit(payload)?;

        self.records.push(CentralDirectoryRecord {
            file_name: name.as_bytes().to_vec(),
            compression,
            crc32,
            compressed_size,
            uncompressed_size,
            local_header_offset,
            external_attrs: unix_mode.unwrap_or(0o644) << 16,
        });
        Ok(())
    }

    fn finish(mut self) -> ApkZipResult<W> {
        let central_start = self.narrow(self.offset, "central directory offset")?;
        let mut central = Vec::new();
        for record in &self.records {
            write_central_directory_entry(&mut central, record);
        }
        let entry_count = u16::try_from(self.records.len())
            .map_err(|_| ApkZipError::InvalidInput("too many entries for ZIP32".to_string()))?;
        let central_size = central.len() as u32;
        write_u32(&mut central, 0x06054b50);
        write_u16(&mut central, 0);
        write_u16(&mut central, 0);
        write_u16(&mut central, entry_count);
        write_u16(&mut central, entry_count);
        write_u32(&mut central, central_size);
        write_u32(&mut central, central_start);
        write_u16(&mut central, 0);
        self.emit(&central)?;
        Ok(self.out)
    }
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, 0x02014b50);
    write_u16(buf, 0x031E);
    write_u16(buf, 20);
    write_u16(buf, 0);
    write_u16(buf, record.compression.method());
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, record.external_attrs);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Extra-field padding that puts the entry data at a multiple of `alignment`.
fn alignment_padding(offset: u32, name_len: usize, alignment: u32) -> u32 {
    if alignment <= 1 {
        return 0;
    }
    let base = offset as u64 + 30 + name_len as u64;
    let align = alignment as u64;
    ((align - (base % align)) % align) as u32
}

/// Native libraries are page aligned so they can be mapped straight from the archive.
fn stored_alignment(name: &str) -> u32 {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("lib/") && lower.ends_with(".so") {
        16 * 1024
    } else {
        4
    }
}

fn should_store_uncompressed(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".arsc") || lower.ends_with(".dex") || lower.ends_with(".so")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipArchive};

    fn source_apk(path: &Path) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
        let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("AndroidManifest.xml", deflated).unwrap();
        zip.write_all(b"old manifest").unwrap();
        zip.start_file("classes.dex", stored).unwrap();
        zip.write_all(b"old dex").unwrap();
        zip.start_file("resources.arsc", stored).unwrap();
        zip.write_all(&[7u8; 333]).unwrap();
        zip.add_directory("res/", stored).unwrap();
        zip.start_file("res/layout/main.xml", deflated).unwrap();
        zip.write_all(&b"layout ".repeat(50)).unwrap();
        zip.start_file("META-INF/CERT.RSA", stored).unwrap();
        zip.write_all(b"sig").unwrap();
        zip.start_file("META-INF/services/x", stored).unwrap();
        zip.write_all(b"kept").unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn exclusions_match_regenerated_entries_only() {
        for name in ["classes.dex", "classes12.dex", "META-INF/CERT.SF", "META-INF/MANIFEST.MF", "AndroidManifest.xml"] {
            assert!(DEFAULT_EXCLUSIONS.is_match(name), "{name}");
        }
        for name in ["assets/classes.dex", "META-INF/services/x", "res/AndroidManifest.xml", "classes.dex.txt"] {
            assert!(!DEFAULT_EXCLUSIONS.is_match(name), "{name}");
        }
    }

    #[test]
    fn repackage_preserves_order_and_stored_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.apk");
        source_apk(&source);
        let manifest = dir.path().join("AndroidManifest.xml");
        fs::write(&manifest, b"new manifest").unwrap();
        let dex = dir.path().join("classes.dex");
        fs::write(&dex, b"new dex").unwrap();
        let so = dir.path().join("libdexnative.so");
        fs::write(&so, b"\x7fELF").unwrap();

        let output = dir.path().join("out.apk");
        repackage(
            &source,
            &dir.path().join("staging"),
            &output,
            &DEFAULT_EXCLUSIONS,
            &[
                NewEntry::new("AndroidManifest.xml", &manifest),
                NewEntry::new("classes.dex", &dex),
                NewEntry::new("lib/x86/libdexnative.so", &so),
            ],
        )
        .unwrap();

        let mut out = ZipArchive::new(File::open(&output).unwrap()).unwrap();
        let ordered: Vec<String> = (0..out.len()).map(|i| out.by_index(i).unwrap().name().to_string()).collect();
        assert_eq!(
            ordered,
            vec![
                "resources.arsc",
                "res/layout/main.xml",
                "META-INF/services/x",
                "AndroidManifest.xml",
                "classes.dex",
                "lib/x86/libdexnative.so",
            ]
        );

        let mut original = ZipArchive::new(File::open(&source).unwrap()).unwrap();
        let orig = original.by_name("resources.arsc").unwrap();
        let (crc, size) = (orig.crc32(), orig.size());
        drop(orig);
        let mut arsc = out.by_name("resources.arsc").unwrap();
        assert_eq!(arsc.compression(), CompressionMethod::Stored);
        assert_eq!((arsc.crc32(), arsc.size()), (crc, size));
        assert_eq!(arsc.data_start() % 4, 0);
        let mut data = Vec::new();
        arsc.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![7u8; 333]);
        drop(arsc);

        let layout = out.by_name("res/layout/main.xml").unwrap();
        assert_eq!(layout.compression(), CompressionMethod::Deflated);
        drop(layout);

        let lib = out.by_name("lib/x86/libdexnative.so").unwrap();
        assert_eq!(lib.compression(), CompressionMethod::Stored);
        assert_eq!(lib.data_start() % (16 * 1024), 0);
        drop(lib);

        let mut manifest = String::new();
        out.by_name("AndroidManifest.xml").unwrap().read_to_string(&mut manifest).unwrap();
        assert_eq!(manifest, "new manifest");
    }

    #[test]
    fn failed_write_leaves_previous_output_alone() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.apk");
        source_apk(&source);
        let output = dir.path().join("out.apk");
        fs::write(&output, b"previous").unwrap();

        let err = repackage(
            &source,
            &dir.path().join("staging"),
            &output,
            &DEFAULT_EXCLUSIONS,
            &[NewEntry::new("classes.dex", dir.path().join("missing.dex"))],
        );
        assert!(err.is_err());
        assert_eq!(fs::read(&output).unwrap(), b"previous");
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["in.apk", "out.apk", "staging"]);
    }

    #[test]
    fn escaping_entry_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.apk");
        let mut zip = zip::ZipWriter::new(File::create(&source).unwrap());
        zip.start_file("../../evil.txt", FileOptions::default()).unwrap();
        zip.write_all(b"x").unwrap();
        zip.finish().unwrap();

        let err = stage_entries(&source, &dir.path().join("staging"), &DEFAULT_EXCLUSIONS).unwrap_err();
        assert!(matches!(err, ApkZipError::InvalidInput(_)));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn padding_reaches_alignment() {
        for offset in [0u32, 1, 17, 4095] {
            let pad = alignment_padding(offset, 10, 4);
            assert_eq!((offset + 30 + 10 + pad) % 4, 0);
        }
        assert_eq!(alignment_padding(0, 2, 4), 0);
    }
}
