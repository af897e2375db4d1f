use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use zip::{CompressionMethod, ZipArchive};

use crate::android::manifest::BinaryManifest;
use crate::config::ProtectConfig;
use crate::dex::container::Container;
use crate::error::{ProtectError, ProtectResult};
use crate::protect::entry_point::{EntryPoint, LOAD_LIB_APP};
use crate::protect::filter::AcceptAll;
use crate::protect::native_build::NativeBuilder;
use crate::protect::strategy::ShuffledOpcodes;
use crate::protect::templates::OPCODE_HEADER;
use crate::protect::Protector;
use crate::tests::fixtures::*;

const BLOB: &str = "assets/blob.bin";

fn blob() -> Vec<u8> {
    (0..1500u32).map(|i| (i * 7 % 251) as u8).collect()
}

fn input_apk(path: &Path, app_name: Option<&str>) {
    let manifest = manifest(app_name);
    let dex: Vec<Vec<u8>> = three_containers()
        .iter()
        .map(|c| c.to_bytes().expect("serialize input"))
        .collect();
    let blob = blob();
    let mut entries: Vec<(&str, &[u8], CompressionMethod)> = vec![
        ("AndroidManifest.xml", manifest.as_slice(), CompressionMethod::Deflated),
        ("classes.dex", dex[0].as_slice(), CompressionMethod::Deflated),
        ("classes2.dex", dex[1].as_slice(), CompressionMethod::Deflated),
        ("classes3.dex", dex[2].as_slice(), CompressionMethod::Deflated),
    ];
    entries.extend([
        (BLOB, blob.as_slice(), CompressionMethod::Stored),
        ("res/layout/main.xml", b"<LinearLayout/>".as_slice(), CompressionMethod::Deflated),
        ("lib/arm64-v8a/libexisting.so", b"\x7fELF existing".as_slice(), CompressionMethod::Stored),
        ("META-INF/CERT.RSA", b"signature".as_slice(), CompressionMethod::Stored),
    ]);
    write_apk(path, &entries);
}

fn protector(work: &Path) -> Protector {
    Protector::new(ProtectConfig::default())
        .expect("default config")
        .with_policy(AcceptAll)
        .with_strategy(|| ShuffledOpcodes::from_seed(5))
        .with_builder(StubBuilder)
        .with_work_dir(work)
}

fn read(archive: &mut ZipArchive<File>, name: &str) -> Vec<u8> {
    let mut entry = archive.by_name(name).unwrap_or_else(|_| panic!("{} missing", name));
    let mut data = Vec::new();
    entry.read_to_end(&mut data).expect("read entry");
    data
}

#[test]
fn protects_an_apk_without_application_class() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.apk");
    let output = dir.path().join("out.apk");
    let work = dir.path().join("work");
    input_apk(&input, None);

    let report = protector(&work).protect(&input, &output).expect("protect");
    assert_eq!(report.package, PACKAGE);
    assert_eq!(report.entry_point, EntryPoint::Synthesized(LOAD_LIB_APP.to_string()));
    assert_eq!(report.application, "com.dexnative.protect.LoadLibApp");
    assert_eq!(report.input_containers, 3);
    assert_eq!(report.output_containers, 1);
    assert_eq!(report.abis, vec!["arm64-v8a"]);
    assert_eq!(report.libraries, vec!["lib/arm64-v8a/libdexnative.so"]);
    assert!(report.native_methods >= 4);
    // scratch space is gone
    assert_eq!(fs::read_dir(&work).expect("work dir").count(), 0);

    let mut archive = ZipArchive::new(File::open(&output).expect("open output")).expect("output zip");
    let names: BTreeSet<String> = archive.file_names().map(str::to_string).collect();
    assert!(!names.contains("META-INF/CERT.RSA"));
    assert!(!names.contains("classes2.dex"));
    assert!(names.contains("res/layout/main.xml"));
    assert!(names.contains("lib/arm64-v8a/libexisting.so"));

    let manifest = BinaryManifest::from_bytes(&read(&mut archive, "AndroidManifest.xml")).expect("manifest");
    assert_eq!(manifest.application_name().expect("name"), "com.dexnative.protect.LoadLibApp");
    assert_eq!(read(&mut archive, "lib/arm64-v8a/libdexnative.so"), b"\x7fELF arm64-v8a");

    let primary = Container::from_bytes(&read(&mut archive, "classes.dex")).expect("primary");
    for desc in [UTIL, SCREEN, BASE, APP, LOAD_LIB_APP, "Lcom/dexnative/protect/NativeUtil;"] {
        assert!(primary.contains(desc), "{} missing", desc);
    }
    let run = primary.get(APP).and_then(|c| c.methods().find(|m| m.method.name == "run")).expect("run");
    assert!(run.is_native());
}

#[test]
fn retained_stored_entries_are_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.apk");
    let output = dir.path().join("out.apk");
    input_apk(&input, None);
    protector(&dir.path().join("work")).protect(&input, &output).expect("protect");

    let mut before = ZipArchive::new(File::open(&input).expect("open input")).expect("input zip");
    let mut after = ZipArchive::new(File::open(&output).expect("open output")).expect("output zip");
    for name in [BLOB, "lib/arm64-v8a/libexisting.so"] {
        let (crc, size) = {
            let e = before.by_name(name).expect("input entry");
            (e.crc32(), e.size())
        };
        let e = after.by_name(name).expect("output entry");
        assert_eq!(e.compression(), CompressionMethod::Stored);
        assert_eq!((e.crc32(), e.size()), (crc, size), "{}", name);
    }
    assert_eq!(read(&mut after, BLOB), blob());
}

#[test]
fn existing_application_keeps_the_manifest_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.apk");
    let output = dir.path().join("out.apk");
    input_apk(&input, Some("com.example.App"));

    let report = protector(&dir.path().join("work"))
        .without_native_build()
        .protect(&input, &output)
        .expect("protect");
    assert_eq!(report.entry_point, EntryPoint::Existing(BASE.to_string()));
    assert_eq!(report.application, "com.example.App");
    assert!(report.libraries.is_empty());

    let mut archive = ZipArchive::new(File::open(&output).expect("open output")).expect("output zip");
    let manifest = BinaryManifest::from_bytes(&read(&mut archive, "AndroidManifest.xml")).expect("manifest");
    assert_eq!(manifest.application_name().expect("name"), "com.example.App");
    assert!(archive.by_name("lib/arm64-v8a/libdexnative.so").is_err());
    let primary = Container::from_bytes(&read(&mut archive, "classes.dex")).expect("primary");
    assert!(!primary.contains(LOAD_LIB_APP));
}

#[test]
fn input_without_manifest_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.apk");
    write_apk(&input, &[("classes.dex", b"dex\n035\0".as_slice(), CompressionMethod::Stored)]);
    let err = protector(&dir.path().join("work"))
        .protect(&input, &dir.path().join("out.apk"))
        .unwrap_err();
    assert!(matches!(err, ProtectError::Manifest(_)), "{}", err);
    assert!(!dir.path().join("out.apk").exists());
}

#[test]
fn input_without_containers_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.apk");
    let manifest = manifest(None);
    write_apk(&input, &[("AndroidManifest.xml", manifest.as_slice(), CompressionMethod::Deflated)]);
    let err = protector(&dir.path().join("work"))
        .protect(&input, &dir.path().join("out.apk"))
        .unwrap_err();
    assert!(matches!(err, ProtectError::Invariant(_)), "{}", err);
}

#[test]
fn undefined_declared_application_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.apk");
    let output = dir.path().join("out.apk");
    input_apk(&input, Some("com.example.Missing"));

    let err = protector(&dir.path().join("work")).protect(&input, &output).unwrap_err();
    assert!(matches!(err, ProtectError::Invariant(_)), "{}", err);
    assert!(err.to_string().contains("com.example.Missing"), "{}", err);
    assert!(!output.exists());
}

/// Records the opcode header each build compiles against.
struct HeaderRecorder(Rc<RefCell<Vec<String>>>);

impl NativeBuilder for HeaderRecorder {
    fn build(&self, source_root: &Path, build_root: &Path, abi: &str) -> ProtectResult<Vec<PathBuf>> {
        let header = fs::read_to_string(source_root.join(OPCODE_HEADER)).expect("templated header");
        self.0.borrow_mut().push(header);
        StubBuilder.build(source_root, build_root, abi)
    }
}

#[test]
fn every_run_shuffles_opcodes_anew() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template = dir.path().join("template");
    fs::create_dir_all(&template).expect("template dir");
    fs::write(
        template.join(OPCODE_HEADER),
        "enum Opcode {\n    OP_NOP = 0x00,\n};\nstatic const void* _name[kNumPackedOpcodes] = {\n};\n",
    )
    .expect("write header");
    let input = dir.path().join("in.apk");
    input_apk(&input, None);

    let headers = Rc::new(RefCell::new(Vec::new()));
    let config = ProtectConfig {
        template_dir: Some(template),
        ..ProtectConfig::default()
    };
    let protector = Protector::new(config)
        .expect("config")
        .with_policy(AcceptAll)
        .with_builder(HeaderRecorder(headers.clone()))
        .with_work_dir(dir.path().join("work"));
    protector.protect(&input, &dir.path().join("a.apk")).expect("first run");
    protector.protect(&input, &dir.path().join("b.apk")).expect("second run");

    let headers = headers.borrow();
    assert_eq!(headers.len(), 2);
    assert!(headers[0].contains("OP_ADD_INT = 0x"));
    assert_ne!(headers[0], headers[1]);
}
