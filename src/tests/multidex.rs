use std::collections::BTreeSet;
use std::fs;

use crate::dex::class::RefTarget;
use crate::dex::container::Container;
use crate::dex::opcodes::{OP_CONST, OP_CONST_STRING_JUMBO, OP_INVOKE_STATIC, OP_RETURN_VOID};
use crate::protect::assembler::{assemble, write_containers};
use crate::protect::entry_point::{rewrite_primary, EntryPoint};
use crate::protect::filter::{AcceptAll, AcceptNone};
use crate::protect::index::ClassIndex;
use crate::protect::resolver::{resolve_main_classes, ChainEnd};
use crate::protect::trampoline::load_library_method;
use crate::tests::fixtures::*;

fn descriptors(containers: &[Container]) -> Vec<String> {
    containers
        .iter()
        .flat_map(|c| c.classes().iter().map(|k| k.descriptor.clone()))
        .collect()
}

#[test]
fn chain_across_three_containers_lands_in_primary() {
    let run = process(&three_containers(), &AcceptAll);
    let index = ClassIndex::load(&run.global).expect("load index");

    let main = resolve_main_classes(&index, "com.example.App").expect("resolve");
    assert_eq!(main.chain, vec![APP, BASE]);
    assert_eq!(main.end, ChainEnd::PlatformRoot);

    let out = assemble(&index, &run.global, &main, 60000).expect("assemble");
    assert_eq!(out.len(), 1);
    assert!(out[0].contains(APP));
    assert!(out[0].contains(BASE));
}

#[test]
fn main_classes_stay_in_primary_under_pressure() {
    let mut inputs = three_containers();
    let fillers: Vec<_> = (0..12).map(|i| filler_class(i, 4)).collect();
    inputs.insert(0, container(fillers));
    let run = process(&inputs, &AcceptNone);
    let index = ClassIndex::load(&run.global).expect("load index");
    let main = resolve_main_classes(&index, "com.example.App").expect("resolve");

    let out = assemble(&index, &run.global, &main, 20).expect("assemble");
    assert!(out.len() > 2, "expected a split, got {} containers", out.len());
    assert!(out[0].contains(APP) && out[0].contains(BASE));
    for (i, c) in out.iter().enumerate() {
        assert!(!c.pool_counts().exceeds(20), "container {} is {}", i, c.pool_counts());
    }
    let primary: Vec<&str> = out[0].classes().iter().map(|c| c.descriptor.as_str()).collect();
    assert_eq!(&primary[..2], &[BASE, APP]);
}

#[test]
fn every_class_comes_out_exactly_once() {
    let mut inputs = three_containers();
    inputs.push(container((0..10).map(|i| filler_class(i, 3)).collect()));
    // a duplicate definition in a later shard is dropped
    inputs.push(container(vec![util_class()]));
    let run = process(&inputs, &AcceptAll);
    let index = ClassIndex::load(&run.global).expect("load index");
    let main = resolve_main_classes(&index, "com.example.App").expect("resolve");
    let out = assemble(&index, &run.global, &main, 16).expect("assemble");

    let produced = descriptors(&out);
    let unique: BTreeSet<String> = produced.iter().cloned().collect();
    assert_eq!(produced.len(), unique.len(), "duplicates in {:?}", produced);

    let expected: BTreeSet<String> = inputs.iter().flat_map(|c| descriptors(std::slice::from_ref(c))).collect();
    assert_eq!(unique, expected);
}

#[test]
fn accepting_nothing_changes_nothing() {
    let run = process(&three_containers(), &AcceptNone);
    for (shard, input) in run.global.shards.iter().zip(&run.inputs) {
        let original = read_container(input);
        let native = read_container(&shard.native_dex);
        assert_eq!(native.classes(), original.classes());
        assert!(read_container(&shard.symbol_dex).is_empty());
        assert!(shard.native_classes().is_empty());
    }
    assert_eq!(run.global.native_method_count(), 0);

    let index = ClassIndex::load(&run.global).expect("load index");
    let main = resolve_main_classes(&index, "com.example.App").expect("resolve");
    let out = assemble(&index, &run.global, &main, 60000).expect("assemble");
    for class in out.iter().flat_map(|c| c.classes()) {
        let (_, original) = index.lookup(&class.descriptor).expect("class from the input");
        assert_eq!(class, original);
    }
    assert_eq!(out.iter().map(|c| c.len()).sum::<usize>(), 4);
}

#[test]
fn reprocessing_native_containers_is_a_no_op() {
    let first = process(&three_containers(), &AcceptAll);
    let natives: Vec<_> = first.global.shards.iter().map(|s| s.native_dex.clone()).collect();

    let dir = tempfile::tempdir().expect("tempdir");
    let second = process_files(natives.clone(), dir, &AcceptNone);
    for (before, shard) in natives.iter().zip(&second.global.shards) {
        assert_eq!(
            fs::read(before).expect("first pass output"),
            fs::read(&shard.native_dex).expect("second pass output"),
            "{} changed",
            before.display()
        );
    }
    // the first pass left no eligible method behind either
    let third = process_files(natives, tempfile::tempdir().expect("tempdir"), &AcceptAll);
    assert_eq!(third.global.native_method_count(), 0);
}

#[test]
fn library_loads_before_the_trampoline() {
    let run = process(&three_containers(), &AcceptAll);
    let index = ClassIndex::load(&run.global).expect("load index");
    let main = resolve_main_classes(&index, "com.example.App").expect("resolve");
    let out = assemble(&index, &run.global, &main, 60000).expect("assemble");
    let files = write_containers(&out, &run.path("out")).expect("write containers");

    let entry = rewrite_primary(&files[0], &main, &run.global, "dexnative").expect("rewrite primary");
    assert_eq!(entry, EntryPoint::Existing(BASE.to_string()));

    let primary = read_container(&files[0]);
    let base = primary.get(BASE).expect("base in primary");
    let clinit = base.methods().find(|m| m.is_class_initializer()).expect("class initializer");
    let code = clinit.code.as_ref().expect("initializer code");
    assert_eq!(
        opcodes(&code.insns),
        vec![OP_CONST_STRING_JUMBO, OP_INVOKE_STATIC, OP_CONST, OP_INVOKE_STATIC, OP_RETURN_VOID]
    );
    assert_eq!(code.refs[0].target, RefTarget::String("dexnative".to_string()));
    assert_eq!(code.refs[1].target, RefTarget::Method(load_library_method()));
    assert_eq!(code.refs[2].target, RefTarget::Method(run.global.shards[1].register_method_ref()));

    // only the entry class loads the library
    let app = primary.get(APP).expect("app in primary");
    let app_init = app.methods().find(|m| m.is_class_initializer()).expect("app trampoline");
    assert_eq!(opcodes(&app_init.code.as_ref().expect("code").insns)[0], OP_CONST);

    let register = primary.get("Lcom/dexnative/protect/NativeUtil;").expect("register class");
    assert_eq!(register.methods().count(), 3);
    let init = fs::read_to_string(&run.global.jni_init).expect("jni init source");
    assert!(init.contains("initClass2"));
}
