//! End-to-end scenarios exercising the public API across page, B+Tree, index
//! manager, and storage-engine layers together, rather than one module at a
//! time.

use crushdb_core::btree::{BPTree, SortOrder};
use crushdb_core::config::Config;
use crushdb_core::document::Document;
use crushdb_core::index_manager::{IndexDef, IndexManager};
use crushdb_core::value::{TypedValue, TAG_STR};
use crushdb_core::wal::NullJournal;
use crushdb_core::StorageEngine;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn insert_and_display_a_vehicle_document() {
    let mut doc = Document::new(123_456_789);
    doc.set("vehicleMake", TypedValue::Str("Subaru".into()));
    doc.set("vehicleModel", TypedValue::Str("Forester".into()));
    doc.set("vehicleYear", TypedValue::I32(2017));
    doc.set("vehicleType", TypedValue::Str("automobile".into()));
    doc.set("vehicleBodyStyle", TypedValue::Str("SUV".into()));
    doc.set("vehiclePrice", TypedValue::F64(28500.99));
    doc.set("hasHeating", TypedValue::Bool(true));

    assert_eq!(
        doc.to_display_string(),
        "{\"_id\": 123456789, \"vehicleMake\": \"Subaru\", \"vehicleModel\": \"Forester\", \
         \"vehicleYear\": 2017, \"vehicleType\": \"automobile\", \"vehicleBodyStyle\": \"SUV\", \
         \"vehiclePrice\": 28500.99, \"hasHeating\": true}"
    );
}

#[test]
fn deep_insert_ascending_ten_thousand_keys_locates_every_ref() {
    let mut tree: BPTree<i64, (i64, i64)> = BPTree::new(55, SortOrder::Asc, true, |a: &i64, b: &i64| a.cmp(b));
    let mut order: Vec<i64> = (1..=10_000).collect();
    // Deterministic shuffle so the test is reproducible without pulling in
    // a shuffling dependency at the integration-test level.
    for i in (1..order.len()).rev() {
        let j = (i * 2654435761u64 as usize) % (i + 1);
        order.swap(i, j);
    }

    for &k in &order {
        tree.insert(k, (k, k + 10_000)).unwrap();
    }

    for i in 1..=10_000i64 {
        let refs = tree.search(&i);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, i);
    }
}

#[test]
fn deep_insert_descending_leaf_order_runs_high_to_low() {
    let mut tree: BPTree<i64, (i64, i64)> = BPTree::new(55, SortOrder::Desc, true, |a: &i64, b: &i64| a.cmp(b));
    for i in 1..=10_000i64 {
        tree.insert(i, (i, i + 10_000)).unwrap();
    }

    let ordered: Vec<i64> = tree.iter_in_order().into_iter().map(|(k, _)| k).collect();
    let expected: Vec<i64> = (1..=10_000).rev().collect();
    assert_eq!(ordered, expected);
}

#[test]
fn unique_fruit_index_rejects_duplicate_and_keeps_original_refs() {
    let mut manager = IndexManager::new();
    manager
        .create_index(IndexDef {
            crate_name: "fruits".into(),
            index_name: "by_name".into(),
            field_name: "name".into(),
            type_tag: TAG_STR,
            unique: true,
            sort_order: SortOrder::Asc,
            order: 3,
        })
        .unwrap();

    let names = [
        "Apple",
        "Grape",
        "Orange",
        "Banana",
        "Pineapple",
        "BlueBerry",
        "StrawBerry",
        "Pear",
        "Kiwi",
        "Cherry",
    ];
    for (i, name) in names.iter().enumerate() {
        manager
            .insert("fruits", "by_name", TypedValue::Str((*name).into()), (i as u64, i as u64))
            .unwrap();
    }

    let err = manager
        .insert("fruits", "by_name", TypedValue::Str("Pineapple".into()), (99, 99))
        .unwrap_err();
    assert!(matches!(err, crushdb_core::CoreError::DuplicateKey { .. }));

    for (i, name) in names.iter().enumerate() {
        let found = manager.find("fruits", "by_name", &TypedValue::Str((*name).into())).unwrap();
        assert_eq!(found, vec![(i as u64, i as u64)]);
    }
}

#[test]
fn non_unique_country_index_range_scan_matches_literal_scenario() {
    let mut manager = IndexManager::new();
    manager
        .create_index(IndexDef {
            crate_name: "countries".into(),
            index_name: "by_name".into(),
            field_name: "name".into(),
            type_tag: TAG_STR,
            unique: false,
            sort_order: SortOrder::Asc,
            order: 3,
        })
        .unwrap();

    let countries = [
        "United States",
        "United Kingdom",
        "Kenya",
        "Brazil",
        "Barbados",
        "Chile",
        "Denmark",
        "Finland",
        "Germany",
        "Barbados",
        "Denmark",
    ];
    for (i, name) in countries.iter().enumerate() {
        manager
            .insert("countries", "by_name", TypedValue::Str((*name).into()), (i as u64, i as u64))
            .unwrap();
    }

    let result = manager
        .range_find(
            "countries",
            "by_name",
            Some(&TypedValue::Str("B".into())),
            Some(&TypedValue::Str("H".into())),
        )
        .unwrap();

    let mut keys: Vec<String> = result
        .iter()
        .map(|(k, _)| match k {
            TypedValue::Str(s) => s.clone(),
            _ => unreachable!(),
        })
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(
        keys,
        vec!["Barbados", "Brazil", "Chile", "Denmark", "Finland", "Germany"]
    );

    let count_of = |name: &str| result.iter().filter(|(k, _)| matches!(k, TypedValue::Str(s) if s == name)).count();
    assert_eq!(count_of("Barbados"), 2);
    assert_eq!(count_of("Denmark"), 2);
}

#[test]
fn storage_engine_finds_documents_through_a_secondary_index() {
    let dir = tempdir().unwrap();
    let engine = StorageEngine::open(dir.path(), Config::default(), Arc::new(NullJournal)).unwrap();
    engine.create_crate("Vehicle").unwrap();
    engine
        .create_index("Vehicle", "by_make", "vehicleMake", TAG_STR, false, SortOrder::Asc, 4)
        .unwrap();

    for make in ["Subaru", "Subaru", "Tesla", "BMW"] {
        engine
            .insert("Vehicle", vec![("vehicleMake".to_string(), TypedValue::Str(make.into()))])
            .unwrap();
    }

    assert_eq!(
        engine
            .find_by_index("Vehicle", "by_make", &TypedValue::Str("Subaru".into()))
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        engine
            .find_by_index("Vehicle", "by_make", &TypedValue::Str("Tesla".into()))
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        engine
            .find_by_index("Vehicle", "by_make", &TypedValue::Str("BMW".into()))
            .unwrap()
            .len(),
        1
    );
}
