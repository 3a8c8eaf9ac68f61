mod common;

use std::collections::HashSet;

use proptest::prelude::*;
use schema_sync::db::Database;
use schema_sync::naming;
use schema_sync::registry::SchemaRegistry;

use common::TestWorkspace;

#[test]
fn messy_names_round_trip_through_the_registry() {
    let db = Database::open_in_memory().expect("in-memory database");
    let registry = SchemaRegistry::new(&db);
    let raws = [
        "2nd Payment %",
        "_id",
        "Status",
        "STATUS ",
        "Prénom",
        "  spaced   out  ",
        "日本語",
        "%%%",
        "",
        "select",
    ];
    for raw in raws {
        let mapping = registry.resolve_field("orders", raw).expect("resolve");
        let back = registry
            .reverse("orders", &mapping.safe_name)
            .expect("reverse lookup");
        assert_eq!(back.as_deref(), Some(raw), "round trip failed for {raw:?}");
    }
}

#[test]
fn documented_examples_resolve_as_expected() {
    let db = Database::open_in_memory().expect("in-memory database");
    let registry = SchemaRegistry::new(&db);

    let payment = registry.resolve_field("orders", "2nd Payment %").unwrap();
    assert_eq!(payment.safe_name, "f2ndPayment");

    let id = registry.resolve_field("orders", "_id").unwrap();
    assert_eq!(id.safe_name, "idField");

    let status = registry.resolve_field("orders", "Status").unwrap();
    let shouting = registry.resolve_field("orders", "STATUS ").unwrap();
    assert_eq!(status.safe_name, "status");
    assert_eq!(shouting.safe_name, "status1");
    assert_eq!(
        registry.reverse("orders", "status1").unwrap().as_deref(),
        Some("STATUS ")
    );
}

#[test]
fn resolution_is_deterministic_across_process_restarts() {
    let workspace = TestWorkspace::new();
    let raws = ["Order Total", "order total", "2nd Item", "%%%"];

    let first_pass: Vec<String> = {
        let db = Database::open(&workspace.db_path()).expect("open database");
        let registry = SchemaRegistry::new(&db);
        raws.iter()
            .map(|raw| registry.resolve_field("orders", raw).unwrap().safe_name)
            .collect()
    };

    // reopen the same file, as a fresh process would
    let db = Database::open(&workspace.db_path()).expect("reopen database");
    let registry = SchemaRegistry::new(&db);
    for (raw, expected) in raws.iter().zip(&first_pass) {
        let mapping = registry.resolve_field("orders", raw).unwrap();
        assert_eq!(&mapping.safe_name, expected);
    }
    assert_eq!(registry.mappings("orders").unwrap().len(), raws.len());
}

proptest! {
    #[test]
    fn round_trip_and_uniqueness_hold_for_arbitrary_names(
        raws in proptest::collection::hash_set(".{0,40}", 1..25)
    ) {
        let db = Database::open_in_memory().unwrap();
        let registry = SchemaRegistry::new(&db);
        let mut safe_names = HashSet::new();
        for raw in &raws {
            let mapping = registry.resolve_field("t", raw).unwrap();
            let back = registry.reverse("t", &mapping.safe_name).unwrap();
            prop_assert_eq!(back.as_deref(), Some(raw.as_str()));
            safe_names.insert(mapping.safe_name);
        }
        // no two distinct raw names share a safe name
        prop_assert_eq!(safe_names.len(), raws.len());
    }

    #[test]
    fn normalize_always_yields_a_valid_identifier(raw in ".{0,60}") {
        let candidate = naming::normalize(&raw);
        prop_assert!(!candidate.is_empty());
        if !candidate.starts_with(naming::FALLBACK_PREFIX) {
            prop_assert!(candidate.chars().next().unwrap().is_ascii_alphabetic());
            prop_assert!(candidate.chars().all(|ch| ch.is_ascii_alphanumeric()));
        }
    }
}
