//! Versioned entity-fact upserts and contradiction handling.

use mnemon::config::EngineConfig;
use mnemon::model::Category;
use mnemon::{Engine, SqliteStore};

const DIM: usize = 2;

fn test_engine() -> Engine<SqliteStore> {
    let store = SqliteStore::in_memory(DIM).expect("failed to create in-memory store");
    Engine::new(store, EngineConfig::default())
}

#[test]
fn first_upsert_creates_version_one() {
    let mut engine = test_engine();

    let result = engine
        .upsert_fact("user1", "favorite_color", "blue", vec![1.0, 0.0])
        .unwrap();

    assert_eq!(result.version, 1);
    assert!(!result.contradiction);

    let active = engine.active_fact("user1", "favorite_color").unwrap().unwrap();
    assert_eq!(active.fact_value, "blue");
    assert_eq!(active.version, 1);
    assert!(active.superseded_by.is_none());

    // The backing item is a ranked memory like any other.
    let item = engine.get(active.item_id).unwrap();
    assert_eq!(item.category, Category::EntityFact);
    assert!(item.lexical_text.contains("favorite_color"));
    assert!(item.lexical_text.contains("blue"));
}

#[test]
fn same_value_upsert_is_a_refresh_not_a_new_version() {
    let mut engine = test_engine();

    let first = engine
        .upsert_fact("user1", "favorite_color", "blue", vec![1.0, 0.0])
        .unwrap();
    let second = engine
        .upsert_fact("user1", "favorite_color", "blue", vec![1.0, 0.0])
        .unwrap();

    assert_eq!(second.version, 1);
    assert_eq!(second.item_id, first.item_id);
    assert!(!second.contradiction);

    // Usage was refreshed on the existing backing item.
    let item = engine.get(first.item_id).unwrap();
    assert_eq!(item.access_count, 1);

    assert_eq!(engine.fact_versions("user1", "favorite_color").unwrap().len(), 1);
}

#[test]
fn differing_value_flags_a_contradiction_and_supersedes() {
    let mut engine = test_engine();

    let blue = engine
        .upsert_fact("user1", "favorite_color", "blue", vec![1.0, 0.0])
        .unwrap();
    let red = engine
        .upsert_fact("user1", "favorite_color", "red", vec![0.0, 1.0])
        .unwrap();

    assert_eq!(red.version, 2);
    assert!(red.contradiction);

    // The old value is kept, superseded by the new record.
    let versions = engine.fact_versions("user1", "favorite_color").unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].fact_value, "blue");
    assert_eq!(versions[0].superseded_by, Some(red.item_id));
    assert_eq!(versions[1].fact_value, "red");
    assert!(versions[1].superseded_by.is_none());

    let active = engine.active_fact("user1", "favorite_color").unwrap().unwrap();
    assert_eq!(active.item_id, red.item_id);
    assert_ne!(active.item_id, blue.item_id);
}

#[test]
fn n_distinct_upserts_leave_one_active_and_n_minus_one_superseded() {
    let mut engine = test_engine();

    let values = ["blue", "red", "green", "purple", "teal"];
    for value in values {
        engine
            .upsert_fact("user1", "favorite_color", value, vec![1.0, 0.0])
            .unwrap();
    }

    let versions = engine.fact_versions("user1", "favorite_color").unwrap();
    assert_eq!(versions.len(), values.len());

    let active: Vec<_> = versions.iter().filter(|f| f.superseded_by.is_none()).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fact_value, "teal");
    assert_eq!(active[0].version, values.len() as u32);

    let superseded = versions.iter().filter(|f| f.superseded_by.is_some()).count();
    assert_eq!(superseded, values.len() - 1);

    // Versions are strictly increasing from 1.
    for (i, fact) in versions.iter().enumerate() {
        assert_eq!(fact.version, (i + 1) as u32);
    }
}

#[test]
fn distinct_key_pairs_do_not_interfere() {
    let mut engine = test_engine();

    engine
        .upsert_fact("user1", "favorite_color", "blue", vec![1.0, 0.0])
        .unwrap();
    let other_fact = engine
        .upsert_fact("user1", "home_city", "lisbon", vec![0.0, 1.0])
        .unwrap();
    let other_entity = engine
        .upsert_fact("user2", "favorite_color", "red", vec![0.0, 1.0])
        .unwrap();

    assert_eq!(other_fact.version, 1);
    assert!(!other_fact.contradiction);
    assert_eq!(other_entity.version, 1);
    assert!(!other_entity.contradiction);

    let active = engine.active_fact("user1", "favorite_color").unwrap().unwrap();
    assert_eq!(active.fact_value, "blue");
}

#[test]
fn missing_fact_is_none_not_an_error() {
    let engine = test_engine();
    assert!(engine.active_fact("nobody", "nothing").unwrap().is_none());
    assert!(engine.fact_versions("nobody", "nothing").unwrap().is_empty());
}
