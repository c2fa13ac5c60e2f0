//! Configuration store persistence and repair

use imgly_upscale::config::{ConfigStore, EngineConfig, QualityWeights};
use imgly_upscale::EnhanceError;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_save_of_loaded_config_is_a_fixed_point() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.json");
    let store = ConfigStore::open(&path).unwrap();

    let loaded = store.load().unwrap();
    assert!(loaded.is_clean());
    store.save(&loaded.config).unwrap();
    let first = std::fs::read_to_string(&path).unwrap();

    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.config, loaded.config);
    store.save(&reloaded.config).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
}

#[test]
fn test_weights_summing_to_point_nine_are_repaired_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.json");

    let mut config = EngineConfig::default();
    config.quality.weights = QualityWeights {
        edge: 0.3,
        contrast: 0.2,
        detail: 0.2,
        noise: 0.2,
    };
    config.quality.min_score = 0.25;
    config.engine.batch_concurrency = 5;

    let issues = config.validate();
    assert!(!issues.is_empty());
    assert!(issues.iter().any(|issue| issue.subtree == "/quality/weights"
        && issue.message.contains("sum to 1.0")));

    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    let store = ConfigStore::open(&path).unwrap();
    let live = store.snapshot();

    assert_eq!(live.quality.weights, QualityWeights::default());
    assert!((live.quality.min_score - 0.25).abs() < f64::EPSILON);
    assert_eq!(live.engine.batch_concurrency, 5);
    assert!(!store.last_issues().is_empty());
}

#[test]
fn test_save_rejects_invalid_tree_and_keeps_live_config() {
    let store = ConfigStore::in_memory();
    let mut config = EngineConfig::default();
    config.quality.weights.edge = 0.9;

    assert!(matches!(store.save(&config), Err(EnhanceError::Config(_))));
    assert_eq!(*store.snapshot(), EngineConfig::default());
}

#[test]
fn test_out_of_bounds_stage_parameter_resets_only_that_stage() {
    let store = ConfigStore::in_memory();
    let loaded = store.load_from_str(
        &json!({
            "stages": {
                "histogram_equalization": { "version": 1, "params": { "clip_limit": -3.0 } },
                "sharpening": { "version": 1, "enabled": false }
            }
        })
        .to_string(),
    );

    assert!(loaded
        .issues
        .iter()
        .any(|issue| issue.subtree.contains("histogram_equalization")));
    let defaults = EngineConfig::default();
    assert_eq!(
        loaded.config.stages["histogram_equalization"],
        defaults.stages["histogram_equalization"]
    );
    assert!(!loaded.config.stages["sharpening"].enabled);
}

#[test]
fn test_override_is_not_persisted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.json");
    let store = ConfigStore::open(&path).unwrap();
    store.save(&EngineConfig::default()).unwrap();

    let live = store
        .apply_override(&json!({ "quality": { "min_score": 0.5 } }))
        .unwrap();
    assert!((live.quality.min_score - 0.5).abs() < f64::EPSILON);

    let on_disk = store.load().unwrap();
    assert!((on_disk.config.quality.min_score - 0.1).abs() < f64::EPSILON);
}

#[test]
fn test_reset_export_and_import() {
    let dir = TempDir::new().unwrap();
    let store = ConfigStore::open(dir.path().join("engine.json")).unwrap();
    store
        .apply_override(&json!({ "engine": { "batch_concurrency": 7 } }))
        .unwrap();

    let exported = dir.path().join("exported.json");
    store.export_to(&exported).unwrap();

    let reset = store.reset_to_default().unwrap();
    assert_eq!(reset.engine.batch_concurrency, 2);
    assert_eq!(store.snapshot().engine.batch_concurrency, 2);

    let issues = store.import_from(&exported).unwrap();
    assert!(issues.is_empty());
    assert_eq!(store.snapshot().engine.batch_concurrency, 7);
}

#[test]
fn test_readers_never_see_a_partial_swap() {
    let mut seed = EngineConfig::default();
    seed.engine.max_scale_factor = 8 + seed.engine.batch_concurrency as u32;
    let store = Arc::new(ConfigStore::from_config(seed).unwrap());
    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..50 {
                let concurrency = 1 + i % 4;
                let patch = json!({
                    "engine": { "batch_concurrency": concurrency, "max_scale_factor": 8 + concurrency }
                });
                store.apply_override(&patch).unwrap();
            }
        })
    };

    for _ in 0..200 {
        let snapshot = store.snapshot();
        assert_eq!(
            snapshot.engine.max_scale_factor,
            8 + snapshot.engine.batch_concurrency as u32
        );
    }
    writer.join().unwrap();
}
