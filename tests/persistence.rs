//! Persistence and recovery tests for the pro engine.
//!
//! These tests verify that the sequence model, dataset manifest, message
//! database, meta-optimizer history and index snapshot survive an engine
//! restart, and that damaged files degrade to a fresh start.

use std::path::Path;

use pro_engine::config::EngineConfig;
use pro_engine::engine::Engine;
use pro_engine::memory::{DurableMessageStore, MessageStore};
use pro_engine::meta::MetaOptimizer;
use pro_engine::paths::ProPaths;

fn persistent_engine(dir: &Path) -> Engine {
    Engine::new(EngineConfig::with_data_dir(dir)).unwrap()
}

fn write_dataset(dir: &Path, name: &str, text: &str) {
    let datasets = ProPaths::rooted(dir).datasets_dir();
    std::fs::create_dir_all(&datasets).unwrap();
    std::fs::write(datasets.join(name), text).unwrap();
}

#[tokio::test]
async fn model_and_manifest_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    write_dataset(dir.path(), "garden.txt", "roses bloom in the quiet garden");

    // First session: train from datasets and talk once.
    {
        let engine = persistent_engine(dir.path());
        assert!(engine.scan_datasets().await.unwrap());
        engine.process_message("roses and tulips").await;
        engine.shutdown().await;
    }

    // Second session: everything learned is back, nothing to rescan.
    {
        let engine = persistent_engine(dir.path());
        let (roses, tulips) = engine
            .with_model(|m| (m.word_counts.count("roses"), m.word_counts.count("tulips")))
            .await;
        assert!(roses >= 2.0);
        assert!(tulips > 0.0);
        assert!(!engine.scan_datasets().await.unwrap());
    }
}

#[tokio::test]
async fn messages_and_meta_history_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    write_dataset(dir.path(), "sky.txt", "clouds drift across the evening sky");

    let turns = ["hello clouds", "what about the sky"];
    {
        let engine = persistent_engine(dir.path());
        engine.scan_datasets().await.unwrap();
        for t in turns {
            engine.process_message(t).await;
        }
        engine.shutdown().await;
    }

    let paths = ProPaths::rooted(dir.path());
    let store = DurableMessageStore::open(&paths.messages_dir()).unwrap();
    let recent = store.fetch_recent(10).await.unwrap();
    assert_eq!(recent, ["what about the sky", "hello clouds"]);

    let meta = MetaOptimizer::open(paths.meta_file());
    assert_eq!(meta.history().len(), turns.len());
}

#[tokio::test]
async fn index_snapshot_is_written_and_reused() {
    let dir = tempfile::TempDir::new().unwrap();
    write_dataset(dir.path(), "sea.txt", "waves break on the rocky shore\nthe shore is cold");

    let vocab = {
        let engine = persistent_engine(dir.path());
        engine.scan_datasets().await.unwrap();
        engine.process_message("waves").await;
        engine.shutdown().await;
        engine.stats().await.index_vocab
    };
    let paths = ProPaths::rooted(dir.path());
    assert!(paths.index_snapshot().exists());

    // The dataset is gone but the snapshot still carries the index.
    std::fs::remove_file(paths.datasets_dir().join("sea.txt")).unwrap();
    let engine = persistent_engine(dir.path());
    assert_eq!(engine.stats().await.index_vocab, vocab);
}

#[tokio::test]
async fn corrupted_state_starts_fresh() {
    let dir = tempfile::TempDir::new().unwrap();
    let paths = ProPaths::rooted(dir.path());
    paths.ensure_dirs().unwrap();
    std::fs::write(paths.state_file(), b"{ not json").unwrap();
    std::fs::write(paths.meta_file(), b"[]").unwrap();

    let engine = persistent_engine(dir.path());
    assert_eq!(engine.stats().await.words, 0);
    let (response, _) = engine.process_message("still works").await;
    assert!(response.ends_with('.'));
}

#[tokio::test]
async fn config_file_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let paths = ProPaths::rooted(dir.path());
    let config = EngineConfig {
        data_dir: Some(dir.path().to_path_buf()),
        chaos_variants: vec![0.0, 1.0],
        echo_guard: false,
        memory_combiner: "phase-magnitude".into(),
        ..EngineConfig::default()
    };
    config.save(&paths.config_file()).unwrap();

    let loaded = EngineConfig::load(&paths.config_file()).unwrap();
    assert_eq!(loaded.chaos_variants, [0.0, 1.0]);
    assert!(!loaded.echo_guard);
    let engine = Engine::new(loaded).unwrap();
    assert_eq!(engine.config().memory_combiner, "phase-magnitude");
}
