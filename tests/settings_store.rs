use std::fs;

use framelift::effects;
use framelift::schema::{
    CustomMode, GpuBenchmarkResult, PerformanceTier, ResolutionPolicy, TierScores,
};
use framelift::settings::{LocalSettings, SettingsStore, SyncedSettings, YamlSettingsStore};
use tempfile::tempdir;

fn benchmark_result() -> GpuBenchmarkResult {
    let mut mean_frame_ms = TierScores::default();
    mean_frame_ms.set(PerformanceTier::Performance, 6.5);
    mean_frame_ms.set(PerformanceTier::Balanced, 14.0);
    let mut max_frame_ms = TierScores::default();
    max_frame_ms.set(PerformanceTier::Performance, 9.0);
    max_frame_ms.set(PerformanceTier::Balanced, 22.0);
    GpuBenchmarkResult {
        recommended_tier: PerformanceTier::Balanced,
        mean_frame_ms,
        max_frame_ms,
        timestamp_ms: 1_700_000_000_000,
        adapter: "test adapter".to_owned(),
    }
}

#[tokio::test]
async fn missing_file_loads_defaults() {
    let dir = tempdir().expect("tempdir should create");
    let store = YamlSettingsStore::new(dir.path().join("framelift.yaml"));
    let document = store.load_document().await.expect("defaults");
    assert_eq!(document, Default::default());
    assert!(!store.path().exists(), "loading must not create the file");
}

#[tokio::test]
async fn synced_round_trip_creates_parent_directories() {
    let dir = tempdir().expect("tempdir should create");
    let store = YamlSettingsStore::new(dir.path().join("nested/config/framelift.yaml"));
    let synced = SyncedSettings {
        selected_mode_id: "custom-sharp".to_owned(),
        target_resolution: ResolutionPolicy::P1080,
        custom_modes: vec![CustomMode {
            id: "custom-sharp".to_owned(),
            name: "Sharp".to_owned(),
            effects: effects::catalog()[..2].to_vec(),
        }],
        cross_origin_fix: true,
        ..SyncedSettings::default()
    };
    store.save_synced(&synced).await.expect("save synced");

    let reloaded = YamlSettingsStore::new(store.path());
    let document = reloaded.load_document().await.expect("reload");
    assert_eq!(document.synced, synced);
    assert_eq!(document.local, LocalSettings::default());

    let settings = reloaded.load().await.expect("merged settings");
    assert_eq!(settings.selected_mode().id(), "custom-sharp");
    assert!(settings.cross_origin_fix);
}

#[tokio::test]
async fn saving_local_settings_preserves_synced_partition() {
    let dir = tempdir().expect("tempdir should create");
    let store = YamlSettingsStore::new(dir.path().join("framelift.yaml"));
    let synced = SyncedSettings {
        selected_mode_id: "builtin-mode-b".to_owned(),
        ..SyncedSettings::default()
    };
    store.save_synced(&synced).await.expect("save synced");

    let local = LocalSettings {
        performance_tier: PerformanceTier::Balanced,
        benchmark: Some(benchmark_result()),
        onboarding_completed: true,
    };
    store.save_local(&local).await.expect("save local");

    let document = store.load_document().await.expect("reload");
    assert_eq!(document.synced, synced);
    assert_eq!(document.local, local);
    let settings = store.load().await.expect("merged settings");
    assert_eq!(settings.performance_tier, PerformanceTier::Balanced);
}

#[tokio::test]
async fn hand_written_yaml_with_missing_keys_is_accepted() {
    let dir = tempdir().expect("tempdir should create");
    let path = dir.path().join("framelift.yaml");
    fs::write(
        &path,
        "synced:\n  target_resolution: 4k\nlocal:\n  performance_tier: ultra\n",
    )
    .expect("settings should write");

    let settings = YamlSettingsStore::new(&path).load().await.expect("load");
    assert_eq!(settings.target_resolution, ResolutionPolicy::K4);
    assert_eq!(settings.performance_tier, PerformanceTier::Ultra);
    assert_eq!(settings.selected_mode().id(), "builtin-mode-a");
}

#[tokio::test]
async fn corrupt_file_reports_path_and_location() {
    let dir = tempdir().expect("tempdir should create");
    let path = dir.path().join("framelift.yaml");
    fs::write(&path, "local:\n  performance_tier: [fast\n").expect("settings should write");

    let error = YamlSettingsStore::new(&path)
        .load_document()
        .await
        .expect_err("corrupt yaml should fail");
    let message = format!("{error:#}");
    assert!(message.contains("framelift.yaml"), "{message}");
    assert!(message.contains("line "), "{message}");
}
