//! Persisted user settings.
//!
//! Two partitions mirror the host store: `synced` follows the user across
//! devices, `local` holds machine-specific data such as the benchmark result.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::effect_chain::{self, DEFAULT_MODE_ID};
use crate::effects;
use crate::schema::{
    CustomMode, Dimensions, EnhancementEffect, EnhancementMode, GpuBenchmarkResult,
    PerformanceTier, ResolutionPolicy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncedSettings {
    pub selected_mode_id: String,
    pub target_resolution: ResolutionPolicy,
    pub custom_modes: Vec<CustomMode>,
    pub cross_origin_fix: bool,
    pub whitelist_enabled: bool,
    pub whitelist: Vec<String>,
}

impl Default for SyncedSettings {
    fn default() -> Self {
        Self {
            selected_mode_id: DEFAULT_MODE_ID.to_owned(),
            target_resolution: ResolutionPolicy::default(),
            custom_modes: Vec::new(),
            cross_origin_fix: false,
            whitelist_enabled: false,
            whitelist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub performance_tier: PerformanceTier,
    pub benchmark: Option<GpuBenchmarkResult>,
    pub onboarding_completed: bool,
}

/// On-disk layout of a settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsDocument {
    pub synced: SyncedSettings,
    pub local: LocalSettings,
}

/// Merged read-only view used by enhancers.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub selected_mode_id: String,
    pub target_resolution: ResolutionPolicy,
    pub cross_origin_fix: bool,
    pub performance_tier: PerformanceTier,
    modes: Vec<EnhancementMode>,
}

impl Settings {
    pub fn merge(synced: &SyncedSettings, local: &LocalSettings) -> Self {
        let modes = effect_chain::builtin_modes()
            .iter()
            .cloned()
            .map(EnhancementMode::BuiltIn)
            .chain(
                effects::synchronize_custom_modes(&synced.custom_modes)
                    .into_iter()
                    .map(EnhancementMode::Custom),
            )
            .collect();
        Self {
            selected_mode_id: synced.selected_mode_id.clone(),
            target_resolution: synced.target_resolution,
            cross_origin_fix: synced.cross_origin_fix,
            performance_tier: local.performance_tier,
            modes,
        }
    }

    /// Built-in modes first, then custom modes with their effects re-synchronized
    /// against the catalog.
    pub fn enhancement_modes(&self) -> &[EnhancementMode] {
        &self.modes
    }

    /// The selected mode, or the first built-in mode when the id is stale.
    pub fn selected_mode(&self) -> &EnhancementMode {
        self.mode(&self.selected_mode_id)
    }

    pub fn mode(&self, id: &str) -> &EnhancementMode {
        effect_chain::find_mode(&self.modes, id)
            .or_else(|| self.modes.iter().find(|mode| mode.is_built_in()))
            .unwrap_or(&self.modes[0])
    }

    pub fn effects_for(&self, mode: &EnhancementMode) -> Vec<EnhancementEffect> {
        effect_chain::effects_for_mode(mode, self.performance_tier)
    }

    pub fn target_dimensions(&self, native: Dimensions) -> Dimensions {
        self.target_resolution.target_dimensions(native)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::merge(&SyncedSettings::default(), &LocalSettings::default())
    }
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load_document(&self) -> Result<SettingsDocument>;

    async fn save_synced(&self, synced: &SyncedSettings) -> Result<()>;

    async fn save_local(&self, local: &LocalSettings) -> Result<()>;

    async fn load(&self) -> Result<Settings> {
        let document = self.load_document().await?;
        Ok(Settings::merge(&document.synced, &document.local))
    }
}

/// Settings kept in one YAML file. A missing file reads as defaults.
#[derive(Debug, Clone)]
pub struct YamlSettingsStore {
    path: PathBuf,
}

impl YamlSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SettingsDocument> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "settings file missing; using defaults");
            return Ok(SettingsDocument::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read settings {}", self.path.display()))?;
        parse_document(&contents)
            .with_context(|| format!("invalid settings file {}", self.path.display()))
    }

    fn write(&self, document: &SettingsDocument) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let yaml = serde_yaml::to_string(document).context("failed to serialize settings")?;
        fs::write(&self.path, yaml)
            .with_context(|| format!("failed to write settings {}", self.path.display()))
    }
}

#[async_trait]
impl SettingsStore for YamlSettingsStore {
    async fn load_document(&self) -> Result<SettingsDocument> {
        self.read()
    }

    async fn save_synced(&self, synced: &SyncedSettings) -> Result<()> {
        let mut document = self.read()?;
        document.synced = synced.clone();
        self.write(&document)
    }

    async fn save_local(&self, local: &LocalSettings) -> Result<()> {
        let mut document = self.read()?;
        document.local = local.clone();
        self.write(&document)
    }
}

pub fn parse_document(contents: &str) -> Result<SettingsDocument> {
    if contents.trim().is_empty() {
        return Ok(SettingsDocument::default());
    }
    serde_yaml::from_str(contents).map_err(|error| {
        let location = error
            .location()
            .map(|location| format!("line {}, column {}", location.line(), location.column()))
            .unwrap_or_else(|| "unknown location".to_owned());
        anyhow!("failed to parse settings yaml at {location}: {error}")
    })
}

/// In-process store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    document: Mutex<SettingsDocument>,
    loads: AtomicUsize,
}

impl MemorySettingsStore {
    pub fn new(document: SettingsDocument) -> Self {
        Self {
            document: Mutex::new(document),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn update_synced(&self, update: impl FnOnce(&mut SyncedSettings)) {
        let mut document = self.document.lock().unwrap_or_else(|p| p.into_inner());
        update(&mut document.synced);
    }

    pub fn snapshot(&self) -> SettingsDocument {
        self.document
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load_document(&self) -> Result<SettingsDocument> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot())
    }

    async fn save_synced(&self, synced: &SyncedSettings) -> Result<()> {
        self.update_synced(|current| *current = synced.clone());
        Ok(())
    }

    async fn save_local(&self, local: &LocalSettings) -> Result<()> {
        let mut document = self.document.lock().unwrap_or_else(|p| p.into_inner());
        document.local = local.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let document = parse_document("synced:\n  target_resolution: 4k\n").expect("parse");
        assert_eq!(document.synced.target_resolution, ResolutionPolicy::K4);
        assert_eq!(document.synced.selected_mode_id, DEFAULT_MODE_ID);
        assert_eq!(document.local.performance_tier, PerformanceTier::Balanced);
        assert!(document.local.benchmark.is_none());
    }

    #[test]
    fn parse_errors_report_location() {
        let error = parse_document("synced:\n  cross_origin_fix: [\n").expect_err("invalid yaml");
        assert!(error.to_string().contains("line"), "{error}");
    }

    #[test]
    fn stale_mode_id_falls_back_to_first_builtin() {
        let synced = SyncedSettings {
            selected_mode_id: "deleted-custom".to_owned(),
            ..SyncedSettings::default()
        };
        let settings = Settings::merge(&synced, &LocalSettings::default());
        assert_eq!(settings.selected_mode().id(), DEFAULT_MODE_ID);
    }

    #[test]
    fn custom_modes_follow_builtins_and_drop_unknown_effects() {
        let mut effect = effects::find_by_algorithm("CNNx2M").expect("catalog").clone();
        let mut unknown = effect.clone();
        unknown.id = "retired-effect".to_owned();
        effect.name = "stale name".to_owned();
        let synced = SyncedSettings {
            selected_mode_id: "custom-1".to_owned(),
            custom_modes: vec![CustomMode {
                id: "custom-1".to_owned(),
                name: "Mine".to_owned(),
                effects: vec![unknown, effect],
            }],
            ..SyncedSettings::default()
        };
        let settings = Settings::merge(&synced, &LocalSettings::default());
        assert_eq!(settings.enhancement_modes().len(), 7);
        let selected = settings.selected_mode();
        assert!(!selected.is_built_in());
        let effects = settings.effects_for(selected);
        assert_eq!(effects.len(), 1);
        assert_ne!(effects[0].name, "stale name");
    }
}
