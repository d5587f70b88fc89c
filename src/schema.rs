use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn scaled(self, factor: u32) -> Self {
        Self {
            width: self.width.saturating_mul(factor),
            height: self.height.saturating_mul(factor),
        }
    }

    pub fn pixel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn extent(self) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: self.width,
            height: self.height,
            depth_or_array_layers: 1,
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Dimensions {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (width, height) = value
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got '{value}'"))?;
        let dimensions = Self {
            width: width.trim().parse()?,
            height: height.trim().parse()?,
        };
        if !dimensions.is_valid() {
            bail!("dimensions must be positive, got {dimensions}");
        }
        Ok(dimensions)
    }
}

/// Calibrated quality/cost setting, ordered from cheapest to most expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    Performance,
    Balanced,
    Quality,
    Ultra,
}

impl PerformanceTier {
    pub const ALL: [PerformanceTier; 4] = [
        PerformanceTier::Performance,
        PerformanceTier::Balanced,
        PerformanceTier::Quality,
        PerformanceTier::Ultra,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            Self::Performance => "performance",
            Self::Balanced => "balanced",
            Self::Quality => "quality",
            Self::Ultra => "ultra",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl Default for PerformanceTier {
    fn default() -> Self {
        Self::Balanced
    }
}

impl fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for PerformanceTier {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "performance" => Ok(Self::Performance),
            "balanced" => Ok(Self::Balanced),
            "quality" => Ok(Self::Quality),
            "ultra" => Ok(Self::Ultra),
            _ => Err(anyhow!(
                "invalid performance tier '{value}' (expected performance, balanced, quality or ultra)"
            )),
        }
    }
}

/// Named built-in preset whose concrete chain depends on the performance tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseMode {
    A,
    B,
    C,
    #[serde(rename = "A+A")]
    AA,
    #[serde(rename = "B+B")]
    BB,
    #[serde(rename = "C+A")]
    CA,
}

impl BaseMode {
    pub const ALL: [BaseMode; 6] = [
        BaseMode::A,
        BaseMode::B,
        BaseMode::C,
        BaseMode::AA,
        BaseMode::BB,
        BaseMode::CA,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::AA => "A+A",
            Self::BB => "B+B",
            Self::CA => "C+A",
        }
    }
}

impl fmt::Display for BaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for BaseMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_uppercase();
        BaseMode::ALL
            .into_iter()
            .find(|mode| mode.tag() == normalized || mode.tag().replace('+', "") == normalized)
            .ok_or_else(|| anyhow!("unknown base mode '{value}'"))
    }
}

/// One entry of the effect catalog. Looked up by `id`; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementEffect {
    pub id: String,
    pub name: String,
    /// Identifier of the algorithm in the pipeline library that backs this effect.
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upscale_factor: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, f32>,
}

impl EnhancementEffect {
    pub fn upscale_factor(&self) -> u32 {
        self.upscale_factor.unwrap_or(1).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuiltInMode {
    pub id: String,
    pub base_mode: BaseMode,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub effects: Vec<EnhancementEffect>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnhancementMode {
    BuiltIn(BuiltInMode),
    Custom(CustomMode),
}

impl EnhancementMode {
    pub fn id(&self) -> &str {
        match self {
            Self::BuiltIn(mode) => &mode.id,
            Self::Custom(mode) => &mode.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::BuiltIn(mode) => &mode.name,
            Self::Custom(mode) => &mode.name,
        }
    }

    pub fn is_built_in(&self) -> bool {
        matches!(self, Self::BuiltIn(_))
    }
}

/// How the render target size is derived from the native video size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionPolicy {
    #[serde(rename = "x2")]
    X2,
    #[serde(rename = "x4")]
    X4,
    #[serde(rename = "x8")]
    X8,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2k")]
    K2,
    #[serde(rename = "4k")]
    K4,
    #[serde(rename = "native")]
    Native,
}

impl ResolutionPolicy {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::X2 => "x2",
            Self::X4 => "x4",
            Self::X8 => "x8",
            Self::P720 => "720p",
            Self::P1080 => "1080p",
            Self::K2 => "2k",
            Self::K4 => "4k",
            Self::Native => "native",
        }
    }

    pub fn target_dimensions(self, native: Dimensions) -> Dimensions {
        match self {
            Self::X2 => native.scaled(2),
            Self::X4 => native.scaled(4),
            Self::X8 => native.scaled(8),
            Self::P720 => Dimensions::new(1280, 720),
            Self::P1080 => Dimensions::new(1920, 1080),
            Self::K2 => Dimensions::new(2560, 1440),
            Self::K4 => Dimensions::new(3840, 2160),
            Self::Native => native,
        }
    }
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self::X2
    }
}

impl FromStr for ResolutionPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "x2" => Ok(Self::X2),
            "x4" => Ok(Self::X4),
            "x8" => Ok(Self::X8),
            "720p" => Ok(Self::P720),
            "1080p" => Ok(Self::P1080),
            "2k" => Ok(Self::K2),
            "4k" => Ok(Self::K4),
            "native" => Ok(Self::Native),
            _ => Err(anyhow!("invalid target resolution '{value}'")),
        }
    }
}

/// Per-tier frame times in milliseconds. Untested tiers hold `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierScores {
    pub performance: Option<f64>,
    pub balanced: Option<f64>,
    pub quality: Option<f64>,
    pub ultra: Option<f64>,
}

impl TierScores {
    pub fn get(&self, tier: PerformanceTier) -> Option<f64> {
        match tier {
            PerformanceTier::Performance => self.performance,
            PerformanceTier::Balanced => self.balanced,
            PerformanceTier::Quality => self.quality,
            PerformanceTier::Ultra => self.ultra,
        }
    }

    pub fn set(&mut self, tier: PerformanceTier, value: f64) {
        let slot = match tier {
            PerformanceTier::Performance => &mut self.performance,
            PerformanceTier::Balanced => &mut self.balanced,
            PerformanceTier::Quality => &mut self.quality,
            PerformanceTier::Ultra => &mut self.ultra,
        };
        *slot = Some(value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuBenchmarkResult {
    pub recommended_tier: PerformanceTier,
    /// Mean frame time per tier (ms).
    pub mean_frame_ms: TierScores,
    /// Worst frame time per tier (ms).
    pub max_frame_ms: TierScores,
    /// Unix time in milliseconds.
    pub timestamp_ms: i64,
    pub adapter: String,
}

impl GpuBenchmarkResult {
    pub fn matches_adapter(&self, adapter: &str) -> bool {
        self.adapter == adapter
    }
}
