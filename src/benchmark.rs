//! GPU capability benchmark.
//!
//! Times the A+A chain of each performance tier on a synthetic 1080p frame
//! upscaled to 4K and recommends the most expensive tier that holds a 24 fps
//! budget. The sweep logic is separated from the GPU work through
//! [`TierRunner`] so it can be driven by a scripted runner.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::algorithms::{AlgorithmLibrary, ImageSurface};
use crate::effect_chain;
use crate::errors::BenchmarkError;
use crate::gpu::{wait_for_submitted_work, DeviceLoss, GpuContext};
use crate::pipeline_builder::Pipeline;
use crate::schema::{
    BaseMode, Dimensions, EnhancementEffect, GpuBenchmarkResult, PerformanceTier, TierScores,
};

pub const BENCHMARK_INPUT: Dimensions = Dimensions::new(1920, 1080);
pub const BENCHMARK_TARGET: Dimensions = Dimensions::new(3840, 2160);
pub const PLAYBACK_FPS: f64 = 24.0;
pub const TIER_TIMEOUT: Duration = Duration::from_secs(20);
pub const FULL_CHAIN_WARMUP_FRAMES: usize = 4;
pub const TIMED_FRAMES: usize = 120;
/// Leading timed frames dropped to hide shader compilation and clock ramp-up.
pub const DISCARDED_FRAMES: usize = 24;
/// A usable tier's mean must stay under this share of the frame budget.
pub const USABLE_MEAN_RATIO: f64 = 0.85;
/// A tier whose mean exceeds this multiple of the budget ends the sweep.
pub const EARLY_EXIT_RATIO: f64 = 2.0;

pub fn frame_budget_ms() -> f64 {
    1000.0 / PLAYBACK_FPS
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierTiming {
    pub mean_ms: f64,
    pub max_ms: f64,
}

impl TierTiming {
    /// Mean and max of `samples` after the first [`DISCARDED_FRAMES`].
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let stable = samples.get(DISCARDED_FRAMES..)?;
        if stable.is_empty() {
            return None;
        }
        let mean_ms = stable.iter().sum::<f64>() / stable.len() as f64;
        let max_ms = stable.iter().copied().fold(f64::MIN, f64::max);
        Some(Self { mean_ms, max_ms })
    }

    pub fn is_usable(&self, budget_ms: f64) -> bool {
        self.max_ms < budget_ms && self.mean_ms < budget_ms * USABLE_MEAN_RATIO
    }

    pub fn is_too_slow(&self, budget_ms: f64) -> bool {
        self.mean_ms > budget_ms * EARLY_EXIT_RATIO
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkProgress {
    /// Tier keyword, or `done` for the final event.
    pub tier: String,
    /// 0.0 to 1.0 across the whole sweep.
    pub progress: f64,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BenchmarkProgress {
    fn tier(tier: PerformanceTier, progress: f64) -> Self {
        Self {
            tier: tier.keyword().to_owned(),
            progress,
            completed: false,
            error: None,
        }
    }
}

/// The GPU side of a benchmark run.
#[async_trait]
pub trait TierRunner: Send {
    fn adapter_descriptor(&self) -> String;

    /// `false` once the device has been lost.
    fn is_device_valid(&mut self) -> bool;

    /// Builds and runs `effects` once without timing.
    async fn warm_up(&mut self, effects: &[EnhancementEffect]) -> Result<()>;

    /// Builds `effects`, warms each stage and the full chain, then times frames.
    async fn measure(&mut self, effects: &[EnhancementEffect]) -> Result<TierTiming>;

    /// Frees every GPU resource and the device. Called exactly once per sweep.
    async fn release(&mut self);
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub frame_budget_ms: f64,
    pub tier_timeout: Duration,
    /// Base mode whose chain is timed at each tier.
    pub chain: BaseMode,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            frame_budget_ms: frame_budget_ms(),
            tier_timeout: TIER_TIMEOUT,
            chain: BaseMode::AA,
        }
    }
}

/// Runs the tier sweep on `runner` and releases it whatever the outcome.
///
/// Tiers run cheapest first. A failure on the first tier fails the whole run;
/// a later failure only truncates the sweep.
pub async fn run_sweep<P>(
    runner: &mut P,
    options: &SweepOptions,
    on_progress: &mut (dyn FnMut(BenchmarkProgress) + Send),
) -> Result<GpuBenchmarkResult, BenchmarkError>
where
    P: TierRunner + ?Sized,
{
    let budget = options.frame_budget_ms;
    let tier_count = PerformanceTier::ALL.len() as f64;

    let warmup_effects = effect_chain::resolve(options.chain, PerformanceTier::Performance);
    match tokio::time::timeout(options.tier_timeout, runner.warm_up(&warmup_effects)).await {
        Ok(Ok(())) => debug!("global warm-up complete"),
        Ok(Err(error)) => warn!(error = %format!("{error:#}"), "global warm-up failed"),
        Err(_) => warn!("global warm-up timed out"),
    }

    let mut recommended = PerformanceTier::Performance;
    let mut mean_frame_ms = TierScores::default();
    let mut max_frame_ms = TierScores::default();

    for (index, tier) in PerformanceTier::ALL.into_iter().enumerate() {
        if !runner.is_device_valid() {
            warn!(%tier, "device lost; stopping benchmark");
            break;
        }
        on_progress(BenchmarkProgress::tier(tier, (index as f64 + 0.5) / tier_count));

        let effects = effect_chain::resolve(options.chain, tier);
        let outcome = match tokio::time::timeout(options.tier_timeout, runner.measure(&effects))
            .await
        {
            Ok(Ok(timing)) => Ok(timing),
            Ok(Err(error)) => Err(format!("{error:#}")),
            Err(_) => Err(format!("timed out after {:?}", options.tier_timeout)),
        };

        let timing = match outcome {
            Ok(timing) => timing,
            Err(reason) => {
                warn!(%tier, %reason, "benchmark tier failed");
                if index == 0 {
                    runner.release().await;
                    on_progress(BenchmarkProgress {
                        error: Some(reason.clone()),
                        ..BenchmarkProgress::tier(tier, 1.0)
                    });
                    return Err(BenchmarkError::NoTierSucceeded { reason });
                }
                break;
            }
        };

        info!(
            %tier,
            mean_ms = timing.mean_ms,
            max_ms = timing.max_ms,
            "benchmark tier measured"
        );
        mean_frame_ms.set(tier, timing.mean_ms);
        max_frame_ms.set(tier, timing.max_ms);
        if timing.is_usable(budget) {
            recommended = tier;
        }
        if timing.is_too_slow(budget) {
            info!(%tier, "tier too slow; skipping heavier tiers");
            break;
        }
        on_progress(BenchmarkProgress::tier(tier, (index as f64 + 1.0) / tier_count));
    }

    let adapter = runner.adapter_descriptor();
    runner.release().await;

    if mean_frame_ms.performance.is_none() {
        return Err(BenchmarkError::NoTierSucceeded {
            reason: "device lost before any tier completed".to_owned(),
        });
    }

    on_progress(BenchmarkProgress {
        tier: "done".to_owned(),
        progress: 1.0,
        completed: true,
        error: None,
    });
    info!(%recommended, "benchmark complete");
    Ok(GpuBenchmarkResult {
        recommended_tier: recommended,
        mean_frame_ms,
        max_frame_ms,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        adapter,
    })
}

/// Stored result still describes this adapter, so the sweep can be skipped.
pub fn reusable_result<'a>(
    stored: Option<&'a GpuBenchmarkResult>,
    adapter: &str,
) -> Option<&'a GpuBenchmarkResult> {
    stored.filter(|result| result.matches_adapter(adapter))
}

/// Deterministic noise frame so every tier sees the same input.
fn synthetic_frame(dimensions: Dimensions) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15_u64;
    let mut rgba = vec![0_u8; (dimensions.pixel_count() * 4) as usize];
    for pixel in rgba.chunks_exact_mut(4) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        pixel[..3].copy_from_slice(&state.to_le_bytes()[..3]);
        pixel[3] = 255;
    }
    rgba
}

/// [`TierRunner`] on a dedicated device.
pub struct GpuTierRunner {
    gpu: GpuContext,
    losses: mpsc::UnboundedReceiver<DeviceLoss>,
    device_lost: bool,
    library: AlgorithmLibrary,
    input: ImageSurface,
    active: Option<Pipeline>,
    released: bool,
}

impl GpuTierRunner {
    pub async fn new(library: AlgorithmLibrary) -> Result<Self, BenchmarkError> {
        let (gpu, losses) = GpuContext::acquire("framelift-benchmark")
            .await
            .map_err(|_| BenchmarkError::NoAdapter)?;
        let input = ImageSurface::capture(&gpu.device, BENCHMARK_INPUT);
        if let Err(error) = input.upload_rgba(&gpu.queue, &synthetic_frame(BENCHMARK_INPUT)) {
            warn!(error = %format!("{error:#}"), "failed to upload benchmark frame");
        }
        wait_for_submitted_work(&gpu.device, &gpu.queue).await;
        Ok(Self {
            gpu,
            losses,
            device_lost: false,
            library,
            input,
            active: None,
            released: false,
        })
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn build(&mut self, effects: &[EnhancementEffect]) -> Result<&Pipeline> {
        self.destroy_active();
        let pipeline = Pipeline::build(
            &self.gpu.device,
            &self.gpu.queue,
            &self.library,
            &self.input,
            BENCHMARK_TARGET,
            effects,
            self.gpu.stage_format,
        )?;
        Ok(self.active.insert(pipeline))
    }

    fn destroy_active(&mut self) {
        if let Some(pipeline) = self.active.take() {
            pipeline.destroy();
        }
    }

    async fn run_chain(&self, pipeline: &Pipeline) {
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("framelift-benchmark-frame"),
            });
        pipeline.encode(&mut encoder);
        self.gpu.queue.submit(Some(encoder.finish()));
        wait_for_submitted_work(&self.gpu.device, &self.gpu.queue).await;
    }
}

#[async_trait]
impl TierRunner for GpuTierRunner {
    fn adapter_descriptor(&self) -> String {
        self.gpu.descriptor.to_json()
    }

    fn is_device_valid(&mut self) -> bool {
        while let Ok(loss) = self.losses.try_recv() {
            if !loss.intentional {
                warn!(message = %loss.message, "benchmark device lost");
                self.device_lost = true;
            }
        }
        !self.device_lost && !self.released
    }

    async fn warm_up(&mut self, effects: &[EnhancementEffect]) -> Result<()> {
        self.build(effects)?;
        if let Some(pipeline) = self.active.as_ref() {
            self.run_chain(pipeline).await;
        }
        self.gpu.wait_idle().await;
        self.destroy_active();
        Ok(())
    }

    async fn measure(&mut self, effects: &[EnhancementEffect]) -> Result<TierTiming> {
        self.build(effects)?;
        let pipeline = self
            .active
            .as_ref()
            .ok_or_else(|| anyhow!("benchmark pipeline missing"))?;

        pipeline
            .warm_up(&self.gpu.device, &self.gpu.queue, &|_| {})
            .await;
        for _ in 0..FULL_CHAIN_WARMUP_FRAMES {
            self.run_chain(pipeline).await;
        }

        let mut samples = Vec::with_capacity(TIMED_FRAMES);
        for _ in 0..TIMED_FRAMES {
            let started = Instant::now();
            self.run_chain(pipeline).await;
            samples.push(started.elapsed().as_secs_f64() * 1000.0);
        }

        self.gpu.wait_idle().await;
        self.destroy_active();
        TierTiming::from_samples(&samples).ok_or_else(|| anyhow!("no stable frames recorded"))
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.gpu.wait_idle().await;
        self.destroy_active();
        self.input.destroy();
        self.gpu.destroy_device();
        debug!("benchmark resources released");
    }
}

/// Benchmarks the current adapter with the given algorithm library.
pub async fn run(
    library: AlgorithmLibrary,
    on_progress: &mut (dyn FnMut(BenchmarkProgress) + Send),
) -> Result<GpuBenchmarkResult, BenchmarkError> {
    let mut runner = GpuTierRunner::new(library).await?;
    run_sweep(&mut runner, &SweepOptions::default(), on_progress).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_discards_leading_frames() {
        let mut samples = vec![500.0; DISCARDED_FRAMES];
        samples.extend([10.0, 20.0, 30.0]);
        let timing = TierTiming::from_samples(&samples).expect("stable frames");
        assert_eq!(timing.mean_ms, 20.0);
        assert_eq!(timing.max_ms, 30.0);
        assert!(TierTiming::from_samples(&samples[..DISCARDED_FRAMES]).is_none());
    }

    #[test]
    fn usable_requires_max_and_mean_headroom() {
        let budget = frame_budget_ms();
        let fast = TierTiming {
            mean_ms: 20.0,
            max_ms: 30.0,
        };
        assert!(fast.is_usable(budget));
        let spiky = TierTiming {
            mean_ms: 20.0,
            max_ms: 45.0,
        };
        assert!(!spiky.is_usable(budget));
        let slow_mean = TierTiming {
            mean_ms: 36.0,
            max_ms: 40.0,
        };
        assert!(!slow_mean.is_usable(budget));
        assert!(!slow_mean.is_too_slow(budget));
        assert!(TierTiming {
            mean_ms: 90.0,
            max_ms: 95.0
        }
        .is_too_slow(budget));
    }

    #[test]
    fn synthetic_frame_is_opaque_and_deterministic() {
        let dims = Dimensions::new(4, 2);
        let frame = synthetic_frame(dims);
        assert_eq!(frame.len(), 32);
        assert!(frame.chunks_exact(4).all(|pixel| pixel[3] == 255));
        assert_eq!(frame, synthetic_frame(dims));
    }

    #[test]
    fn stored_result_is_reused_only_for_same_adapter() {
        let stored = GpuBenchmarkResult {
            recommended_tier: PerformanceTier::Quality,
            mean_frame_ms: TierScores::default(),
            max_frame_ms: TierScores::default(),
            timestamp_ms: 0,
            adapter: r#"{"name":"gpu-a"}"#.to_owned(),
        };
        assert!(reusable_result(Some(&stored), r#"{"name":"gpu-a"}"#).is_some());
        assert!(reusable_result(Some(&stored), r#"{"name":"gpu-b"}"#).is_none());
        assert!(reusable_result(None, "x").is_none());
    }
}
