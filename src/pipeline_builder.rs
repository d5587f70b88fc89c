//! Turns an ordered effect list into a chain of GPU stages.
//!
//! Planning is a pure function of the library, the native size, the target size
//! and the effects, so it can be inspected without a device. Building walks the
//! plan and binds each stage to the previous stage's output surface.

use std::fmt;

use anyhow::{anyhow, Result};
use tracing::{debug, info, warn};

use crate::algorithms::{
    AlgorithmLibrary, ImageSurface, PassThrough, PipelineStage, StageInit, DOWNSCALE_ALGORITHM,
};
use crate::gpu::wait_for_submitted_work;
use crate::overlay::InitProgress;
use crate::schema::{Dimensions, EnhancementEffect};

/// An interior surface may exceed its ideal width by this much before an
/// intermediate downscale is inserted.
pub const DOWNSCALE_TOLERANCE: f64 = 1.1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagePlan {
    Effect {
        effect_id: String,
        algorithm: String,
        input: Dimensions,
        output: Dimensions,
    },
    Downscale {
        input: Dimensions,
        output: Dimensions,
    },
    PassThrough {
        dimensions: Dimensions,
    },
}

impl StagePlan {
    pub fn algorithm(&self) -> &str {
        match self {
            Self::Effect { algorithm, .. } => algorithm,
            Self::Downscale { .. } => DOWNSCALE_ALGORITHM,
            Self::PassThrough { .. } => "PassThrough",
        }
    }

    pub fn input(&self) -> Dimensions {
        match self {
            Self::Effect { input, .. } | Self::Downscale { input, .. } => *input,
            Self::PassThrough { dimensions } => *dimensions,
        }
    }

    pub fn output(&self) -> Dimensions {
        match self {
            Self::Effect { output, .. } | Self::Downscale { output, .. } => *output,
            Self::PassThrough { dimensions } => *dimensions,
        }
    }

    pub fn is_downscale(&self) -> bool {
        matches!(self, Self::Downscale { .. })
    }
}

impl fmt::Display for StagePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.algorithm(), self.input(), self.output())
    }
}

fn ideal_intermediate(target: Dimensions, remaining_factor: u32) -> Dimensions {
    let remaining = f64::from(remaining_factor);
    Dimensions::new(
        (f64::from(target.width) / remaining).ceil() as u32,
        (f64::from(target.height) / remaining).ceil() as u32,
    )
}

/// Stage sequence for `effects`. Effects whose algorithm the library lacks are
/// skipped before any factor arithmetic, so the remaining-factor check only
/// counts stages that will actually run.
pub fn plan(
    library: &AlgorithmLibrary,
    native: Dimensions,
    target: Dimensions,
    effects: &[EnhancementEffect],
) -> Vec<StagePlan> {
    let usable = effects
        .iter()
        .filter(|effect| {
            let known = library.contains(&effect.algorithm);
            if !known {
                warn!(
                    effect = %effect.id,
                    algorithm = %effect.algorithm,
                    library = library.version(),
                    "effect not available in algorithm library; skipping"
                );
            }
            known
        })
        .collect::<Vec<_>>();

    let mut stages = Vec::with_capacity(usable.len() + 1);
    let mut current = native;
    for (index, effect) in usable.iter().enumerate() {
        let factor = effect.upscale_factor();
        let output = current.scaled(factor);
        stages.push(StagePlan::Effect {
            effect_id: effect.id.clone(),
            algorithm: effect.algorithm.clone(),
            input: current,
            output,
        });
        current = output;

        if factor <= 1 {
            continue;
        }
        let remaining: u32 = usable[index + 1..]
            .iter()
            .map(|effect| effect.upscale_factor())
            .fold(1_u32, u32::saturating_mul);
        if remaining <= 1 {
            continue;
        }
        let limit = f64::from(target.width) / f64::from(remaining) * DOWNSCALE_TOLERANCE;
        if f64::from(current.width) > limit {
            let reduced = ideal_intermediate(target, remaining);
            debug!(from = %current, to = %reduced, remaining, "inserting intermediate downscale");
            stages.push(StagePlan::Downscale {
                input: current,
                output: reduced,
            });
            current = reduced;
        }
    }

    if stages.is_empty() {
        stages.push(StagePlan::PassThrough { dimensions: native });
    }
    stages
}

/// Built stage chain. Stage `n` reads stage `n - 1`'s output; the first stage
/// reads the capture surface.
pub struct Pipeline {
    plan: Vec<StagePlan>,
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn build(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        library: &AlgorithmLibrary,
        input: &ImageSurface,
        target: Dimensions,
        effects: &[EnhancementEffect],
        format: wgpu::TextureFormat,
    ) -> Result<Self> {
        let plan = plan(library, input.dimensions(), target, effects);
        let mut stages: Vec<Box<dyn PipelineStage>> = Vec::with_capacity(plan.len());

        for step in &plan {
            let current = stages.last().map_or(input, |stage| stage.output());
            let stage_target = match step {
                StagePlan::Downscale { output, .. } => *output,
                _ => target,
            };
            let stage = match step {
                StagePlan::PassThrough { .. } => {
                    Ok(Box::new(PassThrough::new(current)) as Box<dyn PipelineStage>)
                }
                StagePlan::Effect { .. } | StagePlan::Downscale { .. } => {
                    let init = StageInit {
                        device,
                        queue,
                        input: current,
                        native: current.dimensions(),
                        target: stage_target,
                        format,
                    };
                    library.instantiate(step.algorithm(), &init)
                }
            };
            match stage {
                Ok(stage) => stages.push(stage),
                Err(error) => {
                    for built in stages.iter().rev() {
                        built.destroy();
                    }
                    return Err(error.context(format!("failed to build stage {step}")));
                }
            }
        }

        info!(
            stages = stages.len(),
            native = %input.dimensions(),
            %target,
            "pipeline built"
        );
        Ok(Self { plan, stages })
    }

    pub fn plan(&self) -> &[StagePlan] {
        &self.plan
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.label())
    }

    /// Surface the final blit samples from.
    pub fn output(&self) -> Result<&ImageSurface> {
        self.stages
            .last()
            .map(|stage| stage.output())
            .ok_or_else(|| anyhow!("pipeline has no stages"))
    }

    pub fn encode(&self, encoder: &mut wgpu::CommandEncoder) {
        for stage in &self.stages {
            stage.encode(encoder);
        }
    }

    /// Runs each stage once on its own and waits for the GPU, so shader
    /// compilation happens here rather than on the first visible frame. A stage
    /// that fails its warm-up is logged and kept; the frame loop reports real
    /// failures.
    pub async fn warm_up(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        on_progress: &(dyn Fn(InitProgress) + Send + Sync),
    ) {
        let total = self.stages.len();
        for (index, stage) in self.stages.iter().enumerate() {
            on_progress(InitProgress::LoadingEffect {
                index: index + 1,
                total,
            });
            tokio::task::yield_now().await;

            device.push_error_scope(wgpu::ErrorFilter::Validation);
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("framelift-warmup"),
            });
            stage.encode(&mut encoder);
            queue.submit(Some(encoder.finish()));
            wait_for_submitted_work(device, queue).await;
            match device.pop_error_scope().await {
                Some(error) => warn!(stage = stage.label(), %error, "stage warm-up failed"),
                None => debug!(stage = stage.label(), index, total, "stage warmed up"),
            }
        }
    }

    /// Destroys stages last-to-first. The capture surface is left alone.
    pub fn destroy(&self) {
        for stage in self.stages.iter().rev() {
            stage.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::find_by_algorithm;

    fn chain(algorithms: &[&str]) -> Vec<EnhancementEffect> {
        algorithms
            .iter()
            .map(|algorithm| {
                find_by_algorithm(algorithm)
                    .cloned()
                    .unwrap_or_else(|| panic!("{algorithm} missing from catalog"))
            })
            .collect()
    }

    #[test]
    fn empty_chain_plans_single_pass_through() {
        let native = Dimensions::new(1280, 720);
        let steps = plan(&AlgorithmLibrary::builtin(), native, native.scaled(2), &[]);
        assert_eq!(steps, vec![StagePlan::PassThrough { dimensions: native }]);
    }

    #[test]
    fn oversized_interior_upscale_gets_downscaled() {
        let native = Dimensions::new(1920, 1080);
        let target = Dimensions::new(3840, 2160);
        let steps = plan(
            &AlgorithmLibrary::builtin(),
            native,
            target,
            &chain(&["CNNx2M", "CNNx2M"]),
        );
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps[1],
            StagePlan::Downscale {
                input: Dimensions::new(3840, 2160),
                output: Dimensions::new(1920, 1080),
            }
        );
        assert_eq!(steps[2].output(), target);
    }

    #[test]
    fn downscale_rounds_up() {
        let steps = plan(
            &AlgorithmLibrary::builtin(),
            Dimensions::new(1000, 1000),
            Dimensions::new(1001, 999),
            &chain(&["CNNx2M", "CNNx2M"]),
        );
        assert_eq!(steps[1].output(), Dimensions::new(501, 500));
    }

    #[test]
    fn skipped_effect_does_not_count_toward_remaining_factor() {
        let library = AlgorithmLibrary::builtin().without("CNNx2UL");
        let native = Dimensions::new(1920, 1080);
        let steps = plan(
            &library,
            native,
            native.scaled(2),
            &chain(&["CNNx2M", "CNNx2UL"]),
        );
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].output(), native.scaled(2));
    }
}
