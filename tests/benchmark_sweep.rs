use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use framelift::benchmark::{
    frame_budget_ms, run_sweep, BenchmarkProgress, SweepOptions, TierRunner, TierTiming,
};
use framelift::errors::BenchmarkError;
use framelift::schema::{EnhancementEffect, PerformanceTier};

enum Step {
    Measure { mean_ms: f64, max_ms: f64 },
    Fail(&'static str),
    Hang,
    LoseDevice,
}

struct ScriptedRunner {
    steps: VecDeque<Step>,
    device_valid: bool,
    measured_chains: Vec<Vec<EnhancementEffect>>,
    warm_ups: usize,
    releases: usize,
}

impl ScriptedRunner {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            device_valid: true,
            measured_chains: Vec::new(),
            warm_ups: 0,
            releases: 0,
        }
    }

    fn tiers_attempted(&self) -> usize {
        self.measured_chains.len()
    }
}

#[async_trait]
impl TierRunner for ScriptedRunner {
    fn adapter_descriptor(&self) -> String {
        r#"{"vendor":4318,"device":1,"name":"scripted","backend":"vulkan","driver":"test"}"#
            .to_owned()
    }

    fn is_device_valid(&mut self) -> bool {
        if matches!(self.steps.front(), Some(Step::LoseDevice)) {
            self.steps.pop_front();
            self.device_valid = false;
        }
        self.device_valid
    }

    async fn warm_up(&mut self, _effects: &[EnhancementEffect]) -> Result<()> {
        self.warm_ups += 1;
        Ok(())
    }

    async fn measure(&mut self, effects: &[EnhancementEffect]) -> Result<TierTiming> {
        self.measured_chains.push(effects.to_vec());
        match self.steps.pop_front() {
            Some(Step::Measure { mean_ms, max_ms }) => Ok(TierTiming { mean_ms, max_ms }),
            Some(Step::Fail(reason)) => bail!("{reason}"),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                bail!("unreachable")
            }
            Some(Step::LoseDevice) | None => bail!("script exhausted"),
        }
    }

    async fn release(&mut self) {
        self.releases += 1;
    }
}

fn fast() -> Step {
    Step::Measure {
        mean_ms: 10.0,
        max_ms: 15.0,
    }
}

fn slow() -> Step {
    let budget = frame_budget_ms();
    Step::Measure {
        mean_ms: budget * 2.5,
        max_ms: budget * 3.0,
    }
}

async fn sweep(
    runner: &mut ScriptedRunner,
) -> (
    Result<framelift::schema::GpuBenchmarkResult, BenchmarkError>,
    Vec<BenchmarkProgress>,
) {
    let mut events = Vec::new();
    let mut on_progress = |progress: BenchmarkProgress| events.push(progress);
    let result = run_sweep(runner, &SweepOptions::default(), &mut on_progress).await;
    (result, events)
}

#[tokio::test(start_paused = true)]
async fn all_fast_tiers_recommend_ultra() {
    let mut runner = ScriptedRunner::new(vec![fast(), fast(), fast(), fast()]);
    let (result, events) = sweep(&mut runner).await;
    let result = result.expect("benchmark should succeed");
    assert_eq!(result.recommended_tier, PerformanceTier::Ultra);
    assert_eq!(result.mean_frame_ms.ultra, Some(10.0));
    assert_eq!(result.max_frame_ms.performance, Some(15.0));
    assert!(result.adapter.contains("scripted"));
    assert_eq!(runner.warm_ups, 1);
    assert_eq!(runner.releases, 1);

    let last = events.last().expect("progress events");
    assert_eq!(last.tier, "done");
    assert!(last.completed);
    assert_eq!(last.progress, 1.0);
    assert!(events
        .windows(2)
        .all(|pair| pair[0].progress <= pair[1].progress));
}

#[tokio::test(start_paused = true)]
async fn slow_balanced_skips_heavier_tiers() {
    let mut runner = ScriptedRunner::new(vec![fast(), slow(), fast(), fast()]);
    let (result, _) = sweep(&mut runner).await;
    let result = result.expect("benchmark should succeed");
    assert_eq!(runner.tiers_attempted(), 2, "quality and ultra must not run");
    assert_eq!(result.recommended_tier, PerformanceTier::Performance);
    assert!(result.mean_frame_ms.quality.is_none());
    assert!(result.mean_frame_ms.ultra.is_none());
}

#[tokio::test(start_paused = true)]
async fn unusable_but_not_slow_tier_keeps_testing() {
    let budget = frame_budget_ms();
    let spiky = Step::Measure {
        mean_ms: budget * 0.5,
        max_ms: budget * 1.2,
    };
    let mut runner = ScriptedRunner::new(vec![fast(), spiky, fast(), slow()]);
    let (result, _) = sweep(&mut runner).await;
    let result = result.expect("benchmark should succeed");
    assert_eq!(runner.tiers_attempted(), 4);
    assert_eq!(result.recommended_tier, PerformanceTier::Quality);
}

#[tokio::test(start_paused = true)]
async fn failing_cheapest_tier_fails_the_run_and_cleans_up() {
    let mut runner = ScriptedRunner::new(vec![Step::Fail("pipeline creation failed")]);
    let (result, events) = sweep(&mut runner).await;
    match result {
        Err(BenchmarkError::NoTierSucceeded { reason }) => {
            assert!(reason.contains("pipeline creation failed"), "{reason}")
        }
        other => panic!("expected NoTierSucceeded, got {other:?}"),
    }
    assert_eq!(runner.releases, 1);
    assert!(events.iter().any(|event| event.error.is_some()));
}

#[tokio::test(start_paused = true)]
async fn later_failure_keeps_best_result() {
    let mut runner = ScriptedRunner::new(vec![fast(), fast(), Step::Fail("out of memory")]);
    let (result, _) = sweep(&mut runner).await;
    let result = result.expect("benchmark should succeed");
    assert_eq!(result.recommended_tier, PerformanceTier::Balanced);
    assert_eq!(runner.tiers_attempted(), 3);
    assert_eq!(runner.releases, 1);
}

#[tokio::test(start_paused = true)]
async fn hung_tier_times_out() {
    let mut runner = ScriptedRunner::new(vec![fast(), Step::Hang]);
    let (result, _) = sweep(&mut runner).await;
    let result = result.expect("benchmark should succeed");
    assert_eq!(result.recommended_tier, PerformanceTier::Performance);
    assert!(result.mean_frame_ms.balanced.is_none());
    assert_eq!(runner.releases, 1);
}

#[tokio::test(start_paused = true)]
async fn device_loss_mid_run_truncates_sweep() {
    let mut runner = ScriptedRunner::new(vec![fast(), fast(), Step::LoseDevice]);
    let (result, _) = sweep(&mut runner).await;
    let result = result.expect("benchmark should succeed");
    assert_eq!(runner.tiers_attempted(), 2);
    assert_eq!(result.recommended_tier, PerformanceTier::Balanced);
    assert_eq!(runner.releases, 1);
}

#[tokio::test(start_paused = true)]
async fn device_lost_before_first_tier_fails() {
    let mut runner = ScriptedRunner::new(vec![Step::LoseDevice]);
    let (result, _) = sweep(&mut runner).await;
    assert!(matches!(result, Err(BenchmarkError::NoTierSucceeded { .. })));
    assert_eq!(runner.releases, 1);
}

#[tokio::test(start_paused = true)]
async fn every_tier_runs_the_double_restore_chain() {
    let mut runner = ScriptedRunner::new(vec![fast(), fast(), fast(), fast()]);
    let (result, _) = sweep(&mut runner).await;
    result.expect("benchmark should succeed");
    for (tier, chain) in PerformanceTier::ALL.into_iter().zip(&runner.measured_chains) {
        assert_eq!(
            chain,
            &framelift::effect_chain::resolve(framelift::schema::BaseMode::AA, tier)
        );
    }
}
