use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use framelift::algorithms::AlgorithmLibrary;
use framelift::benchmark::{self, BenchmarkProgress, GpuTierRunner, SweepOptions, TierRunner};
use framelift::canvas::Canvas;
use framelift::catalog_loader::CatalogLoader;
use framelift::effect_chain::{self, effect_chain_summary};
use framelift::enhancer::{EnhancerContext, GpuRendererFactory};
use framelift::errors::error_code;
use framelift::host::BuiltinLibraryProvider;
use framelift::overlay::HeadlessOverlayFactory;
use framelift::pipeline_builder;
use framelift::registry::EnhancerRegistry;
use framelift::schema::{
    BaseMode, Dimensions, EnhancementEffect, PerformanceTier, ResolutionPolicy,
};
use framelift::settings::{Settings, SettingsStore, YamlSettingsStore};
use framelift::video::{SyntheticVideo, VideoSource};

const LONG_VERSION: &str = match option_env!("FRAMELIFT_GIT_HASH") {
    Some(hash) => hash,
    None => env!("CARGO_PKG_VERSION"),
};

#[derive(Debug, Parser)]
#[command(name = "framelift")]
#[command(about = "Real-time GPU enhancement for video playback")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Settings file (YAML). Missing files read as defaults.
    #[arg(long, global = true, default_value = "framelift.yaml")]
    settings: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the effect chain of a mode.
    Chain {
        /// Mode id (`builtin-mode-aa`, a custom mode id) or base mode tag (`A+A`).
        mode: String,
        #[arg(long)]
        tier: Option<PerformanceTier>,
        #[arg(long)]
        json: bool,
    },
    /// Show the stage plan for a native and target resolution.
    Plan {
        #[arg(long)]
        native: Dimensions,
        /// Explicit target. Defaults to the resolution policy.
        #[arg(long)]
        target: Option<Dimensions>,
        #[arg(long)]
        resolution: Option<ResolutionPolicy>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        tier: Option<PerformanceTier>,
        #[arg(long)]
        json: bool,
    },
    /// Measure the GPU and recommend a performance tier.
    Benchmark {
        /// Store the result and recommended tier in the settings file.
        #[arg(long)]
        save: bool,
        /// Run even if a stored result matches this adapter.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Enhance a synthetic video offscreen.
    Render {
        /// Still image used as every video frame. Defaults to a moving gradient.
        #[arg(long)]
        image: Option<PathBuf>,
        #[arg(long, default_value = "640x360")]
        native: Dimensions,
        #[arg(long, default_value_t = 30)]
        frames: u64,
        /// Write the last presented frame as PNG.
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Print the merged settings.
    Settings {
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("error: failed to start async runtime: {error}");
            std::process::exit(1);
        }
    };

    if let Err(error) = runtime.block_on(run(cli)) {
        eprintln!("error[{}]: {error:#}", error_code(&error));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = YamlSettingsStore::new(&cli.settings);
    match cli.command {
        Commands::Chain { mode, tier, json } => run_chain(&store, &mode, tier, json).await,
        Commands::Plan {
            native,
            target,
            resolution,
            mode,
            tier,
            json,
        } => run_plan(&store, native, target, resolution, mode.as_deref(), tier, json).await,
        Commands::Benchmark { save, force, json } => run_benchmark(&store, save, force, json).await,
        Commands::Render {
            image,
            native,
            frames,
            snapshot,
        } => run_render(store, image.as_deref(), native, frames, snapshot.as_deref()).await,
        Commands::Settings { json } => run_settings(&store, json).await,
    }
}

/// Effects for a mode id or base-mode tag at `tier` (settings tier by default).
fn mode_effects(
    settings: &Settings,
    mode: &str,
    tier: Option<PerformanceTier>,
) -> Result<(String, Vec<EnhancementEffect>)> {
    let tier = tier.unwrap_or(settings.performance_tier);
    if let Some(found) = effect_chain::find_mode(settings.enhancement_modes(), mode) {
        let effects = effect_chain::effects_for_mode(found, tier);
        return Ok((found.name().to_owned(), effects));
    }
    let base: BaseMode = mode
        .parse()
        .map_err(|_| anyhow!("unknown mode '{mode}' (use a mode id or a base mode such as A+A)"))?;
    Ok((format!("Mode {base}"), effect_chain::resolve(base, tier)))
}

async fn run_chain(
    store: &YamlSettingsStore,
    mode: &str,
    tier: Option<PerformanceTier>,
    json: bool,
) -> Result<()> {
    let settings = store.load().await?;
    let (name, effects) = mode_effects(&settings, mode, tier)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&effects)?);
        return Ok(());
    }
    println!("{name}: {}", effect_chain_summary(&effects));
    for (index, effect) in effects.iter().enumerate() {
        println!(
            "  {}. {} [{}] x{}",
            index + 1,
            effect.name,
            effect.algorithm,
            effect.upscale_factor()
        );
    }
    Ok(())
}

async fn run_plan(
    store: &YamlSettingsStore,
    native: Dimensions,
    target: Option<Dimensions>,
    resolution: Option<ResolutionPolicy>,
    mode: Option<&str>,
    tier: Option<PerformanceTier>,
    json: bool,
) -> Result<()> {
    let settings = store.load().await?;
    let mode = mode.unwrap_or(&settings.selected_mode_id).to_owned();
    let (name, effects) = mode_effects(&settings, &mode, tier)?;
    let target = target.unwrap_or_else(|| {
        resolution
            .unwrap_or(settings.target_resolution)
            .target_dimensions(native)
    });
    let library = AlgorithmLibrary::builtin();
    let stages = pipeline_builder::plan(&library, native, target, &effects);

    if json {
        let stages = stages
            .iter()
            .map(|stage| {
                json!({
                    "algorithm": stage.algorithm(),
                    "input": stage.input(),
                    "output": stage.output(),
                    "downscale": stage.is_downscale(),
                })
            })
            .collect::<Vec<_>>();
        let report = json!({
            "mode": name,
            "native": native,
            "target": target,
            "stages": stages,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{name}: {native} -> {target}");
    for (index, stage) in stages.iter().enumerate() {
        println!("  {}. {stage}", index + 1);
    }
    Ok(())
}

async fn run_benchmark(store: &YamlSettingsStore, save: bool, force: bool, json: bool) -> Result<()> {
    let mut document = store.load_document().await?;
    let mut runner = GpuTierRunner::new(AlgorithmLibrary::builtin()).await?;

    let adapter = runner.adapter_descriptor();
    if !force {
        if let Some(stored) = benchmark::reusable_result(document.local.benchmark.as_ref(), &adapter)
        {
            runner.release().await;
            info!(tier = %stored.recommended_tier, "reusing stored benchmark for this adapter");
            print_benchmark(stored, json)?;
            return Ok(());
        }
    }

    let mut on_progress = |progress: BenchmarkProgress| {
        eprintln!(
            "benchmark {:>3.0}% {}{}",
            progress.progress * 100.0,
            progress.tier,
            progress
                .error
                .as_deref()
                .map(|error| format!(" ({error})"))
                .unwrap_or_default()
        );
    };
    let result = match benchmark::run_sweep(&mut runner, &SweepOptions::default(), &mut on_progress)
        .await
    {
        Ok(result) => result,
        Err(error) => {
            warn!(
                tier = %document.local.performance_tier,
                "benchmark failed; keeping the current performance tier"
            );
            return Err(error.into());
        }
    };

    print_benchmark(&result, json)?;
    if save {
        document.local.performance_tier = result.recommended_tier;
        document.local.benchmark = Some(result);
        store.save_local(&document.local).await?;
        println!("Saved to {}", store.path().display());
    }
    Ok(())
}

fn print_benchmark(result: &framelift::schema::GpuBenchmarkResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("Recommended tier: {}", result.recommended_tier);
    for tier in PerformanceTier::ALL {
        match (result.mean_frame_ms.get(tier), result.max_frame_ms.get(tier)) {
            (Some(mean), Some(max)) => {
                println!("  {tier:<12} mean {mean:>7.2} ms  max {max:>7.2} ms")
            }
            _ => println!("  {tier:<12} not tested"),
        }
    }
    Ok(())
}

async fn run_render(
    store: YamlSettingsStore,
    image: Option<&Path>,
    native: Dimensions,
    frames: u64,
    snapshot: Option<&Path>,
) -> Result<()> {
    let video = match image {
        Some(path) => SyntheticVideo::from_image(path, None)?,
        None => SyntheticVideo::new(native, None),
    };
    let overlays = Arc::new(HeadlessOverlayFactory::new());
    let registry = EnhancerRegistry::new(EnhancerContext {
        settings: Arc::new(store),
        catalog: Arc::new(CatalogLoader::new(Arc::new(BuiltinLibraryProvider::new()))),
        renderers: Arc::new(GpuRendererFactory),
        overlays: overlays.clone(),
    });

    let source: Arc<dyn VideoSource> = video.clone();
    let enhancer = registry.enhance(source).await?;
    let overlay = overlays
        .overlay_for(video.element_key())
        .context("overlay was not created")?;
    let canvas = overlay.offscreen_canvas();

    for frame in 1..=frames {
        video.advance();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while canvas.presented_frames() < frame && enhancer.is_active() {
            if tokio::time::Instant::now() >= deadline {
                bail!("timed out waiting for frame {frame} to be presented");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        if !enhancer.is_active() {
            bail!("enhancement stopped after {} frames", canvas.presented_frames());
        }
    }
    eprintln!("presented {} frames", canvas.presented_frames());

    if let Some(path) = snapshot {
        let target = canvas.dimensions();
        let rgba = canvas.read_rgba()?;
        image::save_buffer(path, &rgba, target.width, target.height, image::ColorType::Rgba8)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        println!("Wrote {} ({target})", path.display());
    }

    registry.destroy_all().await;
    Ok(())
}

async fn run_settings(store: &YamlSettingsStore, json: bool) -> Result<()> {
    let document = store.load_document().await?;
    let settings = Settings::merge(&document.synced, &document.local);
    if json {
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }
    let mode = settings.selected_mode();
    println!("Settings: {}", store.path().display());
    println!("  mode:        {} ({})", mode.name(), mode.id());
    println!("  chain:       {}", effect_chain_summary(&settings.effects_for(mode)));
    println!("  resolution:  {}", settings.target_resolution.keyword());
    println!("  tier:        {}", settings.performance_tier);
    println!("  cors fix:    {}", settings.cross_origin_fix);
    println!("  modes:       {}", settings.enhancement_modes().len());
    match &document.local.benchmark {
        Some(result) => println!("  benchmark:   {} recommended", result.recommended_tier),
        None => println!("  benchmark:   none"),
    }
    Ok(())
}
