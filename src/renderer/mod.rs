//! Per-video GPU renderer.
//!
//! A [`Renderer`] owns one device, the capture surface sized to the native video
//! resolution, the stage pipeline and the final blit onto the canvas. It runs its
//! own frame loop, rebuilds itself in place when the source or configuration
//! changes, and re-acquires the device after an unintentional loss.
//!
//! The handle is cheap to clone. Every clone refers to the same renderer, and
//! [`Renderer::destroy`] tears it down for all of them.

mod blit;
mod frame_loop;
mod recovery;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::algorithms::{AlgorithmLibrary, ImageSurface};
use crate::canvas::Canvas;
use crate::errors::RendererError;
use crate::gpu::{DeviceLoss, GpuContext};
use crate::overlay::InitProgress;
use crate::pipeline_builder::Pipeline;
use crate::schema::{Dimensions, EnhancementEffect};
use crate::video::VideoSource;

use blit::BlitPass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererState {
    Uninitialized,
    Initializing,
    FirstFrameRendering,
    Active,
    Recovering,
    Destroyed,
}

/// What the renderer draws: the effect chain and the canvas size.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererConfiguration {
    pub effects: Vec<EnhancementEffect>,
    pub target: Dimensions,
}

pub type ErrorCallback = Arc<dyn Fn(RendererError) + Send + Sync>;
pub type FirstFrameCallback = Arc<dyn Fn() + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(InitProgress) + Send + Sync>;

#[derive(Clone)]
pub struct RendererCallbacks {
    /// Fatal runtime errors and failed recoveries. The renderer has already
    /// stopped rendering when this runs.
    pub on_error: ErrorCallback,
    pub on_first_frame: FirstFrameCallback,
    pub on_progress: ProgressCallback,
}

impl Default for RendererCallbacks {
    fn default() -> Self {
        Self {
            on_error: Arc::new(|_| {}),
            on_first_frame: Arc::new(|| {}),
            on_progress: Arc::new(|_| {}),
        }
    }
}

pub struct RendererOptions {
    pub video: Arc<dyn VideoSource>,
    pub canvas: Arc<dyn Canvas>,
    pub effects: Vec<EnhancementEffect>,
    pub target: Dimensions,
    pub library: AlgorithmLibrary,
    /// Reload tainted videos with an anonymous cross-origin request once.
    pub cross_origin_fix: bool,
    pub callbacks: RendererCallbacks,
}

/// Device-bound resources. Replaced wholesale on recovery.
struct Core {
    gpu: GpuContext,
    canvas_format: wgpu::TextureFormat,
    capture: ImageSurface,
    pipeline: Pipeline,
    blit: BlitPass,
}

struct Shared {
    state: Mutex<RendererState>,
    destroyed: AtomicBool,
    recovering: AtomicBool,
    first_frame_reported: AtomicBool,
    core: tokio::sync::Mutex<Option<Core>>,
    config: Mutex<RendererConfiguration>,
    video: Mutex<Arc<dyn VideoSource>>,
    canvas: Arc<dyn Canvas>,
    library: AlgorithmLibrary,
    cross_origin_fix: bool,
    callbacks: RendererCallbacks,
    frame_loop: Mutex<CancellationToken>,
    pipeline_builds: AtomicUsize,
    releases: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn state(&self) -> RendererState {
        *lock(&self.state)
    }

    fn set_state(&self, state: RendererState) {
        let mut current = lock(&self.state);
        if *current == RendererState::Destroyed {
            return;
        }
        if *current != state {
            debug!(from = ?*current, to = ?state, "renderer state");
            *current = state;
        }
    }

    fn video(&self) -> Arc<dyn VideoSource> {
        Arc::clone(&lock(&self.video))
    }

    fn config(&self) -> RendererConfiguration {
        lock(&self.config).clone()
    }

    fn build_pipeline(
        &self,
        gpu: &GpuContext,
        capture: &ImageSurface,
        config: &RendererConfiguration,
    ) -> Result<Pipeline> {
        let pipeline = Pipeline::build(
            &gpu.device,
            &gpu.queue,
            &self.library,
            capture,
            config.target,
            &config.effects,
            gpu.stage_format,
        )?;
        self.pipeline_builds.fetch_add(1, Ordering::SeqCst);
        Ok(pipeline)
    }
}

impl Core {
    /// Acquires a device and builds every resource for the current video size.
    /// On failure anything already created is released before returning.
    async fn build(
        shared: &Shared,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeviceLoss>), RendererError> {
        (shared.callbacks.on_progress)(InitProgress::AcquiringGpu);
        let (gpu, losses) = GpuContext::acquire("framelift-renderer").await?;

        match Self::build_on(shared, &gpu).await {
            Ok(core) => Ok((core, losses)),
            Err(error) => {
                shared.canvas.unconfigure();
                gpu.destroy_device();
                Err(RendererError::initialization(format!("{error:#}")))
            }
        }
    }

    async fn build_on(shared: &Shared, gpu: &GpuContext) -> Result<Self> {
        let native = shared.video().native_dimensions();
        anyhow::ensure!(
            native.is_valid(),
            "video has no usable resolution ({native})"
        );

        shared.canvas.resize(shared.config().target);
        let canvas_format = shared
            .canvas
            .configure(gpu)
            .context("failed to configure the canvas presentation surface")?;

        let capture = ImageSurface::capture(&gpu.device, native);
        let pipeline = match shared.build_pipeline(gpu, &capture, &shared.config()) {
            Ok(pipeline) => pipeline,
            Err(error) => {
                capture.destroy();
                return Err(error);
            }
        };
        pipeline
            .warm_up(&gpu.device, &gpu.queue, shared.callbacks.on_progress.as_ref())
            .await;

        let blit = match pipeline.output() {
            Ok(output) => BlitPass::new(&gpu.device, output, canvas_format),
            Err(error) => {
                pipeline.destroy();
                capture.destroy();
                return Err(error);
            }
        };

        Ok(Self {
            gpu: gpu.clone(),
            canvas_format,
            capture,
            pipeline,
            blit,
        })
    }

    /// Swaps in a pipeline for `config`. The old pipeline is destroyed only after
    /// the new one exists and in-flight work has drained; on error it stays bound.
    async fn rebuild_pipeline(
        &mut self,
        shared: &Shared,
        config: &RendererConfiguration,
    ) -> Result<()> {
        self.gpu.wait_idle().await;
        let pipeline = shared.build_pipeline(&self.gpu, &self.capture, config)?;
        pipeline
            .warm_up(
                &self.gpu.device,
                &self.gpu.queue,
                shared.callbacks.on_progress.as_ref(),
            )
            .await;
        let output = match pipeline.output() {
            Ok(output) => output.clone(),
            Err(error) => {
                pipeline.destroy();
                return Err(error);
            }
        };
        self.blit.rebind(&self.gpu.device, &output);
        let previous = std::mem::replace(&mut self.pipeline, pipeline);
        previous.destroy();
        Ok(())
    }

    /// New capture surface at `native` plus a pipeline bound to it. The device
    /// and canvas configuration are kept.
    async fn rebuild_for_source(&mut self, shared: &Shared, native: Dimensions) -> Result<()> {
        anyhow::ensure!(native.is_valid(), "video has no usable resolution ({native})");
        self.gpu.wait_idle().await;
        let capture = ImageSurface::capture(&self.gpu.device, native);
        let pipeline = match shared.build_pipeline(&self.gpu, &capture, &shared.config()) {
            Ok(pipeline) => pipeline,
            Err(error) => {
                capture.destroy();
                return Err(error);
            }
        };
        pipeline
            .warm_up(
                &self.gpu.device,
                &self.gpu.queue,
                shared.callbacks.on_progress.as_ref(),
            )
            .await;
        let output = match pipeline.output() {
            Ok(output) => output.clone(),
            Err(error) => {
                pipeline.destroy();
                capture.destroy();
                return Err(error);
            }
        };
        self.blit.rebind(&self.gpu.device, &output);
        let previous_pipeline = std::mem::replace(&mut self.pipeline, pipeline);
        let previous_capture = std::mem::replace(&mut self.capture, capture);
        previous_pipeline.destroy();
        previous_capture.destroy();
        info!(%native, stages = self.pipeline.len(), "renderer resized for source");
        Ok(())
    }

    /// Frees stages, capture surface and device. The caller unconfigures the canvas.
    fn release(self) {
        self.pipeline.destroy();
        self.capture.destroy();
        self.gpu.destroy_device();
    }
}

#[derive(Clone)]
pub struct Renderer {
    shared: Arc<Shared>,
}

impl Renderer {
    /// Builds a renderer for `options.video` and starts its frame loop.
    ///
    /// Waits until the video has buffered enough to play. Every failure before
    /// the loop starts is an initialization error and leaves nothing allocated.
    pub async fn create(options: RendererOptions) -> Result<Self, RendererError> {
        let RendererOptions {
            video,
            canvas,
            effects,
            target,
            library,
            cross_origin_fix,
            callbacks,
        } = options;

        if !target.is_valid() {
            return Err(RendererError::initialization(format!(
                "invalid target resolution {target}"
            )));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(RendererState::Uninitialized),
            destroyed: AtomicBool::new(false),
            recovering: AtomicBool::new(false),
            first_frame_reported: AtomicBool::new(false),
            core: tokio::sync::Mutex::new(None),
            config: Mutex::new(RendererConfiguration { effects, target }),
            video: Mutex::new(video),
            canvas,
            library,
            cross_origin_fix,
            callbacks,
            frame_loop: Mutex::new(CancellationToken::new()),
            pipeline_builds: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        shared.set_state(RendererState::Initializing);

        let video = shared.video();
        video.wait_until_loaded().await;

        let (core, losses) = Core::build(&shared).await?;
        let stages = core.pipeline.len();
        let format = core.canvas_format;
        *shared.core.lock().await = Some(core);

        recovery::watch_device_loss(Arc::downgrade(&shared), losses);
        shared.set_state(RendererState::FirstFrameRendering);
        frame_loop::start(&shared);
        (shared.callbacks.on_progress)(InitProgress::Ready);
        info!(
            video = video.element_key(),
            native = %video.native_dimensions(),
            target = %shared.config().target,
            stages,
            ?format,
            "renderer ready"
        );
        Ok(Self { shared })
    }

    pub fn state(&self) -> RendererState {
        self.shared.state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    pub fn configuration(&self) -> RendererConfiguration {
        self.shared.config()
    }

    pub fn video(&self) -> Arc<dyn VideoSource> {
        self.shared.video()
    }

    /// Number of pipelines built over the renderer's lifetime.
    pub fn pipeline_builds(&self) -> usize {
        self.shared.pipeline_builds.load(Ordering::SeqCst)
    }

    /// Number of times device resources were released. At most one after destroy.
    pub fn resource_releases(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }

    /// Size of the capture surface, i.e. the native size the pipeline was built for.
    pub async fn capture_dimensions(&self) -> Option<Dimensions> {
        self.shared
            .core
            .lock()
            .await
            .as_ref()
            .map(|core| core.capture.dimensions())
    }

    pub async fn stage_labels(&self) -> Vec<String> {
        self.shared
            .core
            .lock()
            .await
            .as_ref()
            .map(|core| core.pipeline.labels().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn ptr_eq(&self, other: &Renderer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Applies a new effect chain or target size. Returns `false` without
    /// touching the GPU when both are unchanged. The configuration and canvas
    /// size are committed only once the new pipeline is running.
    pub async fn update_configuration(&self, config: RendererConfiguration) -> Result<bool> {
        if self.is_destroyed() {
            return Ok(false);
        }
        let mut guard = self.shared.core.lock().await;
        if self.is_destroyed() {
            return Ok(false);
        }
        let previous = self.shared.config();
        if previous == config {
            debug!("configuration unchanged; skipping pipeline rebuild");
            return Ok(false);
        }

        let stages = match guard.as_mut() {
            Some(core) => {
                core.rebuild_pipeline(&self.shared, &config)
                    .await
                    .context("failed to rebuild pipeline for new configuration")?;
                Some(core.pipeline.len())
            }
            // Recovery in progress; it builds from the stored configuration.
            None => None,
        };
        if previous.target != config.target {
            info!(from = %previous.target, to = %config.target, "updating target resolution");
            self.shared.canvas.resize(config.target);
        }
        *lock(&self.shared.config) = config;
        drop(guard);
        if let Some(stages) = stages {
            info!(stages, "renderer configuration updated");
        }
        Ok(true)
    }

    /// Rebuilds the capture surface and pipeline for the video's current native
    /// resolution. The device is kept.
    pub async fn handle_source_resize(&self) -> Result<()> {
        let mut guard = self.shared.core.lock().await;
        if self.is_destroyed() {
            return Ok(());
        }
        let Some(core) = guard.as_mut() else {
            return Ok(());
        };
        let native = self.shared.video().native_dimensions();
        core.rebuild_for_source(&self.shared, native).await
    }

    /// Re-points the renderer at an equivalent video element. Resources are only
    /// rebuilt when the new element's resolution differs.
    pub async fn update_video_source(&self, video: Arc<dyn VideoSource>) -> Result<()> {
        if self.is_destroyed() {
            return Ok(());
        }
        let native = video.native_dimensions();
        *lock(&self.shared.video) = video;

        let needs_resize = self
            .capture_dimensions()
            .await
            .is_some_and(|capture| capture != native);
        if needs_resize {
            info!(%native, "video dimensions changed on reattach");
            self.handle_source_resize().await?;
        }
        if !self.is_destroyed() && !self.shared.recovering.load(Ordering::SeqCst) {
            frame_loop::start(&self.shared);
        }
        Ok(())
    }

    /// Handles a device-loss signal. Intentional losses are ignored.
    pub async fn handle_device_loss(&self, loss: DeviceLoss) {
        recovery::handle_device_loss(&self.shared, loss).await;
    }

    /// Stops the frame loop and frees every GPU resource. Safe to call any number
    /// of times; only the first call does anything.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.shared.frame_loop).cancel();

        let core = self.shared.core.lock().await.take();
        if let Some(core) = core {
            core.gpu.wait_idle().await;
            self.shared.canvas.unconfigure();
            core.release();
            self.shared.releases.fetch_add(1, Ordering::SeqCst);
        } else {
            warn!("renderer destroyed without device resources");
        }
        *lock(&self.shared.state) = RendererState::Destroyed;
        info!("renderer destroyed");
    }
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("state", &self.state())
            .field("target", &self.shared.config().target)
            .finish()
    }
}
