use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{lock, Core, Renderer, RendererState, Shared};
use crate::canvas::Canvas;
use crate::errors::{RendererError, RuntimeErrorKind};
use crate::video::{FrameAccessError, ReadyState, VideoFrame, VideoSource};

pub(super) enum FrameOutcome {
    Rendered,
    /// Nothing to draw this tick (paused, not ready, or no frame yet).
    Skipped,
    /// The source changed size and resources were rebuilt; nothing drawn.
    Resized,
    Failed(RendererError),
}

/// Retry bookkeeping for one run of the loop.
#[derive(Debug, Default)]
struct RetryBudget {
    /// One resize-and-retry per size mismatch. Refilled by a rendered frame or
    /// a distinct source-resize event, never by a skipped frame.
    resize_attempted: bool,
    cors_reload_attempted: bool,
}

/// Starts a new frame loop, cancelling any previous one. The first tick runs
/// immediately so a paused video still shows a frame.
pub(super) fn start(shared: &Arc<Shared>) {
    let token = CancellationToken::new();
    {
        let mut current = lock(&shared.frame_loop);
        current.cancel();
        *current = token.clone();
    }
    let weak = Arc::downgrade(shared);
    let video = shared.video();
    tokio::spawn(run(weak, video, token));
}

async fn run(shared: Weak<Shared>, video: Arc<dyn VideoSource>, token: CancellationToken) {
    let mut budget = RetryBudget::default();
    let mut wait_for_frame = false;
    loop {
        if wait_for_frame {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = video.next_frame() => {}
            }
        }
        wait_for_frame = true;

        let Some(shared) = shared.upgrade() else {
            break;
        };
        if token.is_cancelled() || shared.is_destroyed() {
            break;
        }

        match process_frame(&shared, video.as_ref()).await {
            FrameOutcome::Rendered => {
                budget.resize_attempted = false;
                if shared.state() == RendererState::FirstFrameRendering {
                    shared.set_state(RendererState::Active);
                }
                if !shared.first_frame_reported.swap(true, Ordering::SeqCst) {
                    debug!("first frame rendered");
                    (shared.callbacks.on_first_frame)();
                }
            }
            FrameOutcome::Skipped => {}
            FrameOutcome::Resized => budget.resize_attempted = false,
            FrameOutcome::Failed(failure) => {
                if !recover_in_place(&shared, video.as_ref(), &mut budget, &failure).await {
                    let failure = failure.into_fatal();
                    error!(%failure, code = failure.code(), "unrecoverable frame error; destroying renderer");
                    (shared.callbacks.on_error)(failure);
                    Renderer { shared }.destroy().await;
                    break;
                }
            }
        }
    }
    debug!("frame loop stopped");
}

/// Self-healing for the two retryable failures. Returns `false` when the
/// failure must be escalated.
async fn recover_in_place(
    shared: &Shared,
    video: &dyn VideoSource,
    budget: &mut RetryBudget,
    failure: &RendererError,
) -> bool {
    match failure {
        RendererError::Runtime { .. } if failure.is_recoverable() && !budget.resize_attempted => {
            budget.resize_attempted = true;
            warn!(%failure, "frame did not fit capture surface; resizing resources and retrying");
            let mut guard = shared.core.lock().await;
            if let Some(core) = guard.as_mut() {
                if let Err(error) = core
                    .rebuild_for_source(shared, video.native_dimensions())
                    .await
                {
                    warn!(error = %format!("{error:#}"), "resize after size mismatch failed");
                }
            }
            true
        }
        RendererError::CrossOrigin { fix_enabled: true } if !budget.cors_reload_attempted => {
            budget.cors_reload_attempted = true;
            info!("frames are cross-origin protected; reloading with anonymous CORS");
            match video.reload_anonymous_cors().await {
                Ok(()) => true,
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "anonymous CORS reload failed");
                    false
                }
            }
        }
        _ => false,
    }
}

async fn process_frame(shared: &Shared, video: &dyn VideoSource) -> FrameOutcome {
    if video.ready_state() < ReadyState::HaveCurrentData {
        return FrameOutcome::Skipped;
    }

    let mut guard = shared.core.lock().await;
    if shared.is_destroyed() {
        return FrameOutcome::Skipped;
    }
    let Some(core) = guard.as_mut() else {
        return FrameOutcome::Skipped;
    };

    let native = video.native_dimensions();
    let captured = core.capture.dimensions();
    if native != captured {
        info!(from = %captured, to = %native, "video resolution changed");
        return match core.rebuild_for_source(shared, native).await {
            Ok(()) => FrameOutcome::Resized,
            Err(error) => FrameOutcome::Failed(RendererError::runtime(
                RuntimeErrorKind::Validation,
                format!("failed to resize for new source resolution: {error:#}"),
            )),
        };
    }

    let frame = match video.current_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => return FrameOutcome::Skipped,
        Err(FrameAccessError::CrossOrigin) => {
            return FrameOutcome::Failed(RendererError::CrossOrigin {
                fix_enabled: shared.cross_origin_fix,
            })
        }
        Err(FrameAccessError::Decode(message)) => {
            return FrameOutcome::Failed(RendererError::runtime(
                RuntimeErrorKind::Validation,
                message,
            ))
        }
    };

    match core.render(shared.canvas.as_ref(), &frame).await {
        Ok(()) => FrameOutcome::Rendered,
        Err(failure) => FrameOutcome::Failed(failure),
    }
}

impl Core {
    /// Uploads `frame`, runs every stage and the blit in one submission, then
    /// presents the canvas frame.
    async fn render(&self, canvas: &dyn Canvas, frame: &VideoFrame) -> Result<(), RendererError> {
        if frame.dimensions != self.capture.dimensions() {
            return Err(RendererError::runtime(
                RuntimeErrorKind::SizeMismatch,
                format!(
                    "texture copy out of bounds: frame is {} but capture surface is {}",
                    frame.dimensions,
                    self.capture.dimensions()
                ),
            ));
        }
        self.capture
            .upload_rgba(&self.gpu.queue, &frame.rgba)
            .map_err(|error| {
                RendererError::runtime(RuntimeErrorKind::SizeMismatch, format!("{error:#}"))
            })?;

        let target = canvas.acquire().map_err(|error| {
            RendererError::runtime(RuntimeErrorKind::Surface, format!("{error:#}"))
        })?;

        let device = &self.gpu.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("framelift-frame"),
        });
        self.pipeline.encode(&mut encoder);
        self.blit.encode(&mut encoder, &target.view);
        self.gpu.queue.submit(Some(encoder.finish()));
        let validation = device.pop_error_scope().await;
        let out_of_memory = device.pop_error_scope().await;

        if let Some(error) = out_of_memory {
            return Err(RendererError::runtime(
                RuntimeErrorKind::OutOfMemory,
                error.to_string(),
            ));
        }
        if let Some(error) = validation {
            return Err(RendererError::runtime(
                RuntimeErrorKind::Validation,
                error.to_string(),
            ));
        }
        target.present();
        Ok(())
    }
}
