use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{frame_loop, lock, Core, RendererState, Shared};
use crate::errors::{RendererError, RuntimeErrorKind};
use crate::gpu::DeviceLoss;

/// Forwards loss signals of one device to the renderer. Ends when the device is
/// dropped or the renderer is gone.
pub(super) fn watch_device_loss(
    shared: Weak<Shared>,
    mut losses: mpsc::UnboundedReceiver<DeviceLoss>,
) {
    tokio::spawn(async move {
        while let Some(loss) = losses.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            handle_device_loss(&shared, loss).await;
        }
    });
}

pub(super) async fn handle_device_loss(shared: &Arc<Shared>, loss: DeviceLoss) {
    if loss.intentional || shared.is_destroyed() {
        debug!(message = %loss.message, "ignoring intentional device loss");
        return;
    }
    warn!(message = %loss.message, "GPU device lost");
    if shared.recovering.swap(true, Ordering::SeqCst) {
        debug!("recovery already in progress");
        return;
    }
    recover(shared).await;
    shared.recovering.store(false, Ordering::SeqCst);
}

/// Stops the loop, drops the lost device's resources and rebuilds everything on
/// a fresh device. Resumes from the first-frame phase on success.
async fn recover(shared: &Arc<Shared>) {
    info!("starting device recovery");
    shared.set_state(RendererState::Recovering);
    lock(&shared.frame_loop).cancel();

    let lost = shared.core.lock().await.take();
    if let Some(lost) = lost {
        lost.release();
    }
    if shared.is_destroyed() {
        return;
    }

    match Core::build(shared).await {
        Ok((core, losses)) => {
            let mut guard = shared.core.lock().await;
            if shared.is_destroyed() {
                drop(guard);
                shared.canvas.unconfigure();
                core.release();
                return;
            }
            *guard = Some(core);
            drop(guard);
            watch_device_loss(Arc::downgrade(shared), losses);
            shared.set_state(RendererState::FirstFrameRendering);
            frame_loop::start(shared);
            info!("device recovery successful");
        }
        Err(failure) => {
            error!(%failure, "device recovery failed");
            (shared.callbacks.on_error)(RendererError::runtime(
                RuntimeErrorKind::RecoveryFailed,
                format!("failed to recover from device loss: {failure}"),
            ));
        }
    }
}
