use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::errors::RendererError;

/// Intermediate stage format used when the adapter cannot render and filter
/// half-float targets.
pub const FALLBACK_STAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
pub const PREFERRED_STAGE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

pub const SUBMITTED_WORK_TIMEOUT: Duration = Duration::from_secs(5);
/// Short GPU waits are polled by yielding so frame timings stay precise; longer
/// ones back off to a timer.
const SUBMITTED_WORK_SPIN: Duration = Duration::from_millis(2);
const SUBMITTED_WORK_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub vendor: u32,
    pub device: u32,
    pub name: String,
    pub backend: String,
    pub driver: String,
}

impl AdapterDescriptor {
    pub fn from_info(info: &wgpu::AdapterInfo) -> Self {
        Self {
            vendor: info.vendor,
            device: info.device,
            name: info.name.clone(),
            backend: format!("{:?}", info.backend).to_ascii_lowercase(),
            driver: if info.driver_info.is_empty() {
                info.driver.clone()
            } else {
                format!("{} {}", info.driver, info.driver_info)
            },
        }
    }

    /// Compact JSON form stored alongside benchmark results.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLoss {
    pub intentional: bool,
    pub message: String,
}

/// One adapter/device pair plus the queue. Cloning shares the same device.
#[derive(Clone)]
pub struct GpuContext {
    pub adapter: Arc<wgpu::Adapter>,
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub stage_format: wgpu::TextureFormat,
    pub descriptor: AdapterDescriptor,
    intentional_teardown: Arc<AtomicBool>,
}

impl GpuContext {
    /// Requests an adapter and a device with the largest buffer and texture limits
    /// the adapter allows. Windows adapters ignore the power preference and warn
    /// about it, so it is only set elsewhere.
    pub async fn acquire(label: &str) -> Result<(Self, mpsc::UnboundedReceiver<DeviceLoss>), RendererError> {
        let instance = wgpu::Instance::default();
        let power_preference = if cfg!(target_os = "windows") {
            wgpu::PowerPreference::None
        } else {
            wgpu::PowerPreference::HighPerformance
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| RendererError::initialization("no suitable GPU adapter found"))?;

        let supported = adapter.limits();
        let mut required_limits =
            wgpu::Limits::downlevel_defaults().using_resolution(supported.clone());
        required_limits.max_buffer_size = supported.max_buffer_size;
        required_limits.max_storage_buffer_binding_size = supported.max_storage_buffer_binding_size;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(label),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                },
                None,
            )
            .await
            .map_err(|error| {
                RendererError::initialization(format!("failed to request wgpu device: {error}"))
            })?;

        let descriptor = AdapterDescriptor::from_info(&adapter.get_info());
        let stage_format = stage_format(&adapter);
        info!(
            adapter = %descriptor.name,
            backend = %descriptor.backend,
            ?stage_format,
            "acquired GPU device"
        );

        let intentional_teardown = Arc::new(AtomicBool::new(false));
        let (loss_sender, loss_receiver) = mpsc::unbounded_channel();
        let teardown_flag = Arc::clone(&intentional_teardown);
        device.set_device_lost_callback(move |reason, message| {
            let intentional = teardown_flag.load(Ordering::SeqCst)
                || matches!(
                    reason,
                    wgpu::DeviceLostReason::Destroyed | wgpu::DeviceLostReason::Dropped
                );
            let _ = loss_sender.send(DeviceLoss {
                intentional,
                message,
            });
        });
        device.on_uncaptured_error(Box::new(|error| {
            error!(%error, "uncaptured GPU error");
        }));

        Ok((
            Self {
                adapter: Arc::new(adapter),
                device: Arc::new(device),
                queue: Arc::new(queue),
                stage_format,
                descriptor,
                intentional_teardown,
            },
            loss_receiver,
        ))
    }

    /// Destroys the device. The loss signal that follows is flagged as intentional.
    pub fn destroy_device(&self) {
        self.intentional_teardown.store(true, Ordering::SeqCst);
        self.device.destroy();
        debug!(adapter = %self.descriptor.name, "GPU device destroyed");
    }

    pub async fn wait_idle(&self) {
        wait_for_submitted_work(&self.device, &self.queue).await;
    }
}

/// Suspends until everything submitted so far has finished on the GPU.
/// The device is polled without blocking so other tasks keep running, and the
/// wait gives up after [`SUBMITTED_WORK_TIMEOUT`] since a lost device may never
/// fire the callback.
pub async fn wait_for_submitted_work(device: &wgpu::Device, queue: &wgpu::Queue) {
    let (sender, mut receiver) = oneshot::channel();
    queue.on_submitted_work_done(move || {
        let _ = sender.send(());
    });
    let drained = async {
        let started = Instant::now();
        loop {
            // Always suspend at least once.
            if started.elapsed() < SUBMITTED_WORK_SPIN {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(SUBMITTED_WORK_POLL_INTERVAL).await;
            }
            device.poll(wgpu::Maintain::Poll);
            match receiver.try_recv() {
                Ok(()) => return true,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => return false,
            }
        }
    };
    match tokio::time::timeout(SUBMITTED_WORK_TIMEOUT, drained).await {
        Ok(true) => {}
        Ok(false) => warn!("submitted-work callback dropped; device may be lost"),
        Err(_) => warn!("timed out waiting for submitted GPU work"),
    }
}

/// Half-float intermediates keep precision between stages but are not renderable
/// and filterable everywhere. Checked once per process.
pub fn stage_format(adapter: &wgpu::Adapter) -> wgpu::TextureFormat {
    static STAGE_FORMAT: OnceLock<wgpu::TextureFormat> = OnceLock::new();
    *STAGE_FORMAT.get_or_init(|| {
        let features = adapter.get_texture_format_features(PREFERRED_STAGE_FORMAT);
        let usable = features.allowed_usages.contains(
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
        ) && features
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::FILTERABLE);
        if usable {
            PREFERRED_STAGE_FORMAT
        } else {
            info!("adapter cannot render to half-float targets; using 8-bit intermediates");
            FALLBACK_STAGE_FORMAT
        }
    })
}
