//! Presentation surface the renderer draws into.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::algorithms::ImageSurface;
use crate::gpu::GpuContext;
use crate::schema::Dimensions;

/// One acquired frame of the canvas. Dropping it without [`CanvasFrame::present`]
/// discards the frame.
pub struct CanvasFrame {
    pub view: wgpu::TextureView,
    surface_texture: Option<wgpu::SurfaceTexture>,
    presented: Option<Arc<AtomicU64>>,
}

impl CanvasFrame {
    pub fn new(view: wgpu::TextureView) -> Self {
        Self {
            view,
            surface_texture: None,
            presented: None,
        }
    }

    /// Frame backed by a window surface; presenting hands it to the compositor.
    pub fn from_surface_texture(surface_texture: wgpu::SurfaceTexture) -> Self {
        let view = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            view,
            surface_texture: Some(surface_texture),
            presented: None,
        }
    }

    fn counted(mut self, presented: Arc<AtomicU64>) -> Self {
        self.presented = Some(presented);
        self
    }

    pub fn present(self) {
        if let Some(surface_texture) = self.surface_texture {
            surface_texture.present();
        }
        if let Some(presented) = self.presented {
            presented.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub trait Canvas: Send + Sync {
    fn dimensions(&self) -> Dimensions;

    fn resize(&self, dimensions: Dimensions);

    /// Binds the canvas to `gpu` and returns the format frames must be rendered in.
    fn configure(&self, gpu: &GpuContext) -> Result<wgpu::TextureFormat>;

    fn acquire(&self) -> Result<CanvasFrame>;

    fn unconfigure(&self);
}

struct Configured {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    target: ImageSurface,
}

struct OffscreenState {
    dimensions: Dimensions,
    configured: Option<Configured>,
}

/// Texture-backed canvas with RGBA readback. Stands in for a page canvas in the
/// CLI and in tests.
pub struct OffscreenCanvas {
    state: Mutex<OffscreenState>,
    presented: Arc<AtomicU64>,
}

impl OffscreenCanvas {
    pub const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
    const USAGE: wgpu::TextureUsages = wgpu::TextureUsages::RENDER_ATTACHMENT
        .union(wgpu::TextureUsages::COPY_SRC)
        .union(wgpu::TextureUsages::TEXTURE_BINDING);

    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            state: Mutex::new(OffscreenState {
                dimensions,
                configured: None,
            }),
            presented: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OffscreenState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    pub fn is_configured(&self) -> bool {
        self.lock().configured.is_some()
    }

    /// Copies the last presented frame back to the CPU as tightly packed RGBA8.
    pub fn read_rgba(&self) -> Result<Vec<u8>> {
        let (device, queue, target) = {
            let state = self.lock();
            let configured = state
                .configured
                .as_ref()
                .ok_or_else(|| anyhow!("canvas is not configured"))?;
            (
                Arc::clone(&configured.device),
                Arc::clone(&configured.queue),
                configured.target.clone(),
            )
        };
        let Dimensions { width, height } = target.dimensions();

        let unpadded_bytes_per_row = width
            .checked_mul(4)
            .ok_or_else(|| anyhow!("canvas width overflow when computing row bytes"))?;
        let padded_bytes_per_row =
            align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("framelift-canvas-readback"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("framelift-canvas-readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: target.texture(),
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &readback_buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            target.dimensions().extent(),
        );
        queue.submit(Some(encoder.finish()));

        let buffer_slice = readback_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| anyhow!("failed receiving GPU map callback"))?
            .context("GPU buffer mapping failed")?;

        let mapped = buffer_slice.get_mapped_range();
        let mut frame = vec![0_u8; (unpadded_bytes_per_row * height) as usize];
        for (row_index, chunk) in mapped
            .chunks(padded_bytes_per_row as usize)
            .take(height as usize)
            .enumerate()
        {
            let dst_start = row_index * unpadded_bytes_per_row as usize;
            let dst_end = dst_start + unpadded_bytes_per_row as usize;
            frame[dst_start..dst_end].copy_from_slice(&chunk[..unpadded_bytes_per_row as usize]);
        }
        drop(mapped);
        readback_buffer.unmap();
        Ok(frame)
    }
}

impl Canvas for OffscreenCanvas {
    fn dimensions(&self) -> Dimensions {
        self.lock().dimensions
    }

    fn resize(&self, dimensions: Dimensions) {
        let mut state = self.lock();
        if state.dimensions == dimensions {
            return;
        }
        debug!(from = %state.dimensions, to = %dimensions, "canvas resized");
        state.dimensions = dimensions;
        if let Some(configured) = state.configured.as_mut() {
            configured.target.destroy();
            configured.target = ImageSurface::new(
                &configured.device,
                "framelift-canvas",
                dimensions,
                Self::FORMAT,
                Self::USAGE,
            );
        }
    }

    fn configure(&self, gpu: &GpuContext) -> Result<wgpu::TextureFormat> {
        let mut state = self.lock();
        if !state.dimensions.is_valid() {
            return Err(anyhow!(
                "cannot configure a {} canvas",
                state.dimensions
            ));
        }
        if let Some(previous) = state.configured.take() {
            previous.target.destroy();
        }
        let target = ImageSurface::new(
            &gpu.device,
            "framelift-canvas",
            state.dimensions,
            Self::FORMAT,
            Self::USAGE,
        );
        state.configured = Some(Configured {
            device: Arc::clone(&gpu.device),
            queue: Arc::clone(&gpu.queue),
            target,
        });
        Ok(Self::FORMAT)
    }

    fn acquire(&self) -> Result<CanvasFrame> {
        let state = self.lock();
        let configured = state
            .configured
            .as_ref()
            .ok_or_else(|| anyhow!("canvas is not configured"))?;
        let view = configured
            .target
            .texture()
            .create_view(&wgpu::TextureViewDescriptor::default());
        Ok(CanvasFrame::new(view).counted(Arc::clone(&self.presented)))
    }

    fn unconfigure(&self) {
        if let Some(configured) = self.lock().configured.take() {
            configured.target.destroy();
        }
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_padded_to_copy_alignment() {
        assert_eq!(align_to(4, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(1924 * 4, 256), 7936);
    }

    #[test]
    fn unconfigured_canvas_cannot_be_acquired() {
        let canvas = OffscreenCanvas::new(Dimensions::new(16, 16));
        assert!(canvas.acquire().is_err());
        assert!(canvas.read_rgba().is_err());
        canvas.resize(Dimensions::new(32, 32));
        assert_eq!(canvas.dimensions(), Dimensions::new(32, 32));
    }
}
