//! Algorithm library: the GPU passes that back each catalog effect.
//!
//! A [`PipelineStage`] reads one [`ImageSurface`] and owns the surface it writes.
//! Stages are chained by handing each one the previous stage's output, so a
//! stage never outlives the surface it reads from unless the owner destroys
//! them in reverse order.

mod kernels;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use crate::schema::Dimensions;

pub use kernels::{KernelParams, KernelShader, KernelSpec, OutputSize, PassThrough, RenderKernel};

/// Library algorithm used for intermediate downscaling between upscale stages.
pub const DOWNSCALE_ALGORITHM: &str = "Downscale";

/// Shared texture + view. Cloning is cheap and refers to the same GPU texture.
#[derive(Clone)]
pub struct ImageSurface {
    texture: Arc<wgpu::Texture>,
    view: Arc<wgpu::TextureView>,
    dimensions: Dimensions,
    format: wgpu::TextureFormat,
}

impl ImageSurface {
    /// Usage of every stage output: rendered into, sampled by the next stage,
    /// copied out for readback.
    pub const STAGE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::RENDER_ATTACHMENT
        .union(wgpu::TextureUsages::TEXTURE_BINDING)
        .union(wgpu::TextureUsages::COPY_SRC);
    /// Usage of the capture surface that receives decoded video frames.
    pub const CAPTURE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
        .union(wgpu::TextureUsages::COPY_DST)
        .union(wgpu::TextureUsages::RENDER_ATTACHMENT);

    pub fn new(
        device: &wgpu::Device,
        label: &str,
        dimensions: Dimensions,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: dimensions.extent(),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture: Arc::new(texture),
            view: Arc::new(view),
            dimensions,
            format,
        }
    }

    /// 8-bit RGBA surface a video frame can be written into.
    pub fn capture(device: &wgpu::Device, dimensions: Dimensions) -> Self {
        Self::new(
            device,
            "framelift-capture",
            dimensions,
            wgpu::TextureFormat::Rgba8Unorm,
            Self::CAPTURE_USAGE,
        )
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    pub fn shares_texture(&self, other: &ImageSurface) -> bool {
        Arc::ptr_eq(&self.texture, &other.texture)
    }

    /// Writes tightly packed RGBA8 pixels covering the whole surface.
    pub fn upload_rgba(&self, queue: &wgpu::Queue, rgba: &[u8]) -> Result<()> {
        let expected = self.dimensions.pixel_count() * 4;
        if rgba.len() as u64 != expected {
            bail!(
                "frame holds {} bytes but a {} surface needs {}",
                rgba.len(),
                self.dimensions,
                expected
            );
        }
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(self.dimensions.width * 4),
                rows_per_image: Some(self.dimensions.height),
            },
            self.dimensions.extent(),
        );
        Ok(())
    }

    pub fn destroy(&self) {
        self.texture.destroy();
    }
}

impl fmt::Debug for ImageSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSurface")
            .field("dimensions", &self.dimensions)
            .field("format", &self.format)
            .finish()
    }
}

/// Everything an algorithm needs to bind itself to its input.
pub struct StageInit<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub input: &'a ImageSurface,
    /// Size of `input`.
    pub native: Dimensions,
    /// Final render size, or the intermediate size for a downscale stage.
    pub target: Dimensions,
    pub format: wgpu::TextureFormat,
}

pub trait PipelineStage: Send + Sync {
    fn label(&self) -> &str;

    /// Records this stage's GPU work.
    fn encode(&self, encoder: &mut wgpu::CommandEncoder);

    fn output(&self) -> &ImageSurface;

    /// Frees GPU resources owned by the stage. Never touches the input surface.
    fn destroy(&self);
}

pub type StageFactory =
    Arc<dyn Fn(&StageInit<'_>) -> Result<Box<dyn PipelineStage>> + Send + Sync>;

/// Versioned set of algorithm factories keyed by algorithm id.
#[derive(Clone)]
pub struct AlgorithmLibrary {
    version: String,
    factories: BTreeMap<String, StageFactory>,
}

impl AlgorithmLibrary {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            factories: BTreeMap::new(),
        }
    }

    /// Render kernels for every catalog algorithm plus `Downscale`.
    pub fn builtin() -> Self {
        let mut library = Self::new(env!("CARGO_PKG_VERSION"));
        for (algorithm, spec) in kernels::BUILTIN_KERNELS {
            let spec = *spec;
            let label = (*algorithm).to_owned();
            library = library.with_algorithm(*algorithm, move |init: &StageInit<'_>| {
                Ok(Box::new(RenderKernel::new(init, &label, spec)?) as Box<dyn PipelineStage>)
            });
        }
        library
    }

    pub fn with_algorithm<F>(mut self, algorithm: &str, factory: F) -> Self
    where
        F: Fn(&StageInit<'_>) -> Result<Box<dyn PipelineStage>> + Send + Sync + 'static,
    {
        self.factories.insert(algorithm.to_owned(), Arc::new(factory));
        self
    }

    /// Copy of this library with one algorithm removed. Models an older library
    /// release that lacks an effect.
    pub fn without(&self, algorithm: &str) -> Self {
        let mut library = self.clone();
        library.factories.remove(algorithm);
        library
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn contains(&self, algorithm: &str) -> bool {
        self.factories.contains_key(algorithm)
    }

    pub fn algorithms(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn instantiate(
        &self,
        algorithm: &str,
        init: &StageInit<'_>,
    ) -> Result<Box<dyn PipelineStage>> {
        let factory = self.factories.get(algorithm).ok_or_else(|| {
            anyhow!(
                "algorithm '{algorithm}' is not available in library {}",
                self.version
            )
        })?;
        factory(init)
    }
}

impl fmt::Debug for AlgorithmLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmLibrary")
            .field("version", &self.version)
            .field("algorithms", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects;

    #[test]
    fn builtin_library_backs_every_catalog_effect() {
        let library = AlgorithmLibrary::builtin();
        for effect in effects::catalog() {
            assert!(
                library.contains(&effect.algorithm),
                "missing kernel for {}",
                effect.algorithm
            );
        }
        assert!(library.contains(DOWNSCALE_ALGORITHM));
    }

    #[test]
    fn without_removes_only_the_named_algorithm() {
        let library = AlgorithmLibrary::builtin();
        let older = library.without("CNNUL");
        assert!(!older.contains("CNNUL"));
        assert!(older.contains("CNNVL"));
        assert!(library.contains("CNNUL"));
        assert_eq!(older.version(), library.version());
    }

    #[test]
    fn stage_usage_is_renderable_and_sampleable() {
        assert!(ImageSurface::STAGE_USAGE.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
        assert!(ImageSurface::STAGE_USAGE.contains(wgpu::TextureUsages::TEXTURE_BINDING));
        assert!(ImageSurface::CAPTURE_USAGE.contains(wgpu::TextureUsages::COPY_DST));
    }
}
