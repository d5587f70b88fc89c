use anyhow::{bail, Result};
use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::{ImageSurface, PipelineStage, StageInit, DOWNSCALE_ALGORITHM};
use crate::schema::Dimensions;

const CONVOLVE_WGSL: &str = include_str!("../../shaders/wgsl/convolve.wgsl");
const RESAMPLE_WGSL: &str = include_str!("../../shaders/wgsl/resample.wgsl");

/// Matches `KernelParams` in convolve.wgsl and resample.wgsl.
/// 32 bytes, 16-byte aligned.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct KernelParams {
    pub texel: [f32; 2],
    pub strength: f32,
    pub radius: i32,
    pub mode: u32,
    pub _pad: [u32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelShader {
    Convolve,
    Resample,
}

impl KernelShader {
    fn source(self) -> &'static str {
        match self {
            Self::Convolve => CONVOLVE_WGSL,
            Self::Resample => RESAMPLE_WGSL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSize {
    /// Same as the input.
    Input,
    /// Input multiplied by a fixed factor.
    Scaled(u32),
    /// Whatever the builder asks for in `StageInit::target`.
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelSpec {
    pub shader: KernelShader,
    pub mode: u32,
    pub radius: i32,
    pub strength: f32,
    pub output: OutputSize,
}

impl KernelSpec {
    const fn convolve(mode: u32, radius: i32, strength: f32) -> Self {
        Self {
            shader: KernelShader::Convolve,
            mode,
            radius,
            strength,
            output: OutputSize::Input,
        }
    }

    const fn upscale(mode: u32, factor: u32, radius: i32) -> Self {
        Self {
            shader: KernelShader::Resample,
            mode,
            radius,
            strength: 0.35,
            output: OutputSize::Scaled(factor),
        }
    }

    pub fn output_dimensions(&self, input: Dimensions, target: Dimensions) -> Dimensions {
        match self.output {
            OutputSize::Input => input,
            OutputSize::Scaled(factor) => input.scaled(factor),
            OutputSize::Target => target,
        }
    }
}

// convolve.wgsl modes
const RESTORE: u32 = 0;
const SOFT: u32 = 1;
const DENOISE: u32 = 2;
const DEBLUR: u32 = 3;
const CLAMP: u32 = 4;
// resample.wgsl modes
const UPSCALE: u32 = 0;
const DOWNSCALE: u32 = 1;
const DENOISE_UPSCALE: u32 = 2;

pub(super) const BUILTIN_KERNELS: &[(&str, KernelSpec)] = &[
    ("DoG", KernelSpec::convolve(DEBLUR, 2, 0.6)),
    ("BilateralMean", KernelSpec::convolve(DENOISE, 2, 1.0)),
    ("CNNM", KernelSpec::convolve(RESTORE, 1, 0.5)),
    ("CNNSoftM", KernelSpec::convolve(SOFT, 1, 0.5)),
    ("CNNSoftVL", KernelSpec::convolve(SOFT, 3, 0.6)),
    ("CNNVL", KernelSpec::convolve(RESTORE, 3, 0.6)),
    ("CNNUL", KernelSpec::convolve(RESTORE, 5, 0.7)),
    ("GANUUL", KernelSpec::convolve(RESTORE, 7, 0.8)),
    ("ClampHighlights", KernelSpec::convolve(CLAMP, 1, 1.0)),
    ("CNNx2M", KernelSpec::upscale(UPSCALE, 2, 1)),
    ("CNNx2VL", KernelSpec::upscale(UPSCALE, 2, 2)),
    ("DenoiseCNNx2VL", KernelSpec::upscale(DENOISE_UPSCALE, 2, 2)),
    ("CNNx2UL", KernelSpec::upscale(UPSCALE, 2, 4)),
    ("GANx3L", KernelSpec::upscale(UPSCALE, 3, 3)),
    ("GANx4UUL", KernelSpec::upscale(UPSCALE, 4, 5)),
    (
        DOWNSCALE_ALGORITHM,
        KernelSpec {
            shader: KernelShader::Resample,
            mode: DOWNSCALE,
            radius: 1,
            strength: 1.0,
            output: OutputSize::Target,
        },
    ),
];

/// One full-screen fragment pass from `input` into a stage-owned surface.
/// The bind group is built once because the input surface never changes for
/// the life of the stage.
pub struct RenderKernel {
    label: String,
    pipeline: wgpu::RenderPipeline,
    bind_group: wgpu::BindGroup,
    params_buffer: wgpu::Buffer,
    output: ImageSurface,
}

impl RenderKernel {
    pub fn new(init: &StageInit<'_>, label: &str, spec: KernelSpec) -> Result<Self> {
        let device = init.device;
        let input = init.input.dimensions();
        let output_dimensions = spec.output_dimensions(input, init.target);
        if !input.is_valid() || !output_dimensions.is_valid() {
            bail!("{label}: cannot map {input} onto {output_dimensions}");
        }

        let strength = if spec.output == OutputSize::Target {
            input.width as f32 / output_dimensions.width as f32
        } else {
            spec.strength
        };
        let params = KernelParams {
            texel: [1.0 / input.width as f32, 1.0 / input.height as f32],
            strength,
            radius: spec.radius,
            mode: spec.mode,
            _pad: [0; 3],
        };

        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(spec.shader.source().into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label}-bgl")),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label}-layout")),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("{label}-pipeline")),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader_module,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: &[],
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader_module,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: init.format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{label}-params")),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(&format!("{label}-sampler")),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{label}-bg")),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(init.input.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let output = ImageSurface::new(
            device,
            &format!("{label}-output"),
            output_dimensions,
            init.format,
            ImageSurface::STAGE_USAGE,
        );

        Ok(Self {
            label: label.to_owned(),
            pipeline,
            bind_group,
            params_buffer,
            output,
        })
    }
}

impl PipelineStage for RenderKernel {
    fn label(&self) -> &str {
        &self.label
    }

    fn encode(&self, encoder: &mut wgpu::CommandEncoder) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(&format!("{}-pass", self.label)),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: self.output.view(),
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &self.bind_group, &[]);
        pass.draw(0..3, 0..1); // full-screen triangle
    }

    fn output(&self) -> &ImageSurface {
        &self.output
    }

    fn destroy(&self) {
        self.output.destroy();
        self.params_buffer.destroy();
    }
}

/// Placeholder stage for an empty chain: its output is its input.
pub struct PassThrough {
    output: ImageSurface,
}

impl PassThrough {
    pub fn new(input: &ImageSurface) -> Self {
        Self {
            output: input.clone(),
        }
    }
}

impl PipelineStage for PassThrough {
    fn label(&self) -> &str {
        "PassThrough"
    }

    fn encode(&self, _encoder: &mut wgpu::CommandEncoder) {}

    fn output(&self) -> &ImageSurface {
        &self.output
    }

    // The surface belongs to whoever created the input.
    fn destroy(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_params_is_32_bytes_and_16_aligned() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 32);
        assert_eq!(std::mem::size_of::<KernelParams>() % 16, 0);
    }

    #[test]
    fn wgsl_sources_contain_expected_entry_points() {
        for source in [CONVOLVE_WGSL, RESAMPLE_WGSL] {
            assert!(source.contains("fn vs_main"));
            assert!(source.contains("fn fs_main"));
            assert!(source.contains("struct KernelParams"));
        }
    }

    #[test]
    fn upscalers_scale_by_their_factor() {
        let native = Dimensions::new(640, 360);
        let target = Dimensions::new(100, 100);
        let spec = BUILTIN_KERNELS
            .iter()
            .find(|(name, _)| *name == "GANx3L")
            .map(|(_, spec)| *spec)
            .expect("kernel present");
        assert_eq!(
            spec.output_dimensions(native, target),
            Dimensions::new(1920, 1080)
        );
    }

    #[test]
    fn downscale_follows_requested_target() {
        let spec = BUILTIN_KERNELS
            .iter()
            .find(|(name, _)| *name == DOWNSCALE_ALGORITHM)
            .map(|(_, spec)| *spec)
            .expect("kernel present");
        let target = Dimensions::new(960, 540);
        assert_eq!(
            spec.output_dimensions(Dimensions::new(1920, 1080), target),
            target
        );
    }
}
