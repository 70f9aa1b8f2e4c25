use std::borrow::Cow;

use bytemuck::{Pod, Zeroable};
use color::{ToneSamples, MAX_SKIN_TONES};
use glam::Mat4;
use pollster::FutureExt;
use tracing::debug;
use wgpu::util::DeviceExt;

use crate::{quad_vertex_layout, RendererError, QUAD_INDICES, QUAD_VERTICES, TARGET_FORMAT};

/// Below this sigma the blur stage copies its input texel for texel.
pub const MIN_BLUR_SIGMA: f32 = 0.1;
/// Largest tap offset sampled on either side of the centre texel.
pub const MAX_KERNEL_RADIUS: u32 = 15;

const FULLSCREEN_WGSL: &str = include_str!("shaders/fullscreen.wgsl");
const BLUR_WGSL: &str = include_str!("shaders/blur.wgsl");
const MASK_WGSL: &str = include_str!("shaders/mask.wgsl");
const COMPOSITE_WGSL: &str = include_str!("shaders/composite.wgsl");
const PREVIEW_WGSL: &str = include_str!("shaders/preview.wgsl");

/// Fragment stages paired with their entry points.
pub(crate) const FRAGMENT_STAGES: [(&str, &str, &str); 4] = [
    ("blur", BLUR_WGSL, "fs_blur"),
    ("mask", MASK_WGSL, "fs_mask"),
    ("composite", COMPOSITE_WGSL, "fs_composite"),
    ("preview", PREVIEW_WGSL, "fs_preview"),
];

/// Full module source for a fragment stage: the shared vertex stage followed
/// by the fragment code.
pub(crate) fn stage_source(fragment: &str) -> String {
    format!("{FULLSCREEN_WGSL}\n{fragment}")
}

/// Tap radius used for `sigma`; 0 means the stage copies.
pub fn kernel_radius(sigma: f32) -> u32 {
    if !(sigma >= MIN_BLUR_SIGMA) {
        return 0;
    }
    ((sigma * 3.0).ceil() as u32).clamp(1, MAX_KERNEL_RADIUS)
}

/// Normalized weights for offsets `-r..=r`, matching what the blur stage sums.
pub fn gaussian_weights(sigma: f32) -> Vec<f32> {
    let radius = kernel_radius(sigma) as i32;
    if radius == 0 {
        return vec![1.0];
    }
    let denom = 2.0 * sigma * sigma;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|i| {
            let offset = i as f32;
            (-(offset * offset) / denom).exp()
        })
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlurDirection {
    Horizontal,
    Vertical,
}

impl BlurDirection {
    fn unit_vector(self) -> [f32; 2] {
        match self {
            BlurDirection::Horizontal => [1.0, 0.0],
            BlurDirection::Vertical => [0.0, 1.0],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct TransformUniforms {
    pub matrix: [[f32; 4]; 4],
}

impl TransformUniforms {
    pub fn new(matrix: Mat4) -> Self {
        Self {
            matrix: matrix.to_cols_array_2d(),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct BlurUniforms {
    pub direction: [f32; 2],
    pub texel_size: [f32; 2],
    pub sigma: f32,
    pub radius: u32,
    pub _padding: [u32; 2],
}

impl BlurUniforms {
    pub fn new(direction: BlurDirection, width: u32, height: u32, sigma: f32) -> Self {
        Self {
            direction: direction.unit_vector(),
            texel_size: [1.0 / width.max(1) as f32, 1.0 / height.max(1) as f32],
            sigma,
            radius: kernel_radius(sigma),
            _padding: [0; 2],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct MaskUniforms {
    pub tones: [[f32; 4]; MAX_SKIN_TONES],
    pub tone_count: u32,
    pub tolerance: f32,
    pub _padding: [u32; 2],
}

impl MaskUniforms {
    pub fn new(tones: &ToneSamples, tolerance: f32) -> Self {
        let mut packed = [[0.0; 4]; MAX_SKIN_TONES];
        for (slot, tone) in packed.iter_mut().zip(tones.iter()) {
            *slot = tone.to_vec4();
        }
        Self {
            tones: packed,
            tone_count: tones.len().min(MAX_SKIN_TONES) as u32,
            tolerance,
            _padding: [0; 2],
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct CompositeUniforms {
    pub background: [f32; 4],
    pub detail_amount: f32,
    pub mask_expansion: f32,
    pub view_mode: u32,
    pub _padding: u32,
}

/// Compiled programs, bind group layouts and quad geometry shared by every pass.
pub struct ShaderStageSet {
    transform_layout: wgpu::BindGroupLayout,
    source_layout: wgpu::BindGroupLayout,
    composite_layout: wgpu::BindGroupLayout,
    preview_layout: wgpu::BindGroupLayout,
    blur_pipeline: wgpu::RenderPipeline,
    mask_pipeline: wgpu::RenderPipeline,
    composite_offscreen_pipeline: wgpu::RenderPipeline,
    composite_display_pipeline: wgpu::RenderPipeline,
    preview_pipeline: wgpu::RenderPipeline,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
}

impl ShaderStageSet {
    /// Compile every stage. Any WGSL or pipeline validation error aborts with
    /// [`RendererError::ShaderCompilation`].
    pub fn new(
        device: &wgpu::Device,
        display_format: wgpu::TextureFormat,
    ) -> Result<Self, RendererError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let stages = Self::build(device, display_format);
        if let Some(error) = device.pop_error_scope().block_on() {
            return Err(RendererError::ShaderCompilation(error.to_string()));
        }
        debug!(?display_format, "compiled retouch shader stages");
        Ok(stages)
    }

    fn build(device: &wgpu::Device, display_format: wgpu::TextureFormat) -> Self {
        let [blur, mask, composite, preview] = FRAGMENT_STAGES.map(|(name, source, _)| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(stage_source(source))),
            })
        });

        let transform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("retouch.transform.layout"),
            entries: &[uniform_entry(0, wgpu::ShaderStages::VERTEX)],
        });

        let source_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("retouch.source.layout"),
            entries: &[
                texture_entry(0),
                sampler_entry(1),
                uniform_entry(2, wgpu::ShaderStages::FRAGMENT),
            ],
        });

        let composite_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("retouch.composite.layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                sampler_entry(3),
                uniform_entry(4, wgpu::ShaderStages::FRAGMENT),
            ],
        });

        let preview_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("retouch.preview.layout"),
            entries: &[texture_entry(0), sampler_entry(1)],
        });

        let source_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("retouch.source.pipeline-layout"),
            bind_group_layouts: &[&transform_layout, &source_layout],
            push_constant_ranges: &[],
        });
        let composite_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("retouch.composite.pipeline-layout"),
                bind_group_layouts: &[&transform_layout, &composite_layout],
                push_constant_ranges: &[],
            });
        let preview_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("retouch.preview.pipeline-layout"),
                bind_group_layouts: &[&transform_layout, &preview_layout],
                push_constant_ranges: &[],
            });

        let blur_pipeline = create_pipeline(
            device,
            "retouch.blur.pipeline",
            &blur,
            "fs_blur",
            &source_pipeline_layout,
            TARGET_FORMAT,
        );
        let mask_pipeline = create_pipeline(
            device,
            "retouch.mask.pipeline",
            &mask,
            "fs_mask",
            &source_pipeline_layout,
            TARGET_FORMAT,
        );
        let composite_offscreen_pipeline = create_pipeline(
            device,
            "retouch.composite.offscreen-pipeline",
            &composite,
            "fs_composite",
            &composite_pipeline_layout,
            TARGET_FORMAT,
        );
        let composite_display_pipeline = create_pipeline(
            device,
            "retouch.composite.display-pipeline",
            &composite,
            "fs_composite",
            &composite_pipeline_layout,
            display_format,
        );
        let preview_pipeline = create_pipeline(
            device,
            "retouch.preview.pipeline",
            &preview,
            "fs_preview",
            &preview_pipeline_layout,
            display_format,
        );

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("retouch.quad.vertex-buffer"),
            contents: bytemuck::cast_slice(&QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("retouch.quad.index-buffer"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        Self {
            transform_layout,
            source_layout,
            composite_layout,
            preview_layout,
            blur_pipeline,
            mask_pipeline,
            composite_offscreen_pipeline,
            composite_display_pipeline,
            preview_pipeline,
            vertex_buffer,
            index_buffer,
        }
    }

    pub(crate) fn blur_pipeline(&self) -> &wgpu::RenderPipeline {
        &self.blur_pipeline
    }

    pub(crate) fn mask_pipeline(&self) -> &wgpu::RenderPipeline {
        &self.mask_pipeline
    }

    pub(crate) fn composite_pipeline(&self, to_display: bool) -> &wgpu::RenderPipeline {
        if to_display {
            &self.composite_display_pipeline
        } else {
            &self.composite_offscreen_pipeline
        }
    }

    pub(crate) fn preview_pipeline(&self) -> &wgpu::RenderPipeline {
        &self.preview_pipeline
    }

    pub(crate) fn transform_bind_group(
        &self,
        device: &wgpu::Device,
        label: &str,
        uniforms: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.transform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: uniforms.as_entire_binding(),
            }],
        })
    }

    /// Bind group for the single-input stages (blur, mask).
    pub(crate) fn source_bind_group(
        &self,
        device: &wgpu::Device,
        label: &str,
        source: &wgpu::TextureView,
        sampler: &wgpu::Sampler,
        uniforms: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.source_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        })
    }

    pub(crate) fn composite_bind_group(
        &self,
        device: &wgpu::Device,
        original: &wgpu::TextureView,
        low_frequency: &wgpu::TextureView,
        mask: &wgpu::TextureView,
        sampler: &wgpu::Sampler,
        uniforms: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("retouch.composite.bind-group"),
            layout: &self.composite_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(original),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(low_frequency),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(mask),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        })
    }

    pub(crate) fn preview_bind_group(
        &self,
        device: &wgpu::Device,
        source: &wgpu::TextureView,
        sampler: &wgpu::Sampler,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("retouch.preview.bind-group"),
            layout: &self.preview_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(source),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }

    pub(crate) fn draw_quad(&self, pass: &mut wgpu::RenderPass<'_>) {
        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
        pass.draw_indexed(0..QUAD_INDICES.len() as u32, 0, 0..1);
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    fragment_entry: &str,
    layout: &wgpu::PipelineLayout,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: "vs_main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[quad_vertex_layout()],
        },
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: fragment_entry,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::REPLACE),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
