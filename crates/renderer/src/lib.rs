use bytemuck::{Pod, Zeroable};
use thiserror::Error;

mod context;
mod engine;
mod params;
mod readback;
mod stages;
mod targets;
mod viewport;

pub use context::{ContextOptions, GpuContext};
pub use engine::{DisplaySurface, EngineConfig, RetouchEngine, DEFAULT_BACKGROUND};
pub use params::{MaskPreviewSource, ParamsError, RetouchParameters, ViewMode};
pub use readback::{read_texture, CpuFrame};
pub use stages::{
    gaussian_weights, kernel_radius, BlurDirection, BlurUniforms, CompositeUniforms, MaskUniforms,
    ShaderStageSet, TransformUniforms, MAX_KERNEL_RADIUS, MIN_BLUR_SIGMA,
};
pub use targets::{RenderTarget, RenderTargetPool, Slot, TARGET_FORMAT};
pub use viewport::{export_transform, ViewportState, ViewportTransform, MAX_ZOOM, MIN_ZOOM, ZOOM_STEP};

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("WGPU error: {0}")]
    Wgpu(#[from] wgpu::Error),
    #[error("No suitable GPU adapter found")]
    NoAdapter,
    #[error("Request device error: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error("Buffer async error")]
    BufferAsync,
    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),
    #[error("Render target allocation failed: {0}")]
    TargetAllocation(String),
    #[error("Shader compilation error: {0}")]
    ShaderCompilation(String),
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    tex_coords: [f32; 2],
}

// Texture v grows downwards so row 0 of an uploaded image lands at the top of
// the quad, matching wgpu's top-left framebuffer origin.
const QUAD_VERTICES: [Vertex; 4] = [
    Vertex {
        position: [-1.0, -1.0],
        tex_coords: [0.0, 1.0],
    },
    Vertex {
        position: [1.0, -1.0],
        tex_coords: [1.0, 1.0],
    },
    Vertex {
        position: [1.0, 1.0],
        tex_coords: [1.0, 0.0],
    },
    Vertex {
        position: [-1.0, 1.0],
        tex_coords: [0.0, 0.0],
    },
];

const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

const QUAD_VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] = [
    wgpu::VertexAttribute {
        offset: 0,
        shader_location: 0,
        format: wgpu::VertexFormat::Float32x2,
    },
    wgpu::VertexAttribute {
        offset: std::mem::size_of::<[f32; 2]>() as u64,
        shader_location: 1,
        format: wgpu::VertexFormat::Float32x2,
    },
];

fn quad_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &QUAD_VERTEX_ATTRIBUTES,
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    if value == 0 {
        return alignment;
    }
    ((value + alignment - 1) / alignment) * alignment
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use pollster::FutureExt;

    use crate::GpuContext;

    /// Headless device for GPU tests, or `None` when the machine has no adapter.
    pub fn init_context(test: &str) -> Option<GpuContext> {
        let instance = wgpu::Instance::default();
        let Some(adapter) = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .block_on()
        else {
            eprintln!("skipping {test}: no GPU adapter available");
            return None;
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("retouch.test-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .block_on()
            .expect("device");

        Some(GpuContext::from_device(Arc::new(device), Arc::new(queue)))
    }
}
