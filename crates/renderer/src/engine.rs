use std::sync::Arc;

use color::{Hsv, Rgb};
use glam::Mat4;
use tracing::{debug, info_span, instrument, warn};

use crate::params::{MaskPreviewSource, RetouchParameters};
use crate::readback::{CpuFrame, ReadbackBuffer};
use crate::stages::{
    BlurDirection, BlurUniforms, CompositeUniforms, MaskUniforms, ShaderStageSet,
    TransformUniforms,
};
use crate::targets::{RenderTarget, RenderTargetPool, Slot, TARGET_FORMAT};
use crate::viewport::export_transform;
use crate::{GpuContext, RendererError};

/// Fill colour outside the image quad.
pub const DEFAULT_BACKGROUND: [f32; 4] = [0.1, 0.1, 0.1, 1.0];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Format of the caller's display surface.
    pub display_format: wgpu::TextureFormat,
    pub background: [f32; 4],
    pub mask_preview: MaskPreviewSource,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_format: TARGET_FORMAT,
            background: DEFAULT_BACKGROUND,
            mask_preview: MaskPreviewSource::Hard,
        }
    }
}

/// Caller-owned render destination, e.g. the current swapchain image.
#[derive(Clone, Copy)]
pub struct DisplaySurface<'a> {
    pub view: &'a wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

/// One uniform buffer per pass so every write in a frame survives until submit.
struct PassUniforms {
    identity_transform: wgpu::Buffer,
    display_transform: wgpu::Buffer,
    preview_transform: wgpu::Buffer,
    mask: wgpu::Buffer,
    low_frequency_blur: [wgpu::Buffer; 2],
    mask_blur: [wgpu::Buffer; 2],
    composite: wgpu::Buffer,
}

impl PassUniforms {
    fn new(device: &wgpu::Device) -> Self {
        let buffer = |label: &str, size: usize| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let transform = std::mem::size_of::<TransformUniforms>();
        let blur = std::mem::size_of::<BlurUniforms>();

        Self {
            identity_transform: buffer("retouch.uniforms.identity-transform", transform),
            display_transform: buffer("retouch.uniforms.display-transform", transform),
            preview_transform: buffer("retouch.uniforms.preview-transform", transform),
            mask: buffer("retouch.uniforms.mask", std::mem::size_of::<MaskUniforms>()),
            low_frequency_blur: [
                buffer("retouch.uniforms.low-frequency-blur.h", blur),
                buffer("retouch.uniforms.low-frequency-blur.v", blur),
            ],
            mask_blur: [
                buffer("retouch.uniforms.mask-blur.h", blur),
                buffer("retouch.uniforms.mask-blur.v", blur),
            ],
            composite: buffer(
                "retouch.uniforms.composite",
                std::mem::size_of::<CompositeUniforms>(),
            ),
        }
    }
}

struct EngineResources {
    stages: ShaderStageSet,
    uniforms: PassUniforms,
    identity_bind_group: wgpu::BindGroup,
    display_bind_group: wgpu::BindGroup,
    preview_bind_group: wgpu::BindGroup,
}

/// Final destination of the composite pass.
enum CompositeTarget<'a> {
    Display(&'a wgpu::TextureView),
    Buffer,
}

/// Frequency-separation retouch pipeline over one device.
///
/// Every rendering call takes `&mut self`: the pool, pipelines and uniform
/// buffers belong to this engine alone and passes run in a fixed order.
pub struct RetouchEngine {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    config: EngineConfig,
    resources: Option<EngineResources>,
    pool: Option<RenderTargetPool>,
    readback: Option<ReadbackBuffer>,
    has_buffer_frame: bool,
}

impl RetouchEngine {
    /// Compile the shader stages. Fails on any shader or pipeline error.
    pub fn new(context: &GpuContext, config: EngineConfig) -> Result<Self, RendererError> {
        let device = Arc::clone(context.device());
        let queue = Arc::clone(context.queue());

        let stages = ShaderStageSet::new(&device, config.display_format)?;
        let uniforms = PassUniforms::new(&device);
        queue.write_buffer(
            &uniforms.identity_transform,
            0,
            bytemuck::bytes_of(&TransformUniforms::new(export_transform())),
        );
        let identity_bind_group = stages.transform_bind_group(
            &device,
            "retouch.identity-transform.bind-group",
            &uniforms.identity_transform,
        );
        let display_bind_group = stages.transform_bind_group(
            &device,
            "retouch.display-transform.bind-group",
            &uniforms.display_transform,
        );
        let preview_bind_group = stages.transform_bind_group(
            &device,
            "retouch.preview-transform.bind-group",
            &uniforms.preview_transform,
        );

        Ok(Self {
            device,
            queue,
            config,
            resources: Some(EngineResources {
                stages,
                uniforms,
                identity_bind_group,
                display_bind_group,
                preview_bind_group,
            }),
            pool: None,
            readback: None,
            has_buffer_frame: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Image size the pool is allocated for, if an image has been set.
    pub fn size(&self) -> Option<(u32, u32)> {
        self.pool
            .as_ref()
            .filter(|pool| !pool.is_released())
            .map(RenderTargetPool::size)
    }

    pub fn pool(&self) -> Option<&RenderTargetPool> {
        self.pool.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.resources.is_none()
    }

    /// Size the pool to `image` and upload it as the original texture.
    #[instrument(
        name = "retouch.set_image",
        skip_all,
        fields(width = image.width(), height = image.height())
    )]
    pub fn set_image(&mut self, image: &image::RgbaImage) -> Result<(), RendererError> {
        if self.resources.is_none() {
            warn!("set_image called on a disposed engine; ignoring");
            return Ok(());
        }
        let (width, height) = image.dimensions();

        let resized = match self.pool.as_mut() {
            Some(pool) => pool.resize(&self.device, width, height)?,
            None => {
                self.pool = Some(RenderTargetPool::allocate(
                    &self.device,
                    width,
                    height,
                    &Slot::ALL,
                )?);
                true
            }
        };
        if resized {
            self.has_buffer_frame = false;
        }

        let Some(original) = self.pool.as_ref().and_then(RenderTargetPool::original) else {
            return Ok(());
        };
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &original.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            image.as_raw(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    /// Run the pass sequence and composite into `surface` through `params.transform`.
    #[instrument(
        name = "retouch.render_to_display",
        skip_all,
        fields(width = surface.width, height = surface.height, view_mode = ?params.view_mode)
    )]
    pub fn render_to_display(
        &mut self,
        params: &RetouchParameters,
        surface: &DisplaySurface<'_>,
    ) -> Result<(), RendererError> {
        if !self.ready("render_to_display") {
            return Ok(());
        }
        self.render(params, CompositeTarget::Display(surface.view));
        Ok(())
    }

    /// Run the pass sequence at native resolution into the export target.
    ///
    /// Returns the target holding the frame; [`Self::read_pixels`] reads it back.
    #[instrument(
        name = "retouch.render_to_buffer",
        skip_all,
        fields(view_mode = ?params.view_mode)
    )]
    pub fn render_to_buffer(
        &mut self,
        params: &RetouchParameters,
    ) -> Result<Option<&RenderTarget>, RendererError> {
        if !self.ready("render_to_buffer") {
            return Ok(None);
        }
        self.render(params, CompositeTarget::Buffer);
        self.has_buffer_frame = true;
        Ok(self.pool.as_ref().and_then(|pool| pool.target(Slot::Scratch)))
    }

    /// RGBA8 pixels of the last [`Self::render_to_buffer`] frame, rows top-down.
    #[instrument(name = "retouch.read_pixels", skip_all)]
    pub fn read_pixels(&mut self) -> Result<CpuFrame, RendererError> {
        match (&self.readback, self.has_buffer_frame) {
            (Some(readback), true) => readback.map_to_cpu(&self.device),
            _ => {
                warn!("read_pixels called before render_to_buffer; returning a blank frame");
                let (width, height) = self.size().unwrap_or((0, 0));
                Ok(CpuFrame::blank(width, height))
            }
        }
    }

    /// Normalized RGB of one texel of the unprocessed image.
    ///
    /// Coordinates are image pixels, top-left origin. Out-of-range coordinates
    /// and calls before [`Self::set_image`] yield black.
    pub fn sample_pixel(&mut self, x: u32, y: u32) -> Result<Rgb, RendererError> {
        let Some(pool) = self.pool.as_ref().filter(|pool| !pool.is_released()) else {
            warn!(x, y, "sample_pixel called without an image; returning black");
            return Ok(Rgb::BLACK);
        };
        let (width, height) = pool.size();
        if x >= width || y >= height {
            debug!(x, y, width, height, "sample_pixel out of bounds");
            return Ok(Rgb::BLACK);
        }
        let Some(original) = pool.original_texture() else {
            return Ok(Rgb::BLACK);
        };

        let staging = ReadbackBuffer::new(&self.device, "retouch.sample.staging", 1, 1);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("retouch.sample.encoder"),
            });
        staging.encode_copy(&mut encoder, original, wgpu::Origin3d { x, y, z: 0 });
        self.queue.submit(std::iter::once(encoder.finish()));

        let frame = staging.map_to_cpu(&self.device)?;
        let [r, g, b, _] = frame.pixel(0, 0).unwrap_or_default();
        Ok(Rgb::from_rgb8(r, g, b))
    }

    /// [`Self::sample_pixel`] converted to a tone ready for `ToneSamples::push`.
    pub fn sample_tone(&mut self, x: u32, y: u32) -> Result<Hsv, RendererError> {
        Ok(self.sample_pixel(x, y)?.to_hsv())
    }

    /// Blit the configured mask slot into the rectangle `(x, y, width, height)`
    /// of `surface`, clipped to the surface. Draws over existing content.
    #[instrument(
        name = "retouch.draw_mask_preview",
        skip_all,
        fields(x = x, y = y, width = width, height = height)
    )]
    pub fn draw_mask_preview(
        &mut self,
        surface: &DisplaySurface<'_>,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<(), RendererError> {
        if !self.ready("draw_mask_preview") {
            return Ok(());
        }
        let Some(visible) = clip_rect(x, y, width, height, surface.width, surface.height) else {
            debug!("mask preview rectangle is outside the display surface");
            return Ok(());
        };
        let (Some(resources), Some(pool)) = (self.resources.as_ref(), self.pool.as_ref()) else {
            return Ok(());
        };

        let slot = match self.config.mask_preview {
            MaskPreviewSource::Hard => Slot::HardMask,
            MaskPreviewSource::Soft => Slot::SoftMask,
        };
        let Some(source) = pool.target(slot) else {
            return Ok(());
        };

        let transform = preview_transform(x, y, width, height, visible);
        self.queue.write_buffer(
            &resources.uniforms.preview_transform,
            0,
            bytemuck::bytes_of(&TransformUniforms::new(transform)),
        );
        let bind_group =
            resources
                .stages
                .preview_bind_group(&self.device, source.view(), pool.sampler());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("retouch.mask-preview.encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("retouch.mask-preview.pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: surface.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            let (vx, vy, vw, vh) = visible;
            pass.set_viewport(vx as f32, vy as f32, vw as f32, vh as f32, 0.0, 1.0);
            pass.set_scissor_rect(vx, vy, vw, vh);
            pass.set_pipeline(resources.stages.preview_pipeline());
            pass.set_bind_group(0, &resources.preview_bind_group, &[]);
            pass.set_bind_group(1, &bind_group, &[]);
            resources.stages.draw_quad(&mut pass);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    /// Release every GPU resource. Later calls are logged no-ops.
    pub fn dispose(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.release();
        }
        self.pool = None;
        self.readback = None;
        self.has_buffer_frame = false;
        if self.resources.take().is_some() {
            debug!("disposed retouch engine");
        }
    }

    fn ready(&self, operation: &'static str) -> bool {
        if self.resources.is_none() {
            warn!(operation, "engine has been disposed; ignoring");
            return false;
        }
        if self.size().is_none() {
            warn!(operation, "no image set; ignoring");
            return false;
        }
        true
    }

    /// Encode and submit the four passes. Callers have checked [`Self::ready`].
    fn render(&mut self, params: &RetouchParameters, target: CompositeTarget<'_>) {
        let (Some(resources), Some(pool)) = (self.resources.as_ref(), self.pool.as_ref()) else {
            return;
        };
        let (
            Some(original),
            Some(scratch),
            Some(low_frequency),
            Some(mask_scratch),
            Some(soft_mask),
            Some(hard_mask),
        ) = (
            pool.original(),
            pool.target(Slot::Scratch),
            pool.target(Slot::LowFrequency),
            pool.target(Slot::MaskScratch),
            pool.target(Slot::SoftMask),
            pool.target(Slot::HardMask),
        )
        else {
            warn!("render target pool is incomplete; skipping frame");
            return;
        };

        let params = params.sanitized();
        let (width, height) = pool.size();
        let span = info_span!(
            "retouch.passes",
            width,
            height,
            tones = params.skin_tones.len(),
            smoothness = params.smoothness
        );
        let _guard = span.enter();

        let uniforms = &resources.uniforms;
        let to_display = matches!(target, CompositeTarget::Display(_));
        if let CompositeTarget::Display(_) = target {
            self.write_uniform(
                &uniforms.display_transform,
                &TransformUniforms::new(params.transform),
            );
        }
        self.write_uniform(
            &uniforms.mask,
            &MaskUniforms::new(&params.skin_tones, params.color_tolerance),
        );
        for (buffer, direction) in uniforms
            .low_frequency_blur
            .iter()
            .zip([BlurDirection::Horizontal, BlurDirection::Vertical])
        {
            self.write_uniform(
                buffer,
                &BlurUniforms::new(direction, width, height, params.smoothness),
            );
        }
        for (buffer, direction) in uniforms
            .mask_blur
            .iter()
            .zip([BlurDirection::Horizontal, BlurDirection::Vertical])
        {
            self.write_uniform(
                buffer,
                &BlurUniforms::new(direction, width, height, params.mask_blur_radius),
            );
        }
        self.write_uniform(
            &uniforms.composite,
            &CompositeUniforms {
                background: self.config.background,
                detail_amount: params.detail_amount,
                mask_expansion: params.mask_expansion,
                view_mode: params.view_mode.shader_index(),
                _padding: 0,
            },
        );

        let stages = &resources.stages;
        let sampler = pool.sampler();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("retouch.frame.encoder"),
            });

        // Mask, low-frequency and mask-softening passes: native size, identity transform.
        let single_input_passes = [
            (
                "retouch.pass.mask",
                stages.mask_pipeline(),
                &original.view,
                &uniforms.mask,
                hard_mask,
            ),
            (
                "retouch.pass.low-frequency.h",
                stages.blur_pipeline(),
                &original.view,
                &uniforms.low_frequency_blur[0],
                scratch,
            ),
            (
                "retouch.pass.low-frequency.v",
                stages.blur_pipeline(),
                scratch.view(),
                &uniforms.low_frequency_blur[1],
                low_frequency,
            ),
            (
                "retouch.pass.mask-blur.h",
                stages.blur_pipeline(),
                hard_mask.view(),
                &uniforms.mask_blur[0],
                mask_scratch,
            ),
            (
                "retouch.pass.mask-blur.v",
                stages.blur_pipeline(),
                mask_scratch.view(),
                &uniforms.mask_blur[1],
                soft_mask,
            ),
        ];
        for (label, pipeline, source, pass_uniforms, destination) in single_input_passes {
            let bind_group =
                stages.source_bind_group(&self.device, label, source, sampler, pass_uniforms);
            let mut pass = begin_pass(
                &mut encoder,
                label,
                destination.view(),
                wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
            );
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &resources.identity_bind_group, &[]);
            pass.set_bind_group(1, &bind_group, &[]);
            stages.draw_quad(&mut pass);
        }

        let composite_bind_group = stages.composite_bind_group(
            &self.device,
            &original.view,
            low_frequency.view(),
            soft_mask.view(),
            sampler,
            &uniforms.composite,
        );
        let (composite_view, transform_bind_group) = match target {
            CompositeTarget::Display(view) => (view, &resources.display_bind_group),
            CompositeTarget::Buffer => (scratch.view(), &resources.identity_bind_group),
        };
        let [r, g, b, a] = self.config.background.map(f64::from);
        {
            let mut pass = begin_pass(
                &mut encoder,
                "retouch.pass.composite",
                composite_view,
                wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
            );
            pass.set_pipeline(stages.composite_pipeline(to_display));
            pass.set_bind_group(0, transform_bind_group, &[]);
            pass.set_bind_group(1, &composite_bind_group, &[]);
            stages.draw_quad(&mut pass);
        }

        if !to_display {
            let readback = ReadbackBuffer::ensure(
                &mut self.readback,
                &self.device,
                "retouch.readback.staging",
                width,
                height,
            );
            debug_assert_eq!(readback.size(), (width, height));
            readback.encode_copy(&mut encoder, scratch.texture(), wgpu::Origin3d::ZERO);
        }

        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn write_uniform<T: bytemuck::Pod>(&self, buffer: &wgpu::Buffer, value: &T) {
        self.queue.write_buffer(buffer, 0, bytemuck::bytes_of(value));
    }
}

fn begin_pass<'e>(
    encoder: &'e mut wgpu::CommandEncoder,
    label: &str,
    view: &wgpu::TextureView,
    load: wgpu::LoadOp<wgpu::Color>,
) -> wgpu::RenderPass<'e> {
    encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view,
            resolve_target: None,
            ops: wgpu::Operations {
                load,
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    })
}

/// Intersection of a signed rectangle with the surface, as `(x, y, w, h)`.
fn clip_rect(
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    surface_width: u32,
    surface_height: u32,
) -> Option<(u32, u32, u32, u32)> {
    let left = i64::from(x).max(0);
    let top = i64::from(y).max(0);
    let right = (i64::from(x) + i64::from(width)).min(i64::from(surface_width));
    let bottom = (i64::from(y) + i64::from(height)).min(i64::from(surface_height));
    if right <= left || bottom <= top {
        return None;
    }
    Some((
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

/// Transform that maps the quad onto the full requested rectangle while the
/// viewport only covers its visible part.
fn preview_transform(
    x: i32,
    y: i32,
    width: u32,
    height: u32,
    visible: (u32, u32, u32, u32),
) -> Mat4 {
    let (vx, vy, vw, vh) = visible;
    let (vw, vh) = (vw as f32, vh as f32);
    let rect_centre_x = x as f32 + width as f32 / 2.0;
    let rect_centre_y = y as f32 + height as f32 / 2.0;
    let view_centre_x = vx as f32 + vw / 2.0;
    let view_centre_y = vy as f32 + vh / 2.0;

    Mat4::from_cols_array(&[
        width as f32 / vw,
        0.0,
        0.0,
        0.0,
        0.0,
        height as f32 / vh,
        0.0,
        0.0,
        0.0,
        0.0,
        1.0,
        0.0,
        (rect_centre_x - view_centre_x) / (vw / 2.0),
        -(rect_centre_y - view_centre_y) / (vh / 2.0),
        0.0,
        1.0,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn clip_rect_handles_partial_and_outside() {
        assert_eq!(clip_rect(10, 10, 20, 20, 100, 100), Some((10, 10, 20, 20)));
        assert_eq!(clip_rect(-5, 90, 20, 20, 100, 100), Some((0, 90, 15, 10)));
        assert_eq!(clip_rect(100, 0, 20, 20, 100, 100), None);
        assert_eq!(clip_rect(-20, 0, 20, 20, 100, 100), None);
        assert_eq!(clip_rect(0, 0, 0, 20, 100, 100), None);
    }

    #[test]
    fn unclipped_preview_is_identity() {
        let m = preview_transform(10, 20, 30, 40, (10, 20, 30, 40));
        assert!(m.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn clipped_preview_keeps_rect_corners() {
        // Rectangle hangs off the left and top edges of the surface.
        let (x, y, w, h) = (-10, -20, 40, 60);
        let visible = clip_rect(x, y, w, h, 200, 200).unwrap();
        let (vx, vy, vw, vh) = visible;
        let m = preview_transform(x, y, w, h, visible);

        // Map quad corners through the transform and the viewport to pixels.
        let to_pixels = |qx: f32, qy: f32| {
            let clip = m * Vec4::new(qx, qy, 0.0, 1.0);
            (
                vx as f32 + (clip.x + 1.0) / 2.0 * vw as f32,
                vy as f32 + (1.0 - clip.y) / 2.0 * vh as f32,
            )
        };
        let (left, top) = to_pixels(-1.0, 1.0);
        let (right, bottom) = to_pixels(1.0, -1.0);
        assert!((left - x as f32).abs() < 1e-4);
        assert!((top - y as f32).abs() < 1e-4);
        assert!((right - (x as f32 + w as f32)).abs() < 1e-4);
        assert!((bottom - (y as f32 + h as f32)).abs() < 1e-4);
    }
}
