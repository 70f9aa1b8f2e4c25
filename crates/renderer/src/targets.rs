use pollster::FutureExt;
use tracing::debug;

use crate::RendererError;

/// Storage format of every intermediate target and of the original texture.
pub const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const TARGET_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::RENDER_ATTACHMENT
    .union(wgpu::TextureUsages::TEXTURE_BINDING)
    .union(wgpu::TextureUsages::COPY_SRC);

const ORIGINAL_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::COPY_DST)
    .union(wgpu::TextureUsages::COPY_SRC);

/// Named pool slots. Each pass reads and writes slots by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Horizontal blur intermediate of the low-frequency pass, reused as the
    /// export target once the frame has consumed it.
    Scratch,
    LowFrequency,
    /// Horizontal blur intermediate of the mask softening pass.
    MaskScratch,
    SoftMask,
    /// Classifier output; also the default mask preview source.
    HardMask,
}

impl Slot {
    pub const ALL: [Slot; 5] = [
        Slot::Scratch,
        Slot::LowFrequency,
        Slot::MaskScratch,
        Slot::SoftMask,
        Slot::HardMask,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Slot::Scratch => "retouch.target.scratch",
            Slot::LowFrequency => "retouch.target.low-frequency",
            Slot::MaskScratch => "retouch.target.mask-scratch",
            Slot::SoftMask => "retouch.target.soft-mask",
            Slot::HardMask => "retouch.target.hard-mask",
        }
    }
}

/// A texture together with the view that binds it as color attachment 0.
pub struct RenderTarget {
    slot: Slot,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl RenderTarget {
    fn create(device: &wgpu::Device, slot: Slot, width: u32, height: u32) -> Self {
        let (texture, view) = target_storage(device, slot, width, height);
        Self {
            slot,
            texture,
            view,
        }
    }

    /// Swap in new backing storage; the target itself stays in its slot.
    fn replace_storage(&mut self, texture: wgpu::Texture, view: wgpu::TextureView) {
        self.view = view;
        let old = std::mem::replace(&mut self.texture, texture);
        old.destroy();
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn size(&self) -> (u32, u32) {
        (self.texture.width(), self.texture.height())
    }
}

/// Source image texture. Sampled by the passes, never rendered into.
pub(crate) struct OriginalTexture {
    pub(crate) texture: wgpu::Texture,
    pub(crate) view: wgpu::TextureView,
}

impl OriginalTexture {
    fn create(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = create_texture(device, "retouch.original", width, height, ORIGINAL_USAGE);
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

/// Replacement storage for a resize, built before any slot is touched.
struct StagedStorage {
    targets: Vec<(wgpu::Texture, wgpu::TextureView)>,
    original: OriginalTexture,
}

/// Fixed set of image-sized render targets plus the original texture.
pub struct RenderTargetPool {
    targets: Vec<RenderTarget>,
    original: Option<OriginalTexture>,
    sampler: wgpu::Sampler,
    width: u32,
    height: u32,
    generation: u64,
}

impl RenderTargetPool {
    /// Create one target per slot at `width` x `height`.
    pub fn allocate(
        device: &wgpu::Device,
        width: u32,
        height: u32,
        slots: &[Slot],
    ) -> Result<Self, RendererError> {
        check_dimensions(device, width, height)?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("retouch.pool.sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let (targets, original) = with_allocation_scope(device, || {
            let targets = slots
                .iter()
                .map(|&slot| RenderTarget::create(device, slot, width, height))
                .collect::<Vec<_>>();
            (targets, OriginalTexture::create(device, width, height))
        })?;

        debug!(width, height, count = targets.len(), "allocated render target pool");

        Ok(Self {
            targets,
            original: Some(original),
            sampler,
            width,
            height,
            generation: 1,
        })
    }

    /// Reallocate every texture at the new size. Returns `false` without
    /// touching the GPU when the size is unchanged.
    pub fn resize(
        &mut self,
        device: &wgpu::Device,
        width: u32,
        height: u32,
    ) -> Result<bool, RendererError> {
        if width == self.width && height == self.height && self.original.is_some() {
            return Ok(false);
        }
        check_dimensions(device, width, height)?;

        // On failure the staged textures are dropped and the pool keeps its old storage.
        let staged = with_allocation_scope(device, || self.stage(device, width, height))?;
        self.commit(staged, width, height);
        Ok(true)
    }

    fn stage(&self, device: &wgpu::Device, width: u32, height: u32) -> StagedStorage {
        StagedStorage {
            targets: self
                .targets
                .iter()
                .map(|target| target_storage(device, target.slot, width, height))
                .collect(),
            original: OriginalTexture::create(device, width, height),
        }
    }

    fn commit(&mut self, staged: StagedStorage, width: u32, height: u32) {
        for (target, (texture, view)) in self.targets.iter_mut().zip(staged.targets) {
            target.replace_storage(texture, view);
        }
        if let Some(old) = self.original.replace(staged.original) {
            old.texture.destroy();
        }

        debug!(
            from_width = self.width,
            from_height = self.height,
            width,
            height,
            "resized render target pool"
        );

        self.width = width;
        self.height = height;
        self.generation += 1;
    }

    /// Destroy every owned texture. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.targets.is_empty() && self.original.is_none() {
            return;
        }
        for target in self.targets.drain(..) {
            target.texture.destroy();
        }
        if let Some(original) = self.original.take() {
            original.texture.destroy();
        }
        debug!("released render target pool");
    }

    pub fn is_released(&self) -> bool {
        self.original.is_none()
    }

    pub fn target(&self, slot: Slot) -> Option<&RenderTarget> {
        self.targets.iter().find(|target| target.slot == slot)
    }

    pub(crate) fn original(&self) -> Option<&OriginalTexture> {
        self.original.as_ref()
    }

    pub fn original_texture(&self) -> Option<&wgpu::Texture> {
        self.original.as_ref().map(|original| &original.texture)
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Bumped every time backing storage is (re)created.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn check_dimensions(device: &wgpu::Device, width: u32, height: u32) -> Result<(), RendererError> {
    if width == 0 || height == 0 {
        return Err(RendererError::InvalidDimensions(format!(
            "render targets must be non-empty, got {width}x{height}"
        )));
    }
    let max = device.limits().max_texture_dimension_2d;
    if width > max || height > max {
        return Err(RendererError::TargetAllocation(format!(
            "{width}x{height} exceeds the device limit of {max} texels per side"
        )));
    }
    Ok(())
}

fn with_allocation_scope<T>(
    device: &wgpu::Device,
    allocate: impl FnOnce() -> T,
) -> Result<T, RendererError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let value = allocate();
    match device.pop_error_scope().block_on() {
        Some(error) => Err(RendererError::TargetAllocation(error.to_string())),
        None => Ok(value),
    }
}

fn target_storage(
    device: &wgpu::Device,
    slot: Slot,
    width: u32,
    height: u32,
) -> (wgpu::Texture, wgpu::TextureView) {
    let texture = create_texture(device, slot.label(), width, height, TARGET_USAGE);
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    (texture, view)
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TARGET_FORMAT,
        usage,
        view_formats: &[],
    })
}
