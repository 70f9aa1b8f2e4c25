use std::sync::mpsc::{channel, TryRecvError};
use std::time::Duration;

use tracing::instrument;

use crate::{align_to, RendererError};

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Tightly packed RGBA8 pixels, rows top-down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuFrame {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
}

impl CpuFrame {
    /// All-zero frame, returned when there is nothing to read back.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            pixels: vec![0; width as usize * height as usize * 4],
            width,
            height,
            bytes_per_row: width * 4,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.bytes_per_row as usize + x as usize * 4;
        let texel = self.pixels.get(offset..offset + 4)?;
        Some([texel[0], texel[1], texel[2], texel[3]])
    }

    pub fn into_rgba_image(self) -> Option<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.pixels)
    }
}

/// Mappable staging buffer sized for one copy region.
pub(crate) struct ReadbackBuffer {
    buffer: wgpu::Buffer,
    width: u32,
    height: u32,
    row_pitch: u32,
}

impl ReadbackBuffer {
    pub(crate) fn new(device: &wgpu::Device, label: &str, width: u32, height: u32) -> Self {
        let row_pitch = align_to(width * 4, COPY_ALIGNMENT);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: row_pitch as u64 * height.max(1) as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            width,
            height,
            row_pitch,
        }
    }

    /// Reuse `cache` when it already matches the size.
    pub(crate) fn ensure<'a>(
        cache: &'a mut Option<ReadbackBuffer>,
        device: &wgpu::Device,
        label: &str,
        width: u32,
        height: u32,
    ) -> &'a ReadbackBuffer {
        let recreate = !matches!(cache, Some(existing) if existing.width == width && existing.height == height);
        if recreate {
            *cache = Some(ReadbackBuffer::new(device, label, width, height));
        }
        cache.get_or_insert_with(|| ReadbackBuffer::new(device, label, width, height))
    }

    pub(crate) fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Record a copy of the `width` x `height` region at `origin` into this buffer.
    pub(crate) fn encode_copy(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        texture: &wgpu::Texture,
        origin: wgpu::Origin3d,
    ) {
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.row_pitch),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Block until the copied data is visible, then strip row padding.
    pub(crate) fn map_to_cpu(&self, device: &wgpu::Device) -> Result<CpuFrame, RendererError> {
        let slice = self.buffer.slice(..self.row_pitch as u64 * self.height as u64);
        let (tx, rx) = channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        loop {
            match rx.try_recv() {
                Ok(Ok(())) => break,
                Ok(Err(_)) => return Err(RendererError::BufferAsync),
                Err(TryRecvError::Empty) => {
                    device.poll(wgpu::Maintain::Poll);
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(RendererError::BufferAsync);
                }
            }
        }

        let mapped = slice.get_mapped_range();
        let row_stride = self.width as usize * 4;
        let mut pixels = vec![0u8; row_stride * self.height as usize];
        for (row, dst) in pixels.chunks_exact_mut(row_stride).enumerate() {
            let src_offset = row * self.row_pitch as usize;
            dst.copy_from_slice(&mapped[src_offset..src_offset + row_stride]);
        }
        drop(mapped);
        self.buffer.unmap();

        Ok(CpuFrame {
            pixels,
            width: self.width,
            height: self.height,
            bytes_per_row: self.width * 4,
        })
    }
}

/// One-off readback of a whole RGBA8 texture (e.g. a display target owned by the caller).
#[instrument(
    name = "retouch.read_texture",
    skip_all,
    fields(width = texture.width(), height = texture.height())
)]
pub fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
) -> Result<CpuFrame, RendererError> {
    let staging = ReadbackBuffer::new(
        device,
        "retouch.read-texture.staging",
        texture.width(),
        texture.height(),
    );
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("retouch.read-texture.encoder"),
    });
    staging.encode_copy(&mut encoder, texture, wgpu::Origin3d::ZERO);
    queue.submit(std::iter::once(encoder.finish()));
    staging.map_to_cpu(device)
}
