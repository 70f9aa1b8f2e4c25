//! Pan/zoom state and the display transform derived from it.
//!
//! Pointer coordinates are display pixels with a top-left origin. Clip space
//! has Y up, so Y is negated on the way in and out.

use glam::{Mat4, Vec2, Vec4};
use serde::{Deserialize, Serialize};

pub const MIN_ZOOM: f32 = 0.02;
pub const MAX_ZOOM: f32 = 50.0;
/// Zoom factor applied per wheel notch.
pub const ZOOM_STEP: f32 = 1.1;

/// Caller-owned pan/zoom state. Pan is in display pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportState {
    pub zoom: f32,
    pub pan_x: f32,
    pub pan_y: f32,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
        }
    }
}

impl ViewportState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn pan_by(&mut self, dx: f32, dy: f32) {
        self.pan_x += dx;
        self.pan_y += dy;
    }

    pub fn set_zoom(&mut self, zoom: f32) {
        self.zoom = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
    }

    /// Zoom by `steps` notches (positive zooms in) so that the image point
    /// under `pointer` stays under it.
    pub fn zoom_at(&mut self, display: (u32, u32), pointer: (f32, f32), steps: f32) {
        let old = self.zoom;
        let new = (old * ZOOM_STEP.powf(steps)).clamp(MIN_ZOOM, MAX_ZOOM);
        if new == old {
            return;
        }

        let cx = pointer.0 - display.0 as f32 / 2.0;
        let cy = pointer.1 - display.1 as f32 / 2.0;
        let ratio = new / old;
        self.pan_x = cx - (cx - self.pan_x) * ratio;
        self.pan_y = cy - (cy - self.pan_y) * ratio;
        self.zoom = new;
    }
}

/// Forward display transform plus the pieces needed to invert it exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportTransform {
    pub display_size: (u32, u32),
    pub image_size: (u32, u32),
    pub aspect_x: f32,
    pub aspect_y: f32,
    pub scale_x: f32,
    pub scale_y: f32,
    pub translate_x: f32,
    pub translate_y: f32,
}

impl ViewportTransform {
    pub fn new(display_size: (u32, u32), image_size: (u32, u32), state: &ViewportState) -> Self {
        let (aspect_x, aspect_y) = aspect_correction(display_size, image_size);
        let half_w = display_size.0.max(1) as f32 / 2.0;
        let half_h = display_size.1.max(1) as f32 / 2.0;

        Self {
            display_size,
            image_size,
            aspect_x,
            aspect_y,
            scale_x: state.zoom * aspect_x,
            scale_y: state.zoom * aspect_y,
            translate_x: state.pan_x / half_w,
            translate_y: -state.pan_y / half_h,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_cols(
            Vec4::new(self.scale_x, 0.0, 0.0, 0.0),
            Vec4::new(0.0, self.scale_y, 0.0, 0.0),
            Vec4::new(0.0, 0.0, 1.0, 0.0),
            Vec4::new(self.translate_x, self.translate_y, 0.0, 1.0),
        )
    }

    pub fn pointer_to_clip(&self, px: f32, py: f32) -> Vec2 {
        let (w, h) = self.display_size;
        Vec2::new(
            px / w.max(1) as f32 * 2.0 - 1.0,
            1.0 - py / h.max(1) as f32 * 2.0,
        )
    }

    /// Texture coordinates under the pointer, v measured from the top row.
    pub fn pointer_to_uv(&self, px: f32, py: f32) -> Vec2 {
        let clip = self.pointer_to_clip(px, py);
        let quad_x = (clip.x - self.translate_x) / self.scale_x;
        let quad_y = (clip.y - self.translate_y) / self.scale_y;
        Vec2::new((quad_x + 1.0) / 2.0, (1.0 - quad_y) / 2.0)
    }

    /// Image texel under the pointer, or `None` when the pointer is off the image.
    pub fn pointer_to_texel(&self, px: f32, py: f32) -> Option<(u32, u32)> {
        let uv = self.pointer_to_uv(px, py);
        if !(0.0..1.0).contains(&uv.x) || !(0.0..1.0).contains(&uv.y) {
            return None;
        }
        let (w, h) = self.image_size;
        if w == 0 || h == 0 {
            return None;
        }
        let x = ((uv.x * w as f32).floor() as u32).min(w - 1);
        let y = ((uv.y * h as f32).floor() as u32).min(h - 1);
        Some((x, y))
    }

    /// Display position of a texel centre; inverse of [`Self::pointer_to_texel`].
    pub fn texel_center_to_pointer(&self, x: u32, y: u32) -> Vec2 {
        let (w, h) = self.image_size;
        let u = (x as f32 + 0.5) / w.max(1) as f32;
        let v = (y as f32 + 0.5) / h.max(1) as f32;
        let clip_x = (u * 2.0 - 1.0) * self.scale_x + self.translate_x;
        let clip_y = (1.0 - v * 2.0) * self.scale_y + self.translate_y;
        let (dw, dh) = self.display_size;
        Vec2::new(
            (clip_x + 1.0) / 2.0 * dw as f32,
            (1.0 - clip_y) / 2.0 * dh as f32,
        )
    }
}

/// Transform for native-resolution export renders.
///
/// wgpu's framebuffer origin and copy origin are both top-left, so the quad's
/// texture orientation already yields top-down rows and no mirror is needed.
pub fn export_transform() -> Mat4 {
    Mat4::IDENTITY
}

fn aspect_correction(display: (u32, u32), image: (u32, u32)) -> (f32, f32) {
    if display.0 == 0 || display.1 == 0 || image.0 == 0 || image.1 == 0 {
        return (1.0, 1.0);
    }
    let display_aspect = display.0 as f32 / display.1 as f32;
    let image_aspect = image.0 as f32 / image.1 as f32;
    if display_aspect > image_aspect {
        (image_aspect / display_aspect, 1.0)
    } else {
        (1.0, display_aspect / image_aspect)
    }
}
