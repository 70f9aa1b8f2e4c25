use std::path::{Path, PathBuf};

use color::ToneSamples;
use glam::Mat4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("Failed to access preset {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid preset: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which layer the composite pass shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewMode {
    #[default]
    Final,
    HighFrequency,
    LowFrequency,
}

impl ViewMode {
    pub(crate) fn shader_index(self) -> u32 {
        match self {
            ViewMode::Final => 0,
            ViewMode::HighFrequency => 1,
            ViewMode::LowFrequency => 2,
        }
    }
}

/// Mask slot blitted by the on-canvas mask preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskPreviewSource {
    /// Binary classifier output, before softening.
    #[default]
    Hard,
    /// Mask after the softening blur.
    Soft,
}

/// Per-frame retouch settings. Owned by the caller and only read by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetouchParameters {
    /// Gaussian sigma of the low-frequency layer, in texels.
    pub smoothness: f32,
    /// Hue distance threshold; saturation gets 1.5x this band.
    pub color_tolerance: f32,
    /// Gaussian sigma used to soften the hard mask.
    pub mask_blur_radius: f32,
    /// Share of high-frequency detail kept under the mask.
    pub detail_amount: f32,
    /// Half-width of the smoothstep band around the 0.5 mask threshold.
    pub mask_expansion: f32,
    pub skin_tones: ToneSamples,
    pub view_mode: ViewMode,
    /// Pan/zoom/aspect matrix for the display pass. Never serialized.
    #[serde(skip)]
    pub transform: Mat4,
}

impl Default for RetouchParameters {
    fn default() -> Self {
        Self {
            smoothness: 5.0,
            color_tolerance: 0.1,
            mask_blur_radius: 4.0,
            detail_amount: 0.3,
            mask_expansion: 0.1,
            skin_tones: ToneSamples::new(),
            view_mode: ViewMode::Final,
            transform: Mat4::IDENTITY,
        }
    }
}

impl RetouchParameters {
    pub const MAX_SIGMA: f32 = 50.0;
    pub const MAX_MASK_EXPANSION: f32 = 0.5;

    /// Copy configured for export: final view, identity transform.
    pub fn for_export(&self) -> Self {
        Self {
            view_mode: ViewMode::Final,
            transform: Mat4::IDENTITY,
            ..self.clone()
        }
    }

    /// Copy with every scalar clamped into its legal range. Non-finite values
    /// fall back to the defaults.
    pub fn sanitized(&self) -> Self {
        let defaults = Self::default();
        let clamp = |value: f32, fallback: f32, min: f32, max: f32| {
            if value.is_finite() {
                value.clamp(min, max)
            } else {
                fallback
            }
        };

        Self {
            smoothness: clamp(self.smoothness, defaults.smoothness, 0.0, Self::MAX_SIGMA),
            color_tolerance: clamp(self.color_tolerance, defaults.color_tolerance, 0.0, 1.0),
            mask_blur_radius: clamp(
                self.mask_blur_radius,
                defaults.mask_blur_radius,
                0.0,
                Self::MAX_SIGMA,
            ),
            detail_amount: clamp(self.detail_amount, defaults.detail_amount, 0.0, 1.0),
            mask_expansion: clamp(
                self.mask_expansion,
                defaults.mask_expansion,
                0.0,
                Self::MAX_MASK_EXPANSION,
            ),
            skin_tones: self.skin_tones.clone(),
            view_mode: self.view_mode,
            transform: if self.transform.is_finite() {
                self.transform
            } else {
                Mat4::IDENTITY
            },
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ParamsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, ParamsError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ParamsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ParamsError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json_pretty()?).map_err(|source| ParamsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
