use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{hue_distance, Hsv, Rgb};

/// Upper bound on stored skin-tone samples; also the mask shader's array length.
pub const MAX_SKIN_TONES: usize = 10;

/// Saturation tolerance relative to the hue tolerance.
pub const SATURATION_TOLERANCE_SCALE: f32 = 1.5;

/// Bounded FIFO of sampled skin tones. Pushing past capacity evicts the oldest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Hsv>", into = "Vec<Hsv>")]
pub struct ToneSamples {
    samples: VecDeque<Hsv>,
}

impl ToneSamples {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(MAX_SKIN_TONES),
        }
    }

    /// Append a sample, returning the evicted one when the buffer was full.
    pub fn push(&mut self, tone: Hsv) -> Option<Hsv> {
        let evicted = if self.samples.len() == MAX_SKIN_TONES {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(tone);
        evicted
    }

    pub fn push_rgb(&mut self, rgb: Rgb) -> Option<Hsv> {
        self.push(rgb.to_hsv())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Hsv> {
        self.samples.get(index).copied()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Hsv> + '_ {
        self.samples.iter()
    }
}

impl From<Vec<Hsv>> for ToneSamples {
    fn from(tones: Vec<Hsv>) -> Self {
        let mut samples = ToneSamples::new();
        for tone in tones {
            samples.push(tone);
        }
        samples
    }
}

impl From<ToneSamples> for Vec<Hsv> {
    fn from(tones: ToneSamples) -> Self {
        tones.samples.into()
    }
}

impl FromIterator<Hsv> for ToneSamples {
    fn from_iter<T: IntoIterator<Item = Hsv>>(iter: T) -> Self {
        let mut samples = ToneSamples::new();
        for tone in iter {
            samples.push(tone);
        }
        samples
    }
}

/// Whether `pixel` is within `tolerance` of `tone`.
///
/// Hue uses circular distance; saturation is allowed a wider band. Value is
/// ignored so that shading differences across a face stay selected.
pub fn tone_matches(pixel: Hsv, tone: Hsv, tolerance: f32) -> bool {
    hue_distance(pixel.h, tone.h) < tolerance
        && (pixel.s - tone.s).abs() < tolerance * SATURATION_TOLERANCE_SCALE
}

/// Host-side mirror of the mask classifier: 1.0 for skin, 0.0 otherwise.
pub fn classify(pixel: Rgb, tones: &ToneSamples, tolerance: f32) -> f32 {
    let hsv = pixel.to_hsv();
    if tones.iter().any(|tone| tone_matches(hsv, *tone, tolerance)) {
        1.0
    } else {
        0.0
    }
}
