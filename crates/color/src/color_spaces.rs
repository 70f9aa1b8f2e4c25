/// RGB/HSV conversions shared by host-side sampling and the mask shader

/// Convert normalized RGB to HSV.
///
/// Hue is a fraction of a full turn in [0, 1). Achromatic input (max == min)
/// yields hue 0, black yields saturation 0.
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max == 0.0 { 0.0 } else { delta / max };

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        let offset = if g < b { 6.0 } else { 0.0 };
        ((g - b) / delta + offset) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };

    (h, s, v)
}

/// Convert HSV back to normalized RGB. Hue outside [0, 1) wraps.
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let h = wrap_hue(h) * 6.0;
    let sector = h.floor();
    let f = h - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);

    match sector as i32 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

/// Wrap a hue into [0, 1).
pub fn wrap_hue(h: f32) -> f32 {
    let wrapped = h.rem_euclid(1.0);
    // rem_euclid can round up to exactly 1.0 for tiny negative inputs
    if wrapped >= 1.0 {
        0.0
    } else {
        wrapped
    }
}

/// Circular distance between two hues; 0 and 1 are adjacent.
pub fn hue_distance(a: f32, b: f32) -> f32 {
    let d = (wrap_hue(a) - wrap_hue(b)).abs();
    d.min(1.0 - d)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-5;

    fn close(a: (f32, f32, f32), b: (f32, f32, f32)) -> bool {
        (a.0 - b.0).abs() < EPS && (a.1 - b.1).abs() < EPS && (a.2 - b.2).abs() < EPS
    }

    #[test]
    fn test_primary_hues() {
        assert!(close(rgb_to_hsv(1.0, 0.0, 0.0), (0.0, 1.0, 1.0)));
        assert!(close(rgb_to_hsv(0.0, 1.0, 0.0), (1.0 / 3.0, 1.0, 1.0)));
        assert!(close(rgb_to_hsv(0.0, 0.0, 1.0), (2.0 / 3.0, 1.0, 1.0)));
        // magenta sits just below the wrap point
        assert!(close(rgb_to_hsv(1.0, 0.0, 1.0), (5.0 / 6.0, 1.0, 1.0)));
    }

    #[test]
    fn test_achromatic_has_zero_hue() {
        let (h, s, v) = rgb_to_hsv(0.4, 0.4, 0.4);
        assert_eq!(h, 0.0);
        assert_eq!(s, 0.0);
        assert!((v - 0.4).abs() < EPS);

        assert_eq!(rgb_to_hsv(0.0, 0.0, 0.0), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_round_trip_over_grid() {
        let steps = 17;
        for ri in 0..steps {
            for gi in 0..steps {
                for bi in 0..steps {
                    let rgb = (
                        ri as f32 / (steps - 1) as f32,
                        gi as f32 / (steps - 1) as f32,
                        bi as f32 / (steps - 1) as f32,
                    );
                    let (h, s, v) = rgb_to_hsv(rgb.0, rgb.1, rgb.2);
                    let back = hsv_to_rgb(h, s, v);
                    assert!(close(rgb, back), "{rgb:?} -> ({h}, {s}, {v}) -> {back:?}");
                }
            }
        }
    }

    #[test]
    fn test_zero_saturation_ignores_hue() {
        for h in [0.0, 0.25, 0.7, 0.99] {
            let rgb = hsv_to_rgb(h, 0.0, 0.6);
            assert!(close(rgb, (0.6, 0.6, 0.6)));
        }
    }

    #[test]
    fn test_hue_distance_wraps() {
        assert!((hue_distance(0.02, 0.98) - 0.04).abs() < EPS);
        assert!((hue_distance(1.02, 0.98) - 0.04).abs() < EPS);
        assert!((hue_distance(0.98, 0.02) - 0.04).abs() < EPS);
        assert!((hue_distance(0.1, 0.6) - 0.5).abs() < EPS);
        assert_eq!(hue_distance(0.3, 0.3), 0.0);
    }

    #[test]
    fn test_wrap_hue_negative() {
        assert!((wrap_hue(-0.25) - 0.75).abs() < EPS);
        assert!(wrap_hue(-1e-9) < 1.0);
    }
}
