//! Perceptual image comparison
//!
//! Pixels are compared by CIEDE2000 colour distance. A pixel beyond the
//! tolerance is still forgiven when it looks like anti-aliasing in either
//! image (brightness-slope detection with its own tolerance), and thin
//! vertical runs of differing pixels are treated as a text caret and
//! ignored.

use crate::{Error, Result};
use image::{imageops, Rgba, RgbaImage};

/// Highlight colour for differing pixels
pub const HIGHLIGHT: Rgba<u8> = Rgba([255, 0, 255, 255]);

/// Opacity of the reference overlay in the bottom-left quadrant
pub const OVERLAY_OPACITY: f32 = 0.35;

/// Outcome of [`compare`]
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    pub same: bool,
    /// Number of differing pixels, set when `same` is false
    pub differences: Option<u64>,
    /// Composite diagnostic image, set when `same` is false
    pub diff_image: Option<RgbaImage>,
}

/// Compare `current` against `reference`.
///
/// Differing dimensions are a precondition failure (`Error::SizeMismatch`),
/// never a visual difference.
pub fn compare(
    reference: &RgbaImage,
    current: &RgbaImage,
    tolerance: f64,
    antialiasing_tolerance: f64,
) -> Result<DiffResult> {
    if reference.dimensions() != current.dimensions() {
        return Err(Error::SizeMismatch {
            baseline: reference.dimensions(),
            current: current.dimensions(),
        });
    }

    let (width, height) = reference.dimensions();
    let mut mask = vec![false; (width as usize) * (height as usize)];
    let mut any = false;

    for y in 0..height {
        for x in 0..width {
            let a = reference.get_pixel(x, y);
            let b = current.get_pixel(x, y);
            if a == b || delta_e(*a, *b) <= tolerance {
                continue;
            }
            if is_antialiased(reference, x, y, current, antialiasing_tolerance)
                || is_antialiased(current, x, y, reference, antialiasing_tolerance)
            {
                continue;
            }
            mask[(y * width + x) as usize] = true;
            any = true;
        }
    }

    if any {
        ignore_carets(&mut mask, width, height);
    }

    let differences = mask.iter().filter(|d| **d).count() as u64;
    if differences == 0 {
        return Ok(DiffResult { same: true, differences: None, diff_image: None });
    }

    Ok(DiffResult {
        same: false,
        differences: Some(differences),
        diff_image: Some(composite(reference, current, &mask)),
    })
}

/// Four-quadrant diagnostic image: current (top-left), reference
/// (top-right), current with a translucent reference overlay (bottom-left)
/// and the highlighted pixel diff (bottom-right).
pub fn composite(reference: &RgbaImage, current: &RgbaImage, mask: &[bool]) -> RgbaImage {
    let (width, height) = reference.dimensions();
    let margin = ((width as f32 * 0.15) as u32).min(50);

    let mut canvas = RgbaImage::new(width * 2 + margin, height * 2 + margin);
    imageops::overlay(&mut canvas, current, 0, 0);
    imageops::overlay(&mut canvas, reference, (width + margin) as i64, 0);

    let mut blended = current.clone();
    for (dst, src) in blended.pixels_mut().zip(reference.pixels()) {
        for c in 0..3 {
            let mixed = dst.0[c] as f32 * (1.0 - OVERLAY_OPACITY) + src.0[c] as f32 * OVERLAY_OPACITY;
            dst.0[c] = mixed.round().clamp(0.0, 255.0) as u8;
        }
        dst.0[3] = dst.0[3].max(src.0[3]);
    }
    imageops::overlay(&mut canvas, &blended, 0, (height + margin) as i64);

    let mut highlighted = reference.clone();
    for (i, pixel) in highlighted.pixels_mut().enumerate() {
        if mask.get(i).copied().unwrap_or(false) {
            *pixel = HIGHLIGHT;
        }
    }
    imageops::overlay(&mut canvas, &highlighted, (width + margin) as i64, (height + margin) as i64);

    canvas
}

/// CIEDE2000 distance between two pixels composited over white.
pub fn delta_e(a: Rgba<u8>, b: Rgba<u8>) -> f64 {
    ciede2000(to_lab(a), to_lab(b))
}

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn to_lab(px: Rgba<u8>) -> [f64; 3] {
    let alpha = px.0[3] as f64 / 255.0;
    let channel = |i: usize| {
        let over_white = px.0[i] as f64 * alpha + 255.0 * (1.0 - alpha);
        srgb_to_linear(over_white / 255.0)
    };
    let (r, g, b) = (channel(0), channel(1), channel(2));

    // D65 reference white
    let x = (0.4124 * r + 0.3576 * g + 0.1805 * b) / 0.95047;
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let z = (0.0193 * r + 0.1192 * g + 0.9505 * b) / 1.08883;

    let f = |t: f64| {
        if t > 0.008856 {
            t.cbrt()
        } else {
            7.787 * t + 16.0 / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

fn ciede2000(lab1: [f64; 3], lab2: [f64; 3]) -> f64 {
    use std::f64::consts::PI;
    let [l1, a1, b1] = lab1;
    let [l2, a2, b2] = lab2;

    let c1 = (a1 * a1 + b1 * b1).sqrt();
    let c2 = (a2 * a2 + b2 * b2).sqrt();
    let c_bar = (c1 + c2) / 2.0;
    let c_bar7 = c_bar.powi(7);
    let g = 0.5 * (1.0 - (c_bar7 / (c_bar7 + 25f64.powi(7))).sqrt());

    let a1p = a1 * (1.0 + g);
    let a2p = a2 * (1.0 + g);
    let c1p = (a1p * a1p + b1 * b1).sqrt();
    let c2p = (a2p * a2p + b2 * b2).sqrt();

    let hue = |b: f64, a: f64| {
        if a == 0.0 && b == 0.0 {
            0.0
        } else {
            let h = b.atan2(a).to_degrees();
            if h < 0.0 {
                h + 360.0
            } else {
                h
            }
        }
    };
    let h1p = hue(b1, a1p);
    let h2p = hue(b2, a2p);

    let dl = l2 - l1;
    let dc = c2p - c1p;
    let dh_angle = if c1p * c2p == 0.0 {
        0.0
    } else if (h2p - h1p).abs() <= 180.0 {
        h2p - h1p
    } else if h2p - h1p > 180.0 {
        h2p - h1p - 360.0
    } else {
        h2p - h1p + 360.0
    };
    let dh = 2.0 * (c1p * c2p).sqrt() * (dh_angle.to_radians() / 2.0).sin();

    let l_bar = (l1 + l2) / 2.0;
    let c_bar_p = (c1p + c2p) / 2.0;
    let h_bar_p = if c1p * c2p == 0.0 {
        h1p + h2p
    } else if (h1p - h2p).abs() <= 180.0 {
        (h1p + h2p) / 2.0
    } else if h1p + h2p < 360.0 {
        (h1p + h2p + 360.0) / 2.0
    } else {
        (h1p + h2p - 360.0) / 2.0
    };

    let t = 1.0 - 0.17 * (h_bar_p - 30.0).to_radians().cos()
        + 0.24 * (2.0 * h_bar_p).to_radians().cos()
        + 0.32 * (3.0 * h_bar_p + 6.0).to_radians().cos()
        - 0.20 * (4.0 * h_bar_p - 63.0).to_radians().cos();
    let d_theta = 30.0 * (-((h_bar_p - 275.0) / 25.0).powi(2)).exp();
    let c_bar_p7 = c_bar_p.powi(7);
    let rc = 2.0 * (c_bar_p7 / (c_bar_p7 + 25f64.powi(7))).sqrt();
    let l50 = (l_bar - 50.0).powi(2);
    let sl = 1.0 + (0.015 * l50) / (20.0 + l50).sqrt();
    let sc = 1.0 + 0.045 * c_bar_p;
    let sh = 1.0 + 0.015 * c_bar_p * t;
    let rt = -(2.0 * d_theta * PI / 180.0).sin() * rc;

    let tl = dl / sl;
    let tc = dc / sc;
    let th = dh / sh;
    (tl * tl + tc * tc + th * th + rt * tc * th).sqrt()
}

fn brightness(px: &Rgba<u8>) -> f64 {
    0.3 * px.0[0] as f64 + 0.59 * px.0[1] as f64 + 0.11 * px.0[2] as f64
}

/// Anti-aliasing detection: the pixel sits on a brightness slope (has both a
/// darker and a brighter neighbour, few flat neighbours) and the extreme
/// neighbour is part of a flat region in both images.
fn is_antialiased(img: &RgbaImage, x: u32, y: u32, other: &RgbaImage, tolerance: f64) -> bool {
    let (width, height) = img.dimensions();
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x2 = (x + 1).min(width - 1);
    let y2 = (y + 1).min(height - 1);

    let mut zeroes = usize::from(x == x0 || x == x2 || y == y0 || y == y2);
    let center = brightness(img.get_pixel(x, y));
    let mut min = 0.0;
    let mut max = 0.0;
    let mut min_at = (x, y);
    let mut max_at = (x, y);

    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if nx == x && ny == y {
                continue;
            }
            let delta = brightness(img.get_pixel(nx, ny)) - center;
            if delta.abs() <= tolerance {
                zeroes += 1;
                if zeroes > 2 {
                    return false;
                }
            } else if delta < min {
                min = delta;
                min_at = (nx, ny);
            } else if delta > max {
                max = delta;
                max_at = (nx, ny);
            }
        }
    }

    if min == 0.0 || max == 0.0 {
        return false;
    }

    (has_many_siblings(img, min_at.0, min_at.1) && has_many_siblings(other, min_at.0, min_at.1))
        || (has_many_siblings(img, max_at.0, max_at.1) && has_many_siblings(other, max_at.0, max_at.1))
}

/// More than two identical neighbours
fn has_many_siblings(img: &RgbaImage, x: u32, y: u32) -> bool {
    let (width, height) = img.dimensions();
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x2 = (x + 1).min(width - 1);
    let y2 = (y + 1).min(height - 1);

    let mut zeroes = usize::from(x == x0 || x == x2 || y == y0 || y == y2);
    let center = img.get_pixel(x, y);
    for ny in y0..=y2 {
        for nx in x0..=x2 {
            if (nx, ny) != (x, y) && img.get_pixel(nx, ny) == center {
                zeroes += 1;
                if zeroes > 2 {
                    return true;
                }
            }
        }
    }
    false
}

/// Widest run that still counts as a caret, in pixels
const CARET_MAX_WIDTH: u32 = 2;
/// Shortest run that counts as a caret, in pixels
const CARET_MIN_HEIGHT: u32 = 5;

/// Clear connected groups of differing pixels that form a solid, thin,
/// vertical bar.
fn ignore_carets(mask: &mut [bool], width: u32, height: u32) {
    let idx = |x: u32, y: u32| (y * width + x) as usize;
    let mut visited = vec![false; mask.len()];

    for start_y in 0..height {
        for start_x in 0..width {
            let start = idx(start_x, start_y);
            if !mask[start] || visited[start] {
                continue;
            }

            let mut component = Vec::new();
            let mut stack = vec![(start_x, start_y)];
            visited[start] = true;
            while let Some((x, y)) = stack.pop() {
                component.push((x, y));
                for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                        let i = idx(nx, ny);
                        if mask[i] && !visited[i] {
                            visited[i] = true;
                            stack.push((nx, ny));
                        }
                    }
                }
            }

            let (min_x, max_x) = bounds(component.iter().map(|p| p.0));
            let (min_y, max_y) = bounds(component.iter().map(|p| p.1));
            let w = max_x - min_x + 1;
            let h = max_y - min_y + 1;
            let solid = component.len() as u32 == w * h;
            if solid && w <= CARET_MAX_WIDTH && h >= CARET_MIN_HEIGHT {
                for (x, y) in component {
                    mask[idx(x, y)] = false;
                }
            }
        }
    }
}

fn bounds(values: impl Iterator<Item = u32>) -> (u32, u32) {
    values.fold((u32::MAX, 0), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    #[test]
    fn identical_images_are_same() {
        let a = solid(8, 8, [10, 20, 30]);
        let r = compare(&a, &a.clone(), 0.0, 0.0).unwrap();
        assert!(r.same);
        assert!(r.differences.is_none());
        assert!(r.diff_image.is_none());
    }

    #[test]
    fn tolerance_boundary_is_inclusive() {
        let reference = solid(6, 6, [128, 128, 128]);
        let current = solid(6, 6, [128, 128, 140]);
        let k = delta_e(*reference.get_pixel(0, 0), *current.get_pixel(0, 0));
        assert!(k > 1.0);

        assert!(compare(&reference, &current, k, 0.0).unwrap().same);
        let over = compare(&reference, &current, k - 1.0, 0.0).unwrap();
        assert!(!over.same);
        assert_eq!(over.differences, Some(36));
    }

    #[test]
    fn size_mismatch_is_not_a_diff() {
        let err = compare(&solid(4, 4, [0, 0, 0]), &solid(4, 5, [0, 0, 0]), 2.5, 3.5).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { baseline: (4, 4), current: (4, 5) }));
    }

    #[test]
    fn carets_are_ignored_but_blocks_are_not() {
        let reference = solid(20, 20, [255, 255, 255]);

        let mut caret = reference.clone();
        for y in 3..13 {
            caret.put_pixel(5, y, Rgba([0, 0, 0, 255]));
        }
        assert!(compare(&reference, &caret, 2.5, 3.5).unwrap().same);

        let mut block = reference.clone();
        for y in 3..13 {
            for x in 5..9 {
                block.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let r = compare(&reference, &block, 2.5, 3.5).unwrap();
        assert!(!r.same);
        assert_eq!(r.differences, Some(40));
    }

    #[test]
    fn antialiased_edge_pixels_are_forgiven() {
        // A hard black/white edge in the reference; the current image softens
        // one edge pixel to gray, as a different rasterizer would.
        let mut reference = solid(9, 9, [255, 255, 255]);
        for y in 0..9 {
            for x in 0..4 {
                reference.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let mut current = reference.clone();
        current.put_pixel(4, 4, Rgba([128, 128, 128, 255]));
        assert!(compare(&reference, &current, 2.5, 3.5).unwrap().same);
    }

    #[test]
    fn composite_layout() {
        let reference = solid(100, 40, [0, 0, 255]);
        let mut current = reference.clone();
        for y in 10..20 {
            for x in 10..20 {
                current.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }
        let r = compare(&reference, &current, 2.5, 3.5).unwrap();
        let img = r.diff_image.unwrap();
        let margin = 15;
        assert_eq!(img.dimensions(), (200 + margin, 80 + margin));
        // top-left is current, top-right is reference
        assert_eq!(*img.get_pixel(15, 15), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(100 + margin + 15, 15), Rgba([0, 0, 255, 255]));
        // bottom-right highlights the changed block
        assert_eq!(*img.get_pixel(100 + margin + 15, 40 + margin + 15), HIGHLIGHT);
        assert_eq!(*img.get_pixel(100 + margin + 50, 40 + margin + 5), Rgba([0, 0, 255, 255]));
        // bottom-left blends 35% of the reference into the current image
        let blended = img.get_pixel(15, 40 + margin + 15);
        assert_eq!(blended.0, [166, 0, 89, 255]);
    }
}
