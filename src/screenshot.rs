//! Viewport and full-page capture
//!
//! Full-page capture scrolls one viewport at a time and stitches the
//! captures; the final capture is cropped to the rows not already covered.
//! Sticky or fixed elements may therefore appear once per capture.

use crate::driver::{Page, PageMetrics};
use crate::Result;
use image::{imageops, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::path::Path;

/// How many captures a full-page screenshot takes and how the last one is
/// cropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePlan {
    pub captures: u32,
    /// Bottom rows (device pixels) kept from the last capture; `None` keeps
    /// it whole
    pub last_rows: Option<u32>,
}

/// Plan a full-page capture from the page measurements.
pub fn plan(metrics: &PageMetrics) -> CapturePlan {
    if metrics.viewport_height <= 0.0 || metrics.page_height <= metrics.viewport_height {
        return CapturePlan { captures: 1, last_rows: None };
    }
    let captures = (metrics.page_height / metrics.viewport_height).ceil() as u32;
    let extra = ((metrics.page_height % metrics.viewport_height) * metrics.device_pixel_ratio).round() as u32;
    CapturePlan {
        captures,
        last_rows: (extra > 0).then_some(extra),
    }
}

/// Capture the viewport, or the whole document when `full_page` is set.
pub fn capture(page: &dyn Page, full_page: bool) -> Result<RgbaImage> {
    if !full_page {
        return decode_png(&page.screenshot()?);
    }

    let plan = plan(&page.metrics()?);
    if plan.captures == 1 {
        return decode_png(&page.screenshot()?);
    }

    let mut images = Vec::with_capacity(plan.captures as usize);
    for _ in 0..plan.captures {
        images.push(decode_png(&page.screenshot()?)?);
        page.scroll_by_viewport()?;
    }

    if let (Some(rows), Some(last)) = (plan.last_rows, images.pop()) {
        let (w, h) = last.dimensions();
        let rows = rows.min(h);
        images.push(imageops::crop_imm(&last, 0, h - rows, w, rows).to_image());
    }

    Ok(stitch(&images))
}

/// Stack images top to bottom on a transparent canvas as wide as the widest.
pub fn stitch(images: &[RgbaImage]) -> RgbaImage {
    let width = images.iter().map(|i| i.width()).max().unwrap_or(0);
    let height = images.iter().map(|i| i.height()).sum();
    let mut canvas = RgbaImage::new(width, height);
    let mut y = 0i64;
    for img in images {
        imageops::overlay(&mut canvas, img, 0, y);
        y += img.height() as i64;
    }
    canvas
}

pub fn decode_png(bytes: &[u8]) -> Result<RgbaImage> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Png)?.to_rgba8())
}

pub fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Encode `img` and write it to `path`, creating parent directories.
pub fn save_png(img: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, encode_png(img)?)?;
    Ok(())
}

pub fn load_png(path: &Path) -> Result<RgbaImage> {
    decode_png(&std::fs::read(path)?)
}
