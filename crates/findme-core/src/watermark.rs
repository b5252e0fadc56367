//! Watermarked face highlights used as match thumbnails.
//!
//! The full photo is shown dimmed and striped with only the matched face left
//! clear, so a thumbnail identifies the face without giving away a usable
//! copy of the photo before purchase.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use thiserror::Error;

const OUTSIDE_DIM: f32 = 0.45;
const STRIPE_WIDTH: u32 = 24;
const STRIPE_COLOR: [f32; 3] = [200.0, 200.0, 200.0];
const STRIPE_ALPHA: f32 = 0.25;
const OUTLINE_COLOR: Rgb<u8> = Rgb([255, 196, 0]);
const OUTLINE_THICKNESS: u32 = 3;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("encode: {0}")]
    Encode(#[from] image::ImageError),
}

/// Render the highlight for `bbox` and encode it as JPEG.
pub fn render_watermark(image: &RgbImage, bbox: &BoundingBox, max_side: u32) -> Result<Vec<u8>, RenderError> {
    let rendered = render_highlight(image, bbox, max_side);
    let mut bytes = Vec::new();
    rendered.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
    Ok(bytes)
}

/// Downscale to at most `max_side`, dim and stripe everything, keep the face
/// region undimmed and outline it.
pub fn render_highlight(image: &RgbImage, bbox: &BoundingBox, max_side: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height).max(1);
    let scale = if max_side > 0 && longest > max_side {
        max_side as f32 / longest as f32
    } else {
        1.0
    };

    let mut canvas = if scale < 1.0 {
        let new_w = ((width as f32 * scale).round() as u32).max(1);
        let new_h = ((height as f32 * scale).round() as u32).max(1);
        imageops::resize(image, new_w, new_h, FilterType::Triangle)
    } else {
        image.clone()
    };

    let region = bbox
        .scaled(scale)
        .clamp_to(canvas.width(), canvas.height())
        .map(|b| {
            (
                b.x as u32,
                b.y as u32,
                (b.x + b.width).ceil() as u32,
                (b.y + b.height).ceil() as u32,
            )
        });

    let inside = |x: u32, y: u32| match region {
        Some((x1, y1, x2, y2)) => x >= x1 && x < x2 && y >= y1 && y < y2,
        None => false,
    };

    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let dim = if inside(x, y) { 1.0 } else { OUTSIDE_DIM };
        let striped = ((x + y) / STRIPE_WIDTH) % 2 == 0;
        for c in 0..3 {
            let mut v = pixel[c] as f32 * dim;
            if striped {
                v = v * (1.0 - STRIPE_ALPHA) + STRIPE_COLOR[c] * STRIPE_ALPHA;
            }
            pixel[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }

    if let Some((x1, y1, x2, y2)) = region {
        draw_outline(&mut canvas, x1, y1, x2, y2);
    }

    canvas
}

fn draw_outline(canvas: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32) {
    let (width, height) = canvas.dimensions();
    let x2 = x2.min(width);
    let y2 = y2.min(height);

    for y in y1..y2 {
        for x in x1..x2 {
            let on_edge = x < x1 + OUTLINE_THICKNESS
                || y < y1 + OUTLINE_THICKNESS
                || x + OUTLINE_THICKNESS >= x2
                || y + OUTLINE_THICKNESS >= y2;
            if on_edge {
                canvas.put_pixel(x, y, OUTLINE_COLOR);
            }
        }
    }
}
