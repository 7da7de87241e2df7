//! Watermark compositing: placement geometry and alpha blending

use crate::error::Result;
use crate::models::{validate_opacity, WatermarkPosition};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use tracing::debug;

/// Default margin for watermark positioning
pub const DEFAULT_MARGIN: i64 = 10;

/// Where and at what size the watermark lands on the base image.
///
/// Offsets are signed: a watermark larger than the base yields negative
/// coordinates, and whatever falls outside the base is clipped while blending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// Position calculator for watermark placement
#[derive(Debug)]
pub struct PositionCalculator;

impl PositionCalculator {
    /// Calculate the placement for a watermark of `(watermark_width, watermark_height)`
    /// on an image of `(image_width, image_height)`
    pub fn calculate_placement(
        position: WatermarkPosition,
        image_width: u32,
        image_height: u32,
        watermark_width: u32,
        watermark_height: u32,
    ) -> Placement {
        let (iw, ih) = (image_width as i64, image_height as i64);
        let (ww, wh) = (watermark_width as i64, watermark_height as i64);

        let at = |x: i64, y: i64| Placement {
            x,
            y,
            width: watermark_width,
            height: watermark_height,
        };

        match position {
            WatermarkPosition::TopLeft => at(DEFAULT_MARGIN, DEFAULT_MARGIN),
            WatermarkPosition::TopRight => at(iw - ww - DEFAULT_MARGIN, DEFAULT_MARGIN),
            WatermarkPosition::BottomLeft => at(DEFAULT_MARGIN, ih - wh - DEFAULT_MARGIN),
            WatermarkPosition::BottomRight => {
                at(iw - ww - DEFAULT_MARGIN, ih - wh - DEFAULT_MARGIN)
            }
            // Integer division truncates toward zero, also for negative spans
            WatermarkPosition::Center => at((iw - ww) / 2, (ih - wh) / 2),
            WatermarkPosition::BottomFull => {
                if watermark_width > 0 && watermark_width < image_width {
                    let scaled_height = ((watermark_height as f64 * image_width as f64
                        / watermark_width as f64)
                        .round() as u32)
                        .max(1);
                    Placement {
                        x: 0,
                        y: ih - scaled_height as i64,
                        width: image_width,
                        height: scaled_height,
                    }
                } else {
                    // Already full width: bottom-centre, unscaled
                    at((iw - ww) / 2, ih - wh - DEFAULT_MARGIN)
                }
            }
        }
    }
}

/// Composites watermark images onto base images
#[derive(Debug, Default, Clone)]
pub struct Compositor;

impl Compositor {
    /// Create a new compositor
    pub fn new() -> Self {
        Self
    }

    /// Blend `watermark` over `base` at `position` with the given opacity.
    ///
    /// The result keeps the base's dimensions and alpha: a base without an
    /// alpha channel comes back as RGB, one with alpha as RGBA, both at 8 bits
    /// per channel. The function
    /// is pure; identical inputs give pixel-identical outputs.
    pub fn composite(
        &self,
        base: &DynamicImage,
        watermark: &DynamicImage,
        position: WatermarkPosition,
        opacity: f32,
    ) -> Result<DynamicImage> {
        validate_opacity(opacity)?;

        let (base_width, base_height) = base.dimensions();
        let placement = PositionCalculator::calculate_placement(
            position,
            base_width,
            base_height,
            watermark.width(),
            watermark.height(),
        );

        let (overlay, y) = if (placement.width, placement.height) == watermark.dimensions() {
            (watermark.to_rgba8(), placement.y)
        } else if placement.height > base_height {
            // Only the bottom `base_height` rows of the scaled watermark can be
            // seen; scale just the source rows that produce them
            let visible_rows = ((base_height as u64 * watermark.width() as u64)
                .div_ceil(placement.width as u64) as u32)
                .clamp(1, watermark.height());
            debug!(
                "Scaling bottom {} of {} watermark rows to {}x{}",
                visible_rows,
                watermark.height(),
                placement.width,
                base_height
            );
            let visible = watermark.crop_imm(
                0,
                watermark.height() - visible_rows,
                watermark.width(),
                visible_rows,
            );
            let overlay = visible
                .resize_exact(placement.width, base_height, FilterType::Lanczos3)
                .to_rgba8();
            (overlay, placement.y.max(0))
        } else {
            debug!(
                "Scaling watermark from {}x{} to {}x{}",
                watermark.width(),
                watermark.height(),
                placement.width,
                placement.height
            );
            let overlay = watermark
                .resize_exact(placement.width, placement.height, FilterType::Lanczos3)
                .to_rgba8();
            (overlay, placement.y)
        };

        debug!(
            "Applying watermark: base={}x{}, watermark={}x{}, position={} at ({}, {}), opacity={}",
            base_width,
            base_height,
            overlay.width(),
            overlay.height(),
            position,
            placement.x,
            y,
            opacity
        );

        let mut canvas = base.to_rgba8();
        overlay_with_opacity(&mut canvas, &overlay, placement.x, y, opacity);

        if base.color().has_alpha() {
            Ok(DynamicImage::ImageRgba8(canvas))
        } else {
            Ok(DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8()))
        }
    }
}

/// Blend `overlay` onto `canvas` with its top-left corner at `(x, y)`, clipping
/// whatever falls outside the canvas
fn overlay_with_opacity(canvas: &mut RgbaImage, overlay: &RgbaImage, x: i64, y: i64, opacity: f32) {
    let (canvas_width, canvas_height) = (canvas.width() as i64, canvas.height() as i64);

    let start_x = (-x).max(0);
    let start_y = (-y).max(0);
    let end_x = (canvas_width - x).min(overlay.width() as i64);
    let end_y = (canvas_height - y).min(overlay.height() as i64);

    for oy in start_y..end_y {
        for ox in start_x..end_x {
            let overlay_pixel = *overlay.get_pixel(ox as u32, oy as u32);
            let (bx, by) = ((x + ox) as u32, (y + oy) as u32);
            let base_pixel = *canvas.get_pixel(bx, by);
            canvas.put_pixel(bx, by, blend_pixels(base_pixel, overlay_pixel, opacity));
        }
    }
}

/// Source-over compositing with the overlay's alpha scaled by `opacity`
fn blend_pixels(base: Rgba<u8>, overlay: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    let base_alpha = base[3] as f32 / 255.0;
    let overlay_alpha = (overlay[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);

    if overlay_alpha == 0.0 {
        return base;
    }

    let final_alpha = overlay_alpha + base_alpha * (1.0 - overlay_alpha);

    if final_alpha == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let inv_alpha = 1.0 - overlay_alpha;
    let channel = |i: usize| {
        let value = (overlay[i] as f32 * overlay_alpha + base[i] as f32 * base_alpha * inv_alpha)
            / final_alpha;
        value.round().clamp(0.0, 255.0) as u8
    };

    Rgba([
        channel(0),
        channel(1),
        channel(2),
        (final_alpha * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}
