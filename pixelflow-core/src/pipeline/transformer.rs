use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{
    DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat, Pixel, Rgba,
};

use crate::domain::{PipelineStep, Watermark};
use crate::error::{PixelflowError, Result};
use crate::pipeline::{font, normalize_output_format, Transformer};

const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_OPACITY: f64 = 0.65;
const WATERMARK_PADDING: i64 = 12;
const TEXT_SCALE: u32 = 2;

#[derive(Debug, Clone)]
pub struct Transformed {
    pub data: Vec<u8>,
    pub format: String,
    pub width: u32,
    pub height: u32,
}

/// CPU-bound still-image transformer over the `image` codecs.
pub struct ImageTransformer;

impl Transformer for ImageTransformer {
    fn transform(&self, input: &[u8], step: &PipelineStep) -> Result<Transformed> {
        let source_format = image::guess_format(input).ok();
        let source = image::load_from_memory(input)
            .map_err(|e| PixelflowError::Pipeline(format!("decode source image: {e}")))?;

        let out = match step.action.trim().to_ascii_lowercase().as_str() {
            "resize" => resize_to_width(&source, step.width)?,
            "watermark" => watermark_text(&source, step.watermark.as_ref())?,
            _ => return Err(PixelflowError::InvalidStepAction(step.action.clone())),
        };

        let requested = step.format.trim().to_ascii_lowercase();
        let format = if requested.is_empty() {
            normalize_output_format(source_format_name(source_format))
        } else {
            normalize_output_format(&requested)
        };

        let data = encode_image(&out, format, step.quality)?;
        let (width, height) = out.dimensions();

        Ok(Transformed {
            data,
            format: format.to_string(),
            width,
            height,
        })
    }
}

fn source_format_name(format: Option<ImageFormat>) -> &'static str {
    match format {
        Some(ImageFormat::Jpeg) => "jpeg",
        Some(ImageFormat::Png) => "png",
        Some(ImageFormat::WebP) => "webp",
        _ => "",
    }
}

fn resize_to_width(source: &DynamicImage, width: u32) -> Result<DynamicImage> {
    if width == 0 {
        return Err(PixelflowError::Pipeline(
            "resize action requires width > 0".to_string(),
        ));
    }

    let (src_w, src_h) = source.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err(PixelflowError::Pipeline(
            "source image has invalid dimensions".to_string(),
        ));
    }

    if width == src_w {
        return Ok(source.clone());
    }

    let scale = width as f64 / src_w as f64;
    let height = ((src_h as f64 * scale).round() as u32).max(1);
    Ok(source.resize_exact(width, height, image::imageops::FilterType::Nearest))
}

fn watermark_text(source: &DynamicImage, watermark: Option<&Watermark>) -> Result<DynamicImage> {
    let watermark = watermark.ok_or_else(|| {
        PixelflowError::Pipeline("watermark action requires watermark settings".to_string())
    })?;
    let text = watermark.text.trim();
    if text.is_empty() {
        return Err(PixelflowError::Pipeline(
            "watermark action requires watermark.text".to_string(),
        ));
    }

    let mut opacity = watermark.opacity;
    if opacity <= 0.0 {
        opacity = DEFAULT_OPACITY;
    }
    if opacity > 1.0 {
        opacity = 1.0;
    }
    let alpha = (opacity * 255.0).round() as u8;

    let mut canvas = source.to_rgba8();
    let (img_w, img_h) = (canvas.width() as i64, canvas.height() as i64);
    let text_w = (font::text_width(text) * TEXT_SCALE) as i64;
    let text_h = (font::GLYPH_HEIGHT * TEXT_SCALE) as i64;

    let (x, y) = anchor_position(img_w, img_h, text_w, text_h, &watermark.gravity);
    draw_text(&mut canvas, text, x, y, alpha);

    Ok(DynamicImage::ImageRgba8(canvas))
}

/// Nine-position anchor with a fixed padding, clamped into the image.
fn anchor_position(img_w: i64, img_h: i64, text_w: i64, text_h: i64, gravity: &str) -> (i64, i64) {
    let pad = WATERMARK_PADDING;
    let left = pad;
    let center = (img_w - text_w) / 2;
    let right = img_w - text_w - pad;
    let top = pad;
    let middle = (img_h - text_h) / 2;
    let bottom = img_h - text_h - pad;

    let (x, y) = match gravity.trim().to_ascii_lowercase().as_str() {
        "northwest" => (left, top),
        "north" => (center, top),
        "northeast" => (right, top),
        "west" => (left, middle),
        "center" => (center, middle),
        "east" => (right, middle),
        "southwest" => (left, bottom),
        "south" => (center, bottom),
        _ => (right, bottom),
    };

    (x.clamp(0, img_w.max(1) - 1), y.clamp(0, img_h.max(1) - 1))
}

fn draw_text(canvas: &mut image::RgbaImage, text: &str, origin_x: i64, origin_y: i64, alpha: u8) {
    let ink = Rgba([255u8, 255, 255, alpha]);
    let advance = ((font::GLYPH_WIDTH + font::GLYPH_SPACING) * TEXT_SCALE) as i64;

    for (index, c) in text.chars().enumerate() {
        let glyph = font::glyph(c);
        let glyph_x = origin_x + index as i64 * advance;
        for (col, bits) in glyph.iter().enumerate() {
            for row in 0..font::GLYPH_HEIGHT {
                if bits & (1 << row) == 0 {
                    continue;
                }
                for sx in 0..TEXT_SCALE as i64 {
                    for sy in 0..TEXT_SCALE as i64 {
                        let px = glyph_x + col as i64 * TEXT_SCALE as i64 + sx;
                        let py = origin_y + row as i64 * TEXT_SCALE as i64 + sy;
                        if px < 0
                            || py < 0
                            || px >= canvas.width() as i64
                            || py >= canvas.height() as i64
                        {
                            continue;
                        }
                        canvas.get_pixel_mut(px as u32, py as u32).blend(&ink);
                    }
                }
            }
        }
    }
}

fn encode_image(image: &DynamicImage, format: &str, quality: i64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        "jpeg" => {
            let quality = if quality <= 0 || quality > 100 {
                DEFAULT_JPEG_QUALITY
            } else {
                quality as u8
            };
            let rgb = image.to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, quality)
                .encode_image(&rgb)
                .map_err(|e| PixelflowError::Pipeline(format!("encode jpeg: {e}")))?;
        }
        "png" => {
            let rgba = image.to_rgba8();
            PngEncoder::new(&mut buf)
                .write_image(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .map_err(|e| PixelflowError::Pipeline(format!("encode png: {e}")))?;
        }
        "webp" => {
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut buf)
                .encode(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .map_err(|e| PixelflowError::Pipeline(format!("encode webp: {e}")))?;
        }
        other => {
            return Err(PixelflowError::Pipeline(format!(
                "unsupported output format: {other}"
            )));
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let mut img = RgbaImage::new(width, height);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255]);
        }
        let mut buf = Vec::new();
        PngEncoder::new(&mut buf)
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .unwrap();
        buf
    }

    fn step(action: &str) -> PipelineStep {
        PipelineStep {
            id: "t".to_string(),
            action: action.to_string(),
            width: 0,
            format: String::new(),
            quality: 0,
            watermark: None,
        }
    }

    #[test]
    fn resize_scales_width_and_preserves_aspect() {
        let input = png_fixture(240, 120);
        let mut s = step("resize");
        s.width = 80;
        let out = ImageTransformer.transform(&input, &s).unwrap();
        assert_eq!(out.width, 80);
        assert_eq!(out.height, 40);
        assert_eq!(out.format, "png");
        let decoded = image::load_from_memory(&out.data).unwrap();
        assert_eq!(decoded.dimensions(), (80, 40));
    }

    #[test]
    fn resize_without_width_fails() {
        let input = png_fixture(10, 10);
        let err = ImageTransformer.transform(&input, &step("resize")).unwrap_err();
        assert!(err.to_string().contains("width > 0"));
    }

    #[test]
    fn jpeg_format_and_quality_defaults() {
        let input = png_fixture(64, 64);
        let mut s = step("resize");
        s.width = 32;
        s.format = "jpg".to_string();
        s.quality = 500; // out of range, replaced with the default
        let out = ImageTransformer.transform(&input, &s).unwrap();
        assert_eq!(out.format, "jpeg");
        assert_eq!(
            image::guess_format(&out.data).unwrap(),
            ImageFormat::Jpeg
        );
    }

    #[test]
    fn output_format_defaults_to_source_format() {
        let input = png_fixture(16, 16);
        let mut s = step("resize");
        s.width = 8;
        let out = ImageTransformer.transform(&input, &s).unwrap();
        assert_eq!(out.format, "png");
    }

    #[test]
    fn watermark_changes_pixels() {
        let input = png_fixture(120, 60);
        let mut s = step("watermark");
        s.watermark = Some(Watermark {
            text: "PixelFlow".to_string(),
            opacity: 0.75,
            gravity: "south".to_string(),
        });
        let out = ImageTransformer.transform(&input, &s).unwrap();
        assert_ne!(out.data, input);
        assert_eq!((out.width, out.height), (120, 60));
    }

    #[test]
    fn watermark_without_text_fails() {
        let input = png_fixture(16, 16);
        let mut s = step("watermark");
        s.watermark = Some(Watermark {
            text: "   ".to_string(),
            opacity: 0.5,
            gravity: String::new(),
        });
        let err = ImageTransformer.transform(&input, &s).unwrap_err();
        assert!(err.to_string().contains("watermark.text"));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let input = png_fixture(8, 8);
        let err = ImageTransformer.transform(&input, &step("sharpen")).unwrap_err();
        assert!(matches!(err, PixelflowError::InvalidStepAction(_)));
    }

    #[test]
    fn garbage_input_fails_to_decode() {
        let mut s = step("resize");
        s.width = 10;
        let err = ImageTransformer.transform(b"not an image", &s).unwrap_err();
        assert!(err.to_string().contains("decode source image"));
    }

    #[test]
    fn anchor_positions_cover_all_gravities() {
        // 100x100 image, 20x10 text, pad 12.
        let cases = [
            ("northwest", (12, 12)),
            ("north", (40, 12)),
            ("northeast", (68, 12)),
            ("west", (12, 45)),
            ("center", (40, 45)),
            ("east", (68, 45)),
            ("southwest", (12, 78)),
            ("south", (40, 78)),
            ("southeast", (68, 78)),
            ("sideways", (68, 78)), // unknown falls back to southeast
        ];
        for (gravity, expected) in cases {
            assert_eq!(anchor_position(100, 100, 20, 10, gravity), expected, "{gravity}");
        }
    }

    #[test]
    fn opacity_clamps() {
        let input = png_fixture(64, 32);
        for opacity in [-1.0, 0.0, 1.5] {
            let mut s = step("watermark");
            s.watermark = Some(Watermark {
                text: "x".to_string(),
                opacity,
                gravity: "center".to_string(),
            });
            // Clamped opacity still renders rather than erroring.
            ImageTransformer.transform(&input, &s).unwrap();
        }
    }
}
