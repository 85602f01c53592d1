//! 32x32 canvases for the panel: text, counters and arbitrary images.

use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};
use rusttype::Font;

use crate::error::{Error, Result};
use crate::font::draw_text_centered;

/// The panel is square.
pub const PANEL_SIZE: u32 = 32;

/// Parses `#RRGGBB`, `RRGGBB` or `r,g,b`.
pub fn parse_color(value: &str) -> Result<Rgb<u8>> {
    let cleaned: String = value.chars().filter(|c| *c != '#' && *c != ' ').collect();
    let invalid = || Error::InvalidColor(value.to_string());

    if cleaned.contains(',') {
        let parts = cleaned
            .split(',')
            .take(3)
            .map(|p| p.parse::<u8>().map_err(|_| invalid()))
            .collect::<Result<Vec<u8>>>()?;
        return match parts.as_slice() {
            [r, g, b] => Ok(Rgb([*r, *g, *b])),
            _ => Err(invalid()),
        };
    }
    if cleaned.len() == 6 && cleaned.is_ascii() {
        let channel = |i: usize| u8::from_str_radix(&cleaned[i..i + 2], 16).map_err(|_| invalid());
        return Ok(Rgb([channel(0)?, channel(2)?, channel(4)?]));
    }
    Err(invalid())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextStyle {
    pub color: Rgb<u8>,
    pub background: Rgb<u8>,
    /// Font size in pixels.
    pub size: f32,
    /// Extra pixels between lines.
    pub spacing: u32,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            color: Rgb([255, 0, 0]),
            background: Rgb([0, 0, 0]),
            size: 16.0,
            spacing: 1,
        }
    }
}

pub fn render_text(text: &str, style: &TextStyle, font: &Font<'static>) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(PANEL_SIZE, PANEL_SIZE, style.background);
    draw_text_centered(&mut canvas, text, font, style.size, style.spacing, style.color);
    canvas
}

/// Red digits on black, sized so four digits still fit.
pub fn render_counter(value: i64, font: &Font<'static>) -> RgbImage {
    let style = TextStyle {
        size: 12.0,
        spacing: 0,
        ..TextStyle::default()
    };
    render_text(&value.to_string(), &style, font)
}

/// How a source image is brought down to panel size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FitMode {
    /// Stretch to 32x32, ignoring aspect ratio.
    #[default]
    Scale,
    /// Centre-crop to a square, then resize.
    Fit,
    /// Same crop as `Fit`, bicubic filter.
    Cover,
}

impl FromStr for FitMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scale" => Ok(FitMode::Scale),
            "fit" => Ok(FitMode::Fit),
            "cover" => Ok(FitMode::Cover),
            other => Err(format!("unknown mode '{other}' (expected scale, fit or cover)")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageOptions {
    pub mode: FitMode,
    /// Degrees, counter-clockwise.
    pub rotate: i32,
    pub mirror: bool,
    pub invert: bool,
}

/// Rotates counter-clockwise about the centre, keeping the canvas size.
/// Corners that come into view are black; a non-square image is cropped
/// rather than having its width and height swapped.
pub fn rotate_ccw(image: &RgbImage, degrees: i32) -> RgbImage {
    let square = image.width() == image.height();
    match degrees.rem_euclid(360) {
        0 => image.clone(),
        180 => imageops::rotate180(image),
        90 if square => imageops::rotate270(image),
        270 if square => imageops::rotate90(image),
        // imageproc rotates clockwise
        degrees => rotate_about_center(
            image,
            -(degrees as f32).to_radians(),
            Interpolation::Nearest,
            Rgb([0, 0, 0]),
        ),
    }
}

/// Applies rotate, mirror and invert in that order, then resizes to the panel.
pub fn prepare_image(image: DynamicImage, options: &ImageOptions) -> RgbImage {
    let mut rgb = image.to_rgb8();

    rgb = rotate_ccw(&rgb, options.rotate);
    if options.mirror {
        imageops::flip_horizontal_in_place(&mut rgb);
    }
    if options.invert {
        imageops::invert(&mut rgb);
    }

    match options.mode {
        FitMode::Scale => imageops::resize(&rgb, PANEL_SIZE, PANEL_SIZE, FilterType::Lanczos3),
        FitMode::Fit | FitMode::Cover => DynamicImage::ImageRgb8(rgb)
            .resize_to_fill(PANEL_SIZE, PANEL_SIZE, FilterType::CatmullRom)
            .to_rgb8(),
    }
}

pub fn load_image(path: &Path, options: &ImageOptions) -> Result<RgbImage> {
    let image = image::open(path)?;
    Ok(prepare_image(image, options))
}

/// PNG bytes ready to hand to the frame codec.
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    image.write_to(&mut cursor, ImageFormat::Png)?;
    Ok(cursor.into_inner())
}
