use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use once_cell::sync::OnceCell;
use rusttype::{Font, PositionedGlyph, Scale, point};

use crate::error::{Error, Result};

/// Environment variable naming a TTF/OTF file to use when none is given.
pub const FONT_ENV: &str = "BK_LIGHT_FONT";

/// Checked in order when neither an explicit font nor `BK_LIGHT_FONT` is set.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/noto/NotoSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

static DEFAULT_FONT: OnceCell<Font<'static>> = OnceCell::new();

/// Coverage above which a glyph pixel is painted at all.
const COVERAGE_FLOOR: f32 = 0.05;

pub fn load_font(path: &Path) -> Result<Font<'static>> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Font(format!("{}: {e}", path.display())))?;
    Font::try_from_vec(data)
        .ok_or_else(|| Error::Font(format!("{}: not a usable TrueType font", path.display())))
}

/// The font used when the caller doesn't name one. Loaded once.
pub fn default_font() -> Result<Font<'static>> {
    DEFAULT_FONT
        .get_or_try_init(|| {
            let candidate = std::env::var_os(FONT_ENV)
                .map(PathBuf::from)
                .or_else(|| {
                    SYSTEM_FONTS
                        .iter()
                        .map(PathBuf::from)
                        .find(|p| p.is_file())
                })
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "no font available: pass one explicitly or set {FONT_ENV}"
                    ))
                })?;
            load_font(&candidate)
        })
        .cloned()
}

/// Explicit path if given, otherwise [`default_font`].
pub fn resolve_font(path: Option<&Path>) -> Result<Font<'static>> {
    match path {
        Some(path) => load_font(path),
        None => default_font(),
    }
}

/// Splits on real newlines and on the two-character `\n` escape, which is
/// what a shell hands over for `"line one\nline two"`.
pub fn split_lines(text: &str) -> Vec<String> {
    text.replace("\\n", "\n")
        .split('\n')
        .map(str::to_owned)
        .collect()
}

fn line_width(font: &Font<'static>, line: &str, scale: Scale) -> f32 {
    font.layout(line, scale, point(0.0, 0.0))
        .last()
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .unwrap_or(0.0)
}

/// Draws `text` onto `canvas`, each line centred horizontally and the whole
/// block centred vertically. Glyph edges are blended into the background.
pub fn draw_text_centered(
    canvas: &mut RgbImage,
    text: &str,
    font: &Font<'static>,
    size: f32,
    spacing: u32,
    color: Rgb<u8>,
) {
    let scale = Scale::uniform(size);
    let v_metrics = font.v_metrics(scale);
    let line_height = (v_metrics.ascent - v_metrics.descent).ceil();
    let lines = split_lines(text);
    let block_height =
        lines.len() as f32 * line_height + lines.len().saturating_sub(1) as f32 * spacing as f32;

    let (width, height) = canvas.dimensions();
    let top = (height as f32 - block_height) / 2.0;

    for (idx, line) in lines.iter().enumerate() {
        let left = (width as f32 - line_width(font, line, scale)) / 2.0;
        let baseline = top + idx as f32 * (line_height + spacing as f32) + v_metrics.ascent;
        let glyphs: Vec<PositionedGlyph> =
            font.layout(line, scale, point(left, baseline)).collect();
        for glyph in glyphs {
            let Some(bb) = glyph.pixel_bounding_box() else {
                continue;
            };
            glyph.draw(|gx, gy, v| {
                let px = bb.min.x + gx as i32;
                let py = bb.min.y + gy as i32;
                if px < 0 || py < 0 || v <= COVERAGE_FLOOR {
                    return;
                }
                let (ux, uy) = (px as u32, py as u32);
                if ux >= width || uy >= height {
                    return;
                }
                let pixel = canvas.get_pixel_mut(ux, uy);
                *pixel = blend(*pixel, color, v.min(1.0));
            });
        }
    }
}

fn blend(under: Rgb<u8>, over: Rgb<u8>, alpha: f32) -> Rgb<u8> {
    let mix = |a: u8, b: u8| (a as f32 * (1.0 - alpha) + b as f32 * alpha).round() as u8;
    Rgb([
        mix(under[0], over[0]),
        mix(under[1], over[1]),
        mix(under[2], over[2]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaped_newlines_split_lines() {
        assert_eq!(split_lines("12\\n34"), vec!["12", "34"]);
        assert_eq!(split_lines("a\nb\\nc"), vec!["a", "b", "c"]);
        assert_eq!(split_lines("solo"), vec!["solo"]);
    }

    #[test]
    fn blend_endpoints() {
        let bg = Rgb([0, 0, 0]);
        let fg = Rgb([255, 0, 0]);
        assert_eq!(blend(bg, fg, 0.0), bg);
        assert_eq!(blend(bg, fg, 1.0), fg);
        assert_eq!(blend(bg, fg, 0.5), Rgb([128, 0, 0]));
    }

    #[test]
    fn missing_font_file_is_reported() {
        let err = load_font(Path::new("/definitely/not/here.ttf")).unwrap_err();
        assert!(matches!(err, Error::Font(_)));
    }
}
