//! Draws detection boxes and identity captions onto a copy of the probe.

use crate::types::{BoundingBox, MatchResult};
use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

pub const BOUNDING_BOX_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const CAPTION_SCALE: f32 = 16.0;
// Caption cell size used when no font could be loaded.
const FALLBACK_GLYPH_WIDTH: u32 = 6;
const FALLBACK_GLYPH_HEIGHT: u32 = 11;

/// Checked in order when no font is configured.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
];

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("cannot read font {path}: {source}")]
    FontRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid font file {0}")]
    InvalidFont(String),
}

/// Renders [`MatchResult`]s as outlined boxes with filled captions.
pub struct Annotator {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Default for Annotator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Annotator {
    /// Without a font, captions are drawn as blank blocks sized for the label.
    pub fn new(font: Option<FontArc>) -> Self {
        Self {
            font,
            scale: PxScale::from(CAPTION_SCALE),
        }
    }

    pub fn from_font_file(path: &Path) -> Result<Self, AnnotateError> {
        let bytes = std::fs::read(path).map_err(|source| AnnotateError::FontRead {
            path: path.display().to_string(),
            source,
        })?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|_| AnnotateError::InvalidFont(path.display().to_string()))?;
        tracing::info!(path = %path.display(), "caption font loaded");
        Ok(Self::new(Some(font)))
    }

    /// Use `font_path` if given, otherwise the first system font that loads.
    pub fn discover(font_path: Option<&Path>) -> Result<Self, AnnotateError> {
        if let Some(path) = font_path {
            return Self::from_font_file(path);
        }
        for candidate in SYSTEM_FONT_CANDIDATES {
            let path = Path::new(candidate);
            if path.is_file() {
                match Self::from_font_file(path) {
                    Ok(annotator) => return Ok(annotator),
                    Err(err) => tracing::debug!(error = %err, "skipping system font"),
                }
            }
        }
        tracing::warn!("no caption font found; annotated images will carry blank captions");
        Ok(Self::new(None))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every face onto a copy of `image`.
    pub fn annotate(&self, image: &RgbImage, faces: &[MatchResult]) -> RgbImage {
        let mut canvas = image.clone();
        for face in faces {
            self.draw_face(&mut canvas, &face.bounding_box, face.label.as_str());
        }
        canvas
    }

    fn draw_face(&self, canvas: &mut RgbImage, bbox: &BoundingBox, label: &str) {
        let outline = Rect::at(bbox.left as i32, bbox.top as i32)
            .of_size(bbox.width().max(1), bbox.height().max(1));
        draw_hollow_rect_mut(canvas, outline, BOUNDING_BOX_COLOR);

        // Caption hangs below the box, anchored at its bottom-left corner.
        let (text_w, text_h) = self.caption_extent(label);
        let caption = Rect::at(bbox.left as i32, bbox.bottom as i32).of_size(text_w.max(1), text_h.max(1));
        draw_filled_rect_mut(canvas, caption, BOUNDING_BOX_COLOR);

        if let Some(font) = &self.font {
            draw_text_mut(
                canvas,
                TEXT_COLOR,
                bbox.left as i32,
                bbox.bottom as i32,
                self.scale,
                font,
                label,
            );
        }
    }

    /// Pixel extent of `text` as it will be rendered.
    pub fn caption_extent(&self, text: &str) -> (u32, u32) {
        match &self.font {
            Some(font) => text_size(self.scale, font, text),
            None => (
                FALLBACK_GLYPH_WIDTH * text.chars().count() as u32,
                FALLBACK_GLYPH_HEIGHT,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResolvedLabel;

    fn face_at(left: u32, top: u32, right: u32, bottom: u32, label: ResolvedLabel) -> MatchResult {
        MatchResult {
            index: 0,
            bounding_box: BoundingBox {
                top,
                right,
                bottom,
                left,
                confidence: 1.0,
                landmarks: None,
            },
            label,
            votes: 0,
        }
    }

    #[test]
    fn test_annotate_leaves_input_untouched() {
        let image = RgbImage::from_pixel(100, 100, Rgb([10, 20, 30]));
        let faces = [face_at(10, 10, 50, 50, ResolvedLabel::Known("Alice".into()))];
        let annotated = Annotator::new(None).annotate(&image, &faces);
        assert!(image.pixels().all(|p| *p == Rgb([10, 20, 30])));
        assert_ne!(annotated, image);
    }

    #[test]
    fn test_outline_is_hollow() {
        let image = RgbImage::new(100, 100);
        let faces = [face_at(10, 10, 50, 50, ResolvedLabel::Unknown)];
        let annotated = Annotator::new(None).annotate(&image, &faces);
        assert_eq!(*annotated.get_pixel(10, 10), BOUNDING_BOX_COLOR);
        assert_eq!(*annotated.get_pixel(49, 30), BOUNDING_BOX_COLOR);
        assert_eq!(*annotated.get_pixel(30, 30), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_caption_below_box() {
        let image = RgbImage::new(100, 100);
        let faces = [face_at(10, 10, 50, 50, ResolvedLabel::Unknown)];
        let annotator = Annotator::new(None);
        let (w, h) = annotator.caption_extent("Unknown");
        assert_eq!((w, h), (42, 11));

        let annotated = annotator.annotate(&image, &faces);
        assert_eq!(*annotated.get_pixel(10 + w - 1, 50 + h - 1), BOUNDING_BOX_COLOR);
        assert_eq!(*annotated.get_pixel(10 + w + 1, 55), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_caption_clipped_at_image_edge() {
        let image = RgbImage::new(40, 40);
        let faces = [face_at(0, 0, 40, 40, ResolvedLabel::Known("Bartholomew".into()))];
        let annotated = Annotator::new(None).annotate(&image, &faces);
        assert_eq!(annotated.dimensions(), (40, 40));
    }

    #[test]
    fn test_no_faces_returns_copy() {
        let image = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        assert_eq!(Annotator::new(None).annotate(&image, &[]), image);
    }

    #[test]
    fn test_missing_font_file_errors() {
        let err = Annotator::discover(Some(Path::new("/nonexistent/font.ttf"))).err().unwrap();
        assert!(matches!(err, AnnotateError::FontRead { .. }));
    }
}
