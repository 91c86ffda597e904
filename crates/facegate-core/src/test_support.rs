//! Deterministic provider and image fixtures for tests.
//!
//! `StubProvider` treats every horizontal run of identical non-black pixels on
//! the middle row as one face, and embeds it as its RGB colour. Two faces
//! match when their colours are within `tolerance` of each other.

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::{BoundingBox, DetectionMode, Embedding};
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};

pub const FIXTURE_SIZE: u32 = 32;

pub struct StubProvider {
    pub tolerance: f32,
}

impl Default for StubProvider {
    fn default() -> Self {
        Self { tolerance: 30.0 }
    }
}

impl EmbeddingProvider for StubProvider {
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        _mode: DetectionMode,
    ) -> Result<Vec<BoundingBox>, ProviderError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }
        let row = height / 2;
        let mut faces = Vec::new();
        let mut x = 0;
        while x < width {
            let colour = *image.get_pixel(x, row);
            let start = x;
            while x < width && *image.get_pixel(x, row) == colour {
                x += 1;
            }
            if colour != Rgb([0, 0, 0]) {
                let mut face =
                    BoundingBox::from_corners(start as f32, 0.0, x as f32, height as f32, width, height);
                face.confidence = 1.0;
                faces.push(face);
            }
        }
        Ok(faces)
    }

    fn compute_embeddings(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError> {
        Ok(faces
            .iter()
            .map(|face| {
                let Rgb([r, g, b]) = *image.get_pixel(face.left, face.top + face.height() / 2);
                Embedding::new(vec![r as f32, g as f32, b as f32])
            })
            .collect())
    }

    fn are_matching(&self, references: &[Embedding], probe: &Embedding) -> Vec<bool> {
        references
            .iter()
            .map(|reference| reference.euclidean_distance(probe) <= self.tolerance)
            .collect()
    }

    fn model_version(&self) -> Option<&str> {
        Some("stub-rgb")
    }
}

pub fn solid_image(colour: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(FIXTURE_SIZE, FIXTURE_SIZE, Rgb(colour))
}

/// Two faces side by side.
pub fn split_image(left: [u8; 3], right: [u8; 3]) -> RgbImage {
    RgbImage::from_fn(FIXTURE_SIZE * 2, FIXTURE_SIZE, |x, _| {
        if x < FIXTURE_SIZE { Rgb(left) } else { Rgb(right) }
    })
}

/// Save `image` as PNG at `root/rel`, creating parent directories.
pub fn write_image(root: &Path, rel: &str, image: &RgbImage) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image.save(&path).unwrap();
    path
}
