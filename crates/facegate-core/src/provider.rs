//! Embedding provider seam.
//!
//! The gate never looks inside an embedding. Everything it knows about faces
//! comes through [`EmbeddingProvider`]: where they are, what they embed to,
//! and whether two embeddings belong to the same person.

use crate::detector::DetectorError;
use crate::recognizer::RecognizerError;
use crate::types::{BoundingBox, DetectionMode, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("cannot load image {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("provider returned {actual} embeddings for {expected} faces")]
    EmbeddingCount { expected: usize, actual: usize },
}

/// Face detection, embedding and comparison backend.
pub trait EmbeddingProvider {
    /// Locate every face in `image`.
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<Vec<BoundingBox>, ProviderError>;

    /// Embed each face in `faces`; output is parallel to the input.
    fn compute_embeddings(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError>;

    /// Match verdict of `probe` against every reference, parallel to `references`.
    ///
    /// The distance threshold is the provider's own and is not tunable per call.
    fn are_matching(&self, references: &[Embedding], probe: &Embedding) -> Vec<bool>;

    /// Identifier of the embedding model, recorded in the encoding store.
    fn model_version(&self) -> Option<&str> {
        None
    }
}

/// Detect and embed all faces in one call, enforcing the parallel-output contract.
pub fn faces_with_embeddings<P: EmbeddingProvider + ?Sized>(
    provider: &mut P,
    image: &RgbImage,
    mode: DetectionMode,
) -> Result<Vec<(BoundingBox, Embedding)>, ProviderError> {
    let faces = provider.detect_faces(image, mode)?;
    if faces.is_empty() {
        return Ok(Vec::new());
    }
    let embeddings = provider.compute_embeddings(image, &faces)?;
    if embeddings.len() != faces.len() {
        return Err(ProviderError::EmbeddingCount {
            expected: faces.len(),
            actual: embeddings.len(),
        });
    }
    Ok(faces.into_iter().zip(embeddings).collect())
}

/// Decode an image file into 8-bit RGB.
pub fn load_image(path: &Path) -> Result<RgbImage, ProviderError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| ProviderError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
}
