//! SCRFD + ArcFace [`EmbeddingProvider`].

use crate::config::GateConfig;
use crate::detector::FaceDetector;
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::recognizer::{FaceRecognizer, ARCFACE_MODEL_VERSION};
use crate::types::{BoundingBox, DetectionMode, Embedding};
use image::RgbImage;
use std::path::Path;

/// Two ArcFace embeddings match when their cosine similarity reaches `threshold`.
pub struct OnnxProvider {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    threshold: f32,
}

impl OnnxProvider {
    pub fn load(scrfd_path: &Path, arcface_path: &Path, threshold: f32) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(threshold, "ONNX embedding provider ready");
        Ok(Self {
            detector,
            recognizer,
            threshold,
        })
    }

    pub fn from_config(config: &GateConfig) -> Result<Self, ProviderError> {
        Self::load(
            &config.scrfd_model_path(),
            &config.arcface_model_path(),
            config.match_threshold,
        )
    }
}

impl EmbeddingProvider for OnnxProvider {
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<Vec<BoundingBox>, ProviderError> {
        Ok(self.detector.detect(image, mode)?)
    }

    fn compute_embeddings(
        &mut self,
        image: &RgbImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<Embedding>, ProviderError> {
        faces
            .iter()
            .map(|face| self.recognizer.extract(image, face).map_err(ProviderError::from))
            .collect()
    }

    fn are_matching(&self, references: &[Embedding], probe: &Embedding) -> Vec<bool> {
        references
            .iter()
            .map(|reference| reference.similarity(probe) >= self.threshold)
            .collect()
    }

    fn model_version(&self) -> Option<&str> {
        Some(ARCFACE_MODEL_VERSION)
    }
}
