//! facegate-core: face enrollment and verification engine.
//!
//! Builds an encoding store from a labelled image corpus, resolves probe faces
//! against it by majority vote, and renders the decision onto the probe.
//! The bundled provider runs SCRFD detection and ArcFace embeddings on ONNX
//! Runtime; any other backend plugs in through [`EmbeddingProvider`].

pub mod alignment;
pub mod annotate;
pub mod config;
pub mod detector;
pub mod matcher;
pub mod onnx;
pub mod pipeline;
pub mod provider;
pub mod recognizer;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use annotate::Annotator;
pub use config::{default_model_dir, ConfigError, GateConfig};
pub use matcher::VoteMatcher;
pub use onnx::OnnxProvider;
pub use pipeline::{EnrollSummary, Gate, GateError, Recognition, SavedResults, Verification};
pub use provider::{EmbeddingProvider, ProviderError};
pub use store::{EncodingStore, RebuildReport, StoreError, StoreHandle};
pub use types::{BoundingBox, DetectionMode, Embedding, MatchResult, ResolvedLabel, UNKNOWN_LABEL};
