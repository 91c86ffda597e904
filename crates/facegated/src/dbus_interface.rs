use crate::engine::{EngineError, EngineHandle};
use facegate_core::{StoreError, StoreHandle};
use serde::Serialize;
use std::path::PathBuf;
use zbus::interface;

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Gate1
/// Object path: /org/facegate/Gate1
///
/// Every method answers with a JSON document. A method error means the gate
/// could not reach a decision; it is never a negative verification.
pub struct GateService {
    engine: EngineHandle,
    store: StoreHandle,
}

impl GateService {
    pub fn new(engine: EngineHandle, encodings_path: PathBuf) -> Self {
        Self {
            engine,
            store: StoreHandle::new(encodings_path),
        }
    }
}

#[interface(name = "org.facegate.Gate1")]
impl GateService {
    /// Rebuild the encoding store from the training corpus.
    async fn enroll(&self) -> zbus::fdo::Result<String> {
        tracing::info!("enroll requested");
        let summary = self.engine.enroll().await.map_err(unavailable)?;
        to_json(&summary)
    }

    /// Label every face in the probe image at `probe_path`.
    async fn recognize(&self, probe_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(probe_path, "recognize requested");
        let result = self
            .engine
            .recognize(PathBuf::from(probe_path))
            .await
            .map_err(unavailable)?;
        to_json(&result)
    }

    /// Check whether the probe image at `probe_path` shows `claimed`.
    async fn verify(&self, claimed: &str, probe_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(claimed, probe_path, "verify requested");
        let verification = self
            .engine
            .verify(PathBuf::from(probe_path), claimed.to_string())
            .await
            .map_err(unavailable)?;
        to_json(&verification)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let enrolled = match self.store.current() {
            Ok(store) => serde_json::json!({
                "entries": store.len(),
                "labels": store.label_counts().len(),
                "model_version": store.model_version(),
            }),
            Err(StoreError::NotFound(_)) => serde_json::Value::Null,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "encodings_path": self.store.path(),
            "store": enrolled,
        })
        .to_string())
    }
}

fn unavailable(err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "request failed");
    zbus::fdo::Error::Failed(format!("verification unavailable: {err}"))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}
