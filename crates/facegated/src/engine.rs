use facegate_core::{
    EnrollSummary, Gate, GateConfig, GateError, MatchResult, OnnxProvider, ProviderError,
    SavedResults, Verification,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("{0}")]
    Gate(#[from] GateError),
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of a recognition request.
#[derive(Serialize)]
pub struct RecognizeResult {
    pub faces: Vec<MatchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<SavedResults>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        reply: oneshot::Sender<Result<EnrollSummary, EngineError>>,
    },
    Recognize {
        probe: PathBuf,
        reply: oneshot::Sender<Result<RecognizeResult, EngineError>>,
    },
    Verify {
        probe: PathBuf,
        claimed: String,
        reply: oneshot::Sender<Result<Verification, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Duration,
}

impl EngineHandle {
    /// Rebuild the encoding store from the configured training corpus.
    pub async fn enroll(&self) -> Result<EnrollSummary, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Enroll { reply }, rx).await
    }

    /// Label every face in the probe image.
    pub async fn recognize(&self, probe: PathBuf) -> Result<RecognizeResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Recognize { probe, reply }, rx).await
    }

    /// Decide whether the probe image shows `claimed`.
    pub async fn verify(&self, probe: PathBuf, claimed: String) -> Result<Verification, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Verify { probe, claimed, reply }, rx).await
    }

    async fn request<T>(
        &self,
        req: EngineRequest,
        rx: oneshot::Receiver<Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed)?,
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models up front so the daemon fails fast when they are
/// missing, then serves requests one at a time.
pub fn spawn_engine(
    config: GateConfig,
    timeout: Duration,
    save_results: bool,
) -> Result<EngineHandle, EngineError> {
    let provider = OnnxProvider::from_config(&config)?;
    let gate = Gate::new(provider, config)?;
    tracing::info!(
        encodings = %gate.config().encodings_path.display(),
        training = %gate.config().training_root.display(),
        mode = %gate.config().model,
        "gate ready"
    );

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { reply } => {
                        let _ = reply.send(gate.enroll().map_err(EngineError::from));
                    }
                    EngineRequest::Recognize { probe, reply } => {
                        let _ = reply.send(run_recognize(&gate, probe, save_results));
                    }
                    EngineRequest::Verify { probe, claimed, reply } => {
                        let result = gate
                            .verify(&probe, &claimed, gate.config().model)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, timeout })
}

fn run_recognize(
    gate: &Gate<OnnxProvider>,
    probe: PathBuf,
    save_results: bool,
) -> Result<RecognizeResult, EngineError> {
    let recognition = gate.recognize(&probe, gate.config().model)?;
    let saved = if save_results {
        Some(gate.save_results(&probe, &recognition)?)
    } else {
        None
    };
    Ok(RecognizeResult {
        faces: recognition.faces,
        saved,
    })
}
