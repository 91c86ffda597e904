//! Enrollment and recognition pipelines.
//!
//! [`Gate`] owns the provider, the store handle and the annotator. Every
//! method takes `&self`, so one `Gate` can serve concurrent requests: provider
//! calls are serialized behind a mutex, store reads go through the cached
//! [`StoreHandle`].

use crate::annotate::{AnnotateError, Annotator};
use crate::config::GateConfig;
use crate::matcher::VoteMatcher;
use crate::provider::{self, EmbeddingProvider, ProviderError};
use crate::store::{EncodingStore, RebuildReport, StoreError, StoreHandle};
use crate::types::{DetectionMode, MatchResult};
use chrono::Local;
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
    #[error("annotator: {0}")]
    Annotate(#[from] AnnotateError),
    #[error("cannot write results to {path}: {reason}")]
    Results { path: PathBuf, reason: String },
    #[error("invalid identity label {0:?}")]
    InvalidLabel(String),
}

impl GateError {
    fn results(path: &Path, reason: impl ToString) -> Self {
        GateError::Results {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of one enrollment run.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollSummary {
    pub training_root: PathBuf,
    pub encodings_path: PathBuf,
    pub mode: DetectionMode,
    #[serde(flatten)]
    pub report: RebuildReport,
}

/// Annotated probe plus one result per detected face.
#[derive(Debug, Clone)]
pub struct Recognition {
    pub image: RgbImage,
    pub faces: Vec<MatchResult>,
}

impl Recognition {
    /// True when any face resolved to the enrolled identity `claimed`.
    pub fn verified_for(&self, claimed: &str) -> bool {
        self.faces.iter().any(|face| face.label.is(claimed))
    }
}

/// Recognition outcome judged against a claimed identity.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub claimed: String,
    pub verified: bool,
    pub faces: Vec<MatchResult>,
}

/// Files written by [`Gate::save_results`].
#[derive(Debug, Clone, Serialize)]
pub struct SavedResults {
    pub image: PathBuf,
    pub report: PathBuf,
}

#[derive(Serialize)]
struct ResultReport<'a> {
    probe: &'a Path,
    created_at: String,
    faces: &'a [MatchResult],
}

pub struct Gate<P> {
    provider: Mutex<P>,
    store: StoreHandle,
    annotator: Annotator,
    config: GateConfig,
}

impl<P: EmbeddingProvider> Gate<P> {
    /// Build a gate, loading the caption font named by the config (or a system font).
    pub fn new(provider: P, config: GateConfig) -> Result<Self, GateError> {
        let annotator = Annotator::discover(config.font_path.as_deref())?;
        Ok(Self::with_annotator(provider, config, annotator))
    }

    pub fn with_annotator(provider: P, config: GateConfig, annotator: Annotator) -> Self {
        Self {
            provider: Mutex::new(provider),
            store: StoreHandle::new(config.encodings_path.clone()),
            annotator,
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Rebuild the store from the configured training corpus.
    pub fn enroll(&self) -> Result<EnrollSummary, GateError> {
        self.enroll_from(&self.config.training_root, self.config.model)
    }

    /// Rebuild the store from `training_root` and atomically replace the persisted copy.
    pub fn enroll_from(&self, training_root: &Path, mode: DetectionMode) -> Result<EnrollSummary, GateError> {
        let (store, report) = {
            let mut provider = self.provider.lock().unwrap_or_else(PoisonError::into_inner);
            EncodingStore::rebuild(&mut *provider, training_root, mode)?
        };
        self.store.replace(store)?;

        Ok(EnrollSummary {
            training_root: training_root.to_path_buf(),
            encodings_path: self.store.path().to_path_buf(),
            mode,
            report,
        })
    }

    /// Detect, resolve and annotate every face in the probe at `probe_path`.
    ///
    /// A probe without faces yields an empty result list and the image as-is.
    pub fn recognize(&self, probe_path: &Path, mode: DetectionMode) -> Result<Recognition, GateError> {
        let store = self.store.current()?;
        let image = provider::load_image(probe_path)?;

        let faces: Vec<MatchResult> = {
            let mut provider = self.provider.lock().unwrap_or_else(PoisonError::into_inner);
            let detected = provider::faces_with_embeddings(&mut *provider, &image, mode)?;
            detected
                .into_iter()
                .enumerate()
                .map(|(index, (bounding_box, embedding))| {
                    let (label, votes) = VoteMatcher.resolve(&*provider, &embedding, &store);
                    MatchResult {
                        index,
                        bounding_box,
                        label,
                        votes,
                    }
                })
                .collect()
        };

        tracing::info!(
            probe = %probe_path.display(),
            %mode,
            faces = faces.len(),
            known = faces.iter().filter(|f| f.label.is_known()).count(),
            "probe recognized"
        );
        for face in &faces {
            tracing::debug!(index = face.index, label = %face.label, votes = face.votes, "face resolved");
        }

        let image = self.annotator.annotate(&image, &faces);
        Ok(Recognition { image, faces })
    }

    /// Recognize the probe and decide whether it shows `claimed`.
    ///
    /// With `archive_probes` set, the probe is archived before recognition, so
    /// attempts that fail to reach a decision are kept as well.
    pub fn verify(&self, probe_path: &Path, claimed: &str, mode: DetectionMode) -> Result<Verification, GateError> {
        self.record_attempt(probe_path, claimed)?;
        let recognition = self.recognize(probe_path, mode)?;
        Ok(self.conclude(claimed, recognition))
    }

    /// Archive the probe for `claimed` when `archive_probes` is enabled.
    pub fn record_attempt(&self, probe_path: &Path, claimed: &str) -> Result<Option<PathBuf>, GateError> {
        if !self.config.archive_probes {
            return Ok(None);
        }
        self.archive_probe(probe_path, claimed).map(Some)
    }

    /// Judge an existing recognition against `claimed`.
    pub fn conclude(&self, claimed: &str, recognition: Recognition) -> Verification {
        let verified = recognition.verified_for(claimed);
        tracing::info!(claimed, verified, "verification decided");

        Verification {
            claimed: claimed.to_string(),
            verified,
            faces: recognition.faces,
        }
    }

    /// Write the annotated image and a per-face JSON report under `results_root`.
    pub fn save_results(&self, probe_path: &Path, recognition: &Recognition) -> Result<SavedResults, GateError> {
        let root = &self.config.results_root;
        std::fs::create_dir_all(root).map_err(|e| GateError::results(root, e))?;

        let now = Local::now();
        let stem = probe_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "probe".to_string());
        let base = format!("{stem}-{}", now.format("%Y%m%d_%H%M%S%.3f"));

        let (image_path, image_file) = create_unique(root, &base)?;
        let mut writer = BufWriter::new(image_file);
        recognition
            .image
            .write_to(&mut writer, ImageFormat::Png)
            .map_err(|e| GateError::results(&image_path, e))?;
        writer.flush().map_err(|e| GateError::results(&image_path, e))?;

        let report_path = image_path.with_extension("json");
        let report = ResultReport {
            probe: probe_path,
            created_at: now.to_rfc3339(),
            faces: &recognition.faces,
        };
        let json = serde_json::to_vec_pretty(&report).map_err(|e| GateError::results(&report_path, e))?;
        std::fs::write(&report_path, json).map_err(|e| GateError::results(&report_path, e))?;

        tracing::info!(image = %image_path.display(), report = %report_path.display(), "results saved");
        Ok(SavedResults {
            image: image_path,
            report: report_path,
        })
    }

    /// Copy the probe to `results_root/validation/<claimed>/<timestamp>.<ext>`.
    pub fn archive_probe(&self, probe_path: &Path, claimed: &str) -> Result<PathBuf, GateError> {
        validate_label(claimed)?;
        let dir = self.config.results_root.join("validation").join(claimed);
        std::fs::create_dir_all(&dir).map_err(|e| GateError::results(&dir, e))?;

        let ext = probe_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "jpg".to_string());
        let dest = dir.join(format!("{}.{ext}", Local::now().format("%Y-%m-%d_%H-%M-%S%.3f")));
        std::fs::copy(probe_path, &dest).map_err(|e| GateError::results(&dest, e))?;

        tracing::debug!(dest = %dest.display(), "probe archived");
        Ok(dest)
    }
}

/// Claim `<root>/<base>.png`, or `<base>-1.png`, `<base>-2.png`, ... when taken.
///
/// The report shares the image's name, so claiming the image claims both.
fn create_unique(root: &Path, base: &str) -> Result<(PathBuf, File), GateError> {
    for attempt in 0u32.. {
        let name = match attempt {
            0 => format!("{base}.png"),
            n => format!("{base}-{n}.png"),
        };
        let path = root.join(name);
        match File::options().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(GateError::results(&path, e)),
        }
    }
    Err(GateError::results(root, "no free result name"))
}

/// A label must be a single, normal path component.
fn validate_label(label: &str) -> Result<(), GateError> {
    let mut components = Path::new(label).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !label.trim().is_empty() => Ok(()),
        _ => Err(GateError::InvalidLabel(label.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{solid_image, split_image, write_image, StubProvider};
    use crate::types::ResolvedLabel;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        gate: Gate<StubProvider>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let config = GateConfig {
            training_root: root.join("training"),
            encodings_path: root.join("output/encodings.json"),
            results_root: root.join("results"),
            ..GateConfig::default()
        };
        std::fs::create_dir_all(&config.training_root).unwrap();
        let gate = Gate::with_annotator(StubProvider::default(), config, Annotator::new(None));
        Fixture { _dir: dir, root, gate }
    }

    #[test]
    fn test_recognize_before_enroll_is_unavailable() {
        let f = fixture();
        let probe = write_image(&f.root, "probe.png", &solid_image([200, 0, 0]));
        let err = f.gate.recognize(&probe, DetectionMode::Fast).unwrap_err();
        assert!(matches!(err, GateError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn test_corrupt_store_is_unavailable() {
        let f = fixture();
        std::fs::create_dir_all(f.root.join("output")).unwrap();
        std::fs::write(f.root.join("output/encodings.json"), "{").unwrap();
        let probe = write_image(&f.root, "probe.png", &solid_image([200, 0, 0]));
        let err = f.gate.recognize(&probe, DetectionMode::Fast).unwrap_err();
        assert!(matches!(err, GateError::Store(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_empty_corpus_resolves_unknown() {
        let f = fixture();
        let summary = f.gate.enroll().unwrap();
        assert_eq!(summary.report.faces, 0);

        let probe = write_image(&f.root, "probe.png", &split_image([200, 0, 0], [0, 0, 200]));
        let recognition = f.gate.recognize(&probe, DetectionMode::Fast).unwrap();
        assert_eq!(recognition.faces.len(), 2);
        assert!(recognition.faces.iter().all(|face| face.label == ResolvedLabel::Unknown));
    }

    #[test]
    fn test_single_enrolled_image_recognizes_itself() {
        let f = fixture();
        let image = solid_image([30, 160, 90]);
        let training = write_image(&f.root, "training/Maria Souza/id.png", &image);
        f.gate.enroll().unwrap();

        let recognition = f.gate.recognize(&training, DetectionMode::Fast).unwrap();
        assert_eq!(recognition.faces.len(), 1);
        assert_eq!(recognition.faces[0].label, ResolvedLabel::Known("Maria Souza".into()));
        assert_eq!(recognition.faces[0].votes, 1);
        assert!(recognition.verified_for("Maria Souza"));
    }

    #[test]
    fn test_zero_face_probe_is_empty_success() {
        let f = fixture();
        write_image(&f.root, "training/Alice/1.png", &solid_image([200, 0, 0]));
        f.gate.enroll().unwrap();

        let blank = solid_image([0, 0, 0]);
        let probe = write_image(&f.root, "blank.png", &blank);
        let recognition = f.gate.recognize(&probe, DetectionMode::Fast).unwrap();
        assert!(recognition.faces.is_empty());
        assert_eq!(recognition.image, blank);
        assert!(!recognition.verified_for("Alice"));
    }

    #[test]
    fn test_each_face_resolved_independently() {
        let f = fixture();
        write_image(&f.root, "training/Alice/1.png", &solid_image([200, 0, 0]));
        write_image(&f.root, "training/Bob/1.png", &solid_image([0, 0, 200]));
        f.gate.enroll().unwrap();

        let probe = write_image(&f.root, "pair.png", &split_image([0, 0, 205], [0, 220, 0]));
        let recognition = f.gate.recognize(&probe, DetectionMode::Fast).unwrap();
        let labels: Vec<(usize, String)> = recognition
            .faces
            .iter()
            .map(|face| (face.index, face.label.to_string()))
            .collect();
        assert_eq!(labels, vec![(0, "Bob".to_string()), (1, "Unknown".to_string())]);
        assert!(recognition.verified_for("Bob"));
        assert!(!recognition.verified_for("Alice"));
        assert!(!recognition.verified_for("Unknown"));
    }

    #[test]
    fn test_verify_against_claimed_identity() {
        let f = fixture();
        write_image(&f.root, "training/Alice/1.png", &solid_image([200, 0, 0]));
        f.gate.enroll().unwrap();
        let probe = write_image(&f.root, "probe.png", &solid_image([198, 0, 0]));

        let ok = f.gate.verify(&probe, "Alice", DetectionMode::Fast).unwrap();
        assert!(ok.verified);
        let wrong = f.gate.verify(&probe, "Bob", DetectionMode::Fast).unwrap();
        assert!(!wrong.verified);
        assert_eq!(wrong.faces.len(), 1);
    }

    #[test]
    fn test_reenroll_invalidates_cache() {
        let f = fixture();
        write_image(&f.root, "training/Alice/1.png", &solid_image([200, 0, 0]));
        f.gate.enroll().unwrap();
        let probe = write_image(&f.root, "probe.png", &solid_image([0, 0, 200]));
        let before = f.gate.recognize(&probe, DetectionMode::Fast).unwrap();
        assert_eq!(before.faces[0].label, ResolvedLabel::Unknown);

        write_image(&f.root, "training/Bob/1.png", &solid_image([0, 0, 200]));
        f.gate.enroll().unwrap();
        let after = f.gate.recognize(&probe, DetectionMode::Fast).unwrap();
        assert_eq!(after.faces[0].label, ResolvedLabel::Known("Bob".into()));
    }

    #[test]
    fn test_unreadable_probe_is_provider_error() {
        let f = fixture();
        f.gate.enroll().unwrap();
        let probe = f.root.join("probe.png");
        std::fs::write(&probe, b"not an image").unwrap();
        let err = f.gate.recognize(&probe, DetectionMode::Fast).unwrap_err();
        assert!(matches!(err, GateError::Provider(ProviderError::ImageLoad { .. })));
    }

    #[test]
    fn test_save_results_per_face_report() {
        let f = fixture();
        write_image(&f.root, "training/Alice/1.png", &solid_image([200, 0, 0]));
        f.gate.enroll().unwrap();
        let probe = write_image(&f.root, "visit.png", &split_image([200, 0, 0], [0, 200, 0]));
        let recognition = f.gate.recognize(&probe, DetectionMode::Fast).unwrap();

        let saved = f.gate.save_results(&probe, &recognition).unwrap();
        assert!(saved.image.is_file());
        let report: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&saved.report).unwrap()).unwrap();
        let faces = report["faces"].as_array().unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0]["label"], "Alice");
        assert_eq!(faces[1]["label"], "Unknown");
        assert_eq!(faces[1]["index"], 1);
        assert_eq!(faces[1]["bounding_box"]["left"], 32);
    }

    #[test]
    fn test_archive_probe() {
        let f = fixture();
        let probe = write_image(&f.root, "upload.png", &solid_image([1, 2, 3]));
        let dest = f.gate.archive_probe(&probe, "Maria Souza").unwrap();
        assert!(dest.starts_with(f.root.join("results/validation/Maria Souza")));
        assert_eq!(dest.extension().unwrap(), "png");
        assert!(dest.is_file());

        assert!(matches!(
            f.gate.archive_probe(&probe, "../etc"),
            Err(GateError::InvalidLabel(_))
        ));
    }

    #[test]
    fn test_save_results_never_overwrites() {
        let f = fixture();
        let results = f.root.join("results");
        std::fs::create_dir_all(&results).unwrap();
        std::fs::write(results.join("visit-20240101_000000.000.png"), b"taken").unwrap();
        std::fs::write(results.join("visit-20240101_000000.000-1.png"), b"taken").unwrap();

        let (path, _) = create_unique(&results, "visit-20240101_000000.000").unwrap();
        assert_eq!(path, results.join("visit-20240101_000000.000-2.png"));
        assert_eq!(path.with_extension("json"), results.join("visit-20240101_000000.000-2.json"));
        assert_eq!(std::fs::read(results.join("visit-20240101_000000.000.png")).unwrap(), b"taken");
    }

    #[test]
    fn test_repeated_saves_get_distinct_files() {
        let f = fixture();
        write_image(&f.root, "training/Alice/1.png", &solid_image([200, 0, 0]));
        f.gate.enroll().unwrap();
        let probe = write_image(&f.root, "visit.png", &solid_image([200, 0, 0]));
        let recognition = f.gate.recognize(&probe, DetectionMode::Fast).unwrap();

        let first = f.gate.save_results(&probe, &recognition).unwrap();
        let second = f.gate.save_results(&probe, &recognition).unwrap();
        assert_ne!(first.image, second.image);
        assert_ne!(first.report, second.report);
        for path in [&first.image, &first.report, &second.image, &second.report] {
            assert!(path.is_file(), "{} missing", path.display());
        }
        image::open(&first.image).unwrap();
    }

    #[test]
    fn test_failed_verification_is_still_archived() {
        let mut f = fixture();
        f.gate.config.archive_probes = true;
        f.gate.enroll().unwrap();
        let probe = f.root.join("upload.png");
        std::fs::write(&probe, b"not an image").unwrap();

        let err = f.gate.verify(&probe, "Alice", DetectionMode::Fast).unwrap_err();
        assert!(matches!(err, GateError::Provider(ProviderError::ImageLoad { .. })));

        let archived: Vec<_> = std::fs::read_dir(f.root.join("results/validation/Alice"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn test_concurrent_recognition() {
        let f = fixture();
        write_image(&f.root, "training/Alice/1.png", &solid_image([200, 0, 0]));
        f.gate.enroll().unwrap();
        let probe = write_image(&f.root, "probe.png", &solid_image([200, 0, 0]));

        let gate = Arc::new(f.gate);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let probe = probe.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        let recognition = gate.recognize(&probe, DetectionMode::Fast).unwrap();
                        assert!(recognition.verified_for("Alice"));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
