use crate::types::DetectionMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Gate configuration.
///
/// Resolution order: `FACEGATE_*` environment variables, then the TOML file
/// named by `--config` or `FACEGATE_CONFIG`, then built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Detection mode used for enrollment and recognition.
    pub model: DetectionMode,
    /// Training corpus: one subdirectory per identity label.
    pub training_root: PathBuf,
    /// Encoding store blob.
    pub encodings_path: PathBuf,
    /// Where annotated probes and reports are written.
    pub results_root: PathBuf,
    /// Directory containing det_10g.onnx and w600k_r50.onnx.
    pub model_dir: PathBuf,
    /// Cosine similarity at or above which two faces match.
    pub match_threshold: f32,
    /// TrueType font for captions; a system font is tried when unset.
    pub font_path: Option<PathBuf>,
    /// Keep a copy of every verified probe under `results_root/validation/<label>/`.
    pub archive_probes: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            model: DetectionMode::Fast,
            training_root: PathBuf::from("training"),
            encodings_path: PathBuf::from("output/encodings.json"),
            results_root: PathBuf::from("results"),
            model_dir: default_model_dir(),
            match_threshold: 0.40,
            font_path: None,
            archive_probes: false,
        }
    }
}

impl GateConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FACEGATE_CONFIG").map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_toml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `FACEGATE_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("FACEGATE_MODEL") {
            self.model = v.parse().map_err(|reason| invalid("FACEGATE_MODEL", reason))?;
        }
        if let Some(v) = lookup("FACEGATE_TRAINING_ROOT") {
            self.training_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_ENCODINGS_PATH") {
            self.encodings_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_RESULTS_ROOT") {
            self.results_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_MATCH_THRESHOLD") {
            self.match_threshold = v
                .trim()
                .parse()
                .map_err(|e| invalid("FACEGATE_MATCH_THRESHOLD", format!("{e}")))?;
        }
        if let Some(v) = lookup("FACEGATE_FONT_PATH") {
            self.font_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACEGATE_ARCHIVE_PROBES") {
            self.archive_probes = v != "0";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.match_threshold) {
            return Err(invalid(
                "match_threshold",
                format!("{} is outside [-1, 1]", self.match_threshold),
            ));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate/models")
}
