//! Encoding store: labelled reference embeddings, persisted as one JSON blob.
//!
//! The store is only ever rebuilt wholesale from a training corpus laid out as
//! `<root>/<label>/<image>`. Saving writes a temp file next to the target and
//! renames it over the old blob, so readers see either the previous or the new
//! store in full.

use crate::provider::{self, EmbeddingProvider, ProviderError};
use crate::types::{DetectionMode, Embedding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("encoding store not found at {0}; run enrollment first")]
    NotFound(PathBuf),
    #[error("encoding store at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("training corpus not found: {0}")]
    CorpusNotFound(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot serialize encoding store: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Parallel `names` / `encodings` sequences; `names[i]` owns `encodings[i]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodingStore {
    names: Vec<String>,
    encodings: Vec<Embedding>,
    model_version: Option<String>,
}

/// On-disk envelope.
#[derive(Serialize, Deserialize)]
struct StoreFile {
    format_version: u32,
    #[serde(default)]
    model_version: Option<String>,
    checksum: String,
    names: Vec<String>,
    encodings: Vec<Vec<f32>>,
}

/// Counters from one corpus rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    /// Label directories visited.
    pub labels: usize,
    /// Images that decoded and went through detection.
    pub images: usize,
    /// Images skipped because they could not be read or embedded.
    pub skipped: usize,
    /// Embeddings added to the store.
    pub faces: usize,
}

impl EncodingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model_version(mut self, version: Option<String>) -> Self {
        self.model_version = version;
        self
    }

    pub fn push(&mut self, label: impl Into<String>, embedding: Embedding) {
        self.names.push(label.into());
        self.encodings.push(embedding);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn encodings(&self) -> &[Embedding] {
        &self.encodings
    }

    pub fn model_version(&self) -> Option<&str> {
        self.model_version.as_deref()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.names.iter().map(String::as_str).zip(self.encodings.iter())
    }

    /// Distinct labels with their embedding counts, in first-enrolled order.
    pub fn label_counts(&self) -> Vec<(&str, usize)> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for name in &self.names {
            match counts.iter_mut().find(|(label, _)| *label == name.as_str()) {
                Some((_, count)) => *count += 1,
                None => counts.push((name.as_str(), 1)),
            }
        }
        counts
    }

    /// Build a fresh store from every `<root>/<label>/<image>` file.
    ///
    /// Files are visited in file-name order and symlinks are followed. Hidden
    /// label directories and hidden files are ignored. An image that cannot be
    /// decoded or embedded is logged and skipped; images without faces add nothing.
    pub fn rebuild<P: EmbeddingProvider + ?Sized>(
        provider: &mut P,
        root: &Path,
        mode: DetectionMode,
    ) -> Result<(Self, RebuildReport), StoreError> {
        if !root.is_dir() {
            return Err(StoreError::CorpusNotFound(root.to_path_buf()));
        }

        let mut store = Self::new().with_model_version(provider.model_version().map(String::from));
        let mut report = RebuildReport::default();

        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(2)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "rebuild: cannot read corpus entry; skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            if entry.depth() == 1 {
                if entry.file_type().is_dir() {
                    report.labels += 1;
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(label) = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
            else {
                continue;
            };

            match embed_training_image(provider, entry.path(), mode) {
                Ok(embeddings) => {
                    report.images += 1;
                    tracing::debug!(
                        label = %label,
                        path = %entry.path().display(),
                        faces = embeddings.len(),
                        "rebuild: image processed"
                    );
                    for embedding in embeddings {
                        store.push(label.clone(), embedding);
                        report.faces += 1;
                    }
                }
                Err(err) => {
                    report.skipped += 1;
                    tracing::warn!(
                        label = %label,
                        path = %entry.path().display(),
                        error = %err,
                        "rebuild: skipping image"
                    );
                }
            }
        }

        tracing::info!(
            root = %root.display(),
            labels = report.labels,
            images = report.images,
            skipped = report.skipped,
            faces = report.faces,
            "encoding store rebuilt"
        );

        Ok((store, report))
    }

    /// Atomically replace the blob at `path` with this store.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

        let encodings: Vec<Vec<f32>> = self.encodings.iter().map(|e| e.values.clone()).collect();
        let file = StoreFile {
            format_version: STORE_FORMAT_VERSION,
            model_version: self.model_version.clone(),
            checksum: checksum(&self.names, &encodings),
            names: self.names.clone(),
            encodings,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &file)?;
            writer.flush().map_err(|e| StoreError::io(path, e))?;
        }
        tmp.as_file().sync_all().map_err(|e| StoreError::io(path, e))?;
        tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
        sync_dir(parent).map_err(|e| StoreError::io(parent, e))?;

        tracing::info!(path = %path.display(), entries = self.len(), "encoding store saved");
        Ok(())
    }

    /// Read and validate the blob at `path`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file: StoreFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
        if file.format_version != STORE_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {} (expected {STORE_FORMAT_VERSION})",
                file.format_version
            )));
        }
        if file.names.len() != file.encodings.len() {
            return Err(corrupt(format!(
                "{} names but {} encodings",
                file.names.len(),
                file.encodings.len()
            )));
        }
        if checksum(&file.names, &file.encodings) != file.checksum {
            return Err(corrupt("checksum mismatch".into()));
        }

        let encodings = file
            .encodings
            .into_iter()
            .map(|values| Embedding {
                values,
                model_version: file.model_version.clone(),
            })
            .collect();

        Ok(Self {
            names: file.names,
            encodings,
            model_version: file.model_version,
        })
    }
}

fn embed_training_image<P: EmbeddingProvider + ?Sized>(
    provider: &mut P,
    path: &Path,
    mode: DetectionMode,
) -> Result<Vec<Embedding>, ProviderError> {
    let image = provider::load_image(path)?;
    let faces = provider::faces_with_embeddings(provider, &image, mode)?;
    Ok(faces.into_iter().map(|(_, embedding)| embedding).collect())
}

/// Flush the directory entry so a completed rename survives a crash.
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    if cfg!(unix) {
        std::fs::File::open(dir)?.sync_all()?;
    }
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// SHA-256 over label bytes and raw float bits.
fn checksum(names: &[String], encodings: &[Vec<f32>]) -> String {
    let mut hasher = Sha256::new();
    for (name, values) in names.iter().zip(encodings) {
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update((values.len() as u64).to_le_bytes());
        for v in values {
            hasher.update(v.to_bits().to_le_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Identity of the blob on disk, used to notice rebuilds made elsewhere.
///
/// Every save renames a fresh temp file into place, so the inode changes on
/// each rebuild even when size and mtime do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl Fingerprint {
    fn of(path: &Path) -> Result<Self, StoreError> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(Self {
                modified: meta.modified().ok(),
                len: meta.len(),
                inode: inode(&meta),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}

struct CachedStore {
    store: Arc<EncodingStore>,
    fingerprint: Fingerprint,
}

/// Shared, cached access to the persisted store.
///
/// [`current`](Self::current) reloads whenever the blob on disk changed since
/// the last load; [`replace`](Self::replace) persists a rebuilt store and swaps
/// the cache in one step. Safe to share between threads.
pub struct StoreHandle {
    path: PathBuf,
    cache: RwLock<Option<CachedStore>>,
}

impl StoreHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The store as currently persisted.
    pub fn current(&self) -> Result<Arc<EncodingStore>, StoreError> {
        let fingerprint = match Fingerprint::of(&self.path) {
            Ok(fp) => fp,
            Err(err) => {
                self.invalidate();
                return Err(err);
            }
        };

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.as_ref() {
                if cached.fingerprint == fingerprint {
                    return Ok(Arc::clone(&cached.store));
                }
            }
        }

        let store = Arc::new(EncodingStore::load(&self.path)?);
        tracing::debug!(path = %self.path.display(), entries = store.len(), "encoding store loaded");

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        *cache = Some(CachedStore {
            store: Arc::clone(&store),
            fingerprint,
        });
        Ok(store)
    }

    /// Persist `store` and make it the cached copy.
    pub fn replace(&self, store: EncodingStore) -> Result<Arc<EncodingStore>, StoreError> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        store.save(&self.path)?;
        let store = Arc::new(store);
        *cache = Fingerprint::of(&self.path).ok().map(|fingerprint| CachedStore {
            store: Arc::clone(&store),
            fingerprint,
        });
        Ok(store)
    }

    /// Drop the cached copy; the next [`current`](Self::current) reads from disk.
    pub fn invalidate(&self) {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        *cache = None;
    }
}
