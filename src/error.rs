use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the extraction, storage and binning stages.
///
/// Orchestration code wraps these in `anyhow` with extra context; the
/// variants carry enough detail to diagnose a provider format change
/// without re-running the fetch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config file not found: {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("market '{market}' not found in config ({missing})")]
    ConfigKey { market: String, missing: &'static str },

    #[error("malformed {field} at listing {index}: {raw:?}")]
    MalformedField {
        field: String,
        index: usize,
        raw: String,
    },

    #[error(
        "field count mismatch: {latitudes} latitudes, {longitudes} longitudes, {prices} prices, {areas} areas"
    )]
    FieldCountMismatch {
        latitudes: usize,
        longitudes: usize,
        prices: usize,
        areas: usize,
    },

    #[error("invalid extraction rule '{field}': {reason}")]
    InvalidRule { field: String, reason: String },

    #[error("failed to read table {}: {reason}", path.display())]
    StorageRead { path: PathBuf, reason: String },

    #[error("failed to write table {}: {reason}", path.display())]
    StorageWrite { path: PathBuf, reason: String },

    #[error(
        "table is locked by another run{}; remove {} if no run is active",
        .owner.map(|p| format!(" (pid {})", p)).unwrap_or_default(),
        .lock.display()
    )]
    TableLocked { lock: PathBuf, owner: Option<u32> },

    #[error("grid step must be positive and finite, got {0}")]
    InvalidStep(f64),

    #[error("cannot derive grid bounds from an empty table")]
    EmptyTable,

    #[error("invalid bounds: {0}")]
    InvalidBounds(String),

    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },
}
