//! Central constants for vecbase configuration
//!
//! All tunables and string literals for paths, filenames, and configuration
//! should be defined here to avoid duplication and ensure consistency across
//! the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Name of the data directory in the user's home (default snapshot location)
pub const DATA_DIR_NAME: &str = ".vecbase";

/// Name of the JSON snapshot file within the data directory
pub const SNAPSHOT_FILE_NAME: &str = "snapshot.json";

/// Log directory name within the data directory
pub const LOG_DIR_NAME: &str = "logs";

/// Default log file name
pub const LOG_FILE_NAME: &str = "vecbase.log";

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8400";

/// Candidate oversampling factor for LSH search.
///
/// After hashing the query into every table, the union of matching buckets
/// must contain at least `k * LSH_OVERSAMPLE_FACTOR` candidates before exact
/// re-ranking; otherwise the Hamming-1 neighborhood of the query signature is
/// probed as well.
pub const LSH_OVERSAMPLE_FACTOR: usize = 4;

/// Absolute floor on the LSH candidate set size before re-ranking.
///
/// Small `k` would otherwise make the oversample target trivially
/// satisfiable by a single sparse bucket.
pub const LSH_MIN_CANDIDATES: usize = 32;

/// Maximum hash tables accepted in an LSH config.
pub const LSH_MAX_TABLES: usize = 64;

/// Maximum hyperplanes per table accepted in an LSH config.
/// A table signature is packed into a `u64`, so H may not exceed 64.
pub const LSH_MAX_HYPERPLANES: usize = 64;

/// Iteration cap for spherical k-means training in the IVF index.
pub const KMEANS_MAX_ITERS: usize = 20;

/// Fraction of the trained set size that post-train insertions may reach
/// before the next mutation folds a retrain into its critical section.
pub const IVF_DRIFT_THRESHOLD: f64 = 0.5;

/// Bounded retry count for service-internal CAS commits.
///
/// Client-supplied expected versions are never retried; a mismatch there is
/// surfaced to the caller as a conflict.
pub const MAX_CAS_RETRIES: usize = 3;

/// Default per-library lock acquisition timeout in milliseconds.
/// Acquisitions that exceed this surface as a `busy` error.
/// Override with the `VECBASE_LOCK_TIMEOUT_MS` environment variable.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Fixed seed for the RNG behind LSH hyperplane sampling and IVF k-means++
/// seeding. A fixed seed makes ANN top-k reproducible across process runs on
/// identical inputs.
pub const INDEX_RNG_SEED: u64 = 0x7ec5_ba5e;

/// Resolve the per-library lock acquisition timeout, honouring the
/// `VECBASE_LOCK_TIMEOUT_MS` override.
pub fn lock_timeout() -> Duration {
    let ms = std::env::var("VECBASE_LOCK_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_LOCK_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Get the default data directory (~/.vecbase/), creating it if needed.
///
/// Falls back to the current directory if the home directory cannot be
/// determined.
pub fn default_data_dir() -> anyhow::Result<PathBuf> {
    let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let data_dir = base.join(DATA_DIR_NAME);

    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            )
        })?;
    }

    Ok(data_dir)
}
