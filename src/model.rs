//! Entity model: libraries, documents, chunks.
//!
//! Every mutable entity carries a monotonically advancing `version` (starts
//! at 1, bumped by exactly one per committed mutation) and UTC timestamps.
//! Only the service layer advances versions.

use crate::constants::{LSH_MAX_HYPERPLANES, LSH_MAX_TABLES};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Free-form key/value metadata attached to every entity.
pub type Metadata = HashMap<String, String>;

/// Index strategy selection for a library, also the wire format
/// (`{"type":"flat"}`, `{"type":"lsh",...}`, `{"type":"ivf",...}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexConfig {
    Flat,
    Lsh {
        num_tables: usize,
        hyperplanes_per_table: usize,
    },
    Ivf {
        num_centroids: usize,
        nprobe: usize,
    },
}

impl IndexConfig {
    /// Reject parameterizations the strategies cannot honour.
    pub fn validate(&self) -> Result<()> {
        match *self {
            IndexConfig::Flat => Ok(()),
            IndexConfig::Lsh {
                num_tables,
                hyperplanes_per_table,
            } => {
                if num_tables == 0 || num_tables > LSH_MAX_TABLES {
                    return Err(Error::validation(format!(
                        "lsh num_tables must be in 1..={}, got {}",
                        LSH_MAX_TABLES, num_tables
                    )));
                }
                if hyperplanes_per_table == 0 || hyperplanes_per_table > LSH_MAX_HYPERPLANES {
                    return Err(Error::validation(format!(
                        "lsh hyperplanes_per_table must be in 1..={}, got {}",
                        LSH_MAX_HYPERPLANES, hyperplanes_per_table
                    )));
                }
                Ok(())
            }
            IndexConfig::Ivf {
                num_centroids,
                nprobe,
            } => {
                if num_centroids == 0 {
                    return Err(Error::validation("ivf num_centroids must be positive"));
                }
                if nprobe == 0 || nprobe > num_centroids {
                    return Err(Error::validation(format!(
                        "ivf nprobe must be in 1..={}, got {}",
                        num_centroids, nprobe
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IndexConfig::Flat => "flat",
            IndexConfig::Lsh { .. } => "lsh",
            IndexConfig::Ivf { .. } => "ivf",
        }
    }
}

/// Top-level container with a fixed embedding dimension and a single index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub id: Uuid,
    pub name: String,
    /// Immutable after creation; every chunk embedding must match it.
    pub embedding_dim: usize,
    pub index_config: IndexConfig,
    #[serde(default)]
    pub metadata: Metadata,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Library {
    pub fn new(
        name: String,
        embedding_dim: usize,
        index_config: IndexConfig,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            embedding_dim,
            index_config,
            metadata,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Grouping of chunks within a library; carries no vector of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub library_id: Uuid,
    #[serde(default)]
    pub metadata: Metadata,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(library_id: Uuid, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            library_id,
            metadata,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The indexable unit: text plus an embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub library_id: Uuid,
    /// A chunk may belong directly to a library with no document.
    pub document_id: Option<Uuid>,
    /// Ordinal within its document. Sort key only, not enforced unique.
    pub position: u32,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        library_id: Uuid,
        document_id: Option<Uuid>,
        position: u32,
        text: String,
        embedding: Vec<f32>,
        metadata: Metadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            library_id,
            document_id,
            position,
            text,
            embedding,
            metadata,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Shared versioning hook used by the repositories' CAS primitive.
pub trait Versioned {
    fn id(&self) -> Uuid;
    fn version(&self) -> u64;
    /// Advance the version by one and refresh `updated_at`.
    fn bump(&mut self);
}

macro_rules! impl_versioned {
    ($ty:ty) => {
        impl Versioned for $ty {
            fn id(&self) -> Uuid {
                self.id
            }

            fn version(&self) -> u64 {
                self.version
            }

            fn bump(&mut self) {
                self.version += 1;
                self.updated_at = Utc::now();
            }
        }
    };
}

impl_versioned!(Library);
impl_versioned!(Document);
impl_versioned!(Chunk);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_config_wire_format() {
        let flat: IndexConfig = serde_json::from_str(r#"{"type":"flat"}"#).unwrap();
        assert_eq!(flat, IndexConfig::Flat);

        let lsh: IndexConfig =
            serde_json::from_str(r#"{"type":"lsh","num_tables":4,"hyperplanes_per_table":8}"#)
                .unwrap();
        assert_eq!(
            lsh,
            IndexConfig::Lsh {
                num_tables: 4,
                hyperplanes_per_table: 8
            }
        );

        let ivf: IndexConfig =
            serde_json::from_str(r#"{"type":"ivf","num_centroids":16,"nprobe":2}"#).unwrap();
        assert_eq!(
            ivf,
            IndexConfig::Ivf {
                num_centroids: 16,
                nprobe: 2
            }
        );
    }

    #[test]
    fn test_index_config_validation() {
        assert!(IndexConfig::Flat.validate().is_ok());
        assert!(IndexConfig::Lsh {
            num_tables: 0,
            hyperplanes_per_table: 8
        }
        .validate()
        .is_err());
        assert!(IndexConfig::Lsh {
            num_tables: 4,
            hyperplanes_per_table: 65
        }
        .validate()
        .is_err());
        assert!(IndexConfig::Ivf {
            num_centroids: 4,
            nprobe: 5
        }
        .validate()
        .is_err());
        assert!(IndexConfig::Ivf {
            num_centroids: 4,
            nprobe: 1
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_bump_advances_version_and_timestamp() {
        let mut lib = Library::new("test".into(), 3, IndexConfig::Flat, Metadata::new());
        let before = lib.updated_at;
        assert_eq!(lib.version, 1);

        lib.bump();
        assert_eq!(lib.version, 2);
        assert!(lib.updated_at >= before);
    }
}
