use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::replica::{DatasetReplica, ReplicaId};
use super::CatalogError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Disk,
    Mss,
    Buffer,
    Unknown,
}

impl StorageType {

    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "Disk" => StorageType::Disk,
            "MSS" => StorageType::Mss,
            "Buffer" => StorageType::Buffer,
            _ => StorageType::Unknown,
        }
    }
}

/// Operational state reported by the site status source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Ready,
    Waitroom,
    Morgue,
}

/// A named subset of a site's replicas used by policy evaluation.
///
/// Each entry maps a dataset (replica) to either `None`, meaning all of
/// its block replicas belong to the partition, or an explicit id set.
/// Empty explicit sets are never stored; the entry is removed instead.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SitePartition {
    pub name: String,

    #[serde(skip)]
    pub replicas: HashMap<String, Option<BTreeSet<ReplicaId>>>,
}

impl SitePartition {

    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), replicas: HashMap::new() }
    }

    pub fn contains(&self, dataset: &str, id: ReplicaId) -> bool {
        match self.replicas.get(dataset) {
            Some(None) => true,
            Some(Some(ids)) => ids.contains(&id),
            None => false,
        }
    }
}

/// A storage endpoint holding dataset replicas.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Site {
    pub name: String,
    pub host: String,
    pub storage_type: StorageType,
    pub backend: String,
    pub status: SiteStatus,

    #[serde(skip)]
    pub partitions: HashMap<String, SitePartition>,

    /// Owned dataset replicas, keyed by dataset name.
    #[serde(skip)]
    pub dataset_replicas: HashMap<String, DatasetReplica>,
}

impl Site {

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: String::new(),
            storage_type: StorageType::Unknown,
            backend: String::new(),
            status: SiteStatus::Ready,
            partitions: HashMap::new(),
            dataset_replicas: HashMap::new(),
        }
    }

    pub fn find_dataset_replica(&self, dataset: &str) -> Option<&DatasetReplica> {
        self.dataset_replicas.get(dataset)
    }

    pub fn copy_from(&mut self, other: &Site) -> Result<(), CatalogError> {
        if self.name != other.name {
            return Err(CatalogError::IdentityMismatch {
                this: format!("site {}", self.name),
                other: format!("site {}", other.name),
            });
        }

        self.host = other.host.clone();
        self.storage_type = other.storage_type;
        self.backend = other.backend.clone();
        self.status = other.status;

        Ok(())
    }
}

impl PartialEq for Site {

    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.host == other.host
            && self.storage_type == other.storage_type
            && self.backend == other.backend
            && self.status == other.status
    }
}
