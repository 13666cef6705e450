use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::replica::ReplicaId;
use super::CatalogError;

lazy_static! {
    static ref FULL_NAME_REGEX: Regex = Regex::new(r"^([^#]+)#(.+)$").unwrap();
}

/// A single logical file inside a block.
///
/// The id is 0 until the file is registered with an inventory, which
/// assigns the catalog-wide unique value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    pub lfn: String,
    pub size: u64,
    /// Full name of the owning block.
    pub block: String,
}

impl File {

    pub fn new(lfn: &str, block: &str, size: u64) -> Self {
        Self { id: 0, lfn: lfn.to_string(), size, block: block.to_string() }
    }

    pub fn copy_from(&mut self, other: &File) -> Result<(), CatalogError> {
        if self.lfn != other.lfn || self.block != other.block {
            return Err(CatalogError::IdentityMismatch {
                this: format!("file {}", self.lfn),
                other: format!("file {}", other.lfn),
            });
        }

        self.size = other.size;

        Ok(())
    }
}

/// A contiguous subdivision of a dataset, the unit of placement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    /// Name of the owning dataset.
    pub dataset: String,
    pub size: u64,
    pub num_files: u64,
    pub is_open: bool,

    /// Owned files, keyed by file id.
    #[serde(skip)]
    pub files: BTreeMap<i64, File>,

    /// Replicas of this block; the sites own the replica objects.
    #[serde(skip)]
    pub replica_ids: BTreeSet<ReplicaId>,
}

impl Block {

    pub fn new(name: &str, dataset: &str) -> Self {
        Self {
            name: name.to_string(),
            dataset: dataset.to_string(),
            size: 0,
            num_files: 0,
            is_open: false,
            files: BTreeMap::new(),
            replica_ids: BTreeSet::new(),
        }
    }

    /// `dataset#block`, the globally unique name.
    pub fn full_name(&self) -> String {
        format!("{}#{}", self.dataset, self.name)
    }

    /// Split a full name into dataset and block name.
    pub fn from_full_name(full_name: &str) -> Result<(String, String), CatalogError> {
        match FULL_NAME_REGEX.captures(full_name) {
            Some(caps) => Ok((caps[1].to_string(), caps[2].to_string())),
            None => Err(CatalogError::UnknownFormat(full_name.to_string())),
        }
    }

    pub fn find_file(&self, lfn: &str) -> Option<&File> {
        self.files.values().find(|f| f.lfn == lfn)
    }

    /// Ids of all registered files.
    pub fn file_ids(&self) -> BTreeSet<i64> {
        self.files.keys().copied().collect()
    }

    pub fn copy_from(&mut self, other: &Block) -> Result<(), CatalogError> {
        if self.name != other.name || self.dataset != other.dataset {
            return Err(CatalogError::IdentityMismatch {
                this: format!("block {}", self.full_name()),
                other: format!("block {}", other.full_name()),
            });
        }

        self.size = other.size;
        self.num_files = other.num_files;
        self.is_open = other.is_open;

        Ok(())
    }
}

impl PartialEq for Block {

    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.dataset == other.dataset
            && self.size == other.size
            && self.num_files == other.num_files
            && self.is_open == other.is_open
    }
}
