use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::block::Block;
use super::CatalogError;

/// A named collection of blocks, the unit the upstream catalog deals in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub is_valid: bool,
    pub is_open: bool,
    pub size: u64,
    pub num_files: u64,

    /// Owned blocks, keyed by short name.
    #[serde(skip)]
    pub blocks: HashMap<String, Block>,

    /// Sites holding a replica of this dataset.
    #[serde(skip)]
    pub replica_sites: BTreeSet<String>,
}

impl Dataset {

    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_valid: true,
            is_open: false,
            size: 0,
            num_files: 0,
            blocks: HashMap::new(),
            replica_sites: BTreeSet::new(),
        }
    }

    pub fn find_block(&self, name: &str) -> Option<&Block> {
        self.blocks.get(name)
    }

    /// Copy the mutable attributes of `other`. Identities must match.
    pub fn copy_from(&mut self, other: &Dataset) -> Result<(), CatalogError> {
        if self.name != other.name {
            return Err(CatalogError::IdentityMismatch {
                this: format!("dataset {}", self.name),
                other: format!("dataset {}", other.name),
            });
        }

        self.is_valid = other.is_valid;
        self.is_open = other.is_open;
        self.size = other.size;
        self.num_files = other.num_files;

        Ok(())
    }
}

impl PartialEq for Dataset {

    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.is_valid == other.is_valid
            && self.is_open == other.is_open
            && self.size == other.size
            && self.num_files == other.num_files
    }
}
