use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::block::{Block, File};
use super::CatalogError;

/// Stable index of a block replica in the inventory slab.
pub type ReplicaId = u64;

/// Reference to a file held by a replica.
///
/// Files that are registered with the inventory are referenced by id;
/// files a writer created but did not register yet travel as LFN
/// strings and are resolved when the replica is embedded.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileRef {
    Id(i64),
    Lfn(String),
}

/// All block replicas of one dataset at one site.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatasetReplica {
    pub dataset: String,
    pub site: String,
    /// A growing replica is kept around even when it holds no blocks.
    pub growing: bool,

    #[serde(skip)]
    pub block_replica_ids: BTreeSet<ReplicaId>,
}

impl DatasetReplica {

    pub fn new(dataset: &str, site: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            site: site.to_string(),
            growing: false,
            block_replica_ids: BTreeSet::new(),
        }
    }

    pub fn copy_from(&mut self, other: &DatasetReplica) -> Result<(), CatalogError> {
        if self.dataset != other.dataset || self.site != other.site {
            return Err(CatalogError::IdentityMismatch {
                this: format!("replica of {} at {}", self.dataset, self.site),
                other: format!("replica of {} at {}", other.dataset, other.site),
            });
        }

        self.growing = other.growing;

        Ok(())
    }
}

impl PartialEq for DatasetReplica {

    fn eq(&self, other: &Self) -> bool {
        self.dataset == other.dataset
            && self.site == other.site
            && self.growing == other.growing
    }
}

/// Placement of one block at one site under a group.
///
/// `file_ids == None` is the complete marker: the replica holds every
/// file of the block, now and as the block grows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockReplica {
    /// Full name of the replicated block.
    pub block: String,
    pub site: String,
    pub group: Option<String>,
    pub is_custodial: bool,
    pub size: u64,
    pub last_update: i64,
    pub file_ids: Option<BTreeSet<FileRef>>,
}

impl BlockReplica {

    /// A replica holding the complete block.
    pub fn new_complete(block: &Block, site: &str, group: Option<&str>) -> Self {
        Self {
            block: block.full_name(),
            site: site.to_string(),
            group: group.map(|g| g.to_string()),
            is_custodial: false,
            size: block.size,
            last_update: 0,
            file_ids: None,
        }
    }

    /// An empty replica, e.g. the target of a queued transfer.
    pub fn new_empty(block: &Block, site: &str, group: Option<&str>) -> Self {
        Self {
            block: block.full_name(),
            site: site.to_string(),
            group: group.map(|g| g.to_string()),
            is_custodial: false,
            size: 0,
            last_update: 0,
            file_ids: Some(BTreeSet::new()),
        }
    }

    pub fn is_complete(&self, block: &Block) -> bool {
        match &self.file_ids {
            None => true,
            Some(ids) => self.size == block.size && ids.len() as u64 == block.num_files,
        }
    }

    pub fn num_files(&self, block: &Block) -> u64 {
        match &self.file_ids {
            None => block.num_files,
            Some(ids) => ids.len() as u64,
        }
    }

    /// Record that `file` is now present at this replica.
    ///
    /// A complete replica stays complete; the marker covers the grown
    /// block, only the byte count is brought along. An explicit set that
    /// reaches the block's full file list collapses to the marker.
    pub fn add_file(&mut self, block: &Block, file: &File) -> Result<(), CatalogError> {
        if file.block != self.block {
            return Err(CatalogError::IdentityMismatch {
                this: format!("replica of {} at {}", self.block, self.site),
                other: format!("file {} of block {}", file.lfn, file.block),
            });
        }

        match self.file_ids.take() {
            None => {
                self.file_ids = None;
            }
            Some(mut ids) => {
                ids.insert(FileRef::Id(file.id));
                if ids.len() as u64 == block.num_files {
                    self.file_ids = None;
                } else {
                    self.file_ids = Some(ids);
                }
            }
        }

        self.size += file.size;

        Ok(())
    }

    /// Record that `file` is no longer present at this replica.
    ///
    /// A complete replica is first expanded into the explicit file list
    /// of the block. Removing a file that is not present fails.
    pub fn delete_file(&mut self, block: &Block, file: &File) -> Result<(), CatalogError> {
        if file.block != self.block {
            return Err(CatalogError::IdentityMismatch {
                this: format!("replica of {} at {}", self.block, self.site),
                other: format!("file {} of block {}", file.lfn, file.block),
            });
        }

        let mut ids = match self.file_ids.take() {
            None => block.file_ids().into_iter().map(FileRef::Id).collect::<BTreeSet<_>>(),
            Some(ids) => ids,
        };

        if !ids.remove(&FileRef::Id(file.id)) && !ids.remove(&FileRef::Lfn(file.lfn.clone())) {
            self.file_ids = Some(ids);
            return Err(CatalogError::FileNotPresent { lfn: file.lfn.clone() });
        }

        self.file_ids = Some(ids);
        self.size -= file.size;

        Ok(())
    }

    /// Copy the mutable attributes of `other`; block and site must match.
    pub fn copy_from(&mut self, other: &BlockReplica) -> Result<(), CatalogError> {
        if self.block != other.block || self.site != other.site {
            return Err(CatalogError::IdentityMismatch {
                this: format!("replica of {} at {}", self.block, self.site),
                other: format!("replica of {} at {}", other.block, other.site),
            });
        }

        self.group = other.group.clone();
        self.is_custodial = other.is_custodial;
        self.size = other.size;
        self.last_update = other.last_update;
        self.file_ids = other.file_ids.clone();

        Ok(())
    }

    pub fn dataset_name(&self) -> Result<String, CatalogError> {
        let (dataset, _) = Block::from_full_name(&self.block)?;
        Ok(dataset)
    }
}

impl std::fmt::Display for BlockReplica {

    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "BlockReplica {}:{} (group={}, size={}, last_update={})",
            self.site,
            self.block,
            self.group.as_deref().unwrap_or("None"),
            self.size,
            self.last_update,
        )
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn test_block() -> (Block, Vec<File>) {
        let mut block = Block::new("b001", "/prod/raw-2024");
        let mut files = Vec::new();
        for i in 1..=3i64 {
            let mut file = File::new(&format!("/store/f{}.dat", i), &block.full_name(), 100);
            file.id = i;
            block.files.insert(i, file.clone());
            files.push(file);
        }
        block.size = 300;
        block.num_files = 3;
        (block, files)
    }

    #[test]
    fn test_add_file_reaches_completion() {
        let (block, files) = test_block();

        let mut replica = BlockReplica::new_empty(&block, "T2_US_MIT", Some("prod"));
        replica.add_file(&block, &files[0]).unwrap();
        replica.add_file(&block, &files[1]).unwrap();
        assert!(!replica.is_complete(&block));
        assert_eq!(replica.num_files(&block), 2);

        replica.add_file(&block, &files[2]).unwrap();
        assert!(replica.file_ids.is_none());
        assert!(replica.is_complete(&block));
        assert_eq!(replica.size, block.size);
        assert_eq!(replica.num_files(&block), 3);
    }

    #[test]
    fn test_delete_file_expands_complete_marker() {
        let (block, files) = test_block();

        let mut replica = BlockReplica::new_complete(&block, "T2_US_MIT", None);
        replica.delete_file(&block, &files[1]).unwrap();

        let ids = replica.file_ids.as_ref().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&FileRef::Id(1)));
        assert!(!ids.contains(&FileRef::Id(2)));
        assert_eq!(replica.size, 200);

        match replica.delete_file(&block, &files[1]) {
            Err(CatalogError::FileNotPresent { .. }) => (),
            other => panic!("expected FileNotPresent, got {:?}", other),
        }
    }

    #[test]
    fn test_complete_replica_absorbs_new_file() {
        let (mut block, _) = test_block();

        let mut replica = BlockReplica::new_complete(&block, "T2_US_MIT", None);

        let mut file = File::new("/store/f4.dat", &block.full_name(), 50);
        file.id = 4;
        block.files.insert(4, file.clone());
        block.size += 50;
        block.num_files += 1;

        replica.add_file(&block, &file).unwrap();
        assert!(replica.file_ids.is_none());
        assert_eq!(replica.size, block.size);
    }

    #[test]
    fn test_copy_symmetry() {
        let (block, files) = test_block();

        let mut a = BlockReplica::new_empty(&block, "T2_US_MIT", Some("prod"));
        let mut b = BlockReplica::new_complete(&block, "T2_US_MIT", Some("analysis"));
        b.is_custodial = true;
        b.last_update = 1700000000;

        a.copy_from(&b).unwrap();
        assert_eq!(a, b);

        // file sets compare as sets
        let mut c = BlockReplica::new_empty(&block, "T2_US_MIT", None);
        let mut d = BlockReplica::new_empty(&block, "T2_US_MIT", None);
        c.add_file(&block, &files[0]).unwrap();
        c.add_file(&block, &files[1]).unwrap();
        d.add_file(&block, &files[1]).unwrap();
        d.add_file(&block, &files[0]).unwrap();
        assert_eq!(c, d);

        let other_site = BlockReplica::new_empty(&block, "T1_US_FNAL", None);
        match a.copy_from(&other_site) {
            Err(CatalogError::IdentityMismatch { .. }) => (),
            other => panic!("expected identity mismatch, got {:?}", other),
        }
    }
}
