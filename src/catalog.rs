//! In-memory catalog of datasets, blocks, sites, groups and placements.
//!
//! All entities live in one [Inventory] arena. Cross-references between
//! entities are name-keyed (datasets, blocks, sites, groups) or id-keyed
//! (block replicas), so entities serialize to self-contained records that
//! can travel over the worker update channel and the peer update boards.
//! Owned collections are rebuilt when a record is embedded and are never
//! part of the wire form.

use thiserror::Error;

pub mod block;
pub mod dataset;
pub mod group;
pub mod inventory;
pub mod replica;
pub mod site;
pub mod store;

pub use block::{Block, File};
pub use dataset::Dataset;
pub use group::Group;
pub use inventory::{CatalogEntity, CommandList, Inventory, PartitionDef, UpdateCommand};
pub use replica::{BlockReplica, DatasetReplica, FileRef, ReplicaId};
pub use site::{Site, SitePartition, SiteStatus, StorageType};
pub use store::{instantiate as instantiate_store, FileStore, InventoryStore, LoadFilters};

#[derive(Error, Debug)]
pub enum CatalogError {

    #[error("cannot copy {other} into {this}")]
    IdentityMismatch { this: String, other: String },

    #[error("unknown {kind} {name}")]
    UnknownEntity { kind: &'static str, name: String },

    #[error("file {lfn} not present in replica")]
    FileNotPresent { lfn: String },

    #[error("malformed block name '{0}'")]
    UnknownFormat(String),
}

impl CatalogError {

    pub fn unknown(kind: &'static str, name: &str) -> Self {
        CatalogError::UnknownEntity { kind, name: name.to_string() }
    }
}
