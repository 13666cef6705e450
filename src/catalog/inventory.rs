//! The inventory arena and the update/delete machinery.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::block::{Block, File};
use super::dataset::Dataset;
use super::group::Group;
use super::replica::{BlockReplica, DatasetReplica, FileRef, ReplicaId};
use super::site::{Site, SitePartition};
use super::store::LoadFilters;
use super::CatalogError;

/// Command kind produced by write-enabled workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateCommand {
    Update,
    Delete,
}

/// Typed entity payload of an update command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogEntity {
    Group(Group),
    Dataset(Dataset),
    Block(Block),
    File(File),
    Site(Site),
    DatasetReplica(DatasetReplica),
    BlockReplica(BlockReplica),
}

impl CatalogEntity {

    pub fn describe(&self) -> String {
        match self {
            CatalogEntity::Group(g) => format!("group {}", g.name),
            CatalogEntity::Dataset(d) => format!("dataset {}", d.name),
            CatalogEntity::Block(b) => format!("block {}", b.full_name()),
            CatalogEntity::File(f) => format!("file {}", f.lfn),
            CatalogEntity::Site(s) => format!("site {}", s.name),
            CatalogEntity::DatasetReplica(r) => {
                format!("dataset replica {} at {}", r.dataset, r.site)
            }
            CatalogEntity::BlockReplica(r) => {
                format!("block replica {} at {}", r.block, r.site)
            }
        }
    }
}

pub type CommandList = Vec<(UpdateCommand, CatalogEntity)>;

/// Definition of a site partition.
///
/// A definition without groups matches every replica and its entries use
/// the "all" sentinel; a group-scoped definition tracks explicit id sets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionDef {
    pub name: String,
    #[serde(default)]
    pub groups: Option<BTreeSet<String>>,
}

/// Serialized form of a full inventory, replayed entity by entity on load.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InventoryDump {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub sites: Vec<Site>,
    #[serde(default)]
    pub dataset_replicas: Vec<DatasetReplica>,
    #[serde(default)]
    pub block_replicas: Vec<BlockReplica>,
}

/// The in-memory catalog.
///
/// Datasets own blocks and files, sites own dataset replicas and
/// partitions. Block replicas live in a single slab; blocks, dataset
/// replicas and site partitions reference them by stable id, and all
/// three memberships are maintained together by `link`/`unlink`.
#[derive(Clone, Default)]
pub struct Inventory {
    pub groups: HashMap<String, Group>,
    pub datasets: HashMap<String, Dataset>,
    pub sites: HashMap<String, Site>,
    partition_defs: Vec<PartitionDef>,
    block_replicas: BTreeMap<ReplicaId, BlockReplica>,
    next_replica_id: ReplicaId,
    next_file_id: i64,
}

impl Inventory {

    pub fn new(mut partition_defs: Vec<PartitionDef>) -> Self {
        if partition_defs.is_empty() {
            partition_defs.push(PartitionDef { name: "global".to_string(), groups: None });
        }

        Self {
            groups: HashMap::new(),
            datasets: HashMap::new(),
            sites: HashMap::new(),
            partition_defs,
            block_replicas: BTreeMap::new(),
            next_replica_id: 1,
            next_file_id: 1,
        }
    }

    pub fn partition_defs(&self) -> &[PartitionDef] {
        &self.partition_defs
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&BlockReplica> {
        self.block_replicas.get(&id)
    }

    pub fn num_block_replicas(&self) -> usize {
        self.block_replicas.len()
    }

    pub fn find_block(&self, dataset: &str, block: &str) -> Option<&Block> {
        self.datasets.get(dataset).and_then(|d| d.blocks.get(block))
    }

    pub fn find_dataset_replica(&self, site: &str, dataset: &str) -> Option<&DatasetReplica> {
        self.sites.get(site).and_then(|s| s.dataset_replicas.get(dataset))
    }

    /// Replica of `block_full_name` at `site`, if any.
    pub fn find_replica(&self, block_full_name: &str, site: &str) -> Option<&BlockReplica> {
        self.find_replica_id(block_full_name, site)
            .and_then(|id| self.block_replicas.get(&id))
    }

    fn find_replica_id(&self, block_full_name: &str, site: &str) -> Option<ReplicaId> {
        let (dataset, block) = match Block::from_full_name(block_full_name) {
            Ok(names) => names,
            Err(_) => return None,
        };

        let block = self.datasets.get(&dataset)?.blocks.get(&block)?;
        block
            .replica_ids
            .iter()
            .copied()
            .find(|id| self.block_replicas.get(id).map_or(false, |r| r.site == site))
    }

    /// Upsert an entity by its identity key.
    ///
    /// Existing entities receive the mutable attributes of the incoming
    /// record through the per-type copy contract; new entities are
    /// embedded and linked into all indexes they participate in.
    pub fn update(&mut self, entity: CatalogEntity) -> Result<(), CatalogError> {
        match entity {
            CatalogEntity::Group(group) => {
                self.groups.entry(group.name.clone()).or_insert(group);
                Ok(())
            }
            CatalogEntity::Dataset(dataset) => self.embed_dataset(dataset),
            CatalogEntity::Block(block) => self.embed_block(block),
            CatalogEntity::File(file) => self.embed_file(file),
            CatalogEntity::Site(site) => self.embed_site(site),
            CatalogEntity::DatasetReplica(replica) => self.embed_dataset_replica(replica),
            CatalogEntity::BlockReplica(replica) => self.embed_block_replica(replica),
        }
    }

    /// Remove an entity and unlink it from every index it is part of.
    ///
    /// Removing something that is already gone is not an error; delete
    /// commands may race with cascading deletes of their parents.
    pub fn delete(&mut self, entity: &CatalogEntity) -> Result<(), CatalogError> {
        match entity {
            CatalogEntity::Group(group) => self.delete_group(&group.name),
            CatalogEntity::Dataset(dataset) => self.delete_dataset(&dataset.name),
            CatalogEntity::Block(block) => self.delete_block(&block.dataset, &block.name),
            CatalogEntity::File(file) => self.delete_file_entity(file),
            CatalogEntity::Site(site) => self.delete_site(&site.name),
            CatalogEntity::DatasetReplica(replica) => {
                self.delete_dataset_replica(&replica.site, &replica.dataset)
            }
            CatalogEntity::BlockReplica(replica) => {
                if let Some(id) = self.find_replica_id(&replica.block, &replica.site) {
                    self.unlink_replica(id)?;
                }
                Ok(())
            }
        }
    }

    /// Add a registered file to the replica of its block at `site`,
    /// applying the complete marker transitions.
    pub fn add_file_to_replica(&mut self, site: &str, lfn: &str) -> Result<(), CatalogError> {
        let (id, file) = self.locate_replica_file(site, lfn)?;
        let (dataset, block_name) = Block::from_full_name(&file.block)?;
        let block = self
            .datasets
            .get(&dataset)
            .and_then(|d| d.blocks.get(&block_name))
            .ok_or_else(|| CatalogError::unknown("block", &file.block))?;

        let replica = self.block_replicas.get_mut(&id).unwrap();
        replica.add_file(block, &file)
    }

    /// Remove a file from the replica of its block at `site`.
    pub fn delete_file_from_replica(&mut self, site: &str, lfn: &str) -> Result<(), CatalogError> {
        let (id, file) = self.locate_replica_file(site, lfn)?;
        let (dataset, block_name) = Block::from_full_name(&file.block)?;
        let block = self
            .datasets
            .get(&dataset)
            .and_then(|d| d.blocks.get(&block_name))
            .ok_or_else(|| CatalogError::unknown("block", &file.block))?;

        let replica = self.block_replicas.get_mut(&id).unwrap();
        replica.delete_file(block, &file)
    }

    fn locate_replica_file(&self, site: &str, lfn: &str) -> Result<(ReplicaId, File), CatalogError> {
        for dataset in self.datasets.values() {
            for block in dataset.blocks.values() {
                if let Some(file) = block.find_file(lfn) {
                    let id = self
                        .find_replica_id(&file.block, site)
                        .ok_or_else(|| CatalogError::unknown("block replica", &file.block))?;
                    return Ok((id, file.clone()));
                }
            }
        }
        Err(CatalogError::unknown("file", lfn))
    }

    fn embed_dataset(&mut self, dataset: Dataset) -> Result<(), CatalogError> {
        match self.datasets.get_mut(&dataset.name) {
            Some(existing) => existing.copy_from(&dataset),
            None => {
                let mut fresh = Dataset::new(&dataset.name);
                fresh.copy_from(&dataset)?;
                self.datasets.insert(dataset.name, fresh);
                Ok(())
            }
        }
    }

    fn embed_block(&mut self, block: Block) -> Result<(), CatalogError> {
        let dataset = self
            .datasets
            .get_mut(&block.dataset)
            .ok_or_else(|| CatalogError::unknown("dataset", &block.dataset))?;

        match dataset.blocks.get_mut(&block.name) {
            Some(existing) => existing.copy_from(&block),
            None => {
                let mut fresh = Block::new(&block.name, &block.dataset);
                fresh.copy_from(&block)?;
                dataset.blocks.insert(block.name, fresh);
                Ok(())
            }
        }
    }

    fn embed_file(&mut self, file: File) -> Result<(), CatalogError> {
        let (dataset_name, block_name) = Block::from_full_name(&file.block)?;

        let dataset = self
            .datasets
            .get_mut(&dataset_name)
            .ok_or_else(|| CatalogError::unknown("dataset", &dataset_name))?;
        let block = dataset
            .blocks
            .get_mut(&block_name)
            .ok_or_else(|| CatalogError::unknown("block", &file.block))?;

        let existing_id = block
            .files
            .values()
            .find(|f| f.lfn == file.lfn)
            .map(|f| f.id);

        match existing_id {
            Some(id) => {
                let existing = block.files.get_mut(&id).unwrap();
                let old_size = existing.size;
                existing.copy_from(&file)?;
                block.size = block.size + file.size - old_size;
            }
            None => {
                let mut file = file;
                if file.id == 0 {
                    file.id = self.next_file_id;
                    self.next_file_id += 1;
                } else if file.id >= self.next_file_id {
                    self.next_file_id = file.id + 1;
                }

                block.size += file.size;
                block.num_files += 1;
                block.files.insert(file.id, file);
            }
        }

        Ok(())
    }

    fn embed_site(&mut self, site: Site) -> Result<(), CatalogError> {
        match self.sites.get_mut(&site.name) {
            Some(existing) => existing.copy_from(&site),
            None => {
                let mut fresh = Site::new(&site.name);
                fresh.copy_from(&site)?;
                self.sites.insert(site.name, fresh);
                Ok(())
            }
        }
    }

    fn embed_dataset_replica(&mut self, replica: DatasetReplica) -> Result<(), CatalogError> {
        if !self.datasets.contains_key(&replica.dataset) {
            return Err(CatalogError::unknown("dataset", &replica.dataset));
        }

        let site = self
            .sites
            .get_mut(&replica.site)
            .ok_or_else(|| CatalogError::unknown("site", &replica.site))?;

        match site.dataset_replicas.get_mut(&replica.dataset) {
            Some(existing) => existing.copy_from(&replica),
            None => {
                let mut fresh = DatasetReplica::new(&replica.dataset, &replica.site);
                fresh.growing = replica.growing;
                site.dataset_replicas.insert(replica.dataset.clone(), fresh);

                self.datasets
                    .get_mut(&replica.dataset)
                    .unwrap()
                    .replica_sites
                    .insert(replica.site);

                Ok(())
            }
        }
    }

    fn embed_block_replica(&mut self, replica: BlockReplica) -> Result<(), CatalogError> {
        let (dataset_name, block_name) = Block::from_full_name(&replica.block)?;

        if !self.datasets.contains_key(&dataset_name) {
            return Err(CatalogError::unknown("dataset", &dataset_name));
        }
        if self.find_block(&dataset_name, &block_name).is_none() {
            return Err(CatalogError::unknown("block", &replica.block));
        }
        if !self.sites.contains_key(&replica.site) {
            return Err(CatalogError::unknown("site", &replica.site));
        }
        if let Some(group) = &replica.group {
            if !self.groups.contains_key(group) {
                return Err(CatalogError::unknown("group", group));
            }
        }

        let mut replica = replica;
        replica.file_ids =
            self.resolve_file_refs(&dataset_name, &block_name, replica.file_ids.take())?;

        match self.find_replica_id(&replica.block, &replica.site) {
            Some(id) => {
                let existing = self.block_replicas.get_mut(&id).unwrap();
                existing.copy_from(&replica)?;
                self.update_partitioning(id);
                Ok(())
            }
            None => self.link_replica(replica).map(|_| ()),
        }
    }

    fn resolve_file_refs(
        &self,
        dataset: &str,
        block: &str,
        refs: Option<BTreeSet<FileRef>>,
    ) -> Result<Option<BTreeSet<FileRef>>, CatalogError> {
        let refs = match refs {
            None => return Ok(None),
            Some(refs) => refs,
        };

        let block = self
            .find_block(dataset, block)
            .ok_or_else(|| CatalogError::unknown("block", block))?;

        let mut resolved = BTreeSet::new();
        for file_ref in refs {
            match file_ref {
                FileRef::Id(id) => {
                    resolved.insert(FileRef::Id(id));
                }
                FileRef::Lfn(lfn) => {
                    let file = block
                        .find_file(&lfn)
                        .ok_or_else(|| CatalogError::unknown("file", &lfn))?;
                    resolved.insert(FileRef::Id(file.id));
                }
            }
        }

        Ok(Some(resolved))
    }

    /// Insert a new replica into the slab and all three indexes.
    ///
    /// The dataset replica must exist; block replicas are always created
    /// inside an existing dataset replica.
    fn link_replica(&mut self, replica: BlockReplica) -> Result<ReplicaId, CatalogError> {
        let (dataset_name, _) = Block::from_full_name(&replica.block)?;

        let id = self.next_replica_id;

        {
            let site = self
                .sites
                .get_mut(&replica.site)
                .ok_or_else(|| CatalogError::unknown("site", &replica.site))?;

            let dataset_replica = site
                .dataset_replicas
                .get_mut(&dataset_name)
                .ok_or_else(|| CatalogError::unknown("dataset replica", &dataset_name))?;

            dataset_replica.block_replica_ids.insert(id);

            Self::add_to_partitions(
                site,
                &self.partition_defs,
                &dataset_name,
                id,
                replica.group.as_deref(),
            );
        }

        {
            let (_, block_name) = Block::from_full_name(&replica.block)?;
            let block = self
                .datasets
                .get_mut(&dataset_name)
                .and_then(|d| d.blocks.get_mut(&block_name))
                .ok_or_else(|| CatalogError::unknown("block", &replica.block))?;
            block.replica_ids.insert(id);
        }

        self.next_replica_id += 1;
        self.block_replicas.insert(id, replica);

        Ok(id)
    }

    /// Remove a replica from the slab and all three indexes.
    ///
    /// A dataset replica left empty and not growing is removed from its
    /// site and its dataset as part of the same unlink.
    fn unlink_replica(&mut self, id: ReplicaId) -> Result<BlockReplica, CatalogError> {
        let replica = self
            .block_replicas
            .remove(&id)
            .ok_or_else(|| CatalogError::unknown("block replica", &id.to_string()))?;

        let (dataset_name, block_name) = Block::from_full_name(&replica.block)?;

        let mut remove_dataset_replica = false;

        if let Some(site) = self.sites.get_mut(&replica.site) {
            Self::strip_from_partitions(site, &dataset_name, id);

            if let Some(dataset_replica) = site.dataset_replicas.get_mut(&dataset_name) {
                dataset_replica.block_replica_ids.remove(&id);
                if dataset_replica.block_replica_ids.is_empty() && !dataset_replica.growing {
                    remove_dataset_replica = true;
                }
            }

            if remove_dataset_replica {
                site.dataset_replicas.remove(&dataset_name);
                for partition in site.partitions.values_mut() {
                    partition.replicas.remove(&dataset_name);
                }
            }
        }

        if let Some(dataset) = self.datasets.get_mut(&dataset_name) {
            if let Some(block) = dataset.blocks.get_mut(&block_name) {
                block.replica_ids.remove(&id);
            }
            if remove_dataset_replica {
                dataset.replica_sites.remove(&replica.site);
            }
        }

        Ok(replica)
    }

    /// Re-evaluate partition membership after an in-place replica update.
    fn update_partitioning(&mut self, id: ReplicaId) {
        let (site_name, dataset_name, group) = match self.block_replicas.get(&id) {
            Some(replica) => {
                let dataset = match replica.dataset_name() {
                    Ok(name) => name,
                    Err(_) => return,
                };
                (replica.site.clone(), dataset, replica.group.clone())
            }
            None => return,
        };

        if let Some(site) = self.sites.get_mut(&site_name) {
            Self::strip_from_partitions(site, &dataset_name, id);
            Self::add_to_partitions(
                site,
                &self.partition_defs,
                &dataset_name,
                id,
                group.as_deref(),
            );
        }
    }

    fn add_to_partitions(
        site: &mut Site,
        defs: &[PartitionDef],
        dataset: &str,
        id: ReplicaId,
        group: Option<&str>,
    ) {
        for def in defs {
            let partition = site
                .partitions
                .entry(def.name.clone())
                .or_insert_with(|| SitePartition::new(&def.name));

            match &def.groups {
                None => {
                    partition.replicas.insert(dataset.to_string(), None);
                }
                Some(groups) => {
                    if !group.map_or(false, |g| groups.contains(g)) {
                        continue;
                    }
                    match partition
                        .replicas
                        .entry(dataset.to_string())
                        .or_insert_with(|| Some(BTreeSet::new()))
                    {
                        Some(ids) => {
                            ids.insert(id);
                        }
                        // the partition already contains all replicas
                        None => (),
                    }
                }
            }
        }
    }

    fn strip_from_partitions(site: &mut Site, dataset: &str, id: ReplicaId) {
        for partition in site.partitions.values_mut() {
            let remove_entry = match partition.replicas.get_mut(dataset) {
                // an "all" entry contains all replicas after a deletion too
                Some(None) => false,
                Some(Some(ids)) => {
                    ids.remove(&id);
                    ids.is_empty()
                }
                None => false,
            };

            if remove_entry {
                partition.replicas.remove(dataset);
            }
        }
    }

    fn delete_group(&mut self, name: &str) -> Result<(), CatalogError> {
        if self.groups.remove(name).is_none() {
            return Ok(());
        }

        // group references are non-owning; replicas fall back to the
        // anonymous group and leave group-scoped partitions
        let affected: Vec<ReplicaId> = self
            .block_replicas
            .iter()
            .filter(|(_, r)| r.group.as_deref() == Some(name))
            .map(|(id, _)| *id)
            .collect();

        for id in &affected {
            if let Some(replica) = self.block_replicas.get_mut(id) {
                replica.group = None;
            }
        }
        for id in affected {
            self.update_partitioning(id);
        }

        Ok(())
    }

    fn delete_dataset(&mut self, name: &str) -> Result<(), CatalogError> {
        let sites: Vec<String> = match self.datasets.get(name) {
            Some(dataset) => dataset.replica_sites.iter().cloned().collect(),
            None => return Ok(()),
        };

        for site in sites {
            self.delete_dataset_replica(&site, name)?;
        }

        self.datasets.remove(name);

        Ok(())
    }

    fn delete_block(&mut self, dataset: &str, name: &str) -> Result<(), CatalogError> {
        let ids: Vec<ReplicaId> = match self.find_block(dataset, name) {
            Some(block) => block.replica_ids.iter().copied().collect(),
            None => return Ok(()),
        };

        for id in ids {
            self.unlink_replica(id)?;
        }

        if let Some(dataset) = self.datasets.get_mut(dataset) {
            if let Some(block) = dataset.blocks.remove(name) {
                dataset.size = dataset.size.saturating_sub(block.size);
                dataset.num_files = dataset.num_files.saturating_sub(block.num_files);
            }
        }

        Ok(())
    }

    fn delete_file_entity(&mut self, file: &File) -> Result<(), CatalogError> {
        let (dataset_name, block_name) = Block::from_full_name(&file.block)?;

        let (file_id, file_size, replica_ids) = {
            let block = match self
                .datasets
                .get_mut(&dataset_name)
                .and_then(|d| d.blocks.get_mut(&block_name))
            {
                Some(block) => block,
                None => return Ok(()),
            };

            let file_id = match block.files.values().find(|f| f.lfn == file.lfn) {
                Some(existing) => existing.id,
                None => return Ok(()),
            };

            let removed = block.files.remove(&file_id).unwrap();
            block.size = block.size.saturating_sub(removed.size);
            block.num_files = block.num_files.saturating_sub(1);

            let ids: Vec<ReplicaId> = block.replica_ids.iter().copied().collect();
            (file_id, removed.size, ids)
        };

        // the file is gone from the block, so complete markers keep
        // covering the full (shrunk) file set; explicit sets drop the id
        for id in replica_ids {
            if let Some(replica) = self.block_replicas.get_mut(&id) {
                match replica.file_ids.as_mut() {
                    Some(ids) => {
                        if ids.remove(&FileRef::Id(file_id)) {
                            replica.size = replica.size.saturating_sub(file_size);
                        }
                    }
                    None => {
                        replica.size = replica.size.saturating_sub(file_size);
                    }
                }
            }
        }

        Ok(())
    }

    fn delete_site(&mut self, name: &str) -> Result<(), CatalogError> {
        let datasets: Vec<String> = match self.sites.get(name) {
            Some(site) => site.dataset_replicas.keys().cloned().collect(),
            None => return Ok(()),
        };

        for dataset in datasets {
            self.delete_dataset_replica(name, &dataset)?;
        }

        self.sites.remove(name);

        Ok(())
    }

    fn delete_dataset_replica(&mut self, site: &str, dataset: &str) -> Result<(), CatalogError> {
        let ids: Vec<ReplicaId> = match self
            .sites
            .get(site)
            .and_then(|s| s.dataset_replicas.get(dataset))
        {
            Some(replica) => replica.block_replica_ids.iter().copied().collect(),
            None => return Ok(()),
        };

        for id in ids {
            self.unlink_replica(id)?;
        }

        // unlink_replica leaves a growing dataset replica in place;
        // an explicit delete removes it regardless
        if let Some(site) = self.sites.get_mut(site) {
            site.dataset_replicas.remove(dataset);
            for partition in site.partitions.values_mut() {
                partition.replicas.remove(dataset);
            }
        }
        if let Some(dataset) = self.datasets.get_mut(dataset) {
            dataset.replica_sites.remove(site);
        }

        Ok(())
    }

    /// Serialize the full catalog as flat entity lists.
    pub fn dump(&self) -> InventoryDump {
        let mut dump = InventoryDump::default();

        let mut group_names: Vec<&String> = self.groups.keys().collect();
        group_names.sort();
        for name in group_names {
            dump.groups.push(self.groups[name].clone());
        }

        let mut dataset_names: Vec<&String> = self.datasets.keys().collect();
        dataset_names.sort();
        for name in dataset_names {
            let dataset = &self.datasets[name];
            dump.datasets.push(dataset.clone());

            let mut block_names: Vec<&String> = dataset.blocks.keys().collect();
            block_names.sort();
            for block_name in block_names {
                let block = &dataset.blocks[block_name];
                dump.blocks.push(block.clone());
                for file in block.files.values() {
                    dump.files.push(file.clone());
                }
            }
        }

        let mut site_names: Vec<&String> = self.sites.keys().collect();
        site_names.sort();
        for name in site_names {
            let site = &self.sites[name];
            dump.sites.push(site.clone());

            let mut replica_datasets: Vec<&String> = site.dataset_replicas.keys().collect();
            replica_datasets.sort();
            for dataset in replica_datasets {
                dump.dataset_replicas.push(site.dataset_replicas[dataset].clone());
            }
        }

        for replica in self.block_replicas.values() {
            dump.block_replicas.push(replica.clone());
        }

        dump
    }

    /// Replay a dump into this inventory, applying the load filters.
    ///
    /// Entities whose parents were filtered out are skipped silently.
    pub fn load_dump(&mut self, dump: InventoryDump, filters: &LoadFilters) -> Result<(), CatalogError> {
        for group in dump.groups {
            if filters.groups.accepts(&group.name) {
                self.update(CatalogEntity::Group(group))?;
            }
        }

        for dataset in dump.datasets {
            if filters.datasets.accepts(&dataset.name) {
                self.update(CatalogEntity::Dataset(dataset))?;
            }
        }

        for block in dump.blocks {
            if self.datasets.contains_key(&block.dataset) {
                self.update(CatalogEntity::Block(block))?;
            }
        }

        for file in dump.files {
            let (dataset, _) = Block::from_full_name(&file.block)?;
            if self.datasets.contains_key(&dataset) {
                self.update(CatalogEntity::File(file))?;
            }
        }

        for site in dump.sites {
            if filters.sites.accepts(&site.name) {
                self.update(CatalogEntity::Site(site))?;
            }
        }

        for replica in dump.dataset_replicas {
            if self.datasets.contains_key(&replica.dataset)
                && self.sites.contains_key(&replica.site)
            {
                self.update(CatalogEntity::DatasetReplica(replica))?;
            }
        }

        for replica in dump.block_replicas {
            let dataset = match replica.dataset_name() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if !self.datasets.contains_key(&dataset) || !self.sites.contains_key(&replica.site) {
                continue;
            }
            if let Some(group) = &replica.group {
                if !self.groups.contains_key(group) {
                    continue;
                }
            }
            self.update(CatalogEntity::BlockReplica(replica))?;
        }

        Ok(())
    }
}
