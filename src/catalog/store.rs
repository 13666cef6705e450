//! Inventory persistency stores.

use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::tools;

use super::inventory::{Inventory, InventoryDump, PartitionDef};

/// Include/exclude wildcard filter over entity names.
#[derive(Default)]
pub struct NameFilter {
    included: Option<Vec<Regex>>,
    excluded: Option<Vec<Regex>>,
}

impl NameFilter {

    pub fn new(included: Option<&[String]>, excluded: Option<&[String]>) -> Result<Self, Error> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, Error> {
            patterns.iter().map(|p| tools::wildcard_regex(p)).collect()
        };

        Ok(Self {
            included: included.map(compile).transpose()?,
            excluded: excluded.map(compile).transpose()?,
        })
    }

    pub fn accepts(&self, name: &str) -> bool {
        if let Some(included) = &self.included {
            if !included.iter().any(|re| re.is_match(name)) {
                return false;
            }
        }
        if let Some(excluded) = &self.excluded {
            if excluded.iter().any(|re| re.is_match(name)) {
                return false;
            }
        }
        true
    }
}

/// Entity filters applied while loading an inventory.
#[derive(Default)]
pub struct LoadFilters {
    pub groups: NameFilter,
    pub datasets: NameFilter,
    pub sites: NameFilter,
}

impl LoadFilters {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(
        mut self,
        included: Option<&[String]>,
        excluded: Option<&[String]>,
    ) -> Result<Self, Error> {
        self.groups = NameFilter::new(included, excluded)?;
        Ok(self)
    }

    pub fn datasets(
        mut self,
        included: Option<&[String]>,
        excluded: Option<&[String]>,
    ) -> Result<Self, Error> {
        self.datasets = NameFilter::new(included, excluded)?;
        Ok(self)
    }

    pub fn sites(
        mut self,
        included: Option<&[String]>,
        excluded: Option<&[String]>,
    ) -> Result<Self, Error> {
        self.sites = NameFilter::new(included, excluded)?;
        Ok(self)
    }
}

/// Interface the engine consumes to load and persist catalog state.
pub trait InventoryStore: Send {

    fn load_inventory(
        &self,
        partition_defs: Vec<PartitionDef>,
        filters: &LoadFilters,
    ) -> Result<Inventory, Error>;

    fn save_inventory(&self, inventory: &Inventory) -> Result<(), Error>;

    fn version(&self) -> Result<i64, Error>;
}

/// Construct a persistency store from a module name and its config.
pub fn instantiate(module: &str, config: &Value) -> Result<Box<dyn InventoryStore>, Error> {
    match module {
        "file" => Ok(Box::new(FileStore::new(config)?)),
        _ => bail!("unknown persistency module '{}'", module),
    }
}

#[derive(Deserialize)]
struct FileStoreConfig {
    path: String,
    #[serde(default)]
    readonly: bool,
}

/// Persistency store backed by a single JSON dump file.
pub struct FileStore {
    path: PathBuf,
    readonly: bool,
}

impl FileStore {

    pub fn new(config: &Value) -> Result<Self, Error> {
        let config: FileStoreConfig = serde_json::from_value(config.clone())
            .map_err(|err| format_err!("invalid file store config - {}", err))?;

        Ok(Self { path: PathBuf::from(config.path), readonly: config.readonly })
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.set_extension("lck");
        path
    }

    fn read_dump(&self) -> Result<InventoryDump, Error> {
        match tools::file_read_optional_string(&self.path)? {
            Some(contents) => serde_json::from_str(&contents)
                .map_err(|err| format_err!("corrupt inventory dump {:?} - {}", self.path, err)),
            None => Ok(InventoryDump::default()),
        }
    }
}

impl InventoryStore for FileStore {

    fn load_inventory(
        &self,
        partition_defs: Vec<PartitionDef>,
        filters: &LoadFilters,
    ) -> Result<Inventory, Error> {
        let _lock = tools::open_file_locked(self.lock_path(), 60)?;

        let dump = self.read_dump()?;
        let mut inventory = Inventory::new(partition_defs);
        inventory.load_dump(dump, filters)?;

        Ok(inventory)
    }

    fn save_inventory(&self, inventory: &Inventory) -> Result<(), Error> {
        if self.readonly {
            bail!("inventory store {:?} is read-only", self.path);
        }

        let _lock = tools::open_file_locked(self.lock_path(), 60)?;

        let mut dump = inventory.dump();
        dump.version = self.read_dump().map(|d| d.version).unwrap_or(0) + 1;

        let raw = serde_json::to_vec_pretty(&dump)?;
        tools::replace_file(&self.path, &raw, None)?;

        Ok(())
    }

    fn version(&self) -> Result<i64, Error> {
        let _lock = tools::open_file_locked(self.lock_path(), 60)?;
        Ok(self.read_dump()?.version)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::catalog::{CatalogEntity, Dataset, Group};

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::json!({
            "path": dir.path().join("inventory.json").to_str().unwrap(),
        });

        let store = FileStore::new(&config).unwrap();

        let mut inventory = Inventory::new(Vec::new());
        inventory.update(CatalogEntity::Group(Group::new("prod"))).unwrap();
        inventory
            .update(CatalogEntity::Dataset(Dataset::new("/prod/raw-2024")))
            .unwrap();

        store.save_inventory(&inventory).unwrap();
        assert_eq!(store.version().unwrap(), 1);

        store.save_inventory(&inventory).unwrap();
        assert_eq!(store.version().unwrap(), 2);

        let loaded = store
            .load_inventory(Vec::new(), &LoadFilters::default())
            .unwrap();
        assert!(loaded.groups.contains_key("prod"));
        assert!(loaded.datasets.contains_key("/prod/raw-2024"));
    }

    #[test]
    fn test_readonly_store_refuses_save() {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::json!({
            "path": dir.path().join("inventory.json").to_str().unwrap(),
            "readonly": true,
        });

        let store = FileStore::new(&config).unwrap();
        let inventory = Inventory::new(Vec::new());
        assert!(store.save_inventory(&inventory).is_err());
    }
}
