//! Upstream catalog sources.
//!
//! The engine populates a fresh catalog from two upstream services: the
//! dataset information service and the site information service. Both
//! are consumed through the traits below; the file-backed
//! implementations parse record dumps of those services.

use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use serde::Deserialize;
use serde_json::Value;

use crate::catalog::{
    Block, CatalogEntity, Dataset, Inventory, Site, SiteStatus, StorageType,
};
use crate::tools;

pub trait DatasetInfoSource {

    fn get_dataset(&self, name: &str) -> Result<Option<Dataset>, Error>;

    fn get_datasets(&self, names: &[String]) -> Result<Vec<Dataset>, Error>;

    /// All dataset names known to the service.
    fn get_dataset_names(&self) -> Result<Vec<String>, Error>;
}

pub trait SiteInfoSource {

    fn get_site(&self, name: &str) -> Result<Option<Site>, Error>;

    fn get_site_list(&self) -> Result<Vec<Site>, Error>;

    fn get_site_status(&self, name: &str) -> Result<SiteStatus, Error>;
}

/// Construct a dataset source from a module name and its config.
pub fn instantiate_dataset_source(
    module: &str,
    config: &Value,
) -> Result<Box<dyn DatasetInfoSource>, Error> {
    match module {
        "file" => Ok(Box::new(FileDatasetSource::new(config)?)),
        _ => bail!("unknown dataset source module '{}'", module),
    }
}

/// Construct a site source from a module name and its config.
pub fn instantiate_site_source(
    module: &str,
    config: &Value,
) -> Result<Box<dyn SiteInfoSource>, Error> {
    match module {
        "file" => Ok(Box::new(FileSiteSource::new(config)?)),
        _ => bail!("unknown site source module '{}'", module),
    }
}

#[derive(Deserialize)]
struct DatasetRecord {
    dataset: String,
    dataset_access_type: String,
}

#[derive(Deserialize)]
struct BlockRecord {
    dataset: String,
    block_name: String,
    block_size: u64,
    file_count: u64,
    open_for_writing: i64,
}

#[derive(Deserialize)]
struct SiteRecord {
    name: String,
    se: String,
    kind: String,
    technology: String,
}

#[derive(Default, Deserialize)]
struct SiteStatusRecord {
    #[serde(default)]
    waitroom: Vec<String>,
    #[serde(default)]
    morgue: Vec<String>,
}

#[derive(Deserialize)]
struct FileSourceConfig {
    path: String,
}

/// Dataset source reading service record dumps from a directory:
/// `datasets.json` with the dataset records, `blocks.json` with the
/// per-block summaries.
pub struct FileDatasetSource {
    path: PathBuf,
}

impl FileDatasetSource {

    pub fn new(config: &Value) -> Result<Self, Error> {
        let config: FileSourceConfig = serde_json::from_value(config.clone())
            .map_err(|err| format_err!("invalid dataset source config - {}", err))?;
        Ok(Self { path: PathBuf::from(config.path) })
    }

    fn read_records<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, Error> {
        let path = self.path.join(name);
        match tools::file_read_optional_string(&path)? {
            Some(contents) => serde_json::from_str(&contents)
                .map_err(|err| format_err!("corrupt source dump {:?} - {}", path, err)),
            None => Ok(Vec::new()),
        }
    }

    fn construct_dataset(
        &self,
        record: &DatasetRecord,
        blocks: &[BlockRecord],
    ) -> Dataset {
        let mut dataset = Dataset::new(&record.dataset);
        dataset.is_valid = record.dataset_access_type == "VALID";

        for block_record in blocks {
            if block_record.dataset != record.dataset {
                continue;
            }

            // service block names carry the dataset prefix
            let block_name = block_record
                .block_name
                .trim_start_matches(&format!("{}#", dataset.name))
                .to_string();

            let mut block = Block::new(&block_name, &dataset.name);
            block.size = block_record.block_size;
            block.num_files = block_record.file_count;
            block.is_open = block_record.open_for_writing == 1;
            if block.is_open {
                dataset.is_open = true;
            }

            dataset.blocks.insert(block_name, block);
        }

        dataset.size = dataset.blocks.values().map(|b| b.size).sum();
        dataset.num_files = dataset.blocks.values().map(|b| b.num_files).sum();

        dataset
    }
}

impl DatasetInfoSource for FileDatasetSource {

    fn get_dataset(&self, name: &str) -> Result<Option<Dataset>, Error> {
        let records: Vec<DatasetRecord> = self.read_records("datasets.json")?;
        let record = match records.iter().find(|r| r.dataset == name) {
            Some(record) => record,
            None => {
                log::warn!("dataset {} not found on record", name);
                return Ok(None);
            }
        };

        let blocks: Vec<BlockRecord> = self.read_records("blocks.json")?;
        Ok(Some(self.construct_dataset(record, &blocks)))
    }

    fn get_datasets(&self, names: &[String]) -> Result<Vec<Dataset>, Error> {
        let records: Vec<DatasetRecord> = self.read_records("datasets.json")?;
        let blocks: Vec<BlockRecord> = self.read_records("blocks.json")?;

        Ok(records
            .iter()
            .filter(|r| names.contains(&r.dataset))
            .map(|r| self.construct_dataset(r, &blocks))
            .collect())
    }

    fn get_dataset_names(&self) -> Result<Vec<String>, Error> {
        let records: Vec<DatasetRecord> = self.read_records("datasets.json")?;
        Ok(records.into_iter().map(|r| r.dataset).collect())
    }
}

/// Site source reading `sites.json` (service node records) and the
/// optional `site_status.json` (waitroom/morgue lists); sites can be
/// narrowed with include/exclude wildcard patterns.
pub struct FileSiteSource {
    path: PathBuf,
    include: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
}

impl FileSiteSource {

    pub fn new(config: &Value) -> Result<Self, Error> {
        #[derive(Deserialize)]
        struct SiteSourceConfig {
            path: String,
            #[serde(default)]
            include: Option<Vec<String>>,
            #[serde(default)]
            exclude: Option<Vec<String>>,
        }

        let config: SiteSourceConfig = serde_json::from_value(config.clone())
            .map_err(|err| format_err!("invalid site source config - {}", err))?;

        Ok(Self {
            path: PathBuf::from(config.path),
            include: config.include,
            exclude: config.exclude,
        })
    }

    fn matches(patterns: &[String], name: &str) -> bool {
        patterns
            .iter()
            .any(|p| tools::wildcard_regex(p).map(|re| re.is_match(name)).unwrap_or(false))
    }

    fn selected(&self, name: &str) -> bool {
        if let Some(include) = &self.include {
            if !Self::matches(include, name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if Self::matches(exclude, name) {
                log::info!("site {} is excluded by configuration", name);
                return false;
            }
        }
        true
    }

    fn read_sites(&self) -> Result<Vec<SiteRecord>, Error> {
        let path = self.path.join("sites.json");
        match tools::file_read_optional_string(&path)? {
            Some(contents) => serde_json::from_str(&contents)
                .map_err(|err| format_err!("corrupt source dump {:?} - {}", path, err)),
            None => Ok(Vec::new()),
        }
    }

    fn construct_site(record: &SiteRecord) -> Site {
        let mut site = Site::new(&record.name);
        site.host = record.se.clone();
        site.storage_type = StorageType::from_kind(&record.kind);
        site.backend = record.technology.clone();
        site
    }
}

impl SiteInfoSource for FileSiteSource {

    fn get_site(&self, name: &str) -> Result<Option<Site>, Error> {
        if !self.selected(name) {
            return Ok(None);
        }

        Ok(self
            .read_sites()?
            .iter()
            .find(|r| r.name == name)
            .map(Self::construct_site))
    }

    fn get_site_list(&self) -> Result<Vec<Site>, Error> {
        Ok(self
            .read_sites()?
            .iter()
            .filter(|r| self.selected(&r.name))
            .map(Self::construct_site)
            .collect())
    }

    fn get_site_status(&self, name: &str) -> Result<SiteStatus, Error> {
        let path = self.path.join("site_status.json");
        let record: SiteStatusRecord = match tools::file_read_optional_string(&path)? {
            Some(contents) => serde_json::from_str(&contents)
                .map_err(|err| format_err!("corrupt source dump {:?} - {}", path, err))?,
            None => SiteStatusRecord::default(),
        };

        if record.waitroom.iter().any(|s| s == name) {
            Ok(SiteStatus::Waitroom)
        } else if record.morgue.iter().any(|s| s == name) {
            Ok(SiteStatus::Morgue)
        } else {
            Ok(SiteStatus::Ready)
        }
    }
}

/// Populate a fresh catalog from the upstream sources.
pub fn populate(
    inventory: &mut Inventory,
    sites: &dyn SiteInfoSource,
    datasets: &dyn DatasetInfoSource,
    dataset_names: &[String],
) -> Result<(), Error> {
    for mut site in sites.get_site_list()? {
        site.status = sites.get_site_status(&site.name)?;
        inventory.update(CatalogEntity::Site(site))?;
    }

    for dataset in datasets.get_datasets(dataset_names)? {
        let blocks: Vec<Block> = dataset.blocks.values().cloned().collect();
        inventory.update(CatalogEntity::Dataset(dataset))?;
        for block in blocks {
            inventory.update(CatalogEntity::Block(block))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;

    fn write_dumps(dir: &tempfile::TempDir) {
        let datasets = serde_json::json!([
            { "dataset": "/prod/raw-2024", "dataset_access_type": "VALID" },
            { "dataset": "/prod/old-2019", "dataset_access_type": "DEPRECATED" },
        ]);
        std::fs::write(
            dir.path().join("datasets.json"),
            serde_json::to_vec(&datasets).unwrap(),
        )
        .unwrap();

        let blocks = serde_json::json!([
            {
                "dataset": "/prod/raw-2024",
                "block_name": "/prod/raw-2024#b001",
                "block_size": 200,
                "file_count": 2,
                "open_for_writing": 0,
            },
            {
                "dataset": "/prod/raw-2024",
                "block_name": "/prod/raw-2024#b002",
                "block_size": 100,
                "file_count": 1,
                "open_for_writing": 1,
            },
        ]);
        std::fs::write(
            dir.path().join("blocks.json"),
            serde_json::to_vec(&blocks).unwrap(),
        )
        .unwrap();

        let sites = serde_json::json!([
            { "name": "T2_US_MIT", "se": "se.mit.example.org", "kind": "Disk", "technology": "dcache" },
            { "name": "T1_US_FNAL", "se": "se.fnal.example.org", "kind": "MSS", "technology": "enstore" },
            { "name": "T3_US_TEST", "se": "se.test.example.org", "kind": "Disk", "technology": "hadoop" },
        ]);
        std::fs::write(
            dir.path().join("sites.json"),
            serde_json::to_vec(&sites).unwrap(),
        )
        .unwrap();

        let status = serde_json::json!({ "waitroom": ["T1_US_FNAL"], "morgue": [] });
        std::fs::write(
            dir.path().join("site_status.json"),
            serde_json::to_vec(&status).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_dataset_construction() {
        let dir = tempfile::tempdir().unwrap();
        write_dumps(&dir);

        let config = serde_json::json!({ "path": dir.path().to_str().unwrap() });
        let source = FileDatasetSource::new(&config).unwrap();

        let dataset = source.get_dataset("/prod/raw-2024").unwrap().unwrap();
        assert!(dataset.is_valid);
        assert!(dataset.is_open);
        assert_eq!(dataset.size, 300);
        assert_eq!(dataset.num_files, 3);
        assert_eq!(dataset.blocks.len(), 2);
        assert!(dataset.blocks.contains_key("b001"));

        let old = source.get_dataset("/prod/old-2019").unwrap().unwrap();
        assert!(!old.is_valid);

        assert!(source.get_dataset("/prod/missing").unwrap().is_none());

        let names = source.get_dataset_names().unwrap();
        assert_eq!(names, vec!["/prod/raw-2024", "/prod/old-2019"]);
    }

    #[test]
    fn test_site_filters_and_status() {
        let dir = tempfile::tempdir().unwrap();
        write_dumps(&dir);

        let config = serde_json::json!({
            "path": dir.path().to_str().unwrap(),
            "exclude": ["T3_*"],
        });
        let source = FileSiteSource::new(&config).unwrap();

        let sites = source.get_site_list().unwrap();
        let names: Vec<&str> = sites.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["T2_US_MIT", "T1_US_FNAL"]);

        let site = source.get_site("T2_US_MIT").unwrap().unwrap();
        assert_eq!(site.storage_type, StorageType::Disk);
        assert_eq!(site.backend, "dcache");

        assert!(source.get_site("T3_US_TEST").unwrap().is_none());

        assert_eq!(
            source.get_site_status("T1_US_FNAL").unwrap(),
            SiteStatus::Waitroom,
        );
        assert_eq!(
            source.get_site_status("T2_US_MIT").unwrap(),
            SiteStatus::Ready,
        );
    }

    #[test]
    fn test_populate_fills_inventory() {
        let dir = tempfile::tempdir().unwrap();
        write_dumps(&dir);

        let config = serde_json::json!({ "path": dir.path().to_str().unwrap() });
        let site_source = FileSiteSource::new(&config).unwrap();
        let dataset_source = FileDatasetSource::new(&config).unwrap();

        let mut inventory = Inventory::new(Vec::new());
        populate(
            &mut inventory,
            &site_source,
            &dataset_source,
            &["/prod/raw-2024".to_string()],
        )
        .unwrap();

        assert_eq!(inventory.sites.len(), 3);
        assert_eq!(inventory.sites["T1_US_FNAL"].status, SiteStatus::Waitroom);
        assert!(inventory.find_block("/prod/raw-2024", "b002").is_some());
        assert_eq!(inventory.datasets["/prod/raw-2024"].size, 300);
    }
}
