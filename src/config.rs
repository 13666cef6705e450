//! Server configuration.

use std::path::Path;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{LoadFilters, PartitionDef};

/// A pluggable component: module name plus opaque configuration, with an
/// optional read-only variant handed to workers.
#[derive(Clone, Debug, Deserialize)]
pub struct ModuleConfig {
    pub module: String,
    pub config: Value,
    #[serde(default)]
    pub readonly_config: Option<Value>,
}

impl ModuleConfig {

    pub fn handle(&self) -> ModuleHandle {
        ModuleHandle { module: self.module.clone(), config: self.config.clone() }
    }

    /// The read-only connection handle; falls back to the main config.
    pub fn readonly_handle(&self) -> ModuleHandle {
        ModuleHandle {
            module: self.module.clone(),
            config: self.readonly_config.clone().unwrap_or_else(|| self.config.clone()),
        }
    }
}

/// A resolved (module, config) pair, e.g. as passed to worker processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleHandle {
    pub module: String,
    pub config: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    pub interface: String,
    pub config: Value,
    #[serde(default)]
    pub readonly_config: Option<Value>,
}

impl BackendConfig {

    pub fn readonly_handle(&self) -> ModuleHandle {
        ModuleHandle {
            module: self.interface.clone(),
            config: self.readonly_config.clone().unwrap_or_else(|| self.config.clone()),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RegistryConfig {
    pub backend: BackendConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InventoryConfig {
    pub persistency: ModuleConfig,
    #[serde(default)]
    pub partitions: Vec<PartitionDef>,
}

/// Upstream services the catalog is populated from on first start.
#[derive(Clone, Debug, Deserialize)]
pub struct SourcesConfig {
    pub dataset: ModuleHandle,
    pub site: ModuleHandle,
    /// Dataset names to track; all datasets known to the source when
    /// not given.
    #[serde(default)]
    pub datasets: Option<Vec<String>>,
}

/// Entity filters for partial catalog loads on debug instances.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DebugConfig {
    #[serde(default)]
    pub included_datasets: Option<Vec<String>>,
    #[serde(default)]
    pub excluded_datasets: Option<Vec<String>>,
    #[serde(default)]
    pub included_sites: Option<Vec<String>>,
    #[serde(default)]
    pub excluded_sites: Option<Vec<String>>,
    #[serde(default)]
    pub included_groups: Option<Vec<String>>,
    #[serde(default)]
    pub excluded_groups: Option<Vec<String>>,
}

impl DebugConfig {

    pub fn load_filters(&self) -> Result<LoadFilters, Error> {
        LoadFilters::new()
            .datasets(self.included_datasets.as_deref(), self.excluded_datasets.as_deref())?
            .sites(self.included_sites.as_deref(), self.excluded_sites.as_deref())?
            .groups(self.included_groups.as_deref(), self.excluded_groups.as_deref())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// Unix account write-enabled workers run under.
    pub user: String,
    /// Unix account read-only workers run under.
    pub read_user: String,
    pub master: ModuleConfig,
    #[serde(default)]
    pub shadow: Option<ModuleHandle>,
    pub board: ModuleHandle,
    pub registry: RegistryConfig,
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub sources: Option<SourcesConfig>,
    #[serde(default)]
    pub debug: Option<DebugConfig>,
}

impl ServerConfig {

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = crate::tools::file_read_optional_string(path)?
            .ok_or_else(|| format_err!("configuration file {:?} not found", path))?;

        serde_json::from_str(&contents)
            .map_err(|err| format_err!("unable to parse configuration {:?} - {}", path, err))
    }

    pub fn load_filters(&self) -> Result<LoadFilters, Error> {
        match &self.debug {
            Some(debug) => debug.load_filters(),
            None => Ok(LoadFilters::default()),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_parse_full_config() {
        let raw = serde_json::json!({
            "user": "replicad",
            "read_user": "replicad-read",
            "master": {
                "module": "file",
                "config": { "path": "/var/lib/replicad/master", "host": "alpha" },
                "readonly_config": { "path": "/var/lib/replicad/master", "host": "alpha" },
            },
            "shadow": {
                "module": "file",
                "config": { "path": "/var/lib/replicad/shadow", "host": "localhost" },
            },
            "board": {
                "module": "file",
                "config": { "path": "/var/lib/replicad/board.json" },
            },
            "registry": {
                "backend": {
                    "interface": "file",
                    "config": { "path": "/var/lib/replicad/registry" },
                    "readonly_config": { "path": "/var/lib/replicad/registry", "readonly": true },
                },
            },
            "inventory": {
                "persistency": {
                    "module": "file",
                    "config": { "path": "/var/lib/replicad/inventory.json" },
                },
                "partitions": [
                    { "name": "global" },
                    { "name": "production", "groups": ["prod"] },
                ],
            },
            "sources": {
                "dataset": {
                    "module": "file",
                    "config": { "path": "/var/lib/replicad/sources" },
                },
                "site": {
                    "module": "file",
                    "config": { "path": "/var/lib/replicad/sources" },
                },
                "datasets": ["/prod/raw-2024"],
            },
            "debug": {
                "included_datasets": ["/prod/*"],
            },
        });

        let config: ServerConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.user, "replicad");
        assert!(config.shadow.is_some());
        assert_eq!(config.inventory.partitions.len(), 2);

        let sources = config.sources.as_ref().unwrap();
        assert_eq!(sources.dataset.module, "file");
        assert_eq!(sources.datasets.as_ref().unwrap().len(), 1);

        let handle = config.registry.backend.readonly_handle();
        assert_eq!(handle.config["readonly"], serde_json::json!(true));

        let filters = config.load_filters().unwrap();
        assert!(filters.datasets.accepts("/prod/raw-2024"));
        assert!(!filters.datasets.accepts("/user/raw-2024"));
    }
}
