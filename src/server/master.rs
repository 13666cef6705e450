//! The master store: fleet membership, host status and the distributed lock.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools;

use super::board::BoardDescriptor;
use super::host::HostStatus;

const LOCK_TIMEOUT: u64 = 3600;

/// Handle to a host's persistency store, served for remote store discovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub module: String,
    pub config: Value,
    pub version: i64,
}

/// Handle to a master store instance, returned by `next_master`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MasterDescriptor {
    pub hostname: String,
    pub module: String,
    pub config: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(default)]
    pub status: HostStatus,
    #[serde(default)]
    pub heartbeat: i64,
    #[serde(default)]
    pub has_store: bool,
    #[serde(default)]
    pub store_config: Option<StoreDescriptor>,
    #[serde(default)]
    pub board_config: Option<BoardDescriptor>,
}

/// Full contents of the master store; shadows replicate this wholesale.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MasterData {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostEntry>,
    /// Fail-over order for master re-election.
    #[serde(default)]
    pub succession: Vec<MasterDescriptor>,
    #[serde(default)]
    pub remote_store: Option<String>,
}

/// The cluster-wide coordination table and lock service.
///
/// All cross-host mutations are serialized by the distributed lock;
/// callers bracket their critical sections with `lock`/`unlock`.
pub trait MasterStore: Send {

    /// Host the master store lives on.
    fn host(&self) -> &str;

    fn lock(&self) -> Result<(), Error>;

    fn unlock(&self) -> Result<(), Error>;

    fn check_connection(&self) -> bool;

    /// Register a host with its board and (optional) store handles.
    fn register_host(
        &self,
        hostname: &str,
        board: &BoardDescriptor,
        store: Option<&StoreDescriptor>,
    ) -> Result<(), Error>;

    /// All known hosts as (hostname, status, has_store).
    fn host_list(&self) -> Result<Vec<(String, HostStatus, bool)>, Error>;

    fn get_status(&self, hostname: &str) -> Result<Option<HostStatus>, Error>;

    fn set_status(&self, hostname: &str, status: HostStatus) -> Result<(), Error>;

    /// Advance the liveness timestamp of a host.
    fn heartbeat(&self, hostname: &str) -> Result<(), Error>;

    fn store_config(&self, hostname: &str) -> Result<Option<StoreDescriptor>, Error>;

    fn board_config(&self, hostname: &str) -> Result<Option<BoardDescriptor>, Error>;

    /// The designated fail-over target after `current`.
    fn next_master(&self, current: &str) -> Result<MasterDescriptor, Error>;

    fn declare_remote_store(&self, hostname: &str) -> Result<(), Error>;

    fn dump(&self) -> Result<MasterData, Error>;

    fn restore(&self, data: &MasterData) -> Result<(), Error>;

    /// Go offline and remove this host from the list.
    fn disconnect(&self, hostname: &str) -> Result<(), Error>;
}

/// Replicate the full master contents into `target` (shadow maintenance).
pub fn copy_master(target: &dyn MasterStore, source: &dyn MasterStore) -> Result<(), Error> {
    target.restore(&source.dump()?)
}

/// Construct a master store client from a module name and its config.
pub fn instantiate(module: &str, config: &Value) -> Result<Box<dyn MasterStore>, Error> {
    match module {
        "file" => Ok(Box::new(FileMaster::new(config)?)),
        _ => bail!("unknown master module '{}'", module),
    }
}

#[derive(Deserialize)]
struct FileMasterConfig {
    path: String,
    host: String,
}

/// Master store backed by a shared directory.
///
/// `hosts.json` holds the coordination table; the `lock` file carries
/// the distributed flock. Every mutation is a read-modify-replace, so
/// readers never observe torn writes.
pub struct FileMaster {
    path: PathBuf,
    host: String,
    lock: Mutex<Option<File>>,
}

impl FileMaster {

    pub fn new(config: &Value) -> Result<Self, Error> {
        let config: FileMasterConfig = serde_json::from_value(config.clone())
            .map_err(|err| format_err!("invalid master store config - {}", err))?;

        let path = PathBuf::from(config.path);
        std::fs::create_dir_all(&path)
            .map_err(|err| format_err!("unable to create master store at {:?} - {}", path, err))?;

        Ok(Self { path, host: config.host, lock: Mutex::new(None) })
    }

    fn data_path(&self) -> PathBuf {
        self.path.join("hosts.json")
    }

    fn read_data(&self) -> Result<MasterData, Error> {
        match tools::file_read_optional_string(self.data_path())? {
            Some(contents) => serde_json::from_str(&contents).map_err(|err| {
                format_err!("corrupt master store {:?} - {}", self.data_path(), err)
            }),
            None => Ok(MasterData::default()),
        }
    }

    fn write_data(&self, data: &MasterData) -> Result<(), Error> {
        let raw = serde_json::to_vec_pretty(data)?;
        tools::replace_file(self.data_path(), &raw, None)
    }

    fn modify<F>(&self, mutate: F) -> Result<(), Error>
    where
        F: FnOnce(&mut MasterData) -> Result<(), Error>,
    {
        // short-lived lock for the read-modify-replace itself; distinct
        // from the distributed lock, which callers may already hold
        let _guard = tools::open_file_locked(self.path.join("hosts.lck"), 60)?;

        let mut data = self.read_data()?;
        mutate(&mut data)?;
        self.write_data(&data)
    }
}

impl MasterStore for FileMaster {

    fn host(&self) -> &str {
        &self.host
    }

    fn lock(&self) -> Result<(), Error> {
        let file = tools::open_file_locked(self.path.join("lock"), LOCK_TIMEOUT)?;
        *self.lock.lock().unwrap() = Some(file);
        Ok(())
    }

    fn unlock(&self) -> Result<(), Error> {
        self.lock.lock().unwrap().take();
        Ok(())
    }

    fn check_connection(&self) -> bool {
        self.path.is_dir()
    }

    fn register_host(
        &self,
        hostname: &str,
        board: &BoardDescriptor,
        store: Option<&StoreDescriptor>,
    ) -> Result<(), Error> {
        self.modify(|data| {
            let entry = data.hosts.entry(hostname.to_string()).or_default();
            entry.board_config = Some(board.clone());
            entry.has_store = store.is_some();
            entry.store_config = store.cloned();
            Ok(())
        })
    }

    fn host_list(&self) -> Result<Vec<(String, HostStatus, bool)>, Error> {
        Ok(self
            .read_data()?
            .hosts
            .iter()
            .map(|(name, entry)| (name.clone(), entry.status, entry.has_store))
            .collect())
    }

    fn get_status(&self, hostname: &str) -> Result<Option<HostStatus>, Error> {
        Ok(self.read_data()?.hosts.get(hostname).map(|e| e.status))
    }

    fn set_status(&self, hostname: &str, status: HostStatus) -> Result<(), Error> {
        self.modify(|data| {
            data.hosts.entry(hostname.to_string()).or_default().status = status;
            Ok(())
        })
    }

    fn heartbeat(&self, hostname: &str) -> Result<(), Error> {
        self.modify(|data| {
            data.hosts.entry(hostname.to_string()).or_default().heartbeat = tools::epoch_now();
            Ok(())
        })
    }

    fn store_config(&self, hostname: &str) -> Result<Option<StoreDescriptor>, Error> {
        Ok(self
            .read_data()?
            .hosts
            .get(hostname)
            .and_then(|e| e.store_config.clone()))
    }

    fn board_config(&self, hostname: &str) -> Result<Option<BoardDescriptor>, Error> {
        Ok(self
            .read_data()?
            .hosts
            .get(hostname)
            .and_then(|e| e.board_config.clone()))
    }

    fn next_master(&self, current: &str) -> Result<MasterDescriptor, Error> {
        let data = self.read_data()?;
        data.succession
            .iter()
            .find(|d| d.hostname != current)
            .cloned()
            .ok_or_else(|| format_err!("no fail-over target configured after {}", current))
    }

    fn declare_remote_store(&self, hostname: &str) -> Result<(), Error> {
        self.modify(|data| {
            data.remote_store = Some(hostname.to_string());
            Ok(())
        })
    }

    fn dump(&self) -> Result<MasterData, Error> {
        self.read_data()
    }

    fn restore(&self, data: &MasterData) -> Result<(), Error> {
        self.write_data(data)
    }

    fn disconnect(&self, hostname: &str) -> Result<(), Error> {
        self.modify(|data| {
            data.hosts.remove(hostname);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn file_master(dir: &tempfile::TempDir, host: &str) -> FileMaster {
        let config = serde_json::json!({
            "path": dir.path().join("master").to_str().unwrap(),
            "host": host,
        });
        FileMaster::new(&config).unwrap()
    }

    fn board_descriptor(name: &str) -> BoardDescriptor {
        BoardDescriptor {
            module: "file".to_string(),
            config: serde_json::json!({ "path": format!("/var/lib/replicad/{}.board", name) }),
        }
    }

    #[test]
    fn test_register_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let master = file_master(&dir, "alpha");

        master
            .register_host("alpha", &board_descriptor("alpha"), None)
            .unwrap();
        master
            .register_host(
                "beta",
                &board_descriptor("beta"),
                Some(&StoreDescriptor {
                    module: "file".to_string(),
                    config: serde_json::json!({ "path": "/x", "readonly": true }),
                    version: 3,
                }),
            )
            .unwrap();

        assert_eq!(master.get_status("alpha").unwrap(), Some(HostStatus::Initial));
        master.set_status("alpha", HostStatus::Online).unwrap();
        assert_eq!(master.get_status("alpha").unwrap(), Some(HostStatus::Online));
        assert_eq!(master.get_status("gamma").unwrap(), None);

        let mut hosts = master.host_list().unwrap();
        hosts.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0], ("alpha".to_string(), HostStatus::Online, false));
        assert_eq!(hosts[1], ("beta".to_string(), HostStatus::Initial, true));

        assert!(master.board_config("beta").unwrap().is_some());
        assert_eq!(master.store_config("beta").unwrap().unwrap().version, 3);
        assert!(master.store_config("alpha").unwrap().is_none());
    }

    #[test]
    fn test_shadow_copy() {
        let dir = tempfile::tempdir().unwrap();
        let master = file_master(&dir, "alpha");

        let shadow_dir = tempfile::tempdir().unwrap();
        let shadow = file_master(&shadow_dir, "beta");

        master
            .register_host("alpha", &board_descriptor("alpha"), None)
            .unwrap();
        master.set_status("alpha", HostStatus::Online).unwrap();
        master.heartbeat("alpha").unwrap();

        copy_master(&shadow, &master).unwrap();

        assert_eq!(shadow.host_list().unwrap(), master.host_list().unwrap());
    }

    #[test]
    fn test_next_master_skips_current() {
        let dir = tempfile::tempdir().unwrap();
        let master = file_master(&dir, "alpha");

        let mut data = MasterData::default();
        data.succession.push(MasterDescriptor {
            hostname: "alpha".to_string(),
            module: "file".to_string(),
            config: serde_json::json!({ "path": "/m/alpha", "host": "alpha" }),
        });
        data.succession.push(MasterDescriptor {
            hostname: "beta".to_string(),
            module: "file".to_string(),
            config: serde_json::json!({ "path": "/m/beta", "host": "beta" }),
        });
        master.restore(&data).unwrap();

        let next = master.next_master("alpha").unwrap();
        assert_eq!(next.hostname, "beta");

        let next = master.next_master("gamma").unwrap();
        assert_eq!(next.hostname, "alpha");
    }
}
