//! Manager for the fleet coordination tables and peer connections.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Error};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::catalog::CommandList;
use crate::config::ServerConfig;
use crate::tools;

use super::board::{self, BoardDescriptor, UpdateBoard};
use super::host::{HostStatus, Peer};
use super::master::{self, MasterStore, StoreDescriptor};
use super::ServerError;

/// Heartbeat cadence in seconds.
pub const HEARTBEAT_INTERVAL: u64 = 30;
/// Delay between remote store discovery passes.
pub const STORE_RETRY_INTERVAL: u64 = 5;
/// Delay between update propagation passes.
pub const UPDATE_PASS_INTERVAL: u64 = 1;

struct MasterLink {
    master: Box<dyn MasterStore>,
    master_host: String,
    shadow: Option<Box<dyn MasterStore>>,
}

pub struct ServerManager {
    hostname: String,
    link: Arc<Mutex<MasterLink>>,
    status: Arc<Mutex<HostStatus>>,
    board: Box<dyn UpdateBoard>,
    peers: BTreeMap<String, Peer>,
    store_host: String,
    heartbeat: Option<thread::JoinHandle<()>>,
    heartbeat_stop: Option<Sender<()>>,
}

impl ServerManager {

    pub fn new(config: &ServerConfig) -> Result<Self, Error> {
        Self::with_hostname(config, tools::hostname()?)
    }

    pub fn with_hostname(config: &ServerConfig, hostname: String) -> Result<Self, Error> {
        let master = master::instantiate(&config.master.module, &config.master.config)?;
        let master_host = master.host().to_string();

        // When the master is remote this host may become the next master,
        // so a local shadow keeps a copy of the coordination tables.
        let shadow = match &config.shadow {
            Some(handle) if master_host != "localhost" && master_host != hostname => {
                Some(master::instantiate(&handle.module, &handle.config)?)
            }
            _ => None,
        };

        let board = board::instantiate(&config.board.module, &config.board.config)?;

        let board_descriptor = BoardDescriptor {
            module: config.board.module.clone(),
            config: config.board.config.clone(),
        };
        let store_handle = config.inventory.persistency.readonly_handle();
        let store_descriptor = StoreDescriptor {
            module: store_handle.module,
            config: store_handle.config,
            version: 0,
        };
        master.register_host(&hostname, &board_descriptor, Some(&store_descriptor))?;

        let link = Arc::new(Mutex::new(MasterLink { master, master_host, shadow }));
        let status = Arc::new(Mutex::new(HostStatus::Initial));

        let (stop_tx, stop_rx) = bounded(1);
        let heartbeat = {
            let hostname = hostname.clone();
            let link = Arc::clone(&link);
            let status = Arc::clone(&status);
            thread::spawn(move || Self::heartbeat_loop(hostname, link, status, stop_rx))
        };

        Ok(Self {
            hostname,
            link,
            status,
            board,
            peers: BTreeMap::new(),
            store_host: String::new(),
            heartbeat: Some(heartbeat),
            heartbeat_stop: Some(stop_tx),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn master_host(&self) -> String {
        self.link.lock().unwrap().master_host.clone()
    }

    pub fn has_shadow(&self) -> bool {
        self.link.lock().unwrap().shadow.is_some()
    }

    /// Locally cached status; not refreshed from the master.
    pub fn status(&self) -> HostStatus {
        *self.status.lock().unwrap()
    }

    /// Set the status of this host in the master store.
    ///
    /// If the master already reports this host out of sync, the local
    /// cache is forced to OUTOFSYNC and the transition fails, whatever
    /// status was requested. A peer flipped us out of sync and only
    /// `reset_status` may take us back.
    pub fn set_status(&self, status: HostStatus) -> Result<(), Error> {
        let link = self.link.lock().unwrap();
        link.master.lock()?;
        let result = (|| -> Result<(), Error> {
            if link.master.get_status(&self.hostname)? == Some(HostStatus::OutOfSync) {
                *self.status.lock().unwrap() = HostStatus::OutOfSync;
                return Err(ServerError::OutOfSync.into());
            }
            link.master.set_status(&self.hostname, status)
        })();
        let unlock = link.master.unlock();
        result?;
        unlock?;

        *self.status.lock().unwrap() = status;

        Ok(())
    }

    /// Set the status of another host.
    pub fn set_peer_status(&self, hostname: &str, status: HostStatus) -> Result<(), Error> {
        let link = self.link.lock().unwrap();
        link.master.set_status(hostname, status)
    }

    /// The only path out of OUTOFSYNC: back to INITIAL for a reload.
    pub fn reset_status(&self) -> Result<(), Error> {
        let link = self.link.lock().unwrap();
        link.master.lock()?;
        let result = (|| -> Result<(), Error> {
            if link.master.get_status(&self.hostname)? != Some(HostStatus::OutOfSync) {
                bail!("reset_status called while the server is not out of sync");
            }
            link.master.set_status(&self.hostname, HostStatus::Initial)
        })();
        let unlock = link.master.unlock();
        result?;
        unlock?;

        *self.status.lock().unwrap() = HostStatus::Initial;

        Ok(())
    }

    /// Read this host's status from the master and refresh the cache.
    pub fn get_status(&self) -> Result<Option<HostStatus>, Error> {
        let link = self.link.lock().unwrap();
        let status = link.master.get_status(&self.hostname)?;
        if let Some(status) = status {
            *self.status.lock().unwrap() = status;
        }
        Ok(status)
    }

    pub fn get_peer_status(&self, hostname: &str) -> Result<Option<HostStatus>, Error> {
        let link = self.link.lock().unwrap();
        link.master.get_status(hostname)
    }

    pub fn check_connection(&self) -> bool {
        self.link.lock().unwrap().master.check_connection()
    }

    /// Verify the master connection and this host's standing.
    pub fn check_status(&self) -> Result<(), Error> {
        let connected = self.check_connection();
        if !connected {
            *self.status.lock().unwrap() = HostStatus::OutOfSync;
            return Err(ServerError::OutOfSync.into());
        }

        match self.get_status()? {
            Some(HostStatus::Error) => bail!("server status is ERROR"),
            Some(HostStatus::OutOfSync) => Err(ServerError::OutOfSync.into()),
            _ => Ok(()),
        }
    }

    /// Number of hosts currently in any of the given states.
    pub fn count_servers(&self, statuses: &[HostStatus]) -> Result<usize, Error> {
        let link = self.link.lock().unwrap();
        let mut hostnames = HashSet::new();
        for (name, status, _) in link.master.host_list()? {
            if statuses.contains(&status) {
                hostnames.insert(name);
            }
        }
        Ok(hostnames.len())
    }

    fn heartbeat_loop(
        hostname: String,
        link: Arc<Mutex<MasterLink>>,
        status: Arc<Mutex<HostStatus>>,
        stop: Receiver<()>,
    ) {
        loop {
            let current = *status.lock().unwrap();
            if current != HostStatus::Initial {
                let link = link.lock().unwrap();
                if let Err(err) = link.master.heartbeat(&hostname) {
                    log::warn!("heartbeat failed - {}", err);
                }
                if let Some(shadow) = &link.shadow {
                    if let Err(err) = master::copy_master(&**shadow, &*link.master) {
                        log::warn!("shadow copy failed - {}", err);
                    }
                }
            }

            match stop.recv_timeout(Duration::from_secs(HEARTBEAT_INTERVAL)) {
                Err(RecvTimeoutError::Timeout) => (),
                _ => break,
            }
        }
    }

    /// Find and connect to the new master after the current one died.
    pub fn reconnect_master(&self) -> Result<(), Error> {
        let mut link = self.link.lock().unwrap();

        let descriptor = match &link.shadow {
            Some(shadow) => shadow.next_master(&link.master_host)?,
            // master was local; there is nothing to fail over to
            None => return Err(ServerError::MasterLocal.into()),
        };

        let master = master::instantiate(&descriptor.module, &descriptor.config)?;
        link.master_host = master.host().to_string();
        link.master = master;

        if link.master_host == "localhost" || link.master_host == self.hostname {
            link.shadow = None;
        }

        Ok(())
    }

    /// Reconcile the peer map with the master's host list.
    pub fn collect_hosts(&mut self) -> Result<(), Error> {
        let link = self.link.lock().unwrap();
        Self::refresh_peers(&mut self.peers, &self.hostname, &*link.master)
    }

    fn refresh_peers(
        peers: &mut BTreeMap<String, Peer>,
        hostname: &str,
        master: &dyn MasterStore,
    ) -> Result<(), Error> {
        let mut known = HashSet::new();

        for (name, status, has_store) in master.host_list()? {
            if name == hostname {
                continue;
            }

            if !peers.contains_key(&name) {
                let board_config = match master.board_config(&name)? {
                    Some(descriptor) => descriptor,
                    // shouldn't happen
                    None => continue,
                };
                let board = board::instantiate(&board_config.module, &board_config.config)?;
                peers.insert(
                    name.clone(),
                    Peer { hostname: name.clone(), board, has_store, status },
                );
            }

            let peer = peers.get_mut(&name).unwrap();
            peer.has_store = has_store;
            peer.status = status;

            known.insert(name);
        }

        let stale: Vec<String> =
            peers.keys().filter(|name| !known.contains(*name)).cloned().collect();
        for name in stale {
            peers.remove(&name);
        }

        Ok(())
    }

    pub fn peers(&self) -> &BTreeMap<String, Peer> {
        &self.peers
    }

    /// Find a remote host that carries a persistency store and is online.
    ///
    /// Candidates found UPDATING are waited for; if no candidate is
    /// online and none is updating, this host goes to ERROR and the
    /// lookup fails.
    pub fn find_remote_store(
        &mut self,
        hostname: Option<&str>,
    ) -> Result<(String, StoreDescriptor), Error> {
        loop {
            self.collect_hosts()?;

            let mut is_updating = false;
            let mut found = None;
            {
                let link = self.link.lock().unwrap();
                for (name, peer) in self.peers.iter() {
                    if let Some(want) = hostname {
                        if name != want {
                            continue;
                        }
                    }
                    if !peer.has_store {
                        continue;
                    }

                    match peer.status {
                        HostStatus::Online => {
                            if let Some(descriptor) = link.master.store_config(name)? {
                                found = Some((name.clone(), descriptor));
                                break;
                            }
                        }
                        HostStatus::Updating => {
                            is_updating = true;
                        }
                        _ => (),
                    }
                }
            }

            if let Some(found) = found {
                return Ok(found);
            }

            if is_updating {
                thread::sleep(Duration::from_secs(STORE_RETRY_INTERVAL));
            } else {
                self.set_status(HostStatus::Error)?;
                return Err(ServerError::NoStore.into());
            }
        }
    }

    pub fn register_remote_store(&mut self, hostname: &str) -> Result<(), Error> {
        self.store_host = hostname.to_string();
        let link = self.link.lock().unwrap();
        link.master.declare_remote_store(hostname)
    }

    pub fn store_host(&self) -> &str {
        &self.store_host
    }

    fn locked_select(
        link: &Mutex<MasterLink>,
        peers: &mut BTreeMap<String, Peer>,
        hostname: &str,
        processed: &HashSet<String>,
    ) -> Result<Option<(String, HostStatus)>, Error> {
        let link = link.lock().unwrap();
        link.master.lock()?;
        let result = (|| -> Result<Option<(String, HostStatus)>, Error> {
            Self::refresh_peers(peers, hostname, &*link.master)?;
            for (name, peer) in peers.iter() {
                if processed.contains(name) {
                    continue;
                }
                if peer.status == HostStatus::Online {
                    // mark the peer as receiving before the board write
                    link.master.set_status(name, HostStatus::Updating)?;
                }
                return Ok(Some((name.clone(), peer.status)));
            }
            Ok(None)
        })();
        let unlock = link.master.unlock();
        let selected = result?;
        unlock?;
        Ok(selected)
    }

    /// Deliver a command batch to every online peer's update board.
    ///
    /// One peer is handled per locked section to keep the distributed
    /// lock hold time short; the board write itself happens outside the
    /// lock. Peers found UPDATING are consuming a previous batch: they
    /// are retried on a later pass and skipped if still updating then.
    /// Peers in any other non-online state are not running and are
    /// skipped immediately.
    pub fn send_updates(&mut self, commands: &CommandList) -> Result<(), Error> {
        // Write-enabled workers and server startup are mutually
        // exclusive, so no host comes online while this loop runs and
        // the peer map is the complete list of running servers.
        let mut processed: HashSet<String> = HashSet::new();
        let mut deferred: HashSet<String> = HashSet::new();

        loop {
            let selected =
                Self::locked_select(&self.link, &mut self.peers, &self.hostname, &processed)?;

            let (name, status) = match selected {
                Some(selected) => selected,
                None => break,
            };

            match status {
                HostStatus::Online => {
                    processed.insert(name.clone());
                    let result = self.peers.get(&name).unwrap().board.write_updates(commands);
                    match result {
                        Ok(()) => {
                            log::info!("sent {} update commands to {}", commands.len(), name);
                        }
                        Err(err) => {
                            log::error!(
                                "error while sending updates to {} - {}; setting host status to outofsync",
                                name, err,
                            );
                            self.set_peer_status(&name, HostStatus::OutOfSync)?;
                        }
                    }
                }
                HostStatus::Updating => {
                    if !deferred.insert(name.clone()) {
                        log::warn!(
                            "host {} is still updating from a previous batch, skipping",
                            name,
                        );
                        processed.insert(name);
                    }
                }
                _ => {
                    processed.insert(name);
                }
            }

            thread::sleep(Duration::from_secs(UPDATE_PASS_INTERVAL));
        }

        Ok(())
    }

    /// Drain this host's own update board.
    pub fn get_updates(&self) -> Result<CommandList, Error> {
        self.board.lock()?;
        let result = (|| -> Result<CommandList, Error> {
            let commands = self.board.get_updates()?;
            if !commands.is_empty() {
                self.board.flush()?;
            }
            Ok(commands)
        })();
        let unlock = self.board.unlock();
        let commands = result?;
        unlock?;
        Ok(commands)
    }

    /// Go offline: stop the heartbeat and deregister from the master.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        self.stop_heartbeat();
        let link = self.link.lock().unwrap();
        link.master.disconnect(&self.hostname)
    }

    fn stop_heartbeat(&mut self) {
        if let Some(stop) = self.heartbeat_stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerManager {

    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::catalog::{CatalogEntity, Group, UpdateCommand};
    use crate::server::master::MasterDescriptor;
    use serde_json::json;

    fn manager_config(dir: &tempfile::TempDir, master_host: &str, shadow: bool) -> ServerConfig {
        let mut raw = json!({
            "user": "replicad",
            "read_user": "replicad-read",
            "master": {
                "module": "file",
                "config": {
                    "path": dir.path().join("master").to_str().unwrap(),
                    "host": master_host,
                },
            },
            "board": {
                "module": "file",
                "config": { "path": dir.path().join("self.board").to_str().unwrap() },
            },
            "registry": {
                "backend": {
                    "interface": "file",
                    "config": { "path": dir.path().join("registry").to_str().unwrap() },
                },
            },
            "inventory": {
                "persistency": {
                    "module": "file",
                    "config": { "path": dir.path().join("inventory.json").to_str().unwrap() },
                },
            },
        });

        if shadow {
            raw["shadow"] = json!({
                "module": "file",
                "config": {
                    "path": dir.path().join("shadow").to_str().unwrap(),
                    "host": "localhost",
                },
            });
        }

        serde_json::from_value(raw).unwrap()
    }

    fn register_peer(
        dir: &tempfile::TempDir,
        master: &dyn MasterStore,
        name: &str,
        status: HostStatus,
    ) {
        let board = BoardDescriptor {
            module: "file".to_string(),
            config: json!({
                "path": dir.path().join(format!("{}.board", name)).to_str().unwrap(),
            }),
        };
        master.register_host(name, &board, None).unwrap();
        master.set_status(name, status).unwrap();
    }

    fn open_master(dir: &tempfile::TempDir, host: &str) -> Box<dyn MasterStore> {
        master::instantiate(
            "file",
            &json!({
                "path": dir.path().join("master").to_str().unwrap(),
                "host": host,
            }),
        )
        .unwrap()
    }

    #[test]
    fn test_out_of_sync_defense() {
        let dir = tempfile::tempdir().unwrap();
        let config = manager_config(&dir, "localhost", false);
        let manager =
            ServerManager::with_hostname(&config, "self.example.org".to_string()).unwrap();

        manager.set_status(HostStatus::Online).unwrap();
        assert_eq!(manager.status(), HostStatus::Online);

        // a peer flips us out of sync behind our back
        let master = open_master(&dir, "localhost");
        master.set_status("self.example.org", HostStatus::OutOfSync).unwrap();

        let err = manager.set_status(HostStatus::Online).unwrap_err();
        assert_eq!(err.downcast_ref::<ServerError>(), Some(&ServerError::OutOfSync));
        assert_eq!(manager.status(), HostStatus::OutOfSync);

        manager.reset_status().unwrap();
        assert_eq!(manager.status(), HostStatus::Initial);
        assert_eq!(
            manager.get_status().unwrap(),
            Some(HostStatus::Initial),
        );

        // reset is only valid out of OUTOFSYNC
        assert!(manager.reset_status().is_err());
    }

    #[test]
    fn test_collect_hosts_reconciles_peers() {
        let dir = tempfile::tempdir().unwrap();
        let config = manager_config(&dir, "localhost", false);
        let mut manager =
            ServerManager::with_hostname(&config, "self.example.org".to_string()).unwrap();

        let master = open_master(&dir, "localhost");
        register_peer(&dir, &*master, "peer-a.example.org", HostStatus::Online);
        register_peer(&dir, &*master, "peer-b.example.org", HostStatus::Error);

        manager.collect_hosts().unwrap();
        assert_eq!(manager.peers().len(), 2);
        assert_eq!(
            manager.peers()["peer-a.example.org"].status,
            HostStatus::Online,
        );

        master.disconnect("peer-b.example.org").unwrap();
        manager.collect_hosts().unwrap();
        assert_eq!(manager.peers().len(), 1);
        assert!(!manager.peers().contains_key("peer-b.example.org"));
    }

    #[test]
    fn test_master_failover() {
        let dir = tempfile::tempdir().unwrap();
        let config = manager_config(&dir, "master-a.example.org", true);
        let manager =
            ServerManager::with_hostname(&config, "self.example.org".to_string()).unwrap();

        assert!(manager.has_shadow());

        // the shadow knows the succession order
        let shadow = master::instantiate(
            "file",
            &json!({
                "path": dir.path().join("shadow").to_str().unwrap(),
                "host": "localhost",
            }),
        )
        .unwrap();
        let mut data = shadow.dump().unwrap();
        data.succession.push(MasterDescriptor {
            hostname: "master-a.example.org".to_string(),
            module: "file".to_string(),
            config: json!({
                "path": dir.path().join("master").to_str().unwrap(),
                "host": "master-a.example.org",
            }),
        });
        data.succession.push(MasterDescriptor {
            hostname: "self.example.org".to_string(),
            module: "file".to_string(),
            config: json!({
                "path": dir.path().join("master-b").to_str().unwrap(),
                "host": "self.example.org",
            }),
        });
        shadow.restore(&data).unwrap();

        manager.reconnect_master().unwrap();

        // the new master is local, so the shadow is dropped
        assert_eq!(manager.master_host(), "self.example.org");
        assert!(!manager.has_shadow());

        // a second fail-over has no shadow to consult
        let err = manager.reconnect_master().unwrap_err();
        assert_eq!(err.downcast_ref::<ServerError>(), Some(&ServerError::MasterLocal));
    }

    #[test]
    fn test_send_updates_mixed_peer_states() {
        let dir = tempfile::tempdir().unwrap();
        let config = manager_config(&dir, "localhost", false);
        let mut manager =
            ServerManager::with_hostname(&config, "self.example.org".to_string()).unwrap();

        let master = open_master(&dir, "localhost");
        register_peer(&dir, &*master, "peer-a.example.org", HostStatus::Online);
        register_peer(&dir, &*master, "peer-b.example.org", HostStatus::Updating);
        register_peer(&dir, &*master, "peer-c.example.org", HostStatus::Error);

        let commands: CommandList =
            vec![(UpdateCommand::Update, CatalogEntity::Group(Group::new("prod")))];

        manager.send_updates(&commands).unwrap();

        // the online peer received the batch and was marked updating
        let board = board::instantiate(
            "file",
            &json!({
                "path": dir.path().join("peer-a.example.org.board").to_str().unwrap(),
            }),
        )
        .unwrap();
        assert_eq!(board.get_updates().unwrap(), commands);
        assert_eq!(
            master.get_status("peer-a.example.org").unwrap(),
            Some(HostStatus::Updating),
        );

        // the updating and stopped peers got nothing
        for name in &["peer-b.example.org", "peer-c.example.org"] {
            let board = board::instantiate(
                "file",
                &json!({
                    "path": dir.path().join(format!("{}.board", name)).to_str().unwrap(),
                }),
            )
            .unwrap();
            assert!(board.get_updates().unwrap().is_empty());
        }
    }

    #[test]
    fn test_find_remote_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = manager_config(&dir, "localhost", false);
        let mut manager =
            ServerManager::with_hostname(&config, "self.example.org".to_string()).unwrap();
        manager.set_status(HostStatus::Online).unwrap();

        let master = open_master(&dir, "localhost");
        let board = BoardDescriptor {
            module: "file".to_string(),
            config: json!({ "path": dir.path().join("peer.board").to_str().unwrap() }),
        };
        let store = StoreDescriptor {
            module: "file".to_string(),
            config: json!({ "path": "/var/lib/replicad/inventory.json", "readonly": true }),
            version: 7,
        };
        master.register_host("peer-a.example.org", &board, Some(&store)).unwrap();
        master.set_status("peer-a.example.org", HostStatus::Online).unwrap();

        let (host, descriptor) = manager.find_remote_store(None).unwrap();
        assert_eq!(host, "peer-a.example.org");
        assert_eq!(descriptor.version, 7);

        // no online host with a store: escalate to ERROR and fail
        master.set_status("peer-a.example.org", HostStatus::Stopped).unwrap();
        let err = manager.find_remote_store(None).unwrap_err();
        assert_eq!(err.downcast_ref::<ServerError>(), Some(&ServerError::NoStore));
        assert_eq!(manager.status(), HostStatus::Error);
    }

    #[test]
    fn test_own_board_drain() {
        let dir = tempfile::tempdir().unwrap();
        let config = manager_config(&dir, "localhost", false);
        let manager =
            ServerManager::with_hostname(&config, "self.example.org".to_string()).unwrap();

        let board = board::instantiate(
            "file",
            &json!({ "path": dir.path().join("self.board").to_str().unwrap() }),
        )
        .unwrap();
        let commands: CommandList =
            vec![(UpdateCommand::Update, CatalogEntity::Group(Group::new("prod")))];
        board.write_updates(&commands).unwrap();

        assert_eq!(manager.get_updates().unwrap(), commands);
        // the board was flushed by the successful read
        assert!(manager.get_updates().unwrap().is_empty());
    }
}
