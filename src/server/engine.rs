//! The daemon main loop: poll the action queue, run payloads in child
//! workers, drain the writer's update stream and apply it to the catalog.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use crate::catalog::{store, CommandList, Inventory, InventoryStore, UpdateCommand};
use crate::config::ServerConfig;
use crate::registry::{Action, ActionStatus, Registry, RegistryLock};
use crate::source;
use crate::tools::{self, signaling, signaling::SignalBlocker};

use super::host::HostStatus;
use super::manager::ServerManager;
use super::worker::{self, DrainState, UpdateChannel, Worker};

/// Wait for a reaped worker to go away.
const JOIN_TIMEOUT: u64 = 60;
/// Wait for workers terminated at shutdown.
const SHUTDOWN_TIMEOUT: u64 = 5;

struct WriteSlot {
    action_id: i64,
    channel: UpdateChannel,
}

pub struct Engine {
    config: ServerConfig,
    inventory: Inventory,
    store: Box<dyn InventoryStore>,
    registry: Registry,
    manager: ServerManager,
    workers: Vec<Worker>,
    // at most one write-enabled action runs at a time
    write_slot: Option<WriteSlot>,
    action_lock: Option<RegistryLock>,
}

impl Engine {

    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        Self::with_hostname(config, tools::hostname()?)
    }

    pub fn with_hostname(config: ServerConfig, hostname: String) -> Result<Self, Error> {
        log::info!("initializing replicad server on {}", hostname);

        if config.registry.backend.interface != "file" {
            bail!(
                "unknown registry backend interface '{}'",
                config.registry.backend.interface,
            );
        }
        let registry = Registry::open(&config.registry.backend.config)?;
        let store = store::instantiate(
            &config.inventory.persistency.module,
            &config.inventory.persistency.config,
        )?;

        let manager = ServerManager::with_hostname(&config, hostname)?;
        manager.set_status(HostStatus::Starting)?;

        log::info!("loading the inventory");
        let filters = config.load_filters()?;
        let mut inventory =
            store.load_inventory(config.inventory.partitions.clone(), &filters)?;

        // a store that was never written means first start: pull the
        // catalog from the upstream services
        if store.version()? == 0 {
            if let Some(sources) = &config.sources {
                log::info!("populating the catalog from the upstream sources");

                let site_source =
                    source::instantiate_site_source(&sources.site.module, &sources.site.config)?;
                let dataset_source = source::instantiate_dataset_source(
                    &sources.dataset.module,
                    &sources.dataset.config,
                )?;

                let dataset_names = match &sources.datasets {
                    Some(names) => names.clone(),
                    None => dataset_source.get_dataset_names()?,
                };

                source::populate(
                    &mut inventory,
                    &*site_source,
                    &*dataset_source,
                    &dataset_names,
                )?;
                store.save_inventory(&inventory)?;
            }
        }

        manager.set_status(HostStatus::Online)?;

        Ok(Self {
            config,
            inventory,
            store,
            registry,
            manager,
            workers: Vec::new(),
            write_slot: None,
            action_lock: None,
        })
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn manager(&mut self) -> &mut ServerManager {
        &mut self.manager
    }

    /// Run the daemon until interrupted or a fatal error occurs.
    pub fn run(&mut self) -> Result<(), Error> {
        signaling::install_shutdown_handlers()?;

        log::info!("started replicad daemon");

        let result = self.run_loop();
        self.shutdown();
        result
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        let mut sleep_ms: u64 = 0;
        let mut first_wait = true;

        log::info!("start polling for executables");

        loop {
            if signaling::shutdown_requested() {
                log::info!("server process was interrupted");
                return Ok(());
            }

            // release the action table lock from the previous iteration
            self.action_lock = None;

            let completed = self.collect_processes()?;
            if let Some(slot) = &self.write_slot {
                if completed.iter().any(|(id, _)| *id == slot.action_id) {
                    self.write_slot = None;
                }
            }

            self.check_master()?;
            self.apply_board_updates()?;

            std::thread::sleep(Duration::from_millis(sleep_ms));

            self.action_lock = Some(self.registry.lock()?);

            if self.poll_actions()? {
                first_wait = true;
                sleep_ms = 0;
            } else {
                if self.workers.is_empty() && first_wait {
                    log::info!("waiting for executables");
                    first_wait = false;
                }
                sleep_ms = 500;
            }
        }
    }

    /// One poll of the action queue; spawns at most one worker.
    ///
    /// Returns whether a new action row was found. While the write slot
    /// is occupied, write-requesting actions are not selected at all.
    fn poll_actions(&mut self) -> Result<bool, Error> {
        let polled = self.registry.poll_new(self.write_slot.is_some())?;
        let (action, user_name) = match polled {
            Some(polled) => polled,
            None => return Ok(false),
        };

        let payload = Path::new(&action.path).join(worker::PAYLOAD_NAME);
        if !payload.exists() {
            log::info!(
                "executable {} from user {} (write request: {}) not found",
                action.title, user_name, action.write_request,
            );
            self.registry.set_status(action.id, ActionStatus::NotFound)?;
            return Ok(true);
        }

        log::info!(
            "found executable {} from user {} (write request: {})",
            action.title, user_name, action.write_request,
        );

        let mut update_fd = None;
        if action.write_request {
            if !self.check_write_auth(&action)? {
                log::warn!(
                    "executable {} from user {} is not authorized for write access",
                    action.title, user_name,
                );
                self.registry.set_status(action.id, ActionStatus::AuthFailed)?;
                return Ok(true);
            }

            let (channel, write_fd) = UpdateChannel::pair()?;
            self.write_slot = Some(WriteSlot { action_id: action.id, channel });
            update_fd = Some(write_fd);
        }

        self.registry.set_status(action.id, ActionStatus::Run)?;

        let run_user = if action.write_request {
            self.config.user.clone()
        } else {
            self.config.read_user.clone()
        };
        let environment = self.worker_environment();

        match worker::spawn(&action, &user_name, &run_user, &environment, update_fd) {
            Ok(worker) => {
                log::info!(
                    "started executable {} ({}) from user {} (PID {})",
                    action.title, action.path, user_name, worker.pid(),
                );
                self.workers.push(worker);
            }
            Err(err) => {
                log::error!("unable to start executable {} - {:#}", action.title, err);
                if let Some(slot) = &self.write_slot {
                    if slot.action_id == action.id {
                        self.write_slot = None;
                    }
                }
                self.registry.set_result(action.id, ActionStatus::Failed, None)?;
            }
        }

        Ok(true)
    }

    /// MD5-check the payload against the authorized-executables table.
    fn check_write_auth(&self, action: &Action) -> Result<bool, Error> {
        let payload = Path::new(&action.path).join(worker::PAYLOAD_NAME);
        let data = std::fs::read(&payload)
            .map_err(|err| format_err!("unable to read payload {:?} - {}", payload, err))?;
        let checksum = tools::md5sum(&data)?;

        self.registry.authorized(&action.title, &checksum, action.user_id)
    }

    fn worker_environment(&self) -> Vec<(String, String)> {
        let store = self.config.inventory.persistency.readonly_handle();
        let registry = self.config.registry.backend.readonly_handle();

        vec![
            (
                worker::STORE_ENV.to_string(),
                serde_json::to_string(&store).unwrap_or_default(),
            ),
            (
                worker::REGISTRY_ENV.to_string(),
                serde_json::to_string(&registry).unwrap_or_default(),
            ),
        ]
    }

    /// Reap completed workers.
    ///
    /// For every live child: an action row that is gone or no longer
    /// `run` kills the worker; the write-enabled worker has its channel
    /// drained and the commands applied; everyone else is judged by its
    /// exit code. Children that are alive after a status was assigned
    /// are stuck: they are logged and dropped from the live set.
    fn collect_processes(&mut self) -> Result<Vec<(i64, ActionStatus)>, Error> {
        let mut completed = Vec::new();

        let mut index = 0;
        while index < self.workers.len() {
            let action_id = self.workers[index].action_id;
            let mut status: Option<ActionStatus> = None;

            let current = self.registry.get_status(action_id)?;
            if current != Some(ActionStatus::Run) {
                // the action was aborted in the registry
                status = Some(ActionStatus::Killed);
                if let Err(err) = self.workers[index].terminate() {
                    log::warn!("unable to terminate worker {} - {}", action_id, err);
                }
                self.workers[index].join(JOIN_TIMEOUT);
            } else if self.write_slot.as_ref().map(|s| s.action_id) == Some(action_id) {
                let (state, commands) = self.write_slot.as_mut().unwrap().channel.drain();

                match state {
                    // nothing written yet; not done, not failed
                    DrainState::Nothing => (),
                    DrainState::Complete => {
                        status = Some(ActionStatus::Done);
                        if let Err(err) = self.apply_updates(&commands) {
                            log::error!(
                                "failed to apply updates from action {} - {:#}",
                                action_id, err,
                            );
                            status = Some(ActionStatus::Failed);
                        }
                    }
                    DrainState::Failure => {
                        status = Some(ActionStatus::Failed);
                        if let Err(err) = self.workers[index].terminate() {
                            log::warn!("unable to terminate worker {} - {}", action_id, err);
                        }
                    }
                }

                if state != DrainState::Nothing {
                    self.workers[index].join(JOIN_TIMEOUT);
                }
            }

            let alive = self.workers[index].is_alive();
            if alive {
                match status {
                    None => {
                        index += 1;
                        continue;
                    }
                    Some(assigned) => {
                        let worker = &self.workers[index];
                        log::error!(
                            "executable {} ({}) from user {} is stuck (status {})",
                            worker.title,
                            worker.path.display(),
                            worker.user_name,
                            assigned,
                        );
                    }
                }
            }

            let mut worker = self.workers.remove(index);
            let exit_code = worker.exit_code();

            let status = status.unwrap_or(match exit_code {
                Some(0) => ActionStatus::Done,
                _ => ActionStatus::Failed,
            });

            if !alive {
                log::info!(
                    "executable {} ({}) from user {} completed (exit code {:?}, status {})",
                    worker.title,
                    worker.path.display(),
                    worker.user_name,
                    exit_code,
                    status,
                );
            }

            self.registry.set_result(worker.action_id, status, exit_code)?;
            completed.push((worker.action_id, status));
        }

        Ok(completed)
    }

    /// Apply a command list atomically to the catalog.
    ///
    /// Signals are blocked for the whole apply. The commands run against
    /// a scratch copy first; the live catalog and the persistency store
    /// only change when the entire list applied, so a bad command list
    /// has no effect at all.
    fn apply_commands(&mut self, commands: &CommandList) -> Result<(), Error> {
        let _blocker = SignalBlocker::new()?;

        let mut staged = self.inventory.clone();
        for (command, entity) in commands {
            match command {
                UpdateCommand::Update => staged.update(entity.clone())?,
                UpdateCommand::Delete => staged.delete(entity)?,
            }
        }

        self.store.save_inventory(&staged)?;
        self.inventory = staged;

        for (command, entity) in commands {
            match command {
                UpdateCommand::Update => {
                    log::info!(target: "changelog", "update {}", entity.describe());
                }
                UpdateCommand::Delete => {
                    log::info!(target: "changelog", "delete {}", entity.describe());
                }
            }
        }

        Ok(())
    }

    /// Apply a writer's command list and propagate it to the peers.
    fn apply_updates(&mut self, commands: &CommandList) -> Result<(), Error> {
        self.apply_commands(commands)?;
        self.manager.send_updates(commands)?;
        Ok(())
    }

    /// Follower path: a peer marked us UPDATING and queued a batch on
    /// our update board. Apply it and go back online.
    fn apply_board_updates(&mut self) -> Result<(), Error> {
        if self.manager.get_status()? != Some(HostStatus::Updating) {
            return Ok(());
        }

        log::info!("applying queued updates from the local board");
        let commands = self.manager.get_updates()?;

        match self.apply_commands(&commands) {
            Ok(()) => self.manager.set_status(HostStatus::Online),
            Err(err) => {
                log::error!("failed to apply board updates - {:#}", err);
                self.manager.set_status(HostStatus::Error)?;
                Err(err)
            }
        }
    }

    /// Watch the master connection and our own standing in the fleet.
    fn check_master(&mut self) -> Result<(), Error> {
        if !self.manager.check_connection() {
            // fails with MasterLocal when there is no shadow; that is
            // fatal by design
            log::warn!("lost connection to the master server, failing over");
            self.manager.reconnect_master()?;
            return Ok(());
        }

        match self.manager.get_status()? {
            Some(HostStatus::OutOfSync) => {
                // a peer failed to update us; reload the catalog
                log::warn!("server is out of sync, reloading the catalog");
                self.manager.reset_status()?;
                self.manager.set_status(HostStatus::Starting)?;
                self.reload_inventory()?;
                self.manager.set_status(HostStatus::Online)?;
                Ok(())
            }
            Some(HostStatus::Error) => bail!("server status is ERROR"),
            _ => Ok(()),
        }
    }

    fn reload_inventory(&mut self) -> Result<(), Error> {
        let filters = self.config.load_filters()?;
        self.inventory = self
            .store
            .load_inventory(self.config.inventory.partitions.clone(), &filters)?;
        Ok(())
    }

    /// Terminate every live worker and record the shutdown.
    fn shutdown(&mut self) {
        self.action_lock = None;

        let mut workers = std::mem::replace(&mut self.workers, Vec::new());
        for worker in &mut workers {
            log::warn!(
                "terminating {} ({}) requested by {} (PID {})",
                worker.title,
                worker.path.display(),
                worker.user_name,
                worker.pid(),
            );

            if let Err(err) = worker.terminate() {
                log::warn!("unable to terminate worker {} - {}", worker.action_id, err);
            }
            worker.join(SHUTDOWN_TIMEOUT);
            if worker.is_alive() {
                log::warn!(
                    "child process {} did not return after {} seconds",
                    worker.pid(),
                    SHUTDOWN_TIMEOUT,
                );
            }

            let exit_code = worker.exit_code();
            if let Err(err) =
                self.registry.set_result(worker.action_id, ActionStatus::Killed, exit_code)
            {
                log::error!("unable to record killed action {} - {}", worker.action_id, err);
            }
        }

        self.write_slot = None;

        if let Err(err) = self.manager.set_status(HostStatus::Stopped) {
            log::warn!("unable to record stopped status - {}", err);
        }
        if let Err(err) = self.manager.disconnect() {
            log::warn!("unable to disconnect from the master - {}", err);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::catalog::{CatalogEntity, Dataset, Group};
    use crate::server::board;
    use crate::server::master::{self, MasterStore};
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    fn current_user() -> String {
        let uid = nix::unistd::Uid::current();
        let entry = unsafe { libc::getpwuid(uid.as_raw()) };
        assert!(!entry.is_null());
        unsafe { std::ffi::CStr::from_ptr((*entry).pw_name) }
            .to_string_lossy()
            .to_string()
    }

    fn engine_fixture(dir: &tempfile::TempDir) -> Engine {
        let user = current_user();
        let raw = json!({
            "user": user,
            "read_user": user,
            "master": {
                "module": "file",
                "config": {
                    "path": dir.path().join("master").to_str().unwrap(),
                    "host": "localhost",
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
                    "readonly_config": {
                        "path": dir.path().join("registry").to_str().unwrap(),
                        "readonly": true,
                    },
                },
            },
            "inventory": {
                "persistency": {
                    "module": "file",
                    "config": { "path": dir.path().join("inventory.json").to_str().unwrap() },
                    "readonly_config": {
                        "path": dir.path().join("inventory.json").to_str().unwrap(),
                        "readonly": true,
                    },
                },
            },
        });

        let config: ServerConfig = serde_json::from_value(raw).unwrap();
        let engine = Engine::with_hostname(config, "self.example.org".to_string()).unwrap();

        engine.registry.add_user(5, "operator").unwrap();

        engine
    }

    fn open_master(dir: &tempfile::TempDir) -> Box<dyn MasterStore> {
        master::instantiate(
            "file",
            &json!({
                "path": dir.path().join("master").to_str().unwrap(),
                "host": "localhost",
            }),
        )
        .unwrap()
    }

    fn write_payload(dir: &std::path::Path, script: &str) {
        std::fs::create_dir_all(dir).unwrap();
        let payload = dir.join(worker::PAYLOAD_NAME);
        std::fs::write(&payload, script).unwrap();
        std::fs::set_permissions(&payload, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn reap_until_done(engine: &mut Engine) -> Vec<(i64, ActionStatus)> {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let completed = engine.collect_processes().unwrap();
            if !completed.is_empty() {
                return completed;
            }
            assert!(Instant::now() < deadline, "worker did not complete in time");
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    #[test]
    fn test_startup_goes_online() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_fixture(&dir);

        assert_eq!(engine.manager.status(), HostStatus::Online);
    }

    #[test]
    fn test_first_start_populates_from_sources() {
        let dir = tempfile::tempdir().unwrap();
        let user = current_user();

        let dumps = dir.path().join("sources");
        std::fs::create_dir_all(&dumps).unwrap();
        std::fs::write(
            dumps.join("datasets.json"),
            serde_json::to_vec(&json!([
                { "dataset": "/prod/raw-2024", "dataset_access_type": "VALID" },
            ]))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            dumps.join("blocks.json"),
            serde_json::to_vec(&json!([
                {
                    "dataset": "/prod/raw-2024",
                    "block_name": "/prod/raw-2024#b001",
                    "block_size": 200,
                    "file_count": 2,
                    "open_for_writing": 0,
                },
            ]))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(
            dumps.join("sites.json"),
            serde_json::to_vec(&json!([
                {
                    "name": "T2_US_MIT",
                    "se": "se.mit.example.org",
                    "kind": "Disk",
                    "technology": "dcache",
                },
            ]))
            .unwrap(),
        )
        .unwrap();

        let raw = json!({
            "user": user,
            "read_user": user,
            "master": {
                "module": "file",
                "config": {
                    "path": dir.path().join("master").to_str().unwrap(),
                    "host": "localhost",
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
            "sources": {
                "dataset": {
                    "module": "file",
                    "config": { "path": dumps.to_str().unwrap() },
                },
                "site": {
                    "module": "file",
                    "config": { "path": dumps.to_str().unwrap() },
                },
            },
        });
        let config: ServerConfig = serde_json::from_value(raw.clone()).unwrap();

        let engine = Engine::with_hostname(config, "self.example.org".to_string()).unwrap();

        assert!(engine.inventory.sites.contains_key("T2_US_MIT"));
        assert_eq!(engine.inventory.datasets["/prod/raw-2024"].size, 200);
        assert!(engine
            .inventory
            .find_block("/prod/raw-2024", "b001")
            .is_some());

        // the populated catalog was persisted
        assert_eq!(engine.store.version().unwrap(), 1);
        drop(engine);

        // a restart loads the persisted catalog and does not re-populate
        let config: ServerConfig = serde_json::from_value(raw).unwrap();
        let engine = Engine::with_hostname(config, "self.example.org".to_string()).unwrap();
        assert_eq!(engine.store.version().unwrap(), 1);
        assert!(engine.inventory.datasets.contains_key("/prod/raw-2024"));
    }

    #[test]
    fn test_apply_updates_propagates_to_peers() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(&dir);

        let master = open_master(&dir);
        let board_descriptor = board::BoardDescriptor {
            module: "file".to_string(),
            config: json!({ "path": dir.path().join("peer.board").to_str().unwrap() }),
        };
        master.register_host("peer-a.example.org", &board_descriptor, None).unwrap();
        master.set_status("peer-a.example.org", HostStatus::Online).unwrap();

        let commands: CommandList = vec![
            (UpdateCommand::Update, CatalogEntity::Group(Group::new("prod"))),
            (
                UpdateCommand::Update,
                CatalogEntity::Dataset(Dataset::new("/prod/raw-2024")),
            ),
        ];

        engine.apply_updates(&commands).unwrap();

        assert!(engine.inventory.groups.contains_key("prod"));
        assert!(engine.inventory.datasets.contains_key("/prod/raw-2024"));

        // the persistency store was written
        assert_eq!(engine.store.version().unwrap(), 1);

        // the peer board received exactly the command list
        let peer_board = board::instantiate(
            "file",
            &json!({ "path": dir.path().join("peer.board").to_str().unwrap() }),
        )
        .unwrap();
        assert_eq!(peer_board.get_updates().unwrap(), commands);
        assert_eq!(
            master.get_status("peer-a.example.org").unwrap(),
            Some(HostStatus::Updating),
        );
    }

    #[test]
    fn test_bad_command_list_leaves_catalog_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(&dir);

        let commands: CommandList = vec![
            (UpdateCommand::Update, CatalogEntity::Group(Group::new("prod"))),
            (
                UpdateCommand::Update,
                CatalogEntity::Block(crate::catalog::Block::new("b001", "/prod/nosuch")),
            ),
        ];

        assert!(engine.apply_updates(&commands).is_err());

        // no partial application
        assert!(engine.inventory.groups.is_empty());
        assert_eq!(engine.store.version().unwrap(), 0);
    }

    #[test]
    fn test_write_action_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(&dir);

        let action_dir = dir.path().join("actions/update-catalog");
        let script = concat!(
            "#!/bin/sh\n",
            "echo '{\"cmd\":\"update\",\"object\":{\"type\":\"group\",\"name\":\"prod\"}}' >&3\n",
            "echo '{\"cmd\":\"update\",\"object\":{\"type\":\"dataset\",",
            "\"name\":\"/prod/raw-2024\",\"is_valid\":true,\"is_open\":false,",
            "\"size\":300,\"num_files\":3}}' >&3\n",
            "echo '{\"cmd\":\"eom\"}' >&3\n",
        );
        write_payload(&action_dir, script);

        let checksum = tools::md5sum(script.as_bytes()).unwrap();
        engine.registry.add_authorization("update-catalog", &checksum, 0).unwrap();

        let id = engine
            .registry
            .insert_action("update-catalog", action_dir.to_str().unwrap(), "", 5, true)
            .unwrap();

        assert!(engine.poll_actions().unwrap());
        assert_eq!(engine.registry.get_status(id).unwrap(), Some(ActionStatus::Run));
        assert!(engine.write_slot.is_some());

        let completed = reap_until_done(&mut engine);
        assert_eq!(completed, vec![(id, ActionStatus::Done)]);

        assert!(engine.inventory.groups.contains_key("prod"));
        assert_eq!(engine.inventory.datasets["/prod/raw-2024"].size, 300);
        assert_eq!(
            engine.registry.get_status(id).unwrap(),
            Some(ActionStatus::Done),
        );
    }

    #[test]
    fn test_unauthorized_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(&dir);

        let action_dir = dir.path().join("actions/rogue");
        write_payload(&action_dir, "#!/bin/sh\nexit 0\n");

        let id = engine
            .registry
            .insert_action("rogue", action_dir.to_str().unwrap(), "", 5, true)
            .unwrap();

        assert!(engine.poll_actions().unwrap());
        assert_eq!(
            engine.registry.get_status(id).unwrap(),
            Some(ActionStatus::AuthFailed),
        );
        assert!(engine.write_slot.is_none());
        assert!(engine.workers.is_empty());
    }

    #[test]
    fn test_missing_payload_is_notfound() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(&dir);

        let id = engine
            .registry
            .insert_action("ghost", "/nonexistent/path", "", 5, false)
            .unwrap();

        assert!(engine.poll_actions().unwrap());
        assert_eq!(
            engine.registry.get_status(id).unwrap(),
            Some(ActionStatus::NotFound),
        );
    }

    #[test]
    fn test_aborted_action_kills_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(&dir);

        let action_dir = dir.path().join("actions/long");
        write_payload(&action_dir, "#!/bin/sh\nsleep 60\n");

        let id = engine
            .registry
            .insert_action("long", action_dir.to_str().unwrap(), "", 5, false)
            .unwrap();

        assert!(engine.poll_actions().unwrap());
        assert_eq!(engine.workers.len(), 1);

        // the row is deleted while the action runs
        engine.registry.delete_action(id).unwrap();

        let completed = engine.collect_processes().unwrap();
        assert_eq!(completed, vec![(id, ActionStatus::Killed)]);
        assert!(engine.workers.is_empty());
    }

    #[test]
    fn test_apply_board_updates_as_follower() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_fixture(&dir);

        let commands: CommandList =
            vec![(UpdateCommand::Update, CatalogEntity::Group(Group::new("prod")))];

        let own_board = board::instantiate(
            "file",
            &json!({ "path": dir.path().join("self.board").to_str().unwrap() }),
        )
        .unwrap();
        own_board.write_updates(&commands).unwrap();

        let master = open_master(&dir);
        master.set_status("self.example.org", HostStatus::Updating).unwrap();

        engine.apply_board_updates().unwrap();

        assert!(engine.inventory.groups.contains_key("prod"));
        assert_eq!(
            master.get_status("self.example.org").unwrap(),
            Some(HostStatus::Online),
        );
        assert!(own_board.get_updates().unwrap().is_empty());
    }
}
