//! Execution contract for worker payloads.
//!
//! A payload is an executable named `exec` under the action's path.
//! Payloads built against this crate call [ExecutionContext::init] as
//! their first step: it picks up the environment the scheduler prepared,
//! loads the catalog through a read-only store connection, opens the
//! read-only registry and installs the SIGTERM conversion. Write-enabled
//! payloads record their catalog mutations through the context and
//! stream them back to the scheduler with [ExecutionContext::finish].

use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;

use anyhow::{bail, format_err, Error};

use crate::catalog::{
    store, CatalogEntity, CommandList, Inventory, LoadFilters, UpdateCommand,
};
use crate::config::ModuleHandle;
use crate::registry::Registry;
use crate::server::worker::{
    WireMessage, READ_ONLY_ENV, REGISTRY_ENV, STORE_ENV, UPDATE_FD_ENV,
};
use crate::tools::signaling;

pub struct ExecutionContext {
    pub inventory: Inventory,
    pub registry: Registry,
    pub read_only: bool,
    commands: CommandList,
    update_pipe: Option<File>,
}

impl ExecutionContext {

    /// Build the context from the environment set up by the scheduler.
    pub fn init() -> Result<Self, Error> {
        // SIGINT is already ignored; SIGTERM becomes a cancellation flag
        signaling::convert_termination()?;

        let store_handle: ModuleHandle = serde_json::from_str(
            &std::env::var(STORE_ENV)
                .map_err(|_| format_err!("{} not set - not started by the scheduler?", STORE_ENV))?,
        )?;
        let store = store::instantiate(&store_handle.module, &store_handle.config)?;
        let inventory = store.load_inventory(Vec::new(), &LoadFilters::default())?;

        let registry_handle: ModuleHandle = serde_json::from_str(
            &std::env::var(REGISTRY_ENV)
                .map_err(|_| format_err!("{} not set - not started by the scheduler?", REGISTRY_ENV))?,
        )?;
        let registry = Registry::open(&registry_handle.config)?;

        let read_only = std::env::var(READ_ONLY_ENV).as_deref() != Ok("0");

        let update_pipe = match std::env::var(UPDATE_FD_ENV) {
            Ok(fd) => {
                let fd: i32 = fd
                    .parse()
                    .map_err(|_| format_err!("invalid {} value '{}'", UPDATE_FD_ENV, fd))?;
                Some(unsafe { File::from_raw_fd(fd) })
            }
            Err(_) => None,
        };

        Ok(Self {
            inventory,
            registry,
            read_only,
            commands: Vec::new(),
            update_pipe,
        })
    }

    /// Cooperative cancellation checkpoint; set by SIGTERM.
    pub fn interrupted() -> bool {
        signaling::terminated()
    }

    /// Record an update command and apply it to the local catalog copy.
    pub fn update(&mut self, entity: CatalogEntity) -> Result<(), Error> {
        if self.read_only {
            bail!("update called on a read-only context");
        }

        self.inventory.update(entity.clone())?;
        self.commands.push((UpdateCommand::Update, entity));

        Ok(())
    }

    /// Record a delete command and apply it to the local catalog copy.
    pub fn delete(&mut self, entity: CatalogEntity) -> Result<(), Error> {
        if self.read_only {
            bail!("delete called on a read-only context");
        }

        self.inventory.delete(&entity)?;
        self.commands.push((UpdateCommand::Delete, entity));

        Ok(())
    }

    pub fn commands(&self) -> &CommandList {
        &self.commands
    }

    /// Stream the recorded commands to the scheduler, terminated by
    /// end-of-message. Must be the payload's last catalog operation.
    pub fn finish(mut self) -> Result<(), Error> {
        let mut pipe = match self.update_pipe.take() {
            Some(pipe) => pipe,
            None => return Ok(()),
        };

        eprintln!(
            "sending {} update commands to the server process",
            self.commands.len(),
        );

        for (command, entity) in self.commands.drain(..) {
            let message = match command {
                UpdateCommand::Update => WireMessage::Update(entity),
                UpdateCommand::Delete => WireMessage::Delete(entity),
            };
            let raw = serde_json::to_string(&message)?;
            writeln!(pipe, "{}", raw)?;
        }

        writeln!(pipe, "{}", serde_json::to_string(&WireMessage::Eom)?)?;
        pipe.flush()?;

        Ok(())
    }
}
