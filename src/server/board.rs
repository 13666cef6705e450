//! Per-host update boards.
//!
//! An update board is a durable queue of update commands waiting to be
//! applied by its owner. The master writes a whole command batch
//! atomically; the owner reads and flushes under the board lock, so a
//! reader sees either the full batch or none of it.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{CatalogEntity, CommandList, UpdateCommand};
use crate::tools;

const LOCK_TIMEOUT: u64 = 600;

/// Addressable handle of a host's update board, served by the master store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoardDescriptor {
    pub module: String,
    pub config: Value,
}

pub trait UpdateBoard: Send {

    fn lock(&self) -> Result<(), Error>;

    fn unlock(&self) -> Result<(), Error>;

    /// All queued commands, in the order they were appended.
    fn get_updates(&self) -> Result<CommandList, Error>;

    /// Clear the board after a successful apply.
    fn flush(&self) -> Result<(), Error>;

    /// Append a command batch atomically.
    fn write_updates(&self, commands: &[(UpdateCommand, CatalogEntity)]) -> Result<(), Error>;
}

/// Construct an update board client from its descriptor parts.
pub fn instantiate(module: &str, config: &Value) -> Result<Box<dyn UpdateBoard>, Error> {
    match module {
        "file" => Ok(Box::new(FileBoard::new(config)?)),
        _ => bail!("unknown update board module '{}'", module),
    }
}

#[derive(Deserialize)]
struct FileBoardConfig {
    path: String,
}

/// Update board backed by a JSON file next to a flock lock file.
pub struct FileBoard {
    path: PathBuf,
    lock: Mutex<Option<File>>,
}

impl FileBoard {

    pub fn new(config: &Value) -> Result<Self, Error> {
        let config: FileBoardConfig = serde_json::from_value(config.clone())
            .map_err(|err| format_err!("invalid update board config - {}", err))?;

        Ok(Self { path: PathBuf::from(config.path), lock: Mutex::new(None) })
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.set_extension("lck");
        path
    }

    fn read_commands(&self) -> Result<CommandList, Error> {
        match tools::file_read_optional_string(&self.path)? {
            Some(contents) => serde_json::from_str(&contents)
                .map_err(|err| format_err!("corrupt update board {:?} - {}", self.path, err)),
            None => Ok(Vec::new()),
        }
    }
}

impl UpdateBoard for FileBoard {

    fn lock(&self) -> Result<(), Error> {
        let file = tools::open_file_locked(self.lock_path(), LOCK_TIMEOUT)?;
        *self.lock.lock().unwrap() = Some(file);
        Ok(())
    }

    fn unlock(&self) -> Result<(), Error> {
        self.lock.lock().unwrap().take();
        Ok(())
    }

    fn get_updates(&self) -> Result<CommandList, Error> {
        self.read_commands()
    }

    fn flush(&self) -> Result<(), Error> {
        tools::replace_file(&self.path, b"[]", None)
    }

    fn write_updates(&self, commands: &[(UpdateCommand, CatalogEntity)]) -> Result<(), Error> {
        let _lock = tools::open_file_locked(self.lock_path(), LOCK_TIMEOUT)?;

        let mut queued = self.read_commands()?;
        queued.extend(commands.iter().cloned());

        let raw = serde_json::to_vec(&queued)?;
        tools::replace_file(&self.path, &raw, None)
    }
}
