//! Action queue and executable authorization registry.
//!
//! The registry is the typed interface over the scheduler's bookkeeping
//! tables: the action queue, the user table and the authorized-executables
//! table. This backend keeps them in flock-guarded JSON files; workers get
//! a read-only connection to the same files.

use std::fs::File;
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools;

const LOCK_TIMEOUT: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    New,
    Run,
    Done,
    Failed,
    Killed,
    NotFound,
    AuthFailed,
}

impl std::fmt::Display for ActionStatus {

    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ActionStatus::New => "new",
            ActionStatus::Run => "run",
            ActionStatus::Done => "done",
            ActionStatus::Failed => "failed",
            ActionStatus::Killed => "killed",
            ActionStatus::NotFound => "notfound",
            ActionStatus::AuthFailed => "authfailed",
        };
        write!(f, "{}", name)
    }
}

/// A queued user-submitted executable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub id: i64,
    pub title: String,
    pub path: String,
    pub args: String,
    pub user_id: i64,
    pub timestamp: i64,
    pub status: ActionStatus,
    pub exit_code: Option<i32>,
    pub write_request: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: i64,
    pub name: String,
}

/// (title, checksum, user) tuple authorizing a write-enabled executable.
/// `user_id` 0 is the wildcard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthorizedExecutable {
    pub title: String,
    pub checksum: String,
    pub user_id: i64,
}

#[derive(Deserialize)]
struct RegistryBackendConfig {
    path: String,
    #[serde(default)]
    readonly: bool,
}

/// Guard for the action table write lock.
pub struct RegistryLock {
    _file: File,
}

pub struct Registry {
    path: PathBuf,
    readonly: bool,
}

impl Registry {

    pub fn open(config: &Value) -> Result<Self, Error> {
        let config: RegistryBackendConfig = serde_json::from_value(config.clone())
            .map_err(|err| format_err!("invalid registry backend config - {}", err))?;

        let path = PathBuf::from(config.path);
        if !config.readonly {
            std::fs::create_dir_all(&path)
                .map_err(|err| format_err!("unable to create registry at {:?} - {}", path, err))?;
        }

        Ok(Self { path, readonly: config.readonly })
    }

    /// Take the action table write lock.
    ///
    /// Held across the poll-select-spawn sequence of the scheduler; the
    /// guard releases the lock when dropped.
    pub fn lock(&self) -> Result<RegistryLock, Error> {
        let file = tools::open_file_locked(self.path.join("actions.lck"), LOCK_TIMEOUT)?;
        Ok(RegistryLock { _file: file })
    }

    fn read_actions(&self) -> Result<Vec<Action>, Error> {
        self.read_table("actions.json")
    }

    fn read_users(&self) -> Result<Vec<UserEntry>, Error> {
        self.read_table("users.json")
    }

    fn read_authorized(&self) -> Result<Vec<AuthorizedExecutable>, Error> {
        self.read_table("authorized.json")
    }

    fn read_table<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, Error> {
        let path = self.path.join(name);
        match tools::file_read_optional_string(&path)? {
            Some(contents) => serde_json::from_str(&contents)
                .map_err(|err| format_err!("corrupt registry table {:?} - {}", path, err)),
            None => Ok(Vec::new()),
        }
    }

    fn write_table<T: Serialize>(&self, name: &str, rows: &[T]) -> Result<(), Error> {
        if self.readonly {
            bail!("registry at {:?} is read-only", self.path);
        }
        let raw = serde_json::to_vec_pretty(rows)?;
        tools::replace_file(self.path.join(name), &raw, None)
    }

    /// Oldest action in state `new`, joined with its user name.
    ///
    /// With `exclude_writes` set, write-requesting actions are not
    /// considered; the scheduler uses this while a writer is running.
    pub fn poll_new(&self, exclude_writes: bool) -> Result<Option<(Action, String)>, Error> {
        let users = self.read_users()?;

        let mut candidates: Vec<Action> = self
            .read_actions()?
            .into_iter()
            .filter(|a| a.status == ActionStatus::New)
            .filter(|a| !(exclude_writes && a.write_request))
            .filter(|a| users.iter().any(|u| u.id == a.user_id))
            .collect();

        candidates.sort_by_key(|a| (a.timestamp, a.id));

        Ok(candidates.into_iter().next().map(|action| {
            let name = users
                .iter()
                .find(|u| u.id == action.user_id)
                .map(|u| u.name.clone())
                .unwrap_or_default();
            (action, name)
        }))
    }

    pub fn get_status(&self, id: i64) -> Result<Option<ActionStatus>, Error> {
        Ok(self
            .read_actions()?
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.status))
    }

    /// Update the status of an action. A vanished row is not an error;
    /// actions can be deleted from the outside while they run.
    pub fn set_status(&self, id: i64, status: ActionStatus) -> Result<(), Error> {
        let mut actions = self.read_actions()?;
        match actions.iter_mut().find(|a| a.id == id) {
            Some(action) => action.status = status,
            None => return Ok(()),
        }
        self.write_table("actions.json", &actions)
    }

    /// Persist the terminal status and the worker exit code of an action.
    pub fn set_result(
        &self,
        id: i64,
        status: ActionStatus,
        exit_code: Option<i32>,
    ) -> Result<(), Error> {
        let mut actions = self.read_actions()?;
        match actions.iter_mut().find(|a| a.id == id) {
            Some(action) => {
                action.status = status;
                action.exit_code = exit_code;
            }
            None => return Ok(()),
        }
        self.write_table("actions.json", &actions)
    }

    /// Check the authorization table for (title, checksum) under the
    /// given user. The wildcard user id 0 authorizes everyone.
    pub fn authorized(&self, title: &str, checksum: &str, user_id: i64) -> Result<bool, Error> {
        for entry in self.read_authorized()? {
            if entry.title == title
                && entry.checksum == checksum
                && (entry.user_id == 0 || entry.user_id == user_id)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn insert_action(
        &self,
        title: &str,
        path: &str,
        args: &str,
        user_id: i64,
        write_request: bool,
    ) -> Result<i64, Error> {
        let mut actions = self.read_actions()?;
        let id = actions.iter().map(|a| a.id).max().unwrap_or(0) + 1;

        actions.push(Action {
            id,
            title: title.to_string(),
            path: path.to_string(),
            args: args.to_string(),
            user_id,
            timestamp: tools::epoch_now(),
            status: ActionStatus::New,
            exit_code: None,
            write_request,
        });

        self.write_table("actions.json", &actions)?;

        Ok(id)
    }

    pub fn delete_action(&self, id: i64) -> Result<(), Error> {
        let mut actions = self.read_actions()?;
        actions.retain(|a| a.id != id);
        self.write_table("actions.json", &actions)
    }

    pub fn add_user(&self, id: i64, name: &str) -> Result<(), Error> {
        let mut users = self.read_users()?;
        users.retain(|u| u.id != id);
        users.push(UserEntry { id, name: name.to_string() });
        self.write_table("users.json", &users)
    }

    pub fn add_authorization(
        &self,
        title: &str,
        checksum: &str,
        user_id: i64,
    ) -> Result<(), Error> {
        let mut authorized = self.read_authorized()?;
        authorized.push(AuthorizedExecutable {
            title: title.to_string(),
            checksum: checksum.to_string(),
            user_id,
        });
        self.write_table("authorized.json", &authorized)
    }

    /// Items of copy requests that were submitted but not handled yet.
    /// Consumed by the demand producers of the policy layer.
    pub fn pending_copy_items(&self) -> Result<Vec<String>, Error> {
        let path = self.path.join("copies.json");
        match tools::file_read_optional_string(&path)? {
            Some(contents) => serde_json::from_str(&contents)
                .map_err(|err| format_err!("corrupt registry table {:?} - {}", path, err)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    fn test_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::json!({ "path": dir.path().to_str().unwrap() });
        let registry = Registry::open(&config).unwrap();
        registry.add_user(5, "operator").unwrap();
        (dir, registry)
    }

    #[test]
    fn test_poll_returns_oldest_new_action() {
        let (_dir, registry) = test_registry();

        let first = registry.insert_action("sync", "/opt/a", "", 5, false).unwrap();
        let second = registry.insert_action("clean", "/opt/b", "", 5, false).unwrap();
        assert!(second > first);

        let (action, user) = registry.poll_new(false).unwrap().unwrap();
        assert_eq!(action.id, first);
        assert_eq!(user, "operator");

        registry.set_status(first, ActionStatus::Run).unwrap();
        let (action, _) = registry.poll_new(false).unwrap().unwrap();
        assert_eq!(action.id, second);
    }

    #[test]
    fn test_single_writer_exclusion() {
        let (_dir, registry) = test_registry();

        let older_writer = registry.insert_action("w1", "/opt/w1", "", 5, true).unwrap();
        let newer_writer = registry.insert_action("w2", "/opt/w2", "", 5, true).unwrap();
        let reader = registry.insert_action("r", "/opt/r", "", 5, false).unwrap();

        // the older writer starts
        let (action, _) = registry.poll_new(false).unwrap().unwrap();
        assert_eq!(action.id, older_writer);
        registry.set_status(older_writer, ActionStatus::Run).unwrap();

        // while it runs, only the reader is eligible
        let (action, _) = registry.poll_new(true).unwrap().unwrap();
        assert_eq!(action.id, reader);
        registry.set_status(reader, ActionStatus::Run).unwrap();

        assert!(registry.poll_new(true).unwrap().is_none());
        assert_eq!(
            registry.get_status(newer_writer).unwrap(),
            Some(ActionStatus::New),
        );
    }

    #[test]
    fn test_actions_without_user_are_ignored() {
        let (_dir, registry) = test_registry();

        registry.insert_action("orphan", "/opt/x", "", 99, false).unwrap();
        assert!(registry.poll_new(false).unwrap().is_none());
    }

    #[test]
    fn test_authorization_wildcard() {
        let (_dir, registry) = test_registry();

        registry.add_authorization("sync", "abcd", 0).unwrap();
        registry.add_authorization("clean", "ef01", 7).unwrap();

        assert!(registry.authorized("sync", "abcd", 5).unwrap());
        assert!(!registry.authorized("sync", "ffff", 5).unwrap());
        assert!(registry.authorized("clean", "ef01", 7).unwrap());
        assert!(!registry.authorized("clean", "ef01", 5).unwrap());
    }

    #[test]
    fn test_set_result_records_exit_code() {
        let (_dir, registry) = test_registry();

        let id = registry.insert_action("sync", "/opt/a", "", 5, false).unwrap();
        registry.set_result(id, ActionStatus::Failed, Some(3)).unwrap();

        let actions = registry.read_actions().unwrap();
        assert_eq!(actions[0].status, ActionStatus::Failed);
        assert_eq!(actions[0].exit_code, Some(3));
    }
}
