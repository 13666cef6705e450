//! Worker processes and the update channel back to the scheduler.
//!
//! Every action runs its payload executable in a child process under a
//! reduced-privilege account, with stdout/stderr captured next to the
//! payload. The single write-enabled worker additionally inherits the
//! write end of a pipe and streams its update commands back as
//! line-delimited JSON, terminated by an end-of-message record.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{self, Pid, Uid};
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogEntity, CommandList, UpdateCommand};
use crate::registry::Action;
use crate::tools;

/// Payload file expected under an action's path directory.
pub const PAYLOAD_NAME: &str = "exec";

/// Environment handed to payload processes.
pub const STORE_ENV: &str = "REPLICAD_STORE";
pub const REGISTRY_ENV: &str = "REPLICAD_REGISTRY";
pub const READ_ONLY_ENV: &str = "REPLICAD_READ_ONLY";
pub const UPDATE_FD_ENV: &str = "REPLICAD_UPDATE_FD";

/// Fixed fd number the writer's pipe end is mapped to in the child.
const UPDATE_FD: RawFd = 3;

/// Deadline for each channel read once the first message arrived.
const RECV_TIMEOUT_MS: i32 = 60_000;

/// Message frame on the update channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "object", rename_all = "lowercase")]
pub enum WireMessage {
    Update(CatalogEntity),
    Delete(CatalogEntity),
    Eom,
}

/// Outcome of one drain attempt on the update channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainState {
    /// The writer produced nothing yet; try again later.
    Nothing,
    /// The full command list arrived, terminated by end-of-message.
    Complete,
    /// The writer died or stalled past the read deadline.
    Failure,
}

/// Receiving end of a writer's update pipe.
///
/// The pipe stays readable after the child exits, so a completed writer
/// can always be drained.
pub struct UpdateChannel {
    reader: File,
    buffer: Vec<u8>,
}

impl UpdateChannel {

    /// Create the pipe; returns the channel and the raw write end for
    /// the child process.
    pub fn pair() -> Result<(Self, RawFd), Error> {
        let (read_fd, write_fd) = unistd::pipe()
            .map_err(|err| format_err!("unable to create update pipe - {}", err))?;

        // the read end must not leak into the child
        if unsafe { libc::fcntl(read_fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let _ = unistd::close(read_fd);
            let _ = unistd::close(write_fd);
            return Err(std::io::Error::last_os_error().into());
        }

        let reader = unsafe { File::from_raw_fd(read_fd) };

        Ok((Self { reader, buffer: Vec::new() }, write_fd))
    }

    /// Drain the channel.
    ///
    /// The first read never blocks: a writer that produced nothing yet
    /// yields `Nothing` and is polled again on the next reap. Once data
    /// arrived, reads block with a 60 second deadline per message; a
    /// deadline, a closed pipe before end-of-message, or a garbled frame
    /// all yield `Failure` together with the partial list.
    pub fn drain(&mut self) -> (DrainState, CommandList) {
        let mut commands = Vec::new();
        let mut reading = false;

        loop {
            let timeout = if reading { RECV_TIMEOUT_MS } else { 0 };
            match self.next_message(timeout) {
                Ok(Some(WireMessage::Update(entity))) => {
                    reading = true;
                    commands.push((UpdateCommand::Update, entity));
                }
                Ok(Some(WireMessage::Delete(entity))) => {
                    reading = true;
                    commands.push((UpdateCommand::Delete, entity));
                }
                Ok(Some(WireMessage::Eom)) => {
                    log::info!(
                        "received {} update commands from the write-enabled worker",
                        commands.len(),
                    );
                    return (DrainState::Complete, commands);
                }
                Ok(None) => {
                    if reading {
                        return (DrainState::Failure, commands);
                    }
                    return (DrainState::Nothing, commands);
                }
                Err(err) => {
                    log::error!("error reading worker update channel - {}", err);
                    return (DrainState::Failure, commands);
                }
            }
        }
    }

    /// Next full message, or `None` when nothing arrives within
    /// `timeout_ms`. A closed pipe before end-of-message is an error.
    fn next_message(&mut self, timeout_ms: i32) -> Result<Option<WireMessage>, Error> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let message = serde_json::from_slice(&line[..line.len() - 1])
                    .map_err(|err| format_err!("garbled update message - {}", err))?;
                return Ok(Some(message));
            }

            let mut fds = [PollFd::new(self.reader.as_raw_fd(), PollFlags::POLLIN)];
            let ready = poll(&mut fds, timeout_ms)
                .map_err(|err| format_err!("poll on update channel failed - {}", err))?;
            if ready == 0 {
                return Ok(None);
            }

            let mut chunk = [0u8; 4096];
            let count = self.reader.read(&mut chunk)?;
            if count == 0 {
                return Err(format_err!("update channel closed before end-of-message"));
            }
            self.buffer.extend_from_slice(&chunk[..count]);
        }
    }
}

/// A running child worker.
pub struct Worker {
    pub action_id: i64,
    pub title: String,
    pub user_name: String,
    pub path: PathBuf,
    child: Child,
}

/// Spawn the payload of `action` as an isolated child process.
///
/// The child drops to `run_user` (when the daemon runs with root
/// privileges), gets stdout/stderr redirected to `_stdout`/`_stderr`
/// under the action path, a closed stdin, and SIGINT ignored so that a
/// Ctrl+C against the daemon's process group cannot double-kill it.
/// The scheduler only ever stops workers with SIGTERM.
pub fn spawn(
    action: &Action,
    user_name: &str,
    run_user: &str,
    environment: &[(String, String)],
    update_fd: Option<RawFd>,
) -> Result<Worker, Error> {
    let result = spawn_inner(action, user_name, run_user, environment, update_fd);

    // the parent has no use for the write end either way
    if let Some(fd) = update_fd {
        let _ = unistd::close(fd);
    }

    result
}

fn spawn_inner(
    action: &Action,
    user_name: &str,
    run_user: &str,
    environment: &[(String, String)],
    update_fd: Option<RawFd>,
) -> Result<Worker, Error> {
    let path = PathBuf::from(&action.path);
    let payload = path.join(PAYLOAD_NAME);

    let args = tools::split_args(&action.args)?;
    let (uid, gid) = tools::getpwnam_ugid(run_user)?;

    let stdout = output_file(&path, "_stdout")?;
    let stderr = output_file(&path, "_stderr")?;

    let mut command = Command::new(&payload);
    command
        .arg0(&payload)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .env(READ_ONLY_ENV, if update_fd.is_some() { "0" } else { "1" });

    for (name, value) in environment {
        command.env(name, value);
    }

    if update_fd.is_some() {
        command.env(UPDATE_FD_ENV, UPDATE_FD.to_string());
    }

    let drop_privileges = Uid::effective().is_root();

    unsafe {
        command.pre_exec(move || {
            // only async-signal-safe calls from here on
            libc::signal(libc::SIGINT, libc::SIG_IGN);

            if let Some(fd) = update_fd {
                if fd != UPDATE_FD && libc::dup2(fd, UPDATE_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if drop_privileges {
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let child = command.spawn().map_err(|err| {
        format_err!("unable to spawn payload {:?} - {}", payload, err)
    })?;

    Ok(Worker {
        action_id: action.id,
        title: action.title.clone(),
        user_name: user_name.to_string(),
        path,
        child,
    })
}

fn output_file(path: &Path, name: &str) -> Result<File, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.join(name))
        .map_err(|err| format_err!("unable to open {:?}/{} - {}", path, name, err))
}

impl Worker {

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code of the child, when it has terminated.
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    /// Send SIGTERM, escalating the effective uid for just the kill.
    ///
    /// The daemon may be running with a dropped effective uid; the
    /// child runs under another account, so plain kill would fail.
    pub fn terminate(&mut self) -> Result<(), Error> {
        let saved = Uid::effective();
        let escalated = !saved.is_root() && unistd::seteuid(Uid::from_raw(0)).is_ok();

        let result = kill(Pid::from_raw(self.child.id() as i32), Signal::SIGTERM);

        if escalated {
            let _ = unistd::seteuid(saved);
        }

        result.map_err(|err| format_err!("unable to terminate worker - {}", err))
    }

    /// Wait up to `timeout` seconds for the child to exit.
    pub fn join(&mut self, timeout: u64) -> Option<i32> {
        let deadline = Instant::now() + Duration::from_secs(timeout);
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) => (),
                Err(_) => return None,
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}
