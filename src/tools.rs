//! Shared helpers used across the daemon.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, format_err, Error};
use nix::fcntl::{flock, FlockArg};
use nix::sys::stat;
use nix::unistd;
use openssl::hash::{hash, MessageDigest};
use regex::Regex;

pub mod signaling;

/// Atomically replace the contents of `path`.
///
/// The data is written to a temporary file in the same directory and
/// moved over the target with a rename, so concurrent readers see
/// either the old or the new contents, never a mix.
pub fn replace_file<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    perm: Option<stat::Mode>,
) -> Result<(), Error> {

    let path = path.as_ref();

    // Note: we use mkstemp here, because this works with different
    // processes and threads.
    let mut template = path.to_owned();
    template.set_extension("tmp_XXXXXX");
    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok((fd, path)) => (fd, path),
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    let tmp_path = tmp_path.as_path();

    let mode: stat::Mode = perm.unwrap_or(stat::Mode::from(
        stat::Mode::S_IRUSR | stat::Mode::S_IWUSR |
        stat::Mode::S_IRGRP | stat::Mode::S_IROTH
    ));

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    use std::os::unix::io::FromRawFd;
    let mut file = unsafe { File::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(tmp_path);
        bail!("write failed: {}", err);
    }

    if let Err(err) = std::fs::rename(tmp_path, path) {
        let _ = unistd::unlink(tmp_path);
        bail!("atomic rename failed for file {:?} - {}", path, err);
    }

    Ok(())
}

/// Read a file into a string, mapping a missing file to `None`.
pub fn file_read_optional_string<P: AsRef<Path>>(path: P) -> Result<Option<String>, Error> {

    let path = path.as_ref();

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() == ErrorKind::NotFound {
                return Ok(None);
            }
            bail!("unable to open {:?} - {}", path, err);
        }
    };

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|err| format_err!("unable to read {:?} - {}", path, err))?;

    Ok(Some(contents))
}

/// Open `filename` and acquire an exclusive flock on it.
///
/// The lock is released when the returned file handle is dropped.
pub fn open_file_locked<P: AsRef<Path>>(
    filename: P,
    timeout: u64,
) -> Result<File, Error> {

    let path = filename.as_ref();
    let lockfile = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(path) {
            Ok(file) => file,
            Err(err) => bail!("unable to open lock {:?} - {}", path, err),
        };

    let fd = lockfile.as_raw_fd();

    let now = std::time::SystemTime::now();
    loop {
        if flock(fd, FlockArg::LockExclusiveNonblock).is_ok() {
            break;
        }

        match now.elapsed() {
            Ok(elapsed) => {
                if elapsed.as_secs() >= timeout {
                    bail!("unable to acquire lock {:?} - got timeout", path);
                }
            }
            Err(err) => {
                bail!("unable to acquire lock {:?} - clock problems - {}", path, err);
            }
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    Ok(lockfile)
}

pub fn digest_to_hex(digest: &[u8]) -> String {
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// MD5 checksum of `data` as a lowercase hex string.
pub fn md5sum(data: &[u8]) -> Result<String, Error> {
    let digest = hash(MessageDigest::md5(), data)?;
    Ok(digest_to_hex(&digest))
}

/// Seconds since the Unix epoch.
pub fn epoch_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Lookup uid/gid of a system user.
pub fn getpwnam_ugid(username: &str) -> Result<(libc::uid_t, libc::gid_t), Error> {

    let cname = CString::new(username)
        .map_err(|_| format_err!("invalid user name '{}'", username))?;

    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buffer = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buffer.as_mut_ptr() as *mut libc::c_char,
            buffer.len(),
            &mut result,
        )
    };

    if rc != 0 || result.is_null() {
        bail!("unable to look up user '{}'", username);
    }

    Ok((pwd.pw_uid, pwd.pw_gid))
}

/// Local host name.
pub fn hostname() -> Result<String, Error> {

    let mut buffer = vec![0u8; 256];
    let name = unistd::gethostname(&mut buffer)
        .map_err(|err| format_err!("gethostname failed - {}", err))?;

    Ok(name.to_string_lossy().to_string())
}

/// Split a command line into words using shell-like rules.
///
/// Single quotes preserve everything, double quotes allow backslash
/// escapes for `"` and `\`, an unquoted backslash escapes the next
/// character. Unterminated quotes are an error.
pub fn split_args(args: &str) -> Result<Vec<String>, Error> {

    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;

    let mut chars = args.chars();
    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' => {
                if in_word {
                    words.push(std::mem::replace(&mut current, String::new()));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => bail!("unterminated single quote in argument list"),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            match chars.next() {
                                Some(c @ '"') | Some(c @ '\\') => current.push(c),
                                Some(c) => {
                                    current.push('\\');
                                    current.push(c);
                                }
                                None => bail!("unterminated double quote in argument list"),
                            }
                        }
                        Some(c) => current.push(c),
                        None => bail!("unterminated double quote in argument list"),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => bail!("trailing backslash in argument list"),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

/// Compile a shell-style wildcard pattern (`*`, `?`) into an anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex, Error> {

    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr)
        .map_err(|err| format_err!("invalid wildcard pattern '{}' - {}", pattern, err))
}
