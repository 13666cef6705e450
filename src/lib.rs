//! Replicad - distributed dataset placement daemon.
//!
//! A fleet of engine instances shares a catalog of datasets, blocks,
//! sites, groups and block placements. One instance is the authoritative
//! master; the others replicate catalog state through per-host update
//! boards. Each instance polls an action queue and runs user-submitted
//! payloads in isolated child processes; at most one write-enabled
//! payload runs fleet-wide at a time, and its update commands are
//! applied atomically and propagated to every online peer.

pub mod catalog;
pub mod config;
pub mod executable;
pub mod policy;
pub mod registry;
pub mod server;
pub mod source;
pub mod tools;
