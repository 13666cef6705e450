//! Fleet coordination and the execution scheduler.

use thiserror::Error;

pub mod board;
pub mod engine;
pub mod host;
pub mod manager;
pub mod master;
pub mod worker;

pub use board::{instantiate as instantiate_board, BoardDescriptor, FileBoard, UpdateBoard};
pub use engine::Engine;
pub use host::{HostStatus, Peer};
pub use manager::ServerManager;
pub use master::{
    instantiate as instantiate_master, FileMaster, MasterStore, StoreDescriptor,
};
pub use worker::{DrainState, UpdateChannel, Worker};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ServerError {

    /// This host is, or was just found to be, out of sync with the fleet.
    #[error("server out of sync")]
    OutOfSync,

    /// No remote persistency store is available.
    #[error("could not find a remote persistency store to connect to")]
    NoStore,

    /// Fail-over was requested but the master was local, so no shadow exists.
    #[error("cannot reconnect to a local master without a shadow")]
    MasterLocal,
}
