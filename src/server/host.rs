use serde::{Deserialize, Serialize};

use super::board::UpdateBoard;

/// Status of an engine instance as recorded in the master store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Initial,
    Starting,
    Online,
    Updating,
    OutOfSync,
    Error,
    Stopped,
}

impl Default for HostStatus {

    fn default() -> Self {
        HostStatus::Initial
    }
}

impl std::fmt::Display for HostStatus {

    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            HostStatus::Initial => "initial",
            HostStatus::Starting => "starting",
            HostStatus::Online => "online",
            HostStatus::Updating => "updating",
            HostStatus::OutOfSync => "outofsync",
            HostStatus::Error => "error",
            HostStatus::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Handle to another engine instance in the fleet.
pub struct Peer {
    pub hostname: String,
    pub board: Box<dyn UpdateBoard>,
    pub has_store: bool,
    pub status: HostStatus,
}
