//! Router phase and status reporting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which backend the router currently delegates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterPhase {
    /// Signed out; everything goes to on-device storage.
    Local,
    /// Local data is being pushed to the server; storage calls wait.
    Migrating,
    /// Signed in; everything goes to the remote adapter.
    Cloud,
}

impl RouterPhase {
    pub fn is_authenticated(self) -> bool {
        !matches!(self, RouterPhase::Local)
    }
}

impl fmt::Display for RouterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouterPhase::Local => "local",
            RouterPhase::Migrating => "migrating",
            RouterPhase::Cloud => "cloud",
        };
        f.write_str(name)
    }
}

/// Snapshot returned by `StorageRouter::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatus {
    pub phase: RouterPhase,
    pub is_authenticated: bool,
    pub is_online: bool,
    /// Remote writes waiting for connectivity.
    pub queue_size: usize,
}
