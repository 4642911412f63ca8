//! Host liveness state

use std::fmt;

use chrono::{DateTime, Utc};
use kameo_macros::Reply;
use serde::{Deserialize, Serialize};

/// Whether a host's session is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Reply)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Never probed
    #[default]
    Unknown,
    Alive,
    Dead,
}

impl Liveness {
    #[must_use]
    pub fn is_alive(self) -> bool {
        self == Liveness::Alive
    }

    /// Probes only ever resolve to `Alive` or `Dead`
    #[must_use]
    pub fn can_transition_to(self, next: Liveness) -> bool {
        next != Liveness::Unknown
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Liveness::Unknown => "unknown",
            Liveness::Alive => "alive",
            Liveness::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Liveness published by a worker, readable while it is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessState {
    pub liveness: Liveness,
    /// When `liveness` last changed
    pub since: DateTime<Utc>,
}

impl LivenessState {
    #[must_use]
    pub fn new(liveness: Liveness) -> Self {
        Self {
            liveness,
            since: Utc::now(),
        }
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new(Liveness::Unknown)
    }
}

/// Snapshot of one tracked host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    /// Host address
    pub host: String,
    /// Current liveness
    pub liveness: Liveness,
    /// When the liveness last changed
    pub since: DateTime<Utc>,
}
