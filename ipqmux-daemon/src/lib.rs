//! The ipqmux daemon: peer registry, mode aggregation and the event loop that multiplexes
//! one kernel packet queue over many peers.

use std::io;

use thiserror::Error;

mod aggregate;
mod daemon;
mod driver;
mod options;
pub mod registry;
mod stats;

pub use aggregate::{aggregate, ModeAggregator};
pub use daemon::Daemon;
pub use options::DaemonOptions;
pub use registry::{PeerId, PeerInfo, PeerState};
pub use stats::DaemonStats;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Upstream error: {0:?}")]
    Upstream(Box<dyn std::error::Error + Send + Sync>),
    #[error("No valid endpoints to bind to")]
    NoValidEndpoints,
    #[error("Daemon is not bound")]
    NotBound,
    #[error("Daemon is already bound")]
    AlreadyBound,
    #[error("Driver task closed")]
    DriverClosed,
    #[error("Driver task failed: {0:?}")]
    Join(#[from] tokio::task::JoinError),
}
