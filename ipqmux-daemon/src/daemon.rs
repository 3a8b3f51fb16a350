use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

use ipqmux_common::MessageQueue;
use ipqmux_transport::{Listener, Upstream};

use crate::{
    aggregate::ModeAggregator,
    driver::{Command, DaemonDriver},
    registry::{PeerInfo, Registry},
    DaemonError, DaemonOptions, DaemonStats,
};

/// Buffer of the front-end command channel.
const COMMAND_BUFFER_SIZE: usize = 16;

/// The multiplexing daemon.
///
/// Fans one [`Upstream`] packet queue out to peers connecting on a [`Listener`]. All work is
/// done by a driver task spawned in [`Daemon::bind`]; this front-end only holds the shared
/// stats and a command channel into the driver.
#[derive(Debug)]
pub struct Daemon<L: Listener> {
    /// Options shared with the driver.
    options: Arc<DaemonOptions>,
    /// Statistics shared with the driver.
    stats: Arc<DaemonStats>,
    /// The listener. Moved into the driver task once the daemon is bound.
    listener: Option<L>,
    /// The address the listener is bound to.
    local_addr: Option<L::Addr>,
    /// Command channel into the driver.
    commands: Option<mpsc::Sender<Command>>,
    /// Internal task representing a running [`DaemonDriver`].
    driver_task: Option<JoinHandle<Result<(), DaemonError>>>,
}

impl<L: Listener> Daemon<L> {
    /// Creates a new daemon with the default [`DaemonOptions`].
    pub fn new(listener: L) -> Self {
        Self::with_options(listener, DaemonOptions::default())
    }

    /// Creates a new daemon with the given options.
    pub fn with_options(listener: L, options: DaemonOptions) -> Self {
        Self {
            options: Arc::new(options),
            stats: Arc::new(DaemonStats::default()),
            listener: Some(listener),
            local_addr: None,
            commands: None,
            driver_task: None,
        }
    }

    /// Binds the listener to `addr` and starts serving `upstream`. This spawns the driver
    /// task.
    pub async fn bind<U: Upstream>(&mut self, addr: L::Addr, upstream: U) -> Result<(), DaemonError> {
        let Some(mut listener) = self.listener.take() else {
            return Err(DaemonError::AlreadyBound);
        };

        tokio::fs::create_dir_all(&self.options.runtime_dir).await?;

        if let Err(e) = listener.bind(addr.clone()).await {
            warn!(err = ?e, ?addr, "failed to bind");
            self.listener = Some(listener);
            return Err(e.into());
        }

        let Some(local_addr) = listener.local_addr() else {
            return Err(DaemonError::NoValidEndpoints);
        };

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);

        let mut housekeeping = tokio::time::interval(self.options.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let span = tracing::info_span!(parent: None, "ipqmux_driver", ?local_addr);
        span.in_scope(|| {
            debug!(runtime_dir = ?self.options.runtime_dir, "listening");
        });

        let driver = DaemonDriver {
            listener,
            upstream,
            upstream_queue: MessageQueue::new(),
            registry: Registry::new(&self.options),
            peer_ids: Vec::new(),
            aggregator: ModeAggregator::new(),
            options: Arc::clone(&self.options),
            stats: Arc::clone(&self.stats),
            commands: commands_rx,
            housekeeping,
            shutting_down: false,
            span,
        };

        self.driver_task = Some(tokio::spawn(driver));
        self.local_addr = Some(local_addr);
        self.commands = Some(commands_tx);

        Ok(())
    }

    /// Returns the statistics for this daemon.
    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    /// Returns the options this daemon runs with.
    pub fn options(&self) -> &DaemonOptions {
        &self.options
    }

    /// Returns the address the listener is bound to. `None` if the daemon is not bound.
    pub fn local_addr(&self) -> Option<&L::Addr> {
        self.local_addr.as_ref()
    }

    /// Returns a diagnostic snapshot of all connected peers.
    pub async fn peers(&self) -> Result<Vec<PeerInfo>, DaemonError> {
        let commands = self.commands.as_ref().ok_or(DaemonError::NotBound)?;

        let (tx, rx) = oneshot::channel();
        commands.send(Command::Snapshot(tx)).await.map_err(|_| DaemonError::DriverClosed)?;
        rx.await.map_err(|_| DaemonError::DriverClosed)
    }

    /// Disconnects all peers, answers their outstanding packets upstream and waits for the
    /// driver to finish.
    pub async fn shutdown(&mut self) -> Result<(), DaemonError> {
        if let Some(commands) = self.commands.take() {
            // A closed channel means the driver is already gone, `join` reports why.
            let _ = commands.send(Command::Shutdown).await;
        }

        self.join().await
    }

    /// Waits for the driver task to finish, returning its result.
    pub async fn join(&mut self) -> Result<(), DaemonError> {
        let task = self.driver_task.take().ok_or(DaemonError::NotBound)?;
        task.await?
    }
}
