//! Out-of-band control commands
//!
//! Commands are fire-and-forget: senders never wait for a reply. A background
//! task drains the channel and applies each command in arrival order.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::lifecycle::LifecycleController;

/// Commands accepted by the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Activate the waiting generation without waiting for callers to release
    ForceActivate,
    /// Delete every generation, including the active one
    PurgeAll,
}

/// Error for command names the channel does not understand
#[derive(Debug, Error)]
#[error("Unknown control command: '{0}'. Valid commands: force-activate, purge-all")]
pub struct UnknownCommand(pub String);

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::ForceActivate => "force-activate",
            ControlCommand::PurgeAll => "purge-all",
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "force-activate" => Ok(ControlCommand::ForceActivate),
            "purge-all" => Ok(ControlCommand::PurgeAll),
            _ => Err(UnknownCommand(s.to_string())),
        }
    }
}

/// Applies one command
///
/// `purge-all` goes straight to the store and leaves lifecycle state untouched;
/// strategy writes repopulate the active generation afterwards.
pub fn apply(controller: &LifecycleController, command: ControlCommand) {
    match command {
        ControlCommand::ForceActivate => match controller.force_activate() {
            Some(label) => info!(command = %command, generation = %label, "forced activation"),
            None => info!(command = %command, "nothing waiting; ignored"),
        },
        ControlCommand::PurgeAll => {
            let store = controller.store();
            let labels = match store.list_generations() {
                Ok(labels) => labels,
                Err(e) => {
                    warn!(command = %command, error = %e, "cannot list generations");
                    return;
                }
            };
            for label in &labels {
                if let Err(e) = store.delete(label) {
                    warn!(command = %command, generation = %label, error = %e, "failed to delete generation");
                }
            }
            info!(command = %command, deleted = labels.len(), "purged cache store");
        }
    }
}

/// Handle for sending commands to the background control task
pub struct ControlHandle {
    sender: mpsc::UnboundedSender<ControlCommand>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ControlHandle {
    /// Spawns the task that applies commands against `controller`
    pub fn spawn(controller: Arc<LifecycleController>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ControlCommand>();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Queued commands are applied before a pending shutdown
                    biased;
                    command = receiver.recv() => match command {
                        Some(command) => apply(&controller, command),
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            sender,
            shutdown_tx,
            task,
        }
    }

    /// Delivers a command without waiting for it to be applied
    pub fn send(&self, command: ControlCommand) {
        if self.sender.send(command).is_err() {
            warn!(command = %command, "control task has stopped; command dropped");
        }
    }

    /// Stops the control task once every queued command has been applied
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "control task ended abnormally");
        }
    }
}
