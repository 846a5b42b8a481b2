//! Background control thread.
//!
//! All control-path work runs on a single dedicated thread, the *conductor*:
//! opening and closing subscriptions, advancing the publisher limit and
//! recycling drained partitions. Producers and consumers never perform these
//! tasks themselves; they only nudge the conductor through a command channel.
//! Keeping the control path single-threaded means the subscriber registry has
//! one writer and the limit calculation never races itself.
//!
//! The channel is edge-triggered: consumers fire a cheap `DataConsumed`
//! signal after every successful poll, and the conductor drains the queue
//! before acting, so a burst of signals collapses into one limit update.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::dispatcher::Inner;
use crate::error::DispatcherError;
use crate::subscription::Subscription;

/// Commands understood by the conductor thread.
#[derive(Debug)]
pub(crate) enum ConductorCommand {
    /// A subscriber advanced its position. Coalesced; carries no payload.
    DataConsumed,

    /// Register a new subscription under `name`.
    Open {
        name: String,
        reply: Sender<Result<Arc<Subscription>, DispatcherError>>,
    },

    /// Unregister the subscription named `name`.
    Close {
        name: String,
        reply: Sender<Result<(), DispatcherError>>,
    },

    /// Look up an existing subscription by name.
    Lookup {
        name: String,
        reply: Sender<Result<Arc<Subscription>, DispatcherError>>,
    },

    /// Tear everything down and exit the thread.
    Shutdown,
}

/// Handle to the conductor thread. Owned by the dispatcher.
#[derive(Debug)]
pub(crate) struct Conductor {
    tx: Sender<ConductorCommand>,
    thread: Option<JoinHandle<()>>,
}

impl Conductor {
    /// Spawns the conductor thread for `inner`.
    pub(crate) fn spawn(
        dispatcher_name: &str,
        inner: Arc<Inner>,
        tx: Sender<ConductorCommand>,
        rx: Receiver<ConductorCommand>,
    ) -> Result<Self, DispatcherError> {
        let thread = std::thread::Builder::new()
            .name(format!("{dispatcher_name}-conductor"))
            .spawn(move || run(&inner, &rx))
            .map_err(|e| DispatcherError::ConductorSpawn(e.to_string()))?;
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    pub(crate) fn sender(&self) -> &Sender<ConductorCommand> {
        &self.tx
    }

    /// Sends `Shutdown` and joins the thread. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.tx.send(ConductorCommand::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(inner: &Arc<Inner>, rx: &Receiver<ConductorCommand>) {
    tracing::debug!(dispatcher = inner.name(), "conductor started");
    loop {
        let Ok(first) = rx.recv() else {
            // All senders gone; the dispatcher was dropped without close.
            break;
        };

        let mut shutdown = false;
        let mut run_background = false;
        handle(inner, first, &mut shutdown, &mut run_background);
        // Drain whatever queued up behind the first command so a burst of
        // consumed signals triggers a single limit update.
        while let Ok(cmd) = rx.try_recv() {
            handle(inner, cmd, &mut shutdown, &mut run_background);
        }

        if shutdown {
            inner.shutdown();
            break;
        }
        if run_background {
            if inner.update_publisher_limit() {
                tracing::trace!(dispatcher = inner.name(), "publisher limit advanced");
            }
            let cleaned = inner.clean_partitions();
            if cleaned > 0 {
                tracing::debug!(
                    dispatcher = inner.name(),
                    cleaned,
                    "recycled drained partitions"
                );
            }
        }
    }
    tracing::debug!(dispatcher = inner.name(), "conductor stopped");
}

fn handle(
    inner: &Arc<Inner>,
    command: ConductorCommand,
    shutdown: &mut bool,
    run_background: &mut bool,
) {
    match command {
        ConductorCommand::DataConsumed => *run_background = true,
        ConductorCommand::Open { name, reply } => {
            let result = inner.do_open_subscription(&name);
            if let Err(e) = &result {
                tracing::debug!(dispatcher = inner.name(), subscription = %name, error = %e, "open rejected");
            } else {
                tracing::debug!(dispatcher = inner.name(), subscription = %name, "subscription opened");
            }
            let _ = reply.send(result);
            *run_background = true;
        }
        ConductorCommand::Close { name, reply } => {
            let result = inner.do_close_subscription(&name);
            if result.is_ok() {
                tracing::debug!(dispatcher = inner.name(), subscription = %name, "subscription closed");
            }
            let _ = reply.send(result);
            *run_background = true;
        }
        ConductorCommand::Lookup { name, reply } => {
            let _ = reply.send(inner.find_subscription(&name));
        }
        ConductorCommand::Shutdown => *shutdown = true,
    }
}
