//! Client-facing engine contract and the per-device worker thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::dispatch::Envelope;
use crate::fault::Fault;
use crate::metrics::MetricsSnapshot;

/// Result of one client command, handed to its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome<I, R> {
    pub command: I,
    pub result: Result<R, Fault>,
}

pub type Callback<I, R> = Box<dyn FnOnce(CommandOutcome<I, R>) + Send>;

/// Asynchronous command interface shared by both devices.
///
/// There is no cancel: once admitted, a command runs to
/// completion or failure.
pub trait CommandEngine {
    type Command: Send + 'static;
    type CommandId: Copy + fmt::Debug + Send + 'static;
    type Reply: Send + 'static;

    /// Queue `command`; `callback` runs on the device worker once it finishes.
    ///
    /// Errors returned here mean the command was never admitted and the
    /// callback will not run.
    fn submit(
        &self,
        command: Self::Command,
        callback: Callback<Self::CommandId, Self::Reply>,
    ) -> Result<(), Fault>;

    fn report_metrics(&self) -> MetricsSnapshot;

    /// Submit and block until the reply arrives.
    fn call(&self, command: Self::Command) -> Result<Self::Reply, Fault> {
        let (tx, rx) = mpsc::channel();
        self.submit(
            command,
            Box::new(move |outcome: CommandOutcome<Self::CommandId, Self::Reply>| {
                let _ = tx.send(outcome.result);
            }),
        )?;
        rx.recv()
            .map_err(|_| Fault::NoResources("engine stopped before replying".into()))?
    }
}

/// Run a client callback on the worker.
///
/// A panicking callback is logged and contained so the worker keeps serving.
pub(crate) fn deliver<I, R>(callback: Callback<I, R>, outcome: CommandOutcome<I, R>) {
    if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        error!("Client callback panicked");
    }
}

/// Owning handle to a device worker thread.
///
/// Dropping it asks the worker to stop after the current request and joins.
pub(crate) struct Worker<R> {
    tx: Sender<Envelope<R>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: Send + 'static> Worker<R> {
    pub(crate) fn spawn(
        name: &str,
        tx: Sender<Envelope<R>>,
        body: impl FnOnce() + Send + 'static,
    ) -> Result<Self, Fault> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| Fault::NoResources(format!("failed to spawn {}: {}", name, e)))?;
        debug!(worker = name, "Worker started");
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub(crate) fn post(&self, request: R) -> Result<(), Fault> {
        self.tx
            .send(Envelope::Request(request))
            .map_err(|_| Fault::NoResources("device worker has stopped".into()))
    }
}

impl<R> Drop for Worker<R> {
    fn drop(&mut self) {
        let _ = self.tx.send(Envelope::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Device worker panicked");
            }
        }
    }
}
