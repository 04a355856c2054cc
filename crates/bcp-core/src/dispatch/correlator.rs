//! Hand-off of completion notifications into a device's worker thread.
//!
//! The driver raises notifications on its own thread. They are posted to the
//! same mailbox as client requests, and only the worker looks at them. Only
//! the most recent status is kept.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::bus::{NotificationHandler, NotificationStatus};

/// Everything a device worker can receive.
pub enum Envelope<R> {
    Request(R),
    Notification(NotificationStatus),
    Shutdown,
}

/// Outcome of waiting for a completion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Matched,
    TimedOut,
}

/// Sending side registered with the bus as the notification handler.
pub struct NotificationPort<R> {
    tx: Sender<Envelope<R>>,
}

impl<R> Clone for NotificationPort<R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<R: Send + 'static> NotificationPort<R> {
    pub fn new(tx: Sender<Envelope<R>>) -> Self {
        Self { tx }
    }

    /// Post a notification to the worker. Safe to call from any thread.
    pub fn deliver(&self, status: NotificationStatus) {
        if self.tx.send(Envelope::Notification(status)).is_err() {
            trace!(op = status.op, "Worker gone, notification dropped");
        }
    }

    pub fn into_handler(self) -> NotificationHandler {
        Box::new(move |status| self.deliver(status))
    }
}

pub type NotificationHook = Box<dyn FnMut(&NotificationStatus) + Send>;

/// Worker-side mailbox reader.
pub struct Correlator<R> {
    mailbox: Receiver<Envelope<R>>,
    backlog: VecDeque<R>,
    latest: Option<NotificationStatus>,
    shutdown: bool,
    hook: NotificationHook,
}

impl<R> Correlator<R> {
    pub fn new(mailbox: Receiver<Envelope<R>>, hook: NotificationHook) -> Self {
        Self {
            mailbox,
            backlog: VecDeque::new(),
            latest: None,
            shutdown: false,
            hook,
        }
    }

    /// Most recent notification, overwritten by every arrival.
    pub fn latest(&self) -> Option<NotificationStatus> {
        self.latest
    }

    fn absorb(&mut self, status: NotificationStatus) {
        trace!(
            op = status.op,
            bus_status = status.bus_status,
            chip_status = status.chip_status,
            "Notification"
        );
        (self.hook)(&status);
        self.latest = Some(status);
    }

    fn accept(&mut self, envelope: Envelope<R>) -> Option<NotificationStatus> {
        match envelope {
            Envelope::Request(request) => {
                self.backlog.push_back(request);
                None
            }
            Envelope::Notification(status) => {
                self.absorb(status);
                Some(status)
            }
            Envelope::Shutdown => {
                self.shutdown = true;
                None
            }
        }
    }

    /// Block until the next request, or `None` once shut down.
    ///
    /// Requests deferred while a command was running come first.
    pub fn next_request(&mut self) -> Option<R> {
        if let Some(request) = self.backlog.pop_front() {
            return Some(request);
        }
        while !self.shutdown {
            match self.mailbox.recv() {
                Ok(Envelope::Request(request)) => return Some(request),
                Ok(other) => {
                    self.accept(other);
                }
                Err(_) => self.shutdown = true,
            }
        }
        None
    }

    /// Wait for a notification carrying `op`, up to `timeout`.
    pub fn wait_for(&mut self, op: u8, timeout: Duration) -> Completion {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Completion::TimedOut;
            }
            match self.mailbox.recv_timeout(deadline - now) {
                Ok(envelope) => {
                    if let Some(status) = self.accept(envelope)
                        && status.op == op
                    {
                        return Completion::Matched;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Completion::TimedOut;
                }
            }
        }
    }

    /// Sleep for `duration` while still absorbing notifications.
    pub fn pause(&mut self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            match self.mailbox.recv_timeout(deadline - now) {
                Ok(envelope) => {
                    self.accept(envelope);
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return;
                }
            }
        }
    }
}
