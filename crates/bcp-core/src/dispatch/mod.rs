//! Command dispatch over one command/data register pair.
//!
//! Exactly one command may be outstanding at a time. Register accesses are
//! retried on transient bus faults; everything else is left to the protocol
//! state machines.

pub mod correlator;
pub mod retry;

pub use correlator::{Completion, Correlator, Envelope, NotificationHook, NotificationPort};
pub use retry::RetryPolicy;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::bus::{BusError, NotificationStatus, RegisterBus, SmcKey};
use crate::fault::{Fault, zeroed_buffer};
use crate::metrics::{Metrics, RetryChannel};
use crate::protocol::{Opcode, UpdaterStatus};

/// Keys and transfer size of one register pair.
#[derive(Debug, Clone, Copy)]
pub struct RegisterPair {
    pub command: SmcKey,
    pub data: SmcKey,
    pub data_len: usize,
}

/// How a completion notification is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPolicy {
    /// Any nonzero bus or coprocessor status is a fault. A missed
    /// notification is not; the response read decides.
    Auth,
    /// Nonzero bus status, or an updater status past Ready other than Success.
    Update,
}

impl StatusPolicy {
    /// Whether a timed-out wait skips the status check.
    pub fn proceeds_on_timeout(self) -> bool {
        matches!(self, StatusPolicy::Auth)
    }
}

pub struct CommandDispatcher<R> {
    bus: Arc<dyn RegisterBus>,
    pair: RegisterPair,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
    correlator: Correlator<R>,
    in_flight: Option<u8>,
    show_keys: bool,
}

impl<R> CommandDispatcher<R> {
    pub fn new(
        bus: Arc<dyn RegisterBus>,
        pair: RegisterPair,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
        correlator: Correlator<R>,
        show_keys: bool,
    ) -> Self {
        Self {
            bus,
            pair,
            retry,
            metrics,
            correlator,
            in_flight: None,
            show_keys,
        }
    }

    pub fn data_len(&self) -> usize {
        self.pair.data_len
    }

    pub fn next_request(&mut self) -> Option<R> {
        self.correlator.next_request()
    }

    /// Timed delay that keeps the mailbox drained.
    pub fn pause(&mut self, duration: Duration) {
        self.correlator.pause(duration);
    }

    pub fn latest(&self) -> Option<NotificationStatus> {
        self.correlator.latest()
    }

    fn with_retry<T>(
        &self,
        key: SmcKey,
        channel: RetryChannel,
        mut access: impl FnMut() -> Result<T, BusError>,
    ) -> Result<T, Fault> {
        let key_name = key.display(self.show_keys);
        let mut failures = 0u32;
        loop {
            match access() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    failures += 1;
                    self.metrics.record_bus_retry(channel);
                    if failures >= self.retry.attempts() {
                        error!(key = %key_name, attempts = failures, error = %err, "Register access failed");
                        return Err(Fault::Io(format!(
                            "{} failed after {} attempts: {}",
                            key_name, failures, err
                        )));
                    }
                    debug!(key = %key_name, attempt = failures, error = %err, "Retrying register access");
                    thread::sleep(self.retry.backoff(failures));
                }
                Err(err) => {
                    error!(key = %key_name, error = %err, "Register access failed");
                    return Err(Fault::Io(format!("{}: {}", key_name, err)));
                }
            }
        }
    }

    /// Write a register outside the command pair, with bus retry.
    pub fn write_register(
        &self,
        key: SmcKey,
        data: &[u8],
        channel: RetryChannel,
    ) -> Result<(), Fault> {
        self.with_retry(key, channel, || self.bus.write_register(key, data))
    }

    /// Read a register outside the command pair, with bus retry.
    pub fn read_register(
        &self,
        key: SmcKey,
        len: usize,
        channel: RetryChannel,
    ) -> Result<Vec<u8>, Fault> {
        self.with_retry(key, channel, || self.bus.read_register(key, len))
    }

    /// Write the payload (zero padded) to the data register, then the op code
    /// to the command register.
    pub fn send_command<O: Opcode>(&mut self, op: O, payload: Option<&[u8]>) -> Result<(), Fault> {
        if let Some(pending) = self.in_flight {
            error!(op = %op, pending = pending, "Command issued while another is unresolved");
            return Err(Fault::Internal(format!(
                "{} issued while op 0x{:02X} is unresolved",
                op, pending
            )));
        }

        let channel = op.channel();
        if let Some(payload) = payload {
            if payload.len() > self.pair.data_len {
                return Err(Fault::BadArgument(format!(
                    "{} payload of {} bytes exceeds {} byte register",
                    op,
                    payload.len(),
                    self.pair.data_len
                )));
            }
            let mut buf = zeroed_buffer(self.pair.data_len)?;
            buf[..payload.len()].copy_from_slice(payload);
            self.with_retry(self.pair.data, channel, || {
                self.bus.write_register(self.pair.data, &buf)
            })?;
        }

        let code = [op.code()];
        self.with_retry(self.pair.command, channel, || {
            self.bus.write_register(self.pair.command, &code)
        })?;
        self.in_flight = Some(op.code());
        debug!(op = %op, key = %self.pair.command.display(self.show_keys), "Command sent");
        Ok(())
    }

    /// Wait for the completion notification of `op`.
    ///
    /// A timeout resolves the command anyway; the caller decides whether it
    /// matters.
    pub fn await_completion<O: Opcode>(&mut self, op: O, timeout: Duration) -> Completion {
        let completion = self.correlator.wait_for(op.code(), timeout);
        self.in_flight = None;
        if completion == Completion::TimedOut {
            warn!(op = %op, timeout_ms = timeout.as_millis() as u64, "No notification, assuming it was missed");
        }
        completion
    }

    /// Read `len` bytes of response from the data register.
    pub fn read_response<O: Opcode>(&mut self, op: O, len: usize) -> Result<Vec<u8>, Fault> {
        if len > self.pair.data_len {
            return Err(Fault::Internal(format!(
                "{} response of {} bytes exceeds {} byte register",
                op, len, self.pair.data_len
            )));
        }
        let data = self.pair.data;
        self.with_retry(data, op.channel(), || self.bus.read_register(data, len))
    }

    /// Judge the latest notification against `op`.
    pub fn check_status<O: Opcode>(
        &self,
        op: O,
        policy: StatusPolicy,
    ) -> Result<NotificationStatus, Fault> {
        let status = self
            .correlator
            .latest()
            .ok_or_else(|| Fault::protocol(op, "no notification received"))?;

        if status.op != op.code() {
            warn!(expected = %op, received = status.op, "Notification for another op");
            return Err(Fault::protocol(
                op,
                format!("notification for op 0x{:02X}", status.op),
            ));
        }
        if status.bus_status != 0 {
            warn!(op = %op, bus_status = status.bus_status, "Bus failure reported");
            return Err(Fault::protocol(
                op,
                format!("bus status 0x{:02X}", status.bus_status),
            ));
        }
        let chip_failed = match policy {
            StatusPolicy::Auth => status.chip_status != 0,
            StatusPolicy::Update => UpdaterStatus::from_u16(status.chip_status).is_error(),
        };
        if chip_failed {
            warn!(op = %op, chip_status = status.chip_status, "Chip reported failure");
            return Err(Fault::protocol(
                op,
                format!("chip status 0x{:04X}", status.chip_status),
            ));
        }
        Ok(status)
    }

    /// Send, wait and check status.
    ///
    /// Under a policy that proceeds on timeout, a missed notification yields
    /// `Completion::TimedOut` without looking at the stale status record.
    pub fn transact<O: Opcode>(
        &mut self,
        op: O,
        payload: Option<&[u8]>,
        timeout: Duration,
        policy: StatusPolicy,
    ) -> Result<Completion, Fault> {
        self.send_command(op, payload)?;
        let completion = self.await_completion(op, timeout);
        if completion == Completion::TimedOut && policy.proceeds_on_timeout() {
            return Ok(completion);
        }
        self.check_status(op, policy)?;
        Ok(completion)
    }
}
