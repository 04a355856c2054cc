//! Event system for telemetry and UI decoupling.
//!
//! Lets a host subscribe to engine activity without coupling to the
//! protocol state machines.

use std::fmt;

use crate::fault::FaultCode;
use crate::update::UpdateState;

/// Which engine raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Auth,
    Updater,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Auth => write!(f, "auth"),
            DeviceKind::Updater => write!(f, "updater"),
        }
    }
}

/// Diagnostic conditions raised from completion notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// Nonzero bus status reported by the controller.
    CommunicationError(u8),
    /// Nonzero authentication coprocessor status.
    CoprocessorError(u16),
    /// Updater reported a failure status.
    UpdaterStatus(u16),
}

/// Events emitted by the engines.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Updater state machine transition.
    StateChanged { from: UpdateState, to: UpdateState },
    /// Chunked transfer progress.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// Command-level retry after a failed attempt.
    CommandRetry { op: String, attempt: u32 },
    /// A client command finished.
    CommandCompleted {
        device: DeviceKind,
        command: String,
        code: Option<FaultCode>,
    },
    /// Trust verdict published (or withdrawn).
    TrustPublished { passed: bool, timestamp: Option<i64> },
    DiagnosticRaised {
        device: DeviceKind,
        diagnostic: Diagnostic,
    },
    /// Controller resets observed across a retried command.
    ControllerResets { delta: u64 },
}

/// Observer trait for receiving engine events.
pub trait EngineObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &EngineEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl EngineObserver for NullObserver {
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl EngineObserver for TracingObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Updater state changed");
            }
            EngineEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            EngineEvent::CommandRetry { op, attempt } => {
                tracing::warn!(op = %op, attempt = attempt, "Retrying command");
            }
            EngineEvent::CommandCompleted {
                device,
                command,
                code,
            } => match code {
                None => tracing::info!(device = %device, command = %command, "Command complete"),
                Some(code) => {
                    tracing::error!(device = %device, command = %command, code = %code, "Command failed")
                }
            },
            EngineEvent::TrustPublished { passed, timestamp } => {
                tracing::info!(passed = passed, timestamp = ?timestamp, "Trust data published");
            }
            EngineEvent::DiagnosticRaised { device, diagnostic } => match diagnostic {
                Diagnostic::CommunicationError(status) => {
                    tracing::warn!(device = %device, status = %format!("0x{:02X}", status), "Communication error");
                }
                Diagnostic::CoprocessorError(status) => {
                    tracing::warn!(device = %device, status = %format!("0x{:04X}", status), "Coprocessor error");
                }
                Diagnostic::UpdaterStatus(status) => {
                    tracing::warn!(device = %device, status = %format!("0x{:04X}", status), "Updater error status");
                }
            },
            EngineEvent::ControllerResets { delta } => {
                tracing::warn!(delta = delta, "Gauge controller reset during command");
            }
        }
    }
}
