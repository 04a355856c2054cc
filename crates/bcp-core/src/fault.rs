//! Caller-facing fault taxonomy.
//!
//! Every command either completes or fails with exactly one [`Fault`].
//! Bus-level detail is folded into [`Fault::Io`] once the dispatcher has
//! given up retrying. Chip-reported status problems become
//! [`Fault::Protocol`], which reports the I/O code but is not retried as a
//! bus failure.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Coarse result code surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FaultCode {
    BadArgument,
    Busy,
    Io,
    Timeout,
    Internal,
    NoMemory,
    NoResources,
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCode::BadArgument => write!(f, "bad-argument"),
            FaultCode::Busy => write!(f, "busy"),
            FaultCode::Io => write!(f, "io-error"),
            FaultCode::Timeout => write!(f, "timeout"),
            FaultCode::Internal => write!(f, "internal-error"),
            FaultCode::NoMemory => write!(f, "no-memory"),
            FaultCode::NoResources => write!(f, "no-resources"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error("Device busy")]
    Busy,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Status fault on {op}: {reason}")]
    Protocol { op: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Out of memory")]
    NoMemory,

    #[error("No resources: {0}")]
    NoResources(String),
}

impl Fault {
    pub fn code(&self) -> FaultCode {
        match self {
            Fault::BadArgument(_) => FaultCode::BadArgument,
            Fault::Busy => FaultCode::Busy,
            Fault::Io(_) | Fault::Protocol { .. } => FaultCode::Io,
            Fault::Timeout(_) => FaultCode::Timeout,
            Fault::Internal(_) => FaultCode::Internal,
            Fault::NoMemory => FaultCode::NoMemory,
            Fault::NoResources(_) => FaultCode::NoResources,
        }
    }

    /// Register access failed after the dispatcher exhausted its retries.
    pub fn is_bus(&self) -> bool {
        matches!(self, Fault::Io(_))
    }

    pub(crate) fn protocol(op: impl fmt::Display, reason: impl Into<String>) -> Self {
        Fault::Protocol {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}

/// Zeroed buffer of `len` bytes, or [`Fault::NoMemory`] if it cannot be allocated.
pub(crate) fn zeroed_buffer(len: usize) -> Result<Vec<u8>, Fault> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Fault::NoMemory)?;
    buf.resize(len, 0);
    Ok(buf)
}
