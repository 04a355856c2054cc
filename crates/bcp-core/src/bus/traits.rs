//! Register bus abstraction.
//!
//! The embedded controller exposes a flat namespace of four-character keys.
//! The engine only ever touches a handful of them: a command register, a
//! data register, and (for reset sampling) a counter pair. The driver that
//! actually moves bytes is outside this crate and is consumed through the
//! `RegisterBus` trait.

use std::fmt;

use thiserror::Error;

/// Four-character register key, stored big-endian as the controller does.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmcKey(u32);

impl SmcKey {
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(u32::from_be_bytes(*code))
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn chars(self) -> [char; 4] {
        self.0.to_be_bytes().map(|b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
    }

    /// Display adapter that hides the key name unless `visible` is set.
    pub fn display(self, visible: bool) -> KeyDisplay {
        KeyDisplay { key: self, visible }
    }
}

impl fmt::Display for SmcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.chars() {
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SmcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SmcKey('{}')", self)
    }
}

/// Log rendering of a key; masked keys keep only the leading character.
#[derive(Clone, Copy)]
pub struct KeyDisplay {
    key: SmcKey,
    visible: bool,
}

impl fmt::Display for KeyDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.visible {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}***", self.key.chars()[0])
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Address not acknowledged")]
    AddressNotAck,

    #[error("Unknown host error")]
    UnknownHost,

    #[error("Unknown controller error")]
    UnknownController,

    #[error("Unknown device error")]
    UnknownDevice,

    #[error("Bus timeout")]
    Timeout,

    #[error("Bus busy")]
    Busy,

    #[error("Key not found: {0}")]
    KeyNotFound(SmcKey),

    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error("Driver error: {0}")]
    Driver(String),
}

impl BusError {
    /// Transient faults worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::AddressNotAck
                | BusError::UnknownHost
                | BusError::UnknownController
                | BusError::UnknownDevice
                | BusError::Timeout
                | BusError::Busy
        )
    }
}

/// Notification source on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationChannel {
    BatteryAuth,
    GasGaugeUpdate,
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationChannel::BatteryAuth => write!(f, "battery-auth"),
            NotificationChannel::GasGaugeUpdate => write!(f, "gas-gauge-update"),
        }
    }
}

/// Completion record carried by a controller notification.
///
/// `chip_status` is the coprocessor status for authentication and the
/// updater status word for firmware updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotificationStatus {
    pub op: u8,
    pub bus_status: u8,
    pub chip_status: u16,
}

impl NotificationStatus {
    pub fn new(op: u8, bus_status: u8, chip_status: u16) -> Self {
        Self {
            op,
            bus_status,
            chip_status,
        }
    }
}

pub type NotificationHandler = Box<dyn Fn(NotificationStatus) + Send + Sync>;

/// Abstract register bus interface.
///
/// Handlers may be invoked on any thread, including synchronously from
/// inside `write_register`.
pub trait RegisterBus: Send + Sync {
    /// Write `data` to the register named by `key`.
    fn write_register(&self, key: SmcKey, data: &[u8]) -> Result<(), BusError>;

    /// Read `len` bytes from the register named by `key`.
    fn read_register(&self, key: SmcKey, len: usize) -> Result<Vec<u8>, BusError>;

    /// Route completion notifications for `channel` to `handler`.
    fn register_notification_handler(
        &self,
        channel: NotificationChannel,
        handler: NotificationHandler,
    ) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = SmcKey::new(b"BATC");
        assert_eq!(key.to_string(), "BATC");
        assert_eq!(key.display(true).to_string(), "BATC");
        assert_eq!(key.display(false).to_string(), "B***");
        assert_eq!(key.as_u32(), 0x4241_5443);
        assert_eq!(SmcKey::from_u32(0x4241_5443), key);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BusError::AddressNotAck.is_retryable());
        assert!(BusError::Busy.is_retryable());
        assert!(BusError::Timeout.is_retryable());
        assert!(!BusError::KeyNotFound(SmcKey::new(b"GCRW")).is_retryable());
        assert!(!BusError::Driver("gone".into()).is_retryable());
    }
}
