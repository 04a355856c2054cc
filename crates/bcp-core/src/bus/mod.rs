//! Register bus layer.

pub mod mock;
pub mod traits;

pub use mock::MockBus;
pub use traits::{
    BusError, KeyDisplay, NotificationChannel, NotificationHandler, NotificationStatus,
    RegisterBus, SmcKey,
};
