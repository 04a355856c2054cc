//! BCP-Core: battery coprocessor command/response engine.
//!
//! Drives a battery authentication coprocessor and a gas gauge firmware
//! updater through a single command/data register pair each, exposed by an
//! embedded controller.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Bus**: Register access and notification abstraction (plus a mock)
//! - **Protocol**: Register keys, op codes, response layouts
//! - **Dispatch**: Single-flight command issue, bus retry, notification correlation
//! - **Auth**: Authentication state machine and trust publication
//! - **Update**: Firmware update state machine and artifact transfer
//! - **Events**: Observer pattern for telemetry
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bcp_core::{AuthCommand, AuthDevice, CommandEngine, EngineConfig, MockBus};
//!
//! let bus = Arc::new(MockBus::new());
//! let auth = AuthDevice::spawn(bus, EngineConfig::default()).expect("spawn");
//! let serial = auth.call(AuthCommand::GetCertificateSerial).expect("serial");
//! println!("{:?}", serial);
//! ```

pub mod auth;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod fault;
pub mod gate;
pub mod metrics;
pub mod properties;
pub mod protocol;
pub mod update;

// Re-exports for convenience
pub use auth::{AuthCommand, AuthCommandId, AuthDevice, AuthReply};
pub use bus::{BusError, MockBus, NotificationChannel, NotificationStatus, RegisterBus, SmcKey};
pub use config::{AuthConfig, ChipVariant, EngineConfig, PollProfile, UpdateConfig};
pub use engine::{Callback, CommandEngine, CommandOutcome};
pub use events::{EngineEvent, EngineObserver, NullObserver, TracingObserver};
pub use fault::{Fault, FaultCode};
pub use metrics::{MetricsSnapshot, RetryChannel};
pub use properties::{AuthProperties, UpdaterProperties};
pub use update::{
    Artifact, ArtifactKind, ImageKind, ImageSet, UpdateCommand, UpdateCommandId, UpdateDevice,
    UpdateReply, UpdateState,
};
