//! Wire-level definitions for the two command register pairs.

pub mod constants;
pub mod info;
pub mod opcode;

pub use info::{AuthInfo, GaugeInfo, GaugeInfo2, LayoutError, UpdaterInfo};
pub use opcode::{AuthOp, Opcode, UpdateOp, UpdaterStatus};
