//! Register keys, transfer sizes and status words.

use crate::bus::SmcKey;

// ============================================================================
// Register keys
// ============================================================================

/// Authentication command register.
pub const AUTH_COMMAND_KEY: SmcKey = SmcKey::new(b"BATC");
/// Authentication data register.
pub const AUTH_DATA_KEY: SmcKey = SmcKey::new(b"BATD");

/// Firmware updater command register.
pub const UPDATE_COMMAND_KEY: SmcKey = SmcKey::new(b"BFUC");
/// Firmware updater data register.
pub const UPDATE_DATA_KEY: SmcKey = SmcKey::new(b"BFUD");

/// Gauge control command register (reset counter selection).
pub const GAUGE_CONTROL_KEY: SmcKey = SmcKey::new(b"GCCM");
/// Gauge control read-back register.
pub const GAUGE_READBACK_KEY: SmcKey = SmcKey::new(b"GCRW");

/// Gauge control sub-command that latches the reset counter into `GCRW`.
pub const GAUGE_RESET_COUNT_CMD: u16 = 0x0005;

// ============================================================================
// Size Constants
// ============================================================================

pub const AUTH_DATA_LEN: usize = 64;
pub const UPDATE_DATA_LEN: usize = 32;

pub const CERT_SERIAL_LEN: usize = 32;
pub const CHALLENGE_LEN: usize = 32;
pub const NONCE_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const AUTH_STATUS_LEN: usize = 2;
pub const TRUST_VERDICT_LEN: usize = 1;

/// Largest certificate the coprocessor may report.
pub const MAX_CERT_LEN: usize = 609;
/// Certificate chunk reads available (`GetCert0`..`GetCert9`).
pub const CERT_CHUNK_COUNT: u8 = 10;

/// Largest payload whose length fits the 16-bit length register.
pub const MAX_LENGTH_FIELD: usize = 0xFFFF;

/// Attempts for both bus-level and command-level retry loops.
pub const MAX_ATTEMPTS: u32 = 5;

// ============================================================================
// Veridian status words
// ============================================================================

pub const VERIDIAN_STATUS_RESET: u16 = 0x0000;
pub const VERIDIAN_STATUS_OK: u16 = 0xEFCC;
pub const VERIDIAN_STATUS_BUSY: u16 = 0xBBEE;
pub const VERIDIAN_STATUS_DIGEST_ERROR: u16 = 0x0EBD;
pub const VERIDIAN_STATUS_STATE_ERROR: u16 = 0x5A5A;
pub const VERIDIAN_STATUS_SIGNING_ERROR: u16 = 0xAEAE;

/// Human-readable name for a Veridian status word.
pub fn veridian_status_name(status: u16) -> &'static str {
    match status {
        VERIDIAN_STATUS_RESET => "reset",
        VERIDIAN_STATUS_OK => "ok",
        VERIDIAN_STATUS_BUSY => "busy",
        VERIDIAN_STATUS_DIGEST_ERROR => "digest-error",
        VERIDIAN_STATUS_STATE_ERROR => "state-error",
        VERIDIAN_STATUS_SIGNING_ERROR => "signing-error",
        _ => "unknown",
    }
}
