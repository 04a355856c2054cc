//! Operation codes written to the command registers.

use std::fmt;

use crate::bus::NotificationChannel;
use crate::metrics::RetryChannel;

/// Operation code understood by one of the command registers.
pub trait Opcode: Copy + fmt::Display + Send + 'static {
    /// Notification source that completes this family of operations.
    const CHANNEL: NotificationChannel;

    /// Byte written to the command register.
    fn code(self) -> u8;

    /// Metric channel charged with retries of this operation.
    fn channel(self) -> RetryChannel;
}

/// Authentication coprocessor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOp {
    GetInfo,
    GetCertSerial,
    GetCertLength,
    /// Certificate chunk read, index 0..=9.
    GetCert(u8),
    SetChallenge,
    GetNonce,
    GetSignature,
    /// Veridian signing status.
    GetStatus,
    SetAuthStatus,
}

const AUTH_OP_CERT_BASE: u8 = 0x10;

impl AuthOp {
    /// Chunk read operation for `index`, if the chip has one.
    pub fn cert_chunk(index: u8) -> Option<Self> {
        (index < super::constants::CERT_CHUNK_COUNT).then_some(AuthOp::GetCert(index))
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(AuthOp::GetInfo),
            0x02 => Some(AuthOp::GetCertSerial),
            0x03 => Some(AuthOp::GetCertLength),
            0x10..=0x19 => Some(AuthOp::GetCert(code - AUTH_OP_CERT_BASE)),
            0x20 => Some(AuthOp::SetChallenge),
            0x21 => Some(AuthOp::GetNonce),
            0x22 => Some(AuthOp::GetSignature),
            0x23 => Some(AuthOp::GetStatus),
            0x24 => Some(AuthOp::SetAuthStatus),
            _ => None,
        }
    }

    /// Operations that carry a payload in the data register.
    pub fn writes_data(self) -> bool {
        matches!(self, AuthOp::SetChallenge | AuthOp::SetAuthStatus)
    }
}

impl Opcode for AuthOp {
    const CHANNEL: NotificationChannel = NotificationChannel::BatteryAuth;

    fn code(self) -> u8 {
        match self {
            AuthOp::GetInfo => 0x01,
            AuthOp::GetCertSerial => 0x02,
            AuthOp::GetCertLength => 0x03,
            AuthOp::GetCert(index) => AUTH_OP_CERT_BASE + index,
            AuthOp::SetChallenge => 0x20,
            AuthOp::GetNonce => 0x21,
            AuthOp::GetSignature => 0x22,
            AuthOp::GetStatus => 0x23,
            AuthOp::SetAuthStatus => 0x24,
        }
    }

    fn channel(self) -> RetryChannel {
        match self {
            AuthOp::GetInfo => RetryChannel::Info,
            AuthOp::GetCertSerial => RetryChannel::CertSerial,
            AuthOp::GetCertLength | AuthOp::GetCert(_) => RetryChannel::Certificate,
            AuthOp::SetChallenge | AuthOp::GetNonce | AuthOp::GetSignature | AuthOp::GetStatus => {
                RetryChannel::Signature
            }
            AuthOp::SetAuthStatus => RetryChannel::TrustStatus,
        }
    }
}

impl fmt::Display for AuthOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthOp::GetInfo => write!(f, "GetInfo"),
            AuthOp::GetCertSerial => write!(f, "GetCertSerial"),
            AuthOp::GetCertLength => write!(f, "GetCertLength"),
            AuthOp::GetCert(index) => write!(f, "GetCert{}", index),
            AuthOp::SetChallenge => write!(f, "SetChallenge"),
            AuthOp::GetNonce => write!(f, "GetNonce"),
            AuthOp::GetSignature => write!(f, "GetSignature"),
            AuthOp::GetStatus => write!(f, "GetStatus"),
            AuthOp::SetAuthStatus => write!(f, "SetAuthStatus"),
        }
    }
}

/// Gas gauge firmware updater operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateOp {
    GetInfo = 0x01,
    GetInfo2 = 0x02,
    StartUpdate = 0x03,
    GetUid = 0x04,
    GetNonce = 0x05,
    GetUpdStatus = 0x06,
    StartImage = 0x07,
    SetCertLen = 0x10,
    SetCert = 0x11,
    SetCertSign1 = 0x12,
    SetCertSign2 = 0x13,
    SetImg4Len = 0x14,
    SetImg4 = 0x15,
    SetImg4Sign1 = 0x16,
    SetImg4Sign2 = 0x17,
    SetDigDictLen = 0x18,
    SetDigDict = 0x19,
    SetImageData = 0x1A,
    SetDone = 0x1B,
    StartCrypto = 0x1C,
    CommitImage = 0x1D,
}

impl UpdateOp {
    pub fn from_code(code: u8) -> Option<Self> {
        const ALL: [UpdateOp; 21] = [
            UpdateOp::GetInfo,
            UpdateOp::GetInfo2,
            UpdateOp::StartUpdate,
            UpdateOp::GetUid,
            UpdateOp::GetNonce,
            UpdateOp::GetUpdStatus,
            UpdateOp::StartImage,
            UpdateOp::SetCertLen,
            UpdateOp::SetCert,
            UpdateOp::SetCertSign1,
            UpdateOp::SetCertSign2,
            UpdateOp::SetImg4Len,
            UpdateOp::SetImg4,
            UpdateOp::SetImg4Sign1,
            UpdateOp::SetImg4Sign2,
            UpdateOp::SetDigDictLen,
            UpdateOp::SetDigDict,
            UpdateOp::SetImageData,
            UpdateOp::SetDone,
            UpdateOp::StartCrypto,
            UpdateOp::CommitImage,
        ];
        ALL.into_iter().find(|op| *op as u8 == code)
    }
}

impl Opcode for UpdateOp {
    const CHANNEL: NotificationChannel = NotificationChannel::GasGaugeUpdate;

    fn code(self) -> u8 {
        self as u8
    }

    fn channel(self) -> RetryChannel {
        RetryChannel::Update
    }
}

impl fmt::Display for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Updater status word read back after `GetUpdStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterStatus {
    Reset,
    Ready,
    Busy,
    Success,
    Other(u16),
}

impl UpdaterStatus {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => UpdaterStatus::Reset,
            1 => UpdaterStatus::Ready,
            2 => UpdaterStatus::Busy,
            3 => UpdaterStatus::Success,
            other => UpdaterStatus::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            UpdaterStatus::Reset => 0,
            UpdaterStatus::Ready => 1,
            UpdaterStatus::Busy => 2,
            UpdaterStatus::Success => 3,
            UpdaterStatus::Other(raw) => raw,
        }
    }

    /// Status values that indicate an updater-side failure.
    ///
    /// Busy is the normal intermediate state of a two-tier handshake; only
    /// words outside the known set are failures.
    pub fn is_error(self) -> bool {
        matches!(self, UpdaterStatus::Other(_))
    }
}

impl fmt::Display for UpdaterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterStatus::Reset => write!(f, "RESET"),
            UpdaterStatus::Ready => write!(f, "READY"),
            UpdaterStatus::Busy => write!(f, "BUSY"),
            UpdaterStatus::Success => write!(f, "SUCCESS"),
            UpdaterStatus::Other(raw) => write!(f, "0x{:04X}", raw),
        }
    }
}
