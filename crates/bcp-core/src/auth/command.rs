//! Authentication client commands and replies.

use std::fmt;

use serde::Serialize;

use crate::fault::Fault;
use crate::protocol::AuthInfo;
use crate::protocol::constants::{
    CERT_SERIAL_LEN, CHALLENGE_LEN, NONCE_LEN, SIGNATURE_LEN, TRUST_VERDICT_LEN,
};

/// Client-visible command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum AuthCommandId {
    GetInfo = 0,
    GetCertificateSerial = 1,
    GetCertificate = 2,
    GetSignature = 3,
    SetTrustStatus = 4,
}

impl AuthCommandId {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(AuthCommandId::GetInfo),
            1 => Some(AuthCommandId::GetCertificateSerial),
            2 => Some(AuthCommandId::GetCertificate),
            3 => Some(AuthCommandId::GetSignature),
            4 => Some(AuthCommandId::SetTrustStatus),
            _ => None,
        }
    }
}

impl fmt::Display for AuthCommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCommand {
    GetInfo,
    GetCertificateSerial,
    GetCertificate,
    /// Challenge/response signing of a 32-byte host challenge.
    GetSignature {
        challenge: [u8; CHALLENGE_LEN],
    },
    /// Host verdict on the last signature; nonzero means passed.
    SetTrustStatus {
        verdict: u8,
    },
}

impl AuthCommand {
    pub fn id(&self) -> AuthCommandId {
        match self {
            AuthCommand::GetInfo => AuthCommandId::GetInfo,
            AuthCommand::GetCertificateSerial => AuthCommandId::GetCertificateSerial,
            AuthCommand::GetCertificate => AuthCommandId::GetCertificate,
            AuthCommand::GetSignature { .. } => AuthCommandId::GetSignature,
            AuthCommand::SetTrustStatus { .. } => AuthCommandId::SetTrustStatus,
        }
    }

    /// Build a command from a raw client request.
    pub fn decode(id: u8, data: Option<&[u8]>) -> Result<Self, Fault> {
        let id = AuthCommandId::from_u8(id)
            .ok_or_else(|| Fault::BadArgument(format!("unknown auth command {}", id)))?;

        match id {
            AuthCommandId::GetInfo => Ok(AuthCommand::GetInfo),
            AuthCommandId::GetCertificateSerial => Ok(AuthCommand::GetCertificateSerial),
            AuthCommandId::GetCertificate => Ok(AuthCommand::GetCertificate),
            AuthCommandId::GetSignature => {
                let data = exact(id, data, CHALLENGE_LEN)?;
                let mut challenge = [0u8; CHALLENGE_LEN];
                challenge.copy_from_slice(data);
                Ok(AuthCommand::GetSignature { challenge })
            }
            AuthCommandId::SetTrustStatus => {
                let data = exact(id, data, TRUST_VERDICT_LEN)?;
                Ok(AuthCommand::SetTrustStatus { verdict: data[0] })
            }
        }
    }
}

fn exact(id: AuthCommandId, data: Option<&[u8]>, len: usize) -> Result<&[u8], Fault> {
    match data {
        Some(data) if data.len() == len => Ok(data),
        Some(data) => Err(Fault::BadArgument(format!(
            "{} expects {} bytes, got {}",
            id,
            len,
            data.len()
        ))),
        None => Err(Fault::BadArgument(format!("{} requires data", id))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    Info(AuthInfo),
    CertificateSerial([u8; CERT_SERIAL_LEN]),
    Certificate(Vec<u8>),
    Signature {
        signature: [u8; SIGNATURE_LEN],
        /// Present on chips that mix a device nonce into the signature.
        nonce: Option<[u8; NONCE_LEN]>,
    },
    TrustStatusSet,
}
