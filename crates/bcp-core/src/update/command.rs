//! Firmware updater client commands and replies.

use std::fmt;

use serde::Serialize;

use super::artifact::Artifact;
use crate::fault::Fault;
use crate::protocol::UpdaterInfo;
use crate::protocol::constants::NONCE_LEN;

/// Client-visible command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum UpdateCommandId {
    GetInfo = 0,
    StartUpdate = 1,
    SendData = 2,
    CommitImage = 3,
}

impl UpdateCommandId {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(UpdateCommandId::GetInfo),
            1 => Some(UpdateCommandId::StartUpdate),
            2 => Some(UpdateCommandId::SendData),
            3 => Some(UpdateCommandId::CommitImage),
            _ => None,
        }
    }
}

impl fmt::Display for UpdateCommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCommand {
    GetInfo,
    StartUpdate,
    SendData(Artifact),
    CommitImage,
}

impl UpdateCommand {
    pub fn id(&self) -> UpdateCommandId {
        match self {
            UpdateCommand::GetInfo => UpdateCommandId::GetInfo,
            UpdateCommand::StartUpdate => UpdateCommandId::StartUpdate,
            UpdateCommand::SendData(_) => UpdateCommandId::SendData,
            UpdateCommand::CommitImage => UpdateCommandId::CommitImage,
        }
    }

    /// Build a command from a raw client request.
    ///
    /// `SendData` takes the full request layout; the others take no data.
    pub fn decode(id: u8, data: Option<&[u8]>) -> Result<Self, Fault> {
        let id = UpdateCommandId::from_u8(id)
            .ok_or_else(|| Fault::BadArgument(format!("unknown update command {}", id)))?;

        match (id, data) {
            (UpdateCommandId::SendData, Some(request)) => {
                Ok(UpdateCommand::SendData(Artifact::decode(request)?))
            }
            (UpdateCommandId::SendData, None) => {
                Err(Fault::BadArgument("SendData requires data".into()))
            }
            (_, Some(_)) => Err(Fault::BadArgument(format!("{} takes no data", id))),
            (UpdateCommandId::GetInfo, None) => Ok(UpdateCommand::GetInfo),
            (UpdateCommandId::StartUpdate, None) => Ok(UpdateCommand::StartUpdate),
            (UpdateCommandId::CommitImage, None) => Ok(UpdateCommand::CommitImage),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateReply {
    Info(UpdaterInfo),
    Started {
        nonce: [u8; NONCE_LEN],
        battery_id: u32,
    },
    DataAccepted,
    Committed,
}
