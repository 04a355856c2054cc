//! Response layouts read from the data registers.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::config::ChipVariant;
use crate::fault::Fault;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LayoutError> for Fault {
    fn from(err: LayoutError) -> Self {
        Fault::Io(err.to_string())
    }
}

fn require(data: &[u8], expected: usize) -> Result<(), LayoutError> {
    if data.len() < expected {
        return Err(LayoutError::BufferTooSmall {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Identity block returned by the authentication coprocessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AuthInfo {
    Roswell {
        device_version: u8,
        firmware_version: u8,
        auth_major: u8,
        auth_minor: u8,
        device_id: u32,
        serial: [u8; 6],
    },
    Veridian {
        serial: [u8; 4],
    },
}

impl AuthInfo {
    pub const ROSWELL_SIZE: usize = 14;
    pub const VERIDIAN_SIZE: usize = 4;

    pub fn from_bytes(chip: ChipVariant, data: &[u8]) -> Result<Self, LayoutError> {
        match chip {
            ChipVariant::Roswell => {
                require(data, Self::ROSWELL_SIZE)?;
                let mut cursor = Cursor::new(data);
                let device_version = cursor.read_u8()?;
                let firmware_version = cursor.read_u8()?;
                let auth_major = cursor.read_u8()?;
                let auth_minor = cursor.read_u8()?;
                let device_id = cursor.read_u32::<BigEndian>()?;
                let mut serial = [0u8; 6];
                cursor.read_exact(&mut serial)?;
                Ok(AuthInfo::Roswell {
                    device_version,
                    firmware_version,
                    auth_major,
                    auth_minor,
                    device_id,
                    serial,
                })
            }
            ChipVariant::Veridian => {
                require(data, Self::VERIDIAN_SIZE)?;
                let mut serial = [0u8; 4];
                serial.copy_from_slice(&data[..4]);
                Ok(AuthInfo::Veridian { serial })
            }
        }
    }

    pub fn serial(&self) -> &[u8] {
        match self {
            AuthInfo::Roswell { serial, .. } => serial,
            AuthInfo::Veridian { serial } => serial,
        }
    }
}

/// First updater info block (`GetInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GaugeInfo {
    pub fw_version: u32,
    pub config_version: u32,
    pub dnvd1_version: u32,
    pub dnvd2_version: u32,
    pub crypto_version: u32,
    pub chip_id: u32,
    pub device_type: u32,
    pub chemistry: u32,
}

impl GaugeInfo {
    pub const SIZE: usize = 32;

    pub fn from_bytes(data: &[u8]) -> Result<Self, LayoutError> {
        require(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            fw_version: cursor.read_u32::<LittleEndian>()?,
            config_version: cursor.read_u32::<LittleEndian>()?,
            dnvd1_version: cursor.read_u32::<LittleEndian>()?,
            dnvd2_version: cursor.read_u32::<LittleEndian>()?,
            crypto_version: cursor.read_u32::<LittleEndian>()?,
            chip_id: cursor.read_u32::<LittleEndian>()?,
            device_type: cursor.read_u32::<LittleEndian>()?,
            chemistry: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

pub const SET_ID_COUNT: usize = 12;

/// Second updater info block (`GetInfo2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GaugeInfo2 {
    pub hw_id: u32,
    pub updater_status: u16,
    pub flags: u8,
    pub set_ids_supported: [u8; SET_ID_COUNT],
    pub set_ids: [u8; SET_ID_COUNT],
}

impl GaugeInfo2 {
    pub const SIZE: usize = 31;
    const FLAG_TWO_STAGE: u8 = 0x01;

    pub fn from_bytes(data: &[u8]) -> Result<Self, LayoutError> {
        require(data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        let hw_id = cursor.read_u32::<LittleEndian>()?;
        let updater_status = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u8()?;
        let mut set_ids_supported = [0u8; SET_ID_COUNT];
        cursor.read_exact(&mut set_ids_supported)?;
        let mut set_ids = [0u8; SET_ID_COUNT];
        cursor.read_exact(&mut set_ids)?;
        Ok(Self {
            hw_id,
            updater_status,
            flags,
            set_ids_supported,
            set_ids,
        })
    }

    /// Images finish in Ready and are activated by a separate commit.
    pub fn is_two_stage(&self) -> bool {
        self.flags & Self::FLAG_TWO_STAGE != 0
    }
}

/// Combined updater description returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct UpdaterInfo {
    pub info: GaugeInfo,
    pub info2: GaugeInfo2,
}

/// Read a little-endian u16 from the head of a response.
pub fn read_u16_le(data: &[u8]) -> Result<u16, LayoutError> {
    require(data, 2)?;
    Ok(Cursor::new(data).read_u16::<LittleEndian>()?)
}

/// Read a little-endian u32 from the head of a response.
pub fn read_u32_le(data: &[u8]) -> Result<u32, LayoutError> {
    require(data, 4)?;
    Ok(Cursor::new(data).read_u32::<LittleEndian>()?)
}
