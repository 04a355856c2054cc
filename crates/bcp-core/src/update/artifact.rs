//! Firmware update artifacts and their client request layout.
//!
//! A `SendData` request carries one artifact: a certificate, an Img4
//! manifest, a digest dictionary or one of the three image kinds. The raw
//! client layout is:
//!
//! ```text
//! 0x00  signature[64]  (byte 0 doubles as the image set of a digest dictionary)
//! 0x40  data_length    u64 LE
//! 0x48  type           u64 LE
//! 0x50  data[data_length]
//! ```

use std::fmt;
use std::io::Cursor;

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use thiserror::Error;

use crate::fault::Fault;
use crate::protocol::constants::{MAX_LENGTH_FIELD, SIGNATURE_LEN, UPDATE_DATA_LEN};

/// Size of the fixed request header before the artifact bytes.
pub const REQUEST_HEADER_LEN: usize = 80;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Request too small: {actual} bytes, minimum {minimum}")]
    RequestTooSmall { actual: usize, minimum: usize },
    #[error("Invalid artifact type: {0}")]
    InvalidType(u64),
    #[error("Declared length {declared} exceeds supplied {supplied} bytes")]
    LengthMismatch { declared: u64, supplied: usize },
    #[error("Artifact has no data")]
    Empty,
    #[error("{kind} of {len} bytes exceeds the 16-bit length field")]
    TooLarge { kind: ArtifactKind, len: usize },
    #[error("{0} requires a signature")]
    MissingSignature(ArtifactKind),
    #[error("Digest dictionary selects no images")]
    NoImagesSelected,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ArtifactError> for Fault {
    fn from(err: ArtifactError) -> Self {
        Fault::BadArgument(err.to_string())
    }
}

bitflags! {
    /// Images covered by a digest dictionary.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageSet: u8 {
        const FIRMWARE = 1 << 0;
        const CONFIGURATION = 1 << 1;
        const DNVD = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ImageKind {
    Firmware,
    Config,
    Dnvd,
}

impl ImageKind {
    /// Image selector written with `StartImage`.
    pub fn image_set(self) -> ImageSet {
        match self {
            ImageKind::Firmware => ImageSet::FIRMWARE,
            ImageKind::Config => ImageSet::CONFIGURATION,
            ImageKind::Dnvd => ImageSet::DNVD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArtifactKind {
    Certificate,
    Manifest,
    DigestDictionary,
    Image(ImageKind),
}

impl ArtifactKind {
    /// Map the client's type field.
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(ArtifactKind::Certificate),
            1 => Some(ArtifactKind::Manifest),
            2 => Some(ArtifactKind::DigestDictionary),
            3 => Some(ArtifactKind::Image(ImageKind::Dnvd)),
            4 => Some(ArtifactKind::Image(ImageKind::Config)),
            5 => Some(ArtifactKind::Image(ImageKind::Firmware)),
            _ => None,
        }
    }

    pub fn is_image(self) -> bool {
        matches!(self, ArtifactKind::Image(_))
    }

    pub fn is_signed(self) -> bool {
        matches!(self, ArtifactKind::Certificate | ArtifactKind::Manifest)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Certificate => write!(f, "certificate"),
            ArtifactKind::Manifest => write!(f, "img4-manifest"),
            ArtifactKind::DigestDictionary => write!(f, "digest-dictionary"),
            ArtifactKind::Image(ImageKind::Firmware) => write!(f, "firmware-image"),
            ArtifactKind::Image(ImageKind::Config) => write!(f, "config-image"),
            ArtifactKind::Image(ImageKind::Dnvd) => write!(f, "dnvd-image"),
        }
    }
}

/// One artifact of a firmware update.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub data: Vec<u8>,
    /// Split into two 32-byte halves for certificates and manifests.
    pub signature: Option<[u8; SIGNATURE_LEN]>,
    /// Only meaningful for digest dictionaries.
    pub images: ImageSet,
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("kind", &self.kind)
            .field("len", &self.data.len())
            .field("signed", &self.signature.is_some())
            .field("images", &self.images)
            .finish()
    }
}

impl Artifact {
    pub fn certificate(data: Vec<u8>, signature: [u8; SIGNATURE_LEN]) -> Self {
        Self {
            kind: ArtifactKind::Certificate,
            data,
            signature: Some(signature),
            images: ImageSet::empty(),
        }
    }

    pub fn manifest(data: Vec<u8>, signature: [u8; SIGNATURE_LEN]) -> Self {
        Self {
            kind: ArtifactKind::Manifest,
            data,
            signature: Some(signature),
            images: ImageSet::empty(),
        }
    }

    pub fn digest_dictionary(data: Vec<u8>, images: ImageSet) -> Self {
        Self {
            kind: ArtifactKind::DigestDictionary,
            data,
            signature: None,
            images,
        }
    }

    pub fn image(kind: ImageKind, data: Vec<u8>) -> Self {
        Self {
            kind: ArtifactKind::Image(kind),
            data,
            signature: None,
            images: ImageSet::empty(),
        }
    }

    /// Decode a raw `SendData` request.
    pub fn decode(request: &[u8]) -> Result<Self, ArtifactError> {
        if request.len() <= REQUEST_HEADER_LEN {
            return Err(ArtifactError::RequestTooSmall {
                actual: request.len(),
                minimum: REQUEST_HEADER_LEN + 1,
            });
        }

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&request[..SIGNATURE_LEN]);

        let mut cursor = Cursor::new(&request[SIGNATURE_LEN..REQUEST_HEADER_LEN]);
        let data_length = cursor.read_u64::<LittleEndian>()?;
        let raw_type = cursor.read_u64::<LittleEndian>()?;

        let kind = ArtifactKind::from_raw(raw_type).ok_or(ArtifactError::InvalidType(raw_type))?;
        let supplied = request.len() - REQUEST_HEADER_LEN;
        if data_length == 0 {
            return Err(ArtifactError::Empty);
        }
        if data_length > supplied as u64 {
            return Err(ArtifactError::LengthMismatch {
                declared: data_length,
                supplied,
            });
        }

        let end = REQUEST_HEADER_LEN + data_length as usize;
        let data = request[REQUEST_HEADER_LEN..end].to_vec();
        let artifact = match kind {
            ArtifactKind::Certificate => Artifact::certificate(data, signature),
            ArtifactKind::Manifest => Artifact::manifest(data, signature),
            ArtifactKind::DigestDictionary => {
                Artifact::digest_dictionary(data, ImageSet::from_bits_truncate(signature[0]))
            }
            ArtifactKind::Image(image) => Artifact::image(image, data),
        };
        artifact.validate()?;
        Ok(artifact)
    }

    /// Check everything that can be rejected before touching the bus.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.data.is_empty() {
            return Err(ArtifactError::Empty);
        }
        // Images send their length in blocks, everything else in bytes.
        let length_field = if self.kind.is_image() {
            self.block_count()
        } else {
            self.data.len()
        };
        if length_field > MAX_LENGTH_FIELD {
            return Err(ArtifactError::TooLarge {
                kind: self.kind,
                len: self.data.len(),
            });
        }
        if self.kind.is_signed() && self.signature.is_none() {
            return Err(ArtifactError::MissingSignature(self.kind));
        }
        if self.kind == ArtifactKind::DigestDictionary && self.images.is_empty() {
            return Err(ArtifactError::NoImagesSelected);
        }
        Ok(())
    }

    /// Number of 32-byte data register transfers.
    pub fn block_count(&self) -> usize {
        self.data.len().div_ceil(UPDATE_DATA_LEN)
    }

    pub fn chunks(&self) -> ChunkIterator<'_> {
        ChunkIterator::new(&self.data)
    }
}

/// Data register sized chunks of an artifact, the last one zero padded.
#[derive(Debug)]
pub struct ChunkIterator<'a> {
    data: &'a [u8],
    offset: usize,
    total_chunks: usize,
    current_chunk: usize,
}

impl<'a> ChunkIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            total_chunks: data.len().div_ceil(UPDATE_DATA_LEN),
            current_chunk: 0,
        }
    }

    /// Total number of chunks.
    pub fn total(&self) -> usize {
        self.total_chunks
    }

    /// Chunks handed out so far.
    pub fn current(&self) -> usize {
        self.current_chunk
    }

    /// Byte offset of the next chunk.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn progress_pct(&self) -> u8 {
        if self.total_chunks == 0 {
            100
        } else {
            ((self.current_chunk * 100) / self.total_chunks) as u8
        }
    }
}

impl Iterator for ChunkIterator<'_> {
    type Item = [u8; UPDATE_DATA_LEN];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }

        let chunk_len = (self.data.len() - self.offset).min(UPDATE_DATA_LEN);
        let mut chunk = [0u8; UPDATE_DATA_LEN];
        chunk[..chunk_len].copy_from_slice(&self.data[self.offset..self.offset + chunk_len]);
        self.offset += chunk_len;
        self.current_chunk += 1;

        Some(chunk)
    }
}
