//! Firmware version identity and the application descriptor embedded in
//! every image.
//!
//! An image is a 256 byte [`AppDescriptor`] followed by the payload. The
//! descriptor carries the version string compared (by bytes, never
//! semantically) against the running firmware, and the SHA-256 of the payload
//! checked before an image is committed.

use bincode::{Decode, Encode};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// first 4 bytes of any valid image
pub const APP_DESC_MAGIC: u32 = 0x414F_5421;
/// encoded size of [`AppDescriptor`]; the payload starts at this offset
pub const SIZEOF_APP_DESC: usize = 256;

const VERSION_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("descriptor needs {SIZEOF_APP_DESC} bytes, got {0}")]
    DescriptorTooShort(usize),
    #[error("bad descriptor magic: {0:#010x}")]
    BadMagic(u32),
    #[error(transparent)]
    DescriptorDecode(#[from] bincode::error::DecodeError),
    #[error(transparent)]
    DescriptorEncode(#[from] bincode::error::EncodeError),
}

/// Opaque firmware version identifier, NUL padded to a fixed width.
///
/// Two versions are "the same firmware" exactly when all 32 bytes are equal,
/// padding included. There is no notion of newer or older.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion([u8; VERSION_LEN]);

impl FirmwareVersion {
    pub fn as_bytes(&self) -> &[u8; VERSION_LEN] {
        &self.0
    }
}

impl From<&str> for FirmwareVersion {
    fn from(s: &str) -> Self {
        Self(pad::<VERSION_LEN>(s))
    }
}

impl From<[u8; VERSION_LEN]> for FirmwareVersion {
    fn from(raw: [u8; VERSION_LEN]) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(VERSION_LEN);
        write!(f, "{}", String::from_utf8_lossy(&self.0[..end]))
    }
}

impl std::fmt::Debug for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FirmwareVersion({})", self)
    }
}

/// Fixed-layout metadata block at offset 0 of an image.
///
/// ```text
/// magic_word     u32
/// format_rev     u32
/// reserv1        u32[2]
/// version        u8[32]    firmware version, NUL padded
/// project_name   u8[32]
/// build_time     u8[16]
/// build_date     u8[16]
/// payload_sha256 u8[32]    digest of everything after the descriptor
/// reserv2        u32[28]
/// ```
///
/// Encoded with fixed-width little-endian fields, 256 bytes total.
#[repr(C)]
#[derive(Encode, Decode, Debug, PartialEq)]
pub struct AppDescriptor {
    magic_word: u32,
    format_rev: u32,
    reserv1: [u32; 2],
    version: [u8; 32],
    project_name: [u8; 32],
    build_time: [u8; 16],
    build_date: [u8; 16],
    payload_sha256: [u8; 32],
    reserv2: [u32; 28],
}

impl AppDescriptor {
    /// Decodes a descriptor from the initial bytes of an image.
    pub fn from_image_prefix(prefix: &[u8]) -> Result<Self, VersionError> {
        if prefix.len() < SIZEOF_APP_DESC {
            return Err(VersionError::DescriptorTooShort(prefix.len()));
        }
        let (desc, _) = bincode::decode_from_slice::<AppDescriptor, _>(
            &prefix[..SIZEOF_APP_DESC],
            bincode::config::legacy(),
        )?;
        if desc.magic_word != APP_DESC_MAGIC {
            return Err(VersionError::BadMagic(desc.magic_word));
        }
        Ok(desc)
    }

    /// Builds the descriptor for a payload, digest included.
    pub fn for_payload(version: &str, project_name: &str, payload: &[u8]) -> Self {
        Self {
            magic_word: APP_DESC_MAGIC,
            format_rev: 1,
            reserv1: [0; 2],
            version: pad::<32>(version),
            project_name: pad::<32>(project_name),
            build_time: pad::<16>(""),
            build_date: pad::<16>(""),
            payload_sha256: Sha256::digest(payload).into(),
            reserv2: [0; 28],
        }
    }

    pub fn version(&self) -> FirmwareVersion {
        FirmwareVersion(self.version)
    }

    pub fn project_name(&self) -> String {
        let end = self
            .project_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.project_name.len());
        String::from_utf8_lossy(&self.project_name[..end]).into_owned()
    }

    pub fn payload_sha256(&self) -> &[u8; 32] {
        &self.payload_sha256
    }
}

/// Assembles a complete image: descriptor then payload. Used by tests and by
/// operators staging firmware for a dev server.
pub fn build_image(desc: &AppDescriptor, payload: &[u8]) -> Result<Vec<u8>, VersionError> {
    let mut image = bincode::encode_to_vec(desc, bincode::config::legacy())?;
    image.extend_from_slice(payload);
    Ok(image)
}

/// Version of the firmware currently booted, read once at startup. The
/// update flow only ever reads it.
pub struct VersionStore {
    running: FirmwareVersion,
}

impl VersionStore {
    pub fn new(running: FirmwareVersion) -> Self {
        Self { running }
    }

    pub fn running(&self) -> &FirmwareVersion {
        &self.running
    }
}

fn pad<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [0u8; N];
    let n = s.len().min(N);
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}
