//! Bulk-Only Transport framing.
//!
//! Serialization of the 31-byte Command Block Wrapper and parsing of the
//! 13-byte Command Status Wrapper, per USB Mass Storage Class - Bulk Only
//! Transport, section 5. All multi-byte fields are little-endian on the
//! wire. Callers hand the CDB in as opaque bytes; the image header that
//! rides inside 0xF5 0xB0 payloads is big-endian, but that is assembled a
//! layer up and never inspected here.

use thiserror::Error;

/// `dCBWSignature`, "USBC" little-endian.
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// `dCSWSignature`, "USBS" little-endian.
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// A CBW is always exactly 31 bytes.
pub const CBW_LEN: usize = 31;
/// A CSW is always exactly 13 bytes.
pub const CSW_LEN: usize = 13;

/// The only legal CDB lengths are 1 through 16.
pub const MAX_CDB_LEN: usize = 16;

pub const CSW_STATUS_PASSED: u8 = 0x00;
pub const CSW_STATUS_FAILED: u8 = 0x01;
pub const CSW_STATUS_PHASE_ERROR: u8 = 0x02;

/// Data-phase direction, as encoded into `bmCBWFlags` bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
    /// No data phase; the direction bit is ignored by the device.
    None,
}

impl Direction {
    fn flags(self) -> u8 {
        match self {
            Direction::In => 0x80,
            Direction::Out | Direction::None => 0x00,
        }
    }
}

/// Command Block Wrapper. Built once per command, immutable after encode.
#[derive(Debug, Clone)]
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_length: u32,
    pub direction: Direction,
    pub lun: u8,
    cdb: [u8; MAX_CDB_LEN],
    cdb_len: u8,
}

impl Cbw {
    /// Wraps a CDB. The CDB must be 1..=16 bytes; shorter blocks are
    /// zero-padded on the wire with the real length in `bCBWCBLength`.
    pub fn new(tag: u32, direction: Direction, data_transfer_length: u32, cdb: &[u8]) -> Self {
        assert!(
            !cdb.is_empty() && cdb.len() <= MAX_CDB_LEN,
            "CDB length {} out of range 1..=16",
            cdb.len()
        );
        let mut padded = [0u8; MAX_CDB_LEN];
        padded[..cdb.len()].copy_from_slice(cdb);
        Cbw {
            tag,
            data_transfer_length,
            direction,
            lun: 0,
            cdb: padded,
            cdb_len: cdb.len() as u8,
        }
    }

    /// Serializes into exactly 31 bytes.
    pub fn encode(&self) -> [u8; CBW_LEN] {
        let mut buf = [0u8; CBW_LEN];
        buf[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_transfer_length.to_le_bytes());
        buf[12] = self.direction.flags();
        buf[13] = self.lun;
        buf[14] = self.cdb_len;
        buf[15..31].copy_from_slice(&self.cdb);
        buf
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }
}

/// Command Status Wrapper as received from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Csw {
    /// Echo of the CBW tag, as far as this firmware bothers to echo it.
    pub tag: u32,
    /// Difference between requested and processed data-phase bytes.
    pub data_residue: u32,
    /// 0 = passed, 1 = failed, 2 = phase error.
    pub status: u8,
}

/// Structural CSW rejection; anything else in the frame is tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CswError {
    #[error("length {0}, expected 13")]
    BadLength(usize),
    #[error("signature {0:#010x}")]
    BadSignature(u32),
}

impl Csw {
    /// Parses a status wrapper, rejecting wrong lengths and signatures.
    pub fn decode(buf: &[u8]) -> Result<Csw, CswError> {
        if buf.len() != CSW_LEN {
            return Err(CswError::BadLength(buf.len()));
        }
        let signature = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if signature != CSW_SIGNATURE {
            return Err(CswError::BadSignature(signature));
        }
        Ok(Csw {
            tag: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            data_residue: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            status: buf[12],
        })
    }

    pub fn passed(&self) -> bool {
        self.status == CSW_STATUS_PASSED
    }

    /// Encodes back into wire form. Only used by test fixtures and kept
    /// next to `decode` so the layouts cannot drift apart.
    pub fn encode(&self) -> [u8; CSW_LEN] {
        let mut buf = [0u8; CSW_LEN];
        buf[0..4].copy_from_slice(&CSW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.data_residue.to_le_bytes());
        buf[12] = self.status;
        buf
    }
}
