//! SCSI command descriptor blocks understood by the panel.
//!
//! The transport itself treats CDBs as opaque bytes; this module is the
//! catalogue of what the firmware actually answers to: the three standard
//! SCSI commands it needs to look like a mass-storage device, and the
//! vendor 0xF5 family that drives the display. Vendor CDBs are 12 bytes,
//! subcommand in the second byte, remainder zero.

use crate::protocol::Direction;

/// Vendor command opcode.
const VENDOR_OPCODE: u8 = 0xF5;

const SUB_RESET: u8 = 0x00;
const SUB_INIT: u8 = 0x01;
const SUB_ANIMATION: u8 = 0x10;
const SUB_SET_MODE: u8 = 0x20;
const SUB_GET_STATUS: u8 = 0x30;
const SUB_CLEAR_SCREEN: u8 = 0xA0;
const SUB_DISPLAY_IMAGE: u8 = 0xB0;

/// Allocation length for REQUEST SENSE.
pub const SENSE_LEN: u8 = 18;
/// Allocation length for a standard INQUIRY response.
pub const INQUIRY_LEN: u8 = 36;
/// Length of the 0xF5 0x30 status reply.
pub const STATUS_LEN: usize = 8;

/// A command the panel understands, with its data-phase shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cdb {
    TestUnitReady,
    RequestSense { allocation: u8 },
    Inquiry { allocation: u8 },
    /// Vendor: reset the display controller.
    DisplayReset,
    /// Vendor: initialize the display.
    DisplayInit,
    /// Vendor: start or stop the built-in animation. 1-byte payload.
    AnimationControl { run: bool },
    /// Vendor: set the display mode. 4-byte payload, mode in the first.
    SetMode { mode: u8 },
    /// Vendor: read 8 status bytes back.
    GetStatus,
    /// Vendor: clear the screen to black.
    ClearScreen,
    /// Vendor: push pixels. The payload is an [`ImageHeader`] followed by
    /// RGB565 pixel data; `data_len` is the total payload length.
    DisplayImage { data_len: u32 },
}

impl Cdb {
    /// The raw CDB bytes, 6 for standard SCSI and 12 for the vendor family.
    pub fn bytes(&self) -> Vec<u8> {
        match *self {
            Cdb::TestUnitReady => vec![0x00; 6],
            Cdb::RequestSense { allocation } => vec![0x03, 0, 0, 0, allocation, 0],
            Cdb::Inquiry { allocation } => vec![0x12, 0, 0, 0, allocation, 0],
            Cdb::DisplayReset => vendor(SUB_RESET),
            Cdb::DisplayInit => vendor(SUB_INIT),
            Cdb::AnimationControl { .. } => vendor(SUB_ANIMATION),
            Cdb::SetMode { .. } => vendor(SUB_SET_MODE),
            Cdb::GetStatus => vendor(SUB_GET_STATUS),
            Cdb::ClearScreen => vendor(SUB_CLEAR_SCREEN),
            Cdb::DisplayImage { .. } => vendor(SUB_DISPLAY_IMAGE),
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Cdb::RequestSense { .. } | Cdb::Inquiry { .. } | Cdb::GetStatus => Direction::In,
            Cdb::AnimationControl { .. } | Cdb::SetMode { .. } | Cdb::DisplayImage { .. } => {
                Direction::Out
            }
            _ => Direction::None,
        }
    }

    /// Expected data-phase length in either direction.
    pub fn transfer_length(&self) -> u32 {
        match *self {
            Cdb::RequestSense { allocation } | Cdb::Inquiry { allocation } => allocation as u32,
            Cdb::GetStatus => STATUS_LEN as u32,
            Cdb::AnimationControl { .. } => 1,
            Cdb::SetMode { .. } => 4,
            Cdb::DisplayImage { data_len } => data_len,
            _ => 0,
        }
    }

    /// The host-to-device payload for commands that carry one inline.
    /// `DisplayImage` payloads are assembled by the caller.
    pub fn payload(&self) -> Option<Vec<u8>> {
        match *self {
            Cdb::AnimationControl { run } => Some(vec![u8::from(run)]),
            Cdb::SetMode { mode } => Some(vec![mode, 0, 0, 0]),
            _ => None,
        }
    }
}

fn vendor(sub: u8) -> Vec<u8> {
    let mut cdb = vec![0u8; 12];
    cdb[0] = VENDOR_OPCODE;
    cdb[1] = sub;
    cdb
}

/// The 10-byte header preceding pixel data in a 0xF5 0xB0 payload.
///
/// Unlike the CBW/CSW envelope, the coordinate fields here are
/// *big-endian*; the firmware parses this blob itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl ImageHeader {
    pub const LEN: usize = 10;

    /// RGB565 format marker, the only one the firmware accepts.
    const FORMAT_RGB565: u8 = 0x01;

    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        ImageHeader { x, y, width, height }
    }

    /// Bytes of pixel data a frame of this size must carry.
    pub fn pixel_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }

    /// Total 0xF5 0xB0 payload length for this frame.
    pub fn payload_len(&self) -> u32 {
        (Self::LEN + self.pixel_bytes()) as u32
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = Self::FORMAT_RGB565;
        buf[1] = 0x00;
        buf[2..4].copy_from_slice(&self.x.to_be_bytes());
        buf[4..6].copy_from_slice(&self.y.to_be_bytes());
        buf[6..8].copy_from_slice(&self.width.to_be_bytes());
        buf[8..10].copy_from_slice(&self.height.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_cdbs_match_the_wire_captures() {
        assert_eq!(Cdb::TestUnitReady.bytes(), vec![0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Cdb::RequestSense { allocation: SENSE_LEN }.bytes(),
            vec![0x03, 0, 0, 0, 18, 0]
        );
        assert_eq!(
            Cdb::Inquiry { allocation: INQUIRY_LEN }.bytes(),
            vec![0x12, 0, 0, 0, 36, 0]
        );
    }

    #[test]
    fn vendor_cdbs_are_twelve_bytes() {
        for cdb in [
            Cdb::DisplayReset,
            Cdb::DisplayInit,
            Cdb::AnimationControl { run: true },
            Cdb::SetMode { mode: 5 },
            Cdb::GetStatus,
            Cdb::ClearScreen,
            Cdb::DisplayImage { data_len: 10 },
        ] {
            let bytes = cdb.bytes();
            assert_eq!(bytes.len(), 12);
            assert_eq!(bytes[0], 0xF5);
            assert!(bytes[2..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn payloads() {
        assert_eq!(Cdb::AnimationControl { run: false }.payload(), Some(vec![0]));
        assert_eq!(Cdb::AnimationControl { run: true }.payload(), Some(vec![1]));
        assert_eq!(Cdb::SetMode { mode: 5 }.payload(), Some(vec![5, 0, 0, 0]));
        assert_eq!(Cdb::TestUnitReady.payload(), None);
    }

    #[test]
    fn directions_and_lengths() {
        assert_eq!(Cdb::GetStatus.direction(), Direction::In);
        assert_eq!(Cdb::GetStatus.transfer_length(), 8);
        assert_eq!(Cdb::ClearScreen.direction(), Direction::None);
        assert_eq!(Cdb::ClearScreen.transfer_length(), 0);
        let img = Cdb::DisplayImage { data_len: 204_810 };
        assert_eq!(img.direction(), Direction::Out);
        assert_eq!(img.transfer_length(), 204_810);
    }

    #[test]
    fn image_header_is_big_endian() {
        let hdr = ImageHeader::new(0, 0, 320, 320);
        let bytes = hdr.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[6..8], &[0x01, 0x40]); // 320 big-endian
        assert_eq!(&bytes[8..10], &[0x01, 0x40]);
        assert_eq!(hdr.pixel_bytes(), 204_800);
        assert_eq!(hdr.payload_len(), 204_810);
    }
}
