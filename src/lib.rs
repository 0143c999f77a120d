//! Driver library for the ALi (0402:3922) USB LCD panel.
//!
//! The panel enumerates as a USB Mass Storage device and is driven with
//! standard SCSI plus a vendor 0xF5 command family over Bulk-Only
//! Transport. Its firmware is quirky: it cycles through a boot animation
//! before it will take commands seriously, resets its CSW tag counter at
//! unpredictable points, stalls endpoints on ill-timed requests, and
//! drops to a "connection lost" screen if the host pauses for a few
//! seconds. The transport in this crate tracks that lifecycle and adapts
//! its pacing, retries, and tag validation to it.
//!
//! # Examples
//!
//! ```no_run
//! use alilcd::commands::ImageHeader;
//! use alilcd::device::LcdDevice;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut lcd = LcdDevice::open()?;
//! lcd.init_display()?;
//!
//! let pixels = vec![0u8; 320 * 320 * 2]; // RGB565, high byte first
//! lcd.display_image(ImageHeader::new(0, 0, 320, 320), &pixels)?;
//! lcd.close();
//! # Ok(())
//! # }
//! ```
//!
//! Lower-level access goes through [`transport::UsbTransport`], which
//! exposes the raw `execute` path, phase inspection, and statistics.

pub mod commands;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod policy;
pub mod protocol;
pub mod tag;
pub mod transport;

pub use device::LcdDevice;
pub use error::{Error, ErrorKind, Result};
pub use lifecycle::{LifecycleConfig, Phase};
pub use policy::{PolicyTable, StageTimeouts};
pub use transport::{
    ExecOptions, Exchange, Gateway, GatewayError, Statistics, Transport, TransportConfig,
    UsbTransport,
};

/// ALi Corporation.
pub const VENDOR_ID: u16 = 0x0402;
/// The LCD panel.
pub const PRODUCT_ID: u16 = 0x3922;
