//! USB endpoint gateway.
//!
//! The one place in the crate that touches the OS USB stack. Opening a
//! gateway finds the panel by VID/PID, detaches any kernel mass-storage
//! driver that grabbed it, claims the bulk-only interface, and resolves
//! the bulk IN/OUT endpoint addresses from the configuration descriptor.
//! Closing releases the interface and reattaches the kernel driver if one
//! was detached.
//!
//! OS-level error codes are translated into the canonical gateway errors
//! here and nowhere else.

use std::time::Duration;

use rusb::{Context, DeviceHandle, TransferType, UsbContext};

use super::{EndpointDir, Gateway, GatewayError};
use crate::error::{Error, ErrorKind, Result};

/// USB Mass Storage class with the SCSI transparent command set over
/// Bulk-Only Transport; what the panel enumerates as.
const MASS_STORAGE_CLASS: u8 = 0x08;
const SCSI_SUBCLASS: u8 = 0x06;
const BOT_PROTOCOL: u8 = 0x50;

pub struct UsbGateway {
    handle: DeviceHandle<Context>,
    interface: u8,
    ep_in: u8,
    ep_out: u8,
    detached_kernel_driver: bool,
    released: bool,
}

impl UsbGateway {
    /// Counts attached devices matching the vendor and product ID.
    pub fn scan_devices(vendor_id: u16, product_id: u16) -> Result<usize> {
        let context = Context::new().map_err(open_error)?;
        let n = context
            .devices()
            .map_err(open_error)?
            .iter()
            .filter(|device| {
                device
                    .device_descriptor()
                    .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
                    .unwrap_or(false)
            })
            .enumerate()
            .map(|(i, device)| {
                log::debug!("found LCD device #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    /// Opens the first device matching the vendor and product ID and
    /// claims its bulk-only mass-storage interface.
    pub fn open(vendor_id: u16, product_id: u16) -> Result<UsbGateway> {
        let context = Context::new().map_err(open_error)?;

        let device = context
            .devices()
            .map_err(open_error)?
            .iter()
            .find(|device| {
                device
                    .device_descriptor()
                    .map(|desc| desc.vendor_id() == vendor_id && desc.product_id() == product_id)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                log::error!(
                    "no LCD device found ({:04x}:{:04x} not attached)",
                    vendor_id,
                    product_id
                );
                Error::on_open(ErrorKind::NotFound)
            })?;
        log::debug!("found USB device {:?}", device);

        let mut handle = match device.open() {
            Ok(handle) => handle,
            Err(rusb::Error::Access) => {
                log::error!("failed to open USB device: permission denied");
                log::warn!("on Linux this usually means the udev rule for the panel is missing");
                return Err(Error::on_open(ErrorKind::PermissionDenied));
            }
            Err(rusb::Error::Busy) => {
                log::error!("failed to open USB device: busy");
                return Err(Error::on_open(ErrorKind::Busy));
            }
            Err(e) => {
                log::error!("failed to open USB device: {}", e);
                return Err(open_error(e));
            }
        };

        let config = device.config_descriptor(0).map_err(open_error)?;

        // The panel exposes a single bulk-only mass-storage interface;
        // resolve its number and bulk endpoint addresses rather than
        // hard-coding them.
        let mut found = None;
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                if desc.class_code() != MASS_STORAGE_CLASS
                    || desc.sub_class_code() != SCSI_SUBCLASS
                    || desc.protocol_code() != BOT_PROTOCOL
                {
                    continue;
                }
                let mut ep_in = None;
                let mut ep_out = None;
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        rusb::Direction::In => ep_in = Some(endpoint.address()),
                        rusb::Direction::Out => ep_out = Some(endpoint.address()),
                    }
                }
                if let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) {
                    found = Some((desc.interface_number(), ep_in, ep_out));
                }
            }
        }
        let (interface, ep_in, ep_out) = found.ok_or_else(|| {
            log::error!("device has no bulk-only mass-storage interface");
            Error::on_open(ErrorKind::NotFound)
        })?;

        let mut detached_kernel_driver = false;
        if handle.kernel_driver_active(interface).unwrap_or(false) {
            log::debug!("detaching kernel driver from interface {}", interface);
            match handle.detach_kernel_driver(interface) {
                Ok(()) => detached_kernel_driver = true,
                Err(e) => log::warn!("failed to detach kernel driver: {}", e),
            }
        }

        // The device may already be configured; that is fine.
        let _ = handle.set_active_configuration(config.number());

        handle.claim_interface(interface).map_err(|e| {
            log::error!("failed to claim interface {}: {}", interface, e);
            match e {
                rusb::Error::Busy => Error::on_open(ErrorKind::Busy),
                rusb::Error::Access => Error::on_open(ErrorKind::PermissionDenied),
                e => open_error(e),
            }
        })?;
        log::debug!(
            "claimed interface {} (bulk in {:#04x}, bulk out {:#04x})",
            interface,
            ep_in,
            ep_out
        );

        Ok(UsbGateway {
            handle,
            interface,
            ep_in,
            ep_out,
            detached_kernel_driver,
            released: false,
        })
    }

    fn address(&self, ep: EndpointDir) -> u8 {
        match ep {
            EndpointDir::In => self.ep_in,
            EndpointDir::Out => self.ep_out,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        // Communication errors are ignored on the way out.
        let _ = self.handle.release_interface(self.interface);
        if self.detached_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.interface) {
                log::debug!("could not reattach kernel driver: {}", e);
            }
        }
    }
}

impl Drop for UsbGateway {
    fn drop(&mut self) {
        self.release();
    }
}

impl Gateway for UsbGateway {
    fn bulk_out(
        &mut self,
        bytes: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, GatewayError> {
        self.handle
            .write_bulk(self.ep_out, bytes, timeout)
            .map_err(io_error)
    }

    fn bulk_in(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> std::result::Result<Vec<u8>, GatewayError> {
        let mut buf = vec![0u8; max_len];
        let nread = self
            .handle
            .read_bulk(self.ep_in, &mut buf, timeout)
            .map_err(io_error)?;
        buf.truncate(nread);
        Ok(buf)
    }

    fn clear_halt(&mut self, ep: EndpointDir) -> std::result::Result<(), GatewayError> {
        log::debug!("clearing halt on endpoint {:#04x}", self.address(ep));
        self.handle.clear_halt(self.address(ep)).map_err(io_error)
    }

    fn reset_device(&mut self) -> std::result::Result<(), GatewayError> {
        log::debug!("resetting device");
        self.handle.reset().map_err(io_error)
    }

    fn is_present(&mut self) -> bool {
        self.handle.device().device_descriptor().is_ok()
    }

    fn shutdown(&mut self) {
        self.release();
    }
}

/// Canonical translation of rusb errors during transfers.
fn io_error(e: rusb::Error) -> GatewayError {
    match e {
        rusb::Error::Pipe => GatewayError::Stall,
        rusb::Error::Busy => GatewayError::Busy,
        rusb::Error::Timeout => GatewayError::Timeout,
        rusb::Error::NoDevice | rusb::Error::NotFound | rusb::Error::Io => GatewayError::Gone,
        e => {
            log::warn!("unexpected USB error treated as device loss: {}", e);
            GatewayError::Gone
        }
    }
}

/// Translation of rusb errors while opening, before a handle exists.
fn open_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::Access => Error::on_open(ErrorKind::PermissionDenied),
        rusb::Error::Busy => Error::on_open(ErrorKind::Busy),
        _ => Error::on_open(ErrorKind::NotFound),
    }
}
