//! High-level panel control.
//!
//! Thin convenience layer over the transport: connect, bring the display
//! up, and push frames. Pixel data is taken as pre-converted RGB565
//! bytes; decoding image files and converting color spaces is left to the
//! application.

use std::time::Duration;

use anyhow::{ensure, Context as _, Result};

use crate::commands::{Cdb, ImageHeader, INQUIRY_LEN, SENSE_LEN};
use crate::lifecycle::Phase;
use crate::transport::{ExecOptions, Gateway, Transport, TransportConfig, UsbGateway, UsbTransport};

/// How long to pump probes for the firmware to finish its boot animation
/// and settle. The full cycle takes a bit under a minute.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(70);

/// One attached panel.
pub struct LcdDevice<G: Gateway + 'static = UsbGateway> {
    transport: Transport<G>,
    display_ready: bool,
}

impl LcdDevice<UsbGateway> {
    /// Opens the first attached panel.
    pub fn open() -> Result<Self> {
        let transport = UsbTransport::open().context("opening LCD device")?;
        Ok(LcdDevice {
            transport,
            display_ready: false,
        })
    }

    pub fn open_with(vendor_id: u16, product_id: u16, config: TransportConfig) -> Result<Self> {
        let transport =
            UsbTransport::open_with(vendor_id, product_id, config).context("opening LCD device")?;
        Ok(LcdDevice {
            transport,
            display_ready: false,
        })
    }
}

impl<G: Gateway + 'static> LcdDevice<G> {
    /// Wraps an already-open transport (tests, alternate backends).
    pub fn from_transport(transport: Transport<G>) -> Self {
        LcdDevice {
            transport,
            display_ready: false,
        }
    }

    pub fn transport(&self) -> &Transport<G> {
        &self.transport
    }

    /// Blocks until the firmware reports live, pumping probes to keep its
    /// command stream fed.
    pub fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        self.transport
            .wait_for_phase(Phase::Connected, timeout)
            .context("waiting for the panel to leave its boot animation")?;
        Ok(())
    }

    /// Brings the display up: init, mode 5, stop the built-in animation,
    /// clear. Waits for the live phase first if necessary.
    pub fn init_display(&mut self) -> Result<()> {
        if self.transport.current_phase() != Phase::Connected {
            self.wait_until_connected(CONNECT_TIMEOUT)?;
        }
        log::info!("initializing display");
        self.run(Cdb::DisplayInit).context("display init")?;
        self.run(Cdb::SetMode { mode: 5 }).context("set display mode")?;
        self.run(Cdb::AnimationControl { run: false })
            .context("stop animation")?;
        self.run(Cdb::ClearScreen).context("clear screen")?;
        self.display_ready = true;
        log::info!("display initialized");
        Ok(())
    }

    /// Pushes one RGB565 frame to the given position. `pixels` must be
    /// exactly `width * height * 2` bytes, high byte first per pixel.
    pub fn display_image(&mut self, header: ImageHeader, pixels: &[u8]) -> Result<()> {
        ensure!(
            pixels.len() == header.pixel_bytes(),
            "pixel buffer is {} bytes but a {}x{} RGB565 frame needs {}",
            pixels.len(),
            header.width,
            header.height,
            header.pixel_bytes()
        );
        if !self.display_ready {
            self.init_display()?;
        }

        let mut payload = Vec::with_capacity(ImageHeader::LEN + pixels.len());
        payload.extend_from_slice(&header.encode());
        payload.extend_from_slice(pixels);

        log::info!(
            "displaying {}x{} image at ({}, {})",
            header.width,
            header.height,
            header.x,
            header.y
        );
        let cdb = Cdb::DisplayImage {
            data_len: payload.len() as u32,
        };
        let exchange = self
            .transport
            .execute_cdb(cdb, Some(&payload), &ExecOptions::default())
            .context("display image")?;
        ensure!(
            exchange.csw.passed(),
            "display image rejected with status {}",
            exchange.csw.status
        );
        Ok(())
    }

    pub fn clear_screen(&mut self) -> Result<()> {
        self.run(Cdb::ClearScreen).context("clear screen")
    }

    /// Starts or stops the firmware's built-in animation.
    pub fn control_animation(&mut self, run: bool) -> Result<()> {
        self.run(Cdb::AnimationControl { run })
            .context("animation control")
    }

    pub fn set_mode(&mut self, mode: u8) -> Result<()> {
        self.run(Cdb::SetMode { mode }).context("set display mode")
    }

    /// Reads the 8 status bytes the vendor firmware exposes.
    pub fn get_status(&mut self) -> Result<Vec<u8>> {
        let exchange = self
            .transport
            .execute_cdb(Cdb::GetStatus, None, &ExecOptions::default())
            .context("get status")?;
        ensure!(
            exchange.csw.passed(),
            "get status failed with status {}",
            exchange.csw.status
        );
        exchange.data_in.context("device returned no status data")
    }

    /// Standard INQUIRY, mostly useful for diagnostics.
    pub fn inquiry(&mut self) -> Result<Vec<u8>> {
        let exchange = self
            .transport
            .execute_cdb(Cdb::Inquiry { allocation: INQUIRY_LEN }, None, &ExecOptions::default())
            .context("inquiry")?;
        exchange.data_in.context("device returned no inquiry data")
    }

    /// Standard REQUEST SENSE; the firmware answers it even mid-animation.
    pub fn request_sense(&mut self) -> Result<Vec<u8>> {
        let exchange = self
            .transport
            .execute_cdb(
                Cdb::RequestSense { allocation: SENSE_LEN },
                None,
                &ExecOptions::default(),
            )
            .context("request sense")?;
        exchange.data_in.context("device returned no sense data")
    }

    /// TEST UNIT READY; returns whether the device reported ready.
    pub fn test_unit_ready(&mut self) -> Result<bool> {
        let exchange = self
            .transport
            .execute_cdb(Cdb::TestUnitReady, None, &ExecOptions::default())
            .context("test unit ready")?;
        Ok(exchange.csw.passed())
    }

    /// Shuts the transport down. Idempotent.
    pub fn close(&mut self) {
        self.transport.close();
        self.display_ready = false;
    }

    fn run(&mut self, cdb: Cdb) -> Result<()> {
        let exchange = self
            .transport
            .execute_cdb(cdb, None, &ExecOptions::default())?;
        ensure!(
            exchange.csw.passed(),
            "command {:?} failed with status {}",
            cdb,
            exchange.csw.status
        );
        Ok(())
    }
}
