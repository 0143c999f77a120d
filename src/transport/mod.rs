//! Device transport.
//!
//! This module is the heart of the driver: the [`Gateway`] trait is the
//! seam over the two bulk pipes, and [`Transport`] is the orchestrator
//! that frames SCSI commands into CBW/CSW exchanges across it.
//!
//! The device is a reverse-engineered black box. Its firmware walks a
//! boot-animation / settling / live cycle, echoes garbage tags while the
//! animation runs, stalls endpoints when commands arrive at the wrong
//! moment, and shows a "connection lost" screen if the host goes quiet
//! for a few seconds. The orchestrator therefore:
//!
//! - paces every exchange according to the inferred lifecycle phase,
//! - validates echoed tags under a phase-dependent policy,
//! - recovers stalls by clearing halts (escalating to a device reset when
//!   the live phase keeps stalling),
//! - poisons the handle the moment the device falls off the bus,
//! - and runs a background keep-alive probe so an idle link never trips
//!   the firmware's silence timeout.
//!
//! BOT permits exactly one outstanding CBW/CSW exchange per device; a
//! single mutex around the whole exchange enforces that, and the pacing
//! sleeps deliberately happen under it.

mod keepalive;
pub mod usb;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::commands::Cdb;
use crate::error::{Error, ErrorKind, Result};
use crate::lifecycle::{Lifecycle, LifecycleConfig, Observation, PerPhase, Phase, PhaseCounters};
use crate::policy::{PhasePolicy, PolicyTable, StageTimeouts};
use crate::protocol::{Cbw, Csw, Direction, CSW_LEN};
use crate::tag::{TagMonitor, TagSummary, TagValidation};

pub use usb::UsbGateway;

/// A [`Transport`] over the real USB device.
pub type UsbTransport = Transport<UsbGateway>;

/// Canonical outcome of a single gateway call. Translation from OS error
/// codes happens in the gateway implementation and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayError {
    /// The endpoint halted.
    Stall,
    /// The OS reported the resource busy.
    Busy,
    /// The transfer did not complete within its timeout.
    Timeout,
    /// The device is no longer on the bus.
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDir {
    In,
    Out,
}

/// Abstraction of the claimed bulk interface.
///
/// Might be the real USB device or a scripted stand-in; the orchestrator
/// only ever talks to the pipes through this trait.
pub trait Gateway: Send {
    /// Writes to the bulk OUT endpoint. Returns the byte count accepted.
    fn bulk_out(&mut self, bytes: &[u8], timeout: Duration)
        -> std::result::Result<usize, GatewayError>;

    /// Reads up to `max_len` bytes from the bulk IN endpoint. Short reads
    /// are not an error.
    fn bulk_in(&mut self, max_len: usize, timeout: Duration)
        -> std::result::Result<Vec<u8>, GatewayError>;

    /// Clears a halt condition on one endpoint.
    fn clear_halt(&mut self, ep: EndpointDir) -> std::result::Result<(), GatewayError>;

    /// Performs a USB device reset.
    fn reset_device(&mut self) -> std::result::Result<(), GatewayError>;

    /// Whether the device still answers on the bus.
    fn is_present(&mut self) -> bool;

    /// Releases claimed resources ahead of drop. Called once on `close`.
    fn shutdown(&mut self) {}
}

/// Transport-wide configuration. Defaults match the observed firmware.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub policy: PolicyTable,
    pub lifecycle: LifecycleConfig,
    pub timeouts: StageTimeouts,
    /// Wake interval of the keep-alive task.
    pub keep_alive_interval: Duration,
    /// CSW silence after which the keep-alive task probes.
    pub keep_alive_idle: Duration,
    /// Spawn the keep-alive task on open.
    pub start_keep_alive: bool,
    /// On device loss, attempt one reset + presence probe instead of
    /// poisoning the handle outright.
    pub auto_reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            policy: PolicyTable::default(),
            lifecycle: LifecycleConfig::default(),
            timeouts: StageTimeouts::default(),
            keep_alive_interval: Duration::from_secs(3),
            keep_alive_idle: Duration::from_secs(3),
            start_keep_alive: true,
            auto_reconnect: false,
        }
    }
}

/// Per-call options for [`Transport::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Cooperative cancel flag. Honored at suspension points up to the
    /// moment the CBW reaches the wire; after that the exchange always
    /// runs through to its CSW, because an unread CSW desynchronizes the
    /// device for every later command.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Allow the exchange while the lifecycle reports Disconnected. Set
    /// by the keep-alive task and the phase-wait probe loop, which need
    /// to keep talking so the firmware's own restart can be observed.
    pub probe: bool,
}

impl ExecOptions {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |c| c.load(Ordering::Relaxed))
    }
}

/// A completed exchange: the status wrapper plus any device-to-host data.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub csw: Csw,
    pub data_in: Option<Vec<u8>>,
}

/// Counters snapshot for diagnosis.
#[derive(Debug, Clone)]
pub struct Statistics {
    pub phase: Phase,
    pub per_phase: PerPhase<PhaseCounters>,
    pub tags: TagSummary,
    pub transitions: u64,
}

/// Everything that must be touched under the single exchange lock.
struct Bus<G> {
    gateway: G,
    tags: TagMonitor,
    lifecycle: Lifecycle,
    poisoned: bool,
}

impl<G: Gateway> Bus<G> {
    fn err(&self, kind: ErrorKind, tag: u32, attempts: u32) -> Error {
        Error {
            kind,
            phase: self.lifecycle.phase(),
            tag,
            elapsed_in_phase: self.lifecycle.elapsed_in_phase(),
            attempts,
        }
    }

    fn tick(&mut self) {
        let rate = self.tags.recent_mismatch_rate();
        self.lifecycle.tick(rate);
    }

    fn clear_both_halts(&mut self) {
        for ep in [EndpointDir::Out, EndpointDir::In] {
            if let Err(e) = self.gateway.clear_halt(ep) {
                log::warn!("failed to clear halt on {:?} endpoint: {:?}", ep, e);
            }
        }
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.lifecycle.observe(Observation::DeviceGone);
    }
}

pub(crate) struct Shared<G: Gateway> {
    bus: Mutex<Bus<G>>,
    config: TransportConfig,
}

/// Handle to one device. Exclusively owns the claimed interface, the tag
/// monitor, the lifecycle block, and the keep-alive task.
pub struct Transport<G: Gateway> {
    shared: Arc<Shared<G>>,
    keepalive: Option<keepalive::KeepAlive>,
    closed: bool,
}

impl UsbTransport {
    /// Opens the first attached panel using the default identity and
    /// configuration.
    pub fn open() -> Result<Self> {
        Self::open_with(crate::VENDOR_ID, crate::PRODUCT_ID, TransportConfig::default())
    }

    pub fn open_with(vendor_id: u16, product_id: u16, config: TransportConfig) -> Result<Self> {
        let gateway = UsbGateway::open(vendor_id, product_id)?;
        Ok(Self::with_gateway(gateway, config))
    }
}

impl<G: Gateway + 'static> Transport<G> {
    /// Builds a transport over an already-open gateway. This is how tests
    /// drive the orchestrator against a scripted device.
    pub fn with_gateway(gateway: G, config: TransportConfig) -> Self {
        let start_keep_alive = config.start_keep_alive;
        let interval = config.keep_alive_interval;
        let shared = Arc::new(Shared {
            bus: Mutex::new(Bus {
                gateway,
                tags: TagMonitor::new(),
                lifecycle: Lifecycle::new(config.lifecycle.clone()),
                poisoned: false,
            }),
            config,
        });
        let keepalive =
            start_keep_alive.then(|| keepalive::spawn(Arc::downgrade(&shared), interval));
        Transport {
            shared,
            keepalive,
            closed: false,
        }
    }

    /// Runs one SCSI command through the full CBW / data / CSW protocol.
    ///
    /// `expected_in` is the device-to-host transfer length and is only
    /// meaningful with [`Direction::In`]. The returned CSW carries the
    /// raw status byte; whether a non-zero status is an error here is
    /// decided by the phase policy, and otherwise left to the caller.
    pub fn execute(
        &self,
        cdb: &[u8],
        direction: Direction,
        data_out: Option<&[u8]>,
        expected_in: usize,
        opts: &ExecOptions,
    ) -> Result<Exchange> {
        self.shared.execute(cdb, direction, data_out, expected_in, opts)
    }

    /// Convenience wrapper running a catalogued [`Cdb`] with its inline
    /// payload (or `data_out` for commands whose payload the caller
    /// assembles).
    pub fn execute_cdb(
        &self,
        cdb: Cdb,
        data_out: Option<&[u8]>,
        opts: &ExecOptions,
    ) -> Result<Exchange> {
        let inline = cdb.payload();
        let data = data_out.or(inline.as_deref());
        let expected_in = match cdb.direction() {
            Direction::In => cdb.transfer_length() as usize,
            _ => 0,
        };
        self.shared
            .execute(&cdb.bytes(), cdb.direction(), data, expected_in, opts)
    }

    /// The inferred phase right now, after a wall-clock check.
    pub fn current_phase(&self) -> Phase {
        let mut bus = self.shared.lock_bus();
        bus.tick();
        bus.lifecycle.phase()
    }

    /// Pumps TEST UNIT READY probes until the lifecycle reports `target`
    /// or the deadline passes. Probe failures feed the lifecycle and are
    /// otherwise expected; device loss is surfaced immediately.
    pub fn wait_for_phase(&self, target: Phase, timeout: Duration) -> Result<Phase> {
        let deadline = Instant::now() + timeout;
        let opts = ExecOptions {
            probe: true,
            ..Default::default()
        };
        loop {
            if self.current_phase() == target {
                return Ok(target);
            }
            if Instant::now() >= deadline {
                let bus = self.shared.lock_bus();
                return Err(bus.err(ErrorKind::Timeout, 0, 0));
            }
            match self.execute(&Cdb::TestUnitReady.bytes(), Direction::None, None, 0, &opts) {
                Ok(exchange) => log::trace!("phase probe CSW status {}", exchange.csw.status),
                Err(e) if e.is_device_gone() => return Err(e),
                Err(e) => log::debug!("phase probe: {}", e),
            }
        }
    }

    pub fn statistics(&self) -> Statistics {
        let bus = self.shared.lock_bus();
        Statistics {
            phase: bus.lifecycle.phase(),
            per_phase: *bus.lifecycle.totals(),
            tags: bus.tags.summary(),
            transitions: bus.lifecycle.transition_count(),
        }
    }

    /// Stops the keep-alive task, releases the interface, and poisons the
    /// handle. Idempotent; also run on drop.
    pub fn close(&mut self) {
        // The keep-alive task is cancelled and joined before endpoint
        // release so no probe can race the teardown.
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        if !self.closed {
            self.closed = true;
            let mut bus = self.shared.lock_bus();
            bus.poisoned = true;
            bus.lifecycle.force_unknown();
            bus.gateway.shutdown();
        }
    }
}

impl<G: Gateway> Drop for Transport<G> {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        if !self.closed {
            let mut bus = self.shared.lock_bus();
            bus.gateway.shutdown();
        }
    }
}

impl<G: Gateway> Shared<G> {
    fn lock_bus(&self) -> std::sync::MutexGuard<'_, Bus<G>> {
        self.bus.lock().expect("transport mutex poisoned")
    }

    fn execute(
        &self,
        cdb: &[u8],
        direction: Direction,
        data_out: Option<&[u8]>,
        expected_in: usize,
        opts: &ExecOptions,
    ) -> Result<Exchange> {
        let mut bus = self.lock_bus();
        let bus = &mut *bus;

        if bus.poisoned {
            return Err(bus.err(ErrorKind::DeviceGone, 0, 0));
        }
        bus.lifecycle.on_operation_start();
        bus.tick();
        if bus.lifecycle.phase() == Phase::Disconnected && !opts.probe {
            // The firmware is showing its "connection lost" screen; only
            // probes may keep talking until it restarts its cycle.
            return Err(bus.err(ErrorKind::DeviceGone, 0, 0));
        }

        let policy = self.config.policy.for_phase(bus.lifecycle.phase()).clone();
        if opts.cancelled() {
            return Err(bus.err(ErrorKind::Cancelled, 0, 0));
        }
        thread::sleep(policy.pre_delay);

        let transfer_len = match direction {
            Direction::In => expected_in as u32,
            Direction::Out => data_out.map_or(0, |d| d.len() as u32),
            Direction::None => 0,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(
                bus, cdb, direction, data_out, expected_in, transfer_len, &policy, opts, attempt,
            ) {
                Ok(exchange) => {
                    thread::sleep(policy.post_delay);
                    return Ok(exchange);
                }
                Err(e)
                    if matches!(e.kind, ErrorKind::TagMismatch { .. })
                        && attempt <= policy.max_retries =>
                {
                    // A rejected tag retries the whole exchange under a
                    // fresh tag; the device has already consumed the CSW.
                    log::debug!("retrying after {} (attempt {})", e, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        bus: &mut Bus<G>,
        cdb: &[u8],
        direction: Direction,
        data_out: Option<&[u8]>,
        expected_in: usize,
        transfer_len: u32,
        policy: &PhasePolicy,
        opts: &ExecOptions,
        attempt: u32,
    ) -> Result<Exchange> {
        let phase = bus.lifecycle.phase();
        bus.lifecycle.count_command();
        let tag = bus.tags.next(phase);
        let frame = Cbw::new(tag, direction, transfer_len, cdb).encode();
        log::debug!(
            "=> {} {}",
            hex::encode(&frame[..15]),
            hex::encode(&frame[15..])
        );

        self.submit_cbw(bus, &frame, policy, tag, opts)?;

        let mut data_in = None;
        if transfer_len > 0 {
            match direction {
                Direction::Out => {
                    if let Some(data) = data_out {
                        self.send_data(bus, data, policy, tag, attempt)?;
                    }
                }
                Direction::In => {
                    data_in = self.read_data(bus, expected_in, policy, tag, attempt)?;
                }
                Direction::None => {}
            }
        }

        let csw = self.read_csw(bus, policy, tag, attempt)?;
        log::debug!(
            "<= tag={} residue={} status={}",
            csw.tag,
            csw.data_residue,
            csw.status
        );

        let exact = csw.tag == tag;
        let accepted = match bus.tags.validate(tag, csw.tag, phase) {
            TagValidation::Accept => true,
            TagValidation::SuspectedReset => {
                bus.tags.rebase(csw.tag);
                true
            }
            TagValidation::Mismatch => false,
        };
        bus.lifecycle.observe(Observation::Csw {
            status: csw.status,
            accepted,
            exact,
        });
        bus.tick();

        if !accepted {
            return Err(bus.err(
                ErrorKind::TagMismatch {
                    expected: tag,
                    actual: csw.tag,
                },
                tag,
                attempt,
            ));
        }
        if !csw.passed() && !policy.accept_scsi_failure {
            return Err(bus.err(
                ErrorKind::ScsiFailure {
                    status: csw.status,
                    residue: csw.data_residue,
                },
                tag,
                attempt,
            ));
        }
        Ok(Exchange { csw, data_in })
    }

    fn submit_cbw(
        &self,
        bus: &mut Bus<G>,
        frame: &[u8],
        policy: &PhasePolicy,
        tag: u32,
        opts: &ExecOptions,
    ) -> Result<()> {
        let mut stalls = 0u32;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if opts.cancelled() {
                // Nothing is on the wire yet, so aborting here is safe.
                return Err(bus.err(ErrorKind::Cancelled, tag, attempt));
            }
            match bus.gateway.bulk_out(frame, self.config.timeouts.cbw_out) {
                Ok(_) => return Ok(()),
                Err(GatewayError::Stall) => {
                    bus.lifecycle.observe(Observation::PipeError);
                    stalls += 1;
                    if policy.reset_on_repeat_stall && stalls >= 2 {
                        self.reset_bus(bus, tag, attempt)?;
                        return Err(bus.err(ErrorKind::PipeStall, tag, attempt));
                    }
                    if policy.clear_halt_on_stall {
                        bus.clear_both_halts();
                    }
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::PipeStall, tag, attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Busy) => {
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::ResourceBusy, tag, attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Timeout) => {
                    bus.lifecycle.observe(Observation::Timeout);
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::Timeout, tag, attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Gone) => {
                    return Err(self.device_gone(bus, tag, attempt));
                }
            }
        }
    }

    fn send_data(
        &self,
        bus: &mut Bus<G>,
        data: &[u8],
        policy: &PhasePolicy,
        tag: u32,
        op_attempt: u32,
    ) -> Result<()> {
        let timeout = self.config.timeouts.data(data.len());
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match bus.gateway.bulk_out(data, timeout) {
                Ok(_) => return Ok(()),
                Err(GatewayError::Stall) => {
                    // Recoverable mid-exchange: clear the halt and let the
                    // status phase report what the device made of it.
                    bus.lifecycle.observe(Observation::PipeError);
                    if let Err(e) = bus.gateway.clear_halt(EndpointDir::Out) {
                        log::warn!("clear halt after data stall failed: {:?}", e);
                    }
                    return Ok(());
                }
                Err(GatewayError::Timeout) => {
                    bus.lifecycle.observe(Observation::Timeout);
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::Timeout, tag, op_attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Busy) => {
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::ResourceBusy, tag, op_attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Gone) => {
                    return Err(self.device_gone(bus, tag, attempt));
                }
            }
        }
    }

    fn read_data(
        &self,
        bus: &mut Bus<G>,
        expected_in: usize,
        policy: &PhasePolicy,
        tag: u32,
        op_attempt: u32,
    ) -> Result<Option<Vec<u8>>> {
        let timeout = self.config.timeouts.data(expected_in);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match bus.gateway.bulk_in(expected_in, timeout) {
                // A short read is fine; the CSW residue accounts for it.
                Ok(buf) => return Ok(Some(buf)),
                Err(GatewayError::Stall) => {
                    bus.lifecycle.observe(Observation::PipeError);
                    if let Err(e) = bus.gateway.clear_halt(EndpointDir::In) {
                        log::warn!("clear halt after data stall failed: {:?}", e);
                    }
                    return Ok(None);
                }
                Err(GatewayError::Timeout) => {
                    bus.lifecycle.observe(Observation::Timeout);
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::Timeout, tag, op_attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Busy) => {
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::ResourceBusy, tag, op_attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Gone) => {
                    return Err(self.device_gone(bus, tag, attempt));
                }
            }
        }
    }

    fn read_csw(
        &self,
        bus: &mut Bus<G>,
        policy: &PhasePolicy,
        tag: u32,
        op_attempt: u32,
    ) -> Result<Csw> {
        let mut invalid_retried = false;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match bus.gateway.bulk_in(CSW_LEN, self.config.timeouts.csw_in) {
                Ok(buf) => match Csw::decode(&buf) {
                    Ok(csw) => return Ok(csw),
                    Err(e) => {
                        log::warn!("invalid CSW ({}): {}", e, hex::encode(&buf));
                        if invalid_retried {
                            return Err(bus.err(ErrorKind::InvalidCsw(e), tag, op_attempt));
                        }
                        // One re-read after clearing the IN halt; the
                        // device sometimes sends a runt first.
                        invalid_retried = true;
                        if let Err(e) = bus.gateway.clear_halt(EndpointDir::In) {
                            log::warn!("clear halt before CSW re-read failed: {:?}", e);
                        }
                    }
                },
                Err(GatewayError::Stall) => {
                    bus.lifecycle.observe(Observation::PipeError);
                    if let Err(e) = bus.gateway.clear_halt(EndpointDir::In) {
                        log::warn!("clear halt during status phase failed: {:?}", e);
                    }
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::PipeStall, tag, op_attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Timeout) => {
                    bus.lifecycle.observe(Observation::Timeout);
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::Timeout, tag, op_attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Busy) => {
                    if attempt > policy.max_retries {
                        return Err(bus.err(ErrorKind::ResourceBusy, tag, op_attempt));
                    }
                    thread::sleep(policy.backoff(attempt));
                }
                Err(GatewayError::Gone) => {
                    return Err(self.device_gone(bus, tag, attempt));
                }
            }
        }
    }

    /// Repeated stall in the live phase: reset the device. The firmware
    /// starts its cycle over, so the lifecycle returns to Unknown and the
    /// tag counter rebases to 1.
    fn reset_bus(&self, bus: &mut Bus<G>, tag: u32, attempt: u32) -> Result<()> {
        log::warn!("repeated stall; resetting device");
        match bus.gateway.reset_device() {
            Ok(()) => {
                bus.lifecycle.force_unknown();
                bus.tags.reset();
                Ok(())
            }
            Err(_) => Err(self.device_gone(bus, tag, attempt)),
        }
    }

    fn device_gone(&self, bus: &mut Bus<G>, tag: u32, attempt: u32) -> Error {
        if self.config.auto_reconnect {
            log::warn!("device lost; attempting reset + re-enumeration");
            if bus.gateway.reset_device().is_ok() && bus.gateway.is_present() {
                // The operation in flight still failed, but the handle
                // survives: the device re-enumerated and starts a fresh
                // animation cycle with fresh tags.
                bus.lifecycle.observe(Observation::DeviceGone);
                bus.lifecycle.observe(Observation::Reenumerated);
                bus.tags.reset();
                return bus.err(ErrorKind::DeviceGone, tag, attempt);
            }
        }
        bus.poison();
        bus.err(ErrorKind::DeviceGone, tag, attempt)
    }

    /// Whether the keep-alive task should probe: link settled past the
    /// animation, not poisoned, and silent for longer than the idle
    /// threshold.
    pub(crate) fn should_probe(&self) -> bool {
        let mut bus = self.lock_bus();
        if bus.poisoned {
            return false;
        }
        bus.tick();
        match bus.lifecycle.phase() {
            Phase::Connecting | Phase::Connected | Phase::Disconnected => {}
            Phase::Unknown | Phase::Animation => return false,
        }
        bus.lifecycle
            .time_since_last_csw()
            .map_or(true, |silent| silent > self.config.keep_alive_idle)
    }

    /// One keep-alive probe. Failures are logged, never propagated; they
    /// still feed the lifecycle through the normal execute path.
    pub(crate) fn probe(&self) {
        let opts = ExecOptions {
            probe: true,
            ..Default::default()
        };
        let cdb = Cdb::TestUnitReady;
        match self.execute(&cdb.bytes(), Direction::None, None, 0, &opts) {
            Ok(exchange) => log::debug!("keep-alive CSW status {}", exchange.csw.status),
            Err(e) => log::debug!("keep-alive probe failed: {}", e),
        }
    }
}
