//! Scripted stand-in for the USB gateway.
//!
//! The mock models the device side of the Bulk-Only protocol: it parses
//! CBWs off the OUT pipe, walks the data phase, and produces a CSW, all
//! according to a per-exchange plan supplied by the test's responder
//! closure. Every pipe interaction is recorded so tests can assert on
//! ordering, and BOT violations (a new CBW while the previous exchange
//! was never resolved) are collected rather than panicking across the
//! transport's threads.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alilcd::lifecycle::LifecycleConfig;
use alilcd::policy::{PolicyTable, StageTimeouts};
use alilcd::protocol::{Csw, CBW_LEN, CBW_SIGNATURE};
use alilcd::transport::{EndpointDir, Gateway, GatewayError, TransportConfig};

/// Fields of a received CBW.
#[derive(Debug, Clone)]
pub struct ParsedCbw {
    pub tag: u32,
    pub transfer_length: u32,
    pub flags: u8,
    pub lun: u8,
    pub cdb: Vec<u8>,
}

pub fn parse_cbw(bytes: &[u8]) -> Option<ParsedCbw> {
    if bytes.len() != CBW_LEN {
        return None;
    }
    let signature = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if signature != CBW_SIGNATURE {
        return None;
    }
    let cdb_len = bytes[14] as usize;
    if cdb_len == 0 || cdb_len > 16 {
        return None;
    }
    Some(ParsedCbw {
        tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        transfer_length: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
        flags: bytes[12],
        lun: bytes[13],
        cdb: bytes[15..15 + cdb_len].to_vec(),
    })
}

/// The CBW a responder is reacting to.
#[derive(Debug, Clone)]
pub struct SeenCbw {
    /// 0-based count of exchanges so far.
    pub index: usize,
    pub tag: u32,
    pub transfer_length: u32,
    pub flags: u8,
    pub cdb: Vec<u8>,
}

/// The CSW the scripted device answers with.
#[derive(Debug, Clone)]
pub struct CswReply {
    /// `None` echoes the CBW tag.
    pub tag: Option<u32>,
    pub status: u8,
    pub residue: u32,
    /// Raw bytes override, for invalid-CSW scripting.
    pub raw: Option<Vec<u8>>,
}

impl CswReply {
    pub fn echo() -> Self {
        CswReply {
            tag: None,
            status: 0,
            residue: 0,
            raw: None,
        }
    }

    pub fn status(status: u8) -> Self {
        CswReply {
            status,
            ..Self::echo()
        }
    }

    pub fn tag(tag: u32) -> Self {
        CswReply {
            tag: Some(tag),
            ..Self::echo()
        }
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        CswReply {
            raw: Some(bytes),
            ..Self::echo()
        }
    }
}

/// What the device does with one whole exchange.
#[derive(Debug, Clone)]
pub struct ExchangePlan {
    pub cbw: Result<(), GatewayError>,
    pub data_out: Result<(), GatewayError>,
    pub data_in: Result<Vec<u8>, GatewayError>,
    pub csw: Result<CswReply, GatewayError>,
    /// Used for the second and later status reads of the same exchange;
    /// `None` repeats `csw`.
    pub csw_retry: Option<Result<CswReply, GatewayError>>,
}

impl ExchangePlan {
    /// Everything succeeds, tag echoed, status 0.
    pub fn ok() -> Self {
        ExchangePlan {
            cbw: Ok(()),
            data_out: Ok(()),
            data_in: Ok(Vec::new()),
            csw: Ok(CswReply::echo()),
            csw_retry: None,
        }
    }

    pub fn status(status: u8) -> Self {
        ExchangePlan {
            csw: Ok(CswReply::status(status)),
            ..Self::ok()
        }
    }

    pub fn with_tag(tag: u32) -> Self {
        ExchangePlan {
            csw: Ok(CswReply::tag(tag)),
            ..Self::ok()
        }
    }
}

/// Everything the transport did to the pipes, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Cbw { tag: u32, opcode: u8 },
    DataOut { len: usize },
    DataInRead { len: usize },
    CswRead { tag: u32 },
    ClearHalt(EndpointDir),
    Reset,
}

struct Pending {
    plan: ExchangePlan,
    tag: u32,
    awaiting_data_out: bool,
    awaiting_data_in: bool,
    status_reads: u32,
}

pub struct MockGateway {
    responder: Box<dyn FnMut(&SeenCbw) -> ExchangePlan + Send>,
    pending: Option<Pending>,
    exchanges: usize,
    events: Arc<Mutex<Vec<Event>>>,
    violations: Arc<Mutex<Vec<String>>>,
    pub present: bool,
}

impl MockGateway {
    pub fn new(responder: impl FnMut(&SeenCbw) -> ExchangePlan + Send + 'static) -> Self {
        MockGateway {
            responder: Box::new(responder),
            pending: None,
            exchanges: 0,
            events: Arc::new(Mutex::new(Vec::new())),
            violations: Arc::new(Mutex::new(Vec::new())),
            present: true,
        }
    }

    /// A device that answers everything with an echoed tag and status 0.
    pub fn echo_ok() -> Self {
        Self::new(|_| ExchangePlan::ok())
    }

    pub fn events(&self) -> Arc<Mutex<Vec<Event>>> {
        Arc::clone(&self.events)
    }

    pub fn violations(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.violations)
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Gateway for MockGateway {
    fn bulk_out(
        &mut self,
        bytes: &[u8],
        _timeout: Duration,
    ) -> Result<usize, GatewayError> {
        if let Some(parsed) = parse_cbw(bytes) {
            if let Some(pending) = &self.pending {
                // A fresh CBW is only a violation if the previous exchange
                // never reached its status phase.
                if pending.status_reads == 0 {
                    self.violations.lock().unwrap().push(format!(
                        "CBW tag {} submitted while tag {} was unresolved",
                        parsed.tag, pending.tag
                    ));
                }
            }
            let seen = SeenCbw {
                index: self.exchanges,
                tag: parsed.tag,
                transfer_length: parsed.transfer_length,
                flags: parsed.flags,
                cdb: parsed.cdb.clone(),
            };
            self.exchanges += 1;
            self.record(Event::Cbw {
                tag: parsed.tag,
                opcode: parsed.cdb[0],
            });
            let plan = (self.responder)(&seen);
            match plan.cbw {
                Ok(()) => {
                    self.pending = Some(Pending {
                        awaiting_data_out: parsed.flags & 0x80 == 0 && parsed.transfer_length > 0,
                        awaiting_data_in: parsed.flags & 0x80 != 0 && parsed.transfer_length > 0,
                        plan,
                        tag: parsed.tag,
                        status_reads: 0,
                    });
                    Ok(bytes.len())
                }
                Err(e) => {
                    self.pending = None;
                    Err(e)
                }
            }
        } else {
            self.record(Event::DataOut { len: bytes.len() });
            let Some(pending) = self.pending.as_mut() else {
                self.violations
                    .lock()
                    .unwrap()
                    .push("data OUT with no exchange pending".into());
                return Err(GatewayError::Timeout);
            };
            pending.awaiting_data_out = false;
            pending.plan.data_out.map(|()| bytes.len())
        }
    }

    fn bulk_in(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, GatewayError> {
        let Some(pending) = self.pending.as_mut() else {
            self.violations
                .lock()
                .unwrap()
                .push("bulk IN with no exchange pending".into());
            return Err(GatewayError::Timeout);
        };
        if pending.awaiting_data_in {
            pending.awaiting_data_in = false;
            self.events
                .lock()
                .unwrap()
                .push(Event::DataInRead { len: max_len });
            return pending.plan.data_in.clone().map(|mut data| {
                data.truncate(max_len);
                data
            });
        }

        pending.status_reads += 1;
        let reply = if pending.status_reads > 1 {
            pending
                .plan
                .csw_retry
                .clone()
                .unwrap_or_else(|| pending.plan.csw.clone())
        } else {
            pending.plan.csw.clone()
        };
        match reply {
            Ok(reply) => {
                let tag = reply.tag.unwrap_or(pending.tag);
                self.events.lock().unwrap().push(Event::CswRead { tag });
                if let Some(raw) = reply.raw {
                    // Leave the exchange pending so a re-read can follow.
                    return Ok(raw);
                }
                self.pending = None;
                Ok(Csw {
                    tag,
                    data_residue: reply.residue,
                    status: reply.status,
                }
                .encode()
                .to_vec())
            }
            Err(e) => {
                if e == GatewayError::Gone {
                    self.pending = None;
                }
                Err(e)
            }
        }
    }

    fn clear_halt(&mut self, ep: EndpointDir) -> Result<(), GatewayError> {
        self.record(Event::ClearHalt(ep));
        Ok(())
    }

    fn reset_device(&mut self) -> Result<(), GatewayError> {
        self.record(Event::Reset);
        self.pending = None;
        Ok(())
    }

    fn is_present(&mut self) -> bool {
        self.present
    }
}

/// Transport configuration scaled down so the lifecycle plays out in
/// milliseconds instead of the firmware's real near-minute cycle.
pub fn fast_config() -> TransportConfig {
    let mut policy = PolicyTable::default();
    for row in [
        &mut policy.animation,
        &mut policy.connecting,
        &mut policy.connected,
        &mut policy.disconnected,
    ] {
        row.pre_delay = Duration::from_millis(1);
        row.post_delay = Duration::ZERO;
        row.backoff_start = Duration::from_millis(1);
    }
    TransportConfig {
        policy,
        lifecycle: LifecycleConfig {
            animation_min_elapsed: Duration::from_millis(100),
            mismatch_rate_ceiling: 0.5,
            connected_after_ok: 3,
            silence_timeout: Duration::from_millis(300),
            disconnected_restart: Duration::from_millis(500),
        },
        timeouts: StageTimeouts::default(),
        keep_alive_interval: Duration::from_millis(20),
        keep_alive_idle: Duration::from_millis(50),
        start_keep_alive: false,
        auto_reconnect: false,
    }
}
