//! Background keep-alive.
//!
//! Once the firmware has settled out of its animation it expects a
//! steady trickle of traffic; a few seconds of silence and it drops to
//! its "connection lost" screen. This task wakes every few seconds and,
//! if no higher-level command has produced a CSW recently, pushes a
//! TEST UNIT READY through the orchestrator's normal serialization
//! point.
//!
//! The task holds only a weak reference to the transport, so it never
//! extends the handle's lifetime, and a shutdown channel lets `close`
//! cancel and join it deterministically.

use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::{Gateway, Shared};

pub(crate) struct KeepAlive {
    thread: Option<JoinHandle<()>>,
    shutdown: Sender<()>,
}

pub(crate) fn spawn<G: Gateway + 'static>(
    shared: Weak<Shared<G>>,
    interval: Duration,
) -> KeepAlive {
    let (shutdown, rx) = bounded(1);
    let thread = thread::Builder::new()
        .name("alilcd-keepalive".into())
        .spawn(move || run(shared, rx, interval))
        .expect("failed to spawn keep-alive thread");
    KeepAlive {
        thread: Some(thread),
        shutdown,
    }
}

impl KeepAlive {
    /// Cancels the task and joins it. Consumes the handle, so the join
    /// happens exactly once.
    pub(crate) fn stop(mut self) {
        let _ = self.shutdown.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run<G: Gateway>(shared: Weak<Shared<G>>, shutdown: Receiver<()>, interval: Duration) {
    log::debug!("keep-alive task running");
    loop {
        match shutdown.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.should_probe() {
            shared.probe();
        }
    }
    log::debug!("keep-alive task stopped");
}
