//! # Relay and multiplexing task
//!
//! `rmt_tx` is the one place PDUs leave an IPCP: it resolves the
//! destination address through the forwarding table, detects PDUs that
//! loop back to the IPCP itself and handles lower flow backpressure.
//! Writers that may not sleep park refused PDUs on a bounded per-IPCP
//! deferred queue; a drain task retries them once the flow drains.
#![deny(missing_docs)]
mod pduft;

pub use crate::pduft::Pduft;
use addr::Addr;
use async_std::task;
use channel::{wait_until, Channel, RateLimit, TryWriteError};
use crossbeam::atomic::AtomicCell;
use log::debug;
use pdu::Buf;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on PDUs parked per IPCP waiting for a lower flow to drain.
pub const RMTQ_MAX_LEN: usize = 64;

/// What became of a PDU pushed toward a destination address.
#[derive(Debug)]
pub enum TxOutcome {
    /// Written to a lower flow.
    Sent,
    /// Parked on the deferred queue; the drain task finishes the write.
    Queued,
    /// The destination is this IPCP itself: receive the PDU locally.
    Loopback(Buf),
    /// No forwarding entry and not local; the PDU was dropped.
    NoRoute,
    /// The lower flow rejected the PDU for good, or an overrun dropped it.
    Failed,
}

/// Relay and multiplexing task of one IPCP.
pub struct Rmt {
    pduft: Pduft,
    rmtq: Mutex<VecDeque<(Arc<dyn Channel>, Buf)>>,
    closed: AtomicCell<bool>,
    no_route_rl: RateLimit,
    overrun_rl: RateLimit,
}

impl Rmt {
    /// Creates the task with an empty forwarding table.
    pub fn new() -> Rmt {
        Rmt {
            pduft: Pduft::new(),
            rmtq: Mutex::new(VecDeque::new()),
            closed: AtomicCell::new(false),
            no_route_rl: RateLimit::new(Duration::from_secs(1)),
            overrun_rl: RateLimit::new(Duration::from_secs(1)),
        }
    }

    /// The forwarding table.
    pub fn pduft(&self) -> &Pduft {
        &self.pduft
    }

    /// Pushes a PDU toward `dst_addr` without ever blocking.
    ///
    /// Safe from receive paths and timer callbacks. Backpressure parks the
    /// PDU on the deferred queue; a full queue drops it.
    pub fn tx_nonblocking(&self, local_addr: Addr, dst_addr: Addr, rb: Buf) -> TxOutcome {
        let lower = match self.pduft.lookup(dst_addr) {
            Some(lower) => lower,
            None => {
                if dst_addr == local_addr {
                    // Self flow: hand the PDU back up.
                    return TxOutcome::Loopback(rb);
                }
                if self.no_route_rl.check() {
                    debug!("no route to IPCP {}, dropping PDU", dst_addr);
                }
                return TxOutcome::NoRoute;
            }
        };
        match lower.try_write(rb) {
            Ok(()) => TxOutcome::Sent,
            Err(TryWriteError::Full(rb)) => {
                let mut rmtq = self.rmtq.lock().unwrap();
                if rmtq.len() < RMTQ_MAX_LEN {
                    rmtq.push_back((lower, rb));
                    TxOutcome::Queued
                } else {
                    if self.overrun_rl.check() {
                        debug!("rmtq overrun: dropping PDU");
                    }
                    TxOutcome::Failed
                }
            }
            Err(TryWriteError::Closed(_)) => {
                debug!("lower flow is closed, dropping PDU");
                TxOutcome::Failed
            }
        }
    }

    /// Pushes a PDU toward `dst_addr`.
    ///
    /// With `may_sleep` the call waits on the lower flow's write readiness
    /// instead of using the deferred queue.
    pub async fn tx(&self, local_addr: Addr, dst_addr: Addr, rb: Buf, may_sleep: bool) -> TxOutcome {
        if !may_sleep {
            return self.tx_nonblocking(local_addr, dst_addr, rb);
        }
        let lower = match self.pduft.lookup(dst_addr) {
            Some(lower) => lower,
            None => {
                if dst_addr == local_addr {
                    return TxOutcome::Loopback(rb);
                }
                if self.no_route_rl.check() {
                    debug!("no route to IPCP {}, dropping PDU", dst_addr);
                }
                return TxOutcome::NoRoute;
            }
        };
        let mut rb = rb;
        loop {
            match lower.try_write(rb) {
                Ok(()) => return TxOutcome::Sent,
                Err(TryWriteError::Full(back)) => {
                    rb = back;
                    lower.writable().await;
                }
                Err(TryWriteError::Closed(_)) => {
                    debug!("lower flow is closed, dropping PDU");
                    return TxOutcome::Failed;
                }
            }
        }
    }

    /// Spawns the task draining the deferred queue.
    pub fn start_drain(self: &Arc<Self>) {
        let rmt = self.clone();
        task::spawn(async move {
            rmt.drain().await;
        });
    }

    /// Stops the drain task and refuses further deferred work.
    pub fn shutdown(&self) {
        self.closed.store(true);
        self.rmtq.lock().unwrap().clear();
    }

    /// Depth of the deferred queue.
    pub fn rmtq_len(&self) -> usize {
        self.rmtq.lock().unwrap().len()
    }

    async fn drain(&self) {
        loop {
            let item = self.rmtq.lock().unwrap().pop_front();
            match item {
                Some((lower, mut rb)) => loop {
                    if self.closed.load() {
                        return;
                    }
                    match lower.try_write(rb) {
                        Ok(()) => break,
                        Err(TryWriteError::Full(back)) => {
                            rb = back;
                            lower.writable().await;
                        }
                        Err(TryWriteError::Closed(_)) => {
                            debug!("lower flow is closed, dropping deferred PDU");
                            break;
                        }
                    }
                },
                None => {
                    if self.closed.load() {
                        return;
                    }
                    wait_until(|| {
                        self.closed.load() || !self.rmtq.lock().unwrap().is_empty()
                    })
                    .await;
                }
            }
        }
    }
}

impl Default for Rmt {
    fn default() -> Rmt {
        Rmt::new()
    }
}
