//! # Per-flow data transfer protocol machine
//!
//! Each flow owns one [`Flow`] with its DTP state behind a single lock:
//! sequence number assignment, sender and receiver window edges, the
//! closed window queue, the retransmission queue, the sequencing queue
//! and the inactivity deadlines. The DTCP companion (acknowledgements and
//! window updates) lives in the `dtcp` module and operates on the same
//! locked state.
//!
//! The lock is a leaf. Entry points lock, mutate, unlock and hand back
//! the PDUs that now have to travel: the caller owns dispatching them
//! through the relaying machinery. Timer callbacks follow the same shape,
//! so nothing here can deadlock against the receive path.
//!
//! Reliable operation follows the delta-t rules: a new run is announced
//! with the data run flag, gaps are filled by retransmission, duplicates
//! are suppressed by the receive window and every control PDU is
//! processed at most once per control sequence number.
mod dtcp;
mod dtp;
mod timer;

use crate::dtp::Dtp;
use addr::Addr;
use channel::{wait_until, RateLimit};
use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use pdu::{pdu_flags, pdu_type, Buf, ConnId, DtPci, DT_PCI_LEN};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound on PDUs parked in the sequencing queue.
pub const SEQQ_MAX_LEN: usize = 64;
/// Upper bound on clones waiting for acknowledgement. Static for now.
pub const MAX_RTXQ_LEN: usize = 64;
/// Upper bound on undelivered PDUs per flow when the flow itself does not
/// limit the sender through flow control.
pub const RXQ_MAX_LEN: usize = 128;

/// Default retransmission time when the config leaves it unset.
pub const RTX_MSECS_DEFAULT: u64 = 1000;
/// Default maximum number of retransmissions of a PDU.
pub const DATA_RXMS_MAX_DEFAULT: u32 = 10;
/// Default maximum PDU lifetime in the DIF.
pub const MPL_MSECS_DEFAULT: u64 = 10000;

/// Flow configuration, as installed by flow allocation.
#[derive(Clone, Debug, Default)]
pub struct FlowConfig {
    /// Without DTCP the flow only assigns sequence numbers: no windows,
    /// no retransmission, no control traffic.
    pub dtcp_present: bool,
    /// Deliver SDUs in order.
    pub in_order_delivery: bool,
    /// Largest sequence gap the upper layer tolerates; 0 is strict order.
    pub max_sdu_gap: u64,
    /// DTCP parameters, meaningful when `dtcp_present` is set.
    pub dtcp: DtcpConfig,
}

/// DTCP parameters of a flow.
#[derive(Clone, Debug, Default)]
pub struct DtcpConfig {
    /// Window based flow control is in use.
    pub flow_control: bool,
    /// Flow control discipline.
    pub fc: FlowCtrl,
    /// Lost PDUs are repaired by retransmission.
    pub rtx_control: bool,
    /// Retransmission parameters.
    pub rtx: RtxConfig,
    /// Receiver A timer.
    pub initial_a: Duration,
}

/// Flow control discipline of a flow.
#[derive(Clone, Copy, Debug)]
pub enum FlowCtrl {
    /// No flow control.
    None,
    /// Sliding window flow control.
    Window(WindowConfig),
}

impl Default for FlowCtrl {
    fn default() -> Self {
        FlowCtrl::None
    }
}

/// Sliding window parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct WindowConfig {
    /// Credit granted to the peer ahead of the advertised left edge.
    pub initial_credit: u64,
    /// Bound of the closed window queue.
    pub max_cwq_len: usize,
}

/// Retransmission parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct RtxConfig {
    /// Time a PDU may stay unacknowledged before it is retransmitted.
    pub initial_tr: Duration,
    /// Worst case number of retransmissions of a single PDU.
    pub data_rxms_max: u32,
}

/// Per-flow packet and byte counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlowStats {
    /// PDUs admitted by the send path.
    pub tx_pkt: u64,
    /// Payload bytes admitted by the send path.
    pub tx_byte: u64,
    /// Send path failures.
    pub tx_err: u64,
    /// Data PDUs accepted by the receive path.
    pub rx_pkt: u64,
    /// Payload bytes accepted by the receive path.
    pub rx_byte: u64,
    /// Data PDUs dropped by the receive path.
    pub rx_err: u64,
}

/// Outcome of a successful send path admission.
#[derive(Debug)]
pub enum WriteOutcome {
    /// The PDU went through the window; dispatch it.
    Dispatch(Buf),
    /// The PDU is parked in the closed window queue.
    Queued,
}

/// Send path refusal.
#[derive(Debug)]
pub enum WriteError {
    /// Transient backpressure: a queue is at its bound. The buffer comes
    /// back so the caller can retry the same PDU.
    WouldBlock(Buf),
    /// The head reserve cannot take the PCI; the buffer is lost.
    NoSpace,
}

/// One flow of the normal IPCP, with its protocol machine.
pub struct Flow {
    pub(crate) cfg: FlowConfig,
    pub(crate) remote_addr: Addr,
    pub(crate) local_cep: u16,
    pub(crate) remote_cep: u16,
    pub(crate) dtp: Mutex<Dtp>,
    rxq: Mutex<VecDeque<Buf>>,
    upper: AtomicCell<bool>,
    consumed_installed: bool,
    restart_gen: AtomicCell<u64>,
    closed: AtomicCell<bool>,
    pub(crate) drop_rl: RateLimit,
}

impl Flow {
    /// Initialises the protocol machine for a freshly allocated flow.
    ///
    /// Unset retransmission parameters and an unset `mpl` are fixed to
    /// their defaults before `MPL + R + A` is computed.
    pub fn new(cfg: FlowConfig, remote_addr: Addr, local_cep: u16, remote_cep: u16, mpl: Duration) -> Flow {
        let mut cfg = cfg;
        let mut mpl = mpl;
        debug!("flow config: {:?}", cfg);

        if mpl == Duration::from_millis(0) {
            info!("fixing MPL to {} ms", MPL_MSECS_DEFAULT);
            mpl = Duration::from_millis(MPL_MSECS_DEFAULT);
        }
        if cfg.dtcp.rtx_control && cfg.dtcp.rtx.initial_tr == Duration::from_millis(0) {
            info!("fixing initial_tr parameter to {} ms", RTX_MSECS_DEFAULT);
            cfg.dtcp.rtx.initial_tr = Duration::from_millis(RTX_MSECS_DEFAULT);
        }
        if cfg.dtcp.rtx_control && cfg.dtcp.rtx.data_rxms_max == 0 {
            info!("fixing data_rxms_max parameter to {}", DATA_RXMS_MAX_DEFAULT);
            cfg.dtcp.rtx.data_rxms_max = DATA_RXMS_MAX_DEFAULT;
        }

        let r = cfg.dtcp.rtx.initial_tr * cfg.dtcp.rtx.data_rxms_max;
        let mpl_r_a = mpl + r + cfg.dtcp.initial_a;

        let (initial_credit, max_cwq_len) = match cfg.dtcp.fc {
            FlowCtrl::Window(w) => (w.initial_credit, w.max_cwq_len),
            FlowCtrl::None => (0, 0),
        };
        let consumed_installed = cfg.dtcp.rtx_control || cfg.dtcp.flow_control;
        let rtx_tmr_int = cfg.dtcp.rtx.initial_tr;

        Flow {
            cfg,
            remote_addr,
            local_cep,
            remote_cep,
            dtp: Mutex::new(Dtp::new(initial_credit, max_cwq_len, rtx_tmr_int, mpl_r_a)),
            rxq: Mutex::new(VecDeque::new()),
            upper: AtomicCell::new(false),
            consumed_installed,
            restart_gen: AtomicCell::new(0),
            closed: AtomicCell::new(false),
            drop_rl: RateLimit::new(Duration::from_secs(1)),
        }
    }

    /// The flow configuration in effect.
    pub fn config(&self) -> &FlowConfig {
        &self.cfg
    }

    /// Address of the remote end of the flow.
    pub fn remote_addr(&self) -> Addr {
        self.remote_addr
    }

    /// Our connection endpoint id.
    pub fn local_cep(&self) -> u16 {
        self.local_cep
    }

    /// The peer's connection endpoint id.
    pub fn remote_cep(&self) -> u16 {
        self.remote_cep
    }

    /// Marks the flow as used by an upper IPCP. Delivery then advances the
    /// advertised window immediately instead of waiting for the consumer.
    pub fn bind_upper(&self) {
        self.upper.store(true);
    }

    /// True when the consumer has to report finished buffers back through
    /// `sdu_rx_consumed`.
    pub fn consumed_installed(&self) -> bool {
        self.consumed_installed
    }

    /// Send path: admission, PCI stamping and queueing.
    ///
    /// On [`WriteOutcome::Dispatch`] the caller relays the stamped PDU; on
    /// [`WriteOutcome::Queued`] the PDU waits for the window to reopen.
    pub fn write_prepare(&self, src_addr: Addr, mut rb: Buf, now: Instant) -> Result<WriteOutcome, WriteError> {
        let mut dtp = self.dtp.lock().unwrap();

        if self.cfg.dtcp_present {
            if dtp.snd_inact.check_expired(now) {
                debug!("sender inactivity timer expired");
                dtp.set_drf = true;
                // Policy slots: discard the rtx and closed window queues,
                // send a control ack PDU, send a zero length transfer PDU,
                // notify the user of the idle period.
            }
            let deadline = now + dtp.mpl_r_a * 3;
            dtp.snd_inact.rearm(deadline);
        }

        let window_full = match self.cfg.dtcp.fc {
            FlowCtrl::Window(_) => {
                dtp.next_seq_num_to_send > dtp.snd_rwe && dtp.cwq.len() >= dtp.max_cwq_len
            }
            FlowCtrl::None => false,
        };
        let rtxq_full = self.cfg.dtcp.rtx_control && dtp.rtxq.len() >= dtp.max_rtxq_len;
        if window_full || rtxq_full {
            // Backpressure: the PDU is not dropped, the caller retries.
            return Err(WriteError::WouldBlock(rb));
        }

        let sdu_len = rb.len();
        let pci = DtPci {
            dst_addr: self.remote_addr,
            src_addr,
            conn_id: ConnId {
                qos_id: 0,
                dst_cep: self.remote_cep,
                src_cep: self.local_cep,
            },
            pdu_type: pdu_type::DT,
            pdu_flags: if dtp.set_drf { pdu_flags::DRF } else { 0 },
            pdu_len: (sdu_len + DT_PCI_LEN) as u16,
            seqnum: dtp.next_seq_num_to_send,
        };
        if rb.push_pci(&pci).is_err() {
            dtp.stats.tx_err += 1;
            return Err(WriteError::NoSpace);
        }
        dtp.next_seq_num_to_send += 1;

        dtp.stats.tx_pkt += 1;
        dtp.stats.tx_byte += sdu_len as u64;

        dtp.set_drf = false;
        if !self.cfg.dtcp_present {
            dtp.snd_lwe = dtp.next_seq_num_to_send;
            dtp.last_seq_num_sent = Some(pci.seqnum);
            return Ok(WriteOutcome::Dispatch(rb));
        }

        if let FlowCtrl::Window(_) = self.cfg.dtcp.fc {
            if pci.seqnum > dtp.snd_rwe {
                // Not in the sender window: park in the closed window
                // queue. Admission above guarantees there is room.
                debug!("push [{}] into cwq", pci.seqnum);
                dtp.cwq.push_back(rb);
                return Ok(WriteOutcome::Queued);
            }
            dtp.snd_lwe = dtp.next_seq_num_to_send;
            dtp.last_seq_num_sent = Some(pci.seqnum);
        }

        if self.cfg.dtcp.rtx_control {
            dtp.rtxq_push(&rb, pci.seqnum, now);
        }

        Ok(WriteOutcome::Dispatch(rb))
    }

    /// Receive path for data PDUs.
    ///
    /// Delivers in-window PDUs (and whatever they unblock from the
    /// sequencing queue) to the flow's receive queue and returns the
    /// control PDU to send back, if the configuration calls for one.
    pub fn rx_data(&self, src_addr: Addr, pci: DtPci, rb: Buf, now: Instant) -> Option<Buf> {
        let seqnum = pci.seqnum;
        // Without flow control nothing limits the sender, so the receive
        // queue has to protect itself.
        let qlimit = !self.cfg.dtcp.flow_control;
        let sdu_len = rb.len().saturating_sub(DT_PCI_LEN) as u64;

        let mut dtp = self.dtp.lock().unwrap();

        if self.cfg.dtcp_present {
            if dtp.rcv_inact.check_expired(now) {
                debug!("receiver inactivity timer expired");
            }
            let deadline = now + dtp.mpl_r_a * 2;
            dtp.rcv_inact.rearm(deadline);
        }

        if pci.pdu_flags & pdu_flags::DRF != 0 {
            // First PDU or new run: resynchronise the receive window.
            dtp.rcv_lwe = seqnum + 1;
            dtp.rcv_lwe_priv = seqnum + 1;
            dtp.max_seq_num_rcvd = Some(seqnum);
            let crb = dtcp::sv_update(self, &mut dtp, src_addr);
            dtp.stats.rx_pkt += 1;
            dtp.stats.rx_byte += sdu_len;
            drop(dtp);
            self.deliver(rb, qlimit);
            return crb;
        }

        if seqnum < dtp.rcv_lwe_priv {
            // Already delivered once.
            if self.drop_rl.check() {
                debug!("dropping duplicate PDU [seq={}]", seqnum);
            }
            dtp.stats.rx_err += 1;
            drop(rb);

            if self.cfg.dtcp.flow_control && dtp.rcv_lwe >= dtp.last_snd_data_ack {
                let ty = pdu_type::CTRL_MASK | pdu_type::ACK_BIT | pdu_type::ACK | pdu_type::FC_BIT;
                let ack = dtp.rcv_lwe;
                let crb = dtcp::ctrl_pdu(self, &mut dtp, src_addr, ty, ack);
                dtp.last_snd_data_ack = dtp.rcv_lwe;
                return Some(crb);
            }
            return None;
        }

        let next_in_order = dtp.max_seq_num_rcvd.map_or(0, |m| m + 1);
        if seqnum > next_in_order && self.drop_rl.check() {
            debug!("out of order PDU [seq={}], expected [{}]", seqnum, next_in_order);
        }
        if dtp.max_seq_num_rcvd.map_or(true, |m| seqnum > m) {
            dtp.max_seq_num_rcvd = Some(seqnum);
        }

        let gap = seqnum - dtp.rcv_lwe_priv;

        // Gaps can be filled later by out of order arrivals or by
        // retransmissions, so an unreliable flow holds on to everything
        // and a retransmitting flow waits for the repair. Only a flow
        // that can neither repair nor tolerate the gap drops. The A timer
        // is not implemented, it counts as zero here.
        let drop_pdu = (self.cfg.in_order_delivery || self.cfg.dtcp_present)
            && !self.cfg.dtcp.rtx_control
            && gap > self.cfg.max_sdu_gap;
        let deliver = !drop_pdu && gap <= self.cfg.max_sdu_gap;

        if deliver {
            dtp.rcv_lwe_priv = seqnum + 1;
            let popped = dtp.seqq_pop_many(self.cfg.max_sdu_gap);
            let mut crb = None;
            if self.upper.load() {
                dtp.rcv_lwe = dtp.rcv_lwe_priv;
                crb = dtcp::sv_update(self, &mut dtp, src_addr);
            }
            dtp.stats.rx_pkt += 1;
            dtp.stats.rx_byte += sdu_len;
            drop(dtp);

            self.deliver(rb, qlimit);
            for qrb in popped {
                self.deliver(qrb, qlimit);
            }
            return crb;
        }

        if drop_pdu {
            if self.drop_rl.check() {
                debug!("dropping PDU [seq={}] to meet QoS requirements", seqnum);
            }
            dtp.stats.rx_err += 1;
            drop(rb);
        } else {
            // Neither dropped nor deliverable yet: hold it in the
            // sequencing queue.
            dtp.seqq_push(seqnum, rb, &self.drop_rl);
            dtp.stats.rx_pkt += 1;
            dtp.stats.rx_byte += sdu_len;
        }

        dtcp::sv_update(self, &mut dtp, src_addr)
    }

    /// Receive path for control PDUs. Returns the data PDUs freed from the
    /// closed window queue, ready for dispatch.
    pub fn rx_ctrl(&self, rb: Buf, now: Instant) -> Vec<Buf> {
        dtcp::rx_ctrl(self, rb, now)
    }

    /// The retransmission timer fired: returns the copies to retransmit.
    pub fn rtx_expired(&self, now: Instant) -> Vec<Buf> {
        self.dtp.lock().unwrap().rtx_expired(now)
    }

    /// Deadline the retransmission timer is currently armed at.
    pub fn next_rtx_deadline(&self) -> Option<Instant> {
        self.dtp.lock().unwrap().rtx_deadline
    }

    /// Effective retransmission interval.
    pub fn rtx_interval(&self) -> Duration {
        self.dtp.lock().unwrap().rtx_tmr_int
    }

    /// The consumer is done with a delivered buffer: advance the
    /// advertised window past it and report the new state to the peer.
    pub fn consumed(&self, rb: &Buf, src_addr: Addr) -> Option<Buf> {
        let pci = rb.popped_pci()?;
        let mut dtp = self.dtp.lock().unwrap();
        dtp.rcv_lwe = pci.seqnum + 1;
        dtcp::sv_update(self, &mut dtp, src_addr)
    }

    /// Takes the next delivered SDU if there is one.
    pub fn try_recv(&self) -> Option<Buf> {
        self.rxq.lock().unwrap().pop_front()
    }

    /// Waits for the next delivered SDU; `None` once the flow is closed.
    pub async fn recv(&self) -> Option<Buf> {
        loop {
            if let Some(rb) = self.try_recv() {
                return Some(rb);
            }
            if self.closed.load() {
                return None;
            }
            wait_until(|| !self.rxq.lock().unwrap().is_empty() || self.closed.load()).await;
        }
    }

    /// Wakes senders blocked on backpressure.
    pub(crate) fn write_restart(&self) {
        self.restart_gen.fetch_add(1);
    }

    /// Generation counter of the write-restart signal; it moves every time
    /// blocked senders are woken.
    pub fn restart_generation(&self) -> u64 {
        self.restart_gen.load()
    }

    /// True once the flow has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load()
    }

    /// Tears the protocol machine down: cancels the three timers and
    /// drains all four queues. Blocked senders and receivers wake up and
    /// observe the closed flow.
    pub fn close(&self) {
        self.closed.store(true);
        {
            let mut dtp = self.dtp.lock().unwrap();
            dtp.snd_inact.cancel();
            dtp.rcv_inact.cancel();
            dtp.rtx_tmr_next = None;
            dtp.rtx_deadline = None;
            dtp.cwq.clear();
            dtp.rtxq.clear();
            dtp.seqq.clear();
        }
        self.rxq.lock().unwrap().clear();
        self.write_restart();
    }

    /// Snapshot of the flow counters.
    pub fn stats(&self) -> FlowStats {
        self.dtp.lock().unwrap().stats
    }

    /// Closed window queue depth.
    pub fn cwq_len(&self) -> usize {
        self.dtp.lock().unwrap().cwq.len()
    }

    /// Retransmission queue depth.
    pub fn rtxq_len(&self) -> usize {
        self.dtp.lock().unwrap().rtxq.len()
    }

    /// Sequencing queue depth.
    pub fn seqq_len(&self) -> usize {
        self.dtp.lock().unwrap().seqq.len()
    }

    /// Undelivered SDUs queued for the consumer.
    pub fn rxq_len(&self) -> usize {
        self.rxq.lock().unwrap().len()
    }

    fn deliver(&self, mut rb: Buf, qlimit: bool) {
        if rb.pop_pci().is_err() {
            return;
        }
        let mut rxq = self.rxq.lock().unwrap();
        if qlimit && rxq.len() >= RXQ_MAX_LEN {
            if self.drop_rl.check() {
                debug!("receive queue overrun, dropping PDU");
            }
            return;
        }
        rxq.push_back(rb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;
    use pdu::{CtrlPci, CTRL_PCI_LEN};

    const LOCAL: u64 = 1;
    const REMOTE: u64 = 2;
    const MPL: Duration = Duration::from_secs(10);

    fn flow(cfg: FlowConfig) -> Flow {
        Flow::new(cfg, REMOTE.into(), 10, 20, MPL)
    }

    fn plain() -> FlowConfig {
        FlowConfig::default()
    }

    fn rtx_cfg() -> FlowConfig {
        FlowConfig {
            dtcp_present: true,
            dtcp: DtcpConfig {
                rtx_control: true,
                rtx: RtxConfig {
                    initial_tr: Duration::from_millis(100),
                    data_rxms_max: 10,
                },
                ..DtcpConfig::default()
            },
            ..FlowConfig::default()
        }
    }

    fn window_cfg(initial_credit: u64, max_cwq_len: usize) -> FlowConfig {
        FlowConfig {
            dtcp_present: true,
            dtcp: DtcpConfig {
                flow_control: true,
                fc: FlowCtrl::Window(WindowConfig {
                    initial_credit,
                    max_cwq_len,
                }),
                ..DtcpConfig::default()
            },
            ..FlowConfig::default()
        }
    }

    fn full_cfg(initial_credit: u64, max_cwq_len: usize) -> FlowConfig {
        let mut cfg = window_cfg(initial_credit, max_cwq_len);
        cfg.dtcp.rtx_control = true;
        cfg.dtcp.rtx = RtxConfig {
            initial_tr: Duration::from_millis(100),
            data_rxms_max: 10,
        };
        cfg
    }

    fn write(fl: &Flow, payload: &[u8], now: Instant) -> Result<WriteOutcome, WriteError> {
        fl.write_prepare(LOCAL.into(), Buf::data(payload), now)
    }

    fn seq_of(rb: &Buf) -> u64 {
        rb.dt_pci().unwrap().seqnum
    }

    fn dt_pdu(seqnum: u64, drf: bool, payload: &[u8]) -> (DtPci, Buf) {
        let mut rb = Buf::data(payload);
        let pci = DtPci {
            dst_addr: LOCAL.into(),
            src_addr: REMOTE.into(),
            conn_id: ConnId {
                qos_id: 0,
                dst_cep: 10,
                src_cep: 20,
            },
            pdu_type: pdu_type::DT,
            pdu_flags: if drf { pdu_flags::DRF } else { 0 },
            pdu_len: (payload.len() + DT_PCI_LEN) as u16,
            seqnum,
        };
        rb.push_pci(&pci).unwrap();
        (pci, rb)
    }

    fn rx(fl: &Flow, seqnum: u64, payload: &[u8]) -> Option<Buf> {
        let (pci, rb) = dt_pdu(seqnum, false, payload);
        fl.rx_data(LOCAL.into(), pci, rb, Instant::now())
    }

    fn fc_ctrl(seqnum: u64, new_rwe: u64) -> Buf {
        Buf::ctrl(&CtrlPci {
            base: DtPci {
                pdu_type: pdu_type::CTRL_MASK | pdu_type::FC_BIT,
                pdu_len: CTRL_PCI_LEN as u16,
                seqnum,
                ..DtPci::default()
            },
            new_rwe,
            ..CtrlPci::default()
        })
    }

    fn ack_ctrl(seqnum: u64, ack_nack_seq_num: u64, subtype: u8) -> Buf {
        Buf::ctrl(&CtrlPci {
            base: DtPci {
                pdu_type: pdu_type::CTRL_MASK | pdu_type::ACK_BIT | subtype,
                pdu_len: CTRL_PCI_LEN as u16,
                seqnum,
                ..DtPci::default()
            },
            ack_nack_seq_num,
            ..CtrlPci::default()
        })
    }

    fn assert_rtxq_sorted(fl: &Flow) {
        let dtp = fl.dtp.lock().unwrap();
        let seqs: Vec<u64> = dtp.rtxq.iter().map(|(s, _)| *s).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(seqs, sorted, "rtxq must be strictly sorted");
    }

    #[test]
    fn test_write_plain_flow() {
        let fl = flow(plain());
        let now = Instant::now();
        let mut seqs = Vec::new();
        for payload in &[&b"one"[..], b"two", b"three"] {
            match write(&fl, payload, now).unwrap() {
                WriteOutcome::Dispatch(rb) => {
                    let pci = rb.dt_pci().unwrap();
                    assert_eq!(pci.pdu_type, pdu_type::DT);
                    assert_eq!(pci.dst_addr, REMOTE.into());
                    assert_eq!(pci.conn_id.dst_cep, 20);
                    seqs.push(pci.seqnum);
                }
                WriteOutcome::Queued => panic!("no window, nothing may queue"),
            }
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(fl.rtxq_len(), 0);
        assert_eq!(fl.cwq_len(), 0);

        let stats = fl.stats();
        assert_eq!(stats.tx_pkt, 3);
        assert_eq!(stats.tx_byte, 11);

        let dtp = fl.dtp.lock().unwrap();
        assert_eq!(dtp.snd_lwe, 3);
        assert_eq!(dtp.last_seq_num_sent, Some(2));
    }

    #[test]
    fn test_write_sets_drf_on_first_pdu_only() {
        let fl = flow(rtx_cfg());
        let now = Instant::now();
        match write(&fl, b"a", now).unwrap() {
            WriteOutcome::Dispatch(rb) => {
                assert_eq!(rb.dt_pci().unwrap().pdu_flags & pdu_flags::DRF, pdu_flags::DRF)
            }
            WriteOutcome::Queued => panic!(),
        }
        match write(&fl, b"b", now).unwrap() {
            WriteOutcome::Dispatch(rb) => {
                assert_eq!(rb.dt_pci().unwrap().pdu_flags & pdu_flags::DRF, 0)
            }
            WriteOutcome::Queued => panic!(),
        }
    }

    #[test]
    fn test_sender_inactivity_rearms_drf() {
        let fl = flow(rtx_cfg());
        let t0 = Instant::now();
        write(&fl, b"a", t0).unwrap();
        match write(&fl, b"b", t0 + Duration::from_millis(1)).unwrap() {
            WriteOutcome::Dispatch(rb) => {
                assert_eq!(rb.dt_pci().unwrap().pdu_flags & pdu_flags::DRF, 0)
            }
            WriteOutcome::Queued => panic!(),
        }
        // MPL 10s, R 1s, A 0: the sender timer runs at 3 * 11s.
        let idle = t0 + Duration::from_secs(34);
        match write(&fl, b"c", idle).unwrap() {
            WriteOutcome::Dispatch(rb) => {
                assert_eq!(rb.dt_pci().unwrap().pdu_flags & pdu_flags::DRF, pdu_flags::DRF)
            }
            WriteOutcome::Queued => panic!(),
        }
    }

    #[test]
    fn test_window_close_and_reopen() {
        let fl = flow(full_cfg(2, 4));
        let now = Instant::now();
        let mut dispatched = Vec::new();
        let mut queued = 0;
        for payload in &[&b"a"[..], b"b", b"c", b"d", b"e"] {
            match write(&fl, payload, now).unwrap() {
                WriteOutcome::Dispatch(rb) => dispatched.push(seq_of(&rb)),
                WriteOutcome::Queued => queued += 1,
            }
        }
        // snd_rwe starts at the initial credit; seqnums beyond it park.
        assert_eq!(dispatched, vec![0, 1, 2]);
        assert_eq!(queued, 2);
        assert_eq!(fl.cwq_len(), 2);
        assert_eq!(fl.rtxq_len(), 3);

        let gen = fl.restart_generation();
        let freed = fl.rx_ctrl(fc_ctrl(1, 5), now);
        let freed_seqs: Vec<u64> = freed.iter().map(seq_of).collect();
        assert_eq!(freed_seqs, vec![3, 4]);
        assert_eq!(fl.cwq_len(), 0);
        assert_eq!(fl.rtxq_len(), 5);
        assert_rtxq_sorted(&fl);
        assert!(fl.restart_generation() > gen);

        let dtp = fl.dtp.lock().unwrap();
        assert_eq!(dtp.snd_lwe, 5);
        assert_eq!(dtp.last_seq_num_sent, Some(4));
    }

    #[test]
    fn test_window_backpressure() {
        let fl = flow(window_cfg(2, 2));
        let now = Instant::now();
        for _ in 0..5 {
            write(&fl, b"x", now).unwrap();
        }
        assert_eq!(fl.cwq_len(), 2);
        match write(&fl, b"stuck", now) {
            Err(WriteError::WouldBlock(rb)) => assert_eq!(rb.payload(), b"stuck"),
            other => panic!("expected WouldBlock, got {:?}", other),
        }
        // The refused PDU consumed no sequence number and no counters.
        assert_eq!(fl.stats().tx_pkt, 5);
    }

    #[test]
    fn test_rtxq_backpressure() {
        let fl = flow(rtx_cfg());
        let now = Instant::now();
        for _ in 0..MAX_RTXQ_LEN {
            match write(&fl, b"x", now).unwrap() {
                WriteOutcome::Dispatch(_) => {}
                WriteOutcome::Queued => panic!(),
            }
        }
        assert_eq!(fl.rtxq_len(), MAX_RTXQ_LEN);
        match write(&fl, b"x", now) {
            Err(WriteError::WouldBlock(_)) => {}
            other => panic!("expected WouldBlock, got {:?}", other),
        }
    }

    #[test]
    fn test_no_space_counts_tx_err() {
        let fl = flow(plain());
        let rb = Buf::with_reserve(0, b"payload");
        match fl.write_prepare(LOCAL.into(), rb, Instant::now()) {
            Err(WriteError::NoSpace) => {}
            other => panic!("expected NoSpace, got {:?}", other),
        }
        assert_eq!(fl.stats().tx_err, 1);
        assert_eq!(fl.stats().tx_pkt, 0);
    }

    #[test]
    fn test_ack_trims_rtxq() {
        let fl = flow(rtx_cfg());
        let now = Instant::now();
        for payload in &[&b"a"[..], b"b", b"c"] {
            write(&fl, payload, now).unwrap();
        }
        assert_eq!(fl.rtxq_len(), 3);

        fl.rx_ctrl(ack_ctrl(1, 1, pdu_type::ACK), now);
        assert_eq!(fl.rtxq_len(), 1);
        assert_rtxq_sorted(&fl);
        assert!(fl.next_rtx_deadline().is_some());
        {
            let dtp = fl.dtp.lock().unwrap();
            assert_eq!(dtp.rtxq.front().map(|(s, _)| *s), Some(2));
            assert_eq!(dtp.rtx_tmr_next, Some(2));
        }

        fl.rx_ctrl(ack_ctrl(2, 5, pdu_type::ACK), now);
        assert_eq!(fl.rtxq_len(), 0);
        assert!(fl.next_rtx_deadline().is_none());
    }

    #[test]
    fn test_duplicate_ctrl_is_noop() {
        let fl = flow(full_cfg(1, 4));
        let now = Instant::now();
        for _ in 0..4 {
            write(&fl, b"x", now).unwrap();
        }
        // Credit 1: seqnums 0 and 1 dispatched, 2 and 3 parked.
        assert_eq!(fl.cwq_len(), 2);

        let freed = fl.rx_ctrl(fc_ctrl(1, 3), now);
        assert_eq!(freed.len(), 1);
        assert_eq!(fl.cwq_len(), 1);

        // Same control seqnum again: dropped as a duplicate.
        let freed = fl.rx_ctrl(fc_ctrl(1, 3), now);
        assert!(freed.is_empty());
        assert_eq!(fl.cwq_len(), 1);
        assert_eq!(fl.dtp.lock().unwrap().snd_rwe, 3);
    }

    #[test]
    fn test_ctrl_gap_is_accepted() {
        let fl = flow(window_cfg(1, 4));
        let now = Instant::now();
        let _ = fl.rx_ctrl(fc_ctrl(5, 7), now);
        let dtp = fl.dtp.lock().unwrap();
        assert_eq!(dtp.last_ctrl_seq_num_rcvd, 5);
        assert_eq!(dtp.snd_rwe, 7);
    }

    #[test]
    fn test_broken_peer_window_regression_ignored() {
        let fl = flow(window_cfg(2, 4));
        let now = Instant::now();
        let _ = fl.rx_ctrl(fc_ctrl(1, 1), now);
        assert_eq!(fl.dtp.lock().unwrap().snd_rwe, 2);
    }

    #[test]
    fn test_nack_subtypes_ignored() {
        let fl = flow(rtx_cfg());
        let now = Instant::now();
        write(&fl, b"x", now).unwrap();
        assert_eq!(fl.rtxq_len(), 1);
        for subtype in &[pdu_type::NACK, pdu_type::SACK, pdu_type::SNACK] {
            fl.rx_ctrl(ack_ctrl(1 + u64::from(*subtype), 0, *subtype), now);
        }
        assert_eq!(fl.rtxq_len(), 1);
    }

    #[test]
    fn test_rx_in_order() {
        let fl = flow(plain());
        assert!(rx(&fl, 0, b"a").is_none());
        assert!(rx(&fl, 1, b"b").is_none());
        assert!(rx(&fl, 2, b"c").is_none());

        assert_eq!(fl.rxq_len(), 3);
        assert_eq!(fl.try_recv().unwrap().payload(), b"a");
        assert_eq!(fl.try_recv().unwrap().payload(), b"b");
        assert_eq!(fl.try_recv().unwrap().payload(), b"c");

        let stats = fl.stats();
        assert_eq!(stats.rx_pkt, 3);
        assert_eq!(stats.rx_byte, 3);
        assert_eq!(stats.rx_err, 0);
        assert_eq!(fl.dtp.lock().unwrap().rcv_lwe_priv, 3);
    }

    #[test]
    fn test_rx_drf_restarts_run() {
        let fl = flow(plain());
        rx(&fl, 0, b"a");
        let (pci, rb) = dt_pdu(7, true, b"restart");
        assert!(fl.rx_data(LOCAL.into(), pci, rb, Instant::now()).is_none());
        {
            let dtp = fl.dtp.lock().unwrap();
            assert_eq!(dtp.rcv_lwe_priv, 8);
            assert_eq!(dtp.max_seq_num_rcvd, Some(7));
        }
        rx(&fl, 8, b"next");
        assert_eq!(fl.rxq_len(), 3);
    }

    #[test]
    fn test_rx_gap_fill() {
        let fl = flow(rtx_cfg());
        fl.bind_upper();

        let crb = rx(&fl, 0, b"a").unwrap();
        assert_eq!(crb.ctrl_pci().unwrap().ack_nack_seq_num, 0);
        assert_eq!(fl.rxq_len(), 1);

        // Seqnum 1 is missing: 2 goes to the sequencing queue.
        let crb = rx(&fl, 2, b"c").unwrap();
        assert_eq!(crb.ctrl_pci().unwrap().ack_nack_seq_num, 0);
        assert_eq!(fl.seqq_len(), 1);
        assert_eq!(fl.rxq_len(), 1);

        // The repair delivers both held PDUs.
        let crb = rx(&fl, 1, b"b").unwrap();
        let pcic = crb.ctrl_pci().unwrap();
        assert_eq!(pcic.ack_nack_seq_num, 2);
        assert_eq!(pcic.base.pdu_type & pdu_type::ACK_BIT, pdu_type::ACK_BIT);
        assert_eq!(fl.seqq_len(), 0);
        assert_eq!(fl.rxq_len(), 3);
        assert_eq!(fl.dtp.lock().unwrap().rcv_lwe_priv, 3);

        let payloads: Vec<Vec<u8>> = (0..3).map(|_| fl.try_recv().unwrap().payload().to_vec()).collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_rx_duplicate() {
        let fl = flow(full_cfg(4, 4));
        fl.bind_upper();
        rx(&fl, 0, b"a");
        rx(&fl, 1, b"b");
        assert_eq!(fl.stats().rx_err, 0);

        let crb = rx(&fl, 0, b"a").expect("duplicate must trigger an ack");
        let pcic = crb.ctrl_pci().unwrap();
        assert_eq!(pcic.base.pdu_type & pdu_type::FC_BIT, pdu_type::FC_BIT);
        assert_eq!(pcic.base.pdu_type & pdu_type::ACK_BIT, pdu_type::ACK_BIT);
        // The duplicate path acks the advertised left edge itself.
        assert_eq!(pcic.ack_nack_seq_num, 2);
        assert_eq!(fl.stats().rx_err, 1);
        assert_eq!(fl.dtp.lock().unwrap().last_snd_data_ack, 2);
        assert_eq!(fl.rxq_len(), 2);
    }

    #[test]
    fn test_rx_drop_rule() {
        let mut cfg = plain();
        cfg.in_order_delivery = true;
        let fl = flow(cfg);
        rx(&fl, 0, b"a");
        // No DTCP, no retransmission, A == 0: the gap cannot be repaired.
        rx(&fl, 2, b"c");
        assert_eq!(fl.rxq_len(), 1);
        assert_eq!(fl.seqq_len(), 0);
        assert_eq!(fl.stats().rx_err, 1);
    }

    #[test]
    fn test_rx_unreliable_holds_out_of_order() {
        let fl = flow(plain());
        rx(&fl, 2, b"c");
        assert_eq!(fl.seqq_len(), 1);
        assert_eq!(fl.rxq_len(), 0);

        rx(&fl, 0, b"a");
        assert_eq!(fl.rxq_len(), 1);
        assert_eq!(fl.seqq_len(), 1);

        rx(&fl, 1, b"b");
        assert_eq!(fl.rxq_len(), 3);
        assert_eq!(fl.seqq_len(), 0);
    }

    #[test]
    fn test_seqq_duplicate_among_gaps() {
        let fl = flow(rtx_cfg());
        rx(&fl, 2, b"c");
        rx(&fl, 2, b"c");
        assert_eq!(fl.seqq_len(), 1);
    }

    #[test]
    fn test_seqq_overrun() {
        let fl = flow(rtx_cfg());
        for seqnum in 1..=(SEQQ_MAX_LEN as u64) {
            rx(&fl, seqnum, b"x");
        }
        assert_eq!(fl.seqq_len(), SEQQ_MAX_LEN);
        rx(&fl, SEQQ_MAX_LEN as u64 + 2, b"x");
        assert_eq!(fl.seqq_len(), SEQQ_MAX_LEN);
    }

    #[test]
    fn test_seqq_invariant() {
        let fl = flow(rtx_cfg());
        for seqnum in &[9u64, 3, 7, 5, 3] {
            rx(&fl, *seqnum, b"x");
        }
        let dtp = fl.dtp.lock().unwrap();
        let seqs: Vec<u64> = dtp.seqq.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![3, 5, 7, 9]);
        for s in seqs {
            assert!(s > dtp.rcv_lwe_priv);
            assert!(Some(s) <= dtp.max_seq_num_rcvd);
        }
    }

    #[test]
    fn test_rtx_timer_fires_and_cancels() {
        let fl = flow(rtx_cfg());
        let t0 = Instant::now();
        write(&fl, b"a", t0).unwrap();
        let armed = fl.next_rtx_deadline().unwrap();
        assert_eq!(armed, t0 + Duration::from_millis(100));

        // Not due yet.
        assert!(fl.rtx_expired(t0 + Duration::from_millis(50)).is_empty());

        let copies = fl.rtx_expired(t0 + Duration::from_millis(150));
        assert_eq!(copies.len(), 1);
        assert_eq!(seq_of(&copies[0]), 0);
        assert_eq!(
            fl.next_rtx_deadline().unwrap(),
            t0 + Duration::from_millis(200)
        );

        fl.rx_ctrl(ack_ctrl(1, 0, pdu_type::ACK), t0 + Duration::from_millis(160));
        assert_eq!(fl.rtxq_len(), 0);
        assert!(fl.next_rtx_deadline().is_none());
    }

    #[test]
    fn test_rtx_ring_scan_order() {
        let fl = flow(rtx_cfg());
        let t0 = Instant::now();
        for payload in &[&b"a"[..], b"b", b"c"] {
            write(&fl, payload, t0).unwrap();
        }
        let copies = fl.rtx_expired(t0 + Duration::from_millis(150));
        let seqs: Vec<u64> = copies.iter().map(seq_of).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        // Everything was due: the timer stays armed on the scan origin.
        assert_eq!(
            fl.next_rtx_deadline().unwrap(),
            t0 + Duration::from_millis(200)
        );

        // Partial expiry: ack 0, make 1 due but not 2.
        fl.rx_ctrl(ack_ctrl(1, 0, pdu_type::ACK), t0);
        {
            let mut dtp = fl.dtp.lock().unwrap();
            dtp.rtxq[1].1.rtx_deadline = Some(t0 + Duration::from_millis(400));
        }
        let copies = fl.rtx_expired(t0 + Duration::from_millis(250));
        let seqs: Vec<u64> = copies.iter().map(seq_of).collect();
        assert_eq!(seqs, vec![1]);
        assert_eq!(
            fl.next_rtx_deadline().unwrap(),
            t0 + Duration::from_millis(400)
        );
        let dtp = fl.dtp.lock().unwrap();
        assert_eq!(dtp.rtx_tmr_next, Some(2));
    }

    #[test]
    fn test_consumed_advances_window() {
        let fl = flow(window_cfg(4, 4));
        assert!(fl.consumed_installed());
        // Without an upper IPCP bound, delivery does not advertise.
        assert!(rx(&fl, 0, b"a").is_none());
        assert_eq!(fl.dtp.lock().unwrap().rcv_lwe, 0);

        let rb = fl.try_recv().unwrap();
        assert_eq!(rb.popped_pci().unwrap().seqnum, 0);

        let crb = fl.consumed(&rb, LOCAL.into()).unwrap();
        let pcic = crb.ctrl_pci().unwrap();
        assert_eq!(pcic.base.pdu_type, pdu_type::CTRL_MASK | pdu_type::FC_BIT);
        assert_eq!(pcic.new_lwe, 1);
        assert_eq!(pcic.new_rwe, 5);
        assert_eq!(fl.dtp.lock().unwrap().rcv_lwe, 1);
    }

    #[test]
    fn test_sv_update_idempotent() {
        let fl = flow(window_cfg(4, 4));
        rx(&fl, 0, b"a");
        let rb = fl.try_recv().unwrap();

        let first = fl.consumed(&rb, LOCAL.into()).unwrap().ctrl_pci().unwrap();
        let second = fl.consumed(&rb, LOCAL.into()).unwrap().ctrl_pci().unwrap();
        assert_eq!(second.base.seqnum, first.base.seqnum + 1);
        assert_eq!(second.new_lwe, first.new_lwe);
        assert_eq!(second.new_rwe, first.new_rwe);
        assert_eq!(second.my_lwe, first.my_lwe);
        assert_eq!(second.my_rwe, first.my_rwe);
    }

    #[test]
    fn test_window_invariants_monotonic() {
        let fl = flow(full_cfg(4, 4));
        fl.bind_upper();
        let mut last_lwe = 0;
        let mut last_priv = 0;
        for seqnum in &[0u64, 2, 1, 3, 1, 4] {
            rx(&fl, *seqnum, b"x");
            let dtp = fl.dtp.lock().unwrap();
            assert!(dtp.rcv_lwe_priv >= dtp.rcv_lwe);
            assert!(dtp.rcv_lwe >= last_lwe);
            assert!(dtp.rcv_lwe_priv >= last_priv);
            last_lwe = dtp.rcv_lwe;
            last_priv = dtp.rcv_lwe_priv;
        }
        assert_eq!(last_priv, 5);
    }

    #[test]
    fn test_rxq_limit_without_flow_control() {
        let fl = flow(plain());
        for seqnum in 0..(RXQ_MAX_LEN as u64 + 8) {
            rx(&fl, seqnum, b"x");
        }
        assert_eq!(fl.rxq_len(), RXQ_MAX_LEN);
    }

    #[test]
    fn test_recv_and_close() {
        task::block_on(async {
            let fl = flow(plain());
            rx(&fl, 0, b"hello");
            let rb = fl.recv().await.unwrap();
            assert_eq!(rb.payload(), b"hello");

            fl.close();
            assert!(fl.recv().await.is_none());
        });
    }

    #[test]
    fn test_close_drains_queues() {
        let fl = flow(full_cfg(1, 8));
        let now = Instant::now();
        for _ in 0..5 {
            write(&fl, b"x", now).unwrap();
        }
        rx(&fl, 7, b"held");
        assert!(fl.cwq_len() > 0);
        assert!(fl.rtxq_len() > 0);
        assert_eq!(fl.seqq_len(), 1);

        fl.close();
        assert!(fl.is_closed());
        assert_eq!(fl.cwq_len(), 0);
        assert_eq!(fl.rtxq_len(), 0);
        assert_eq!(fl.seqq_len(), 0);
        assert!(fl.next_rtx_deadline().is_none());
    }

    #[test]
    fn test_defaults_applied() {
        let cfg = FlowConfig {
            dtcp_present: true,
            dtcp: DtcpConfig {
                rtx_control: true,
                ..DtcpConfig::default()
            },
            ..FlowConfig::default()
        };
        let fl = Flow::new(cfg, REMOTE.into(), 10, 20, Duration::from_millis(0));
        assert_eq!(fl.rtx_interval(), Duration::from_millis(RTX_MSECS_DEFAULT));
    }
}
