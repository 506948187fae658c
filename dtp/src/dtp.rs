use crate::timer::InactTimer;
use crate::{FlowStats, MAX_RTXQ_LEN, SEQQ_MAX_LEN};
use channel::RateLimit;
use log::debug;
use pdu::Buf;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-flow data transfer state.
///
/// Everything in here is protected by the flow's DTP lock. The lock is a
/// leaf: no method takes another lock or performs I/O, callers get back
/// the buffers they have to dispatch once the lock is gone.
pub(crate) struct Dtp {
    /// The next DT PDU starts a new run.
    pub set_drf: bool,
    pub next_seq_num_to_send: u64,
    pub snd_lwe: u64,
    pub snd_rwe: u64,
    pub last_seq_num_sent: Option<u64>,
    /// Left window edge advertised to the peer.
    pub rcv_lwe: u64,
    /// Contiguous frontier actually delivered upward; never behind rcv_lwe.
    pub rcv_lwe_priv: u64,
    pub rcv_rwe: u64,
    pub max_seq_num_rcvd: Option<u64>,
    pub last_snd_data_ack: u64,
    pub next_snd_ctl_seq: u64,
    pub last_ctrl_seq_num_rcvd: u64,

    /// Closed window queue, filled and drained in seqnum order.
    pub cwq: VecDeque<Buf>,
    pub max_cwq_len: usize,
    /// Retransmission queue, sorted by seqnum ascending.
    pub rtxq: VecDeque<(u64, Buf)>,
    pub max_rtxq_len: usize,
    /// Seqnum of the entry the retransmission timer is armed on.
    pub rtx_tmr_next: Option<u64>,
    /// Deadline the retransmission timer is armed at.
    pub rtx_deadline: Option<Instant>,
    pub rtx_tmr_int: Duration,
    /// Out of order holding queue, sorted by seqnum ascending.
    pub seqq: VecDeque<(u64, Buf)>,

    /// MPL + R + A for this flow.
    pub mpl_r_a: Duration,
    pub snd_inact: InactTimer,
    pub rcv_inact: InactTimer,

    pub stats: FlowStats,
}

impl Dtp {
    pub fn new(initial_credit: u64, max_cwq_len: usize, rtx_tmr_int: Duration, mpl_r_a: Duration) -> Dtp {
        Dtp {
            set_drf: true,
            next_seq_num_to_send: 0,
            snd_lwe: 0,
            snd_rwe: initial_credit,
            last_seq_num_sent: None,
            rcv_lwe: 0,
            rcv_lwe_priv: 0,
            rcv_rwe: initial_credit,
            max_seq_num_rcvd: None,
            last_snd_data_ack: 0,
            next_snd_ctl_seq: 0,
            last_ctrl_seq_num_rcvd: 0,
            cwq: VecDeque::new(),
            max_cwq_len,
            rtxq: VecDeque::new(),
            max_rtxq_len: MAX_RTXQ_LEN,
            rtx_tmr_next: None,
            rtx_deadline: None,
            rtx_tmr_int,
            seqq: VecDeque::new(),
            mpl_r_a,
            snd_inact: InactTimer::default(),
            rcv_inact: InactTimer::default(),
            stats: FlowStats::default(),
        }
    }

    /// Clones `rb` onto the retransmission queue and arms the timer if it
    /// is not armed yet.
    pub fn rtxq_push(&mut self, rb: &Buf, seqnum: u64, now: Instant) {
        let mut crb = rb.clone();
        let deadline = now + self.rtx_tmr_int;
        crb.rtx_deadline = Some(deadline);
        if self.rtx_deadline.is_none() {
            self.rtx_tmr_next = Some(seqnum);
            self.rtx_deadline = Some(deadline);
        }
        self.rtxq.push_back((seqnum, crb));
    }

    /// Files an out of order PDU into the sequencing queue, keeping it
    /// sorted. Exact duplicates and overrun beyond `SEQQ_MAX_LEN` are
    /// dropped.
    pub fn seqq_push(&mut self, seqnum: u64, rb: Buf, rl: &RateLimit) {
        if self.seqq.len() >= SEQQ_MAX_LEN {
            if rl.check() {
                debug!("seqq overrun: dropping PDU [seq={}]", seqnum);
            }
            return;
        }
        let mut pos = self.seqq.len();
        for (i, (s, _)) in self.seqq.iter().enumerate() {
            if seqnum < *s {
                pos = i;
                break;
            }
            if seqnum == *s {
                // Duplicate amongst the gaps.
                if rl.check() {
                    debug!("duplicate amongst the gaps [seq={}] dropped", seqnum);
                }
                return;
            }
        }
        self.seqq.insert(pos, (seqnum, rb));
    }

    /// Pops every queued PDU now within `max_sdu_gap` of the delivery
    /// frontier, advancing the frontier as it goes.
    pub fn seqq_pop_many(&mut self, max_sdu_gap: u64) -> Vec<Buf> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.seqq.len() {
            let seqnum = self.seqq[i].0;
            if seqnum.wrapping_sub(self.rcv_lwe_priv) <= max_sdu_gap {
                if let Some((_, rb)) = self.seqq.remove(i) {
                    self.rcv_lwe_priv = seqnum + 1;
                    out.push(rb);
                }
            } else {
                i += 1;
            }
        }
        out
    }

    /// The retransmission timer fired: scan the queue in ring order from
    /// the armed entry so entries are visited in ascending deadline order,
    /// stage a copy of everything due and push its deadline out, then
    /// re-arm on the first entry that is not due yet.
    pub fn rtx_expired(&mut self, now: Instant) -> Vec<Buf> {
        let mut out = Vec::new();
        let start = match self.rtx_tmr_next {
            Some(start) => start,
            None => return out,
        };
        let len = self.rtxq.len();
        let start_idx = match self.rtxq.iter().position(|(s, _)| *s == start) {
            Some(idx) => idx,
            None => {
                self.rtx_tmr_next = None;
                self.rtx_deadline = None;
                return out;
            }
        };
        let mut rearmed = false;
        for k in 0..len {
            let idx = (start_idx + k) % len;
            let interval = self.rtx_tmr_int;
            let (seqnum, rb) = &mut self.rtxq[idx];
            let deadline = match rb.rtx_deadline {
                Some(deadline) => deadline,
                None => continue,
            };
            if now >= deadline {
                rb.rtx_deadline = Some(deadline + interval);
                let mut crb = rb.clone();
                crb.rtx_deadline = None;
                out.push(crb);
            } else {
                self.rtx_tmr_next = Some(*seqnum);
                self.rtx_deadline = Some(deadline);
                rearmed = true;
                break;
            }
        }
        if !rearmed {
            // Wrapped all the way around: everything was due. Keep the arm
            // on the scan origin, now at its pushed out deadline.
            self.rtx_deadline = self.rtxq[start_idx].1.rtx_deadline;
        }
        out
    }
}
