//! Control plane of the flow: acknowledgements and window updates.
//!
//! Control PDUs mutate the same locked state as the data path, so the
//! functions here take the flow and its guarded state together.
use crate::dtp::Dtp;
use crate::{Flow, FlowCtrl};
use addr::Addr;
use log::{debug, info, warn};
use pdu::{pdu_type, Buf, ConnId, CtrlPci, DtPci, CTRL_PCI_LEN};
use std::time::Instant;

/// Builds a control PDU advertising the current window state.
///
/// Must be called under the DTP lock, after `rcv_lwe` has been updated.
pub(crate) fn ctrl_pdu(flow: &Flow, dtp: &mut Dtp, src_addr: Addr, ty: u8, ack_nack_seq_num: u64) -> Buf {
    let seqnum = dtp.next_snd_ctl_seq;
    dtp.next_snd_ctl_seq += 1;
    Buf::ctrl(&CtrlPci {
        base: DtPci {
            dst_addr: flow.remote_addr,
            src_addr,
            conn_id: ConnId {
                qos_id: 0,
                dst_cep: flow.remote_cep,
                src_cep: flow.local_cep,
            },
            pdu_type: ty,
            pdu_flags: 0,
            pdu_len: CTRL_PCI_LEN as u16,
            seqnum,
        },
        last_ctrl_seq_num_rcvd: dtp.last_ctrl_seq_num_rcvd,
        ack_nack_seq_num,
        new_rwe: dtp.rcv_rwe,
        new_lwe: dtp.rcv_lwe,
        my_rwe: dtp.snd_rwe,
        my_lwe: dtp.snd_lwe,
    })
}

/// Receiver state-vector update: refreshes the advertised credit and
/// synthesizes the acknowledgement or flow control PDU the configuration
/// calls for, if any.
pub(crate) fn sv_update(flow: &Flow, dtp: &mut Dtp, src_addr: Addr) -> Option<Buf> {
    let cfg = &flow.cfg.dtcp;

    if cfg.flow_control {
        if let FlowCtrl::Window(w) = cfg.fc {
            // The right edge follows the advertised left edge at a fixed
            // credit; a buffer aware policy would look at how much the
            // receiver can actually hold.
            dtp.rcv_rwe = dtp.rcv_lwe + w.initial_credit;
        }
    }

    let mut ty = 0u8;
    let mut ack_nack_seq_num = 0u64;
    if cfg.rtx_control {
        // rcv_lwe is one past the last in order PDU; before the first run
        // of the flow starts this wraps.
        ack_nack_seq_num = dtp.rcv_lwe.wrapping_sub(1);
        ty = pdu_type::CTRL_MASK | pdu_type::ACK_BIT | pdu_type::ACK;
        if cfg.flow_control {
            ty |= pdu_type::FC_BIT;
        }
    } else if cfg.flow_control {
        // Flow control only control PDU.
        ty = pdu_type::CTRL_MASK | pdu_type::FC_BIT;
    }

    if ty != 0 {
        return Some(ctrl_pdu(flow, dtp, src_addr, ty, ack_nack_seq_num));
    }
    None
}

/// Handles an incoming control PDU.
///
/// Returns the PDUs freed from the closed window queue; the caller
/// dispatches them after the lock is gone. Blocked writers are always
/// signalled, whether or not the window moved.
pub(crate) fn rx_ctrl(flow: &Flow, rb: Buf, now: Instant) -> Vec<Buf> {
    let pcic = match rb.ctrl_pci() {
        Ok(pcic) => pcic,
        Err(_) => {
            warn!("malformed control PDU, dropping");
            return Vec::new();
        }
    };
    if pcic.base.pdu_type & pdu_type::CTRL_MASK != pdu_type::CTRL_MASK {
        warn!("unknown PDU type {:#04x}", pcic.base.pdu_type);
        return Vec::new();
    }

    let mut dispatch = Vec::new();
    {
        let mut dtp = flow.dtp.lock().unwrap();

        if pcic.base.seqnum > dtp.last_ctrl_seq_num_rcvd + 1 {
            // Gap in the control sequence space.
            debug!(
                "lost control PDUs: [{}] --> [{}]",
                dtp.last_ctrl_seq_num_rcvd, pcic.base.seqnum
            );
        } else if dtp.last_ctrl_seq_num_rcvd != 0 && pcic.base.seqnum <= dtp.last_ctrl_seq_num_rcvd {
            debug!(
                "duplicated control PDU [{}], last [{}]",
                pcic.base.seqnum, dtp.last_ctrl_seq_num_rcvd
            );
            drop(dtp);
            flow.write_restart();
            return dispatch;
        }
        dtp.last_ctrl_seq_num_rcvd = pcic.base.seqnum;

        if pcic.base.pdu_type & pdu_type::FC_BIT != 0 {
            if pcic.new_rwe < dtp.snd_rwe {
                // The peer may never move the window backwards.
                warn!(
                    "broken peer, new_rwe would go backward [{}] --> [{}]",
                    dtp.snd_rwe, pcic.new_rwe
                );
            } else {
                dtp.snd_rwe = pcic.new_rwe;
                // The update may have unblocked PDUs in the cwq.
                while dtp.snd_lwe < dtp.snd_rwe {
                    let qrb = match dtp.cwq.pop_front() {
                        Some(qrb) => qrb,
                        None => break,
                    };
                    let seqnum = dtp.snd_lwe;
                    dtp.last_seq_num_sent = Some(seqnum);
                    dtp.snd_lwe += 1;
                    if flow.cfg.dtcp.rtx_control {
                        dtp.rtxq_push(&qrb, seqnum, now);
                    }
                    dispatch.push(qrb);
                }
            }
        }

        if pcic.base.pdu_type & pdu_type::ACK_BIT != 0 {
            match pcic.base.pdu_type & pdu_type::ACK_MASK {
                pdu_type::ACK => process_ack(&mut dtp, pcic.ack_nack_seq_num),
                _ => info!("missing support for PDU type {:#04x}", pcic.base.pdu_type),
            }
        }
    }

    flow.write_restart();
    dispatch
}

/// Removes everything up to and including `ack_seq` from the rtx queue and
/// moves or cancels the retransmission timer accordingly.
fn process_ack(dtp: &mut Dtp, ack_seq: u64) {
    while dtp.rtxq.front().map_or(false, |(s, _)| *s <= ack_seq) {
        if let Some((seqnum, _)) = dtp.rtxq.pop_front() {
            debug!("remove [{}] from rtxq", seqnum);
            if dtp.rtx_tmr_next == Some(seqnum) {
                // We acked the entry the timer was armed on; re-arm on the
                // first survivor below.
                dtp.rtx_tmr_next = None;
            }
        }
    }
    match dtp.rtxq.front() {
        Some((seqnum, rb)) => {
            if dtp.rtx_tmr_next.is_none() {
                dtp.rtx_tmr_next = Some(*seqnum);
                dtp.rtx_deadline = rb.rtx_deadline;
            }
        }
        None => {
            // Everything has been acked, stop the rtx timer.
            dtp.rtx_tmr_next = None;
            dtp.rtx_deadline = None;
        }
    }
}
