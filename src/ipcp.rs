use crate::error::Error;
use crate::mgmt::MgmtHdr;
use addr::Addr;
use async_std::task;
use channel::{wait_until, Channel, RateLimit};
use crossbeam::atomic::AtomicCell;
use dtp::{Flow, FlowConfig, FlowStats, WriteError, WriteOutcome};
use futures_timer::Delay;
use log::{debug, info};
use pdu::{pdu_type, Buf, ConnId, DtPci, DT_PCI_LEN};
use rmt::{Rmt, TxOutcome};
use slab::Slab;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A normal IPC process: the per-flow protocol machines plus the relaying
/// machinery shared by all of them.
///
/// Flows are demultiplexed by destination CEP-id. Lower flows bound to
/// the IPCP carry its outgoing traffic and are referenced by forwarding
/// entries; unbinding one drains those entries first.
pub struct Ipcp {
    id: u16,
    addr: AtomicCell<Addr>,
    rmt: Arc<Rmt>,
    flows: Mutex<HashMap<u16, Arc<Flow>>>,
    lowers: Mutex<Slab<Arc<dyn Channel>>>,
    drop_rl: RateLimit,
}

impl Ipcp {
    /// Creates the IPCP and starts its deferred-send drain task.
    pub fn create(id: u16) -> Arc<Ipcp> {
        let rmt = Arc::new(Rmt::new());
        rmt.start_drain();
        info!("new IPC process [{}]", id);
        Arc::new(Ipcp {
            id,
            addr: AtomicCell::new(Addr::UNSET),
            rmt,
            flows: Mutex::new(HashMap::new()),
            lowers: Mutex::new(Slab::new()),
            drop_rl: RateLimit::new(Duration::from_secs(1)),
        })
    }

    /// Tears everything down: flows, forwarding state and the drain task.
    pub fn destroy(&self) {
        let flows: Vec<Arc<Flow>> = self.flows.lock().unwrap().drain().map(|(_, f)| f).collect();
        for flow in flows {
            flow.close();
        }
        self.rmt.pduft().flush();
        self.lowers.lock().unwrap().clear();
        self.rmt.shutdown();
        info!("IPC process [{}] destroyed", self.id);
    }

    /// Numeric id of this IPCP.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The address configured for this IPCP, `Addr::UNSET` until then.
    pub fn addr(&self) -> Addr {
        self.addr.load()
    }

    /// The relay and multiplexing task of this IPCP.
    pub fn rmt(&self) -> &Rmt {
        &self.rmt
    }

    /// Runtime configuration. The only understood key is `"address"`,
    /// taking the decimal IPCP address.
    pub fn config(&self, name: &str, value: &str) -> Result<(), Error> {
        match name {
            "address" => {
                let address: Addr = value.parse().map_err(|_| Error::Invalid("address"))?;
                info!("IPCP {} address set to {}", self.id, address);
                self.addr.store(address);
                Ok(())
            }
            _ => Err(Error::Invalid("unknown parameter")),
        }
    }

    /// Initialises the protocol machine of a freshly allocated flow and
    /// wires its timers. With retransmission control a driver task is
    /// spawned to fire the rtx timer.
    pub fn flow_init(
        self: &Arc<Self>,
        cfg: FlowConfig,
        remote_addr: Addr,
        local_cep: u16,
        remote_cep: u16,
    ) -> Arc<Flow> {
        let rtx_control = cfg.dtcp.rtx_control;
        let flow = Arc::new(Flow::new(
            cfg,
            remote_addr,
            local_cep,
            remote_cep,
            Duration::from_millis(0),
        ));
        self.flows.lock().unwrap().insert(local_cep, flow.clone());
        if rtx_control {
            let ipcp = self.clone();
            let driven = flow.clone();
            task::spawn(async move {
                ipcp.rtx_driver(driven).await;
            });
        }
        flow
    }

    /// Unregisters a flow and shuts its protocol machine down.
    pub fn flow_teardown(&self, flow: &Arc<Flow>) {
        self.flows.lock().unwrap().remove(&flow.local_cep());
        flow.close();
    }

    /// Snapshot of a flow's counters.
    pub fn flow_get_stats(&self, flow: &Flow) -> FlowStats {
        flow.stats()
    }

    /// Send path of the factory contract.
    ///
    /// Backpressure either surfaces as [`Error::WouldBlock`] (the PDU
    /// rides back in the error) or, with `may_sleep`, waits on the flow's
    /// write-restart signal and retries.
    pub async fn sdu_write(&self, flow: &Arc<Flow>, rb: Buf, may_sleep: bool) -> Result<(), Error> {
        let mut rb = rb;
        loop {
            let gen = flow.restart_generation();
            match flow.write_prepare(self.addr(), rb, Instant::now()) {
                Ok(WriteOutcome::Dispatch(out)) => {
                    return match self
                        .rmt
                        .tx(self.addr(), flow.remote_addr(), out, may_sleep)
                        .await
                    {
                        TxOutcome::Loopback(back) => {
                            self.sdu_rx(back);
                            Ok(())
                        }
                        TxOutcome::NoRoute => Err(Error::NoRoute),
                        _ => Ok(()),
                    };
                }
                Ok(WriteOutcome::Queued) => return Ok(()),
                Err(WriteError::WouldBlock(back)) => {
                    if !may_sleep {
                        return Err(Error::WouldBlock(back));
                    }
                    if flow.is_closed() {
                        return Err(Error::Invalid("flow is closed"));
                    }
                    wait_until(|| flow.restart_generation() != gen || flow.is_closed()).await;
                    rb = back;
                }
                Err(WriteError::NoSpace) => return Err(Error::NoSpace),
            }
        }
    }

    /// Receive path of the factory contract: PDUs coming up from a lower
    /// flow land here. Never blocks, so it is safe from soft-interrupt
    /// style contexts.
    pub fn sdu_rx(&self, rb: Buf) {
        let pci = match rb.dt_pci() {
            Ok(pci) => pci,
            Err(_) => {
                debug!("runt PDU, dropping");
                return;
            }
        };

        if pci.dst_addr != self.addr() {
            // Not ours: relay toward the destination.
            self.dispatch_to(pci.dst_addr, rb);
            return;
        }

        let flow = self.flows.lock().unwrap().get(&pci.conn_id.dst_cep).cloned();
        let flow = match flow {
            Some(flow) => flow,
            None => {
                if self.drop_rl.check() {
                    debug!("no flow for cep-id {}: dropping PDU", pci.conn_id.dst_cep);
                }
                return;
            }
        };

        if pci.pdu_type != pdu_type::DT {
            for qrb in flow.rx_ctrl(rb, Instant::now()) {
                if let Ok(qpci) = qrb.dt_pci() {
                    debug!("sending [{}] from cwq", qpci.seqnum);
                    self.dispatch_to(qpci.dst_addr, qrb);
                }
            }
            return;
        }

        if let Some(crb) = flow.rx_data(self.addr(), pci, rb, Instant::now()) {
            self.dispatch_to(flow.remote_addr(), crb);
        }
    }

    /// The consumer finished with a delivered buffer: advertise the new
    /// window edge to the peer. A no-op unless the flow configuration
    /// installed consumption reporting.
    pub fn sdu_rx_consumed(&self, flow: &Flow, rb: &Buf) {
        if !flow.consumed_installed() {
            return;
        }
        if let Some(crb) = flow.consumed(rb, self.addr()) {
            self.dispatch_to(flow.remote_addr(), crb);
        }
    }

    /// Resolves the lower flow an outgoing management PDU leaves through
    /// and stamps its PCI. The caller performs the actual write.
    pub fn mgmt_sdu_write(&self, mhdr: &MgmtHdr, rb: &mut Buf) -> Result<Arc<dyn Channel>, Error> {
        let (lower, dst_addr) = match *mhdr {
            MgmtHdr::DstAddr(remote_addr) => match self.rmt.pduft().lookup(remote_addr) {
                Some(lower) => (lower, remote_addr),
                None => {
                    if self.drop_rl.check() {
                        debug!("no route to IPCP {}, dropping packet", remote_addr);
                    }
                    return Err(Error::HostUnreachable);
                }
            },
            MgmtHdr::LocalPort(port) => {
                let lowers = self.lowers.lock().unwrap();
                match lowers.get(port) {
                    Some(lower) => (lower.clone(), Addr::UNSET),
                    None => {
                        debug!("invalid mgmt header local port {}, dropping packet", port);
                        return Err(Error::Invalid("management local port"));
                    }
                }
            }
        };
        let pci = DtPci {
            dst_addr,
            src_addr: self.addr(),
            conn_id: ConnId::default(),
            pdu_type: pdu_type::MGMT,
            pdu_flags: 0,
            pdu_len: (rb.len() + DT_PCI_LEN) as u16,
            seqnum: 0,
        };
        rb.push_pci(&pci).map_err(|_| Error::NoSpace)?;
        Ok(lower)
    }

    /// Installs or replaces a forwarding entry.
    pub fn pduft_set(&self, dst_addr: Addr, lower: Arc<dyn Channel>) {
        self.rmt.pduft().set(dst_addr, lower);
    }

    /// Removes a forwarding entry.
    pub fn pduft_del(&self, dst_addr: Addr) -> Result<(), Error> {
        if self.rmt.pduft().del(dst_addr) {
            Ok(())
        } else {
            Err(Error::Invalid("no forwarding entry"))
        }
    }

    /// Drops every forwarding entry.
    pub fn pduft_flush(&self) {
        self.rmt.pduft().flush();
    }

    /// Registers a lower flow with this IPCP; management PDUs can then
    /// name it by the returned port.
    pub fn bind_lower(&self, lower: Arc<dyn Channel>) -> usize {
        let port = self.lowers.lock().unwrap().insert(lower);
        debug!("lower flow bound at port {}", port);
        port
    }

    /// Unbinds a lower flow, draining the forwarding entries that still
    /// reference it.
    pub fn unbind_lower(&self, port: usize) {
        let lower = {
            let mut lowers = self.lowers.lock().unwrap();
            if lowers.contains(port) {
                Some(lowers.remove(port))
            } else {
                None
            }
        };
        if let Some(lower) = lower {
            let dropped = self.rmt.pduft().del_for_flow(lower.id());
            debug!("unbound lower flow, dropped {} forwarding entries", dropped);
        }
    }

    /// Relays a PDU and feeds self-addressed ones back into the receive
    /// path.
    fn dispatch_to(&self, dst_addr: Addr, rb: Buf) {
        if let TxOutcome::Loopback(rb) = self.rmt.tx_nonblocking(self.addr(), dst_addr, rb) {
            self.sdu_rx(rb);
        }
    }

    /// Drives a flow's retransmission timer: sleeps until the armed
    /// deadline, runs the expiry scan and relays the staged copies.
    async fn rtx_driver(&self, flow: Arc<Flow>) {
        let idle = flow.rtx_interval();
        while !flow.is_closed() {
            let now = Instant::now();
            match flow.next_rtx_deadline() {
                Some(deadline) if deadline > now => {
                    Delay::new(deadline - now).await;
                }
                Some(_) => {
                    for crb in flow.rtx_expired(Instant::now()) {
                        if let Ok(pci) = crb.dt_pci() {
                            debug!("sending [{}] from rtxq", pci.seqnum);
                            self.dispatch_to(pci.dst_addr, crb);
                        }
                    }
                }
                None => {
                    Delay::new(idle).await;
                }
            }
        }
    }
}
