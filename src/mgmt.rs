use addr::Addr;

/// Addressing of an outgoing management PDU.
///
/// Management traffic is not bound to a flow: the caller names either the
/// destination IPCP or directly the local port of the lower flow the PDU
/// has to leave through.
#[derive(Clone, Copy, Debug)]
pub enum MgmtHdr {
    /// Route through the forwarding table toward this address.
    DstAddr(Addr),
    /// Send down the lower flow bound at this local port.
    LocalPort(usize),
}
