//! # Normal IPC process data transfer core
//!
//! The data plane of a recursive internetwork architecture node. A flow
//! between two IPCPs runs a per-flow protocol machine (DTP) together with
//! its control companion (DTCP): sequence numbers are assigned on send,
//! sliding window flow control parks overflow in a closed window queue,
//! lost PDUs are repaired by selective retransmission and the receive
//! side reorders, suppresses duplicates and feeds acknowledgements and
//! window updates back to the sender.
//!
//! Routing between IPCPs is explicit: every outgoing PDU resolves its
//! destination address through a per-IPCP PDU forwarding table and leaves
//! through the lower flow the entry names. PDUs addressed to the IPCP
//! itself loop straight back into the receive path.
//!
//! The pieces compose the way the layers stack:
//!
//! * [`pdu::Buf`] — an owned PDU with a head reserve for the PCIs.
//! * `channel` — the lower flow contract and its backpressure rules.
//! * `dtp` — the per-flow protocol machine behind one lock.
//! * `rmt` — forwarding table, relay task and deferred-send queue.
//! * [`Ipcp`] — the factory surface tying the above together.
//!
//! Enrollment, name registration and flow allocation signalling live in
//! the management plane above this crate; flows arrive here already
//! configured.
mod error;
mod ipcp;
mod mgmt;

pub use crate::error::Error;
pub use crate::ipcp::Ipcp;
pub use crate::mgmt::MgmtHdr;
pub use addr::Addr;
pub use dtp::{
    DtcpConfig, Flow, FlowConfig, FlowCtrl, FlowStats, RtxConfig, WindowConfig,
};
pub use pdu::Buf;
