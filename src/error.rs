use failure::Fail;
use pdu::Buf;

/// Errors surfaced by the data transfer core.
///
/// Transient conditions (backpressure, duplicates, out of order arrivals)
/// are absorbed internally and never show up here; what surfaces is
/// addressing and structure.
#[derive(Debug, Fail)]
pub enum Error {
    /// No forwarding entry for the destination and it is not us.
    #[fail(display = "no route to destination")]
    NoRoute,
    /// Admission refused; the rejected PDU travels back with the error so
    /// the caller can retry it.
    #[fail(display = "transient backpressure, try again")]
    WouldBlock(Buf),
    /// The buffer's head reserve cannot take another PCI.
    #[fail(display = "no room for the PCI header")]
    NoSpace,
    /// An allocation failed while staging a clone or a control PDU.
    #[fail(display = "out of memory")]
    OutOfMemory,
    /// Malformed management header, unknown configuration key or
    /// unsupported PDU structure.
    #[fail(display = "invalid: {}", _0)]
    Invalid(&'static str),
    /// Management PDU addressed to an unreachable destination.
    #[fail(display = "host unreachable")]
    HostUnreachable,
}
