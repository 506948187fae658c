//! PDU buffers.
//!
//! A [`Buf`] owns the bytes of one PDU plus a head reserve big enough for
//! the PCIs of the layers the PDU still has to traverse. Stamping a PCI
//! moves the logical start of the buffer backwards into the reserve,
//! stripping one moves it forward; neither copies the payload.
//!
//! A buffer is exclusively owned by whoever holds it. Cloning produces an
//! independent copy, which is how a PDU is staged on a retransmission
//! queue while the original travels down the stack.
#![deny(missing_docs)]
mod pci;

pub use crate::pci::{pdu_flags, pdu_type, ConnId, CtrlPci, DtPci, CTRL_PCI_LEN, DT_PCI_LEN};
use bytes::BytesMut;
use std::io::{Error, ErrorKind, Result};
use std::time::Instant;

/// Default head reserve, room for a few stacked PCIs.
pub const DEFAULT_RESERVE: usize = 128;

/// An owned PDU buffer with a head reserve.
#[derive(Clone)]
pub struct Buf {
    bytes: BytesMut,
    head: usize,
    pci_at: Option<usize>,
    /// When this buffer sits on a retransmission queue, the time at which
    /// it has to be retransmitted next.
    pub rtx_deadline: Option<Instant>,
}

impl Buf {
    /// Creates a buffer holding `payload` with the default head reserve.
    pub fn data(payload: &[u8]) -> Buf {
        Buf::with_reserve(DEFAULT_RESERVE, payload)
    }

    /// Creates a buffer holding `payload` with `reserve` bytes of head room.
    pub fn with_reserve(reserve: usize, payload: &[u8]) -> Buf {
        let mut bytes = BytesMut::with_capacity(reserve + payload.len());
        bytes.resize(reserve, 0);
        bytes.extend_from_slice(payload);
        Buf {
            bytes,
            head: reserve,
            pci_at: None,
            rtx_deadline: None,
        }
    }

    /// Creates a control PDU whose content is the encoded control PCI.
    pub fn ctrl(pci: &CtrlPci) -> Buf {
        let mut rb = Buf::with_reserve(DEFAULT_RESERVE, &[0u8; CTRL_PCI_LEN]);
        pci.encode(&mut rb.bytes[rb.head..]);
        rb
    }

    /// Length of the logical content, PCIs included once stamped.
    pub fn len(&self) -> usize {
        self.bytes.len() - self.head
    }

    /// True when the buffer has no logical content.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining head reserve.
    pub fn head_room(&self) -> usize {
        self.head
    }

    /// The logical content of the buffer.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.head..]
    }

    /// The mutable logical content of the buffer.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.head..]
    }

    /// Stamps a DT PCI in front of the current content.
    ///
    /// Fails without touching the buffer when the head reserve cannot take
    /// another PCI.
    pub fn push_pci(&mut self, pci: &DtPci) -> Result<()> {
        if self.head < DT_PCI_LEN {
            return Err(Error::new(ErrorKind::Other, "head reserve exhausted"));
        }
        self.head -= DT_PCI_LEN;
        pci.encode(&mut self.bytes[self.head..]);
        self.pci_at = None;
        Ok(())
    }

    /// Strips the DT PCI at the front of the buffer and returns it.
    ///
    /// The stripped header stays inside the reserve and remains readable
    /// through [`Buf::popped_pci`] until the next stamp.
    pub fn pop_pci(&mut self) -> Result<DtPci> {
        let pci = DtPci::decode(&self.bytes[self.head..])?;
        self.pci_at = Some(self.head);
        self.head += DT_PCI_LEN;
        Ok(pci)
    }

    /// Reads the DT PCI at the front of the buffer without stripping it.
    pub fn dt_pci(&self) -> Result<DtPci> {
        DtPci::decode(&self.bytes[self.head..])
    }

    /// Reads the control PCI at the front of the buffer.
    pub fn ctrl_pci(&self) -> Result<CtrlPci> {
        CtrlPci::decode(&self.bytes[self.head..])
    }

    /// The PCI most recently stripped with [`Buf::pop_pci`], if any.
    pub fn popped_pci(&self) -> Option<DtPci> {
        let at = self.pci_at?;
        DtPci::decode(&self.bytes[at..]).ok()
    }
}

impl std::fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Buf")
            .field("len", &self.len())
            .field("head_room", &self.head_room())
            .field("rtx_deadline", &self.rtx_deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pci(seqnum: u64) -> DtPci {
        DtPci {
            dst_addr: 2.into(),
            src_addr: 1.into(),
            conn_id: ConnId {
                qos_id: 0,
                dst_cep: 20,
                src_cep: 10,
            },
            pdu_type: pdu_type::DT,
            pdu_flags: 0,
            pdu_len: 0,
            seqnum,
        }
    }

    #[test]
    fn test_stamp_strip() {
        let mut rb = Buf::data(b"ping");
        let mut hdr = pci(7);
        hdr.pdu_len = (rb.len() + DT_PCI_LEN) as u16;
        rb.push_pci(&hdr).unwrap();
        assert_eq!(rb.len(), 4 + DT_PCI_LEN);
        assert_eq!(rb.dt_pci().unwrap(), hdr);

        let stripped = rb.pop_pci().unwrap();
        assert_eq!(stripped, hdr);
        assert_eq!(rb.payload(), b"ping");
        assert_eq!(rb.popped_pci().unwrap().seqnum, 7);
    }

    #[test]
    fn test_reserve_exhausted() {
        let mut rb = Buf::with_reserve(DT_PCI_LEN, b"x");
        rb.push_pci(&pci(0)).unwrap();
        assert!(rb.push_pci(&pci(1)).is_err());
        // The failed push must not have moved the start.
        assert_eq!(rb.dt_pci().unwrap().seqnum, 0);
    }

    #[test]
    fn test_pop_underflow() {
        let mut rb = Buf::data(b"tiny");
        assert!(rb.pop_pci().is_err());
        assert_eq!(rb.payload(), b"tiny");
    }

    #[test]
    fn test_clone_is_independent() {
        let mut rb = Buf::data(b"abcd");
        rb.push_pci(&pci(3)).unwrap();
        let mut copy = rb.clone();
        copy.payload_mut()[DT_PCI_LEN] = b'z';
        assert_eq!(&rb.payload()[DT_PCI_LEN..], b"abcd");
        assert_eq!(&copy.payload()[DT_PCI_LEN..], b"zbcd");
    }

    #[test]
    fn test_ctrl_buffer() {
        let hdr = CtrlPci {
            base: DtPci {
                pdu_type: pdu_type::CTRL_MASK | pdu_type::FC_BIT,
                pdu_len: CTRL_PCI_LEN as u16,
                ..pci(0)
            },
            new_rwe: 64,
            new_lwe: 60,
            ..CtrlPci::default()
        };
        let rb = Buf::ctrl(&hdr);
        assert_eq!(rb.len(), CTRL_PCI_LEN);
        assert_eq!(rb.ctrl_pci().unwrap(), hdr);
    }
}
