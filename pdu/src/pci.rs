//! Protocol-control-information codecs.
//!
//! Every data transfer and management PDU starts with a DT PCI; control
//! PDUs extend it with window and acknowledgement state:
//!
//! ```text
//! 0               8               16
//! +---------------+---------------+
//! | dst_addr                      |
//! +---------------+---------------+
//! | src_addr                      |
//! +-------+-------+-------+-------+
//! | qos_id| dstcep| srccep|typ|flg|
//! +-------+-------+-------+---+---+
//! | len   | seqnum...             |
//! +-------+-----------------------+
//! | ...seqnum     | (control only:|
//! +---------------+  six u64 words|
//! |  of window and ack state)     |
//! +-------------------------------+
//! ```
//!
//! All fields are big endian.
use addr::Addr;
use byteorder::{BigEndian, ByteOrder};
use std::io::{Error, ErrorKind, Result};

/// Length of the PCI stamped on data and management PDUs.
pub const DT_PCI_LEN: usize = 34;
/// Length of the PCI carried by control PDUs.
pub const CTRL_PCI_LEN: usize = 82;

/// PDU type octet values and bit masks.
pub mod pdu_type {
    /// Data transfer PDU.
    pub const DT: u8 = 0x80;
    /// Management PDU.
    pub const MGMT: u8 = 0x40;
    /// Bits set on every control PDU.
    pub const CTRL_MASK: u8 = 0xc0;
    /// The control PDU carries flow control information.
    pub const FC_BIT: u8 = 0x08;
    /// The control PDU carries acknowledgement information.
    pub const ACK_BIT: u8 = 0x04;
    /// Mask selecting the acknowledgement subtype.
    pub const ACK_MASK: u8 = 0x03;
    /// Positive acknowledgement.
    pub const ACK: u8 = 0x00;
    /// Negative acknowledgement.
    pub const NACK: u8 = 0x01;
    /// Selective acknowledgement.
    pub const SACK: u8 = 0x02;
    /// Selective negative acknowledgement.
    pub const SNACK: u8 = 0x03;
}

/// PDU flag bits.
pub mod pdu_flags {
    /// Data run flag: first PDU of a (re)started run.
    pub const DRF: u8 = 0x01;
}

/// Connection endpoint identifiers of a flow.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnId {
    /// QoS cube the flow belongs to.
    pub qos_id: u16,
    /// CEP-id at the destination, used to demultiplex on receive.
    pub dst_cep: u16,
    /// CEP-id at the source.
    pub src_cep: u16,
}

/// PCI stamped on data transfer and management PDUs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DtPci {
    /// Destination IPCP address.
    pub dst_addr: Addr,
    /// Source IPCP address.
    pub src_addr: Addr,
    /// Connection endpoint identifiers.
    pub conn_id: ConnId,
    /// One of the `pdu_type` values.
    pub pdu_type: u8,
    /// `pdu_flags` bits.
    pub pdu_flags: u8,
    /// Total PDU length, PCI included.
    pub pdu_len: u16,
    /// Sequence number within the flow's data or control space.
    pub seqnum: u64,
}

impl DtPci {
    /// Writes the PCI to the first `DT_PCI_LEN` bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= DT_PCI_LEN);
        BigEndian::write_u64(&mut buf[0..8], self.dst_addr.raw());
        BigEndian::write_u64(&mut buf[8..16], self.src_addr.raw());
        BigEndian::write_u16(&mut buf[16..18], self.conn_id.qos_id);
        BigEndian::write_u16(&mut buf[18..20], self.conn_id.dst_cep);
        BigEndian::write_u16(&mut buf[20..22], self.conn_id.src_cep);
        buf[22] = self.pdu_type;
        buf[23] = self.pdu_flags;
        BigEndian::write_u16(&mut buf[24..26], self.pdu_len);
        BigEndian::write_u64(&mut buf[26..34], self.seqnum);
    }

    /// Reads a PCI from the first `DT_PCI_LEN` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<DtPci> {
        if buf.len() < DT_PCI_LEN {
            return Err(Error::new(ErrorKind::Other, "truncated PCI"));
        }
        Ok(DtPci {
            dst_addr: BigEndian::read_u64(&buf[0..8]).into(),
            src_addr: BigEndian::read_u64(&buf[8..16]).into(),
            conn_id: ConnId {
                qos_id: BigEndian::read_u16(&buf[16..18]),
                dst_cep: BigEndian::read_u16(&buf[18..20]),
                src_cep: BigEndian::read_u16(&buf[20..22]),
            },
            pdu_type: buf[22],
            pdu_flags: buf[23],
            pdu_len: BigEndian::read_u16(&buf[24..26]),
            seqnum: BigEndian::read_u64(&buf[26..34]),
        })
    }
}

/// PCI carried by control PDUs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CtrlPci {
    /// The common leading fields.
    pub base: DtPci,
    /// Highest control sequence number the sender has seen from us.
    pub last_ctrl_seq_num_rcvd: u64,
    /// Cumulative acknowledgement, meaningful with `ACK_BIT`.
    pub ack_nack_seq_num: u64,
    /// Our new send right window edge, meaningful with `FC_BIT`.
    pub new_rwe: u64,
    /// The sender's receive left window edge.
    pub new_lwe: u64,
    /// The sender's own receive right window edge.
    pub my_rwe: u64,
    /// The sender's own send left window edge.
    pub my_lwe: u64,
}

impl CtrlPci {
    /// Writes the PCI to the first `CTRL_PCI_LEN` bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= CTRL_PCI_LEN);
        self.base.encode(buf);
        BigEndian::write_u64(&mut buf[34..42], self.last_ctrl_seq_num_rcvd);
        BigEndian::write_u64(&mut buf[42..50], self.ack_nack_seq_num);
        BigEndian::write_u64(&mut buf[50..58], self.new_rwe);
        BigEndian::write_u64(&mut buf[58..66], self.new_lwe);
        BigEndian::write_u64(&mut buf[66..74], self.my_rwe);
        BigEndian::write_u64(&mut buf[74..82], self.my_lwe);
    }

    /// Reads a PCI from the first `CTRL_PCI_LEN` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<CtrlPci> {
        if buf.len() < CTRL_PCI_LEN {
            return Err(Error::new(ErrorKind::Other, "truncated control PCI"));
        }
        Ok(CtrlPci {
            base: DtPci::decode(buf)?,
            last_ctrl_seq_num_rcvd: BigEndian::read_u64(&buf[34..42]),
            ack_nack_seq_num: BigEndian::read_u64(&buf[42..50]),
            new_rwe: BigEndian::read_u64(&buf[50..58]),
            new_lwe: BigEndian::read_u64(&buf[58..66]),
            my_rwe: BigEndian::read_u64(&buf[66..74]),
            my_lwe: BigEndian::read_u64(&buf[74..82]),
        })
    }
}
