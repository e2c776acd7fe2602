//! LSP packet header.
//!
//! Fixed 8-byte header, four 16-bit words in network byte order:
//!
//! ```text
//!  0               16              32                    42        48
//! +---------------+---------------+---------------------+---------+
//! |   dst_addr    |   src_addr    |        plen         |  proto  |
//! +-----+-----+---------+---------+---------------------+---------+
//! |frag |seqnm|src_port |dst_port |
//! +-----+-----+---------+---------+
//!  48    51    54        59        64
//! ```
//!
//! Every field is range-checked against `2^bits - 1` on encode.

use crate::error::{LspError, Result};
use bytes::{Buf, BufMut};

/// Stack address.
pub type Address = u16;

pub const ADDR_BITS: u32 = 16;
pub const PLEN_BITS: u32 = 10;
pub const PROTO_BITS: u32 = 6;
pub const FRAG_BITS: u32 = 3;
pub const SEQNUM_BITS: u32 = 3;
pub const SRCPORT_BITS: u32 = 5;
pub const DSTPORT_BITS: u32 = 5;

const fn field_max(bits: u32) -> u32 {
    (1 << bits) - 1
}

pub const ADDR_MAX: u32 = field_max(ADDR_BITS);
pub const PLEN_MAX: u16 = field_max(PLEN_BITS) as u16;
pub const PROTO_MAX: u8 = field_max(PROTO_BITS) as u8;
pub const FRAG_MAX: u8 = field_max(FRAG_BITS) as u8;
pub const SEQNUM_MAX: u8 = field_max(SEQNUM_BITS) as u8;
pub const PORT_MAX: u8 = field_max(SRCPORT_BITS) as u8;

/// Wildcard address ("any").
pub const ADDR_ANY: Address = 0x0000;

/// Wildcard port ("any"), outside of the 5-bit wire range.
pub const PORT_ANY: u8 = u8::MAX;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 8;

/// A decoded LSP packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub dst_addr: Address,
    pub src_addr: Address,
    /// Payload length
    pub plen: u16,
    /// Payload protocol
    pub proto: u8,
    /// Fragmentation
    pub frag: u8,
    /// Sequence number
    pub seqnum: u8,
    pub src_port: u8,
    pub dst_port: u8,
}

impl PacketHeader {
    /// Check every field fits its bit width.
    pub fn validate(&self) -> Result<()> {
        check("plen", self.plen.into(), PLEN_MAX.into())?;
        check("proto", self.proto.into(), PROTO_MAX.into())?;
        check("frag", self.frag.into(), FRAG_MAX.into())?;
        check("seqnum", self.seqnum.into(), SEQNUM_MAX.into())?;
        if self.src_port > PORT_MAX {
            return Err(LspError::PortInvalid(self.src_port));
        }
        if self.dst_port > PORT_MAX {
            return Err(LspError::PortInvalid(self.dst_port));
        }
        Ok(())
    }

    /// Encode into `dst`.
    pub fn encode<B: BufMut>(&self, dst: &mut B) -> Result<()> {
        self.validate()?;
        if dst.remaining_mut() < HEADER_LEN {
            return Err(LspError::invalid("buffer too small for packet header"));
        }
        dst.put_u16(self.dst_addr);
        dst.put_u16(self.src_addr);
        dst.put_u16((self.plen << PROTO_BITS) | u16::from(self.proto));
        dst.put_u16(
            (u16::from(self.frag) << (SEQNUM_BITS + SRCPORT_BITS + DSTPORT_BITS))
                | (u16::from(self.seqnum) << (SRCPORT_BITS + DSTPORT_BITS))
                | (u16::from(self.src_port) << DSTPORT_BITS)
                | u16::from(self.dst_port),
        );
        Ok(())
    }

    /// Encode into a fixed array.
    pub fn to_bytes(&self) -> Result<[u8; HEADER_LEN]> {
        let mut out = [0u8; HEADER_LEN];
        self.encode(&mut &mut out[..])?;
        Ok(out)
    }

    /// Decode from the front of `src`.
    ///
    /// Returns `None` when fewer than [`HEADER_LEN`] bytes are available.
    pub fn decode<B: Buf>(src: &mut B) -> Option<Self> {
        if src.remaining() < HEADER_LEN {
            return None;
        }
        let dst_addr = src.get_u16();
        let src_addr = src.get_u16();
        let word2 = src.get_u16();
        let word3 = src.get_u16();

        Some(Self {
            dst_addr,
            src_addr,
            plen: word2 >> PROTO_BITS,
            proto: (word2 & mask(PROTO_BITS)) as u8,
            frag: (word3 >> (SEQNUM_BITS + SRCPORT_BITS + DSTPORT_BITS)) as u8,
            seqnum: ((word3 >> (SRCPORT_BITS + DSTPORT_BITS)) & mask(SEQNUM_BITS)) as u8,
            src_port: ((word3 >> DSTPORT_BITS) & mask(SRCPORT_BITS)) as u8,
            dst_port: (word3 & mask(DSTPORT_BITS)) as u8,
        })
    }
}

#[inline]
const fn mask(bits: u32) -> u16 {
    field_max(bits) as u16
}

fn check(field: &str, value: u32, max: u32) -> Result<()> {
    if value > max {
        return Err(LspError::invalid(format!("{field} {value} exceeds {max}")));
    }
    Ok(())
}

/// Validate a raw address against the address field width.
pub fn address_from(raw: u32) -> Result<Address> {
    if raw > ADDR_MAX {
        return Err(LspError::AddressInvalid(raw));
    }
    Ok(raw as Address)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketHeader {
        PacketHeader {
            dst_addr: 0xAE55,
            src_addr: 0x1234,
            plen: 1023,
            proto: 5,
            frag: 7,
            seqnum: 2,
            src_port: 31,
            dst_port: 1,
        }
    }

    #[test]
    fn test_field_maxima() {
        assert_eq!(PLEN_MAX, 1023);
        assert_eq!(PROTO_MAX, 63);
        assert_eq!(FRAG_MAX, 7);
        assert_eq!(SEQNUM_MAX, 7);
        assert_eq!(PORT_MAX, 31);
        assert_eq!(ADDR_MAX, 0xFFFF);
    }

    #[test]
    fn test_wire_layout() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0xAE, 0x55, 0x12, 0x34]);
        // plen 1023 << 6 | 5
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]), 0xFFC5);
        // frag 7, seqnum 2, src 31, dst 1
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 0b111_010_11111_00001);
        assert_eq!(PacketHeader::decode(&mut &bytes[..]), Some(sample()));
    }

    #[test]
    fn test_encode_rejects_oversized_fields() {
        let mut header = sample();
        header.plen = 1024;
        assert!(matches!(header.to_bytes(), Err(LspError::InvalidArgument(_))));

        let mut header = sample();
        header.dst_port = 32;
        assert_eq!(header.to_bytes().unwrap_err(), LspError::PortInvalid(32));
    }

    #[test]
    fn test_decode_short_input() {
        assert_eq!(PacketHeader::decode(&mut &[0u8; 7][..]), None);
    }

    #[test]
    fn test_address_from() {
        assert_eq!(address_from(0xAE55).unwrap(), 0xAE55);
        assert_eq!(address_from(0x1_0000).unwrap_err(), LspError::AddressInvalid(0x1_0000));
    }
}
