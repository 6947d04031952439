use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes};
use crate::util::safe_converter::PrecheckedCast;

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    pub struct PacketFlags: u8 {
        const RELIABLE      = 0b0000_0001;
        const RESENT        = 0b0000_0010;
        const ZEROCODED     = 0b0000_0100;
        const APPENDED_ACKS = 0b0000_1000;
    }
}

/// The fixed-position part at the start of every datagram: flags, sequence number and the
///  length-prefixed 'extra' header bytes.
#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub sequence: u32,
    pub extra: Bytes,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HDR{{#{}", self.sequence)?;
        for (flag, name) in [
            (PacketFlags::RELIABLE, "R"),
            (PacketFlags::RESENT, "S"),
            (PacketFlags::ZEROCODED, "Z"),
            (PacketFlags::APPENDED_ACKS, "A"),
        ] {
            if self.flags.contains(flag) {
                write!(f, ":{}", name)?;
            }
        }
        if !self.extra.is_empty() {
            write!(f, ":+{}", self.extra.len())?;
        }
        write!(f, "}}")
    }
}

impl PacketHeader {
    /// flags (1) + sequence number (4) + length of the 'extra' bytes (1)
    pub const PREFIX_LEN: usize = 6;
    pub const OFFSET_FLAGS: usize = 0;
    pub const OFFSET_SEQUENCE: usize = 1;

    pub fn new(flags: PacketFlags, sequence: u32) -> PacketHeader {
        PacketHeader {
            flags,
            sequence,
            extra: Bytes::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::PREFIX_LEN + self.extra.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.sequence);
        buf.put_u8(self.extra.len().prechecked_cast());
        buf.put_slice(&self.extra);
    }

    /// Parses the header, leaving `buf` positioned at the message id. Unknown flag bits are
    ///  ignored.
    pub fn deser(buf: &mut Bytes) -> anyhow::Result<PacketHeader> {
        if buf.len() < Self::PREFIX_LEN {
            bail!("datagram of {} bytes is shorter than the header prefix", buf.len());
        }

        let flags = PacketFlags::from_bits_truncate(buf.get_u8());
        let sequence = buf.get_u32();
        let extra_len = buf.get_u8() as usize;
        if buf.len() < extra_len {
            bail!("header declares {} extra bytes, but only {} bytes follow", extra_len, buf.len());
        }
        let extra = buf.split_to(extra_len);

        Ok(PacketHeader {
            flags,
            sequence,
            extra,
        })
    }

    /// reads the flags of a serialized datagram without parsing the rest
    pub fn peek_flags(datagram: &[u8]) -> PacketFlags {
        PacketFlags::from_bits_truncate(datagram.get(Self::OFFSET_FLAGS).copied().unwrap_or(0))
    }

    pub fn patch_sequence(datagram: &mut [u8], sequence: u32) {
        datagram[Self::OFFSET_SEQUENCE..Self::OFFSET_SEQUENCE + 4].copy_from_slice(&sequence.to_be_bytes());
    }

    pub fn patch_flags(datagram: &mut [u8], flags: PacketFlags) {
        datagram[Self::OFFSET_FLAGS] = flags.bits();
    }
}
