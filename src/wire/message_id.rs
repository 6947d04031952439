use std::fmt::{Debug, Display, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut};

/// Message type identifier. The wire encoding length depends on the frequency class: frequent
///  messages get short ids.
///
/// ```ascii
/// High:   n                  (n < 0xFF)
/// Medium: 0xFF n             (n < 0xFF)
/// Low:    0xFF 0xFF hi lo
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageId {
    High(u8),
    Medium(u8),
    Low(u16),
}

impl MessageId {
    pub const START_PING_CHECK: MessageId = MessageId::High(1);
    pub const COMPLETE_PING_CHECK: MessageId = MessageId::High(2);
    /// terrain patches: these are packed to fill a datagram and can not be split
    pub const LAYER_DATA: MessageId = MessageId::High(11);
    pub const USE_CIRCUIT_CODE: MessageId = MessageId::Low(3);
    pub const AGENT_THROTTLE: MessageId = MessageId::Low(81);
    pub const PACKET_ACK: MessageId = MessageId::Low(0xFFFB);
    pub const CLOSE_CIRCUIT: MessageId = MessageId::Low(0xFFFD);

    const ESCAPE: u8 = 0xFF;

    pub fn encoded_len(&self) -> usize {
        match self {
            MessageId::High(_) => 1,
            MessageId::Medium(_) => 2,
            MessageId::Low(_) => 4,
        }
    }

    /// Determines the encoded length from the leading bytes, without consuming them. Returns
    ///  `None` if `buf` is too short to tell.
    pub fn peek_encoded_len(buf: &[u8]) -> Option<usize> {
        match buf {
            [] => None,
            [Self::ESCAPE] => None,
            [Self::ESCAPE, Self::ESCAPE, ..] => Some(4),
            [Self::ESCAPE, ..] => Some(2),
            _ => Some(1),
        }
    }

    pub fn is_splittable(&self) -> bool {
        *self != Self::LAYER_DATA
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match *self {
            MessageId::High(n) => buf.put_u8(n),
            MessageId::Medium(n) => {
                buf.put_u8(Self::ESCAPE);
                buf.put_u8(n);
            }
            MessageId::Low(n) => {
                buf.put_u8(Self::ESCAPE);
                buf.put_u8(Self::ESCAPE);
                buf.put_u16(n);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
        let first = buf.try_get_u8()?;
        if first != Self::ESCAPE {
            return Ok(MessageId::High(first));
        }
        let second = buf.try_get_u8()?;
        if second != Self::ESCAPE {
            return Ok(MessageId::Medium(second));
        }
        Ok(MessageId::Low(buf.try_get_u16()?))
    }

    /// checks that the id can be encoded unambiguously
    pub fn validate(&self) -> anyhow::Result<()> {
        match *self {
            MessageId::High(Self::ESCAPE) | MessageId::Medium(Self::ESCAPE) => bail!("{} collides with the escape byte", self),
            _ => Ok(()),
        }
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::High(n) => write!(f, "H{}", n),
            MessageId::Medium(n) => write!(f, "M{}", n),
            MessageId::Low(n) => write!(f, "L{}", n),
        }
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
