use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::Bytes;
use tokio::time::Instant;
use crate::category::ThrottleCategory;
use crate::wire::packet_header::{PacketFlags, PacketHeader};

/// Called instead of the regular resend when a reliable packet was not acknowledged in time.
///  The packet is no longer tracked after the call.
pub type UnackedCallback = Arc<dyn Fn(&OutgoingPacket) + Send + Sync>;

/// A framed datagram waiting to be sent or to be acknowledged
#[derive(Clone)]
pub struct OutgoingPacket {
    pub category: ThrottleCategory,
    /// The framed datagram without appended ACKs. Its sequence number is a placeholder until the
    ///  packet is sent for the first time.
    pub buffer: Bytes,
    /// 0 until the packet is sent
    pub sequence: u32,
    pub retries: u32,
    pub first_send: Option<Instant>,
    pub last_send: Option<Instant>,
    pub on_unacked: Option<UnackedCallback>,
}

impl Debug for OutgoingPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OUT{{{}:#{}:{}B", self.category, self.sequence, self.buffer.len())?;
        if self.retries > 0 {
            write!(f, ":retry{}", self.retries)?;
        }
        if self.on_unacked.is_some() {
            write!(f, ":cb")?;
        }
        write!(f, "}}")
    }
}

impl OutgoingPacket {
    pub fn new(category: ThrottleCategory, buffer: Bytes, on_unacked: Option<UnackedCallback>) -> OutgoingPacket {
        OutgoingPacket {
            category,
            buffer,
            sequence: 0,
            retries: 0,
            first_send: None,
            last_send: None,
            on_unacked,
        }
    }

    pub fn flags(&self) -> PacketFlags {
        PacketHeader::peek_flags(&self.buffer)
    }

    pub fn is_reliable(&self) -> bool {
        self.flags().contains(PacketFlags::RELIABLE)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::wire::framer::{frame_message, OutboundMessage};
    use crate::wire::message_id::MessageId;

    #[rstest]
    #[case::reliable(true)]
    #[case::unreliable(false)]
    fn test_is_reliable(#[case] reliable: bool) {
        let buffer = frame_message(&OutboundMessage::new(MessageId::High(4), vec![1, 2, 3]), reliable, 1400).unwrap().remove(0);
        let packet = OutgoingPacket::new(ThrottleCategory::Task, buffer, None);
        assert_eq!(packet.is_reliable(), reliable);
        assert_eq!(packet.len(), 10);
    }

    #[test]
    fn test_debug() {
        let mut packet = OutgoingPacket::new(ThrottleCategory::Land, Bytes::from_static(&[1, 0, 0, 0, 0, 0, 9]), Some(Arc::new(|_: &OutgoingPacket| {})));
        packet.sequence = 5;
        packet.retries = 2;
        assert_eq!(format!("{:?}", packet), "OUT{Land:#5:7B:retry2:cb}");
    }
}
