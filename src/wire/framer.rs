use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::control_messages::ControlMessage;
use crate::wire::message_id::MessageId;
use crate::wire::packet_header::{PacketFlags, PacketHeader};
use crate::wire::zero_code;

/// An application (or control) message before framing: message id plus serialized body
#[derive(Clone, Eq, PartialEq)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub payload: Bytes,
    /// zero-code the message if that makes it shorter
    pub zero_coded: bool,
}

impl Debug for OutboundMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSG{{{}:{}{}}}", self.message_id, self.payload.len(), if self.zero_coded { ":Z" } else { "" })
    }
}

impl OutboundMessage {
    pub fn new(message_id: MessageId, payload: impl Into<Bytes>) -> OutboundMessage {
        OutboundMessage {
            message_id,
            payload: payload.into(),
            zero_coded: false,
        }
    }

    pub fn zero_coded(mut self) -> OutboundMessage {
        self.zero_coded = true;
        self
    }

    pub fn control(msg: &ControlMessage) -> OutboundMessage {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        OutboundMessage::new(msg.message_id(), buf.freeze())
    }
}

/// A parsed inbound datagram
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub header: PacketHeader,
    pub message_id: MessageId,
    pub payload: Bytes,
    pub appended_acks: Vec<u32>,
}

impl InboundPacket {
    pub fn is_reliable(&self) -> bool {
        self.header.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_resent(&self) -> bool {
        self.header.flags.contains(PacketFlags::RESENT)
    }
}

/// 6 bytes of header prefix plus a one-byte message id
pub const MIN_DATAGRAM_LEN: usize = PacketHeader::PREFIX_LEN + 1;

/// maximum number of ACKs that can be appended to a datagram
pub const MAX_APPENDED_ACKS: usize = u8::MAX as usize;

/// Upper bound for the decoded size of a zero-coded datagram, relative to the MTU
pub const ZERO_CODE_EXPANSION_LIMIT: usize = 8;

/// Frames a message into one or more datagrams of at most `mtu` bytes each. The sequence number is
///  left at 0: it is assigned when the datagram is actually sent.
///
/// A message that does not fit into a single datagram is split into fragments, each carrying the
///  message id and a consecutive slice of the payload. Messages whose type does not allow
///  splitting are rejected if they are too big.
pub fn frame_message(msg: &OutboundMessage, reliable: bool, mtu: usize) -> anyhow::Result<Vec<Bytes>> {
    msg.message_id.validate()?;

    let id_len = msg.message_id.encoded_len();
    let Some(max_chunk) = mtu.checked_sub(PacketHeader::PREFIX_LEN + id_len).filter(|&n| n > 0) else {
        bail!("MTU {} leaves no room for a payload", mtu);
    };

    if msg.payload.len() > max_chunk && !msg.message_id.is_splittable() {
        bail!("message {} has {} bytes, but can not be split and only {} fit into a datagram", msg.message_id, msg.payload.len(), max_chunk);
    }

    let flags = if reliable { PacketFlags::RELIABLE } else { PacketFlags::empty() };
    if msg.payload.is_empty() {
        return Ok(vec![frame_chunk(msg.message_id, &[], flags, msg.zero_coded)]);
    }

    Ok(msg.payload
        .chunks(max_chunk)
        .map(|chunk| frame_chunk(msg.message_id, chunk, flags, msg.zero_coded))
        .collect())
}

fn frame_chunk(message_id: MessageId, chunk: &[u8], flags: PacketFlags, zero_coded: bool) -> Bytes {
    let raw_body_len = message_id.encoded_len() + chunk.len();
    let mut buf = BytesMut::with_capacity(PacketHeader::PREFIX_LEN + raw_body_len);

    let mut body = BytesMut::with_capacity(raw_body_len);
    message_id.ser(&mut body);
    body.put_slice(chunk);

    if zero_coded && zero_code::encoded_len(&body) < body.len() {
        PacketHeader::new(flags | PacketFlags::ZEROCODED, 0).ser(&mut buf);
        zero_code::encode(&body, &mut buf);
    }
    else {
        PacketHeader::new(flags, 0).ser(&mut buf);
        buf.put_slice(&body);
    }
    buf.freeze()
}

/// Appends as many of `acks` as fit into the datagram (and at most [MAX_APPENDED_ACKS]), setting
///  the APPENDED_ACKS flag if any were appended. Returns the number of appended ACKs, which are
///  the first ones from `acks`.
pub fn append_acks(datagram: &mut BytesMut, acks: &[u32], mtu: usize) -> usize {
    let room = mtu.saturating_sub(datagram.len() + 1) / 4;
    let num_acks = acks.len().min(room).min(MAX_APPENDED_ACKS);
    if num_acks == 0 {
        return 0;
    }

    for &seq in &acks[..num_acks] {
        datagram.put_u32(seq);
    }
    datagram.put_u8(num_acks.prechecked_cast());

    let flags = PacketHeader::peek_flags(datagram) | PacketFlags::APPENDED_ACKS;
    PacketHeader::patch_flags(datagram, flags);
    num_acks
}

/// Parses a datagram. Appended ACKs are stripped from the end, a zero-coded body is decoded,
///  and the message id is parsed. Anything inconsistent is an error.
pub fn parse_datagram(mut datagram: Bytes, mtu: usize) -> anyhow::Result<InboundPacket> {
    if datagram.len() < MIN_DATAGRAM_LEN {
        bail!("datagram of {} bytes is shorter than the minimum of {}", datagram.len(), MIN_DATAGRAM_LEN);
    }

    let flags = PacketHeader::peek_flags(&datagram);
    let mut appended_acks = Vec::new();
    if flags.contains(PacketFlags::APPENDED_ACKS) {
        let num_acks = datagram[datagram.len() - 1] as usize;
        let trailer_len = 4 * num_acks + 1;
        if datagram.len() < MIN_DATAGRAM_LEN + trailer_len {
            bail!("datagram of {} bytes is too short for {} appended acks", datagram.len(), num_acks);
        }
        let mut trailer = datagram.split_off(datagram.len() - trailer_len);
        appended_acks.reserve(num_acks);
        for _ in 0..num_acks {
            appended_acks.push(trailer.get_u32());
        }
    }

    let header = PacketHeader::deser(&mut datagram)?;

    let mut body = if header.flags.contains(PacketFlags::ZEROCODED) {
        let mut decoded = Vec::with_capacity(datagram.len() * 2);
        zero_code::decode(&datagram, ZERO_CODE_EXPANSION_LIMIT * mtu, &mut decoded)?;
        Bytes::from(decoded)
    }
    else {
        datagram
    };

    match MessageId::peek_encoded_len(&body) {
        Some(id_len) if id_len <= body.len() => {}
        _ => bail!("datagram body of {} bytes is shorter than its message id", body.len()),
    }
    let message_id = MessageId::deser(&mut body)?;

    Ok(InboundPacket {
        header,
        message_id,
        payload: body,
        appended_acks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 200) as u8 + 1).collect::<Vec<u8>>().into()
    }

    #[rstest]
    #[case::empty(MessageId::High(5), 0, 1)]
    #[case::small(MessageId::High(5), 50, 1)]
    #[case::exactly_fits(MessageId::High(5), 1400 - 7, 1)]
    #[case::one_more(MessageId::High(5), 1400 - 6, 2)]
    #[case::three_fragments(MessageId::Low(300), 3000, 3)]
    fn test_frame_message(#[case] id: MessageId, #[case] len: usize, #[case] expected_fragments: usize) {
        let msg = OutboundMessage::new(id, payload(len));
        let fragments = frame_message(&msg, true, 1400).unwrap();
        assert_eq!(fragments.len(), expected_fragments);

        let mut reassembled = Vec::new();
        for fragment in fragments {
            assert!(fragment.len() <= 1400);
            let parsed = parse_datagram(fragment, 1400).unwrap();
            assert!(parsed.is_reliable());
            assert_eq!(parsed.header.sequence, 0);
            assert_eq!(parsed.message_id, id);
            reassembled.extend_from_slice(&parsed.payload);
        }
        assert_eq!(Bytes::from(reassembled), msg.payload);
    }

    #[test]
    fn test_unsplittable_too_big() {
        let msg = OutboundMessage::new(MessageId::LAYER_DATA, payload(1400));
        assert!(frame_message(&msg, false, 1400).is_err());

        let msg = OutboundMessage::new(MessageId::LAYER_DATA, payload(1393));
        assert_eq!(frame_message(&msg, false, 1400).unwrap().len(), 1);
    }

    #[test]
    fn test_escape_id_rejected() {
        let msg = OutboundMessage::new(MessageId::High(0xFF), payload(1));
        assert!(frame_message(&msg, false, 1400).is_err());
    }

    #[rstest]
    #[case::compressible(vec![0u8; 100], true)]
    #[case::incompressible(vec![1u8, 0, 2, 0, 3], false)]
    fn test_zero_coded(#[case] raw: Vec<u8>, #[case] expected_zero_coded: bool) {
        let msg = OutboundMessage::new(MessageId::Medium(9), raw.clone()).zero_coded();
        let fragments = frame_message(&msg, false, 1400).unwrap();
        assert_eq!(fragments.len(), 1);
        let flags = PacketHeader::peek_flags(&fragments[0]);
        assert_eq!(flags.contains(PacketFlags::ZEROCODED), expected_zero_coded);
        if expected_zero_coded {
            assert!(fragments[0].len() < PacketHeader::PREFIX_LEN + 2 + raw.len());
        }

        let parsed = parse_datagram(fragments[0].clone(), 1400).unwrap();
        assert_eq!(parsed.message_id, MessageId::Medium(9));
        assert_eq!(parsed.payload.as_ref(), raw.as_slice());
    }

    #[test]
    fn test_zero_coded_split_fragments_fit() {
        // zero coding would expand this payload, so it is skipped
        let raw: Vec<u8> = (0..3000).map(|i| if i % 2 == 0 { 0 } else { 1 }).collect();
        let msg = OutboundMessage::new(MessageId::High(20), raw.clone()).zero_coded();
        let fragments = frame_message(&msg, true, 1400).unwrap();

        let mut reassembled = Vec::new();
        for fragment in fragments {
            assert!(fragment.len() <= 1400);
            reassembled.extend_from_slice(&parse_datagram(fragment, 1400).unwrap().payload);
        }
        assert_eq!(reassembled, raw);
    }

    #[rstest]
    #[case::none(50, 0, 0)]
    #[case::some(50, 3, 3)]
    #[case::capped_at_255(50, 400, 255)]
    #[case::capped_by_mtu(1380, 10, 3)]
    #[case::no_room(1393, 10, 0)]
    fn test_append_acks(#[case] payload_len: usize, #[case] num_acks: usize, #[case] expected: usize) {
        let msg = OutboundMessage::new(MessageId::High(5), payload(payload_len));
        let mut datagram = BytesMut::from(frame_message(&msg, true, 1400).unwrap()[0].as_ref());
        let acks: Vec<u32> = (1..=num_acks as u32).collect();

        assert_eq!(append_acks(&mut datagram, &acks, 1400), expected);
        assert!(datagram.len() <= 1400);

        let parsed = parse_datagram(datagram.freeze(), 1400).unwrap();
        assert_eq!(parsed.appended_acks, acks[..expected].to_vec());
        assert_eq!(parsed.header.flags.contains(PacketFlags::APPENDED_ACKS), expected > 0);
        assert_eq!(parsed.payload, msg.payload);
    }

    #[test]
    fn test_appended_acks_after_zero_coded_body() {
        let msg = OutboundMessage::new(MessageId::High(5), vec![0u8; 300]).zero_coded();
        let mut datagram = BytesMut::from(frame_message(&msg, true, 1400).unwrap()[0].as_ref());
        append_acks(&mut datagram, &[0, 0x0100], 1400);

        let parsed = parse_datagram(datagram.freeze(), 1400).unwrap();
        assert_eq!(parsed.appended_acks, vec![0, 0x0100]);
        assert_eq!(parsed.payload.as_ref(), &[0u8; 300][..]);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::too_short(vec![0, 0, 0, 0, 1, 0])]
    #[case::extra_beyond_end(vec![0, 0, 0, 0, 1, 5, 1, 2])]
    #[case::missing_id(vec![0, 0, 0, 0, 1, 1, 9, 0xFF])]
    #[case::truncated_low_id(vec![0, 0, 0, 0, 1, 0, 0xFF, 0xFF, 1])]
    #[case::ack_trailer_too_long(vec![0x08, 0, 0, 0, 1, 0, 5, 1, 2, 3, 4, 9])]
    #[case::bad_zero_code(vec![0x04, 0, 0, 0, 1, 0, 5, 0, 0])]
    #[case::zero_code_bomb(vec![0x04, 0, 0, 0, 1, 0, 5, 0, 255, 0, 255, 0, 255, 0, 255, 0, 255])]
    fn test_parse_malformed(#[case] raw: Vec<u8>) {
        assert!(parse_datagram(Bytes::from(raw), 128).is_err());
    }

    #[test]
    fn test_control_message_framing() {
        let ack = ControlMessage::PacketAck(crate::wire::control_messages::PacketAck { sequences: vec![3, 4] });
        let fragments = frame_message(&OutboundMessage::control(&ack), false, 1400).unwrap();
        let parsed = parse_datagram(fragments[0].clone(), 1400).unwrap();
        assert_eq!(parsed.message_id, MessageId::PACKET_ACK);

        let mut payload = parsed.payload;
        assert_eq!(ControlMessage::deser(parsed.message_id, &mut payload).unwrap(), Some(ack));
    }
}
