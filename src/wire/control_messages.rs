use anyhow::bail;
use bytes::{Buf, BufMut};
use uuid::Uuid;
use crate::throttles::ThrottleRates;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::message_id::MessageId;

/// Circuit setup request: the first message a client sends on a new circuit
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UseCircuitCode {
    pub circuit_code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}
impl UseCircuitCode {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.circuit_code);
        buf.put_slice(self.session_id.as_bytes());
        buf.put_slice(self.agent_id.as_bytes());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<UseCircuitCode> {
        let circuit_code = buf.try_get_u32_le()?;
        let session_id = Uuid::from_u128(buf.try_get_u128()?);
        let agent_id = Uuid::from_u128(buf.try_get_u128()?);
        Ok(UseCircuitCode {
            circuit_code,
            session_id,
            agent_id,
        })
    }
}

/// Standalone acknowledgement of received reliable packets
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacketAck {
    pub sequences: Vec<u32>,
}
impl PacketAck {
    pub const MAX_ACKS: usize = u8::MAX as usize;

    pub fn serialized_len(num_acks: usize) -> usize {
        1 + 4 * num_acks
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.sequences.len().prechecked_cast());
        for &seq in &self.sequences {
            buf.put_u32_le(seq);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketAck> {
        let count = buf.try_get_u8()? as usize;
        if buf.remaining() < 4 * count {
            bail!("ack message declares {} acks, but has room for only {}", count, buf.remaining() / 4);
        }
        let mut sequences = Vec::with_capacity(count);
        for _ in 0..count {
            sequences.push(buf.get_u32_le());
        }
        Ok(PacketAck { sequences })
    }
}

/// Ping request. `oldest_unacked` lets the peer drop bookkeeping for older packets.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StartPingCheck {
    pub ping_id: u8,
    pub oldest_unacked: u32,
}
impl StartPingCheck {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ping_id);
        buf.put_u32_le(self.oldest_unacked);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<StartPingCheck> {
        let ping_id = buf.try_get_u8()?;
        let oldest_unacked = buf.try_get_u32_le()?;
        Ok(StartPingCheck { ping_id, oldest_unacked })
    }
}

/// Ping response, echoing the request's id
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}
impl CompletePingCheck {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ping_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<CompletePingCheck> {
        Ok(CompletePingCheck { ping_id: buf.try_get_u8()? })
    }
}

/// Throttle negotiation: a length-prefixed block of packed category rates
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AgentThrottle {
    pub rates: ThrottleRates,
}
impl AgentThrottle {
    pub fn ser(&self, multiplier: f32, buf: &mut impl BufMut) {
        buf.put_u8(ThrottleRates::PACKED_LEN.prechecked_cast());
        self.rates.ser_packed(multiplier, buf);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AgentThrottle> {
        let len = buf.try_get_u8()? as usize;
        if len < ThrottleRates::PACKED_LEN || buf.remaining() < len {
            bail!("throttle block of {} bytes (with {} remaining) is too short", len, buf.remaining());
        }
        let rates = ThrottleRates::deser_packed(buf)?;
        buf.advance(len - ThrottleRates::PACKED_LEN);
        Ok(AgentThrottle { rates })
    }
}

/// The protocol control messages the transport handles itself instead of dispatching them
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    UseCircuitCode(UseCircuitCode),
    PacketAck(PacketAck),
    StartPingCheck(StartPingCheck),
    CompletePingCheck(CompletePingCheck),
    AgentThrottle(AgentThrottle),
    CloseCircuit,
}

impl ControlMessage {
    /// Parses the body of a control message. Returns `Ok(None)` for application messages.
    pub fn deser(message_id: MessageId, buf: &mut impl Buf) -> anyhow::Result<Option<ControlMessage>> {
        let msg = match message_id {
            MessageId::USE_CIRCUIT_CODE => ControlMessage::UseCircuitCode(UseCircuitCode::deser(buf)?),
            MessageId::PACKET_ACK => ControlMessage::PacketAck(PacketAck::deser(buf)?),
            MessageId::START_PING_CHECK => ControlMessage::StartPingCheck(StartPingCheck::deser(buf)?),
            MessageId::COMPLETE_PING_CHECK => ControlMessage::CompletePingCheck(CompletePingCheck::deser(buf)?),
            MessageId::AGENT_THROTTLE => ControlMessage::AgentThrottle(AgentThrottle::deser(buf)?),
            MessageId::CLOSE_CIRCUIT => ControlMessage::CloseCircuit,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    pub fn message_id(&self) -> MessageId {
        match self {
            ControlMessage::UseCircuitCode(_) => MessageId::USE_CIRCUIT_CODE,
            ControlMessage::PacketAck(_) => MessageId::PACKET_ACK,
            ControlMessage::StartPingCheck(_) => MessageId::START_PING_CHECK,
            ControlMessage::CompletePingCheck(_) => MessageId::COMPLETE_PING_CHECK,
            ControlMessage::AgentThrottle(_) => MessageId::AGENT_THROTTLE,
            ControlMessage::CloseCircuit => MessageId::CLOSE_CIRCUIT,
        }
    }

    /// serializes the body, i.e. without the message id
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            ControlMessage::UseCircuitCode(m) => m.ser(buf),
            ControlMessage::PacketAck(m) => m.ser(buf),
            ControlMessage::StartPingCheck(m) => m.ser(buf),
            ControlMessage::CompletePingCheck(m) => m.ser(buf),
            ControlMessage::AgentThrottle(m) => m.ser(1.0, buf),
            ControlMessage::CloseCircuit => {}
        }
    }
}
