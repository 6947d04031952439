use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use bytes::{Bytes, BytesMut};
use uuid::Uuid;
use crate::wire::control_messages::{ControlMessage, UseCircuitCode};
use crate::wire::framer::{append_acks, frame_message, OutboundMessage};
use crate::wire::packet_header::{PacketFlags, PacketHeader};

/// convenience for test code: the same number gives the same address, different numbers
///  different addresses
pub fn test_addr_from_number(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}

/// Frames a single-datagram message the way a client would send it
pub fn client_datagram(msg: &OutboundMessage, sequence: u32, flags: PacketFlags, acks: &[u32]) -> Bytes {
    let framed = frame_message(msg, flags.contains(PacketFlags::RELIABLE), 1400)
        .expect("test message should be valid");
    assert_eq!(framed.len(), 1, "test message should fit into a single datagram");

    let mut datagram = BytesMut::from(framed[0].as_ref());
    PacketHeader::patch_sequence(&mut datagram, sequence);
    let flags = PacketHeader::peek_flags(&datagram) | flags;
    PacketHeader::patch_flags(&mut datagram, flags);
    append_acks(&mut datagram, acks, 1400);
    datagram.freeze()
}

pub fn control_datagram(msg: &ControlMessage, sequence: u32, flags: PacketFlags) -> Bytes {
    client_datagram(&OutboundMessage::control(msg), sequence, flags, &[])
}

/// a reliable circuit setup request
pub fn use_circuit_code_datagram(sequence: u32, circuit_code: u32, session_id: Uuid, agent_id: Uuid) -> Bytes {
    control_datagram(
        &ControlMessage::UseCircuitCode(UseCircuitCode { circuit_code, session_id, agent_id }),
        sequence,
        PacketFlags::RELIABLE,
    )
}
