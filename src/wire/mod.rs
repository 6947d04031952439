pub mod control_messages;
pub mod framer;
pub mod message_id;
pub mod packet_header;
pub mod zero_code;
