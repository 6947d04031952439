use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use crate::events::ConnectionId;
use crate::wire::message_id::MessageId;

/// An accepted inbound application message, i.e. not a duplicate and not a protocol control
///  message
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub payload: Bytes,
    pub sequence: u32,
    pub reliable: bool,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, connection_id: ConnectionId, message: InboundMessage);
}
