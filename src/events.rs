use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use uuid::Uuid;
use crate::session_authorizer::SessionInfo;
use crate::throttles::RateAdjustment;

/// Connections are identified by the agent they belong to: an agent has at most one connection
pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CloseReason {
    /// the application closed the connection after the agent logged out
    Logout,
    /// nothing was received for longer than the liveness timeout
    Timeout,
    /// the peer sent a close message
    ProtocolClose,
    ProtocolError,
    Administrative,
    /// the agent established a new circuit from a different address
    Superseded,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Logout => write!(f, "logout"),
            CloseReason::Timeout => write!(f, "no packets received"),
            CloseReason::ProtocolClose => write!(f, "closed by peer"),
            CloseReason::ProtocolError => write!(f, "protocol error"),
            CloseReason::Administrative => write!(f, "closed by administrator"),
            CloseReason::Superseded => write!(f, "superseded by a new circuit"),
        }
    }
}

/// Lifecycle notifications, delivered through the channel returned by
///  [TransportEngine::new](crate::engine::TransportEngine::new)
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Established {
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        session: SessionInfo,
    },
    Closed {
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        reason: CloseReason,
    },
    ThrottlesAdjusted {
        connection_id: ConnectionId,
        adjustment: RateAdjustment,
    },
}
