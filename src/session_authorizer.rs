use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use uuid::Uuid;
use crate::throttles::ThrottleRates;

/// What the authorizer knows about an authorized session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
    /// category rates to start the connection with instead of the configured defaults
    pub initial_rates: Option<ThrottleRates>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizationResult {
    Authorized(SessionInfo),
    Denied,
}

/// Checks a circuit setup request against the sessions issued by the login service
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionAuthorizer: Send + Sync + 'static {
    async fn authorize(&self, session_id: Uuid, agent_id: Uuid, circuit_code: u32) -> AuthorizationResult;
}
