use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use crate::category::ThrottleCategory;
use crate::events::ConnectionId;

/// Notified when outbound category queues of a connection have run empty, so the application
///  can refill them. Calls run on the job engine, never on the outbound loop, and there is at
///  most one call in flight per connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueEmptyHandler: Send + Sync + 'static {
    async fn on_queue_empty(&self, connection_id: ConnectionId, categories: Vec<ThrottleCategory>);
}

/// for applications that do not refill queues on demand
pub struct NoQueueEmptyHandler;

#[async_trait]
impl QueueEmptyHandler for NoQueueEmptyHandler {
    async fn on_queue_empty(&self, _connection_id: ConnectionId, _categories: Vec<ThrottleCategory>) {}
}
