use async_trait::async_trait;
use common::domain::{DomainResult, PendingCommand};

/// Outbound side of the message transport
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publish a command to its device. Fails with `TransportUnavailable`
    /// when the broker cannot take the message.
    async fn publish_command(&self, command: &PendingCommand) -> DomainResult<()>;
}
