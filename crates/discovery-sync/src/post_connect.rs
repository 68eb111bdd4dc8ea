//! # Post-Connect Publishing
//!
//! While the authenticated channel is being (re)established, a sequence of
//! post-connect operations runs in priority order before normal traffic
//! resumes. Endpoint discovery is one of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::sender::DiscoveryEventSender;
use crate::transport::MessageSender;

/// Ordering slot of endpoint discovery among post-connect operations.
pub const ENDPOINT_DISCOVERY_PRIORITY: u32 = 100;

/// One step of the connection bootstrap.
#[async_trait]
pub trait PostConnectOperation: Send + Sync {
    /// Lower runs earlier.
    fn priority(&self) -> u32;

    /// Runs the step over the bootstrap transport.
    async fn perform_operation(&self, transport: &dyn MessageSender) -> bool;

    /// Abandons the step. May race with `perform_operation`.
    fn abort_operation(&self);
}

/// Publishes the bootstrap discovery delta through one sender.
pub struct PostConnectPublisher {
    sender: Arc<DiscoveryEventSender>,
    performed: AtomicBool,
}

impl PostConnectPublisher {
    pub fn new(sender: Arc<DiscoveryEventSender>) -> Self {
        PostConnectPublisher {
            sender,
            performed: AtomicBool::new(false),
        }
    }

    pub fn sender(&self) -> &Arc<DiscoveryEventSender> {
        &self.sender
    }
}

#[async_trait]
impl PostConnectOperation for PostConnectPublisher {
    fn priority(&self) -> u32 {
        ENDPOINT_DISCOVERY_PRIORITY
    }

    async fn perform_operation(&self, transport: &dyn MessageSender) -> bool {
        if self.performed.swap(true, Ordering::SeqCst) {
            error!("Post-connect discovery already performed");
            return false;
        }

        debug!("Performing post-connect discovery");
        self.sender.send_all(transport).await
    }

    fn abort_operation(&self) {
        debug!("Aborting post-connect discovery");
        self.sender.stop();
    }
}

impl Drop for PostConnectPublisher {
    fn drop(&mut self) {
        self.sender.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ManualCredentialProvider;
    use crate::sender::tests::{config_of_size, ScriptedTransport};
    use discovery_core::EndpointConfigMap;

    fn publisher() -> PostConnectPublisher {
        let mut add = EndpointConfigMap::new();
        add.insert("e1".into(), config_of_size("e1", 64));
        let sender = DiscoveryEventSender::new(
            add,
            EndpointConfigMap::new(),
            Arc::new(ManualCredentialProvider::with_token("token-1")),
            false,
        )
        .unwrap();
        PostConnectPublisher::new(Arc::new(sender))
    }

    #[tokio::test]
    async fn test_perform_runs_once() {
        let publisher = publisher();
        let transport = ScriptedTransport::default();

        assert_eq!(publisher.priority(), ENDPOINT_DISCOVERY_PRIORITY);
        assert!(publisher.perform_operation(&transport).await);
        assert!(!publisher.perform_operation(&transport).await);
        assert_eq!(transport.events().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_before_perform() {
        let publisher = publisher();
        let transport = ScriptedTransport::default();

        publisher.abort_operation();
        publisher.abort_operation();

        assert!(!publisher.perform_operation(&transport).await);
        assert!(transport.events().is_empty());
    }

    #[tokio::test]
    async fn test_drop_stops_sender() {
        let publisher = publisher();
        let sender = publisher.sender().clone();

        drop(publisher);
        assert!(sender.is_stopping());
    }
}
