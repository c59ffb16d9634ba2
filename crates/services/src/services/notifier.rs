//! Notification boundary trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::ServiceError;

/// A transactional message sent to a customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub template_id: u32,
    pub params: HashMap<String, String>,
}

/// Trait for the transactional mail/message provider.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a templated message to a recipient.
    async fn send(
        &self,
        recipient: &str,
        template_id: u32,
        params: HashMap<String, String>,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    sent: Vec<SentMessage>,
    fail_on_send: bool,
}

/// In-memory notifier for testing; records every sent message.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotifier {
    state: Arc<RwLock<InMemoryNotifierState>>,
}

impl InMemoryNotifier {
    /// Creates a new in-memory notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the notifier to fail sends transiently.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.state.write().unwrap().fail_on_send = fail;
    }

    /// Returns the number of messages sent.
    pub fn sent_count(&self) -> usize {
        self.state.read().unwrap().sent.len()
    }

    /// Returns copies of all sent messages.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.read().unwrap().sent.clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(
        &self,
        recipient: &str,
        template_id: u32,
        params: HashMap<String, String>,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_send {
            return Err(ServiceError::TransientUpstream {
                service: "notifier",
                reason: "mail API unavailable".to_string(),
            });
        }

        state.sent.push(SentMessage {
            recipient: recipient.to_string(),
            template_id,
            params,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_records_the_message() {
        let notifier = InMemoryNotifier::new();
        let mut params = HashMap::new();
        params.insert("hoursReserved".to_string(), "3".to_string());

        notifier
            .send("user@example.com", 1, params.clone())
            .await
            .unwrap();

        assert_eq!(notifier.sent_count(), 1);
        let sent = notifier.sent();
        assert_eq!(sent[0].recipient, "user@example.com");
        assert_eq!(sent[0].template_id, 1);
        assert_eq!(sent[0].params, params);
    }

    #[tokio::test]
    async fn fail_on_send_is_transient() {
        let notifier = InMemoryNotifier::new();
        notifier.set_fail_on_send(true);

        let err = notifier
            .send("user@example.com", 1, HashMap::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(notifier.sent_count(), 0);
    }
}
