//! Payment gateway trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ServiceError;

/// A started checkout session at the payment provider.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    /// The provider's session reference; payment confirmations carry it.
    pub session_ref: String,
    /// Where to redirect the customer to pay.
    pub redirect_url: String,
}

/// Trait for the external payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Starts a checkout session for the given package.
    async fn start_session(
        &self,
        hours_requested: u32,
        customer_contact: &str,
    ) -> Result<CheckoutSession, ServiceError>;

    /// Verifies a completion webhook and extracts the session reference.
    ///
    /// Fails closed: any signature mismatch is
    /// [`ServiceError::SignatureRejected`], regardless of the body.
    fn verify_completion(&self, payload: &[u8], signature: &str)
    -> Result<String, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    sessions: HashMap<String, (u32, String)>,
    next_id: u32,
    fail_on_start: bool,
}

/// In-memory payment gateway for testing.
///
/// Webhook bodies are JSON `{"session_ref": "..."}` and the signature is a
/// shared secret compared verbatim, standing in for a real provider's HMAC
/// scheme.
#[derive(Debug, Clone)]
pub struct InMemoryPaymentGateway {
    secret: String,
    state: Arc<RwLock<InMemoryGatewayState>>,
}

#[derive(Deserialize)]
struct CompletionBody {
    session_ref: String,
}

impl InMemoryPaymentGateway {
    /// Creates a gateway with the given webhook signing secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            state: Arc::new(RwLock::new(InMemoryGatewayState::default())),
        }
    }

    /// Configures the gateway to fail session creation transiently.
    pub fn set_fail_on_start(&self, fail: bool) {
        self.state.write().unwrap().fail_on_start = fail;
    }

    /// Returns the number of started sessions.
    pub fn session_count(&self) -> usize {
        self.state.read().unwrap().sessions.len()
    }

    /// Builds a completion webhook body for a session reference.
    pub fn completion_body(session_ref: &str) -> Vec<u8> {
        serde_json::json!({ "session_ref": session_ref })
            .to_string()
            .into_bytes()
    }

    /// The signature a valid webhook carries.
    pub fn valid_signature(&self) -> &str {
        &self.secret
    }
}

impl Default for InMemoryPaymentGateway {
    fn default() -> Self {
        Self::new("test-webhook-secret")
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn start_session(
        &self,
        hours_requested: u32,
        customer_contact: &str,
    ) -> Result<CheckoutSession, ServiceError> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_start {
            return Err(ServiceError::TransientUpstream {
                service: "payment gateway",
                reason: "session endpoint unavailable".to_string(),
            });
        }

        state.next_id += 1;
        let session_ref = format!("cs_test_{:04}", state.next_id);
        state.sessions.insert(
            session_ref.clone(),
            (hours_requested, customer_contact.to_string()),
        );

        Ok(CheckoutSession {
            redirect_url: format!("https://pay.example.com/c/{session_ref}"),
            session_ref,
        })
    }

    fn verify_completion(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<String, ServiceError> {
        if signature != self.secret {
            return Err(ServiceError::SignatureRejected);
        }

        let body: CompletionBody = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::MalformedWebhook(e.to_string()))?;

        Ok(body.session_ref)
    }
}
