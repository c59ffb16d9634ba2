//! External collaborator boundaries and their in-memory test doubles.

pub mod notifier;
pub mod payment;
pub mod provisioner;

pub use notifier::{InMemoryNotifier, Notifier, SentMessage};
pub use payment::{CheckoutSession, InMemoryPaymentGateway, PaymentGateway};
pub use provisioner::{InMemoryProvisioner, InstanceDetails, Provisioner};
