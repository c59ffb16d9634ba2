//! HTTP API server wiring for the server lifecycle system.
//!
//! Every dependency is constructed here at startup and handed to the
//! services by parameter: storage, bus, relay, scanner, consumer groups,
//! and the external-boundary implementations. No global registries.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use bus::{InMemoryBus, InMemoryDedupGuard, Relay, RelayHandle};
use metrics_exporter_prometheus::PrometheusHandle;
use services::{
    CheckoutService, ConsumerSet, ExpiryScanner, InMemoryNotifier, InMemoryPaymentGateway,
    InMemoryProvisioner, NotifyService, ProvisioningService, ScannerHandle, start_consumers,
};
use store::{MemoryStorage, Storage};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::resources::AppState;

/// Provisioning service over the default in-memory stack.
pub type DefaultProvisioningService =
    ProvisioningService<MemoryStorage, InMemoryProvisioner, InMemoryDedupGuard>;

/// Notify service over the default in-memory stack.
pub type DefaultNotifyService = NotifyService<MemoryStorage, InMemoryNotifier, InMemoryDedupGuard>;

/// The external-boundary doubles behind the default state, exposed so
/// tests can steer and inspect them.
pub struct Mocks {
    pub payments: InMemoryPaymentGateway,
    pub provisioner: InMemoryProvisioner,
    pub notifier: InMemoryNotifier,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Storage + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/resources", post(routes::resources::request::<S>))
        .route("/resources/{id}", get(routes::resources::get::<S>))
        .route(
            "/payments/callback",
            post(routes::resources::payment_callback::<S>),
        )
        .route("/instances/{id}/details", get(routes::instances::details::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the default application state over in-memory storage and mock
/// external boundaries.
pub fn create_default_state(
    storage: MemoryStorage,
) -> (
    Arc<AppState<MemoryStorage>>,
    Arc<DefaultProvisioningService>,
    Arc<DefaultNotifyService>,
    Mocks,
) {
    let payments = InMemoryPaymentGateway::default();
    let provisioner = InMemoryProvisioner::new();
    let notifier = InMemoryNotifier::new();

    let checkout = CheckoutService::new(storage.clone(), payments.clone());
    let provisioning = Arc::new(ProvisioningService::new(
        storage.clone(),
        provisioner.clone(),
        InMemoryDedupGuard::new(),
    ));
    let notify = Arc::new(NotifyService::new(
        storage.clone(),
        notifier.clone(),
        InMemoryDedupGuard::new(),
    ));

    let state = Arc::new(AppState {
        checkout,
        provisioning: provisioning.clone(),
        storage,
    });

    (
        state,
        provisioning,
        notify,
        Mocks {
            payments,
            provisioner,
            notifier,
        },
    )
}

/// Background workers behind one shutdown sequence.
pub struct Workers {
    relay: RelayHandle,
    scanner: ScannerHandle,
    consumers: ConsumerSet,
}

impl Workers {
    /// Stops everything: scanner first (no new batches), then the relay
    /// (drains staged messages), then the consumers.
    pub async fn shutdown(self) {
        self.scanner.shutdown().await;
        self.relay.shutdown().await;
        self.consumers.shutdown().await;
    }
}

/// Subscribes the consumers and spawns the relay and expiry scanner.
pub async fn start_workers(
    storage: MemoryStorage,
    bus: InMemoryBus,
    provisioning: Arc<DefaultProvisioningService>,
    notify: Arc<DefaultNotifyService>,
    config: &Config,
) -> Workers {
    // Consumers subscribe before the relay publishes anything.
    let consumers = start_consumers(&bus, provisioning.clone(), notify).await;

    let relay = Relay::new(storage, bus)
        .with_poll_interval(config.relay_poll)
        .spawn();

    let scanner = ExpiryScanner::new(provisioning)
        .with_interval(config.scan_interval)
        .spawn();

    Workers {
        relay,
        scanner,
        consumers,
    }
}
