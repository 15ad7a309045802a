pub mod config;
pub mod error;
pub mod gates;
pub mod gateway;
pub mod resolver;
pub mod routes;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::Router;
use config::Config;
use gates::GateRegistry;
use resolver::TokenResolver;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gates: Arc<GateRegistry>,
    pub resolver: TokenResolver,
    /// Process lifetime; every session scope is a child of it.
    pub shutdown: CancellationToken,
    pub active_sessions: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: Config, gates: GateRegistry) -> Self {
        let resolver = TokenResolver::new(&config.resolver_url);
        Self {
            config: Arc::new(config),
            gates: Arc::new(gates),
            resolver,
            shutdown: CancellationToken::new(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// The full HTTP application wired to `state`.
pub fn app(state: AppState) -> Router {
    routes::router(&state.config)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
