//! Web server module.

mod auth;
mod envelope;
mod handlers;

use crate::config::ServerConfig;
use crate::db::{Store, TelemetryStore};
use crate::engine::Engine;
use crate::lifecycle::Controller;
use crate::registry::{AdvancedMappingRegistry, MappingRegistry, NodeRegistry};
use crate::scheduler::EventDispatcher;
use crate::telemetry::Aggregator;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<Store>,
    pub engine: Arc<dyn Engine>,
    pub nodes: NodeRegistry,
    pub mappings: MappingRegistry,
    pub advanced: AdvancedMappingRegistry,
    pub controller: Controller,
    pub aggregator: Aggregator,
    pub dispatcher: EventDispatcher,
}

impl AppState {
    /// Wire the registries, controller and aggregator around one store.
    pub fn new(config: ServerConfig, store: Arc<Store>, telemetry: TelemetryStore, engine: Arc<dyn Engine>) -> Self {
        let mappings = MappingRegistry::new(store.clone());
        let controller = Controller::new(store.clone(), engine.clone(), config.lifecycle());
        let aggregator = Aggregator::new(telemetry);
        let dispatcher = EventDispatcher::new(store.clone(), mappings.clone(), controller.clone(), aggregator.clone());

        Self {
            config: Arc::new(config),
            nodes: NodeRegistry::new(store.clone()),
            advanced: AdvancedMappingRegistry::new(store.clone()),
            store,
            engine,
            mappings,
            controller,
            aggregator,
            dispatcher,
        }
    }
}

/// Web server for the meshdeck API.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Serve on the configured port until `shutdown` resolves, then let
    /// in-flight requests finish.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let api = Router::new()
        .route("/stats", get(handlers::handle_stats))
        .route("/stats/traffic", get(handlers::handle_traffic_trend))
        .route("/stats/node-status", get(handlers::handle_node_status))
        // Nodes
        .route("/nodes", get(handlers::handle_list_nodes).post(handlers::handle_create_node))
        .route(
            "/nodes/{name}",
            get(handlers::handle_get_node)
                .put(handlers::handle_update_node)
                .delete(handlers::handle_delete_node),
        )
        .route("/nodes/{name}/performance", get(handlers::handle_node_performance))
        .route("/nodes/{name}/connections", get(handlers::handle_node_connections))
        // Mappings
        .route("/mappings", get(handlers::handle_list_mappings).post(handlers::handle_create_mapping))
        .route(
            "/mappings/{id}",
            get(handlers::handle_get_mapping)
                .put(handlers::handle_update_mapping)
                .delete(handlers::handle_delete_mapping),
        )
        .route("/mappings/{id}/start", post(handlers::handle_start_mapping))
        .route("/mappings/{id}/stop", post(handlers::handle_stop_mapping))
        .route("/mappings/{id}/traffic", get(handlers::handle_mapping_traffic))
        .route("/mappings/{id}/history", get(handlers::handle_mapping_history))
        // Advanced mappings
        .route(
            "/advanced-mappings",
            get(handlers::handle_list_advanced).post(handlers::handle_create_advanced),
        )
        .route(
            "/advanced-mappings/{id}",
            get(handlers::handle_get_advanced)
                .put(handlers::handle_update_advanced)
                .delete(handlers::handle_delete_advanced),
        )
        .route("/advanced-mappings/{id}/start", post(handlers::handle_start_advanced))
        .route("/advanced-mappings/{id}/stop", post(handlers::handle_stop_advanced))
        .route("/advanced-mappings/{id}/test", post(handlers::handle_test_advanced))
        .route("/advanced-mappings/{id}/traffic", get(handlers::handle_advanced_traffic))
        .route("/advanced-mappings/{id}/history", get(handlers::handle_advanced_history))
        .route(
            "/advanced-mappings/{id}/history/export",
            get(handlers::handle_export_advanced_history),
        )
        // Logs
        .route("/logs", get(handlers::handle_list_logs))
        .route("/logs/export", get(handlers::handle_export_logs))
        // Engine push
        .route("/engine/events", post(handlers::handle_engine_events))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .nest("/api", api)
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
