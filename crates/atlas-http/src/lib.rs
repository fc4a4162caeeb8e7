//! HTTP API for Atlas.
//!
//! Provides an [`HttpServer`] exposing the command dispatcher over axum:
//!
//! - `GET /ping`: version and uptime
//! - `GET /api/v1/layers`: the caller's customer record
//! - `POST /api/v1/layer`: create a layer (caller becomes owner)
//! - `GET|DELETE /api/v1/layer/{ds}`: read or delete a layer
//! - `GET /api/v1/layer/{ds}/timestamps`: snapshot timestamps
//! - `GET /api/v1/layer/{ds}/timestamp/{ts}`: layer as of a timestamp
//! - `POST /api/v1/layer/{ds}/feature`: insert a feature
//! - `GET|PUT /api/v1/layer/{ds}/feature/{geo_id}`: read or replace a feature
//! - `GET /api/v1/layer/{ds}/live`: server-sent `layer_changed` events
//! - `POST /management/customer`: issue an access key
//! - `GET /management/customers`: list access keys
//! - `GET /management/datasources`: list every layer
//!
//! ## Authentication
//!
//! - **`/api/v1`**: the `apikey` query parameter names the caller; ownership
//!   is enforced by the dispatcher.
//! - **`/management`**: the `authkey` query parameter must equal the
//!   superuser key (constant-time comparison).
//!
//! Every response carries `Access-Control-Allow-Origin: *`.

mod error;
mod handlers;


use std::sync::Arc;

use atlas_engine::Dispatcher;
use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::HeaderValue;
use axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::warn;

pub use error::HttpError;

/// Shared application state for all handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    /// The command dispatcher.
    pub dispatcher: Arc<Dispatcher>,
    /// Key gating `/management` routes.
    pub superuser_key: Arc<str>,
}

#[derive(Deserialize)]
struct AuthQuery {
    authkey: Option<String>,
}

/// Superuser check for `/management` routes.
async fn superuser_middleware(
    State(state): State<AppState>,
    Query(auth): Query<AuthQuery>,
    request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let authorized = auth
        .authkey
        .is_some_and(|k| k.as_bytes().ct_eq(state.superuser_key.as_bytes()).into());

    if !authorized {
        warn!(path = %request.uri().path(), "rejected management request");
        return Err(HttpError::Unauthorized("invalid authkey".into()));
    }
    Ok(next.run(request).await)
}

/// Allow every origin.
async fn cors_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Configuration for creating an [`HttpServer`].
pub struct HttpServerConfig {
    /// The command dispatcher to serve.
    pub dispatcher: Arc<Dispatcher>,
    /// Superuser key for `/management` routes.
    pub superuser_key: String,
}

/// HTTP server backed by a [`Dispatcher`].
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: HttpServerConfig) -> Self {
        let state = AppState {
            dispatcher: config.dispatcher,
            superuser_key: Arc::from(config.superuser_key),
        };
        Self {
            router: Self::build_router(state),
        }
    }

    /// Build the axum [`Router`].
    fn build_router(state: AppState) -> Router {
        let api_routes = Router::new()
            .route("/api/v1/layers", get(handlers::get_customer))
            .route("/api/v1/layer", post(handlers::create_layer))
            .route(
                "/api/v1/layer/{ds}",
                get(handlers::get_layer).delete(handlers::delete_layer),
            )
            .route("/api/v1/layer/{ds}/timestamps", get(handlers::get_timestamps))
            .route(
                "/api/v1/layer/{ds}/timestamp/{ts}",
                get(handlers::get_snapshot),
            )
            .route("/api/v1/layer/{ds}/feature", post(handlers::insert_feature))
            .route(
                "/api/v1/layer/{ds}/feature/{geo_id}",
                get(handlers::get_feature).put(handlers::edit_feature),
            )
            .route("/api/v1/layer/{ds}/live", get(handlers::live));

        let management_routes = Router::new()
            .route("/management/customer", post(handlers::create_customer))
            .route("/management/customers", get(handlers::list_customers))
            .route("/management/datasources", get(handlers::list_datasources))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                superuser_middleware,
            ));

        Router::new()
            .route("/ping", get(handlers::ping))
            .merge(api_routes)
            .merge(management_routes)
            .layer(middleware::from_fn(cors_middleware))
            .with_state(state)
    }

    /// Return the inner [`Router`] (useful for testing with `tower::ServiceExt`).
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Serve the API on the given TCP address.
    pub async fn serve(self, addr: &str) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "HTTP server listening");
        axum::serve(listener, self.router).await
    }

    /// Serve the API with graceful shutdown triggered by the given future.
    ///
    /// When `shutdown` completes, the server stops accepting new connections
    /// and waits for in-flight requests to finish.
    pub async fn serve_with_shutdown(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "HTTP server listening");
        }
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
