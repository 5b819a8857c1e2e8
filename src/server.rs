//! HTTP front end of the engine, built on axum.
//!
//! # Endpoints
//!
//! - `GET /health` - engine status and corrupted segments
//! - `GET|POST /collections` - list or create collections
//! - `GET|DELETE /collections/:name` - describe or drop a collection
//! - `POST /collections/:name/vectors[/batch|/upsert]` - write records
//! - `GET|DELETE /collections/:name/vectors/:id` - read or delete a record
//! - `GET /collections/:name/count` - live record count
//! - `POST /collections/:name/query` - nearest neighbour search
//! - `POST /collections/:name/seal` - seal the active segment
//! - `POST /collections/:name/compact` - start a background compaction

pub mod model;
pub mod routes;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;

use crate::engine::Engine;
use crate::error::{QuiverError, Result};

/// Build the router over a running engine.
pub fn create_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route(
            "/collections",
            get(routes::list_collections).post(routes::create_collection),
        )
        .route(
            "/collections/:name",
            get(routes::get_collection).delete(routes::drop_collection),
        )
        .route("/collections/:name/vectors", post(routes::add_vector))
        .route("/collections/:name/vectors/batch", post(routes::add_batch))
        .route(
            "/collections/:name/vectors/upsert",
            post(routes::upsert_vectors),
        )
        .route(
            "/collections/:name/vectors/:id",
            get(routes::get_vector).delete(routes::delete_vector),
        )
        .route("/collections/:name/count", get(routes::count))
        .route("/collections/:name/query", post(routes::query))
        .route("/collections/:name/seal", post(routes::seal))
        .route("/collections/:name/compact", post(routes::compact))
        .with_state(engine)
}

/// Bind a listener on `host:port`. Port 0 picks a free port.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| QuiverError::other(format!("cannot bind {host}:{port}: {e}")))
}

/// Serve requests on `listener` until `shutdown` resolves.
pub async fn serve<F>(engine: Arc<Engine>, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listener.local_addr()?;
    log::info!("Listening on http://{addr}");

    axum::serve(listener, create_router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;

    log::info!("Server on {addr} shut down");
    Ok(())
}
