// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP + SSE surface over the session engine.
//!
//! JSON in/out on every route; `GET /event` streams every bus event as
//! Server-Sent Events.  Errors respond `{type, error: {type, message}}`
//! with the §7 kind in both `type` fields.
mod error;
mod routes;

pub use error::ApiError;
pub use routes::router;

use std::sync::Arc;

use nils_core::Engine;

/// Serve the API until `shutdown` resolves.
pub async fn serve(
    engine: Arc<Engine>,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
