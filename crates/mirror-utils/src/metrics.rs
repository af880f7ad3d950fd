// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! A minimal HTTP endpoint that exposes a Prometheus registry.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{Router, extract::State, http::StatusCode, routing::get};
use prometheus::{Registry, TextEncoder};
use tokio::{net::TcpListener, task::JoinHandle};

/// Route on which the metrics are served.
pub const METRICS_ROUTE: &str = "/metrics";

/// Binds `address` and serves the metrics in `registry` on [`METRICS_ROUTE`].
///
/// Returns the address actually bound (useful when binding port 0) and the handle of the server
/// task.
pub async fn start_prometheus_server(
    address: SocketAddr,
    registry: Registry,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind metrics address {address}"))?;
    let local_address = listener.local_addr()?;

    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics))
        .with_state(registry);

    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(?error, "metrics server stopped");
        }
    });
    tracing::info!(address = %local_address, "started Prometheus HTTP endpoint");

    Ok((local_address, handle))
}

async fn metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    let metric_families = registry.gather();
    match TextEncoder.encode_to_string(&metric_families) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {error}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use prometheus::{IntCounter, Opts};

    use super::*;

    #[tokio::test]
    async fn serves_registered_metrics() -> Result<()> {
        let registry = Registry::new();
        let counter = IntCounter::with_opts(Opts::new("test_events_total", "Events seen"))?;
        registry.register(Box::new(counter.clone()))?;
        counter.inc_by(3);

        let (address, handle) =
            start_prometheus_server((Ipv4Addr::LOCALHOST, 0).into(), registry).await?;

        let body = reqwest::get(format!("http://{address}{METRICS_ROUTE}"))
            .await?
            .text()
            .await?;
        assert!(body.contains("test_events_total 3"), "unexpected body: {body}");

        handle.abort();
        Ok(())
    }
}
