/*
 * Copyright (C) 2024 The Sandboxd Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! HTTP surface: Prometheus metrics and health probes.

use crate::sandboxd::logger::log_info;
use crate::sandboxd::observability::health::{liveness_report, HealthProbe};
use crate::sandboxd::observability::metrics;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::error::Error;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

async fn metrics_handler() -> Response {
    match metrics::gather() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn readyz(State(probe): State<HealthProbe>) -> Response {
    let report = probe.readiness_report();
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn livez() -> Response {
    (StatusCode::OK, Json(liveness_report())).into_response()
}

pub fn build_router(probe: HealthProbe) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(readyz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .with_state(probe)
}

/// Serves the router on `addr` until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    probe: HealthProbe,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| format!("failed to bind metrics listener at {addr}: {err}"))?;
    let local = listener.local_addr()?.to_string();
    log_info("server", "HTTP server listening", &[("addr", local.as_str())]);
    axum::serve(listener, build_router(probe))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
