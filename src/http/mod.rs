//! Thin axum server exposing `/healthz`, `/metrics`, and a test-only `/debug/state` that
//! mirrors [`EngineHandle::report_state`].
//!
//! This is the only HTTP surface owned by this crate: it never proxies account traffic
//! itself (that's `EngineHandle::route_request`, called from the upstream façade).

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};

use crate::engine::EngineHandle;

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
    registry: Arc<Registry>,
}

/// Builds the router; callers bind it with `axum::serve`.
pub fn router(engine: EngineHandle, registry: Arc<Registry>) -> Router {
    let state = AppState { engine, registry };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/debug/state", get(debug_state))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> Response {
    let families = state.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed")
            .into_response();
    }
    ([(axum::http::header::CONTENT_TYPE, encoder.format_type())], buffer).into_response()
}

async fn debug_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.report_state().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, AccountSource};
    use crate::backend::{Backend, ConnectivityMessage};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct NoopBackend;

    #[async_trait]
    impl Backend for NoopBackend {
        async fn init(
            &self,
            _shutdown: CancellationToken,
            _connectivity_out: mpsc::UnboundedSender<ConnectivityMessage>,
            _all_accounts: Vec<Account>,
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn launch(&self, _account: Account, _cancel: CancellationToken) {}
        async fn join(&self) {}
    }

    struct EmptyAccounts;

    #[async_trait]
    impl AccountSource for EmptyAccounts {
        async fn all_accounts(&self) -> crate::error::Result<Vec<Account>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn healthz_and_debug_state_respond() {
        let metrics = crate::metrics::Metrics::new();
        let (engine, handle) = crate::engine::Engine::new(
            Arc::new(NoopBackend),
            Arc::new(EmptyAccounts),
            metrics,
            std::time::Duration::from_secs(3600),
        );
        let shutdown = CancellationToken::new();
        let run_shutdown = shutdown.clone();
        let run = tokio::spawn(async move { engine.run(run_shutdown).await });

        let registry = Arc::new(Registry::new());
        let app = router(handle, registry);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/debug/state").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reported: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_json_diff::assert_json_eq!(reported, serde_json::json!({}));

        shutdown.cancel();
        assert!(run.await.unwrap().unwrap());
    }
}
