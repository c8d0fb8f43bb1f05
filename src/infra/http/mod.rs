//! Ops listener exposing liveness of the store and the cache.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::application::error::ErrorReport;
use crate::application::repos::RepoError;
use crate::cache::KvStore;
use crate::infra::db::{PostgresRepositories, map_sqlx_error};

/// Cheap round trip to the durable store.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn ping(&self) -> Result<(), RepoError>;
}

#[async_trait]
impl HealthCheck for PostgresRepositories {
    async fn ping(&self) -> Result<(), RepoError> {
        self.health_check().await.map_err(map_sqlx_error)
    }
}

#[derive(Clone)]
pub struct OpsState {
    pub db: Arc<dyn HealthCheck>,
    pub kv: Arc<KvStore>,
}

pub fn build_ops_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<OpsState>) -> Response {
    if let Err(err) = state.db.ping().await {
        return unavailable("infra::http::health::db", &err);
    }

    if !state.kv.is_open() {
        let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
        ErrorReport::from_message(
            "infra::http::health::cache",
            StatusCode::SERVICE_UNAVAILABLE,
            "cache store is closed",
        )
        .attach(&mut response);
        return response;
    }

    StatusCode::NO_CONTENT.into_response()
}

fn unavailable(source: &'static str, err: &RepoError) -> Response {
    let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
    ErrorReport::from_error(source, StatusCode::SERVICE_UNAVAILABLE, err).attach(&mut response);
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::CacheConfig;

    struct FlakyCheck {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl HealthCheck for FlakyCheck {
        async fn ping(&self) -> Result<(), RepoError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RepoError::Timeout)
            }
        }
    }

    fn state(healthy: bool) -> (OpsState, Arc<KvStore>) {
        let kv = Arc::new(KvStore::open(&CacheConfig::default()));
        let state = OpsState {
            db: Arc::new(FlakyCheck {
                healthy: AtomicBool::new(healthy),
            }),
            kv: Arc::clone(&kv),
        };
        (state, kv)
    }

    async fn get_health(state: OpsState) -> Response {
        build_ops_router(state)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    #[tokio::test]
    async fn healthy_dependencies_return_no_content() {
        let (state, _kv) = state(true);
        let response = get_health(state).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn failing_database_reports_unavailable() {
        let (state, _kv) = state(false);
        let response = get_health(state).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("error report attached");
        assert_eq!(report.source, "infra::http::health::db");
    }

    #[tokio::test]
    async fn closed_cache_reports_unavailable() {
        let (state, kv) = state(true);
        kv.close();

        let response = get_health(state).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
