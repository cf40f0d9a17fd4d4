//! HTTP endpoints of the node daemon

use crate::bootstrap::App;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::post;
use axum::{Json, Router};
use k8sd_api::{
    RefreshCertificatesPlanResponse, RefreshCertificatesRunRequest, RefreshCertificatesRunResponse,
    Response, REFRESH_CERTS_PLAN_PATH, REFRESH_CERTS_RUN_PATH,
};
use std::sync::Arc;
use tracing::{error, warn};

async fn refresh_plan(State(app): State<Arc<App>>) -> Json<Response<RefreshCertificatesPlanResponse>> {
    Json(Response::success(app.refresh_plan()))
}

async fn refresh_run(State(app): State<Arc<App>>, body: Bytes) -> HttpResponse {
    let request: RefreshCertificatesRunRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected refresh request");
            return (
                StatusCode::BAD_REQUEST,
                Json(Response::<RefreshCertificatesRunResponse>::failure(format!(
                    "failed to parse request: {e}"
                ))),
            )
                .into_response();
        }
    };

    match app.refresh_run(request.seed).await {
        Ok(response) => Json(Response::success(response)).into_response(),
        Err(e) => {
            error!(error = %e, seed = request.seed, "Certificate refresh failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Response::<RefreshCertificatesRunResponse>::failure(e.to_string())),
            )
                .into_response()
        }
    }
}

/// Create the node API router
pub fn create_router(app: Arc<App>) -> Router {
    Router::new()
        .route(REFRESH_CERTS_PLAN_PATH, post(refresh_plan))
        .route(REFRESH_CERTS_RUN_PATH, post(refresh_run))
        .with_state(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::NodeIdentity;
    use crate::features::FeatureControllers;
    use crate::snap::{self, Snap};
    use crate::store::ClusterStore;
    use crate::testing::{FakeClusterApi, FakeSnap, FakeTransport, MemoryStore};
    use axum::body::Body;
    use axum::http::Request;
    use k8sd_config::ClusterConfig;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        snap: Arc<FakeSnap>,
        store: Arc<MemoryStore>,
        api: Arc<FakeClusterApi>,
    }

    fn harness() -> Harness {
        let api = Arc::new(FakeClusterApi::new());
        let snap = Arc::new(FakeSnap::new(api.clone()));
        let store = Arc::new(MemoryStore::default());
        let (features, _receivers) = FeatureControllers::channel();
        let app = App::new(
            snap.clone(),
            store.clone(),
            Arc::new(FakeTransport::new()),
            NodeIdentity {
                name: "worker-1".to_string(),
                address: "10.0.0.7:6400".to_string(),
            },
            features,
        );
        Harness {
            router: create_router(Arc::new(app)),
            snap,
            store,
            api,
        }
    }

    async fn post<T: DeserializeOwned + Default>(router: Router, path: &str, body: &str) -> (StatusCode, Response<T>) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_plan_on_control_plane() {
        let h = harness();
        let (status, body) =
            post::<RefreshCertificatesPlanResponse>(h.router, REFRESH_CERTS_PLAN_PATH, "").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.error.is_empty());
        assert!(body.metadata.certificate_signing_requests.is_empty());
    }

    #[tokio::test]
    async fn test_run_rejects_unknown_fields() {
        let h = harness();
        let (status, body) = post::<RefreshCertificatesRunResponse>(
            h.router,
            REFRESH_CERTS_RUN_PATH,
            r#"{"seed":1,"extra":true}"#,
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.starts_with("failed to parse request"));
    }

    #[tokio::test]
    async fn test_run_on_control_plane_fails() {
        let h = harness();
        let (status, body) =
            post::<RefreshCertificatesRunResponse>(h.router, REFRESH_CERTS_RUN_PATH, r#"{"seed":1}"#)
                .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.error.is_empty());
        assert_eq!(body.metadata.expiration_seconds, 0);
    }

    #[tokio::test]
    async fn test_run_on_worker() {
        let h = harness();
        snap::mark_as_worker(h.snap.paths(), true).unwrap();
        let mut config = ClusterConfig::default();
        config.certificates.ca_cert = Some(h.api.ca_cert_pem().to_string());
        config.certificates.client_ca_cert = Some(h.api.ca_cert_pem().to_string());
        h.store.set_cluster_config(&config).await.unwrap();

        let (status, body) =
            post::<RefreshCertificatesRunResponse>(h.router, REFRESH_CERTS_RUN_PATH, r#"{"seed":5}"#)
                .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body.metadata.expiration_seconds,
            FakeClusterApi::VALIDITY_DAYS * 86400
        );
    }
}
