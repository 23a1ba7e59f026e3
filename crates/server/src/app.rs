// Router assembly and request middleware.
//
// Every request runs inside a request-id scope so that error bodies and log
// lines produced anywhere below carry the same id the client sees.

use std::time::Instant;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use gitmirror_common::types::RepositoryId;
use gitmirror_engine::{MirrorBackend, MirrorService, PushOutcome};
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{error, info};

use crate::error::{
    attach_request_id_header, current_request_id, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, ServerError,
};
use crate::{api, git_http};

pub struct AppState<B: MirrorBackend> {
    pub service: MirrorService<B>,
}

impl<B: MirrorBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self { service: self.service.clone() }
    }
}

impl<B: MirrorBackend> AppState<B> {
    pub fn new(service: MirrorService<B>) -> Self {
        Self { service }
    }

    /// Run a push to completion on its own task. A client that hangs up
    /// mid-push must not abandon the operation between the local update and
    /// its rollback.
    pub(crate) async fn push(&self, repository_id: RepositoryId, body: Vec<u8>) -> Result<PushOutcome, ServerError> {
        let coordinator = self.service.coordinator();
        let request_id = current_request_id().unwrap_or_default();
        let task = tokio::spawn(with_request_id_scope(request_id, async move {
            coordinator.push(&repository_id, &body).await
        }));

        match task.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(failure)) => Err(failure.into()),
            Err(join_error) => {
                error!(?join_error, "push task failed");
                Err(ServerError::from_code(ErrorCode::InternalError))
            }
        }
    }
}

pub fn parse_repository_id(raw: &str) -> Result<RepositoryId, ServerError> {
    Ok(RepositoryId::new(raw)?)
}

pub fn build_router<B: MirrorBackend>(state: AppState<B>, max_body_bytes: usize) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(git_http::router(state.clone()))
            .merge(api::router(state)),
        max_body_bytes,
    )
}

pub fn apply_middleware(router: Router, max_body_bytes: usize) -> Router {
    router
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(RequestDecompressionLayer::new())
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ServerError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
