// Git smart-HTTP endpoints.
//
// Agents clone, fetch and push against `/git/{repository_id}` exactly as
// they would against the upstream host. Reads trigger a throttled refresh
// first; pushes go through the coordinator and only answer once the
// upstream has the commits (or the local update was undone).

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use gitmirror_common::protocol::api::{format_pushed_header, PUSHED_BRANCHES_HEADER};
use gitmirror_common::types::RepositoryId;
use gitmirror_engine::receive::{GitService, LocalReceiver};
use gitmirror_engine::{MirrorBackend, MirrorError};
use serde::Deserialize;
use tracing::debug;

use crate::app::{parse_repository_id, AppState};
use crate::error::{ErrorCode, ServerError};

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

pub fn router<B: MirrorBackend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/git/{repository_id}/info/refs", get(info_refs::<B>))
        .route("/git/{repository_id}/git-upload-pack", post(upload_pack::<B>))
        .route("/git/{repository_id}/git-receive-pack", post(receive_pack::<B>))
        .with_state(state)
}

async fn info_refs<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let service = query.service.as_deref().and_then(GitService::parse).ok_or_else(|| {
        ServerError::new(
            ErrorCode::ValidationFailed,
            "service must be git-upload-pack or git-receive-pack; dumb HTTP is not served",
        )
    })?;

    let mirror = state.service.mirror(&repository_id)?;
    if service == GitService::UploadPack {
        refresh_before_read(&state, &repository_id).await;
    }
    let body = mirror.receiver().advertise_refs(service).await.map_err(MirrorError::from)?;
    Ok(git_response(service, "advertisement", body))
}

async fn upload_pack<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let mirror = state.service.mirror(&repository_id)?;
    refresh_before_read(&state, &repository_id).await;
    let result = mirror.receiver().upload_pack(&body).await.map_err(MirrorError::from)?;
    Ok(git_response(GitService::UploadPack, "result", result))
}

async fn receive_pack<B: MirrorBackend>(
    State(state): State<AppState<B>>,
    Path(repository_id): Path<String>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let repository_id = parse_repository_id(&repository_id)?;
    let outcome = state.push(repository_id, body.to_vec()).await?;

    let pushed: Vec<_> = outcome.branches.iter().map(|branch| branch.to_pushed()).collect();
    let mut response = git_response(GitService::ReceivePack, "result", outcome.response);
    if let Ok(value) = HeaderValue::from_str(&format_pushed_header(&pushed)) {
        response.headers_mut().insert(PUSHED_BRANCHES_HEADER, value);
    }
    Ok(response)
}

/// A failed refresh is recorded on the mirror and logged by the sync engine;
/// the read is served from local state regardless.
async fn refresh_before_read<B: MirrorBackend>(state: &AppState<B>, repository_id: &RepositoryId) {
    if let Err(error) = state.service.sync_engine().request_refresh(repository_id).await {
        debug!(repository_id = %repository_id, error = %error, "serving read from local state");
    }
}

fn git_response(service: GitService, suffix: &str, body: Vec<u8>) -> Response {
    let content_type = format!("application/x-{}-{suffix}", service.as_str());
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use gitmirror_common::protocol::pktline::{encode_commands, RefUpdateCommand};
    use gitmirror_common::types::{BranchName, CommitHash, RepositoryId};
    use gitmirror_engine::memory::{MemoryBackend, MemoryRemote};
    use gitmirror_engine::upstream::UpstreamError;
    use gitmirror_engine::{EngineSettings, MirrorService};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::app::{build_router, AppState};

    struct Fixture {
        app: Router,
        remote: MemoryRemote,
        service: MirrorService<MemoryBackend>,
        id: RepositoryId,
    }

    fn fixture() -> Fixture {
        let service = MirrorService::<MemoryBackend>::new(EngineSettings::default());
        let remote = MemoryRemote::new();
        let id = RepositoryId::new("acme").expect("valid id");
        service.attach(remote.mirror(&id, Some(service.locks()))).expect("attach");
        let app = build_router(AppState::new(service.clone()), 1024 * 1024);
        Fixture { app, remote, service, id }
    }

    fn main_branch() -> BranchName {
        BranchName::new("main").expect("valid branch")
    }

    fn push_body(old: Option<&CommitHash>, new: &CommitHash) -> Vec<u8> {
        encode_commands(
            &[RefUpdateCommand { old: old.cloned(), new: Some(new.clone()), refname: "refs/heads/main".into() }],
            &["report-status"],
        )
    }

    async fn read_body(response: axum::response::Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.expect("body should be readable").to_vec()
    }

    #[tokio::test]
    async fn upload_pack_advertisement_refreshes_from_upstream() {
        let f = fixture();
        let c0 = f.remote.objects().commit(&[]);
        f.remote.set_head(&main_branch(), &c0);

        let response = f
            .app
            .oneshot(
                Request::builder()
                    .uri("/git/acme/info/refs?service=git-upload-pack")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/x-git-upload-pack-advertisement");
        assert_eq!(response.headers()["cache-control"], "no-cache");
        let body = String::from_utf8_lossy(&read_body(response).await).to_string();
        assert!(body.starts_with("001e# service=git-upload-pack\n"), "{body}");
        assert!(body.contains(&format!("{c0} refs/heads/main")), "{body}");
    }

    #[tokio::test]
    async fn advertisement_is_served_from_local_state_when_upstream_is_down() {
        let f = fixture();
        let c0 = f.remote.objects().commit(&[]);
        f.service.mirror(&f.id).expect("attached").repo().seed(&main_branch(), &c0);
        f.remote.fail_next_list(UpstreamError::transport("connection refused"));

        let response = f
            .app
            .oneshot(
                Request::builder()
                    .uri("/git/acme/info/refs?service=git-upload-pack")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body = String::from_utf8_lossy(&read_body(response).await).to_string();
        assert!(body.contains(&c0.to_string()));
        assert!(f.service.mirror(&f.id).expect("attached").last_refresh_error().is_some());
    }

    #[tokio::test]
    async fn dumb_http_and_unknown_services_are_refused() {
        let f = fixture();
        for uri in ["/git/acme/info/refs", "/git/acme/info/refs?service=git-archive"] {
            let response = f
                .app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request should build"))
                .await
                .expect("request should succeed");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn unknown_repository_is_not_found() {
        let f = fixture();
        let response = f
            .app
            .oneshot(
                Request::builder()
                    .uri("/git/elsewhere/info/refs?service=git-receive-pack")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn receive_pack_forwards_and_reports_pushed_branches() {
        let f = fixture();
        let c0 = f.remote.objects().commit(&[]);
        f.remote.set_head(&main_branch(), &c0);
        f.service.mirror(&f.id).expect("attached").repo().seed(&main_branch(), &c0);
        let c1 = f.remote.objects().commit(&[&c0]);

        let response = f
            .app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/git/acme/git-receive-pack")
                    .header("content-type", "application/x-git-receive-pack-request")
                    .body(Body::from(push_body(Some(&c0), &c1)))
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/x-git-receive-pack-result");
        let pushed = response.headers()["x-gitmirror-pushed"].to_str().expect("ascii header").to_string();
        assert!(pushed.contains("main"), "{pushed}");
        assert!(pushed.contains(c1.as_str()), "{pushed}");
        let body = String::from_utf8_lossy(&read_body(response).await).to_string();
        assert!(body.contains("ok refs/heads/main"), "{body}");
        assert_eq!(f.remote.head(&main_branch()), Some(c1));
    }

    #[tokio::test]
    async fn stale_push_returns_a_retryable_conflict() {
        let f = fixture();
        let c0 = f.remote.objects().commit(&[]);
        let theirs = f.remote.objects().commit(&[&c0]);
        f.remote.set_head(&main_branch(), &theirs);
        f.service.mirror(&f.id).expect("attached").repo().seed(&main_branch(), &c0);
        let ours = f.remote.objects().commit(&[&c0]);

        let response = f
            .app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/git/acme/git-receive-pack")
                    .body(Body::from(push_body(Some(&c0), &ours)))
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let parsed: Value = serde_json::from_slice(&read_body(response).await).expect("json error body");
        assert_eq!(parsed["error"]["code"], "STALE_REF_CONFLICT");
        assert_eq!(parsed["error"]["retryable"], true);
        assert_eq!(parsed["error"]["details"]["branch"], "main");
        assert!(parsed["error"]["details"]["operation_id"].is_string());
        assert_eq!(f.remote.head(&main_branch()), Some(theirs));
    }
}
