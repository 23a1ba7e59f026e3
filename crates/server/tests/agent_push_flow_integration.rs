use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use gitmirror_common::protocol::api::{ForwardJobState, PushResponse, SyncResponse};
use gitmirror_common::protocol::pktline::{encode_commands, RefUpdateCommand};
use gitmirror_common::types::{BranchName, CommitHash, RepositoryId};
use gitmirror_engine::config::RetrySettings;
use gitmirror_engine::memory::{MemoryBackend, MemoryRemote};
use gitmirror_engine::upstream::UpstreamError;
use gitmirror_engine::{EngineSettings, ForwardPolicy, MirrorService};
use gitmirror_server::{build_router, AppState};
use serde_json::Value;
use tower::ServiceExt;

fn main_branch() -> BranchName {
    BranchName::new("main").expect("valid branch")
}

fn setup(settings: EngineSettings) -> (Router, MirrorService<MemoryBackend>, MemoryRemote) {
    let service = MirrorService::<MemoryBackend>::new(settings);
    let remote = MemoryRemote::new();
    let id = RepositoryId::new("acme").expect("valid id");
    service.attach(remote.mirror(&id, Some(service.locks()))).expect("attach");
    let app = build_router(AppState::new(service.clone()), 1024 * 1024);
    (app, service, remote)
}

fn receive_pack(old: &CommitHash, new: &CommitHash) -> Request<Body> {
    let body = encode_commands(
        &[RefUpdateCommand { old: Some(old.clone()), new: Some(new.clone()), refname: "refs/heads/main".into() }],
        &["report-status"],
    );
    Request::builder()
        .method(Method::POST)
        .uri("/git/acme/git-receive-pack")
        .header("content-type", "application/x-git-receive-pack-request")
        .body(Body::from(body))
        .expect("receive-pack request should build")
}

async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should be readable");
    serde_json::from_slice(&body).expect("body should be valid json")
}

#[tokio::test]
async fn losing_agent_resyncs_and_lands_on_top() {
    let (app, _service, remote) = setup(EngineSettings::default());
    let c0 = remote.objects().commit(&[]);
    remote.set_head(&main_branch(), &c0);

    // Both agents start from the same tip.
    let synced = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/repos/acme/sync")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .expect("sync request should build"),
        )
        .await
        .expect("sync should respond");
    assert_eq!(synced.status(), StatusCode::OK);

    let a = remote.objects().commit(&[&c0]);
    let b = remote.objects().commit(&[&c0]);

    let first = app.clone().oneshot(receive_pack(&c0, &a)).await.expect("push a should respond");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(remote.head(&main_branch()), Some(a.clone()));

    let second = app.clone().oneshot(receive_pack(&c0, &b)).await.expect("push b should respond");
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let error: Value = read_json(second).await;
    assert_eq!(error["error"]["code"], "STALE_REF_CONFLICT");
    assert_eq!(error["error"]["retryable"], true);
    assert_eq!(error["error"]["details"]["local"], a.as_str());

    // Agent B rebases onto A and retries.
    let resync = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/repos/acme/sync")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"branches":["main"]}"#))
                .expect("sync request should build"),
        )
        .await
        .expect("sync should respond");
    let report: SyncResponse = read_json(resync).await;
    assert_eq!(report.branches[0].local.as_ref(), Some(&a));

    let rebased = remote.objects().commit(&[&a]);
    let retried = app.oneshot(receive_pack(&a, &rebased)).await.expect("retry should respond");
    assert_eq!(retried.status(), StatusCode::OK);
    assert_eq!(remote.head(&main_branch()), Some(rebased.clone()));
    assert_eq!(remote.push_log().into_iter().map(|(_, commit)| commit).collect::<Vec<_>>(), vec![a, rebased]);
}

#[tokio::test(start_paused = true)]
async fn queued_forward_is_visible_to_operators_until_delivered() {
    let settings = EngineSettings {
        forward_policy: ForwardPolicy::RetryQueue,
        retry: RetrySettings {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            capacity: 8,
        },
        ..EngineSettings::default()
    };
    let (app, service, remote) = setup(settings);
    let c0 = remote.objects().commit(&[]);
    remote.set_head(&main_branch(), &c0);
    let c1 = remote.objects().commit(&[&c0]);
    remote.fail_next_push(UpstreamError::transport("connection reset by peer"));

    let pushed = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/repos/acme/push")
                .body(Body::from(encode_commands(
                    &[RefUpdateCommand {
                        old: Some(c0.clone()),
                        new: Some(c1.clone()),
                        refname: "refs/heads/main".into(),
                    }],
                    &["report-status"],
                )))
                .expect("push request should build"),
        )
        .await
        .expect("push should respond");
    assert_eq!(pushed.status(), StatusCode::OK);
    let pushed: PushResponse = read_json(pushed).await;
    assert_eq!(pushed.branches.len(), 1);
    assert_eq!(pushed.branches[0].commit, c1);

    let pending = app
        .clone()
        .oneshot(Request::builder().uri("/api/repos/acme/forwards").body(Body::empty()).expect("request should build"))
        .await
        .expect("forwards should respond");
    let pending: Value = read_json(pending).await;
    assert_eq!(pending["jobs"][0]["state"], ForwardJobState::Pending.as_str());
    assert_eq!(pending["jobs"][0]["commit"], c1.as_str());

    let worker = service.start_forward_worker();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(remote.head(&main_branch()), Some(c1));

    let delivered = app
        .oneshot(Request::builder().uri("/api/repos/acme/forwards").body(Body::empty()).expect("request should build"))
        .await
        .expect("forwards should respond");
    let delivered: Value = read_json(delivered).await;
    assert_eq!(delivered["jobs"][0]["state"], ForwardJobState::Forwarded.as_str());
    worker.shutdown().await;
}
