use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gitmirror_common::types::NameError;
use gitmirror_engine::push::PushFailure;
use gitmirror_engine::MirrorError;
use serde_json::{json, Value};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    StaleRefConflict,
    LockTimeout,
    ForwardTransport,
    ForwardRejected,
    RollbackInconsistency,
    OrphanBranchRace,
    BranchNotUpstream,
    BranchQuarantined,
    ForceSyncForbidden,
    ValidationFailed,
    NotFound,
    QueueFull,
    UpstreamUnavailable,
    PayloadTooLarge,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StaleRefConflict => "STALE_REF_CONFLICT",
            Self::LockTimeout => "LOCK_TIMEOUT",
            Self::ForwardTransport => "FORWARD_TRANSPORT",
            Self::ForwardRejected => "FORWARD_REJECTED",
            Self::RollbackInconsistency => "ROLLBACK_INCONSISTENCY",
            Self::OrphanBranchRace => "ORPHAN_BRANCH_RACE",
            Self::BranchNotUpstream => "BRANCH_NOT_UPSTREAM",
            Self::BranchQuarantined => "BRANCH_QUARANTINED",
            Self::ForceSyncForbidden => "FORCE_SYNC_FORBIDDEN",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::NotFound => "NOT_FOUND",
            Self::QueueFull => "QUEUE_FULL",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::StaleRefConflict => StatusCode::CONFLICT,
            Self::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::ForwardTransport => StatusCode::BAD_GATEWAY,
            Self::ForwardRejected => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RollbackInconsistency => StatusCode::INTERNAL_SERVER_ERROR,
            Self::OrphanBranchRace => StatusCode::CONFLICT,
            Self::BranchNotUpstream => StatusCode::CONFLICT,
            Self::BranchQuarantined => StatusCode::LOCKED,
            Self::ForceSyncForbidden => StatusCode::FORBIDDEN,
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when resyncing and retrying the same request can succeed
    /// without a human in the loop.
    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::StaleRefConflict
                | Self::LockTimeout
                | Self::ForwardTransport
                | Self::QueueFull
                | Self::UpstreamUnavailable
        )
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::StaleRefConflict => "branch is stale; resync and retry",
            Self::LockTimeout => "timed out waiting for the branch lock",
            Self::ForwardTransport => "upstream could not be reached; local update reverted",
            Self::ForwardRejected => "upstream rejected the update",
            Self::RollbackInconsistency => "rollback failed; branch quarantined",
            Self::OrphanBranchRace => "branch was created with unrelated histories",
            Self::BranchNotUpstream => "branch exists on the mirror but not upstream",
            Self::BranchQuarantined => "branch is quarantined pending manual reconciliation",
            Self::ForceSyncForbidden => "force sync of a multi-writer branch is not allowed",
            Self::ValidationFailed => "request validation failed",
            Self::NotFound => "requested resource not found",
            Self::QueueFull => "forward queue is full",
            Self::UpstreamUnavailable => "upstream is unavailable",
            Self::PayloadTooLarge => "payload exceeds maximum allowed size",
            Self::InternalError => "internal server error",
        }
    }

    pub fn for_mirror_error(error: &MirrorError) -> Self {
        match error {
            MirrorError::StaleRefConflict { .. } => Self::StaleRefConflict,
            MirrorError::ForwardRejected { .. } => Self::ForwardRejected,
            MirrorError::ForwardTransport { .. } => Self::ForwardTransport,
            MirrorError::LockTimeout { .. } => Self::LockTimeout,
            MirrorError::RollbackInconsistency { .. } => Self::RollbackInconsistency,
            MirrorError::OrphanBranchRace { .. } => Self::OrphanBranchRace,
            MirrorError::BranchNotUpstream { .. } => Self::BranchNotUpstream,
            MirrorError::BranchQuarantined { .. } => Self::BranchQuarantined,
            MirrorError::ForceSyncForbidden { .. } => Self::ForceSyncForbidden,
            MirrorError::RepositoryNotFound(_) => Self::NotFound,
            MirrorError::RepositoryExists(_) | MirrorError::InvalidPush(_) => Self::ValidationFailed,
            MirrorError::QueueFull { .. } => Self::QueueFull,
            MirrorError::Upstream { .. } => Self::UpstreamUnavailable,
            MirrorError::RefStore(_) | MirrorError::Receive(_) => Self::InternalError,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<MirrorError> for ServerError {
    fn from(error: MirrorError) -> Self {
        let code = ErrorCode::for_mirror_error(&error);
        let mut details = json!({ "kind": error.kind() });
        if let Some(branch) = error.branch() {
            details["branch"] = json!(branch);
        }
        if let Some(operation_id) = error.operation_id() {
            details["operation_id"] = json!(operation_id);
        }
        match &error {
            MirrorError::StaleRefConflict { local, upstream, .. } => {
                details["local"] = json!(local);
                details["upstream"] = json!(upstream);
            }
            MirrorError::OrphanBranchRace { local, upstream, .. } => {
                details["local"] = json!(local);
                details["upstream"] = json!(upstream);
            }
            MirrorError::RollbackInconsistency { expected, found, restore_to, .. } => {
                details["expected"] = json!(expected);
                details["found"] = json!(found);
                details["restore_to"] = json!(restore_to);
            }
            MirrorError::BranchNotUpstream { local, .. } => {
                details["local"] = json!(local);
            }
            MirrorError::LockTimeout { holder, .. } => {
                details["holder"] = json!(holder);
            }
            _ => {}
        }
        Self::new(code, error.to_string()).with_details(details)
    }
}

impl From<PushFailure> for ServerError {
    fn from(failure: PushFailure) -> Self {
        let operation_id = failure.operation_id;
        let completed: Vec<_> = failure.completed.iter().map(|branch| branch.to_pushed()).collect();
        let mut error = ServerError::from(failure.error);
        error.details["operation_id"] = json!(operation_id);
        if !completed.is_empty() {
            error.details["completed"] = json!(completed);
        }
        error
    }
}

impl From<NameError> for ServerError {
    fn from(error: NameError) -> Self {
        Self::new(ErrorCode::ValidationFailed, error.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
