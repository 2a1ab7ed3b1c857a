//! Problem-details error responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::db::DbError;
use crate::fleet_spec::SpecStoreError;
use crate::tasks::{TaskError, TaskLookupError};

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://vmfleet.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            problem: Box::new(ProblemDetails::new(status, code, message)),
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn gone(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::GONE, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.retryable = true;
        err
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        self.problem.request_id = request_id.clone();
        if self.problem.instance.is_none() {
            self.problem.instance = Some(request_id);
        }
        self
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::CapacityExceeded { .. } => {
                Self::service_unavailable("task_capacity_exceeded", err.to_string())
            }
        }
    }
}

impl From<TaskLookupError> for ApiError {
    fn from(err: TaskLookupError) -> Self {
        match err {
            TaskLookupError::NotFound(_) => Self::not_found("task_not_found", err.to_string()),
            TaskLookupError::Expired(_) => Self::gone("task_expired", err.to_string()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        error!(error = %err, "metadata store error");
        Self::internal("metadata_error", err.to_string())
    }
}

impl From<SpecStoreError> for ApiError {
    fn from(err: SpecStoreError) -> Self {
        match err {
            SpecStoreError::Duplicate(_) => Self::conflict("server_exists", err.to_string()),
            _ if err.is_conflict() => Self::conflict("spec_conflict", err.to_string()),
            _ => {
                error!(error = %err, "fleet spec error");
                Self::internal("spec_error", err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_id::TaskId;

    #[test]
    fn test_lookup_errors_map_to_distinct_statuses() {
        let id = TaskId::new();
        let missing = ApiError::from(TaskLookupError::NotFound(id));
        let expired = ApiError::from(TaskLookupError::Expired(id));

        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_eq!(missing.problem.code, "task_not_found");
        assert_eq!(expired.status, StatusCode::GONE);
        assert_eq!(expired.problem.code, "task_expired");
    }

    #[test]
    fn test_capacity_is_retryable() {
        let err = ApiError::from(TaskError::CapacityExceeded { capacity: 4 });
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.problem.retryable);
    }

    #[test]
    fn test_taken_server_name_is_conflict() {
        let err = ApiError::from(SpecStoreError::Duplicate("web-1".to_string()));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.problem.code, "server_exists");
        assert!(!err.problem.retryable);
    }

    #[test]
    fn test_request_id_sets_instance() {
        let err = ApiError::bad_request("invalid", "nope").with_request_id("req_123");
        assert_eq!(err.problem.request_id, "req_123");
        assert_eq!(err.problem.instance.as_deref(), Some("req_123"));
    }
}
