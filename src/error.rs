//! Error taxonomy and JSON error responses

use crate::backend::BackendError;
use crate::mapping::RouteError;
use crate::resolver::SpecError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Stable error codes returned to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Template or launch parameters are invalid
    SpecValidation,
    /// User may not launch this spec
    AccessDenied,
    /// Missing or wrong API token
    Unauthorized,
    /// Spec id not in the catalog
    UnknownSpec,
    /// Instance id not in the registry
    InstanceNotFound,
    /// No route matches the request path
    NoRoute,
    /// Another operation already changed the instance
    ConcurrencyConflict,
    /// Start was abandoned because of a stop
    Cancelled,
    /// Backend failed to create the workload
    ProvisionFailed,
    /// Workload never became ready
    ReadinessTimeout,
    /// Backend teardown partially failed
    DeprovisionFailed,
    /// Malformed request
    BadRequest,
    /// Request timed out waiting for the instance
    RequestTimeout,
    /// Failed to connect to the instance
    ConnectionFailed,
    /// Internal error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::SpecValidation => StatusCode::BAD_REQUEST,
            ProxyErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::UnknownSpec => StatusCode::NOT_FOUND,
            ProxyErrorCode::InstanceNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConcurrencyConflict => StatusCode::CONFLICT,
            ProxyErrorCode::Cancelled => StatusCode::CONFLICT,
            ProxyErrorCode::ProvisionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ReadinessTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::DeprovisionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::SpecValidation => "SPEC_VALIDATION",
            ProxyErrorCode::AccessDenied => "ACCESS_DENIED",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::UnknownSpec => "UNKNOWN_SPEC",
            ProxyErrorCode::InstanceNotFound => "INSTANCE_NOT_FOUND",
            ProxyErrorCode::NoRoute => "NO_ROUTE",
            ProxyErrorCode::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            ProxyErrorCode::Cancelled => "CANCELLED",
            ProxyErrorCode::ProvisionFailed => "PROVISION_FAILED",
            ProxyErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            ProxyErrorCode::DeprovisionFailed => "DEPROVISION_FAILED",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Step of a start at which something failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Provision,
    Readiness,
    Routing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Provision => "provision",
            Phase::Readiness => "readiness",
            Phase::Routing => "routing",
        })
    }
}

/// Failures of start/stop surfaced to callers
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid spec: {0}")]
    SpecValidation(SpecError),

    #[error("access denied: {0}")]
    AccessDenied(SpecError),

    #[error("unknown spec '{0}'")]
    UnknownSpec(String),

    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("instance {instance_id} failed during {phase}: {source}")]
    Provision {
        instance_id: String,
        phase: Phase,
        #[source]
        source: BackendError,
    },

    #[error("instance {instance_id} could not be routed: {source}")]
    Routing {
        instance_id: String,
        #[source]
        source: RouteError,
    },

    #[error("instance {instance_id} did not become ready within {timeout_secs}s")]
    ReadinessTimeout {
        instance_id: String,
        timeout_secs: u64,
    },

    #[error("teardown of instance {instance_id} failed: {source}")]
    Deprovision {
        instance_id: String,
        #[source]
        source: BackendError,
    },

    #[error("instance {instance_id} is already {state}")]
    ConcurrencyConflict { instance_id: String, state: String },

    #[error("start of instance {0} was cancelled")]
    Cancelled(String),
}

impl From<SpecError> for LifecycleError {
    fn from(e: SpecError) -> Self {
        match e {
            SpecError::AccessDenied { .. } => LifecycleError::AccessDenied(e),
            other => LifecycleError::SpecValidation(other),
        }
    }
}

impl LifecycleError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            LifecycleError::SpecValidation(_) => ProxyErrorCode::SpecValidation,
            LifecycleError::AccessDenied(_) => ProxyErrorCode::AccessDenied,
            LifecycleError::UnknownSpec(_) => ProxyErrorCode::UnknownSpec,
            LifecycleError::NotFound(_) => ProxyErrorCode::InstanceNotFound,
            LifecycleError::Provision { .. } | LifecycleError::Routing { .. } => {
                ProxyErrorCode::ProvisionFailed
            }
            LifecycleError::ReadinessTimeout { .. } => ProxyErrorCode::ReadinessTimeout,
            LifecycleError::Deprovision { .. } => ProxyErrorCode::DeprovisionFailed,
            LifecycleError::ConcurrencyConflict { .. } => ProxyErrorCode::ConcurrencyConflict,
            LifecycleError::Cancelled(_) => ProxyErrorCode::Cancelled,
        }
    }

    /// Convert into a JSON error response
    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(
        Full::new(Bytes::from(error.to_json()))
            .map_err(|e| match e {})
            .boxed(),
    );
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::SpecValidation.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::AccessDenied.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ProxyErrorCode::NoRoute.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ProxyErrorCode::ConcurrencyConflict.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ProxyErrorCode::ReadinessTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_lifecycle_error_codes() {
        let denied: LifecycleError = SpecError::AccessDenied {
            spec_id: "app".to_string(),
            user_id: "jack".to_string(),
        }
        .into();
        assert_eq!(denied.code(), ProxyErrorCode::AccessDenied);

        let invalid: LifecycleError = SpecError::UnknownParameter("x".to_string()).into();
        assert_eq!(invalid.code(), ProxyErrorCode::SpecValidation);

        let provision = LifecycleError::Provision {
            instance_id: "i1".to_string(),
            phase: Phase::Provision,
            source: BackendError::Invalid("bad memory".to_string()),
        };
        assert_eq!(provision.code(), ProxyErrorCode::ProvisionFailed);
        let message = provision.to_string();
        assert!(message.contains("i1"));
        assert!(message.contains("provision"));
        assert!(message.contains("bad memory"));

        let routing = LifecycleError::Routing {
            instance_id: "i1".to_string(),
            source: RouteError::InvalidPrefix("/".to_string()),
        };
        assert_eq!(routing.code(), ProxyErrorCode::ProvisionFailed);
        assert!(routing.to_string().contains("invalid route prefix '/'"));
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownSpec, "unknown spec 'x'");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_SPEC\""));
        assert!(json.contains("\"message\":\"unknown spec 'x'\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = LifecycleError::NotFound("abc".to_string()).to_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "INSTANCE_NOT_FOUND"
        );
    }
}
