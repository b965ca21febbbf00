//! HTTP surface of the run verifier.
//!
//! | Route | Success |
//! |---|---|
//! | `POST /run/start` | `201 {...run, runToken}` |
//! | `GET /run/current` | `200 run` or `200 null` |
//! | `POST /run/:id/checkpoint` | `200 {success, score, lines, level}` |
//! | `POST /run/:id/end` | `200 {success}` |
//! | `GET /healthz` | `200 ok` |
//!
//! Errors answer `{"error", "code", "field"?}` with the status of the
//! [`ErrorCode`]. Store faults are logged and answered with a generic
//! `INTERNAL_ERROR`.
//!
//! # Feature gate
//!
//! Only available with the `http-api` feature (enabled by default).

pub mod identity;

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub use identity::{IdentityProvider, TrustedHeaderIdentity, USER_ID_HEADER};

use crate::error_codes::ErrorCode;
use crate::protocol::UserId;
use crate::run::{CheckpointRequest, EndRunRequest, StartRunRequest};
use crate::store::RunStore;
use crate::verifier::{RunError, RunVerifier};

/// Header that may carry the run token instead of the body's `runToken`.
pub const RUN_TOKEN_HEADER: &str = "x-run-token";

/// Shared state of the run routes.
pub struct ApiState<S> {
    verifier: RunVerifier<S>,
    identity: Arc<dyn IdentityProvider>,
}

impl<S> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            verifier: self.verifier.clone(),
            identity: Arc::clone(&self.identity),
        }
    }
}

impl<S: RunStore> ApiState<S> {
    fn caller(&self, headers: &HeaderMap) -> Result<UserId, RunError> {
        self.identity
            .identify(headers)
            .ok_or(RunError::Unauthenticated)
    }
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// A [`RunError`] on its way to the client.
#[derive(Debug)]
pub struct ApiError(RunError);

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let body = if err.is_internal() {
            error!(code = %err.code(), "run API internal error: {err}");
            ErrorBody {
                error: ErrorCode::InternalError.description().to_string(),
                code: ErrorCode::InternalError,
                field: None,
            }
        } else {
            ErrorBody {
                error: err.to_string(),
                code: err.code(),
                field: err.field().map(str::to_string),
            }
        };
        let status =
            StatusCode::from_u16(body.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Build the run API router.
pub fn router<S: RunStore>(
    verifier: RunVerifier<S>,
    identity: impl IdentityProvider,
) -> Router {
    let state = ApiState {
        verifier,
        identity: Arc::new(identity),
    };
    Router::new()
        .route("/run/start", post(start_run::<S>))
        .route("/run/current", get(current_run::<S>))
        .route("/run/:id/checkpoint", post(checkpoint_run::<S>))
        .route("/run/:id/end", post(end_run::<S>))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns the I/O error that stopped the server.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "run API listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Parse a JSON body, turning every failure into a 400.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, RunError> {
    if body.is_empty() {
        return Err(RunError::Validation {
            field: None,
            message: "request body is required".to_string(),
        });
    }
    serde_json::from_slice(body).map_err(|e| {
        let message = e.to_string();
        RunError::Validation {
            field: named_field(&message),
            message,
        }
    })
}

/// Field named by a serde "missing field `x`" / "unknown field `x`" message.
fn named_field(message: &str) -> Option<String> {
    let rest = message
        .strip_prefix("missing field `")
        .or_else(|| message.strip_prefix("unknown field `"))?;
    rest.split('`').next().map(str::to_string)
}

/// Header token wins over the body's `runToken`.
fn run_token(headers: &HeaderMap, body_token: Option<String>) -> Option<String> {
    headers
        .get(RUN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body_token)
}

async fn start_run<S: RunStore>(
    State(api): State<ApiState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let user_id = api.caller(&headers)?;
    let request: StartRunRequest = parse_body(&body)?;
    let started = api.verifier.start(user_id, request).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn current_run<S: RunStore>(
    State(api): State<ApiState<S>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let user_id = api.caller(&headers)?;
    let run = api.verifier.current(user_id).await?;
    Ok(Json(run))
}

async fn checkpoint_run<S: RunStore>(
    State(api): State<ApiState<S>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let user_id = api.caller(&headers)?;
    let mut request: CheckpointRequest = parse_body(&body)?;
    let token = run_token(&headers, request.run_token.take());
    let checkpoint = request.validate()?;
    let outcome = api
        .verifier
        .checkpoint(user_id, &run_id, token.as_deref(), checkpoint)
        .await?;
    Ok(Json(outcome))
}

async fn end_run<S: RunStore>(
    State(api): State<ApiState<S>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let user_id = api.caller(&headers)?;
    let mut request: EndRunRequest = parse_body(&body)?;
    let token = run_token(&headers, request.run_token.take());
    let status = request.validate()?;
    let outcome = api
        .verifier
        .end(user_id, &run_id, token.as_deref(), status)
        .await?;
    Ok(Json(outcome))
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use axum::http::HeaderValue;

    #[test]
    fn named_field_extraction() {
        assert_eq!(
            named_field("missing field `seed` at line 1 column 2").as_deref(),
            Some("seed")
        );
        assert_eq!(named_field("invalid type: string"), None);
    }

    #[test]
    fn empty_body_is_a_validation_error() {
        let err = parse_body::<StartRunRequest>(&Bytes::new()).unwrap_err();
        assert!(matches!(err, RunError::Validation { .. }));
    }

    #[test]
    fn header_token_wins() {
        let mut headers = HeaderMap::new();
        assert_eq!(run_token(&headers, Some("body".into())).as_deref(), Some("body"));
        headers.insert(RUN_TOKEN_HEADER, HeaderValue::from_static("header"));
        assert_eq!(run_token(&headers, Some("body".into())).as_deref(), Some("header"));
    }

    #[test]
    fn store_faults_are_opaque() {
        let err = RunError::Store(StoreError::Conflict("secret detail".into()));
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
