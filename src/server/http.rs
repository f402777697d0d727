//! HTTP entry points for negotiation.
//!
//! - `POST /offer` - start a session from an initiator description
//! - `POST /sessions` - start a session from a description of either role
//! - `GET /sessions/:id` - session status
//! - `DELETE /sessions/:id` - retire a session
//! - `GET /sessions/:id/offer` - hand the offer to the responder
//! - `POST /sessions/:id/answer` - responder description
//! - `POST /sessions/:id/description` - description of either role
//! - `GET /sessions/:id/description/:role` - wait for a role's description
//! - `POST /candidate` - submit a candidate
//! - `GET /sessions/:id/candidates/:role` - NDJSON stream of the opposite role's candidates
//! - `POST /sessions/:id/candidates/:role/done` - end of candidates for a role

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error};

use crate::{
    entity::{Candidate, Role, SessionCreated, SessionDescription, SessionId},
    error::RelayError,
    registry::Registry,
    session::SessionStatus,
};

pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/offer", post(submit_offer))
        .route("/candidate", post(submit_candidate))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(session_status).delete(retire_session))
        .route("/sessions/:id/offer", get(dispatch_offer))
        .route("/sessions/:id/answer", post(submit_answer))
        .route("/sessions/:id/description", post(submit_description))
        .route("/sessions/:id/description/:role", get(await_description))
        .route("/sessions/:id/candidates/:role", get(candidate_stream))
        .route("/sessions/:id/candidates/:role/done", post(complete_candidates))
        .with_state(registry)
}

/// Offer and answer bodies, where the route already implies the role.
#[derive(Deserialize)]
struct DescriptionBody {
    body: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
            RelayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidTransition { .. } => StatusCode::CONFLICT,
            RelayError::SessionClosed(_) | RelayError::Cancelled(_) => StatusCode::GONE,
            RelayError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            err if err.is_transport_failure() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(cause = %self, "negotiation request failed");
        } else {
            debug!(cause = %self, "negotiation request rejected");
        }
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// `Path` whose rejection is a `MalformedMessage`, so a bad id or role gets
/// the same JSON error body as everything else.
struct Params<T>(T);

#[async_trait]
impl<S, T> FromRequestParts<S> for Params<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = RelayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(params)) => Ok(Params(params)),
            Err(rejection) => Err(RelayError::MalformedMessage(rejection.body_text())),
        }
    }
}

/// Decode a request body ourselves so decode failures share the error format.
fn decode<T: DeserializeOwned>(payload: &[u8]) -> crate::Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

async fn health() -> &'static str {
    "OK"
}

async fn submit_offer(
    State(registry): State<Registry>,
    payload: Bytes,
) -> crate::Result<(StatusCode, Json<SessionCreated>)> {
    let DescriptionBody { body } = decode(&payload)?;
    let session_id = registry.create_session(SessionDescription::offer(body));
    Ok((StatusCode::CREATED, Json(SessionCreated { session_id })))
}

async fn create_session(
    State(registry): State<Registry>,
    payload: Bytes,
) -> crate::Result<(StatusCode, Json<SessionCreated>)> {
    let description: SessionDescription = decode(&payload)?;
    let session_id = registry.create_session(description);
    Ok((StatusCode::CREATED, Json(SessionCreated { session_id })))
}

async fn session_status(
    State(registry): State<Registry>,
    Params(id): Params<SessionId>,
) -> crate::Result<Json<SessionStatus>> {
    Ok(Json(registry.status(id).await?))
}

async fn retire_session(
    State(registry): State<Registry>,
    Params(id): Params<SessionId>,
) -> crate::Result<StatusCode> {
    registry.retire(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dispatch_offer(
    State(registry): State<Registry>,
    Params(id): Params<SessionId>,
) -> crate::Result<Json<SessionDescription>> {
    Ok(Json(registry.dispatch(id).await?))
}

async fn submit_answer(
    State(registry): State<Registry>,
    Params(id): Params<SessionId>,
    payload: Bytes,
) -> crate::Result<StatusCode> {
    let DescriptionBody { body } = decode(&payload)?;
    registry
        .submit_description(id, SessionDescription::answer(body))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_description(
    State(registry): State<Registry>,
    Params(id): Params<SessionId>,
    payload: Bytes,
) -> crate::Result<StatusCode> {
    let description: SessionDescription = decode(&payload)?;
    registry.submit_description(id, description).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Long-poll. Ends early with `cancelled` if the session is torn down, and is
/// dropped with the request if the client goes away.
async fn await_description(
    State(registry): State<Registry>,
    Params((id, role)): Params<(SessionId, Role)>,
) -> crate::Result<Json<SessionDescription>> {
    Ok(Json(registry.await_description(id, role).await?))
}

async fn submit_candidate(
    State(registry): State<Registry>,
    payload: Bytes,
) -> crate::Result<StatusCode> {
    let candidate: Candidate = decode(&payload)?;
    registry.submit_candidate(candidate).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn complete_candidates(
    State(registry): State<Registry>,
    Params((id, role)): Params<(SessionId, Role)>,
) -> crate::Result<StatusCode> {
    registry.complete_candidates(id, role).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The transport serving `role`: one JSON candidate per line, for as long as
/// the opposite role keeps sending.
async fn candidate_stream(
    State(registry): State<Registry>,
    Params((id, role)): Params<(SessionId, Role)>,
) -> crate::Result<Response> {
    let rx = registry.attach(id, role).await?;
    let lines = stream::unfold(rx, |mut rx| async move {
        let candidate = rx.recv().await?;
        let line = serde_json::to_string(&candidate).map(|mut line| {
            line.push('\n');
            line
        });
        Some((line, rx))
    });
    let headers = [(header::CONTENT_TYPE, "application/x-ndjson")];
    Ok((headers, Body::from_stream(lines)).into_response())
}
