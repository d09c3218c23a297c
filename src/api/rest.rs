//! Relay endpoint handlers.

use std::collections::HashMap;
use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bitcoin::hashes::sha256;
use serde::Serialize;

use crate::engine::{PledgeSource, ProjectSnapshot};
use crate::error::CheckError;
use crate::wire;

use super::AppState;

/// Structured error payload: `{kind, detail}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub detail: String,
}

fn error_response(status: StatusCode, err: &CheckError) -> Response {
    (status, Json(ErrorBody { kind: err.kind(), detail: err.to_string() })).into_response()
}

fn status_for(err: &CheckError) -> StatusCode {
    match err {
        CheckError::BadProject(_) => StatusCode::NOT_FOUND,
        CheckError::Unauthorized => StatusCode::UNAUTHORIZED,
        CheckError::Conflict | CheckError::DuplicatedOutpoint | CheckError::GoalExceeded => {
            StatusCode::CONFLICT
        }
        CheckError::Timeout
        | CheckError::Offline
        | CheckError::InconsistentUtxoAnswers
        | CheckError::ClaimBroadcastFailed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn binary(status: wire::ProjectStatus) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        wire::encode_delimited(&status),
    )
        .into_response()
}

fn not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        &CheckError::BadProject("unknown project".into()),
    )
}

/// `GET /project/{id}`: scrubbed status; with `?msg=&sig=` and a valid
/// auth-key signature over `msg`, the full status.
pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Ok(project_id) = sha256::Hash::from_str(&id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &CheckError::BadProject("unparseable project id".into()),
        );
    };
    let Some(snapshot): Option<ProjectSnapshot> = state.projects.get(&project_id) else {
        return not_found();
    };

    match (params.get("msg"), params.get("sig")) {
        (Some(msg), Some(sig)) => {
            let (Ok(msg), Ok(sig)) = (hex::decode(msg), hex::decode(sig)) else {
                return error_response(StatusCode::UNAUTHORIZED, &CheckError::Unauthorized);
            };
            if let Err(e) = snapshot.project.verify_auth(&msg, &sig) {
                return error_response(StatusCode::UNAUTHORIZED, &e);
            }
            // Replays of an already-seen challenge are throttled.
            if !state.nonces.lock().expect("nonce lock").admit(&msg) {
                return StatusCode::TOO_MANY_REQUESTS.into_response();
            }
            binary(snapshot.to_status(true))
        }
        _ => binary(snapshot.to_status(false)),
    }
}

/// `POST /project/{id}`: upload a pledge; replies with the updated
/// (scrubbed) status or a structured error.
pub async fn post_pledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(project_id) = sha256::Hash::from_str(&id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            &CheckError::BadProject("unparseable project id".into()),
        );
    };
    if state.projects.get(&project_id).is_none() {
        return not_found();
    }
    match state.engine.submit_pledge(PledgeSource::HttpUpload, body.to_vec()).await {
        Ok(status) => binary(status),
        Err(e) => error_response(status_for(&e), &e),
    }
}
