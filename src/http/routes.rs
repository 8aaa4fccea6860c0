//! HTTP endpoints.
//!
//! A thin, stateless reflector over jar and manager operations: every
//! request maps to exactly one operation, no long polls. All requests
//! must accept `application/json`; all responses, including errors,
//! are JSON.
//!
//! Identifiers that begin with `/` cannot travel in the path portion
//! of a URL, so `/cookiejar` supports both a path form
//! (`GET /cookiejar/some/id`) and a query form
//! (`GET /cookiejar?identifier=/some/id`); ids beginning with `/` must
//! use the latter.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::{header, StatusCode};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::JarError;
use crate::jar::CookieJarHandle;
use crate::processor::ProcessorManager;

#[derive(Clone)]
pub struct AppState {
    pub jar: CookieJarHandle,
    pub manager: Arc<ProcessorManager>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Builds the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/queue", get(queue_length))
        .route("/queue/reprocess", post(reprocess))
        .route("/cookiejar", get(fetch_by_query).delete(delete_by_query))
        .route("/cookiejar/{*id}", get(fetch_by_path).delete(delete_by_path))
        .route("/debug/threads", get(debug_threads))
        .layer(middleware::from_fn(require_json_accept))
        .with_state(state)
}

/// Rejects requests whose `Accept` header cannot take JSON.
async fn require_json_accept(request: Request, next: Next) -> Response {
    let acceptable = match request.headers().get(header::ACCEPT) {
        // An absent Accept header means "anything".
        None => true,
        Some(value) => value.to_str().ok().is_some_and(|accept| {
            accept.split(',').any(|part| {
                let media = part.split(';').next().unwrap_or("").trim();
                media.eq_ignore_ascii_case("application/json")
                    || media.eq_ignore_ascii_case("application/*")
                    || media == "*/*"
            })
        }),
    };

    if !acceptable {
        return error_response(
            StatusCode::NOT_ACCEPTABLE,
            "responses are application/json; adjust the Accept header",
        );
    }
    next.run(request).await
}

#[derive(Debug, Serialize)]
struct QueueLengthBody {
    queue_length: usize,
}

async fn queue_length(State(state): State<AppState>) -> Json<QueueLengthBody> {
    Json(QueueLengthBody {
        queue_length: state.jar.length().total(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct ReprocessBody {
    path: String,
}

async fn reprocess(
    State(state): State<AppState>,
    body: Result<Json<ReprocessBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    debug!("reprocess requested for {:?}", body.path);
    let jar = state.jar.clone();
    let id = body.path.clone();
    tokio::task::spawn_blocking(move || jar.mark_dirty(&id))
        .await
        .expect("mark_dirty task panicked");

    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
struct IdentifierQuery {
    identifier: String,
}

async fn fetch_by_path(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    fetch_cookie(state, id).await
}

async fn fetch_by_query(
    State(state): State<AppState>,
    query: Result<Query<IdentifierQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(query)) => fetch_cookie(state, query.identifier).await,
        Err(rejection) => error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    }
}

async fn fetch_cookie(state: AppState, id: String) -> Response {
    let jar = state.jar.clone();
    let fetched = tokio::task::spawn_blocking(move || jar.fetch(&id))
        .await
        .expect("fetch task panicked");

    match fetched {
        Ok(Some(cookie)) => Json(cookie.enrichments).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no such cookie"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_by_path(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    delete_cookie(state, id).await
}

async fn delete_by_query(
    State(state): State<AppState>,
    query: Result<Query<IdentifierQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(query)) => delete_cookie(state, query.identifier).await,
        Err(rejection) => error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    }
}

async fn delete_cookie(state: AppState, id: String) -> Response {
    let jar = state.jar.clone();
    let deleted = tokio::task::spawn_blocking(move || jar.delete(&id))
        .await
        .expect("delete task panicked");

    match deleted {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(JarError::NotFound) => error_response(StatusCode::NOT_FOUND, "no such cookie"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn debug_threads(State(state): State<AppState>) -> Response {
    Json(state.manager.dump_threads()).into_response()
}
