//! HTTP handlers for media objects and transform requests.
//! Owner identity comes from the `x-owner-id` header; storage and caching are
//! delegated to `MediaService`, transforms to `TransformDispatcher`.

use crate::{
    errors::AppError,
    models::{media_object::MediaObject, message::TransformAck, transform::TransformSpec},
    services::media_service::PageRequest,
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

pub const OWNER_HEADER: &str = "x-owner-id";

/// Caller identity taken from the `x-owner-id` header.
#[derive(Debug, Clone, Copy)]
pub struct OwnerId(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "missing x-owner-id header"))?;
        raw.to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .map(OwnerId)
            .ok_or_else(|| AppError::bad_request("x-owner-id must be a uuid"))
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl From<PageQuery> for PageRequest {
    fn from(q: PageQuery) -> Self {
        PageRequest::new(q.page, q.limit)
    }
}

#[derive(Debug, Deserialize)]
pub struct TransformRequest {
    pub transformations: TransformSpec,
}

/// POST `/objects?filename=`: raw body upload.
pub async fn upload_object(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Query(q): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let limit = state.media.max_upload_bytes();
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| AppError::bad_request(format!("reading body: {err}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("upload exceeds the {limit} byte limit"),
            ));
        }
        buf.extend_from_slice(&chunk);
    }

    let object = state
        .media
        .upload(owner, q.filename.as_deref(), &content_type, buf.freeze())
        .await?;
    Ok((StatusCode::CREATED, Json(object)))
}

/// GET `/objects?page=&limit=`
pub async fn list_objects(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<MediaObject>>, AppError> {
    Ok(Json(state.media.list(owner, q.into()).await?))
}

/// GET `/objects/{id}`
pub async fn get_object(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<Json<MediaObject>, AppError> {
    Ok(Json(state.media.get(owner, id).await?))
}

/// GET `/objects/{id}/content`
pub async fn get_content(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (meta, bytes) = state.media.content(owner, id).await?;
    let length = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    set_object_headers(response.headers_mut(), &meta, length);
    Ok(response)
}

/// GET `/objects/{id}/derived?page=&limit=`
pub async fn list_derived(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<MediaObject>>, AppError> {
    Ok(Json(state.media.list_derived(owner, id, q.into()).await?))
}

/// DELETE `/objects/{id}`
pub async fn delete_object(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.media.delete(owner, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/objects/{id}/transform`: queue a transform; the result shows up
/// later under `/objects/{id}/derived`.
pub async fn transform_object(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
    payload: Result<Json<TransformRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TransformAck>), AppError> {
    let Json(request) = payload?;
    let ack = state
        .dispatcher
        .request_transform(owner, id, request.transformations)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

fn set_object_headers(headers: &mut HeaderMap, meta: &MediaObject, length: usize) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    if let Ok(value) = HeaderValue::from_str(&meta.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
