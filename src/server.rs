use axum::body::Body;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::TryStreamExt;
use serde::Serialize;
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;

use crate::bucket::{Bucket, ReadRange};
use crate::datamodel::{FileId, FileRecord, Metadata};
use crate::error::BucketError;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub fn router(bucket: Bucket) -> Router {
    Router::new()
        .route("/files", post(create).get(list))
        .route("/files/{id}", get(stream_by_id).delete(remove_by_id))
        .layer(TraceLayer::new_for_http())
        .with_state(bucket)
}

#[derive(Serialize)]
struct UploadResponse {
    message: &'static str,
    id: FileId,
}

#[derive(Serialize)]
struct RemoveResponse {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

/// Stores the request body as a new file named by the `filename` header.
async fn create(
    State(bucket): State<Bucket>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadResponse>, ApiError> {
    let filename = header_str(&headers, "filename")?
        .ok_or_else(|| BucketError::Data("missing `filename` header".into()))?;

    let mut metadata = Metadata::new();
    if let Some(content_type) = header_str(&headers, header::CONTENT_TYPE.as_str())? {
        metadata.insert("contentType".into(), content_type.into());
    }

    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let record = bucket
        .upload(filename, metadata, StreamReader::new(stream))
        .await?;

    Ok(Json(UploadResponse {
        message: "OK",
        id: record.id,
    }))
}

/// Streams the contents of a file, optionally restricted to `?start=&end=`.
async fn stream_by_id(
    State(bucket): State<Bucket>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<ReadRange>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = path?;
    let Query(range) = query?;
    let id: FileId = id.parse()?;
    let handle = bucket.open_read(id, range).await?;

    let content_type = HeaderValue::from_str(
        handle
            .record()
            .content_type()
            .unwrap_or(DEFAULT_CONTENT_TYPE),
    )
    .unwrap_or(HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    let content_length = handle.len();

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_LENGTH, HeaderValue::from(content_length)),
        ],
        Body::from_stream(handle.into_stream()),
    )
        .into_response())
}

async fn remove_by_id(
    State(bucket): State<Bucket>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<RemoveResponse>, ApiError> {
    let Path(id) = path?;
    let id: FileId = id.parse()?;
    let removal = bucket.remove_by_id(id).await?;

    Ok(Json(RemoveResponse {
        message: removal.message(),
        warning: removal.warning,
    }))
}

async fn list(State(bucket): State<Bucket>) -> Result<Json<Vec<FileRecord>>, ApiError> {
    let records = bucket.list().try_collect().await?;
    Ok(Json(records))
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Result<Option<&'h str>, BucketError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| BucketError::Data(format!("`{name}` header is not valid text")))
        })
        .transpose()
}

/// A `BucketError` rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError(BucketError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            BucketError::NotFound(_) | BucketError::ChunkNotFound { .. } => StatusCode::NOT_FOUND,
            BucketError::Conflict(_) | BucketError::AlreadyExists(_) => StatusCode::CONFLICT,
            BucketError::Data(_) => StatusCode::BAD_REQUEST,
            BucketError::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
            BucketError::Corrupted { .. } | BucketError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<BucketError> for ApiError {
    fn from(err: BucketError) -> Self {
        Self(err)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(BucketError::Data(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(BucketError::Data(rejection.body_text()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.0, "api error");
        } else {
            tracing::debug!(status = %status, error = %self.0, "api error");
        }

        let body = Json(ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::BucketConfig;
    use crate::datamodel::mem_impl::MemStore;

    fn app() -> Router {
        let store = Arc::new(MemStore::new());
        let config = BucketConfig {
            chunk_size: 4,
            ..Default::default()
        };
        router(Bucket::with_stores(store.clone(), store, &config).unwrap())
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body.to_vec())
    }

    async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, _, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    async fn upload(app: &Router, filename: &str, contents: &'static [u8]) -> String {
        let request = Request::post("/files")
            .header("filename", filename)
            .header("content-type", "text/plain")
            .body(Body::from(contents))
            .unwrap();
        let (status, json) = send_json(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "OK");
        json["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_upload_and_stream() {
        let app = app();
        let id = upload(&app, "hello.txt", b"hello, chunked world").await;

        let request = Request::get(format!("/files/{id}")).body(Body::empty()).unwrap();
        let (status, headers, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CONTENT_LENGTH], "20");
        assert_eq!(body, b"hello, chunked world");

        let request = Request::get(format!("/files/{id}?start=7&end=14"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"chunked");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let app = app();
        let first = upload(&app, "first.txt", b"one").await;
        let second = upload(&app, "second.txt", b"two").await;
        let third = upload(&app, "third.txt", b"three").await;

        let request = Request::delete(format!("/files/{second}"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], format!("File {second} is deleted"));
        assert!(json.get("warning").is_none());

        let request = Request::delete(format!("/files/{second}"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "NotFound");

        let request = Request::get("/files").body(Body::empty()).unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let records = json.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], first.as_str());
        assert_eq!(records[0]["filename"], "first.txt");
        assert_eq!(records[0]["length"], 3);
        assert_eq!(records[0]["chunkSize"], 4);
        assert_eq!(records[0]["complete"], true);
        assert_eq!(records[0]["metadata"]["contentType"], "text/plain");
        assert_eq!(records[1]["id"], third.as_str());
    }

    #[tokio::test]
    async fn test_errors_are_json() {
        let app = app();

        let request = Request::get("/files/not-an-id").body(Body::empty()).unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "DataError");

        let missing = FileId::generate();
        let request = Request::get(format!("/files/{missing}"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "NotFound");
        assert_eq!(json["error"], format!("file {missing} not found"));

        let request = Request::post("/files")
            .body(Body::from("no name"))
            .unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "missing `filename` header");

        let id = upload(&app, "digits", b"0123456789").await;
        let request = Request::get(format!("/files/{id}?start=8&end=2"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "DataError");

        // malformed query strings and paths are rejected with the same JSON body
        for uri in [
            format!("/files/{id}?start=abc"),
            format!("/files/{id}?start=-1"),
            format!("/files/{id}?end=1.5"),
            "/files/%FF%FE".to_string(),
        ] {
            let request = Request::get(&uri).body(Body::empty()).unwrap();
            let (status, headers, body) = send(&app, request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(headers[header::CONTENT_TYPE], "application/json", "{uri}");
            let json: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["kind"], "DataError", "{uri}");
        }

        let request = Request::delete("/files/%FF%FE").body(Body::empty()).unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "DataError");
    }

    #[tokio::test]
    async fn test_storage_full() {
        let store = Arc::new(MemStore::with_capacity(8));
        let config = BucketConfig {
            chunk_size: 4,
            ..Default::default()
        };
        let app = router(Bucket::with_stores(store.clone(), store.clone(), &config).unwrap());

        let request = Request::post("/files")
            .header("filename", "big.bin")
            .body(Body::from(vec![0u8; 64]))
            .unwrap();
        let (status, json) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(json["kind"], "StorageFull");
        assert_eq!(store.used_bytes(), 0);

        let request = Request::get("/files").body(Body::empty()).unwrap();
        let (_, json) = send_json(&app, request).await;
        assert_eq!(json, serde_json::json!([]));
    }
}
