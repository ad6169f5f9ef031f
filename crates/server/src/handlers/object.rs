//! Data-object handlers: GET/HEAD/POST/DELETE on any upstream path.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCEPT, ACCEPT_RANGES, ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
    IF_NONE_MATCH, RANGE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use irobot_core::range::{ByteRange, parse_range_header};
use irobot_core::{Datatype, Status};
use irobot_precache::checksummer::ChunkChecksum;
use irobot_precache::{EntityHandle, OpenMode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

/// Streaming body read size (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Media type for raw object data.
pub const MEDIA_DATA: &str = "application/octet-stream";
/// Media type for object metadata.
pub const MEDIA_METADATA: &str = "application/vnd.irobot.metadata+json";
/// Media type for ETA responses.
pub const MEDIA_ETA: &str = "application/vnd.irobot.eta";

/// Representations a data-object request can select.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Media {
    Data,
    Metadata,
}

/// Fallback handler: every path that is not an admin endpoint names a data
/// object on the upstream.
pub async fn data_object(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let headers = req.headers().clone();
    let deadline = state.config.httpd.timeout();

    let result = if method == Method::GET || method == Method::HEAD {
        tokio::time::timeout(deadline, get_object(&state, &path, &headers)).await
    } else if method == Method::POST {
        tokio::time::timeout(deadline, post_object(&state, &path)).await
    } else if method == Method::DELETE {
        tokio::time::timeout(deadline, delete_object(&state, &path)).await
    } else if method == Method::OPTIONS {
        return options_response();
    } else {
        return ApiError::MethodNotAllowed.into_response();
    };

    let response = match result {
        // The deadline fired first; any work we kicked off continues and
        // benefits later requestors
        Err(_) => ApiError::Deadline.into_response(),
        Ok(Err(e)) => e.into_response(),
        Ok(Ok(response)) => response,
    };

    if method == Method::HEAD {
        // Identical headers (Content-Length included), no body
        let (parts, _body) = response.into_parts();
        Response::from_parts(parts, Body::empty())
    } else {
        response
    }
}

fn options_response() -> Response {
    (
        StatusCode::NO_CONTENT,
        [(ALLOW, "GET, HEAD, POST, DELETE, OPTIONS")],
    )
        .into_response()
}

async fn get_object(state: &AppState, path: &str, headers: &HeaderMap) -> ApiResult<Response> {
    let media = negotiate(headers.get(ACCEPT).and_then(|v| v.to_str().ok()))?;

    let no_cache = headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"));

    let mode = if no_cache {
        OpenMode::ForceRefetch
    } else if media == Media::Metadata {
        OpenMode::MetadataOnly
    } else {
        OpenMode::Existing
    };

    let opened = state.precache.open(path, mode).await?;
    match media {
        Media::Metadata => serve_metadata(opened.handle, headers).await,
        Media::Data => serve_data(state, opened.handle, headers).await,
    }
}

async fn serve_metadata(handle: EntityHandle, headers: &HeaderMap) -> ApiResult<Response> {
    let etag = entity_tag(&handle);
    if if_none_match(headers, &etag) {
        return Ok(not_modified(&etag));
    }

    let body = tokio::fs::read(handle.metadata_path())
        .await
        .map_err(|e| ApiError::Internal(format!("metadata sidecar unreadable: {e}")))?;

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, MEDIA_METADATA.to_string()),
            (CONTENT_LENGTH, body.len().to_string()),
            (ETAG, etag),
        ],
        Body::from(body),
    )
        .into_response())
}

async fn serve_data(
    state: &AppState,
    handle: EntityHandle,
    headers: &HeaderMap,
) -> ApiResult<Response> {
    let etag = entity_tag(&handle);
    if if_none_match(headers, &etag) {
        return Ok(not_modified(&etag));
    }

    let range_header = headers.get(RANGE).and_then(|v| v.to_str().ok());

    // Range responses align to the checksum table, so they additionally wait
    // on the checksum slot
    let gate = if range_header.is_some() {
        Datatype::Checksums
    } else {
        Datatype::Data
    };
    if handle.current_status(Datatype::Data) != Status::Finished
        || handle.current_status(gate) != Status::Finished
    {
        return eta_response(state, &handle, gate, &etag).await;
    }

    let size = handle.metadata().size;
    match range_header {
        Some(value) => {
            let ranges = parse_range_header(value, size).map_err(|e| ApiError::BadRange {
                description: e.to_string(),
                size,
            })?;
            serve_ranges(state, handle, &ranges, size, etag).await
        }
        None => serve_whole(handle, size, etag).await,
    }
}

/// 202 with the `iRobot-ETA` header (when rates allow an estimate).
async fn eta_response(
    state: &AppState,
    handle: &EntityHandle,
    datatype: Datatype,
    etag: &str,
) -> ApiResult<Response> {
    let mut response = (
        StatusCode::ACCEPTED,
        [(CONTENT_TYPE, MEDIA_ETA), (ETAG, etag)],
    )
        .into_response();

    if let Some(eta) = state.precache.eta(handle.id(), datatype).await
        && let Ok(value) = HeaderValue::from_str(&eta.to_header_value())
    {
        response.headers_mut().insert("iRobot-ETA", value);
    }
    Ok(response)
}

async fn serve_whole(handle: EntityHandle, size: u64, etag: String) -> ApiResult<Response> {
    let file = tokio::fs::File::open(handle.data_path())
        .await
        .map_err(|e| ApiError::Internal(format!("data artifact unreadable: {e}")))?;

    let stream = async_stream::stream! {
        // The handle rides along so the entity stays pinned while streaming
        let _pin = handle;
        let mut file = file;
        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, MEDIA_DATA.to_string()),
            (CONTENT_LENGTH, size.to_string()),
            (ACCEPT_RANGES, "bytes".to_string()),
            (ETAG, etag),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// 206 `multipart/byteranges`: one part per checksum chunk touched by the
/// requested ranges, each carrying the chunk's own ETag from the sidecar.
async fn serve_ranges(
    state: &AppState,
    handle: EntityHandle,
    ranges: &[ByteRange],
    size: u64,
    etag: String,
) -> ApiResult<Response> {
    let table = state.precache.chunk_table(&handle).await.map_err(|e| {
        ApiError::Internal(format!("checksum sidecar unreadable: {e}"))
    })?;

    let parts: Vec<ChunkChecksum> = table
        .into_iter()
        .filter(|chunk| {
            ranges
                .iter()
                .any(|r| r.start < chunk.offset + chunk.length && chunk.offset < r.end)
        })
        .collect();

    let boundary = Uuid::new_v4().simple().to_string();
    let content_type = format!("multipart/byteranges; boundary={boundary}");
    let data_path = handle.data_path();

    let stream = async_stream::stream! {
        let _pin = handle;
        let mut file = match tokio::fs::File::open(&data_path).await {
            Ok(file) => file,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
        for part in parts {
            let header = format!(
                "--{boundary}\r\nContent-Type: {MEDIA_DATA}\r\nContent-Range: bytes {}-{}/{size}\r\nETag: \"{}\"\r\n\r\n",
                part.offset,
                part.offset + part.length - 1,
                part.md5,
            );
            yield Ok(Bytes::from(header));

            if let Err(e) = file.seek(std::io::SeekFrom::Start(part.offset)).await {
                yield Err(e);
                return;
            }
            let mut remaining = part.length as usize;
            while remaining > 0 {
                let want = STREAM_CHUNK_SIZE.min(remaining);
                match file.read(&mut buf[..want]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        remaining -= n;
                        yield Ok(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            yield Ok(Bytes::from_static(b"\r\n"));
        }
        yield Ok(Bytes::from(format!("--{boundary}--\r\n")));
    };

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [(CONTENT_TYPE, content_type), (ETAG, etag)],
        Body::from_stream(stream),
    )
        .into_response())
}

/// POST: force refetch and prime the precache.
async fn post_object(state: &AppState, path: &str) -> ApiResult<Response> {
    let opened = state.precache.open(path, OpenMode::ForceRefetch).await?;
    let etag = entity_tag(&opened.handle);

    if opened.refetched {
        eta_response(state, &opened.handle, Datatype::Data, &etag).await
    } else {
        Ok((StatusCode::CREATED, [(ETAG, etag)]).into_response())
    }
}

async fn delete_object(state: &AppState, path: &str) -> ApiResult<Response> {
    state.precache.delete(path).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn entity_tag(handle: &EntityHandle) -> String {
    format!("\"{}\"", handle.metadata().checksum)
}

fn not_modified(etag: &str) -> Response {
    (StatusCode::NOT_MODIFIED, [(ETAG, etag.to_string())]).into_response()
}

fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    let Some(value) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    value == "*"
        || value
            .split(',')
            .any(|candidate| candidate.trim().trim_start_matches("W/") == etag)
}

/// Pick the representation from the `Accept` header; absent means data.
fn negotiate(accept: Option<&str>) -> ApiResult<Media> {
    let Some(accept) = accept else {
        return Ok(Media::Data);
    };

    let mut best: Option<(f32, Media)> = None;
    for item in accept.split(',') {
        let mut params = item.split(';');
        let media_range = params.next().unwrap_or("").trim();

        let quality: f32 = params
            .filter_map(|p| p.trim().strip_prefix("q="))
            .next()
            .and_then(|q| q.parse().ok())
            .unwrap_or(1.0);

        let media = match media_range {
            MEDIA_DATA | "application/*" | "*/*" | "*" => Media::Data,
            MEDIA_METADATA => Media::Metadata,
            _ => continue,
        };

        // Strictly greater: ties keep the earlier listing
        if best.is_none_or(|(q, _)| quality > q) {
            best = Some((quality, media));
        }
    }

    best.map(|(_, media)| media)
        .ok_or_else(|| ApiError::Unacceptable(accept.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_defaults_to_data() {
        assert_eq!(negotiate(None).unwrap(), Media::Data);
        assert_eq!(negotiate(Some("*/*")).unwrap(), Media::Data);
        assert_eq!(negotiate(Some(MEDIA_DATA)).unwrap(), Media::Data);
    }

    #[test]
    fn negotiation_selects_metadata() {
        assert_eq!(negotiate(Some(MEDIA_METADATA)).unwrap(), Media::Metadata);
        // Quality ordering wins over listing order
        assert_eq!(
            negotiate(Some(
                "application/octet-stream;q=0.1, application/vnd.irobot.metadata+json"
            ))
            .unwrap(),
            Media::Metadata
        );
    }

    #[test]
    fn negotiation_rejects_unknown_types() {
        assert!(negotiate(Some("text/html")).is_err());
        assert!(negotiate(Some("image/png, text/plain;q=0.5")).is_err());
    }

    #[test]
    fn if_none_match_handles_lists_and_wildcards() {
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"abc\", \"def\""));
        assert!(if_none_match(&headers, "\"def\""));
        assert!(!if_none_match(&headers, "\"zzz\""));

        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(if_none_match(&headers, "\"anything\""));
    }
}
