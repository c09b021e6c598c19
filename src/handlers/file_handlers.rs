//! HTTP handlers for file operations.
//! Streams file bodies to avoid buffering in memory and delegates
//! consistency concerns to `FileService`.

use crate::{
    errors::AppError,
    handlers::identity::Caller,
    models::file::FileRecord,
    services::{
        blob_store::{BlobError, BlobReader},
        file_service::{Download, FileError, FileService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::json;
use std::io::{self, SeekFrom};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Multipart form field carrying the upload.
pub const FILE_FIELD: &str = "file";

/// Characters allowed unencoded in an RFC 5987 `filename*` value.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// `POST /files`: upload the `file` part of a multipart form.
pub async fn upload_file(
    State(service): State<FileService>,
    Caller(owner): Caller,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or_default().to_string();
        let body = field.map(|chunk| chunk.map_err(io::Error::other));
        let record = service.upload(owner, &filename, body).await?;

        let location = HeaderValue::from_str(&format!("/files/{}", record.token));
        let mut response = (StatusCode::CREATED, Json(json!({ "file": record }))).into_response();
        if let Ok(location) = location {
            response.headers_mut().insert(header::LOCATION, location);
        }
        return Ok(response);
    }

    Err(AppError::bad_request(format!(
        "multipart form must include a `{FILE_FIELD}` field"
    )))
}

/// `GET /files/{token}`: stream the file as an attachment.
///
/// Honors `If-Modified-Since` and single-range `Range` requests. The
/// download is recorded once the last byte of the file has been handed to
/// the connection; a client that disconnects earlier is never recorded, and
/// neither are ranges that stop short of the end of the file.
pub async fn get_file(
    State(service): State<FileService>,
    Path(token): Path<String>,
    request_headers: HeaderMap,
) -> Result<Response, AppError> {
    let Download { record, blob } = service.open_download(&token).await?;
    let BlobReader {
        mut file,
        size,
        last_modified,
    } = blob;

    if not_modified_since(&request_headers, last_modified) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        set_last_modified(response.headers_mut(), last_modified);
        return Ok(response);
    }

    let (status, range) = match requested_range(request_headers.get(header::RANGE), size) {
        RangeRequest::Full => (StatusCode::OK, None),
        RangeRequest::Partial(range) => (StatusCode::PARTIAL_CONTENT, Some(range)),
        RangeRequest::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
    };

    let (start, len) = match range {
        Some(range) => (range.start, range.len()),
        None => (0, size),
    };
    if start > 0 {
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|err| FileError::Blob(BlobError::Io(err)))?;
    }
    let reaches_end = start + len == size;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    set_file_headers(headers, &record, len, last_modified);
    if let Some(range) = range {
        if let Ok(value) = HeaderValue::from_str(&format!(
            "bytes {}-{}/{}",
            range.start, range.end, size
        )) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }

    let audit = reaches_end.then_some((service, record));
    *response.body_mut() = audited_body(file.take(len), len, audit);
    Ok(response)
}

/// `DELETE /files/{token}`: delete a file owned by the caller.
pub async fn delete_file(
    State(service): State<FileService>,
    Caller(caller): Caller,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete(&token, caller).await?;
    Ok((
        StatusCode::OK,
        Json(json!({ "message": "file successfully deleted" })),
    ))
}

/// `GET /users/{id}/files`: list a user's uploads.
pub async fn list_user_files(
    State(service): State<FileService>,
    Path(user_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let files = service.list_for_user(user_id).await?;
    Ok(Json(json!({ "files": files })))
}

/// Stream `len` bytes from `reader`, starting the audit as soon as the
/// final chunk is yielded.
///
/// hyper stops polling a body once `Content-Length` bytes are written, so
/// the audit has to hang off the data itself rather than a trailing item.
fn audited_body<R>(reader: R, len: u64, audit: Option<(FileService, FileRecord)>) -> Body
where
    R: AsyncRead + Send + 'static,
{
    let mut pending = audit;
    if len == 0 {
        spawn_audit(pending.take());
    }

    let mut sent: u64 = 0;
    let stream = ReaderStream::new(reader).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            sent += bytes.len() as u64;
            if sent >= len {
                spawn_audit(pending.take());
            }
        }
    });
    Body::from_stream(stream)
}

fn spawn_audit(pending: Option<(FileService, FileRecord)>) {
    if let Some((service, observed)) = pending {
        tokio::spawn(async move {
            service.record_access(observed).await;
        });
    }
}

/// An inclusive byte range within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RangeRequest {
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Interpret a `Range` header against a file of `size` bytes.
///
/// Only a single `bytes=` range is served; anything else is answered with
/// the whole file.
fn requested_range(value: Option<&HeaderValue>, size: u64) -> RangeRequest {
    let Some(ranges) = value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
    else {
        return RangeRequest::Full;
    };
    if ranges.contains(',') {
        return RangeRequest::Full;
    }
    let Some((first, last)) = ranges.split_once('-') else {
        return RangeRequest::Full;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return RangeRequest::Full;
        };
        if suffix == 0 || size == 0 {
            return RangeRequest::Unsatisfiable;
        }
        return RangeRequest::Partial(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let Ok(start) = first.parse::<u64>() else {
        return RangeRequest::Full;
    };
    let end = if last.is_empty() {
        u64::MAX
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end,
            _ => return RangeRequest::Full,
        }
    };
    if start >= size {
        return RangeRequest::Unsatisfiable;
    }
    RangeRequest::Partial(ByteRange {
        start,
        end: end.min(size - 1),
    })
}

fn not_modified_since(headers: &HeaderMap, last_modified: DateTime<Utc>) -> bool {
    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .is_some_and(|since| last_modified.timestamp() <= since.timestamp())
}

fn set_file_headers(
    headers: &mut HeaderMap,
    record: &FileRecord,
    len: u64,
    last_modified: DateTime<Utc>,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&record.filename),
    );
    set_last_modified(headers, last_modified);
}

fn set_last_modified(headers: &mut HeaderMap, last_modified: DateTime<Utc>) {
    if let Ok(value) = HeaderValue::from_str(&last_modified.format(HTTP_DATE).to_string()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

/// `attachment` with a quoted ASCII `filename`, plus an RFC 5987
/// `filename*` when the real name does not survive as plain ASCII.
fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c == ' ' || c.is_ascii_graphic() => c,
            _ => '_',
        })
        .collect();

    let value = if fallback == filename {
        format!("attachment; filename=\"{fallback}\"")
    } else {
        format!(
            "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
            utf8_percent_encode(filename, ATTR_CHAR)
        )
    };
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
