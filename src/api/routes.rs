//! Route handlers for the NZB endpoints

use crate::api::state::AppState;
use crate::db::{NzbInfo, NzbStatus, generate_id};
use crate::error::{Error, Result};
use crate::fetch::{NzbFileBlob, hash_link};
use crate::nzb::Nzb;
use crate::resolver::StreamOptions;
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{error, info};
use utoipa::ToSchema;

use crate::types::ContentFile;

// ============================================================================
// Response types
// ============================================================================

/// One segment in a parse response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NzbSegmentResponse {
    /// Declared encoded size
    pub bytes: u64,
    /// 1-based segment number
    pub number: u32,
    /// Message-id
    pub message_id: String,
}

/// One file in a parse response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NzbFileResponse {
    /// Derived filename
    pub name: String,
    /// Raw subject
    pub subject: String,
    /// Poster address
    pub poster: String,
    /// Post date
    pub date: DateTime<Utc>,
    /// Newsgroups
    pub groups: Vec<String>,
    /// Declared size
    pub size: u64,
    /// Segments in order
    pub segments: Vec<NzbSegmentResponse>,
}

/// Response for `POST /usenet/nzb/parse`
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NzbParseResponse {
    /// Head metadata
    pub meta: HashMap<String, String>,
    /// Total declared size
    pub size: u64,
    /// Files in derived order
    pub files: Vec<NzbFileResponse>,
}

/// A persisted NZB record
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NzbResponse {
    /// Record id
    pub id: String,
    /// Link hash
    pub hash: String,
    /// Display name
    pub name: String,
    /// Total declared size
    pub size: i64,
    /// File count
    pub file_count: i64,
    /// Archive password
    pub password: String,
    /// Source link
    pub url: String,
    /// Inspected content records
    pub files: Vec<ContentFile>,
    /// Whether the content is streamable
    pub streamable: bool,
    /// Whether the raw NZB blob is cached
    pub cached: bool,
    /// Lifecycle status
    pub status: String,
    /// Owning user
    pub user: String,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Response for upload/requeue: the queued processing job
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct QueueItemResponse {
    /// Record id
    pub id: String,
    /// Link hash
    pub hash: String,
    /// Display name
    pub name: String,
    /// Lifecycle status
    pub status: String,
}

fn to_nzb_response(state: &AppState, info: &NzbInfo) -> NzbResponse {
    NzbResponse {
        id: info.id.clone(),
        hash: info.hash.clone(),
        name: info.name.clone(),
        size: info.size,
        file_count: info.file_count,
        password: info.password.clone(),
        url: info.url.clone(),
        files: info.content_files(),
        streamable: info.streamable,
        cached: state.fetcher.is_cached(&info.hash),
        status: info.status.clone(),
        user: info.user.clone(),
        created_at: info.created_at,
        updated_at: info.updated_at,
    }
}

fn to_parse_response(nzb: &Nzb) -> NzbParseResponse {
    NzbParseResponse {
        meta: nzb.meta.clone(),
        size: nzb.total_size(),
        files: nzb
            .files
            .iter()
            .map(|file| NzbFileResponse {
                name: file.name().to_string(),
                subject: file.subject.clone(),
                poster: file.poster.clone(),
                date: Utc
                    .timestamp_opt(file.date, 0)
                    .single()
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
                groups: file.groups.clone(),
                size: file.size(),
                segments: file
                    .segments
                    .iter()
                    .map(|segment| NzbSegmentResponse {
                        bytes: segment.bytes,
                        number: segment.number,
                        message_id: segment.message_id.clone(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Read the single `file` field (plus an optional `name`) out of a
/// multipart form
async fn read_multipart_nzb(
    mut multipart: Multipart,
    max_size: u64,
) -> Result<(Bytes, String, Option<String>)> {
    let mut blob: Option<(Bytes, String)> = None;
    let mut name: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Parse { message: format!("invalid multipart body: {e}"), source: None })?
    {
        match field.name() {
            Some("file") => {
                if blob.is_some() {
                    return Err(Error::Parse { message: "multiple files provided".to_string(), source: None });
                }
                let filename = field.file_name().unwrap_or("upload.nzb").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::Parse { message: format!("failed to read file field: {e}"), source: None })?;
                if data.len() as u64 > max_size {
                    return Err(Error::TooLarge {
                        size: data.len() as u64,
                        max: max_size,
                    });
                }
                blob = Some((data, filename));
            }
            Some("name") => {
                name = field.text().await.ok().filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    let (data, filename) = blob.ok_or_else(|| Error::Parse { message: "missing file".to_string(), source: None })?;
    Ok((data, filename, name))
}

/// `POST /usenet/nzb/parse`
pub async fn parse_nzb(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<NzbParseResponse>> {
    let (blob, _, _) = read_multipart_nzb(multipart, state.config.fetch.nzb_file_max_size).await?;
    let nzb = Nzb::parse(&blob)?;
    Ok(Json(to_parse_response(&nzb)))
}

/// `POST /usenet/nzb/upload`
pub async fn upload_nzb(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<QueueItemResponse>> {
    let (blob, mut filename, form_name) =
        read_multipart_nzb(multipart, state.config.fetch.nzb_file_max_size).await?;

    let nzb = Nzb::parse(&blob)?;

    if !filename.ends_with(".nzb") {
        filename.push_str(".nzb");
    }

    let id = generate_id();
    let link = format!("upload://{id}");
    let hash = hash_link(&link);

    state.fetcher.cache_blob(
        &hash,
        NzbFileBlob {
            blob: blob.clone(),
            name: filename.clone(),
            link: link.clone(),
            fetched_at: Utc::now(),
        },
    );

    let name = form_name
        .or_else(|| nzb.meta("title").map(str::to_string))
        .unwrap_or(filename);

    let info = NzbInfo {
        id: id.clone(),
        hash: hash.clone(),
        name: name.clone(),
        size: nzb.total_size() as i64,
        file_count: nzb.file_count() as i64,
        password: nzb.meta("password").unwrap_or_default().to_string(),
        url: link,
        user: String::new(),
        date: earliest_post_date(&nzb),
        status: NzbStatus::Pending.as_str().to_string(),
        content_files_json: "[]".to_string(),
        streamable: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    state.db.upsert(&info).await?;

    spawn_inspection(state.clone(), info.clone());

    Ok(Json(QueueItemResponse {
        id,
        hash,
        name,
        status: NzbStatus::Pending.as_str().to_string(),
    }))
}

/// `GET /usenet/nzb`
pub async fn list_nzbs(State(state): State<AppState>) -> Result<Json<Vec<NzbResponse>>> {
    let rows = state.db.get_all().await?;
    Ok(Json(
        rows.iter().map(|info| to_nzb_response(&state, info)).collect(),
    ))
}

/// `DELETE /usenet/nzb/{id}`
pub async fn delete_nzb(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let info = state
        .db
        .get_by_id(&id)
        .await?
        .ok_or_else(|| Error::NotFound("nzb info not found".to_string()))?;

    state.db.delete_by_id(&id).await?;
    state.fetcher.delete(&info.url);

    Ok(StatusCode::NO_CONTENT)
}

/// `POST /usenet/nzb/{id}/requeue`
pub async fn requeue_nzb(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueItemResponse>> {
    let info = state
        .db
        .get_by_id(&id)
        .await?
        .ok_or_else(|| Error::NotFound("nzb info not found".to_string()))?;

    state
        .db
        .update_status(&info.hash, NzbStatus::Pending)
        .await?;
    spawn_inspection(state.clone(), info.clone());

    Ok(Json(QueueItemResponse {
        id: info.id,
        hash: info.hash,
        name: info.name,
        status: NzbStatus::Pending.as_str().to_string(),
    }))
}

/// `GET /usenet/nzb/{id}/xml`
pub async fn get_nzb_xml(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    let info = state
        .db
        .get_by_id(&id)
        .await?
        .ok_or_else(|| Error::NotFound("nzb info not found".to_string()))?;

    let blob = state
        .fetcher
        .get_cached(&info.hash)
        .ok_or_else(|| Error::NotFound("nzb file not available".to_string()))?;

    let headers = [
        (header::CONTENT_TYPE, "application/xml".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!(r#"inline; filename="{}""#, blob.name),
        ),
        (header::CONTENT_LENGTH, blob.blob.len().to_string()),
    ];
    Ok((headers, blob.blob).into_response())
}

/// `GET /usenet/nzb/{id}/download/{path...}`
///
/// The wildcard path's segments joined with `::` form the content path.
/// Honours single-range `Range` requests through the seekable stream.
pub async fn download_content(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    if path.is_empty() {
        return Err(Error::Parse { message: "missing path".to_string(), source: None });
    }

    let info = state
        .db
        .get_by_id(&id)
        .await?
        .ok_or_else(|| Error::NotFound("nzb info not found".to_string()))?;

    let blob = match state.fetcher.get_cached(&info.hash) {
        Some(blob) => blob,
        None => state.fetcher.fetch(&info.url, &info.name).await?,
    };
    let nzb = Arc::new(Nzb::parse(&blob.blob)?);

    let opts = StreamOptions {
        password: info.password.clone(),
        segment_buffer_size: 0,
        content_files: info.content_files(),
    };

    let content_path: Vec<String> = path
        .trim_matches('/')
        .split("::")
        .map(str::to_string)
        .collect();

    let mut stream = state
        .pool
        .stream_by_content_path(&nzb, &content_path, &opts)
        .await?;

    let total = stream.size;
    let content_type = stream.content_type.clone();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, total));

    match range {
        None => {
            let body = Body::from_stream(ReaderStream::new(stream));
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, total.to_string())
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?)
        }
        Some(None) => Ok(Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{total}"))
            .body(Body::empty())
            .map_err(|e| Error::Io(std::io::Error::other(e)))?),
        Some(Some((start, end))) => {
            stream.seek(std::io::SeekFrom::Start(start)).await?;
            let len = end - start + 1;
            let body = Body::from_stream(ReaderStream::new(stream.take(len)));
            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, len.to_string())
                .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?)
        }
    }
}

/// Parse a single-range `Range` header against a known total size
///
/// Returns `None` for unsatisfiable or unsupported forms; the inner pair
/// is `(start, end)` inclusive.
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None; // multi-range unsupported
    }
    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        // Suffix form: last N bytes
        let n: u64 = end_str.parse().ok()?;
        if n == 0 || total == 0 {
            return None;
        }
        let start = total.saturating_sub(n);
        return Some((start, total - 1));
    }

    let start: u64 = start_str.parse().ok()?;
    if start >= total {
        return None;
    }
    let end = if end_str.is_empty() {
        total - 1
    } else {
        end_str.parse::<u64>().ok()?.min(total - 1)
    };
    (start <= end).then_some((start, end))
}

/// Run the post-upload inspection in the background, mirroring the
/// process-NZB job: parse, inspect, persist content and status.
fn spawn_inspection(state: AppState, info: NzbInfo) {
    tokio::spawn(async move {
        if let Err(err) = inspect_and_store(&state, &info).await {
            error!(id = info.id, error = %err, "nzb inspection failed");
            let _ = state.db.update_status(&info.hash, NzbStatus::Failed).await;
        }
    });
}

async fn inspect_and_store(state: &AppState, info: &NzbInfo) -> Result<()> {
    let blob = match state.fetcher.get_cached(&info.hash) {
        Some(blob) => blob,
        None => state.fetcher.fetch(&info.url, &info.name).await?,
    };
    let nzb = Arc::new(Nzb::parse(&blob.blob)?);

    state
        .db
        .update_status(&info.hash, NzbStatus::Downloading)
        .await?;

    let password = if info.password.is_empty() {
        nzb.meta("password").unwrap_or_default().to_string()
    } else {
        info.password.clone()
    };

    let content = state.pool.inspect_nzb_content(&nzb, &password).await?;
    let status = if content.streamable {
        NzbStatus::Downloaded
    } else {
        NzbStatus::Failed
    };

    info!(
        id = info.id,
        files = content.files.len(),
        streamable = content.streamable,
        "nzb inspected"
    );

    state
        .db
        .update_content(&info.hash, &content.files, content.streamable, status)
        .await?;
    Ok(())
}

fn earliest_post_date(nzb: &Nzb) -> Option<DateTime<Utc>> {
    nzb.files
        .iter()
        .filter(|f| f.date > 0)
        .map(|f| f.date)
        .min()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
