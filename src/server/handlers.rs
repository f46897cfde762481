//! HTTP request handlers.

use crate::db::{self, Book, CatalogTable, Job, ReadingStatus};
use crate::error::{AppError, Result};
use crate::formats::{BookFormat, cover};
use crate::ingest::Payload;
use crate::opds::{self, ACQUISITION_FEED, CatalogEntry, FeedBuilder};
use crate::server::AppState;
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

// ============================================================================
// OPDS CATALOG
// ============================================================================

/// OpenSearch description.
pub async fn opensearch(State(state): State<AppState>) -> impl IntoResponse {
    let xml = opds::generate_opensearch(&state.config.server.title, &state.base_url());
    build_response(StatusCode::OK, "application/opensearchdescription+xml", xml)
}

/// Acquisition feed of the whole catalog.
pub async fn opds_root(State(state): State<AppState>) -> Result<Response<Body>> {
    let base_url = state.base_url();
    let books = state.all_books()?;

    let feed = FeedBuilder::new("urn:ebook-shelf:catalog", &state.config.server.title)
        .author("ebook-shelf")
        .self_link(format!("{}/opds", base_url))
        .start_link(format!("{}/opds", base_url))
        .search_link(format!("{}/opds/opensearch.xml", base_url));

    render_feed(&state, feed, books)
}

/// Search query parameters.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: String,
}

/// Search feed.
pub async fn opds_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Response<Body>> {
    let base_url = state.base_url();
    let books = state.search(&params.q)?;

    let feed = FeedBuilder::new(
        format!("urn:ebook-shelf:search:{}", params.q),
        format!("Search: {}", params.q),
    )
    .self_link(format!(
        "{}/opds/search?q={}",
        base_url,
        urlencoding::encode(&params.q)
    ))
    .start_link(format!("{}/opds", base_url));

    render_feed(&state, feed, books)
}

fn render_feed(state: &AppState, mut feed: FeedBuilder, books: Vec<Book>) -> Result<Response<Body>> {
    let base_url = state.base_url();
    for book in books {
        feed = feed.book_entry(&state.catalog_entry(book)?, &base_url);
    }
    Ok(build_response(StatusCode::OK, ACQUISITION_FEED, feed.build()))
}

// ============================================================================
// UPLOAD API
// ============================================================================

/// Upload one book and wait until it is catalogued.
///
/// The job is cancelled if the client goes away before it finishes.
pub async fn book_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<Book>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let payload = read_files(multipart)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::InvalidRequest("No file in request".to_string()))?;

    let book = state.pipeline.ingest_single(user.id, payload).await?;
    Ok(Json(book))
}

/// Upload several books; returns the queued jobs immediately.
pub async fn book_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<Job>>)> {
    let user = get_authenticated_user(&state, &headers).await?;
    let payloads = read_files(multipart).await?;
    if payloads.is_empty() {
        return Err(AppError::InvalidRequest("No files in request".to_string()));
    }

    let jobs = state.pipeline.ingest_batch(user.id, payloads)?;
    Ok((StatusCode::ACCEPTED, Json(jobs)))
}

/// Import a tar.gz of books as a batch.
///
/// Expects an `archive` file field and an optional `map_tags` field
/// (`true`/`1`) that turns the entry directories into tags.
pub async fn book_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<Job>>)> {
    let user = get_authenticated_user(&state, &headers).await?;

    let mut archive = None;
    let mut map_tags = false;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "map_tags" => {
                let value = field.text().await.map_err(multipart_error)?;
                map_tags = matches!(value.trim(), "true" | "1" | "on");
            }
            "archive" => archive = Some(field.bytes().await.map_err(multipart_error)?),
            _ => {}
        }
    }

    let archive =
        archive.ok_or_else(|| AppError::InvalidRequest("Missing 'archive' field".to_string()))?;
    let jobs = state
        .pipeline
        .import_archive(user.id, archive.to_vec(), map_tags)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(jobs)))
}

/// Collect every file field of a multipart body.
async fn read_files(mut multipart: Multipart) -> Result<Vec<Payload>> {
    let mut payloads = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field.bytes().await.map_err(multipart_error)?;
        tracing::debug!(file_name = %file_name, size = data.len(), "Received upload");
        payloads.push(Payload::Multipart {
            file_name,
            data: data.to_vec(),
        });
    }
    Ok(payloads)
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    AppError::InvalidRequest(format!("Failed to read multipart field: {}", e))
}

/// Job list query parameters.
#[derive(Debug, Deserialize)]
pub struct JobParams {
    #[serde(default = "default_job_limit")]
    limit: usize,
}

fn default_job_limit() -> usize {
    50
}

/// Most recent jobs of the current user.
pub async fn job_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<JobParams>,
) -> Result<Json<Vec<Job>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let jobs = state.store.app.list_jobs(user.id, params.limit.min(500))?;
    Ok(Json(jobs))
}

// ============================================================================
// BOOK HANDLERS
// ============================================================================

/// Books owned by the current user.
pub async fn book_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Book>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.store.user_books(user.id)?))
}

/// Book metadata (JSON).
pub async fn book_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<CatalogEntry>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = state.owned_book(user.id, id)?;
    Ok(Json(state.catalog_entry(book)?))
}

/// Book download.
///
/// Unauthenticated so OPDS readers can follow acquisition links.
pub async fn book_download(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response<Body>> {
    let book = state
        .store
        .book(id)?
        .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", id)))?;

    let path = std::path::Path::new(&book.path);
    let file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();
    let body = Body::from_stream(ReaderStream::new(file));

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.epub", book.id));
    let content_disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, BookFormat::Epub.mime_type())
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .header(header::CONTENT_LENGTH, file_size)
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Book cover image.
pub async fn book_cover(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response<Body>> {
    let not_found = || AppError::NotFound(format!("No cover for book {}", id));

    let book = state.store.book(id)?.ok_or_else(not_found)?;
    let cover_path = std::path::Path::new(&book.path)
        .parent()
        .and_then(cover::find_cover)
        .ok_or_else(not_found)?;
    let data = tokio::fs::read(&cover_path).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, cover::cover_mime(&cover_path))
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from(data))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Reading status update.
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    status: String,
    current_page: Option<i64>,
    percentage: Option<f64>,
}

/// Get the reading status of a book.
pub async fn book_status_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Option<ReadingStatus>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    state.owned_book(user.id, id)?;
    Ok(Json(state.store.app.get_reading_status(user.id, id)?))
}

/// Set the reading status of a book.
pub async fn book_status_put(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Json<ReadingStatus>> {
    let user = get_authenticated_user(&state, &headers).await?;
    state.owned_book(user.id, id)?;

    if !matches!(req.status.as_str(), "unread" | "reading" | "finished") {
        return Err(AppError::InvalidRequest(format!(
            "Unknown reading status: {}",
            req.status
        )));
    }
    if let Some(percentage) = req.percentage
        && !(0.0..=100.0).contains(&percentage)
    {
        return Err(AppError::InvalidRequest(
            "Percentage must be between 0 and 100".to_string(),
        ));
    }

    let status = ReadingStatus {
        user_id: user.id,
        book_id: id,
        status: req.status,
        current_page: req.current_page,
        percentage: req.percentage,
        last_read: db::now_timestamp(),
    };
    state.store.app.save_reading_status(&status)?;
    Ok(Json(status))
}

// ============================================================================
// AUTH API
// ============================================================================

/// Login request.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
    device_id: Option<String>,
}

/// Login response.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    token: String,
    user_id: i64,
    username: String,
    role: String,
}

/// Register request.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    username: String,
    password: String,
}

/// Auth login.
pub async fn auth_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let (user, token) = state
        .auth
        .login(&req.username, &req.password, req.device_id)?;

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Auth register.
pub async fn auth_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<LoginResponse>> {
    state.auth.register(&req.username, &req.password)?;
    let (user, token) = state.auth.login(&req.username, &req.password, None)?;

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        username: user.username,
        role: user.role,
    }))
}

/// Auth logout.
pub async fn auth_logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    if let Some(token) = extract_token(&headers) {
        state.auth.logout(&token)?;
    }
    Ok(StatusCode::OK)
}

/// Get current user info.
pub async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<db::User>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(user))
}

// ============================================================================
// STATS API
// ============================================================================

/// Catalog and pipeline counters.
#[derive(Serialize)]
pub struct StatsResponse {
    books: i64,
    authors: i64,
    publishers: i64,
    tags: i64,
    cached_books: usize,
    waiting_uploads: usize,
}

/// API: Get library statistics.
pub async fn api_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let catalog = &state.store.catalog;
    Ok(Json(StatsResponse {
        books: catalog.count(CatalogTable::Books)?,
        authors: catalog.count(CatalogTable::Authors)?,
        publishers: catalog.count(CatalogTable::Publishers)?,
        tags: catalog.count(CatalogTable::Tags)?,
        cached_books: state.store.books.len(),
        waiting_uploads: state.pipeline.pending(),
    }))
}

// ============================================================================
// HELPERS
// ============================================================================

/// Extract token from Authorization header.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Get authenticated user from token.
async fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<db::User> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    state
        .auth
        .validate_token(&token)?
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired token".to_string()))
}
