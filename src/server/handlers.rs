use super::state::AppState;
use crate::catalog;
use crate::db::{BookFilter, ReadingStatus, User};
use crate::download::DownloadOutcome;
use crate::error::{AppError, Result};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;

// ============================================================================
// HELPERS
// ============================================================================

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Require an authenticated user.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let token = bearer_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;
    state.auth.validate_token(token)
}

/// Resolve the optional user. No token means the anonymous bundle; a token
/// that does not validate is still an error, not a silent downgrade.
fn maybe_user(state: &AppState, headers: &HeaderMap) -> Result<Option<User>> {
    match bearer_token(headers) {
        Some(token) => state.auth.validate_token(token).map(Some),
        None => Ok(None),
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let user = authenticate(state, headers)?;
    if user.role != "admin" {
        return Err(AppError::Forbidden("Admin access required".to_string()));
    }
    Ok(user)
}

// ============================================================================
// HEALTH
// ============================================================================

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "title": state.config.server.title,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================================
// AUTH API
// ============================================================================

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub name: Option<String>,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub expires_at: i64,
    pub user: User,
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let user = state
        .auth
        .register(&request.email, request.name.as_deref(), &request.password)?;
    let (user, session) = state.auth.login(&user.email, &request.password)?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            token: session.token,
            expires_at: session.expires_at,
            user,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<SessionResponse>> {
    let (user, session) = state.auth.login(&request.email, &request.password)?;
    Ok(Json(SessionResponse {
        token: session.token,
        expires_at: session.expires_at,
        user,
    }))
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode> {
    if let Some(token) = bearer_token(&headers) {
        state.auth.logout(token)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<User>> {
    Ok(Json(authenticate(&state, &headers)?))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChangePasswordRequest>,
) -> Result<StatusCode> {
    let user = authenticate(&state, &headers)?;
    // Re-check the current password before accepting a new one
    state.auth.login(&user.email, &request.current_password)?;
    state
        .auth
        .change_password(&user.email, &request.new_password)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// BOOK HANDLERS
// ============================================================================

#[derive(Deserialize, Default)]
pub struct BookQuery {
    pub q: Option<String>,
    pub genre: Option<String>,
    #[serde(default)]
    pub featured: bool,
    #[serde(default)]
    pub bestseller: bool,
    #[serde(default)]
    pub new_release: bool,
    #[serde(default)]
    pub free: bool,
}

#[derive(Serialize)]
pub struct BookResponse {
    #[serde(flatten)]
    pub book: crate::db::Book,
    pub tags_list: Vec<String>,
}

fn book_response(book: crate::db::Book) -> BookResponse {
    let tags_list = catalog::split_tags(book.tags.as_deref());
    BookResponse { book, tags_list }
}

pub async fn list_books(
    State(state): State<AppState>,
    Query(query): Query<BookQuery>,
) -> Result<Json<Vec<BookResponse>>> {
    let filter = BookFilter {
        query: query.q,
        genre: query.genre,
        featured: query.featured,
        bestseller: query.bestseller,
        new_release: query.new_release,
        free: query.free,
    };
    let books = state.db.list_books(&filter)?;
    Ok(Json(books.into_iter().map(book_response).collect()))
}

pub async fn get_book(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BookResponse>> {
    let book = state
        .db
        .get_book(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", id)))?;
    Ok(Json(book_response(book)))
}

pub async fn create_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse> {
    require_admin(&state, &headers)?;
    let book = catalog::book_from_payload(&payload, &state.config.storage)
        .ok_or_else(|| AppError::InvalidRequest("Title and author are required".to_string()))?;
    state.db.create_book(&book)?;
    tracing::info!(book = %book.id, title = %book.title, "Book created");
    Ok((StatusCode::CREATED, Json(book_response(book))))
}

pub async fn update_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(mut payload): Json<Value>,
) -> Result<Json<BookResponse>> {
    require_admin(&state, &headers)?;
    let existing = state
        .db
        .get_book(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", id)))?;

    // Updates are whole-record: merge the payload over the stored record
    // first so partial payloads keep existing fields.
    let mut merged = serde_json::to_value(&existing)
        .map_err(|e| AppError::Internal(format!("Failed to serialize book: {}", e)))?;
    if let (Some(base), Some(incoming)) = (merged.as_object_mut(), payload.as_object_mut()) {
        for (key, value) in incoming.iter_mut() {
            base.insert(key.clone(), value.take());
        }
    }

    let mut book = catalog::book_from_payload(&merged, &state.config.storage)
        .ok_or_else(|| AppError::InvalidRequest("Title and author are required".to_string()))?;
    book.id = existing.id;
    book.created_at = existing.created_at;
    if !state.db.update_book(&book)? {
        return Err(AppError::NotFound(format!("Book '{}' not found", id)));
    }
    Ok(Json(book_response(book)))
}

pub async fn delete_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    require_admin(&state, &headers)?;
    if !state.db.delete_book(&id)? {
        return Err(AppError::NotFound(format!("Book '{}' not found", id)));
    }
    tracing::info!(book = %id, "Book deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// DOWNLOAD API
// ============================================================================

#[derive(Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "type", default = "default_download_type")]
    pub download_type: String,
}

fn default_download_type() -> String {
    "pdf".to_string()
}

pub async fn download_book(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let user = maybe_user(&state, &headers)?;
    let book = state
        .db
        .get_book(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", id)))?;

    // Paid books require a logged-in buyer
    if !book.is_free && book.price > 0.0 {
        let user = user
            .as_ref()
            .ok_or_else(|| AppError::Unauthorized("Login required for paid books".to_string()))?;
        if !state.payments.has_paid(&user.id, &book).await? {
            return Err(AppError::Forbidden(
                "Book must be purchased before download".to_string(),
            ));
        }
    }

    let user_id = user.as_ref().map(|u| u.id.as_str());
    match state
        .downloads
        .download(user_id, &book, &query.download_type)
        .await?
    {
        DownloadOutcome::Saved { path, file_name } => {
            let file = tokio::fs::File::open(&path).await?;
            let stream = ReaderStream::new(file);
            let content_type = if query.download_type == "audio" {
                "audio/mpeg"
            } else {
                "application/pdf"
            };
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(
                    header::CONTENT_DISPOSITION,
                    format!(
                        "attachment; filename=\"{}\"",
                        urlencoding::encode(&file_name)
                    ),
                )
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| Response::default()))
        }
        DownloadOutcome::DirectLink(url) => Ok(Redirect::temporary(&url).into_response()),
    }
}

pub async fn preview_book(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Redirect> {
    let book = state
        .db
        .get_book(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", id)))?;
    let url = state.downloads.preview_url(&book)?;
    Ok(Redirect::temporary(&url))
}

pub async fn list_downloads(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let downloads = state
        .bundles
        .downloads(user.as_ref().map(|u| u.id.as_str()))?;
    Ok(Json(json!({ "downloads": downloads })))
}

pub async fn remove_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<String>,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let user_id = user.as_ref().map(|u| u.id.as_str());
    let removed = state.bundles.remove_download(user_id, &book_id)?;
    Ok(Json(json!({ "removed": removed })))
}

// ============================================================================
// FAVORITES API
// ============================================================================

#[derive(Deserialize)]
pub struct FavoriteRequest {
    pub book_id: String,
}

pub async fn list_favorites(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let favorites = state
        .bundles
        .favorites(user.as_ref().map(|u| u.id.as_str()))?;
    Ok(Json(json!({ "favorites": favorites })))
}

pub async fn add_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FavoriteRequest>,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let book = state
        .db
        .get_book(&request.book_id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", request.book_id)))?;

    let user_id = user.as_ref().map(|u| u.id.as_str());
    let added = state.bundles.add_favorite(user_id, &book)?;
    if added {
        if let Some(user_id) = user_id {
            state.db.add_favorite(user_id, &book.id)?;
        }
    }
    Ok(Json(json!({ "added": added })))
}

pub async fn remove_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<String>,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let user_id = user.as_ref().map(|u| u.id.as_str());
    let removed = state.bundles.remove_favorite(user_id, &book_id)?;
    if let Some(user_id) = user_id {
        state.db.remove_favorite(user_id, &book_id)?;
    }
    Ok(Json(json!({ "removed": removed })))
}

// ============================================================================
// LIBRARY API
// ============================================================================

#[derive(Deserialize)]
pub struct LibraryUpdateRequest {
    pub reading_status: ReadingStatus,
    #[serde(default)]
    pub progress: f64,
}

pub async fn get_library(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let library = state
        .bundles
        .library(user.as_ref().map(|u| u.id.as_str()))?;
    Ok(Json(json!({ "library": library })))
}

pub async fn get_bundle(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::userdata::UserBundle>> {
    let user = maybe_user(&state, &headers)?;
    Ok(Json(
        state.bundles.bundle(user.as_ref().map(|u| u.id.as_str()))?,
    ))
}

pub async fn get_stats(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let stats = state.bundles.stats(user.as_ref().map(|u| u.id.as_str()))?;
    Ok(Json(json!({ "stats": stats })))
}

pub async fn update_library_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<String>,
    Json(request): Json<LibraryUpdateRequest>,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let book = state
        .db
        .get_book(&book_id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", book_id)))?;
    if !(0.0..=1.0).contains(&request.progress) {
        return Err(AppError::InvalidRequest(
            "Progress must be between 0 and 1".to_string(),
        ));
    }

    let user_id = user.as_ref().map(|u| u.id.as_str());
    let item = state.bundles.set_reading_status(
        user_id,
        &book,
        request.reading_status,
        request.progress,
    )?;
    if let Some(user_id) = user_id {
        state.db.upsert_library_entry(
            user_id,
            &book.id,
            request.reading_status,
            request.progress,
        )?;
    }
    Ok(Json(json!({ "entry": item })))
}

pub async fn remove_library_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(book_id): Path<String>,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let user_id = user.as_ref().map(|u| u.id.as_str());
    let removed = state.bundles.remove_library_item(user_id, &book_id)?;
    if let Some(user_id) = user_id {
        state.db.remove_library_entry(user_id, &book_id)?;
    }
    Ok(Json(json!({ "removed": removed })))
}

pub async fn repair_library(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let user = maybe_user(&state, &headers)?;
    let user_id = user.as_ref().map(|u| u.id.as_str());
    let covers = state.bundles.repair_cover_urls(user_id)?;
    let links = state.bundles.repair_attachment_urls(user_id)?;
    Ok(Json(json!({ "covers_fixed": covers, "links_fixed": links })))
}

// ============================================================================
// PAYMENTS API
// ============================================================================

#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub book_id: String,
}

pub async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<impl IntoResponse> {
    let user = authenticate(&state, &headers)?;
    let book = state
        .db
        .get_book(&request.book_id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", request.book_id)))?;
    let session = state.payments.checkout(&user, &book).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    #[serde(rename = "OrderTrackingId")]
    pub order_tracking_id: String,
    #[serde(rename = "OrderMerchantReference")]
    pub order_merchant_reference: Option<String>,
}

pub async fn payment_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<Value>> {
    tracing::info!(
        tracking = %query.order_tracking_id,
        reference = query.order_merchant_reference.as_deref().unwrap_or("-"),
        "Gateway callback received"
    );
    let payment = state.payments.callback(&query.order_tracking_id).await?;
    Ok(Json(json!({
        "payment_id": payment.id,
        "status": payment.status,
    })))
}

pub async fn payment_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<crate::db::Payment>> {
    let user = authenticate(&state, &headers)?;
    let payment = state.payments.verify(&id).await?;
    if payment.user_id != user.id && user.role != "admin" {
        return Err(AppError::Forbidden("Not your payment".to_string()));
    }
    Ok(Json(payment))
}

#[derive(Deserialize)]
pub struct OwnershipQuery {
    pub book_id: String,
}

pub async fn payment_ownership(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<OwnershipQuery>,
) -> Result<Json<Value>> {
    let user = authenticate(&state, &headers)?;
    let book = state
        .db
        .get_book(&query.book_id)?
        .ok_or_else(|| AppError::NotFound(format!("Book '{}' not found", query.book_id)))?;
    Ok(Json(json!({
        "book_id": book.id,
        "owned": state.payments.has_paid(&user.id, &book).await?,
    })))
}

// ============================================================================
// ADMIN API
// ============================================================================

pub async fn admin_list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>> {
    require_admin(&state, &headers)?;
    Ok(Json(state.db.list_users()?))
}

#[derive(Deserialize)]
pub struct RoleRequest {
    pub role: String,
}

pub async fn admin_set_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(request): Json<RoleRequest>,
) -> Result<StatusCode> {
    require_admin(&state, &headers)?;
    if request.role != "admin" && request.role != "user" {
        return Err(AppError::InvalidRequest(format!(
            "Unknown role '{}'",
            request.role
        )));
    }
    if !state.db.set_user_role(&user_id, &request.role)? {
        return Err(AppError::NotFound(format!("User '{}' not found", user_id)));
    }
    tracing::info!(user = %user_id, role = %request.role, "User role changed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct ActiveRequest {
    pub is_active: bool,
}

pub async fn admin_set_active(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(request): Json<ActiveRequest>,
) -> Result<StatusCode> {
    let admin = require_admin(&state, &headers)?;
    if admin.id == user_id && !request.is_active {
        return Err(AppError::InvalidRequest(
            "Cannot deactivate your own account".to_string(),
        ));
    }
    if !state.db.set_user_active(&user_id, request.is_active)? {
        return Err(AppError::NotFound(format!("User '{}' not found", user_id)));
    }
    tracing::info!(user = %user_id, active = request.is_active, "User account state changed");
    Ok(StatusCode::NO_CONTENT)
}
