//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let auth_routes = Router::new()
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login))
        .route("/logout", post(handlers::logout))
        .route("/me", get(handlers::me))
        .route("/password", post(handlers::change_password));

    let book_routes = Router::new()
        .route("/", get(handlers::list_books))
        .route("/", post(handlers::create_book))
        .route("/{id}", get(handlers::get_book))
        .route("/{id}", put(handlers::update_book))
        .route("/{id}", delete(handlers::delete_book))
        .route("/{id}/download", get(handlers::download_book))
        .route("/{id}/preview", get(handlers::preview_book));

    let favorite_routes = Router::new()
        .route("/", get(handlers::list_favorites))
        .route("/", post(handlers::add_favorite))
        .route("/{book_id}", delete(handlers::remove_favorite));

    let library_routes = Router::new()
        .route("/", get(handlers::get_library))
        .route("/bundle", get(handlers::get_bundle))
        .route("/stats", get(handlers::get_stats))
        .route("/repair", post(handlers::repair_library))
        .route("/{book_id}", put(handlers::update_library_entry))
        .route("/{book_id}", delete(handlers::remove_library_entry));

    let payment_routes = Router::new()
        .route("/checkout", post(handlers::checkout))
        .route("/callback", get(handlers::payment_callback))
        .route("/ownership", get(handlers::payment_ownership))
        .route("/{id}/status", get(handlers::payment_status));

    let admin_routes = Router::new()
        .route("/users", get(handlers::admin_list_users))
        .route("/users/{id}/role", put(handlers::admin_set_role))
        .route("/users/{id}/active", put(handlers::admin_set_active));

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/downloads", get(handlers::list_downloads))
        .route("/api/downloads/{book_id}", delete(handlers::remove_download))
        .nest("/api/auth", auth_routes)
        .nest("/api/books", book_routes)
        .nest("/api/favorites", favorite_routes)
        .nest("/api/library", library_routes)
        .nest("/api/payments", payment_routes)
        .nest("/api/admin", admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until shutdown.
pub async fn run(config: Config, bind_override: Option<SocketAddr>) -> Result<()> {
    let bind = bind_override.unwrap_or(config.server.bind);
    let db = Database::open(&config.database.path)?;
    let state = AppState::new(config, db)?;

    // Periodic session cleanup
    let cleanup_db = state.db.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match cleanup_db.cleanup_expired_sessions() {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "Cleaned up expired sessions"),
                Err(e) => tracing::warn!(error = %e, "Session cleanup failed"),
            }
        }
    });

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "Server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
