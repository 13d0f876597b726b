//! Book file download orchestration.
//!
//! Fetching goes through a strategy chain: forced-attachment URL first, the
//! plain delivery URL second, and a direct-link handoff last when the bytes
//! cannot be pulled server-side. A 401 from the CDN marks the file private
//! and stops the chain immediately, since retrying other URL shapes cannot
//! fix missing authorization.

use crate::catalog;
use crate::config::StorageConfig;
use crate::db::{Book, Database};
use crate::error::{AppError, Result};
use crate::userdata::BundleStore;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;

/// How a requested download was fulfilled.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// File bytes were fetched and written under the downloads directory.
    Saved { path: PathBuf, file_name: String },
    /// Bytes could not be pulled server-side; the client should follow
    /// this URL directly.
    DirectLink(String),
}

/// Download orchestrator.
#[derive(Clone)]
pub struct DownloadService {
    client: reqwest::Client,
    storage: StorageConfig,
    db: Database,
    bundles: BundleStore,
}

impl DownloadService {
    pub fn new(storage: StorageConfig, db: Database, bundles: BundleStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            storage,
            db,
            bundles,
        })
    }

    /// Pick the source URL for a book and download type.
    pub fn resolve_source(&self, book: &Book, download_type: &str) -> Result<String> {
        let url = match download_type {
            "audio" => book.audio_url.clone(),
            _ => book.pdf_url.clone().or_else(|| {
                book.pdf_public_id
                    .as_deref()
                    .map(|id| catalog::attachment_url_for_public_id(&self.storage, id))
            }),
        };
        url.ok_or_else(|| {
            AppError::NotFound(format!(
                "Book '{}' has no {} file",
                book.title, download_type
            ))
        })
    }

    /// Fetch one URL. A 401 is terminal for the whole chain.
    async fn fetch(&self, url: &str, accept: Option<&str>) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(reqwest::header::ACCEPT, accept);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(AppError::PrivateFile(
                "File is private and cannot be downloaded".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(AppError::Gateway(format!(
                "Download failed with status {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Run the strategy chain and return the raw bytes, or the URL to hand
    /// to the client when both fetches failed for non-auth reasons.
    async fn fetch_with_fallback(&self, source_url: &str) -> Result<std::result::Result<Vec<u8>, String>> {
        let attachment_url = catalog::to_attachment_url(source_url);

        // The attachment fetch asks for raw bytes so the CDN never swaps in
        // an HTML viewer page.
        match self.fetch(&attachment_url, Some("application/octet-stream")).await {
            Ok(bytes) => return Ok(Ok(bytes)),
            Err(e @ AppError::PrivateFile(_)) => return Err(e),
            Err(e) => {
                tracing::debug!(url = %attachment_url, error = %e, "Attachment fetch failed, trying plain URL");
            }
        }

        match self.fetch(source_url, None).await {
            Ok(bytes) => Ok(Ok(bytes)),
            Err(e @ AppError::PrivateFile(_)) => Err(e),
            Err(e) => {
                tracing::warn!(url = %source_url, error = %e, "Server-side fetch failed, handing back direct link");
                Ok(Err(attachment_url))
            }
        }
    }

    /// Download a book file for a user.
    ///
    /// On success the file lands in the downloads directory and the user's
    /// bundle records the download. The catalog-wide download counter is
    /// bumped best-effort; a counter failure never fails the download.
    pub async fn download(
        &self,
        user_id: Option<&str>,
        book: &Book,
        download_type: &str,
    ) -> Result<DownloadOutcome> {
        let source_url = self.resolve_source(book, download_type)?;

        let outcome = match self.fetch_with_fallback(&source_url).await? {
            Ok(bytes) => {
                let file_name = build_file_name(&book.title, download_type);
                tokio::fs::create_dir_all(&self.storage.downloads_dir).await?;
                // Cached files are keyed by book id, never by title: two
                // books may share a title but must not share a path.
                let path = self
                    .storage
                    .downloads_dir
                    .join(cache_file_name(&book.id, download_type));
                tokio::fs::write(&path, &bytes).await?;
                tracing::info!(book = %book.id, file = %file_name, bytes = bytes.len(), "Book downloaded");
                DownloadOutcome::Saved { path, file_name }
            }
            Err(direct_url) => DownloadOutcome::DirectLink(direct_url),
        };

        self.bundles.add_download(user_id, book, download_type)?;

        if let Some(user_id) = user_id {
            if let Err(e) = self.db.record_download(user_id, &book.id, download_type) {
                tracing::warn!(book = %book.id, error = %e, "Failed to record download history");
            }
        }
        if let Err(e) = self.db.increment_downloads(&book.id) {
            tracing::warn!(book = %book.id, error = %e, "Failed to bump download counter");
        }

        Ok(outcome)
    }

    /// URL for in-browser preview. Unlike downloads, previews use the plain
    /// delivery URL so the browser can render inline.
    pub fn preview_url(&self, book: &Book) -> Result<String> {
        book.pdf_url
            .clone()
            .or_else(|| {
                book.pdf_public_id.as_deref().map(|id| {
                    format!(
                        "{}/raw/upload/{}",
                        self.storage.cdn_base_url.trim_end_matches('/'),
                        id
                    )
                })
            })
            .ok_or_else(|| AppError::NotFound(format!("Book '{}' has no preview", book.title)))
    }
}

fn type_extension(download_type: &str) -> &'static str {
    if download_type == "audio" { "mp3" } else { "pdf" }
}

/// Turn a book title into a safe file name with the right extension. Used
/// for the client-facing download name only, never for on-disk paths.
fn build_file_name(title: &str, download_type: &str) -> String {
    let stem: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .to_string();
    let stem = if stem.is_empty() { "book".to_string() } else { stem };
    format!("{}.{}", stem, type_extension(download_type))
}

/// On-disk cache name for a book file, keyed by book id.
fn cache_file_name(book_id: &str, download_type: &str) -> String {
    let id: String = book_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.{}", id, type_extension(download_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_timestamp;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn book_with_pdf(url: &str) -> Book {
        let now = now_timestamp();
        Book {
            id: "b1".to_string(),
            title: "Test Book".to_string(),
            author: "Author".to_string(),
            description: None,
            short_description: None,
            genre: None,
            tags: None,
            publisher: None,
            isbn: None,
            language: None,
            pages: None,
            rating: 0.0,
            total_ratings: 0,
            downloads: 0,
            audio_url: None,
            pdf_url: Some(url.to_string()),
            pdf_public_id: None,
            cover_url: None,
            cover_public_id: None,
            is_featured: false,
            is_bestseller: false,
            is_new_release: false,
            is_free: true,
            price: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    fn service(dir: &TempDir) -> DownloadService {
        let storage = StorageConfig {
            downloads_dir: dir.path().join("downloads"),
            ..StorageConfig::default()
        };
        let db = Database::open_memory().unwrap();
        let bundles = BundleStore::new(
            dir.path().join("userdata"),
            StorageConfig::default(),
        )
        .unwrap();
        DownloadService::new(storage, db, bundles).unwrap()
    }

    #[tokio::test]
    async fn test_download_saves_file_and_records_bundle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upload/fl_attachment/book.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 content".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let book = book_with_pdf(&format!("{}/upload/book.pdf", server.uri()));

        let outcome = svc.download(Some("u1"), &book, "pdf").await.unwrap();
        match outcome {
            DownloadOutcome::Saved { path, file_name } => {
                assert_eq!(file_name, "Test Book.pdf");
                assert_eq!(std::fs::read(path).unwrap(), b"%PDF-1.4 content");
            }
            DownloadOutcome::DirectLink(_) => panic!("expected saved file"),
        }

        let downloads = svc.bundles.downloads(Some("u1")).unwrap();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].download_count, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_stops_the_chain() {
        let server = MockServer::start().await;
        // 401 on the attachment URL; plain URL must never be tried
        Mock::given(method("GET"))
            .and(path("/upload/fl_attachment/book.pdf"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/upload/book.pdf"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let book = book_with_pdf(&format!("{}/upload/book.pdf", server.uri()));

        let err = svc.download(Some("u1"), &book, "pdf").await.unwrap_err();
        assert!(matches!(err, AppError::PrivateFile(_)));
        // Nothing recorded for a failed download
        assert!(svc.bundles.downloads(Some("u1")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plain_url_fallback_after_attachment_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upload/fl_attachment/book.pdf"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/upload/book.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bytes".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let book = book_with_pdf(&format!("{}/upload/book.pdf", server.uri()));

        let outcome = svc.download(None, &book, "pdf").await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Saved { .. }));
    }

    #[tokio::test]
    async fn test_direct_link_when_both_fetches_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let book = book_with_pdf(&format!("{}/upload/book.pdf", server.uri()));

        let outcome = svc.download(None, &book, "pdf").await.unwrap();
        match outcome {
            DownloadOutcome::DirectLink(url) => {
                assert!(url.contains("/upload/fl_attachment/"));
            }
            DownloadOutcome::Saved { .. } => panic!("expected direct link"),
        }
        // The download still counts even when handed off
        let downloads = svc.bundles.downloads(None).unwrap();
        assert_eq!(downloads.len(), 1);
    }

    #[tokio::test]
    async fn test_same_title_books_keep_separate_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upload/fl_attachment/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"first book".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/upload/fl_attachment/b.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"second book".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let svc = service(&dir);
        let mut a = book_with_pdf(&format!("{}/upload/a.pdf", server.uri()));
        a.id = "a1".to_string();
        a.title = "Faith".to_string();
        let mut b = book_with_pdf(&format!("{}/upload/b.pdf", server.uri()));
        b.id = "b2".to_string();
        b.title = "Faith".to_string();

        let DownloadOutcome::Saved { path: path_a, .. } = svc.download(None, &a, "pdf").await.unwrap()
        else {
            panic!("expected saved file");
        };
        let DownloadOutcome::Saved { path: path_b, .. } = svc.download(None, &b, "pdf").await.unwrap()
        else {
            panic!("expected saved file");
        };

        assert_ne!(path_a, path_b);
        assert_eq!(std::fs::read(path_a).unwrap(), b"first book");
        assert_eq!(std::fs::read(path_b).unwrap(), b"second book");
    }

    #[test]
    fn test_build_file_name_sanitizes() {
        assert_eq!(build_file_name("My Book: A/Story", "pdf"), "My Book_ A_Story.pdf");
        assert_eq!(build_file_name("Hymns", "audio"), "Hymns.mp3");
        assert_eq!(build_file_name("///", "pdf"), "___.pdf");
        assert_eq!(cache_file_name("a/b c", "audio"), "a_b_c.mp3");
    }
}
