//! File-backed per-user data bundles.
//!
//! Favorites, download history and the personal library are kept as one JSON
//! document per user under the configured data directory, separate from the
//! SQL catalog. Requests without an authenticated user fall back to a shared
//! `anonymous` bundle. All mutation goes through a single in-process lock;
//! each change rewrites the whole file via a temp-file rename, and mutations
//! that change nothing skip the write.

use crate::catalog;
use crate::config::StorageConfig;
use crate::db::{Book, ReadingStatus, now_timestamp};
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bundle name used when no user is authenticated.
const ANONYMOUS: &str = "anonymous";

/// Denormalized book snapshot carried inside bundle entries, so the client
/// can render lists without a catalog round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookSnapshot {
    pub book_id: String,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub cover_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub price: f64,
}

impl BookSnapshot {
    pub fn from_book(book: &Book) -> Self {
        Self {
            book_id: book.id.clone(),
            title: book.title.clone(),
            author: book.author.clone(),
            cover_url: book.cover_url.clone().unwrap_or_default(),
            pdf_url: book.pdf_url.clone(),
            is_free: book.is_free,
            price: book.price,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteEntry {
    #[serde(flatten)]
    pub book: BookSnapshot,
    pub added_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadEntry {
    #[serde(flatten)]
    pub book: BookSnapshot,
    pub download_type: String,
    pub download_count: i64,
    pub first_downloaded_at: i64,
    pub last_downloaded_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryItem {
    #[serde(flatten)]
    pub book: BookSnapshot,
    pub reading_status: ReadingStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub is_downloaded: bool,
    #[serde(default)]
    pub is_favorite: bool,
    pub added_at: i64,
    pub updated_at: i64,
}

/// One user's complete bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserBundle {
    #[serde(default)]
    pub favorites: Vec<FavoriteEntry>,
    #[serde(default)]
    pub downloads: Vec<DownloadEntry>,
    #[serde(default)]
    pub library: Vec<LibraryItem>,
}

/// Aggregate counts for a bundle.
#[derive(Debug, Clone, Serialize)]
pub struct BundleStats {
    pub favorites: usize,
    pub downloads: usize,
    pub total_download_count: i64,
    pub library: usize,
    pub completed: usize,
}

/// Store of per-user JSON bundles.
#[derive(Clone)]
pub struct BundleStore {
    dir: PathBuf,
    storage: StorageConfig,
    lock: Arc<Mutex<()>>,
}

impl BundleStore {
    pub fn new(dir: PathBuf, storage: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            storage,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Path of a user's bundle file. `None` maps to the shared anonymous
    /// bundle, which every unauthenticated visitor reads and writes.
    pub fn bundle_path(&self, user_id: Option<&str>) -> PathBuf {
        let name = user_id.unwrap_or(ANONYMOUS);
        self.dir.join(format!("{}.json", name))
    }

    fn read_bundle(&self, path: &Path) -> Result<UserBundle> {
        if !path.exists() {
            return Ok(UserBundle::default());
        }
        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(UserBundle::default());
        }
        serde_json::from_str(&data)
            .map_err(|e| AppError::Internal(format!("Corrupt user data file: {}", e)))
    }

    fn write_bundle(&self, path: &Path, bundle: &UserBundle) -> Result<()> {
        let data = serde_json::to_string_pretty(bundle)
            .map_err(|e| AppError::Internal(format!("Failed to serialize user data: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        user_id: Option<&str>,
        f: impl FnOnce(&mut UserBundle) -> T,
    ) -> Result<T> {
        let _guard = self.lock.lock();
        let path = self.bundle_path(user_id);
        let mut bundle = self.read_bundle(&path)?;
        let before = serde_json::to_string(&bundle)
            .map_err(|e| AppError::Internal(format!("Failed to serialize user data: {}", e)))?;
        let out = f(&mut bundle);
        let after = serde_json::to_string(&bundle)
            .map_err(|e| AppError::Internal(format!("Failed to serialize user data: {}", e)))?;
        if after != before {
            self.write_bundle(&path, &bundle)?;
        }
        Ok(out)
    }

    /// Load a user's full bundle.
    pub fn bundle(&self, user_id: Option<&str>) -> Result<UserBundle> {
        let _guard = self.lock.lock();
        self.read_bundle(&self.bundle_path(user_id))
    }

    // ========== FAVORITES ==========

    pub fn favorites(&self, user_id: Option<&str>) -> Result<Vec<FavoriteEntry>> {
        Ok(self.bundle(user_id)?.favorites)
    }

    /// Add a favorite. Returns false when the book was already favorited;
    /// the existing entry is left untouched. New favorites go to the front
    /// so listings come back newest-first. The library entry gains the
    /// favorite flag and fresh snapshot fields, keeping its download state.
    pub fn add_favorite(&self, user_id: Option<&str>, book: &Book) -> Result<bool> {
        self.mutate(user_id, |bundle| {
            if bundle.favorites.iter().any(|f| f.book.book_id == book.id) {
                return false;
            }
            bundle.favorites.insert(
                0,
                FavoriteEntry {
                    book: BookSnapshot::from_book(book),
                    added_at: now_timestamp(),
                },
            );
            Self::merge_library(bundle, book, LibraryMerge::Favorite);
            true
        })
    }

    /// Remove a favorite. Idempotent, always true. The library entry loses
    /// its favorite flag; when nothing else keeps it alive (no download, no
    /// chosen status) it drops out of the derived library entirely.
    pub fn remove_favorite(&self, user_id: Option<&str>, book_id: &str) -> Result<bool> {
        self.mutate(user_id, |bundle| {
            bundle.favorites.retain(|f| f.book.book_id != book_id);
            if let Some(pos) = bundle.library.iter().position(|l| l.book.book_id == book_id) {
                let item = &mut bundle.library[pos];
                item.is_favorite = false;
                item.updated_at = now_timestamp();
                if !item.is_downloaded && item.reading_status == ReadingStatus::Visited {
                    bundle.library.remove(pos);
                }
            }
            true
        })
    }

    pub fn is_favorite(&self, user_id: Option<&str>, book_id: &str) -> Result<bool> {
        Ok(self
            .bundle(user_id)?
            .favorites
            .iter()
            .any(|f| f.book.book_id == book_id))
    }

    // ========== DOWNLOADS ==========

    pub fn downloads(&self, user_id: Option<&str>) -> Result<Vec<DownloadEntry>> {
        Ok(self.bundle(user_id)?.downloads)
    }

    /// Record a download. One entry per (book, type); repeats only bump the
    /// counter and timestamp, so the count is monotonic. Returns the new
    /// count. The library entry gains the downloaded flag and pdf URL.
    pub fn add_download(
        &self,
        user_id: Option<&str>,
        book: &Book,
        download_type: &str,
    ) -> Result<i64> {
        self.mutate(user_id, |bundle| {
            let now = now_timestamp();
            let count = match bundle
                .downloads
                .iter_mut()
                .find(|d| d.book.book_id == book.id && d.download_type == download_type)
            {
                Some(entry) => {
                    entry.download_count += 1;
                    entry.last_downloaded_at = now;
                    entry.book = BookSnapshot::from_book(book);
                    entry.download_count
                }
                None => {
                    bundle.downloads.push(DownloadEntry {
                        book: BookSnapshot::from_book(book),
                        download_type: download_type.to_string(),
                        download_count: 1,
                        first_downloaded_at: now,
                        last_downloaded_at: now,
                    });
                    1
                }
            };
            Self::merge_library(bundle, book, LibraryMerge::Download);
            count
        })
    }

    /// Remove a book's download entries (all types). Idempotent, always
    /// true. The library entry loses its downloaded flag; an auto-created
    /// entry with nothing else keeping it alive drops out alongside.
    pub fn remove_download(&self, user_id: Option<&str>, book_id: &str) -> Result<bool> {
        self.mutate(user_id, |bundle| {
            bundle.downloads.retain(|d| d.book.book_id != book_id);
            if let Some(pos) = bundle.library.iter().position(|l| l.book.book_id == book_id) {
                let item = &mut bundle.library[pos];
                item.is_downloaded = false;
                item.updated_at = now_timestamp();
                if !item.is_favorite && item.reading_status == ReadingStatus::Visited {
                    bundle.library.remove(pos);
                }
            }
            true
        })
    }

    // ========== LIBRARY ==========

    pub fn library(&self, user_id: Option<&str>) -> Result<Vec<LibraryItem>> {
        Ok(self.bundle(user_id)?.library)
    }

    /// Set a book's reading status and progress.
    ///
    /// A "visited" write never replaces an intentional status the user
    /// already chose; any other status always wins.
    pub fn set_reading_status(
        &self,
        user_id: Option<&str>,
        book: &Book,
        status: ReadingStatus,
        progress: f64,
    ) -> Result<LibraryItem> {
        self.mutate(user_id, |bundle| {
            let now = now_timestamp();
            match bundle
                .library
                .iter_mut()
                .find(|l| l.book.book_id == book.id)
            {
                Some(item) => {
                    if status != ReadingStatus::Visited
                        || item.reading_status == ReadingStatus::Visited
                    {
                        item.reading_status = status;
                        item.progress = progress;
                    }
                    item.updated_at = now;
                    item.clone()
                }
                None => {
                    let item = LibraryItem {
                        book: BookSnapshot::from_book(book),
                        reading_status: status,
                        progress,
                        is_downloaded: false,
                        is_favorite: false,
                        added_at: now,
                        updated_at: now,
                    };
                    bundle.library.push(item.clone());
                    item
                }
            }
        })
    }

    /// Remove a book from the library.
    pub fn remove_library_item(&self, user_id: Option<&str>, book_id: &str) -> Result<bool> {
        self.mutate(user_id, |bundle| {
            let before = bundle.library.len();
            bundle.library.retain(|l| l.book.book_id != book_id);
            bundle.library.len() < before
        })
    }

    fn merge_library(bundle: &mut UserBundle, book: &Book, kind: LibraryMerge) {
        let now = now_timestamp();
        match bundle
            .library
            .iter_mut()
            .find(|l| l.book.book_id == book.id)
        {
            Some(item) => {
                match kind {
                    // Download owns the downloaded flag and pdf URL.
                    LibraryMerge::Download => {
                        item.is_downloaded = true;
                        item.book.pdf_url = book.pdf_url.clone();
                    }
                    // Favorite refreshes the visible snapshot fields but
                    // never clobbers download state.
                    LibraryMerge::Favorite => {
                        item.is_favorite = true;
                        item.book.title = book.title.clone();
                        item.book.author = book.author.clone();
                        item.book.cover_url = book.cover_url.clone().unwrap_or_default();
                        item.book.is_free = book.is_free;
                        item.book.price = book.price;
                    }
                }
                item.updated_at = now;
            }
            None => {
                bundle.library.push(LibraryItem {
                    book: BookSnapshot::from_book(book),
                    reading_status: ReadingStatus::Visited,
                    progress: 0.0,
                    is_downloaded: matches!(kind, LibraryMerge::Download),
                    is_favorite: matches!(kind, LibraryMerge::Favorite),
                    added_at: now,
                    updated_at: now,
                });
            }
        }
    }

    // ========== MAINTENANCE ==========

    /// Aggregate counts for a bundle.
    pub fn stats(&self, user_id: Option<&str>) -> Result<BundleStats> {
        let bundle = self.bundle(user_id)?;
        Ok(BundleStats {
            favorites: bundle.favorites.len(),
            downloads: bundle.downloads.len(),
            total_download_count: bundle.downloads.iter().map(|d| d.download_count).sum(),
            library: bundle.library.len(),
            completed: bundle
                .library
                .iter()
                .filter(|l| l.reading_status == ReadingStatus::Completed)
                .count(),
        })
    }

    /// Rewrite empty cover URLs in a bundle to the placeholder. Returns how
    /// many entries were fixed.
    pub fn repair_cover_urls(&self, user_id: Option<&str>) -> Result<usize> {
        let placeholder = self.storage.placeholder_cover.clone();
        self.mutate(user_id, |bundle| {
            let mut fixed = 0;
            let mut repair = |snapshot: &mut BookSnapshot| {
                if snapshot.cover_url.trim().is_empty() {
                    snapshot.cover_url = placeholder.clone();
                    fixed += 1;
                }
            };
            bundle.favorites.iter_mut().for_each(|f| repair(&mut f.book));
            bundle.downloads.iter_mut().for_each(|d| repair(&mut d.book));
            bundle.library.iter_mut().for_each(|l| repair(&mut l.book));
            fixed
        })
    }

    /// Rewrite stored pdf URLs to forced-download form across a bundle.
    pub fn repair_attachment_urls(&self, user_id: Option<&str>) -> Result<usize> {
        self.mutate(user_id, |bundle| {
            let mut fixed = 0;
            let mut repair = |snapshot: &mut BookSnapshot| {
                if let Some(url) = &snapshot.pdf_url {
                    let rewritten = catalog::to_attachment_url(url);
                    if rewritten != *url {
                        snapshot.pdf_url = Some(rewritten);
                        fixed += 1;
                    }
                }
            };
            bundle.downloads.iter_mut().for_each(|d| repair(&mut d.book));
            bundle.library.iter_mut().for_each(|l| repair(&mut l.book));
            fixed
        })
    }
}

enum LibraryMerge {
    Favorite,
    Download,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BundleStore) {
        let dir = TempDir::new().unwrap();
        let store =
            BundleStore::new(dir.path().to_path_buf(), StorageConfig::default()).unwrap();
        (dir, store)
    }

    fn book(id: &str) -> Book {
        let now = now_timestamp();
        Book {
            id: id.to_string(),
            title: format!("Book {}", id),
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
            pdf_url: Some(format!("https://cdn.example/upload/{}.pdf", id)),
            pdf_public_id: None,
            cover_url: Some("https://cdn.example/cover.jpg".to_string()),
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

    #[test]
    fn test_add_favorite_is_idempotent() {
        let (_dir, store) = store();
        let b = book("b1");
        assert!(store.add_favorite(Some("u1"), &b).unwrap());
        assert!(!store.add_favorite(Some("u1"), &b).unwrap());
        assert_eq!(store.favorites(Some("u1")).unwrap().len(), 1);
        assert!(store.is_favorite(Some("u1"), "b1").unwrap());
    }

    #[test]
    fn test_download_counter_is_monotonic() {
        let (_dir, store) = store();
        let b = book("b1");
        assert_eq!(store.add_download(Some("u1"), &b, "pdf").unwrap(), 1);
        assert_eq!(store.add_download(Some("u1"), &b, "pdf").unwrap(), 2);
        assert_eq!(store.add_download(Some("u1"), &b, "audio").unwrap(), 1);

        let downloads = store.downloads(Some("u1")).unwrap();
        assert_eq!(downloads.len(), 2);
        let pdf = downloads.iter().find(|d| d.download_type == "pdf").unwrap();
        assert_eq!(pdf.download_count, 2);
    }

    #[test]
    fn test_remove_download_drops_auto_entry() {
        let (_dir, store) = store();
        let b = book("b1");
        store.add_download(Some("u1"), &b, "pdf").unwrap();
        assert!(store.remove_download(Some("u1"), "b1").unwrap());
        // removing an absent book is still true
        assert!(store.remove_download(Some("u1"), "b1").unwrap());
        assert!(store.downloads(Some("u1")).unwrap().is_empty());
        // the download was the only thing keeping the library entry
        assert!(store.library(Some("u1")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_download_keeps_entry_with_explicit_status() {
        let (_dir, store) = store();
        let b = book("b1");
        store.add_download(Some("u1"), &b, "pdf").unwrap();
        store
            .set_reading_status(Some("u1"), &b, ReadingStatus::Reading, 0.3)
            .unwrap();
        store.remove_download(Some("u1"), "b1").unwrap();

        let library = store.library(Some("u1")).unwrap();
        assert_eq!(library.len(), 1);
        assert!(!library[0].is_downloaded);
        assert_eq!(library[0].reading_status, ReadingStatus::Reading);
    }

    #[test]
    fn test_remove_favorite_always_true_and_drops_auto_entry() {
        let (_dir, store) = store();
        let b = book("b1");
        store.add_favorite(Some("u1"), &b).unwrap();
        assert!(store.remove_favorite(Some("u1"), "b1").unwrap());
        assert!(store.remove_favorite(Some("u1"), "b1").unwrap());
        assert!(store.favorites(Some("u1")).unwrap().is_empty());
        assert!(store.library(Some("u1")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_favorite_keeps_downloaded_entry() {
        let (_dir, store) = store();
        let b = book("b1");
        store.add_download(Some("u1"), &b, "pdf").unwrap();
        store.add_favorite(Some("u1"), &b).unwrap();
        store.remove_favorite(Some("u1"), "b1").unwrap();

        let library = store.library(Some("u1")).unwrap();
        assert_eq!(library.len(), 1);
        assert!(!library[0].is_favorite);
        assert!(library[0].is_downloaded);
    }

    #[test]
    fn test_favorites_list_newest_first() {
        let (_dir, store) = store();
        store.add_favorite(Some("u1"), &book("b1")).unwrap();
        store.add_favorite(Some("u1"), &book("b2")).unwrap();
        let favorites = store.favorites(Some("u1")).unwrap();
        assert_eq!(favorites[0].book.book_id, "b2");
        assert_eq!(favorites[1].book.book_id, "b1");
    }

    #[test]
    fn test_noop_mutations_skip_the_write() {
        let (_dir, store) = store();
        // a repair pass over a missing bundle must not create the file
        assert_eq!(store.repair_cover_urls(Some("u1")).unwrap(), 0);
        assert!(!store.bundle_path(Some("u1")).exists());

        let b = book("b1");
        store.add_favorite(Some("u1"), &b).unwrap();
        let written = std::fs::read_to_string(store.bundle_path(Some("u1"))).unwrap();
        assert!(!store.add_favorite(Some("u1"), &b).unwrap());
        let after = std::fs::read_to_string(store.bundle_path(Some("u1"))).unwrap();
        assert_eq!(after, written);
    }

    #[test]
    fn test_library_covers_favorites_and_downloads() {
        let (_dir, store) = store();
        store.add_favorite(Some("u1"), &book("a")).unwrap();
        store.add_download(Some("u1"), &book("b"), "pdf").unwrap();
        let c = book("c");
        store.add_favorite(Some("u1"), &c).unwrap();
        store.add_download(Some("u1"), &c, "pdf").unwrap();

        let library = store.library(Some("u1")).unwrap();
        assert_eq!(library.len(), 3);
        let by_id = |id: &str| library.iter().find(|l| l.book.book_id == id).unwrap();
        assert!(by_id("a").is_favorite && !by_id("a").is_downloaded);
        assert!(!by_id("b").is_favorite && by_id("b").is_downloaded);
        assert!(by_id("c").is_favorite && by_id("c").is_downloaded);
    }

    #[test]
    fn test_library_merge_preserves_download_state() {
        let (_dir, store) = store();
        let b = book("b1");
        store.add_download(Some("u1"), &b, "pdf").unwrap();
        store.add_favorite(Some("u1"), &b).unwrap();

        let library = store.library(Some("u1")).unwrap();
        assert_eq!(library.len(), 1);
        assert!(library[0].is_downloaded);
        assert!(library[0].is_favorite);
        assert!(library[0].book.pdf_url.is_some());
    }

    #[test]
    fn test_visited_never_downgrades_intentional_status() {
        let (_dir, store) = store();
        let b = book("b1");
        store
            .set_reading_status(Some("u1"), &b, ReadingStatus::Reading, 0.4)
            .unwrap();
        let item = store
            .set_reading_status(Some("u1"), &b, ReadingStatus::Visited, 0.0)
            .unwrap();
        assert_eq!(item.reading_status, ReadingStatus::Reading);
        assert_eq!(item.progress, 0.4);

        // An intentional status still replaces another intentional one
        let item = store
            .set_reading_status(Some("u1"), &b, ReadingStatus::Completed, 1.0)
            .unwrap();
        assert_eq!(item.reading_status, ReadingStatus::Completed);
    }

    #[test]
    fn test_anonymous_bundle_is_shared() {
        let (_dir, store) = store();
        let b = book("b1");
        store.add_favorite(None, &b).unwrap();
        assert!(store.is_favorite(None, "b1").unwrap());
        assert_eq!(store.bundle_path(None), store.bundle_path(None));
        assert_ne!(store.bundle_path(None), store.bundle_path(Some("u1")));
    }

    #[test]
    fn test_repair_cover_urls() {
        let (_dir, store) = store();
        let mut b = book("b1");
        b.cover_url = None;
        store.add_favorite(Some("u1"), &b).unwrap();
        let fixed = store.repair_cover_urls(Some("u1")).unwrap();
        // favorite entry and its merged library entry
        assert_eq!(fixed, 2);
        let favorites = store.favorites(Some("u1")).unwrap();
        assert_eq!(favorites[0].book.cover_url, StorageConfig::default().placeholder_cover);
    }

    #[test]
    fn test_repair_attachment_urls() {
        let (_dir, store) = store();
        let b = book("b1");
        store.add_download(Some("u1"), &b, "pdf").unwrap();
        let fixed = store.repair_attachment_urls(Some("u1")).unwrap();
        assert_eq!(fixed, 2);
        let downloads = store.downloads(Some("u1")).unwrap();
        let url = downloads[0].book.pdf_url.as_deref().unwrap();
        assert!(url.contains("/upload/fl_attachment/"));
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = store();
        let b1 = book("b1");
        let b2 = book("b2");
        store.add_favorite(Some("u1"), &b1).unwrap();
        store.add_download(Some("u1"), &b1, "pdf").unwrap();
        store.add_download(Some("u1"), &b1, "pdf").unwrap();
        store
            .set_reading_status(Some("u1"), &b2, ReadingStatus::Completed, 1.0)
            .unwrap();

        let stats = store.stats(Some("u1")).unwrap();
        assert_eq!(stats.favorites, 1);
        assert_eq!(stats.downloads, 1);
        assert_eq!(stats.total_download_count, 2);
        assert_eq!(stats.library, 2);
        assert_eq!(stats.completed, 1);
    }
}
