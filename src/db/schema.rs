use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

/// Search and flag filters for catalog listings.
#[derive(Debug, Clone, Default)]
pub struct BookFilter {
    /// Case-insensitive substring match on title, author and tags.
    pub query: Option<String>,
    /// Exact genre match.
    pub genre: Option<String>,
    /// Only featured books.
    pub featured: bool,
    /// Only bestsellers.
    pub bestseller: bool,
    /// Only new releases.
    pub new_release: bool,
    /// Only free books.
    pub free: bool,
}

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE NOT NULL,
                name TEXT,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'user',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_login INTEGER
            );

            -- Sessions table
            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Books table
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                description TEXT,
                short_description TEXT,
                genre TEXT,
                tags TEXT,
                publisher TEXT,
                isbn TEXT,
                language TEXT,
                pages INTEGER,
                rating REAL NOT NULL DEFAULT 0,
                total_ratings INTEGER NOT NULL DEFAULT 0,
                downloads INTEGER NOT NULL DEFAULT 0,
                audio_url TEXT,
                pdf_url TEXT,
                pdf_public_id TEXT,
                cover_url TEXT,
                cover_public_id TEXT,
                is_featured INTEGER NOT NULL DEFAULT 0,
                is_bestseller INTEGER NOT NULL DEFAULT 0,
                is_new_release INTEGER NOT NULL DEFAULT 0,
                is_free INTEGER NOT NULL DEFAULT 1,
                price REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Favorites table
            CREATE TABLE IF NOT EXISTS favorites (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Downloads table (one counter row per user/book/type)
            CREATE TABLE IF NOT EXISTS downloads (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                download_type TEXT NOT NULL DEFAULT 'pdf',
                download_count INTEGER NOT NULL DEFAULT 1,
                first_downloaded_at INTEGER NOT NULL,
                last_downloaded_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id, download_type),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Library table
            CREATE TABLE IF NOT EXISTS library (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                reading_status TEXT NOT NULL DEFAULT 'visited',
                progress REAL NOT NULL DEFAULT 0,
                added_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Payments table (never deleted)
            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                order_id TEXT,
                order_tracking_id TEXT,
                merchant_reference TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                payment_method TEXT,
                confirmation_code TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_books_genre ON books(genre);
            CREATE INDEX IF NOT EXISTS idx_favorites_user ON favorites(user_id);
            CREATE INDEX IF NOT EXISTS idx_downloads_user ON downloads(user_id);
            CREATE INDEX IF NOT EXISTS idx_library_user ON library(user_id);
            CREATE INDEX IF NOT EXISTS idx_payments_user_book ON payments(user_id, book_id);
            CREATE INDEX IF NOT EXISTS idx_payments_tracking ON payments(order_tracking_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, email, name, password_hash, role, is_active, created_at, updated_at, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.id,
                user.email,
                user.name,
                user.password_hash,
                user.role,
                user.is_active,
                user.created_at,
                user.updated_at,
                user.last_login,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                AppError::InvalidRequest(format!("Email '{}' is already registered", user.email))
            } else {
                AppError::Internal(format!("Failed to create user: {}", e))
            }
        })?;
        Ok(())
    }

    /// Get user by email.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, email, name, password_hash, role, is_active, created_at, updated_at, last_login
             FROM users WHERE email = ?1",
            params![email],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, email, name, password_hash, role, is_active, created_at, updated_at, last_login
             FROM users WHERE id = ?1",
            params![id],
            Self::row_to_user,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get user: {}", e)))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, email, name, password_hash, role, is_active, created_at, updated_at, last_login
                 FROM users ORDER BY email",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let users = stmt
            .query_map([], Self::row_to_user)
            .map_err(|e| AppError::Internal(format!("Failed to list users: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect users: {}", e)))?;

        Ok(users)
    }

    /// Update user password.
    pub fn update_user_password(&self, email: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE email = ?3",
                params![password_hash, now_timestamp(), email],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update password: {}", e)))?;
        Ok(rows > 0)
    }

    /// Update user last login.
    pub fn update_user_last_login(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to update last login: {}", e)))?;
        Ok(())
    }

    /// Change a user's role.
    pub fn set_user_role(&self, user_id: &str, role: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET role = ?1, updated_at = ?2 WHERE id = ?3",
                params![role, now_timestamp(), user_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update role: {}", e)))?;
        Ok(rows > 0)
    }

    /// Activate or deactivate a user account (soft delete).
    pub fn set_user_active(&self, user_id: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active, now_timestamp(), user_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update account state: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            password_hash: row.get(3)?,
            role: row.get(4)?,
            is_active: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_login: row.get(8)?,
        })
    }

    // ========== SESSION OPERATIONS ==========

    /// Create session.
    pub fn create_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
            params![session.token, session.user_id, session.expires_at],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create session: {}", e)))?;
        Ok(())
    }

    /// Get session by token.
    pub fn get_session(&self, token: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, user_id, expires_at FROM sessions WHERE token = ?1",
            params![token],
            |row| {
                Ok(Session {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    expires_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get session: {}", e)))
    }

    /// Delete session.
    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(|e| AppError::Internal(format!("Failed to delete session: {}", e)))?;
        Ok(())
    }

    /// Cleanup expired sessions.
    pub fn cleanup_expired_sessions(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at < ?1",
                params![now_timestamp()],
            )
            .map_err(|e| AppError::Internal(format!("Failed to cleanup sessions: {}", e)))?;
        Ok(rows)
    }

    // ========== BOOK OPERATIONS ==========

    /// Create a book (admin catalog management).
    pub fn create_book(&self, book: &Book) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books
             (id, title, author, description, short_description, genre, tags, publisher, isbn,
              language, pages, rating, total_ratings, downloads, audio_url, pdf_url, pdf_public_id,
              cover_url, cover_public_id, is_featured, is_bestseller, is_new_release, is_free,
              price, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            params![
                book.id,
                book.title,
                book.author,
                book.description,
                book.short_description,
                book.genre,
                book.tags,
                book.publisher,
                book.isbn,
                book.language,
                book.pages,
                book.rating,
                book.total_ratings,
                book.downloads,
                book.audio_url,
                book.pdf_url,
                book.pdf_public_id,
                book.cover_url,
                book.cover_public_id,
                book.is_featured,
                book.is_bestseller,
                book.is_new_release,
                book.is_free,
                book.price,
                book.created_at,
                book.updated_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create book: {}", e)))?;
        Ok(())
    }

    /// Update a book (admin catalog management). The download counter is not
    /// touched here; it only moves through [`Database::increment_downloads`].
    pub fn update_book(&self, book: &Book) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET
                    title = ?2, author = ?3, description = ?4, short_description = ?5, genre = ?6,
                    tags = ?7, publisher = ?8, isbn = ?9, language = ?10, pages = ?11, rating = ?12,
                    total_ratings = ?13, audio_url = ?14, pdf_url = ?15, pdf_public_id = ?16,
                    cover_url = ?17, cover_public_id = ?18, is_featured = ?19, is_bestseller = ?20,
                    is_new_release = ?21, is_free = ?22, price = ?23, updated_at = ?24
                 WHERE id = ?1",
                params![
                    book.id,
                    book.title,
                    book.author,
                    book.description,
                    book.short_description,
                    book.genre,
                    book.tags,
                    book.publisher,
                    book.isbn,
                    book.language,
                    book.pages,
                    book.rating,
                    book.total_ratings,
                    book.audio_url,
                    book.pdf_url,
                    book.pdf_public_id,
                    book.cover_url,
                    book.cover_public_id,
                    book.is_featured,
                    book.is_bestseller,
                    book.is_new_release,
                    book.is_free,
                    book.price,
                    book.updated_at,
                ],
            )
            .map_err(|e| AppError::Internal(format!("Failed to update book: {}", e)))?;
        Ok(rows > 0)
    }

    /// Get book by ID.
    pub fn get_book(&self, id: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM books WHERE id = ?1", BOOK_COLUMNS),
            params![id],
            Self::row_to_book,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get book: {}", e)))
    }

    /// List books matching the filter, newest first.
    pub fn list_books(&self, filter: &BookFilter) -> Result<Vec<Book>> {
        let mut sql = format!("SELECT {} FROM books WHERE 1=1", BOOK_COLUMNS);
        let mut values: Vec<String> = Vec::new();

        if let Some(ref q) = filter.query {
            sql.push_str(
                " AND (title LIKE ? COLLATE NOCASE OR author LIKE ? COLLATE NOCASE \
                 OR tags LIKE ? COLLATE NOCASE)",
            );
            let pattern = format!("%{}%", q);
            values.push(pattern.clone());
            values.push(pattern.clone());
            values.push(pattern);
        }
        if let Some(ref genre) = filter.genre {
            sql.push_str(" AND genre = ?");
            values.push(genre.clone());
        }
        if filter.featured {
            sql.push_str(" AND is_featured = 1");
        }
        if filter.bestseller {
            sql.push_str(" AND is_bestseller = 1");
        }
        if filter.new_release {
            sql.push_str(" AND is_new_release = 1");
        }
        if filter.free {
            sql.push_str(" AND is_free = 1");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let params: Vec<&dyn rusqlite::ToSql> =
            values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        let books = stmt
            .query_map(rusqlite::params_from_iter(params), Self::row_to_book)
            .map_err(|e| AppError::Internal(format!("Failed to list books: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect books: {}", e)))?;

        Ok(books)
    }

    /// Delete a book (admin catalog management).
    pub fn delete_book(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute("DELETE FROM books WHERE id = ?1", params![id])
            .map_err(|e| AppError::Internal(format!("Failed to delete book: {}", e)))?;
        Ok(rows > 0)
    }

    /// Increment the server-side download counter for a book.
    pub fn increment_downloads(&self, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE books SET downloads = downloads + 1 WHERE id = ?1",
                params![book_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to increment downloads: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<Book> {
        Ok(Book {
            id: row.get(0)?,
            title: row.get(1)?,
            author: row.get(2)?,
            description: row.get(3)?,
            short_description: row.get(4)?,
            genre: row.get(5)?,
            tags: row.get(6)?,
            publisher: row.get(7)?,
            isbn: row.get(8)?,
            language: row.get(9)?,
            pages: row.get(10)?,
            rating: row.get(11)?,
            total_ratings: row.get(12)?,
            downloads: row.get(13)?,
            audio_url: row.get(14)?,
            pdf_url: row.get(15)?,
            pdf_public_id: row.get(16)?,
            cover_url: row.get(17)?,
            cover_public_id: row.get(18)?,
            is_featured: row.get(19)?,
            is_bestseller: row.get(20)?,
            is_new_release: row.get(21)?,
            is_free: row.get(22)?,
            price: row.get(23)?,
            created_at: row.get(24)?,
            updated_at: row.get(25)?,
        })
    }

    // ========== FAVORITE OPERATIONS ==========

    /// Add a favorite. Returns false if the pair already existed; uniqueness
    /// is enforced by the conflict clause, not a prior existence check.
    pub fn add_favorite(&self, user_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO favorites (user_id, book_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![user_id, book_id, now_timestamp()],
            )
            .map_err(|e| AppError::Internal(format!("Failed to add favorite: {}", e)))?;
        Ok(rows > 0)
    }

    /// Remove a favorite. Idempotent.
    pub fn remove_favorite(&self, user_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM favorites WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
        )
        .map_err(|e| AppError::Internal(format!("Failed to remove favorite: {}", e)))?;
        Ok(true)
    }

    /// Check if a book is favorited by a user.
    pub fn is_favorite(&self, user_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM favorites WHERE user_id = ?1 AND book_id = ?2",
                params![user_id, book_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::Internal(format!("Failed to check favorite: {}", e)))?;
        Ok(count > 0)
    }

    /// List a user's favorited books, most recent first.
    pub fn list_favorites(&self, user_id: &str) -> Result<Vec<Book>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM books b
                 JOIN favorites f ON f.book_id = b.id
                 WHERE f.user_id = ?1
                 ORDER BY f.created_at DESC",
                BOOK_COLUMNS_QUALIFIED
            ))
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let books = stmt
            .query_map(params![user_id], Self::row_to_book)
            .map_err(|e| AppError::Internal(format!("Failed to list favorites: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect favorites: {}", e)))?;

        Ok(books)
    }

    // ========== DOWNLOAD OPERATIONS ==========

    /// Record a download for (user, book, type). Inserts with count 1 or bumps
    /// the existing counter in a single statement; returns the new count.
    pub fn record_download(
        &self,
        user_id: &str,
        book_id: &str,
        download_type: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let now = now_timestamp();
        conn.query_row(
            "INSERT INTO downloads
             (user_id, book_id, download_type, download_count, first_downloaded_at, last_downloaded_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT (user_id, book_id, download_type) DO UPDATE SET
                download_count = download_count + 1,
                last_downloaded_at = excluded.last_downloaded_at
             RETURNING download_count",
            params![user_id, book_id, download_type, now],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Internal(format!("Failed to record download: {}", e)))
    }

    /// List a user's download records, most recent first.
    pub fn list_downloads(&self, user_id: &str) -> Result<Vec<DownloadRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, book_id, download_type, download_count,
                        first_downloaded_at, last_downloaded_at
                 FROM downloads WHERE user_id = ?1
                 ORDER BY last_downloaded_at DESC",
            )
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let records = stmt
            .query_map(params![user_id], |row| {
                Ok(DownloadRecord {
                    user_id: row.get(0)?,
                    book_id: row.get(1)?,
                    download_type: row.get(2)?,
                    download_count: row.get(3)?,
                    first_downloaded_at: row.get(4)?,
                    last_downloaded_at: row.get(5)?,
                })
            })
            .map_err(|e| AppError::Internal(format!("Failed to list downloads: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Internal(format!("Failed to collect downloads: {}", e)))?;

        Ok(records)
    }

    // ========== LIBRARY OPERATIONS ==========

    /// Insert or update a library entry in one statement.
    ///
    /// A "visited" write never replaces an intentional status already stored;
    /// the guard lives in the conflict clause so there is no read-then-write
    /// race window.
    pub fn upsert_library_entry(
        &self,
        user_id: &str,
        book_id: &str,
        status: ReadingStatus,
        progress: f64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO library (user_id, book_id, reading_status, progress, added_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                reading_status = CASE
                    WHEN excluded.reading_status = 'visited'
                         AND library.reading_status != 'visited'
                    THEN library.reading_status
                    ELSE excluded.reading_status
                END,
                progress = CASE
                    WHEN excluded.reading_status = 'visited'
                         AND library.reading_status != 'visited'
                    THEN library.progress
                    ELSE excluded.progress
                END,
                updated_at = excluded.updated_at",
            params![user_id, book_id, status.as_str(), progress, now],
        )
        .map_err(|e| AppError::Internal(format!("Failed to upsert library entry: {}", e)))?;
        Ok(())
    }

    /// Get a single library entry.
    pub fn get_library_entry(&self, user_id: &str, book_id: &str) -> Result<Option<LibraryEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT user_id, book_id, reading_status, progress, added_at, updated_at
             FROM library WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            Self::row_to_library_entry,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get library entry: {}", e)))
    }

    /// List a user's library entries with their books, most recent first.
    /// Restricting to a status is optional.
    pub fn list_library(
        &self,
        user_id: &str,
        status: Option<ReadingStatus>,
    ) -> Result<Vec<(LibraryEntry, Book)>> {
        let sql = format!(
            "SELECT l.user_id, l.book_id, l.reading_status, l.progress, l.added_at, l.updated_at,
                    {}
             FROM library l
             JOIN books b ON b.id = l.book_id
             WHERE l.user_id = ?1 {}
             ORDER BY l.updated_at DESC",
            BOOK_COLUMNS_QUALIFIED,
            if status.is_some() {
                "AND l.reading_status = ?2"
            } else {
                ""
            }
        );

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Internal(format!("Failed to prepare query: {}", e)))?;

        let map_row = |row: &rusqlite::Row<'_>| {
            let entry = Self::row_to_library_entry(row)?;
            let book = Book {
                id: row.get(6)?,
                title: row.get(7)?,
                author: row.get(8)?,
                description: row.get(9)?,
                short_description: row.get(10)?,
                genre: row.get(11)?,
                tags: row.get(12)?,
                publisher: row.get(13)?,
                isbn: row.get(14)?,
                language: row.get(15)?,
                pages: row.get(16)?,
                rating: row.get(17)?,
                total_ratings: row.get(18)?,
                downloads: row.get(19)?,
                audio_url: row.get(20)?,
                pdf_url: row.get(21)?,
                pdf_public_id: row.get(22)?,
                cover_url: row.get(23)?,
                cover_public_id: row.get(24)?,
                is_featured: row.get(25)?,
                is_bestseller: row.get(26)?,
                is_new_release: row.get(27)?,
                is_free: row.get(28)?,
                price: row.get(29)?,
                created_at: row.get(30)?,
                updated_at: row.get(31)?,
            };
            Ok((entry, book))
        };

        let rows = if let Some(status) = status {
            stmt.query_map(params![user_id, status.as_str()], map_row)
                .map_err(|e| AppError::Internal(format!("Failed to list library: {}", e)))?
                .collect::<std::result::Result<Vec<_>, _>>()
        } else {
            stmt.query_map(params![user_id], map_row)
                .map_err(|e| AppError::Internal(format!("Failed to list library: {}", e)))?
                .collect::<std::result::Result<Vec<_>, _>>()
        }
        .map_err(|e| AppError::Internal(format!("Failed to collect library: {}", e)))?;

        Ok(rows)
    }

    /// Remove a library entry.
    pub fn remove_library_entry(&self, user_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM library WHERE user_id = ?1 AND book_id = ?2",
                params![user_id, book_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to remove library entry: {}", e)))?;
        Ok(rows > 0)
    }

    fn row_to_library_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LibraryEntry> {
        let status_str: String = row.get(2)?;
        Ok(LibraryEntry {
            user_id: row.get(0)?,
            book_id: row.get(1)?,
            reading_status: ReadingStatus::parse(&status_str).unwrap_or(ReadingStatus::Visited),
            progress: row.get(3)?,
            added_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    // ========== PAYMENT OPERATIONS ==========

    /// Create a payment row (always starts pending).
    pub fn create_payment(&self, payment: &Payment) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO payments
             (id, user_id, book_id, order_id, order_tracking_id, merchant_reference, amount,
              currency, status, payment_method, confirmation_code, created_at, updated_at,
              completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                payment.id,
                payment.user_id,
                payment.book_id,
                payment.order_id,
                payment.order_tracking_id,
                payment.merchant_reference,
                payment.amount,
                payment.currency,
                payment.status.as_str(),
                payment.payment_method,
                payment.confirmation_code,
                payment.created_at,
                payment.updated_at,
                payment.completed_at,
            ],
        )
        .map_err(|e| AppError::Internal(format!("Failed to create payment: {}", e)))?;
        Ok(())
    }

    /// Store the gateway tracking id on a freshly created payment.
    pub fn set_payment_tracking(&self, payment_id: &str, tracking_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE payments SET order_tracking_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![tracking_id, now_timestamp(), payment_id],
            )
            .map_err(|e| AppError::Internal(format!("Failed to set tracking id: {}", e)))?;
        Ok(rows > 0)
    }

    /// Apply a verified gateway status to a payment.
    ///
    /// Only pending payments can move; the WHERE clause is the state-machine
    /// guard, so a completed payment can never revert. Returns whether a row
    /// actually transitioned.
    pub fn transition_payment(
        &self,
        payment_id: &str,
        status: PaymentStatus,
        payment_method: Option<&str>,
        confirmation_code: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Ok(false);
        }

        let conn = self.conn.lock();
        let now = now_timestamp();
        let completed_at = (status == PaymentStatus::Completed).then_some(now);
        let rows = conn
            .execute(
                "UPDATE payments SET
                    status = ?1,
                    payment_method = COALESCE(?2, payment_method),
                    confirmation_code = COALESCE(?3, confirmation_code),
                    completed_at = COALESCE(?4, completed_at),
                    updated_at = ?5
                 WHERE id = ?6 AND status = 'pending'",
                params![
                    status.as_str(),
                    payment_method,
                    confirmation_code,
                    completed_at,
                    now,
                    payment_id
                ],
            )
            .map_err(|e| AppError::Internal(format!("Failed to transition payment: {}", e)))?;
        Ok(rows > 0)
    }

    /// Get payment by ID.
    pub fn get_payment(&self, id: &str) -> Result<Option<Payment>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM payments WHERE id = ?1", PAYMENT_COLUMNS),
            params![id],
            Self::row_to_payment,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get payment: {}", e)))
    }

    /// Get payment by gateway tracking id.
    pub fn get_payment_by_tracking(&self, tracking_id: &str) -> Result<Option<Payment>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM payments WHERE order_tracking_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                PAYMENT_COLUMNS
            ),
            params![tracking_id],
            Self::row_to_payment,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get payment: {}", e)))
    }

    /// Most recent payment for a (user, book) pair.
    pub fn latest_payment(&self, user_id: &str, book_id: &str) -> Result<Option<Payment>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM payments WHERE user_id = ?1 AND book_id = ?2
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                PAYMENT_COLUMNS
            ),
            params![user_id, book_id],
            Self::row_to_payment,
        )
        .optional()
        .map_err(|e| AppError::Internal(format!("Failed to get payment: {}", e)))
    }

    fn row_to_payment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Payment> {
        let status_str: String = row.get(8)?;
        Ok(Payment {
            id: row.get(0)?,
            user_id: row.get(1)?,
            book_id: row.get(2)?,
            order_id: row.get(3)?,
            order_tracking_id: row.get(4)?,
            merchant_reference: row.get(5)?,
            amount: row.get(6)?,
            currency: row.get(7)?,
            status: PaymentStatus::parse(&status_str).unwrap_or(PaymentStatus::Pending),
            payment_method: row.get(9)?,
            confirmation_code: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }
}

const BOOK_COLUMNS: &str = "id, title, author, description, short_description, genre, tags, \
     publisher, isbn, language, pages, rating, total_ratings, downloads, audio_url, pdf_url, \
     pdf_public_id, cover_url, cover_public_id, is_featured, is_bestseller, is_new_release, \
     is_free, price, created_at, updated_at";

const BOOK_COLUMNS_QUALIFIED: &str = "b.id, b.title, b.author, b.description, \
     b.short_description, b.genre, b.tags, b.publisher, b.isbn, b.language, b.pages, b.rating, \
     b.total_ratings, b.downloads, b.audio_url, b.pdf_url, b.pdf_public_id, b.cover_url, \
     b.cover_public_id, b.is_featured, b.is_bestseller, b.is_new_release, b.is_free, b.price, \
     b.created_at, b.updated_at";

const PAYMENT_COLUMNS: &str = "id, user_id, book_id, order_id, order_tracking_id, \
     merchant_reference, amount, currency, status, payment_method, confirmation_code, \
     created_at, updated_at, completed_at";
