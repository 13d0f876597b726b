mod schema;

pub use schema::{BookFilter, Database};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Catalog book with store metadata and asset links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Unique book ID.
    pub id: String,
    /// Book title.
    pub title: String,
    /// Primary author.
    pub author: String,
    /// Full description.
    pub description: Option<String>,
    /// Short description for listings.
    pub short_description: Option<String>,
    /// Genre / category.
    pub genre: Option<String>,
    /// Tags, comma-joined in storage.
    pub tags: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Language code.
    pub language: Option<String>,
    /// Page count.
    pub pages: Option<i64>,
    /// Average rating.
    pub rating: f64,
    /// Number of ratings.
    pub total_ratings: i64,
    /// Server-side download counter.
    pub downloads: i64,
    /// Audiobook URL.
    pub audio_url: Option<String>,
    /// PDF asset URL.
    pub pdf_url: Option<String>,
    /// PDF asset public id on the CDN.
    pub pdf_public_id: Option<String>,
    /// Cover image URL.
    pub cover_url: Option<String>,
    /// Cover asset public id on the CDN.
    pub cover_public_id: Option<String>,
    /// Featured flag.
    pub is_featured: bool,
    /// Bestseller flag.
    pub is_bestseller: bool,
    /// New release flag.
    pub is_new_release: bool,
    /// Free book flag.
    pub is_free: bool,
    /// Price in the store currency.
    pub price: f64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Email address used for login.
    pub email: String,
    /// Display name.
    pub name: Option<String>,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// User role: "admin" or "user".
    pub role: String,
    /// Soft-delete flag; inactive accounts cannot log in.
    pub is_active: bool,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
    /// Last login timestamp.
    pub last_login: Option<i64>,
}

/// Authentication session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session token.
    pub token: String,
    /// User ID.
    pub user_id: String,
    /// Expiration timestamp.
    pub expires_at: i64,
}

/// Per-user, per-book, per-type download counter row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Download type: "pdf" or "audio".
    pub download_type: String,
    /// Monotonic download counter.
    pub download_count: i64,
    /// First download timestamp.
    pub first_downloaded_at: i64,
    /// Last download timestamp.
    pub last_downloaded_at: i64,
}

/// Reading status of a library entry.
///
/// "visited" is the only non-intentional status: it is auto-added when a user
/// opens a book page and must never replace a status the user chose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    /// Auto-added on book page visit.
    Visited,
    /// Marked to read later.
    WantToRead,
    /// Paused.
    Paused,
    /// Currently reading.
    Reading,
    /// Finished.
    Completed,
}

impl ReadingStatus {
    /// Storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Visited => "visited",
            ReadingStatus::WantToRead => "want_to_read",
            ReadingStatus::Paused => "paused",
            ReadingStatus::Reading => "reading",
            ReadingStatus::Completed => "completed",
        }
    }

    /// Parse the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "visited" => Some(ReadingStatus::Visited),
            "want_to_read" => Some(ReadingStatus::WantToRead),
            "paused" => Some(ReadingStatus::Paused),
            "reading" => Some(ReadingStatus::Reading),
            "completed" => Some(ReadingStatus::Completed),
            _ => None,
        }
    }
}

/// A user's personal library entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryEntry {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Reading status.
    pub reading_status: ReadingStatus,
    /// Reading progress (0.0 - 1.0).
    pub progress: f64,
    /// When the book entered the library.
    pub added_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Payment lifecycle state.
///
/// A payment is created `Pending` and moves to exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Awaiting gateway confirmation.
    Pending,
    /// Confirmed by the gateway.
    Completed,
    /// Rejected or reversed by the gateway.
    Failed,
    /// Cancelled by the user at the gateway.
    Cancelled,
}

impl PaymentStatus {
    /// Storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    /// Parse the storage form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "cancelled" => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this state can never change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Gateway-mediated purchase transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    /// Payment ID.
    pub id: String,
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Gateway order id, if the gateway assigned one.
    pub order_id: Option<String>,
    /// Gateway tracking id used for status polling.
    pub order_tracking_id: Option<String>,
    /// Merchant reference sent with the order.
    pub merchant_reference: String,
    /// Amount charged.
    pub amount: f64,
    /// Currency code.
    pub currency: String,
    /// Lifecycle state.
    pub status: PaymentStatus,
    /// Payment method reported by the gateway.
    pub payment_method: Option<String>,
    /// Gateway confirmation code.
    pub confirmation_code: Option<String>,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
    /// Completion timestamp, set once on transition to completed.
    pub completed_at: Option<i64>,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}
