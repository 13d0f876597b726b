//! Catalog payload normalization.
//!
//! Book records arrive from imports and the admin API with years of field
//! drift: covers under four different keys, tags as arrays or comma strings,
//! flags as booleans or 0/1. Everything is funneled through one place here so
//! the rest of the crate only ever sees the canonical [`Book`] shape.

use crate::config::StorageConfig;
use crate::db::{Book, now_timestamp};
use serde_json::Value;
use uuid::Uuid;

/// Cover keys checked in priority order. First non-empty string wins.
const COVER_ALIASES: &[&str] = &[
    "cover_file_url",
    "coverUrl",
    "cover_url",
    "image_url",
    "thumbnail",
];

/// Resolve a book payload's cover to a single canonical URL.
///
/// Falls back to the configured placeholder when no alias carries a value,
/// so callers never have to handle a missing cover.
pub fn resolve_cover_url(payload: &Value, storage: &StorageConfig) -> String {
    for key in COVER_ALIASES {
        if let Some(url) = payload.get(*key).and_then(Value::as_str) {
            let url = url.trim();
            if !url.is_empty() {
                return url.to_string();
            }
        }
    }
    storage.placeholder_cover.clone()
}

/// Rewrite a CDN delivery URL into a forced-download attachment URL.
///
/// Inserts the `fl_attachment/` transformation after the first `/upload/`
/// segment. URLs without an `/upload/` segment pass through unchanged, as do
/// URLs already carrying the flag.
pub fn to_attachment_url(url: &str) -> String {
    if url.contains("/upload/fl_attachment/") {
        return url.to_string();
    }
    match url.find("/upload/") {
        Some(pos) => {
            let insert_at = pos + "/upload/".len();
            format!("{}fl_attachment/{}", &url[..insert_at], &url[insert_at..])
        }
        None => url.to_string(),
    }
}

/// Build a forced-download URL from a bare CDN public id.
pub fn attachment_url_for_public_id(storage: &StorageConfig, public_id: &str) -> String {
    format!(
        "{}/raw/upload/fl_attachment/{}",
        storage.cdn_base_url.trim_end_matches('/'),
        public_id
    )
}

/// Split a stored comma-joined tag column into trimmed tags.
pub fn split_tags(tags: Option<&str>) -> Vec<String> {
    tags.map(|t| {
        t.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Join tags back into the comma-joined column form. Empty input stores NULL.
pub fn join_tags(tags: &[String]) -> Option<String> {
    let joined: Vec<&str> = tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if joined.is_empty() {
        None
    } else {
        Some(joined.join(","))
    }
}

fn opt_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn flag(payload: &Value, key: &str) -> bool {
    match payload.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

/// Convert a loose JSON book payload into a canonical [`Book`].
///
/// Missing id gets a fresh UUID; tags accept both array and comma-string
/// forms; the cover goes through [`resolve_cover_url`].
pub fn book_from_payload(payload: &Value, storage: &StorageConfig) -> Option<Book> {
    let title = opt_str(payload, "title")?;
    let author = opt_str(payload, "author")?;

    let tags = match payload.get("tags") {
        Some(Value::Array(items)) => {
            let list: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            join_tags(&list)
        }
        Some(Value::String(s)) => join_tags(&split_tags(Some(s))),
        _ => None,
    };

    let now = now_timestamp();
    Some(Book {
        id: opt_str(payload, "id").unwrap_or_else(|| Uuid::new_v4().to_string()),
        title,
        author,
        description: opt_str(payload, "description"),
        short_description: opt_str(payload, "short_description")
            .or_else(|| opt_str(payload, "shortDescription")),
        genre: opt_str(payload, "genre"),
        tags,
        publisher: opt_str(payload, "publisher"),
        isbn: opt_str(payload, "isbn"),
        language: opt_str(payload, "language"),
        pages: payload.get("pages").and_then(Value::as_i64),
        rating: payload.get("rating").and_then(Value::as_f64).unwrap_or(0.0),
        total_ratings: payload
            .get("total_ratings")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        downloads: payload
            .get("downloads")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        audio_url: opt_str(payload, "audio_url").or_else(|| opt_str(payload, "audioUrl")),
        pdf_url: opt_str(payload, "pdf_url")
            .or_else(|| opt_str(payload, "pdfUrl"))
            .or_else(|| opt_str(payload, "pdf_file_url")),
        pdf_public_id: opt_str(payload, "pdf_public_id"),
        cover_url: Some(resolve_cover_url(payload, storage)),
        cover_public_id: opt_str(payload, "cover_public_id"),
        is_featured: flag(payload, "is_featured") || flag(payload, "isFeatured"),
        is_bestseller: flag(payload, "is_bestseller") || flag(payload, "isBestseller"),
        is_new_release: flag(payload, "is_new_release") || flag(payload, "isNewRelease"),
        is_free: match payload.get("is_free").or_else(|| payload.get("isFree")) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().unwrap_or(1) != 0,
            _ => payload.get("price").and_then(Value::as_f64).unwrap_or(0.0) <= 0.0,
        },
        price: payload.get("price").and_then(Value::as_f64).unwrap_or(0.0),
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> StorageConfig {
        StorageConfig::default()
    }

    #[test]
    fn test_cover_alias_priority() {
        let payload = json!({
            "coverUrl": "https://cdn.example/b.jpg",
            "cover_url": "https://cdn.example/c.jpg",
            "cover_file_url": "https://cdn.example/a.jpg",
        });
        assert_eq!(
            resolve_cover_url(&payload, &storage()),
            "https://cdn.example/a.jpg"
        );
    }

    #[test]
    fn test_cover_skips_empty_aliases() {
        let payload = json!({
            "cover_file_url": "  ",
            "coverUrl": "",
            "thumbnail": "https://cdn.example/t.jpg",
        });
        assert_eq!(
            resolve_cover_url(&payload, &storage()),
            "https://cdn.example/t.jpg"
        );
    }

    #[test]
    fn test_cover_falls_back_to_placeholder() {
        let payload = json!({"title": "X"});
        assert_eq!(
            resolve_cover_url(&payload, &storage()),
            storage().placeholder_cover
        );
    }

    #[test]
    fn test_attachment_url_insertion() {
        assert_eq!(
            to_attachment_url("https://res.cloudinary.com/demo/raw/upload/v1/books/x.pdf"),
            "https://res.cloudinary.com/demo/raw/upload/fl_attachment/v1/books/x.pdf"
        );
    }

    #[test]
    fn test_attachment_url_idempotent() {
        let url = "https://res.cloudinary.com/demo/raw/upload/fl_attachment/v1/books/x.pdf";
        assert_eq!(to_attachment_url(url), url);
    }

    #[test]
    fn test_attachment_url_without_upload_segment() {
        let url = "https://files.example.com/books/x.pdf";
        assert_eq!(to_attachment_url(url), url);
    }

    #[test]
    fn test_tags_round_trip() {
        let joined = join_tags(&[
            "faith".to_string(),
            " hope ".to_string(),
            "".to_string(),
        ]);
        assert_eq!(joined.as_deref(), Some("faith,hope"));
        assert_eq!(split_tags(joined.as_deref()), vec!["faith", "hope"]);
        assert!(split_tags(None).is_empty());
        assert_eq!(join_tags(&[]), None);
    }

    #[test]
    fn test_book_from_payload_tag_forms() {
        let s = storage();
        let from_array = book_from_payload(
            &json!({"title": "T", "author": "A", "tags": ["x", "y"]}),
            &s,
        )
        .unwrap();
        assert_eq!(from_array.tags.as_deref(), Some("x,y"));

        let from_string = book_from_payload(
            &json!({"title": "T", "author": "A", "tags": "x, y"}),
            &s,
        )
        .unwrap();
        assert_eq!(from_string.tags.as_deref(), Some("x,y"));
    }

    #[test]
    fn test_book_from_payload_requires_title_and_author() {
        let s = storage();
        assert!(book_from_payload(&json!({"author": "A"}), &s).is_none());
        assert!(book_from_payload(&json!({"title": "T"}), &s).is_none());
    }

    #[test]
    fn test_book_from_payload_price_implies_paid() {
        let s = storage();
        let book = book_from_payload(
            &json!({"title": "T", "author": "A", "price": 4.99}),
            &s,
        )
        .unwrap();
        assert!(!book.is_free);
        assert_eq!(book.price, 4.99);
    }
}
