use crate::auth::AuthService;
use crate::config::AuthConfig;
use crate::db::{
    Book, BookFilter, Database, Payment, PaymentStatus, ReadingStatus, User, now_timestamp,
};

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn test_auth(db: &Database) -> AuthService {
    AuthService::new(db.clone(), AuthConfig::default())
}

fn create_user(db: &Database, id: &str, email: &str) -> User {
    let now = now_timestamp();
    let user = User {
        id: id.to_string(),
        email: email.to_string(),
        name: None,
        password_hash: "unused".to_string(),
        role: "user".to_string(),
        is_active: true,
        created_at: now,
        updated_at: now,
        last_login: None,
    };
    db.create_user(&user).unwrap();
    user
}

fn create_book(db: &Database, id: &str, title: &str) -> Book {
    let now = now_timestamp();
    let book = Book {
        id: id.to_string(),
        title: title.to_string(),
        author: "Test Author".to_string(),
        description: None,
        short_description: None,
        genre: Some("devotional".to_string()),
        tags: Some("faith,prayer".to_string()),
        publisher: None,
        isbn: None,
        language: Some("en".to_string()),
        pages: Some(200),
        rating: 4.5,
        total_ratings: 10,
        downloads: 0,
        audio_url: None,
        pdf_url: Some("https://cdn.example/upload/v1/test.pdf".to_string()),
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
    };
    db.create_book(&book).unwrap();
    book
}

fn create_payment_row(db: &Database, id: &str, user_id: &str, book_id: &str) -> Payment {
    let now = now_timestamp();
    let payment = Payment {
        id: id.to_string(),
        user_id: user_id.to_string(),
        book_id: book_id.to_string(),
        order_id: None,
        order_tracking_id: Some(format!("trk-{}", id)),
        merchant_reference: format!("ref-{}", id),
        amount: 9.99,
        currency: "KES".to_string(),
        status: PaymentStatus::Pending,
        payment_method: None,
        confirmation_code: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };
    db.create_payment(&payment).unwrap();
    payment
}

#[test]
fn test_register_and_login() {
    let db = test_db();
    let auth = test_auth(&db);

    let user = auth
        .register("Reader@Example.COM", Some("Reader"), "password123")
        .unwrap();
    assert_eq!(user.email, "reader@example.com");
    assert_eq!(user.role, "user");

    let (user, session) = auth.login("reader@example.com", "password123").unwrap();
    assert!(session.expires_at > now_timestamp());

    let validated = auth.validate_token(&session.token).unwrap();
    assert_eq!(validated.id, user.id);
}

#[test]
fn test_login_rejects_wrong_password_and_inactive_account() {
    let db = test_db();
    let auth = test_auth(&db);
    let user = auth
        .register("reader@example.com", None, "password123")
        .unwrap();

    assert!(auth.login("reader@example.com", "wrong-password").is_err());

    db.set_user_active(&user.id, false).unwrap();
    assert!(auth.login("reader@example.com", "password123").is_err());
}

#[test]
fn test_admin_email_gets_admin_role() {
    let db = test_db();
    let auth = AuthService::new(
        db.clone(),
        AuthConfig {
            admin_email: Some("boss@example.com".to_string()),
            ..AuthConfig::default()
        },
    );

    let admin = auth.register("boss@example.com", None, "password123").unwrap();
    assert_eq!(admin.role, "admin");
    let user = auth.register("other@example.com", None, "password123").unwrap();
    assert_eq!(user.role, "user");
}

#[test]
fn test_duplicate_email_rejected() {
    let db = test_db();
    let auth = test_auth(&db);
    auth.register("reader@example.com", None, "password123").unwrap();
    assert!(
        auth.register("reader@example.com", None, "password456")
            .is_err()
    );
}

#[test]
fn test_closed_registration() {
    let db = test_db();
    let auth = AuthService::new(
        db.clone(),
        AuthConfig {
            registration: "closed".to_string(),
            ..AuthConfig::default()
        },
    );
    assert!(auth.register("reader@example.com", None, "password123").is_err());
}

#[test]
fn test_session_expiry_cleanup() {
    let db = test_db();
    let user = create_user(&db, "u1", "u1@example.com");
    db.create_session(&crate::db::Session {
        token: "expired".to_string(),
        user_id: user.id.clone(),
        expires_at: now_timestamp() - 10,
    })
    .unwrap();
    db.create_session(&crate::db::Session {
        token: "live".to_string(),
        user_id: user.id,
        expires_at: now_timestamp() + 1000,
    })
    .unwrap();

    assert_eq!(db.cleanup_expired_sessions().unwrap(), 1);
    assert!(db.get_session("expired").unwrap().is_none());
    assert!(db.get_session("live").unwrap().is_some());
}

#[test]
fn test_book_search_filters() {
    let db = test_db();
    create_book(&db, "b1", "Morning Prayers");
    let mut featured = create_book(&db, "b2", "Evening Hymns");
    featured.is_featured = true;
    db.update_book(&featured).unwrap();

    let all = db.list_books(&BookFilter::default()).unwrap();
    assert_eq!(all.len(), 2);

    let by_title = db
        .list_books(&BookFilter {
            query: Some("morning".to_string()),
            ..BookFilter::default()
        })
        .unwrap();
    assert_eq!(by_title.len(), 1);
    assert_eq!(by_title[0].id, "b1");

    // Tags participate in search
    let by_tag = db
        .list_books(&BookFilter {
            query: Some("prayer".to_string()),
            ..BookFilter::default()
        })
        .unwrap();
    assert_eq!(by_tag.len(), 2);

    let featured_only = db
        .list_books(&BookFilter {
            featured: true,
            ..BookFilter::default()
        })
        .unwrap();
    assert_eq!(featured_only.len(), 1);
    assert_eq!(featured_only[0].id, "b2");
}

#[test]
fn test_book_download_counter() {
    let db = test_db();
    create_book(&db, "b1", "Book");
    assert!(db.increment_downloads("b1").unwrap());
    assert!(db.increment_downloads("b1").unwrap());
    assert!(!db.increment_downloads("missing").unwrap());
    assert_eq!(db.get_book("b1").unwrap().unwrap().downloads, 2);
}

#[test]
fn test_favorite_upsert_is_idempotent() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");

    assert!(db.add_favorite("u1", "b1").unwrap());
    assert!(!db.add_favorite("u1", "b1").unwrap());
    assert!(db.is_favorite("u1", "b1").unwrap());
    assert_eq!(db.list_favorites("u1").unwrap().len(), 1);

    db.remove_favorite("u1", "b1").unwrap();
    assert!(!db.is_favorite("u1", "b1").unwrap());
}

#[test]
fn test_download_history_counter() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");

    assert_eq!(db.record_download("u1", "b1", "pdf").unwrap(), 1);
    assert_eq!(db.record_download("u1", "b1", "pdf").unwrap(), 2);
    assert_eq!(db.record_download("u1", "b1", "audio").unwrap(), 1);

    let records = db.list_downloads("u1").unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_library_visited_never_downgrades() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");

    db.upsert_library_entry("u1", "b1", ReadingStatus::Reading, 0.5)
        .unwrap();
    // A later visit must not clobber the chosen status or progress
    db.upsert_library_entry("u1", "b1", ReadingStatus::Visited, 0.0)
        .unwrap();

    let entry = db.get_library_entry("u1", "b1").unwrap().unwrap();
    assert_eq!(entry.reading_status, ReadingStatus::Reading);
    assert_eq!(entry.progress, 0.5);

    // Intentional statuses still replace each other
    db.upsert_library_entry("u1", "b1", ReadingStatus::Completed, 1.0)
        .unwrap();
    let entry = db.get_library_entry("u1", "b1").unwrap().unwrap();
    assert_eq!(entry.reading_status, ReadingStatus::Completed);
}

#[test]
fn test_library_visited_can_replace_visited() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");

    db.upsert_library_entry("u1", "b1", ReadingStatus::Visited, 0.0)
        .unwrap();
    db.upsert_library_entry("u1", "b1", ReadingStatus::Visited, 0.0)
        .unwrap();
    let entry = db.get_library_entry("u1", "b1").unwrap().unwrap();
    assert_eq!(entry.reading_status, ReadingStatus::Visited);
}

#[test]
fn test_library_listing_with_status_filter() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "First");
    create_book(&db, "b2", "Second");

    db.upsert_library_entry("u1", "b1", ReadingStatus::Reading, 0.2)
        .unwrap();
    db.upsert_library_entry("u1", "b2", ReadingStatus::Completed, 1.0)
        .unwrap();

    let all = db.list_library("u1", None).unwrap();
    assert_eq!(all.len(), 2);

    let completed = db
        .list_library("u1", Some(ReadingStatus::Completed))
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].1.id, "b2");

    assert!(db.remove_library_entry("u1", "b1").unwrap());
    assert_eq!(db.list_library("u1", None).unwrap().len(), 1);
}

#[test]
fn test_payment_pending_to_completed() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");
    let payment = create_payment_row(&db, "p1", "u1", "b1");

    let moved = db
        .transition_payment(&payment.id, PaymentStatus::Completed, Some("MPESA"), Some("QX1"))
        .unwrap();
    assert!(moved);

    let stored = db.get_payment("p1").unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Completed);
    assert_eq!(stored.payment_method.as_deref(), Some("MPESA"));
    assert!(stored.completed_at.is_some());
}

#[test]
fn test_completed_payment_never_reverts() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");
    let payment = create_payment_row(&db, "p1", "u1", "b1");

    db.transition_payment(&payment.id, PaymentStatus::Completed, None, None)
        .unwrap();

    // Late failure and cancellation reports bounce off the guard
    assert!(
        !db.transition_payment(&payment.id, PaymentStatus::Failed, None, None)
            .unwrap()
    );
    assert!(
        !db.transition_payment(&payment.id, PaymentStatus::Cancelled, None, None)
            .unwrap()
    );

    let stored = db.get_payment("p1").unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Completed);
}

#[test]
fn test_pending_is_not_a_transition_target() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");
    let payment = create_payment_row(&db, "p1", "u1", "b1");

    assert!(
        !db.transition_payment(&payment.id, PaymentStatus::Pending, None, None)
            .unwrap()
    );
    let stored = db.get_payment("p1").unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
}

#[test]
fn test_latest_payment_wins() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_book(&db, "b1", "Book");

    let first = create_payment_row(&db, "p1", "u1", "b1");
    db.transition_payment(&first.id, PaymentStatus::Failed, None, None)
        .unwrap();
    create_payment_row(&db, "p2", "u1", "b1");

    let latest = db.latest_payment("u1", "b1").unwrap().unwrap();
    assert_eq!(latest.id, "p2");
    assert_eq!(latest.status, PaymentStatus::Pending);

    let by_tracking = db.get_payment_by_tracking("trk-p1").unwrap().unwrap();
    assert_eq!(by_tracking.id, "p1");
}

#[test]
fn test_cascade_delete_keeps_other_users_data() {
    let db = test_db();
    create_user(&db, "u1", "u1@example.com");
    create_user(&db, "u2", "u2@example.com");
    create_book(&db, "b1", "Book");
    db.add_favorite("u1", "b1").unwrap();
    db.add_favorite("u2", "b1").unwrap();

    db.delete_book("b1").unwrap();
    assert!(!db.is_favorite("u1", "b1").unwrap());
    assert!(db.list_favorites("u2").unwrap().is_empty());
}
