use crate::config::AuthConfig;
use crate::db::{Database, Session, User, now_timestamp};
use crate::error::{AppError, Result};
use argon2::{
    Argon2,
    password_hash::{
        PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
        rand_core::{OsRng, RngCore},
    },
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use uuid::Uuid;

/// Account and session management.
#[derive(Clone)]
pub struct AuthService {
    db: Database,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(db: Database, config: AuthConfig) -> Self {
        Self { db, config }
    }

    /// Hash a password with Argon2id.
    pub fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a stored hash.
    pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    /// Generate a random session token (32 bytes, base64 URL-safe).
    fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Create a new account.
    ///
    /// The configured admin email is granted the admin role at registration;
    /// everyone else starts as a regular user.
    pub fn register(&self, email: &str, name: Option<&str>, password: &str) -> Result<User> {
        if !self.config.registration_enabled() {
            return Err(AppError::Forbidden("Registration is closed".to_string()));
        }

        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::InvalidRequest("Invalid email address".to_string()));
        }
        if password.len() < 8 {
            return Err(AppError::InvalidRequest(
                "Password must be at least 8 characters".to_string(),
            ));
        }

        let role = if self
            .config
            .admin_email
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case(&email))
        {
            "admin"
        } else {
            "user"
        };

        let now = now_timestamp();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            password_hash: Self::hash_password(password)?,
            role: role.to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
            last_login: None,
        };

        self.db.create_user(&user)?;
        tracing::info!(email = %user.email, role = %user.role, "User registered");
        Ok(user)
    }

    /// Authenticate and open a session. Deactivated accounts cannot log in.
    pub fn login(&self, email: &str, password: &str) -> Result<(User, Session)> {
        let email = email.trim().to_lowercase();
        let user = self
            .db
            .get_user_by_email(&email)?
            .ok_or_else(|| AppError::Unauthorized("Invalid email or password".to_string()))?;

        if !Self::verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthorized(
                "Invalid email or password".to_string(),
            ));
        }
        if !user.is_active {
            return Err(AppError::Forbidden("Account is deactivated".to_string()));
        }

        let session = Session {
            token: Self::generate_token(),
            user_id: user.id.clone(),
            expires_at: now_timestamp() + i64::from(self.config.session_days) * 24 * 3600,
        };
        self.db.create_session(&session)?;
        self.db.update_user_last_login(&user.id)?;

        tracing::info!(email = %user.email, "User logged in");
        Ok((user, session))
    }

    /// Resolve a bearer token to its user. Expired sessions are deleted on
    /// sight; deactivated accounts are rejected even with a live session.
    pub fn validate_token(&self, token: &str) -> Result<User> {
        let session = self
            .db
            .get_session(token)?
            .ok_or_else(|| AppError::Unauthorized("Invalid session token".to_string()))?;

        if session.expires_at < now_timestamp() {
            self.db.delete_session(token)?;
            return Err(AppError::Unauthorized("Session expired".to_string()));
        }

        let user = self
            .db
            .get_user_by_id(&session.user_id)?
            .ok_or_else(|| AppError::Unauthorized("Invalid session token".to_string()))?;
        if !user.is_active {
            return Err(AppError::Forbidden("Account is deactivated".to_string()));
        }

        Ok(user)
    }

    /// Close a session. Unknown tokens are a no-op.
    pub fn logout(&self, token: &str) -> Result<()> {
        self.db.delete_session(token)
    }

    /// Change a user's password by email.
    pub fn change_password(&self, email: &str, new_password: &str) -> Result<()> {
        if new_password.len() < 8 {
            return Err(AppError::InvalidRequest(
                "Password must be at least 8 characters".to_string(),
            ));
        }
        let hash = Self::hash_password(new_password)?;
        if !self.db.update_user_password(email, &hash)? {
            return Err(AppError::NotFound(format!("User '{}' not found", email)));
        }
        Ok(())
    }
}
