//! Accounts and bearer sessions.

use crate::db::{Session, User, now_timestamp};
use crate::error::{AppError, Result};
use crate::store::Store;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::{OsRng, RngCore}},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

const MIN_PASSWORD_LEN: usize = 4;

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Generate a secure random session token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Account and session management on the application store.
pub struct AuthService {
    store: Store,
    session_days: u32,
    registration_enabled: bool,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(store: Store, session_days: u32, registration_enabled: bool) -> Self {
        Self {
            store,
            session_days,
            registration_enabled,
        }
    }

    /// Self-service sign-up, subject to the registration setting.
    pub fn register(&self, username: &str, password: &str) -> Result<User> {
        if !self.registration_enabled {
            return Err(AppError::Unauthorized("Registration is disabled".to_string()));
        }

        self.create_user(username, password, "user")
    }

    /// Create a new user (admin function).
    pub fn create_user(&self, username: &str, password: &str, role: &str) -> Result<User> {
        if username.is_empty() || username.len() > 64 {
            return Err(AppError::InvalidRequest(
                "Username must be 1-64 characters".to_string(),
            ));
        }
        if !username
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AppError::InvalidRequest(
                "Username can only contain letters, numbers, _ and -".to_string(),
            ));
        }
        check_password(password)?;
        if role != "admin" && role != "user" {
            return Err(AppError::InvalidRequest(
                "Role must be 'admin' or 'user'".to_string(),
            ));
        }

        let password_hash = hash_password(password)?;
        let user = self.store.app.create_user(username, &password_hash, role)?;
        self.store.users.insert(user.id, user.clone());

        tracing::info!(user_id = user.id, username, role, "User created");
        Ok(user)
    }

    /// Check credentials and open a session. Returns the user and token.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        device_id: Option<String>,
    ) -> Result<(User, String)> {
        let invalid = || AppError::Unauthorized("Invalid username or password".to_string());

        let user = self
            .store
            .app
            .get_user_by_username(username)?
            .ok_or_else(invalid)?;
        if !verify_password(password, &user.password_hash)? {
            return Err(invalid());
        }

        self.store.app.update_user_last_login(user.id)?;
        self.store.invalidate_user(user.id);

        let token = generate_token();
        self.store.app.create_session(&Session {
            token: token.clone(),
            user_id: user.id,
            device_id,
            expires_at: now_timestamp() + self.session_days as i64 * 24 * 60 * 60,
        })?;

        Ok((user, token))
    }

    /// User behind a session token, if the session is live.
    pub fn validate_token(&self, token: &str) -> Result<Option<User>> {
        let Some(session) = self.store.app.get_session(token)? else {
            return Ok(None);
        };

        if session.expires_at < now_timestamp() {
            self.store.app.delete_session(token)?;
            return Ok(None);
        }

        self.store.user(session.user_id)
    }

    /// Logout (delete session).
    pub fn logout(&self, token: &str) -> Result<()> {
        self.store.app.delete_session(token)
    }

    /// Change user password.
    pub fn change_password(&self, username: &str, new_password: &str) -> Result<bool> {
        check_password(new_password)?;

        let password_hash = hash_password(new_password)?;
        let changed = self.store.app.update_user_password(username, &password_hash)?;
        if let Some(user) = self.store.app.get_user_by_username(username)? {
            self.store.invalidate_user(user.id);
        }
        Ok(changed)
    }

    /// Delete a user.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        if let Some(user) = self.store.app.get_user_by_username(username)? {
            self.store.invalidate_user(user.id);
        }
        self.store.app.delete_user(username)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.store.app.list_users()
    }

    /// Look up a user by name.
    pub fn find_user(&self, username: &str) -> Result<Option<User>> {
        self.store.app.get_user_by_username(username)
    }

    /// Drop expired sessions.
    pub fn cleanup_sessions(&self) -> Result<usize> {
        self.store.app.cleanup_expired_sessions()
    }
}

fn check_password(password: &str) -> Result<()> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::InvalidRequest(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}
