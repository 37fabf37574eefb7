//! Accounts - Registration, Login and Admin Bootstrap
//!
//! Credentials are sealed as `pbkdf2-sha256$<iterations>$<salt>$<hex digest>`.
//! The round count travels with the digest, so raising it never locks out
//! existing users.

use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::BootstrapAdmin;
use crate::directory::{DirectoryError, User, UserDirectory};
use crate::hashing::{credential_hash, digest_eq, CREDENTIAL_ITERATIONS};

const MAX_USERNAME_LEN: usize = 64;
const SEAL_SCHEME: &str = "pbkdf2-sha256";

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    #[error("Password must not be empty")]
    EmptyPassword,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Cannot derive credential")]
    Derivation,

    #[error("Directory error: {0}")]
    Directory(DirectoryError),
}

impl From<DirectoryError> for AccountError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::UsernameTaken(name) => AccountError::UsernameTaken(name),
            other => AccountError::Directory(other),
        }
    }
}

pub struct Accounts {
    directory: Arc<dyn UserDirectory>,
    iterations: u32,
}

impl Accounts {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            directory,
            iterations: CREDENTIAL_ITERATIONS,
        }
    }

    /// PBKDF2 rounds for credentials sealed from now on (at least 1).
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn register(&self, username: &str, password: &str) -> Result<User, AccountError> {
        validate_username(username)?;
        if password.is_empty() {
            return Err(AccountError::EmptyPassword);
        }
        if self.directory.find_by_name(username).is_some() {
            return Err(AccountError::UsernameTaken(username.to_string()));
        }

        let sealed = seal(password, self.iterations)?;
        let user = self.directory.create(username, &sealed)?;
        tracing::info!(user = %user.id, name = %user.name, "user registered");
        Ok(user)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<User, AccountError> {
        let user = self
            .directory
            .find_by_name(username)
            .ok_or(AccountError::InvalidCredentials)?;

        if !verify(password, &user.credential_hash) {
            tracing::warn!(name = %username, "login rejected");
            return Err(AccountError::InvalidCredentials);
        }
        Ok(user)
    }

    /// Provision the administrative user if it does not exist yet.
    pub fn bootstrap_admin(&self, admin: &BootstrapAdmin) -> Result<User, AccountError> {
        if let Some(existing) = self.directory.find_by_name(&admin.username) {
            return Ok(existing);
        }
        match self.register(&admin.username, &admin.password) {
            // Lost a race with another bootstrapper
            Err(AccountError::UsernameTaken(_)) => self
                .directory
                .find_by_name(&admin.username)
                .ok_or(AccountError::InvalidCredentials),
            other => other,
        }
    }
}

fn validate_username(username: &str) -> Result<(), AccountError> {
    let ok = !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && !username.chars().any(|c| c.is_control() || c.is_whitespace());
    if ok {
        Ok(())
    } else {
        Err(AccountError::InvalidUsername(username.to_string()))
    }
}

fn seal(password: &str, iterations: u32) -> Result<String, AccountError> {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = credential_hash(&salt, password, iterations).ok_or(AccountError::Derivation)?;
    Ok(format!("{}${}${}${}", SEAL_SCHEME, iterations, salt, digest))
}

fn verify(password: &str, sealed: &str) -> bool {
    let mut parts = sealed.splitn(4, '$');
    let (Some(SEAL_SCHEME), Some(rounds), Some(salt), Some(digest)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(iterations) = rounds.parse::<u32>() else {
        return false;
    };
    credential_hash(salt, password, iterations).is_some_and(|d| digest_eq(&d, digest))
}
