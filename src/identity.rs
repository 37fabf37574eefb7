//! Identity Provider - "Who is the caller, if anyone"

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::directory::{UserDirectory, UserId};

/// Cookie carrying the caller's username.
pub const USER_COOKIE: &str = "user";

/// Whatever the serving layer hands over about the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub cookies: HashMap<String, String>,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Context that identifies as `username` through the user cookie
    pub fn for_user(username: impl Into<String>) -> Self {
        Self::anonymous().with_cookie(USER_COOKIE, username)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, ctx: &RequestContext) -> Option<UserId>;
}

/// Resolves the `user` cookie against the directory. Unknown names are anonymous.
pub struct CookieIdentity {
    directory: Arc<dyn UserDirectory>,
}

impl CookieIdentity {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }
}

impl IdentityProvider for CookieIdentity {
    fn resolve(&self, ctx: &RequestContext) -> Option<UserId> {
        let name = ctx.cookie(USER_COOKIE)?;
        self.directory.find_by_name(name).map(|u| u.id)
    }
}
