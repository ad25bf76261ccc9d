//! Caller authentication
//!
//! Token validation lives outside this crate; the HTTP layer only needs to ask
//! "who owns this bearer token, if anyone". The same token is forwarded to the
//! rendered page so it loads with the caller's permissions.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use std::collections::HashMap;

use crate::Result;

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub token: String,
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Resolve a bearer token; `None` means anonymous
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>>;
}

/// Fixed token → caller name table, loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, token: &str) -> Result<Option<Identity>> {
        Ok(self.tokens.get(token).map(|name| Identity {
            name: name.clone(),
            token: token.to_string(),
        }))
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}
