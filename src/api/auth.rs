// Bearer token authentication
//
// Requests carry `Authorization: Bearer <token>`. The token resolves to a
// Principal with a subject, a set of scopes and a manager flag. Missing or
// unknown tokens are rejected with 401 before any handler runs; scope checks
// happen in the handlers and fail with 403.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use tracing::debug;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{WebhookError, WebhookResult};
use crate::webhooks::endpoint::Actor;

use super::AppState;

/// Token scope; `admin` implies `write`, which implies `read`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Read,
    Write,
    Admin,
}

impl FromStr for Scope {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Scope::Read),
            "write" => Ok(Scope::Write),
            "admin" => Ok(Scope::Admin),
            other => Err(WebhookError::validation(
                "Invalid scope",
                format!("Unknown scope: {}", other),
            )),
        }
    }
}

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: Uuid,
    pub scopes: BTreeSet<Scope>,
    pub manager: bool,
}

impl Principal {
    pub fn new(subject: Uuid, scopes: impl IntoIterator<Item = Scope>) -> Self {
        Self {
            subject,
            scopes: scopes.into_iter().collect(),
            manager: false,
        }
    }

    pub fn as_manager(mut self) -> Self {
        self.manager = true;
        self
    }

    /// Whether any granted scope covers `needed`
    pub fn has_scope(&self, needed: Scope) -> bool {
        self.scopes.iter().any(|granted| *granted >= needed)
    }

    pub fn require(&self, needed: Scope) -> WebhookResult<()> {
        if self.has_scope(needed) {
            Ok(())
        } else {
            Err(WebhookError::Forbidden(format!(
                "Token lacks the {:?} scope",
                needed
            )))
        }
    }

    /// Actor used for endpoint authorization
    pub fn actor(&self) -> Actor {
        if self.manager {
            Actor::manager(self.subject)
        } else {
            Actor::person(self.subject)
        }
    }
}

/// Resolves bearer tokens to principals
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Principal>;
}

/// Fixed token table loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, Principal>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    /// Build the table from the `[auth]` config section
    pub fn from_config(config: &AuthConfig) -> WebhookResult<Self> {
        let mut table = Self::new();
        for entry in &config.tokens {
            let scopes = entry
                .scopes
                .iter()
                .map(|s| s.parse())
                .collect::<WebhookResult<Vec<Scope>>>()?;
            let mut principal = Principal::new(entry.subject, scopes);
            principal.manager = entry.manager;
            table = table.with_token(entry.token.clone(), principal);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        self.tokens.get(token).cloned()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = WebhookError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or_else(|| {
            debug!(path = %parts.uri.path(), "Request without bearer token");
            WebhookError::Unauthenticated
        })?;

        state.auth.authenticate(token).ok_or_else(|| {
            debug!(path = %parts.uri.path(), "Unknown bearer token");
            WebhookError::Unauthenticated
        })
    }
}
