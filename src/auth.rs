//! Principal resolution.
//!
//! Browsers authenticate with `Authorization: Bearer <token>` or, for the
//! WebSocket upgrade (browsers can't set headers there), a `?token=` query
//! parameter. [`attach_principal`] maps the token to a user id through the
//! configured [`TokenTable`] and stores a [`Principal`] in the request
//! extensions. It never rejects: handlers that need a user extract
//! [`Principal`] (401 when absent) or [`MaybePrincipal`] when the 401 must be
//! ordered after other validation.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request},
    http::request::Parts,
    middleware::Next,
    response::Response,
};

use crate::error::HubError;

/// Authenticated user attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

/// Bearer token → user id, injected as a router extension.
#[derive(Clone, Default)]
pub struct TokenTable(pub Arc<HashMap<String, String>>);

impl TokenTable {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self(Arc::new(tokens))
    }

    /// Find the user owning `provided`. Every entry is compared in constant
    /// time.
    pub fn resolve(&self, provided: &str) -> Option<Principal> {
        let mut found = None;
        for (token, user) in self.0.iter() {
            if constant_time_eq(token.as_bytes(), provided.as_bytes()) {
                found = Some(user.clone());
            }
        }
        found.map(|user_id| Principal { user_id })
    }
}

/// Axum middleware that attaches a [`Principal`] when the request carries a
/// known token.
pub async fn attach_principal(mut request: Request, next: Next) -> Response {
    let principal = match request.extensions().get::<TokenTable>() {
        Some(table) => request_token(&request).and_then(|t| table.resolve(&t)),
        None => None,
    };
    if let Some(p) = principal {
        request.extensions_mut().insert(p);
    }
    next.run(request).await
}

fn request_token(request: &Request) -> Option<String> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    if let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) {
        return Some(token.to_string());
    }
    request.uri().query().and_then(query_token)
}

/// Extract `token` from a raw query string.
pub fn query_token(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .map(|(_, v)| v.to_string())
}

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or(HubError::Unauthorized)
    }
}

/// Principal if one was resolved; never rejects.
pub struct MaybePrincipal(pub Option<Principal>);

impl<S: Send + Sync> FromRequestParts<S> for MaybePrincipal {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<Principal>().cloned()))
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}
