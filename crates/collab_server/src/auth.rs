//! Bearer-token authentication for WebSocket and REST clients.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::{
    Json,
    extract::{FromRef, FromRequestParts},
    http::{StatusCode, request::Parts},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use collab_core::CollabError;
use collab_core::error::SerializableError;
use tracing::{debug, warn};

/// Known tokens and the user each one authenticates.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, String>>,
}

impl TokenRegistry {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: RwLock::new(tokens),
        }
    }

    /// The user a token belongs to.
    pub fn validate(&self, token: &str) -> Option<String> {
        let tokens = match self.tokens.read() {
            Ok(t) => t,
            Err(_) => {
                warn!("token registry lock poisoned");
                return None;
            }
        };
        tokens.get(token.trim()).cloned()
    }

    /// Mint a fresh token for `user_id`.
    pub fn issue(&self, user_id: &str) -> Option<String> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut tokens = self.tokens.write().ok()?;
        tokens.insert(token.clone(), user_id.to_string());
        debug!(user_id, "issued token");
        Some(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extractor for required authentication
///
/// Reads `Authorization: Bearer <token>` and rejects with 401 if the token
/// is missing or unknown. Holds the authenticated user id.
#[derive(Debug, Clone)]
pub struct RequireAuth(pub String);

impl<S> FromRequestParts<S> for RequireAuth
where
    Arc<TokenRegistry>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<SerializableError>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let unauthorized = |reason: &str| {
            (
                StatusCode::UNAUTHORIZED,
                Json(CollabError::Authorization(reason.to_string()).to_serializable()),
            )
        };

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| unauthorized("missing bearer token"))?;

        let registry = Arc::<TokenRegistry>::from_ref(state);
        registry
            .validate(bearer.token())
            .map(RequireAuth)
            .ok_or_else(|| unauthorized("invalid token"))
    }
}
