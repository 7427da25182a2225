use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::db::repository::{ApiKeyRepository, UserRepository};
use crate::db::User;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";
const API_KEY_PREFIX: &str = "pls_";
const API_KEY_HEX_LEN: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Organization id.
    pub org: String,
    pub exp: i64,
    pub iat: i64,
}

pub struct AuthService;

impl AuthService {
    pub fn create_jwt(state: &Arc<AppState>, user_id: &str, org_id: &str) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            org: org_id.to_string(),
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(state.config.jwt.expiration_hours)).timestamp(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(state.config.jwt.secret.as_bytes()),
        )?;

        Ok(token)
    }

    pub fn decode_jwt(state: &Arc<AppState>, token: &str) -> AppResult<Claims> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(state.config.jwt.secret.as_bytes()),
            &Validation::default(),
        )?;

        Ok(data.claims)
    }
}

/// Freshly generated API key: the plaintext is returned to the caller
/// exactly once; only the hash and display prefix are stored.
pub struct GeneratedApiKey {
    pub plaintext: String,
    pub hash: String,
    pub prefix: String,
}

/// Generate a `pls_<64 hex>` API key with its SHA-256 storage hash.
pub fn generate_api_key() -> GeneratedApiKey {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex_part = hex::encode(bytes);

    let plaintext = format!("{API_KEY_PREFIX}{hex_part}");
    GeneratedApiKey {
        hash: hash_api_key(&plaintext),
        prefix: format!("{API_KEY_PREFIX}{}", &hex_part[..8]),
        plaintext,
    }
}

pub fn hash_api_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Shape check before hitting the database.
pub fn is_valid_key_format(key: &str) -> bool {
    key.strip_prefix(API_KEY_PREFIX)
        .map(|rest| rest.len() == API_KEY_HEX_LEN && rest.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Random token for the public inbound-webhook route, 192 bits of entropy.
pub fn generate_incoming_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time string comparison for secret material.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Scope check with `*` wildcard and read-implied-by-write within a
/// resource family. Required scopes look like `alerts:read`.
pub fn scope_allows(scopes: &[String], required: &str) -> bool {
    if scopes.iter().any(|s| s == "*" || s == required) {
        return true;
    }

    if let Some((family, action)) = required.split_once(':') {
        if scopes.iter().any(|s| s == &format!("{family}:*")) {
            return true;
        }
        if action == "read" && scopes.iter().any(|s| s == &format!("{family}:write")) {
            return true;
        }
    }

    false
}

/// Authenticated caller: a JWT-bearing user or an API key. Handlers get
/// the tenant id from here and never trust one from the request body.
pub struct AuthContext {
    pub organization_id: String,
    pub user: Option<User>,
    /// None for JWT sessions (full access); Some for API keys.
    pub scopes: Option<Vec<String>>,
}

impl AuthContext {
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    pub fn require_scope(&self, required: &str) -> AppResult<()> {
        match &self.scopes {
            None => Ok(()),
            Some(scopes) => {
                if scope_allows(scopes, required) {
                    Ok(())
                } else {
                    Err(AppError::Forbidden)
                }
            }
        }
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        // API key header takes precedence for machine callers.
        if let Some(key) = parts.headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            return authenticate_api_key(state, key.trim()).await;
        }

        let auth_header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(AppError::Unauthorized)?;

        if !auth_header.to_ascii_lowercase().starts_with("bearer ") {
            return Err(AppError::Unauthorized);
        }

        let token = auth_header[7..].trim();
        if token.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let claims = AuthService::decode_jwt(state, token)?;
        let user = UserRepository::find_by_id(&state.db, &claims.sub)
            .await?
            .ok_or(AppError::Unauthorized)?;

        if user.organization_id != claims.org {
            tracing::warn!(user = %user.id, "JWT org claim does not match user");
            return Err(AppError::Unauthorized);
        }
        if !user.email_verified {
            return Err(AppError::Forbidden);
        }

        Ok(AuthContext {
            organization_id: claims.org,
            user: Some(user),
            scopes: None,
        })
    }
}

async fn authenticate_api_key(
    state: &Arc<AppState>,
    key: &str,
) -> Result<AuthContext, AppError> {
    if !is_valid_key_format(key) {
        return Err(AppError::Unauthorized);
    }

    let record = ApiKeyRepository::find_by_hash(&state.db, &hash_api_key(key))
        .await?
        .ok_or(AppError::Unauthorized)?;

    let scopes: Vec<String> = serde_json::from_str(&record.scopes).unwrap_or_default();

    let user = match &record.user_id {
        Some(user_id) => UserRepository::find_by_id(&state.db, user_id).await?,
        None => None,
    };

    if let Err(e) = ApiKeyRepository::touch_last_used(&state.db, &record.id).await {
        tracing::debug!("Failed to update api key last_used_at: {:?}", e);
    }

    Ok(AuthContext {
        organization_id: record.organization_id,
        user,
        scopes: Some(scopes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_the_documented_shape() {
        let key = generate_api_key();
        assert!(is_valid_key_format(&key.plaintext));
        assert!(key.plaintext.starts_with("pls_"));
        assert_eq!(key.plaintext.len(), 4 + 64);
        assert_eq!(key.prefix.len(), 4 + 8);
        assert!(key.plaintext.starts_with(&key.prefix));
        assert_eq!(key.hash, hash_api_key(&key.plaintext));
    }

    #[test]
    fn key_format_rejects_wrong_shapes() {
        assert!(!is_valid_key_format("pls_short"));
        assert!(!is_valid_key_format("other_0000000000000000000000000000000000000000000000000000000000000000"));
        let not_hex = format!("pls_{}", "g".repeat(64));
        assert!(!is_valid_key_format(&not_hex));
    }

    #[test]
    fn incoming_tokens_carry_192_bits() {
        let token = generate_incoming_token();
        assert_eq!(token.len(), 48);
        assert_ne!(token, generate_incoming_token());
    }

    #[test]
    fn wildcard_scope_allows_everything() {
        let scopes = vec!["*".to_string()];
        assert!(scope_allows(&scopes, "alerts:read"));
        assert!(scope_allows(&scopes, "incidents:write"));
    }

    #[test]
    fn write_implies_read_within_family() {
        let scopes = vec!["alerts:write".to_string()];
        assert!(scope_allows(&scopes, "alerts:write"));
        assert!(scope_allows(&scopes, "alerts:read"));
        assert!(!scope_allows(&scopes, "incidents:read"));
        // Read never implies write.
        let scopes = vec!["alerts:read".to_string()];
        assert!(!scope_allows(&scopes, "alerts:write"));
    }

    #[test]
    fn family_wildcard_covers_both_actions() {
        let scopes = vec!["schedules:*".to_string()];
        assert!(scope_allows(&scopes, "schedules:read"));
        assert!(scope_allows(&scopes, "schedules:write"));
        assert!(!scope_allows(&scopes, "alerts:read"));
    }

    #[test]
    fn constant_time_eq_compares_content() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
