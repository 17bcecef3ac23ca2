use axum::{
    async_trait,
    extract::{FromRequestParts, RequestPartsExt},
    http::request::Parts,
    Extension,
};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::AppError;
use crate::rbac::Role;

/// The authenticated caller, resolved from a bearer API key (§6, §4.8).
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub api_key_id: Uuid,
    pub role: Role,
    pub team_ids: Vec<Uuid>,
}

pub fn hash_key(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)
}

fn extract_raw_key(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get("X-Api-Key") {
        if let Ok(s) = value.to_str() {
            return Some(s.to_string());
        }
    }
    if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    None
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(pool) = parts
            .extract::<Extension<PgPool>>()
            .await
            .map_err(|_| AppError::Internal("missing db pool extension".into()))?;
        let raw_key = extract_raw_key(parts).ok_or(AppError::Unauthorized)?;
        let _ = state;
        resolve_api_key(&pool, &raw_key).await
    }
}

/// Looks up the owning user and role for a raw bearer key, rejecting unknown or
/// expired keys. Shared by the REST extractor and the `/ws/*` handshakes, which read
/// headers manually before the axum WebSocket upgrade.
pub async fn resolve_api_key(pool: &PgPool, raw_key: &str) -> Result<AuthUser, AppError> {
    let hash = hash_key(raw_key);

    let row = sqlx::query(
        r#"
        SELECT k.id as key_id, k.user_id as user_id, k.expires_at, u.role as role
        FROM api_keys k
        JOIN users u ON u.id = k.user_id
        WHERE k.key_hash = $1
        "#,
    )
    .bind(&hash)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Db)?
    .ok_or(AppError::Unauthorized)?;

    let expires_at: Option<chrono::DateTime<chrono::Utc>> = row.try_get("expires_at").ok();
    if let Some(expires_at) = expires_at {
        if expires_at < chrono::Utc::now() {
            return Err(AppError::Unauthorized);
        }
    }

    let key_id: Uuid = row.get("key_id");
    let user_id: Uuid = row.get("user_id");
    let role_str: String = row.get("role");
    let role: Role = role_str.parse()?;

    sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
        .bind(key_id)
        .execute(pool)
        .await
        .ok();

    let team_rows = sqlx::query("SELECT team_id FROM team_members WHERE user_id = $1")
        .bind(user_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    let team_ids = team_rows.into_iter().map(|r| r.get("team_id")).collect();

    Ok(AuthUser {
        user_id,
        api_key_id: key_id,
        role,
        team_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_sha256() {
        let h1 = hash_key("secret-value");
        let h2 = hash_key("secret-value");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn different_keys_hash_differently() {
        assert_ne!(hash_key("a"), hash_key("b"));
    }
}
