//! ApiKey issuance/listing/revocation (§3). Grounded on the teacher's
//! `keys/models.rs` state-enum + `as_str()` idiom. The raw secret is returned once at
//! creation; only `sha256(key)` is ever stored.

use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::audit::{self, AuditAction, RecordAudit};
use crate::error::{AppError, AppResult};
use crate::extractor::{hash_key, AuthUser};
use crate::rbac::{self, perm};

#[derive(Debug, Serialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    #[serde(flatten)]
    pub key: ApiKey,
    /// Present only in the creation response; never retrievable again.
    pub raw_key: String,
}

fn generate_raw_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ck_{}", hex::encode(bytes))
}

pub async fn create(
    pool: &PgPool,
    user_id: Uuid,
    name: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<CreatedApiKey, AppError> {
    let raw = generate_raw_key();
    let hash = hash_key(&raw);
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO api_keys (id, user_id, key_hash, name, created_at, expires_at)
        VALUES ($1,$2,$3,$4,NOW(),$5)
        RETURNING id, user_id, name, created_at, expires_at, last_used_at
        "#,
    )
    .bind(id)
    .bind(user_id)
    .bind(&hash)
    .bind(name)
    .bind(expires_at)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;

    Ok(CreatedApiKey {
        key: ApiKey {
            id: row.get("id"),
            user_id: row.get("user_id"),
            name: row.get("name"),
            created_at: row.get("created_at"),
            expires_at: row.try_get("expires_at").ok(),
            last_used_at: row.try_get("last_used_at").ok(),
        },
        raw_key: raw,
    })
}

pub async fn list_for_user(pool: &PgPool, user_id: Uuid) -> Result<Vec<ApiKey>, AppError> {
    let rows = sqlx::query(
        "SELECT id, user_id, name, created_at, expires_at, last_used_at FROM api_keys WHERE user_id = $1 ORDER BY created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(rows
        .into_iter()
        .map(|r| ApiKey {
            id: r.get("id"),
            user_id: r.get("user_id"),
            name: r.get("name"),
            created_at: r.get("created_at"),
            expires_at: r.try_get("expires_at").ok(),
            last_used_at: r.try_get("last_used_at").ok(),
        })
        .collect())
}

pub async fn revoke(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn create_key_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<CreateApiKeyRequest>,
) -> AppResult<Json<CreatedApiKey>> {
    if !rbac::can_perform(auth.role, perm::API_KEYS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let created = create(&pool, auth.user_id, &req.name, req.expires_at).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "api_key",
            resource_id: Some(created.key.id.to_string()),
            before: None,
            after: serde_json::to_value(&created.key).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(created))
}

pub async fn list_keys_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
) -> AppResult<Json<Vec<ApiKey>>> {
    Ok(Json(list_for_user(&pool, auth.user_id).await?))
}

pub async fn revoke_key_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    revoke(&pool, id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Delete,
            resource_type: "api_key",
            resource_id: Some(id.to_string()),
            before: None,
            after: None,
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(axum::http::StatusCode::NO_CONTENT)
}
