//! User accounts (§3). Created by ADMIN, role mutable (audited), hard-delete
//! cascades memberships and revokes API keys. Grounded on the teacher's
//! `organizations.rs` ownership-check CRUD shape.

use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::audit::{self, AuditAction, RecordAudit};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::rbac::{self, perm, Role};

static EMAIL_RE: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap()
});

#[derive(Debug, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        role: row.get("role"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateUser {
    pub email: String,
    pub role: String,
}

pub async fn create(pool: &PgPool, req: CreateUser) -> Result<User, AppError> {
    if !EMAIL_RE.is_match(&req.email) {
        return Err(AppError::Validation {
            details: vec!["email is not a valid address".to_string()],
        });
    }
    let role: Role = req.role.parse()?;
    let id = Uuid::new_v4();
    let row = sqlx::query(
        "INSERT INTO users (id, email, role, created_at, updated_at) VALUES ($1, $2, $3, NOW(), NOW()) RETURNING *",
    )
    .bind(id)
    .bind(req.email.to_lowercase())
    .bind(role.as_str())
    .fetch_one(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
            AppError::Conflict("email already registered".to_string())
        }
        _ => AppError::Db(e),
    })?;
    Ok(row_to_user(&row))
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<User, AppError> {
    let row = sqlx::query("SELECT * FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    Ok(row_to_user(&row))
}

pub async fn list(pool: &PgPool) -> Result<Vec<User>, AppError> {
    let rows = sqlx::query("SELECT * FROM users ORDER BY email ASC")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(rows.iter().map(row_to_user).collect())
}

/// Role mutation; callers are responsible for writing the `PERMISSION_CHANGE` audit
/// entry (§4.8).
pub async fn set_role(pool: &PgPool, id: Uuid, role: Role) -> Result<User, AppError> {
    let row = sqlx::query("UPDATE users SET role = $2, updated_at = NOW() WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(role.as_str())
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    Ok(row_to_user(&row))
}

/// Hard-delete cascades memberships and revokes API keys (§3); the schema's foreign
/// keys carry `ON DELETE CASCADE` for both.
pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

pub async fn list_users(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
) -> AppResult<Json<Vec<User>>> {
    if !rbac::can_perform(auth.role, perm::USERS_READ) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(list(&pool).await?))
}

pub async fn get_user(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<User>> {
    if !rbac::can_perform(auth.role, perm::USERS_READ) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(get(&pool, id).await?))
}

pub async fn create_user(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<CreateUser>,
) -> AppResult<Json<User>> {
    if auth.role != Role::Admin {
        return Err(AppError::Forbidden);
    }
    let user = create(&pool, req).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "user",
            resource_id: Some(user.id.to_string()),
            before: None,
            after: serde_json::to_value(&user).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
pub struct SetRoleRequest {
    pub role: String,
}

pub async fn set_role_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SetRoleRequest>,
) -> AppResult<Json<User>> {
    if auth.role != Role::Admin {
        return Err(AppError::Forbidden);
    }
    let role: Role = req.role.parse()?;
    let before = get(&pool, id).await?;
    let updated = set_role(&pool, id, role).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::PermissionChange,
            resource_type: "user",
            resource_id: Some(id.to_string()),
            before: serde_json::to_value(&before).ok(),
            after: serde_json::to_value(&updated).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(updated))
}

pub async fn delete_user(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    if auth.role != Role::Admin {
        return Err(AppError::Forbidden);
    }
    let before = get(&pool, id).await?;
    delete(&pool, id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Delete,
            resource_type: "user",
            resource_id: Some(id.to_string()),
            before: serde_json::to_value(&before).ok(),
            after: None,
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_regex_accepts_and_rejects() {
        assert!(EMAIL_RE.is_match("ops@example.com"));
        assert!(!EMAIL_RE.is_match("not-an-email"));
        assert!(!EMAIL_RE.is_match("missing@domain"));
    }
}
