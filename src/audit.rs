//! Immutable audit log (§4.8). Every gated action writes one `AuditEntry`; entries are
//! append-only, queried with a dynamic filter builder the same way the teacher's
//! provider-key audit log does.

use axum::extract::{Extension, Query};
use axum::Json;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::rbac::{self, perm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Login,
    Logout,
    Deploy,
    Destroy,
    Suspend,
    Resume,
    Execute,
    Connect,
    Disconnect,
    PermissionChange,
    TeamAdd,
    TeamRemove,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Login => "LOGIN",
            AuditAction::Logout => "LOGOUT",
            AuditAction::Deploy => "DEPLOY",
            AuditAction::Destroy => "DESTROY",
            AuditAction::Suspend => "SUSPEND",
            AuditAction::Resume => "RESUME",
            AuditAction::Execute => "EXECUTE",
            AuditAction::Connect => "CONNECT",
            AuditAction::Disconnect => "DISCONNECT",
            AuditAction::PermissionChange => "PERMISSION_CHANGE",
            AuditAction::TeamAdd => "TEAM_ADD",
            AuditAction::TeamRemove => "TEAM_REMOVE",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_user_id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub outcome: String,
    pub ip: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct RecordAudit<'a> {
    pub actor_user_id: Uuid,
    pub action: AuditAction,
    pub resource_type: &'a str,
    pub resource_id: Option<String>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub outcome: &'a str,
    pub ip: Option<String>,
}

/// Writes one immutable audit entry. Called after every gated mutation, and on
/// denials (outcome="denied") per §8 scenario 5.
pub async fn record(pool: &PgPool, entry: RecordAudit<'_>) -> Result<Uuid, sqlx::Error> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO audit_entries
            (id, actor_user_id, action, resource_type, resource_id, before, after, outcome, ip, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9, NOW())
        "#,
    )
    .bind(id)
    .bind(entry.actor_user_id)
    .bind(entry.action.as_str())
    .bind(entry.resource_type)
    .bind(entry.resource_id)
    .bind(entry.before)
    .bind(entry.after)
    .bind(entry.outcome)
    .bind(entry.ip)
    .execute(pool)
    .await?;
    Ok(id)
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditFilter {
    pub actor_user_id: Option<Uuid>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
}

/// Dynamic filtered query over the audit log, built the way the teacher's
/// `query_provider_key_events` composes a `QueryBuilder`.
pub async fn query(
    pool: &PgPool,
    filter: &AuditFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<AuditEntry>, sqlx::Error> {
    let mut qb = QueryBuilder::new(
        "SELECT id, actor_user_id, action, resource_type, resource_id, before, after, outcome, ip, created_at \
         FROM audit_entries WHERE 1=1",
    );
    if let Some(actor) = filter.actor_user_id {
        qb.push(" AND actor_user_id = ").push_bind(actor);
    }
    if let Some(action) = &filter.action {
        qb.push(" AND action = ").push_bind(action.clone());
    }
    if let Some(resource_type) = &filter.resource_type {
        qb.push(" AND resource_type = ").push_bind(resource_type.clone());
    }
    if let Some(resource_id) = &filter.resource_id {
        qb.push(" AND resource_id = ").push_bind(resource_id.clone());
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
    qb.push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|r| AuditEntry {
            id: r.get("id"),
            actor_user_id: r.get("actor_user_id"),
            action: r.get("action"),
            resource_type: r.get("resource_type"),
            resource_id: r.try_get("resource_id").ok(),
            before: r.try_get("before").ok(),
            after: r.try_get("after").ok(),
            outcome: r.get("outcome"),
            ip: r.try_get("ip").ok(),
            created_at: r.get("created_at"),
        })
        .collect())
}

#[derive(Debug, Deserialize)]
pub struct AuditQueryParams {
    #[serde(flatten)]
    pub filter: AuditFilter,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn query_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Query(params): Query<AuditQueryParams>,
) -> AppResult<Json<Vec<AuditEntry>>> {
    if !rbac::can_perform(auth.role, perm::AUDIT_READ) {
        return Err(AppError::Forbidden);
    }
    let entries = query(
        &pool,
        &params.filter,
        params.limit.unwrap_or(100).clamp(1, 1000),
        params.offset.unwrap_or(0).max(0),
    )
    .await
    .map_err(AppError::Db)?;
    Ok(Json(entries))
}
