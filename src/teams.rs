//! Team / TeamMember (§3). Grounded on the teacher's `organizations.rs` CRUD and
//! membership shape, simplified to drop the invitation workflow (not named by the
//! spec and not needed for team-scoped instance visibility).

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

static SLUG_RE: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap());

#[derive(Debug, Serialize)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_team(row: &sqlx::postgres::PgRow) -> Team {
    Team {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        description: row.try_get("description").ok(),
        created_at: row.get("created_at"),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTeam {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
}

pub async fn create(pool: &PgPool, req: CreateTeam) -> Result<Team, AppError> {
    if !SLUG_RE.is_match(&req.slug) {
        return Err(AppError::Validation {
            details: vec!["slug must match ^[a-z0-9][a-z0-9-]*$".to_string()],
        });
    }
    let id = Uuid::new_v4();
    let row = sqlx::query(
        "INSERT INTO teams (id, name, slug, description, created_at) VALUES ($1,$2,$3,$4,NOW()) RETURNING *",
    )
    .bind(id)
    .bind(&req.name)
    .bind(&req.slug)
    .bind(&req.description)
    .fetch_one(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
            AppError::Conflict("slug already in use".to_string())
        }
        _ => AppError::Db(e),
    })?;
    Ok(row_to_team(&row))
}

pub async fn list(pool: &PgPool) -> Result<Vec<Team>, AppError> {
    let rows = sqlx::query("SELECT * FROM teams ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(rows.iter().map(row_to_team).collect())
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Team, AppError> {
    let row = sqlx::query("SELECT * FROM teams WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    Ok(row_to_team(&row))
}

#[derive(Debug, Serialize)]
pub struct TeamMember {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

/// Adds `user_id` to `team_id` with `role`; a user may belong to multiple teams with
/// different roles (§3).
pub async fn add_member(pool: &PgPool, team_id: Uuid, user_id: Uuid, role: Role) -> Result<TeamMember, AppError> {
    let row = sqlx::query(
        r#"
        INSERT INTO team_members (team_id, user_id, role, joined_at)
        VALUES ($1,$2,$3,NOW())
        ON CONFLICT (team_id, user_id) DO UPDATE SET role = EXCLUDED.role
        RETURNING team_id, user_id, role, joined_at
        "#,
    )
    .bind(team_id)
    .bind(user_id)
    .bind(role.as_str())
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(TeamMember {
        team_id: row.get("team_id"),
        user_id: row.get("user_id"),
        role: row.get("role"),
        joined_at: row.get("joined_at"),
    })
}

/// Cascade-consistent remove: a TeamMember cannot exist without both referents (§3).
pub async fn remove_member(pool: &PgPool, team_id: Uuid, user_id: Uuid) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM team_members WHERE team_id = $1 AND user_id = $2")
        .bind(team_id)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

pub async fn members(pool: &PgPool, team_id: Uuid) -> Result<Vec<TeamMember>, AppError> {
    let rows = sqlx::query("SELECT * FROM team_members WHERE team_id = $1")
        .bind(team_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(rows
        .into_iter()
        .map(|r| TeamMember {
            team_id: r.get("team_id"),
            user_id: r.get("user_id"),
            role: r.get("role"),
            joined_at: r.get("joined_at"),
        })
        .collect())
}

pub async fn list_teams(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
) -> AppResult<Json<Vec<Team>>> {
    if !rbac::can_perform(auth.role, perm::TEAMS_READ) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(list(&pool).await?))
}

pub async fn get_team(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Team>> {
    if !rbac::can_perform(auth.role, perm::TEAMS_READ) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(get(&pool, id).await?))
}

pub async fn create_team(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<CreateTeam>,
) -> AppResult<Json<Team>> {
    if !rbac::can_perform(auth.role, perm::TEAMS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let team = create(&pool, req).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "team",
            resource_id: Some(team.id.to_string()),
            before: None,
            after: serde_json::to_value(&team).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(team))
}

pub async fn list_members(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(team_id): Path<Uuid>,
) -> AppResult<Json<Vec<TeamMember>>> {
    if !rbac::can_perform(auth.role, perm::TEAMS_READ) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(members(&pool, team_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    pub role: String,
}

pub async fn add_member_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(team_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> AppResult<Json<TeamMember>> {
    if !rbac::can_perform(auth.role, perm::TEAMS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let role: Role = req.role.parse()?;
    let member = add_member(&pool, team_id, req.user_id, role).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::TeamAdd,
            resource_type: "team_member",
            resource_id: Some(format!("{team_id}:{}", req.user_id)),
            before: None,
            after: serde_json::to_value(&member).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(member))
}

pub async fn remove_member_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path((team_id, user_id)): Path<(Uuid, Uuid)>,
) -> AppResult<axum::http::StatusCode> {
    if !rbac::can_perform(auth.role, perm::TEAMS_WRITE) {
        return Err(AppError::Forbidden);
    }
    remove_member(&pool, team_id, user_id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::TeamRemove,
            resource_type: "team_member",
            resource_id: Some(format!("{team_id}:{user_id}")),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_regex_matches_spec() {
        assert!(SLUG_RE.is_match("platform-team"));
        assert!(!SLUG_RE.is_match("Platform-Team"));
        assert!(!SLUG_RE.is_match("-team"));
    }
}
