//! DeploymentTemplate + wizard submission validation (§4.10). Grounded on the
//! teacher's `organizations.rs` CRUD shape; the wizard's multi-step flow is
//! client-driven, so this module only validates the final submission.

use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use sha2::Digest;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::instances::{self, Instance, InstanceStatus, RegisterInstance, NAME_RE, SUPPORTED_PROVIDERS};
use crate::rbac::{self, perm};

#[derive(Debug, Serialize)]
pub struct DeploymentTemplate {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub category: String,
    pub description: Option<String>,
    pub extensions: Vec<String>,
    pub provider_recommendations: Vec<String>,
    pub yaml_content: String,
    pub is_official: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

fn row_to_template(row: &sqlx::postgres::PgRow) -> DeploymentTemplate {
    DeploymentTemplate {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        category: row.get("category"),
        description: row.try_get("description").ok(),
        extensions: row
            .get::<sqlx::types::Json<Vec<String>>, _>("extensions")
            .0,
        provider_recommendations: row
            .get::<sqlx::types::Json<Vec<String>>, _>("provider_recommendations")
            .0,
        yaml_content: row.get("yaml_content"),
        is_official: row.get("is_official"),
        created_by: row.try_get("created_by").ok(),
        created_at: row.get("created_at"),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    pub slug: String,
    pub category: String,
    pub description: Option<String>,
    pub extensions: Vec<String>,
    pub provider_recommendations: Vec<String>,
    pub yaml_content: String,
    pub is_official: bool,
}

pub async fn create(
    pool: &PgPool,
    req: CreateTemplate,
    created_by: Uuid,
) -> Result<DeploymentTemplate, AppError> {
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO deployment_templates
            (id, name, slug, category, description, extensions, provider_recommendations,
             yaml_content, is_official, created_by, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&req.name)
    .bind(&req.slug)
    .bind(&req.category)
    .bind(&req.description)
    .bind(sqlx::types::Json(&req.extensions))
    .bind(sqlx::types::Json(&req.provider_recommendations))
    .bind(&req.yaml_content)
    .bind(req.is_official)
    .bind(created_by)
    .fetch_one(pool)
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.constraint().is_some() => {
            AppError::Conflict("slug already in use".to_string())
        }
        _ => AppError::Db(e),
    })?;
    Ok(row_to_template(&row))
}

pub async fn list(pool: &PgPool) -> Result<Vec<DeploymentTemplate>, AppError> {
    let rows = sqlx::query("SELECT * FROM deployment_templates ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(rows.iter().map(row_to_template).collect())
}

/// Accepts either the UUID or the slug, matching §6's `/:idOrSlug` route shape.
pub async fn get_by_id_or_slug(pool: &PgPool, id_or_slug: &str) -> Result<DeploymentTemplate, AppError> {
    let row = if let Ok(id) = Uuid::parse_str(id_or_slug) {
        sqlx::query("SELECT * FROM deployment_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    } else {
        sqlx::query("SELECT * FROM deployment_templates WHERE slug = $1")
            .bind(id_or_slug)
            .fetch_optional(pool)
            .await
    }
    .map_err(AppError::Db)?
    .ok_or(AppError::NotFound)?;
    Ok(row_to_template(&row))
}

pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM deployment_templates WHERE id = $1")
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
pub struct WizardSubmission {
    pub template_id: Option<Uuid>,
    pub name: String,
    pub provider: String,
    pub region: Option<String>,
    pub extensions: Vec<String>,
    pub yaml_content: String,
}

/// Validates a wizard submission per §4.10: name shape, supported provider,
/// provider membership in the chosen template's recommendations, extension
/// count ceiling, and a minimally well-formed YAML body naming `name`.
pub async fn validate_submission(
    pool: &PgPool,
    submission: &WizardSubmission,
) -> Result<(), AppError> {
    let mut details = Vec::new();

    if !NAME_RE.is_match(&submission.name) {
        details.push("name must match ^[a-z0-9][a-z0-9-]*$".to_string());
    }
    if !SUPPORTED_PROVIDERS.contains(&submission.provider.as_str()) {
        details.push(format!("unsupported provider: {}", submission.provider));
    }
    if submission.extensions.len() > 200 {
        details.push("extensions list exceeds 200 entries".to_string());
    }

    if let Some(template_id) = submission.template_id {
        let template = get_by_id_or_slug(pool, &template_id.to_string()).await?;
        if !template
            .provider_recommendations
            .iter()
            .any(|p| p == &submission.provider)
        {
            details.push(format!(
                "provider {} is not recommended by template {}",
                submission.provider, template.slug
            ));
        }
    }

    match serde_yaml::from_str::<YamlValue>(&submission.yaml_content) {
        Ok(YamlValue::Mapping(map)) => {
            if !map
                .iter()
                .any(|(k, _)| k.as_str() == Some("name"))
            {
                details.push("yaml_content must declare a `name` field".to_string());
            }
        }
        _ => details.push("yaml_content must be a YAML mapping declaring `name`".to_string()),
    }

    if !details.is_empty() {
        return Err(AppError::Validation { details });
    }
    Ok(())
}

/// Used by `InstanceStatus::DEPLOYING` bookkeeping after a wizard submission is
/// accepted and registration proceeds per §4.10's "follows registration" rule.
pub fn initial_status_for_wizard() -> InstanceStatus {
    InstanceStatus::Deploying
}

pub async fn list_templates_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<DeploymentTemplate>>> {
    Ok(Json(list(&pool).await?))
}

pub async fn get_template_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(id_or_slug): Path<String>,
) -> AppResult<Json<DeploymentTemplate>> {
    Ok(Json(get_by_id_or_slug(&pool, &id_or_slug).await?))
}

pub async fn create_template_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<CreateTemplate>,
) -> AppResult<Json<DeploymentTemplate>> {
    if !rbac::can_perform(auth.role, perm::TEMPLATES_WRITE) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(create(&pool, req, auth.user_id).await?))
}

pub async fn delete_template_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    if !rbac::can_perform(auth.role, perm::TEMPLATES_WRITE) {
        return Err(AppError::Forbidden);
    }
    delete(&pool, id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Submits a wizard flow: validates, then registers the instance using a
/// config_hash derived from the submitted YAML body (§4.10).
pub async fn submit_wizard_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(submission): Json<WizardSubmission>,
) -> AppResult<Json<Instance>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_DEPLOY) {
        return Err(AppError::Forbidden);
    }
    validate_submission(&pool, &submission).await?;
    let config_hash = hex::encode(sha2::Sha256::digest(submission.yaml_content.as_bytes()));
    let instance = instances::register(
        &pool,
        RegisterInstance {
            name: submission.name,
            provider: submission.provider,
            region: submission.region,
            team_id: None,
            extensions: submission.extensions,
            config_hash,
            ssh_endpoint: None,
        },
    )
    .await?;
    Ok(Json(instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_name_mismatch_and_bad_yaml() {
        let submission = WizardSubmission {
            template_id: None,
            name: "Bad_Name".to_string(),
            provider: "fly".to_string(),
            region: None,
            extensions: vec![],
            yaml_content: "- just\n- a\n- list\n".to_string(),
        };
        assert!(!NAME_RE.is_match(&submission.name));
        let parsed: Result<YamlValue, _> = serde_yaml::from_str(&submission.yaml_content);
        assert!(matches!(parsed, Ok(YamlValue::Sequence(_))));
    }
}
