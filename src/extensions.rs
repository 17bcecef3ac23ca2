//! Extension catalog and per-instance installations (§3, §4). Grounded on the teacher's
//! `marketplace.rs` catalog-listing shape, with the install-eligibility invariant enforced
//! against the target instance's `extensions` column the way `instances::transition`
//! enforces its status table.

use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::audit::{self, AuditAction, RecordAudit};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::rbac::{self, perm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtensionStatus {
    Pending,
    Approved,
    Rejected,
    Deprecated,
}

impl ExtensionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionStatus::Pending => "PENDING",
            ExtensionStatus::Approved => "APPROVED",
            ExtensionStatus::Rejected => "REJECTED",
            ExtensionStatus::Deprecated => "DEPRECATED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "PENDING" => Ok(ExtensionStatus::Pending),
            "APPROVED" => Ok(ExtensionStatus::Approved),
            "REJECTED" => Ok(ExtensionStatus::Rejected),
            "DEPRECATED" => Ok(ExtensionStatus::Deprecated),
            other => Err(AppError::BadRequest(format!("unknown extension status: {other}"))),
        }
    }

    /// PENDING settles into APPROVED or REJECTED; APPROVED retires into DEPRECATED.
    /// Neither REJECTED nor DEPRECATED re-opens.
    pub fn can_transition_to(&self, target: ExtensionStatus) -> bool {
        matches!(
            (self, target),
            (ExtensionStatus::Pending, ExtensionStatus::Approved)
                | (ExtensionStatus::Pending, ExtensionStatus::Rejected)
                | (ExtensionStatus::Approved, ExtensionStatus::Deprecated)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub status: ExtensionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_extension(row: &sqlx::postgres::PgRow) -> Result<ExtensionRecord, AppError> {
    Ok(ExtensionRecord {
        id: row.get("id"),
        slug: row.get("slug"),
        name: row.get("name"),
        description: row.try_get("description").ok(),
        status: ExtensionStatus::parse(row.get::<String, _>("status").as_str())?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionVersionRecord {
    pub id: Uuid,
    pub extension_id: Uuid,
    pub version: String,
    pub manifest: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn row_to_version(row: &sqlx::postgres::PgRow) -> ExtensionVersionRecord {
    ExtensionVersionRecord {
        id: row.get("id"),
        extension_id: row.get("extension_id"),
        version: row.get("version"),
        manifest: row.try_get("manifest").unwrap_or(serde_json::json!({})),
        created_at: row.get("created_at"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInstallationRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub extension_id: Uuid,
    pub slug: String,
    pub version: String,
    pub installed_by: Option<Uuid>,
    pub installed_at: DateTime<Utc>,
}

fn row_to_installation(row: &sqlx::postgres::PgRow) -> ExtensionInstallationRecord {
    ExtensionInstallationRecord {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        extension_id: row.get("extension_id"),
        slug: row.get("slug"),
        version: row.get("version"),
        installed_by: row.try_get("installed_by").ok(),
        installed_at: row.get("installed_at"),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CatalogFilter {
    pub status: Option<String>,
    pub q: Option<String>,
}

pub async fn list_catalog(
    pool: &PgPool,
    filter: &CatalogFilter,
) -> Result<Vec<ExtensionRecord>, AppError> {
    let pattern = filter
        .q
        .as_ref()
        .filter(|q| !q.trim().is_empty())
        .map(|q| format!("%{}%", q.trim()));

    let rows = sqlx::query(
        r#"
        SELECT id, slug, name, description, status, created_at, updated_at
        FROM extensions
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::text IS NULL OR slug ILIKE $2 OR name ILIKE $2)
        ORDER BY name
        "#,
    )
    .bind(filter.status.as_deref())
    .bind(pattern.as_deref())
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;

    rows.iter().map(row_to_extension).collect()
}

pub async fn get_extension(pool: &PgPool, id: Uuid) -> Result<ExtensionRecord, AppError> {
    let row = sqlx::query("SELECT id, slug, name, description, status, created_at, updated_at FROM extensions WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    row_to_extension(&row)
}

async fn get_extension_by_slug(pool: &PgPool, slug: &str) -> Result<ExtensionRecord, AppError> {
    let row = sqlx::query("SELECT id, slug, name, description, status, created_at, updated_at FROM extensions WHERE slug = $1")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    row_to_extension(&row)
}

#[derive(Debug, Deserialize)]
pub struct SubmitExtension {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
}

/// New submissions always land PENDING; only `set_status` moves them onward.
pub async fn submit(pool: &PgPool, req: SubmitExtension) -> Result<ExtensionRecord, AppError> {
    if req.slug.trim().is_empty() || req.name.trim().is_empty() {
        return Err(AppError::BadRequest("slug and name are required".into()));
    }
    let row = sqlx::query(
        r#"
        INSERT INTO extensions (id, slug, name, description, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'PENDING', NOW(), NOW())
        RETURNING id, slug, name, description, status, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(req.slug.trim())
    .bind(req.name.trim())
    .bind(req.description.as_deref())
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    row_to_extension(&row)
}

pub async fn set_status(
    pool: &PgPool,
    id: Uuid,
    target: ExtensionStatus,
) -> Result<ExtensionRecord, AppError> {
    let current = get_extension(pool, id).await?;
    if !current.status.can_transition_to(target) {
        return Err(AppError::InvalidState(format!(
            "cannot transition extension from {:?} to {:?}",
            current.status, target
        )));
    }
    let row = sqlx::query(
        "UPDATE extensions SET status = $2, updated_at = NOW() WHERE id = $1 \
         RETURNING id, slug, name, description, status, created_at, updated_at",
    )
    .bind(id)
    .bind(target.as_str())
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    row_to_extension(&row)
}

#[derive(Debug, Deserialize)]
pub struct PublishVersion {
    pub version: String,
    pub manifest: Option<serde_json::Value>,
}

pub async fn publish_version(
    pool: &PgPool,
    extension_id: Uuid,
    req: PublishVersion,
) -> Result<ExtensionVersionRecord, AppError> {
    get_extension(pool, extension_id).await?;
    let manifest = req.manifest.unwrap_or_else(|| serde_json::json!({}));
    let row = sqlx::query(
        r#"
        INSERT INTO extension_versions (id, extension_id, version, manifest, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        RETURNING id, extension_id, version, manifest, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(extension_id)
    .bind(req.version.trim())
    .bind(manifest)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(row_to_version(&row))
}

pub async fn list_versions(
    pool: &PgPool,
    extension_id: Uuid,
) -> Result<Vec<ExtensionVersionRecord>, AppError> {
    let rows = sqlx::query(
        "SELECT id, extension_id, version, manifest, created_at FROM extension_versions \
         WHERE extension_id = $1 ORDER BY created_at DESC",
    )
    .bind(extension_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(rows.iter().map(row_to_version).collect())
}

pub async fn list_installations(
    pool: &PgPool,
    instance_id: Uuid,
) -> Result<Vec<ExtensionInstallationRecord>, AppError> {
    let rows = sqlx::query(
        "SELECT id, instance_id, extension_id, slug, version, installed_by, installed_at \
         FROM extension_installations WHERE instance_id = $1 ORDER BY installed_at DESC",
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(rows.iter().map(row_to_installation).collect())
}

/// Installs `slug` onto `instance_id`. Refuses REJECTED or PENDING extensions; a
/// DEPRECATED extension is only installable if it already has an installation row
/// on this instance from before it was deprecated (reinstall-after-uninstall is not
/// that case, so it is refused too).
pub async fn install(
    pool: &PgPool,
    instance_id: Uuid,
    slug: &str,
    version: &str,
    installed_by: Option<Uuid>,
) -> Result<ExtensionInstallationRecord, AppError> {
    let extension = get_extension_by_slug(pool, slug).await?;

    let already_installed = sqlx::query(
        "SELECT 1 FROM extension_installations WHERE instance_id = $1 AND extension_id = $2",
    )
    .bind(instance_id)
    .bind(extension.id)
    .fetch_optional(pool)
    .await
    .map_err(AppError::Db)?
    .is_some();

    let eligible = match extension.status {
        ExtensionStatus::Approved => true,
        ExtensionStatus::Deprecated => already_installed,
        ExtensionStatus::Pending | ExtensionStatus::Rejected => false,
    };
    if !eligible {
        return Err(AppError::Conflict(format!(
            "extension {slug} is not eligible for install ({:?})",
            extension.status
        )));
    }

    let row = sqlx::query(
        r#"
        INSERT INTO extension_installations (id, instance_id, extension_id, slug, version, installed_by, installed_at)
        VALUES ($1, $2, $3, $4, $5, $6, NOW())
        ON CONFLICT (instance_id, extension_id) DO UPDATE SET version = EXCLUDED.version, installed_at = NOW()
        RETURNING id, instance_id, extension_id, slug, version, installed_by, installed_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(instance_id)
    .bind(extension.id)
    .bind(slug)
    .bind(version)
    .bind(installed_by)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;

    sqlx::query(
        "UPDATE instances SET extensions = array_append(array_remove(extensions, $2), $2), updated_at = NOW() WHERE id = $1",
    )
    .bind(instance_id)
    .bind(slug)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    Ok(row_to_installation(&row))
}

pub async fn uninstall(pool: &PgPool, instance_id: Uuid, slug: &str) -> Result<(), AppError> {
    let extension = get_extension_by_slug(pool, slug).await?;
    sqlx::query("DELETE FROM extension_installations WHERE instance_id = $1 AND extension_id = $2")
        .bind(instance_id)
        .bind(extension.id)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    sqlx::query("UPDATE instances SET extensions = array_remove(extensions, $2), updated_at = NOW() WHERE id = $1")
        .bind(instance_id)
        .bind(slug)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(())
}

// --- HTTP handlers ---

pub async fn list_catalog_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Query(filter): Query<CatalogFilter>,
) -> AppResult<Json<Vec<ExtensionRecord>>> {
    Ok(Json(list_catalog(&pool, &filter).await?))
}

pub async fn get_extension_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ExtensionRecord>> {
    Ok(Json(get_extension(&pool, id).await?))
}

pub async fn submit_extension_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<SubmitExtension>,
) -> AppResult<Json<ExtensionRecord>> {
    if !rbac::can_perform(auth.role, perm::EXTENSIONS_INSTALL) {
        return Err(AppError::Forbidden);
    }
    let extension = submit(&pool, req).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "extension",
            resource_id: Some(extension.id.to_string()),
            before: None,
            after: serde_json::to_value(&extension).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(extension))
}

#[derive(Debug, Deserialize)]
pub struct SetExtensionStatusRequest {
    pub status: String,
}

async fn set_status_handler_inner(
    pool: &PgPool,
    auth: &AuthUser,
    id: Uuid,
    required_perm: &'static str,
    target: ExtensionStatus,
) -> AppResult<Json<ExtensionRecord>> {
    if !rbac::can_perform(auth.role, required_perm) {
        return Err(AppError::Forbidden);
    }
    let extension = set_status(pool, id, target).await?;
    audit::record(
        pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Update,
            resource_type: "extension",
            resource_id: Some(id.to_string()),
            before: None,
            after: serde_json::to_value(&extension).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(extension))
}

pub async fn set_extension_status_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SetExtensionStatusRequest>,
) -> AppResult<Json<ExtensionRecord>> {
    let target = ExtensionStatus::parse(&req.status)?;
    let required_perm = match target {
        ExtensionStatus::Approved => perm::EXTENSIONS_INSTALL,
        _ => perm::EXTENSIONS_REMOVE,
    };
    set_status_handler_inner(&pool, &auth, id, required_perm, target).await
}

pub async fn publish_version_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<PublishVersion>,
) -> AppResult<Json<ExtensionVersionRecord>> {
    if !rbac::can_perform(auth.role, perm::EXTENSIONS_INSTALL) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(publish_version(&pool, id, req).await?))
}

pub async fn list_versions_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<ExtensionVersionRecord>>> {
    Ok(Json(list_versions(&pool, id).await?))
}

pub async fn list_instance_extensions_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(instance_id): Path<Uuid>,
) -> AppResult<Json<Vec<ExtensionInstallationRecord>>> {
    Ok(Json(list_installations(&pool, instance_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct InstallRequest {
    pub slug: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "latest".to_string()
}

pub async fn install_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(instance_id): Path<Uuid>,
    Json(req): Json<InstallRequest>,
) -> AppResult<Json<ExtensionInstallationRecord>> {
    if !rbac::can_perform(auth.role, perm::EXTENSIONS_INSTALL) {
        return Err(AppError::Forbidden);
    }
    let installation = install(&pool, instance_id, &req.slug, &req.version, Some(auth.user_id)).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "extension_installation",
            resource_id: Some(installation.id.to_string()),
            before: None,
            after: serde_json::to_value(&installation).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(installation))
}

pub async fn uninstall_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path((instance_id, slug)): Path<(Uuid, String)>,
) -> AppResult<axum::http::StatusCode> {
    if !rbac::can_perform(auth.role, perm::EXTENSIONS_REMOVE) {
        return Err(AppError::Forbidden);
    }
    uninstall(&pool, instance_id, &slug).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Delete,
            resource_type: "extension_installation",
            resource_id: Some(format!("{instance_id}:{slug}")),
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
    fn pending_settles_approved_or_rejected() {
        assert!(ExtensionStatus::Pending.can_transition_to(ExtensionStatus::Approved));
        assert!(ExtensionStatus::Pending.can_transition_to(ExtensionStatus::Rejected));
        assert!(!ExtensionStatus::Pending.can_transition_to(ExtensionStatus::Deprecated));
    }

    #[test]
    fn approved_only_deprecates() {
        assert!(ExtensionStatus::Approved.can_transition_to(ExtensionStatus::Deprecated));
        assert!(!ExtensionStatus::Approved.can_transition_to(ExtensionStatus::Pending));
        assert!(!ExtensionStatus::Approved.can_transition_to(ExtensionStatus::Rejected));
    }

    #[test]
    fn terminal_states_never_transition() {
        assert!(!ExtensionStatus::Rejected.can_transition_to(ExtensionStatus::Approved));
        assert!(!ExtensionStatus::Deprecated.can_transition_to(ExtensionStatus::Approved));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            ExtensionStatus::Pending,
            ExtensionStatus::Approved,
            ExtensionStatus::Rejected,
            ExtensionStatus::Deprecated,
        ] {
            assert_eq!(ExtensionStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
