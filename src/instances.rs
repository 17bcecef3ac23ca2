//! Instance entity, status state machine, registration/lifecycle (§3, §4.10), and the
//! fleet view / instance dashboard (§4.5). Grounded on the teacher's `servers.rs`
//! CRUD+lifecycle shape.

use axum::{
    extract::{Extension, Path, Query},
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
use crate::ingestion::{self, Heartbeat};
use crate::protocol::Envelope;
use crate::rbac::{self, perm};
use crate::session;

pub static NAME_RE: once_cell::sync::Lazy<Regex> =
    once_cell::sync::Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Deploying,
    Running,
    Suspended,
    Stopped,
    Destroying,
    Error,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Deploying => "DEPLOYING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Suspended => "SUSPENDED",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Destroying => "DESTROYING",
            InstanceStatus::Error => "ERROR",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "DEPLOYING" => Ok(InstanceStatus::Deploying),
            "RUNNING" => Ok(InstanceStatus::Running),
            "SUSPENDED" => Ok(InstanceStatus::Suspended),
            "STOPPED" => Ok(InstanceStatus::Stopped),
            "DESTROYING" => Ok(InstanceStatus::Destroying),
            "ERROR" => Ok(InstanceStatus::Error),
            "UNKNOWN" => Ok(InstanceStatus::Unknown),
            other => Err(AppError::Validation {
                details: vec![format!("unknown status '{other}'")],
            }),
        }
    }

    /// The fixed transition table in §3. Any pair not listed here is illegal.
    pub fn can_transition_to(&self, target: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, target),
            (Deploying, Running)
                | (Deploying, Error)
                | (Running, Suspended)
                | (Running, Stopped)
                | (Running, Destroying)
                | (Running, Error)
                | (Suspended, Running)
                | (Suspended, Destroying)
                | (Stopped, Running)
                | (Stopped, Destroying)
                | (Error, Running)
                | (Error, Stopped)
                | (Error, Destroying)
                | (Destroying, Unknown)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    pub region: Option<String>,
    pub team_id: Option<Uuid>,
    pub extensions: Vec<String>,
    pub config_hash: String,
    pub ssh_endpoint: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn row_to_instance(row: &sqlx::postgres::PgRow) -> Instance {
    Instance {
        id: row.get("id"),
        name: row.get("name"),
        provider: row.get("provider"),
        region: row.try_get("region").ok(),
        team_id: row.try_get("team_id").ok(),
        extensions: row.try_get("extensions").unwrap_or_default(),
        config_hash: row.get("config_hash"),
        ssh_endpoint: row.try_get("ssh_endpoint").ok(),
        status: row.get("status"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub const SUPPORTED_PROVIDERS: &[&str] = &["fly", "docker", "devpod", "e2b", "kubernetes"];

#[derive(Debug, Deserialize)]
pub struct RegisterInstance {
    pub name: String,
    pub provider: String,
    pub region: Option<String>,
    pub team_id: Option<Uuid>,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub config_hash: String,
    pub ssh_endpoint: Option<String>,
}

fn validate_registration(req: &RegisterInstance) -> Result<(), AppError> {
    let mut details = Vec::new();
    if !NAME_RE.is_match(&req.name) {
        details.push("name must match ^[a-z0-9][a-z0-9-]*$".to_string());
    }
    if !SUPPORTED_PROVIDERS.contains(&req.provider.as_str()) {
        details.push(format!("unsupported provider '{}'", req.provider));
    }
    if req.extensions.len() > 200 {
        details.push("extensions must have at most 200 entries".to_string());
    }
    let hash_re = Regex::new(r"^[0-9a-f]{64}$").unwrap();
    if !hash_re.is_match(&req.config_hash) {
        details.push("config_hash must be 64 lowercase hex characters".to_string());
    }
    if !details.is_empty() {
        return Err(AppError::Validation { details });
    }
    Ok(())
}

/// Registration is an upsert on `(name)` (§4.10): a matching name updates the row in
/// place; a conflicting provider/region on an existing name returns `Conflict`.
pub async fn register(pool: &PgPool, req: RegisterInstance) -> Result<Instance, AppError> {
    validate_registration(&req)?;

    let existing = sqlx::query("SELECT * FROM instances WHERE name = $1")
        .bind(&req.name)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?;

    if let Some(row) = existing {
        let existing = row_to_instance(&row);
        if existing.provider != req.provider || existing.region != req.region {
            return Err(AppError::Conflict(format!(
                "instance '{}' already registered with a different provider/region",
                req.name
            )));
        }
        let row = sqlx::query(
            r#"
            UPDATE instances SET
                extensions = $2, config_hash = $3, ssh_endpoint = $4, team_id = $5, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(existing.id)
        .bind(&req.extensions)
        .bind(&req.config_hash)
        .bind(&req.ssh_endpoint)
        .bind(req.team_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Db)?;
        return Ok(row_to_instance(&row));
    }

    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO instances
            (id, name, provider, region, team_id, extensions, config_hash, ssh_endpoint, status, created_at, updated_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,'DEPLOYING',NOW(),NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&req.name)
    .bind(&req.provider)
    .bind(&req.region)
    .bind(req.team_id)
    .bind(&req.extensions)
    .bind(&req.config_hash)
    .bind(&req.ssh_endpoint)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(row_to_instance(&row))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListFilter {
    pub provider: Option<String>,
    pub status: Option<String>,
    pub region: Option<String>,
    pub search: Option<String>,
    pub team_ids: Option<Vec<Uuid>>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

pub struct Page<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub total: i64,
}

pub async fn list(pool: &PgPool, filter: &ListFilter) -> Result<Page<Instance>, AppError> {
    let page = filter.page.unwrap_or(1).max(1);
    let page_size = filter.page_size.unwrap_or(20).clamp(1, 100);

    let mut qb = sqlx::QueryBuilder::new("SELECT * FROM instances WHERE 1=1");
    apply_filters(&mut qb, filter);
    qb.push(" ORDER BY name ASC LIMIT ")
        .push_bind(page_size)
        .push(" OFFSET ")
        .push_bind((page - 1) * page_size);
    let rows = qb.build().fetch_all(pool).await.map_err(AppError::Db)?;

    let mut count_qb = sqlx::QueryBuilder::new("SELECT COUNT(*) as total FROM instances WHERE 1=1");
    apply_filters(&mut count_qb, filter);
    let total: i64 = count_qb
        .build()
        .fetch_one(pool)
        .await
        .map_err(AppError::Db)?
        .get("total");

    Ok(Page {
        items: rows.iter().map(row_to_instance).collect(),
        page,
        page_size,
        total,
    })
}

fn apply_filters(qb: &mut sqlx::QueryBuilder<sqlx::Postgres>, filter: &ListFilter) {
    if let Some(provider) = &filter.provider {
        qb.push(" AND provider = ").push_bind(provider.clone());
    }
    if let Some(status) = &filter.status {
        qb.push(" AND status = ").push_bind(status.clone());
    }
    if let Some(region) = &filter.region {
        qb.push(" AND region = ").push_bind(region.clone());
    }
    if let Some(search) = &filter.search {
        qb.push(" AND name ILIKE ").push_bind(format!("%{search}%"));
    }
    if let Some(team_ids) = &filter.team_ids {
        qb.push(" AND team_id = ANY(").push_bind(team_ids.clone()).push(")");
    }
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Instance, AppError> {
    let row = sqlx::query("SELECT * FROM instances WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    Ok(row_to_instance(&row))
}

pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM instances WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

/// Applies a status transition, enforcing the §3 table transactionally. Mutates
/// nothing on an illegal transition (§8 invariant 2).
pub async fn transition(pool: &PgPool, id: Uuid, target: InstanceStatus) -> Result<Instance, AppError> {
    let mut tx = pool.begin().await.map_err(AppError::Db)?;
    let row = sqlx::query("SELECT * FROM instances WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    let current = InstanceStatus::parse(&row.get::<String, _>("status"))?;
    if !current.can_transition_to(target) {
        return Err(AppError::InvalidState(format!(
            "{} -> {} is not permitted",
            current.as_str(),
            target.as_str()
        )));
    }
    let updated = sqlx::query("UPDATE instances SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(target.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Db)?;
    tx.commit().await.map_err(AppError::Db)?;
    Ok(row_to_instance(&updated))
}

/// Redeploy moves the instance through DEPLOYING regardless of its current state
/// (§4.10) — an administrative override of the normal transition table, since
/// every other state but DESTROYING accepts a redeploy request.
pub async fn redeploy(pool: &PgPool, id: Uuid) -> Result<Instance, AppError> {
    let mut tx = pool.begin().await.map_err(AppError::Db)?;
    let row = sqlx::query("SELECT * FROM instances WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    let current = InstanceStatus::parse(&row.get::<String, _>("status"))?;
    if current == InstanceStatus::Destroying {
        return Err(AppError::InvalidState("cannot redeploy a destroying instance".to_string()));
    }
    let updated = sqlx::query(
        "UPDATE instances SET status = 'DEPLOYING', updated_at = NOW() WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await
    .map_err(AppError::Db)?;
    tx.commit().await.map_err(AppError::Db)?;
    Ok(row_to_instance(&updated))
}

/// Clone creates a new instance with the source's extensions and config_hash, name
/// suffixed `-clone`, initial status DEPLOYING, null ssh_endpoint (§4.10).
pub async fn clone_instance(pool: &PgPool, source_id: Uuid) -> Result<Instance, AppError> {
    let source = get(pool, source_id).await?;
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO instances
            (id, name, provider, region, team_id, extensions, config_hash, ssh_endpoint, status, created_at, updated_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,NULL,'DEPLOYING',NOW(),NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(format!("{}-clone", source.name))
    .bind(&source.provider)
    .bind(&source.region)
    .bind(source.team_id)
    .bind(&source.extensions)
    .bind(&source.config_hash)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(row_to_instance(&row))
}

#[derive(Debug, Serialize)]
pub struct FleetView {
    pub total: i64,
    pub by_status: std::collections::HashMap<String, i64>,
    pub by_provider: std::collections::HashMap<String, i64>,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub avg_disk_percent: f64,
    pub max_cpu: Option<(Uuid, f64)>,
    pub max_memory: Option<(Uuid, f64)>,
    pub max_disk: Option<(Uuid, f64)>,
    pub stale_instance_ids: Vec<Uuid>,
}

/// Derived on demand (§4.5): joins the instance list with latest heartbeats. Averages
/// and maxima are computed only over instances with a non-null latest heartbeat.
pub async fn fleet_view(pool: &PgPool) -> Result<FleetView, AppError> {
    let statuses = sqlx::query("SELECT status, COUNT(*) as c FROM instances GROUP BY status")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    let by_status = statuses
        .into_iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("c")))
        .collect();

    let providers = sqlx::query("SELECT provider, COUNT(*) as c FROM instances GROUP BY provider")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    let by_provider = providers
        .into_iter()
        .map(|r| (r.get::<String, _>("provider"), r.get::<i64, _>("c")))
        .collect();

    let total: i64 = sqlx::query("SELECT COUNT(*) as c FROM instances")
        .fetch_one(pool)
        .await
        .map_err(AppError::Db)?
        .get("c");

    let heartbeats = sqlx::query(
        r#"
        SELECT h.instance_id, h.cpu_percent,
               (h.memory_used::double precision / NULLIF(h.memory_total, 0) * 100) as memory_percent,
               (h.disk_used::double precision / NULLIF(h.disk_total, 0) * 100) as disk_percent,
               h.ts
        FROM latest_heartbeats h
        JOIN instances i ON i.id = h.instance_id
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;

    let n = heartbeats.len().max(1) as f64;
    let mut sum_cpu = 0.0;
    let mut sum_mem = 0.0;
    let mut sum_disk = 0.0;
    let mut max_cpu: Option<(Uuid, f64)> = None;
    let mut max_memory: Option<(Uuid, f64)> = None;
    let mut max_disk: Option<(Uuid, f64)> = None;
    let mut stale_instance_ids = Vec::new();

    let running_rows = sqlx::query("SELECT id FROM instances WHERE status = 'RUNNING'")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    let running: std::collections::HashSet<Uuid> =
        running_rows.into_iter().map(|r| r.get("id")).collect();

    for row in &heartbeats {
        let instance_id: Uuid = row.get("instance_id");
        let cpu: f64 = row.get("cpu_percent");
        let mem: f64 = row.try_get("memory_percent").unwrap_or(0.0);
        let disk: f64 = row.try_get("disk_percent").unwrap_or(0.0);
        let ts: DateTime<Utc> = row.get("ts");

        sum_cpu += cpu;
        sum_mem += mem;
        sum_disk += disk;
        if max_cpu.map(|(_, v)| cpu > v).unwrap_or(true) {
            max_cpu = Some((instance_id, cpu));
        }
        if max_memory.map(|(_, v)| mem > v).unwrap_or(true) {
            max_memory = Some((instance_id, mem));
        }
        if max_disk.map(|(_, v)| disk > v).unwrap_or(true) {
            max_disk = Some((instance_id, disk));
        }
        if running.contains(&instance_id) && Utc::now() - ts > chrono::Duration::minutes(5) {
            stale_instance_ids.push(instance_id);
        }
    }

    Ok(FleetView {
        total,
        by_status,
        by_provider,
        avg_cpu_percent: sum_cpu / n,
        avg_memory_percent: sum_mem / n,
        avg_disk_percent: sum_disk / n,
        max_cpu,
        max_memory,
        max_disk,
        stale_instance_ids,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerLevel {
    Ok,
    Warning,
    Critical,
}

/// Fixed threshold banners from §4.5; banners clear when the value falls below the
/// lower edge of the band.
pub fn cpu_banner(cpu_percent: f64) -> BannerLevel {
    if cpu_percent >= 95.0 {
        BannerLevel::Critical
    } else if cpu_percent > 80.0 {
        BannerLevel::Warning
    } else {
        BannerLevel::Ok
    }
}

pub fn memory_banner(memory_percent: f64) -> BannerLevel {
    if memory_percent >= 90.0 {
        BannerLevel::Critical
    } else {
        BannerLevel::Ok
    }
}

pub fn disk_banner(disk_percent: f64) -> BannerLevel {
    if disk_percent >= 90.0 {
        BannerLevel::Critical
    } else if disk_percent >= 85.0 {
        BannerLevel::Warning
    } else {
        BannerLevel::Ok
    }
}

fn require_scope(auth: &AuthUser, instance: &Instance) -> Result<(), AppError> {
    if !rbac::in_scope(auth.role, &auth.team_ids, instance.team_id) {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

/// Fans out a lifecycle transition (§4.10) to viewers subscribed to this instance.
fn publish_instance_event(instance: &Instance, action: &str) {
    let envelope = Envelope::new(
        "events",
        "event:instance",
        Utc::now().timestamp_millis(),
        serde_json::json!({ "action": action, "instance": instance }),
    )
    .with_instance(Some(instance.id.to_string()));
    session::publish(instance.id, envelope);
}

pub async fn list_instances(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Query(filter): Query<ListFilter>,
) -> AppResult<Json<serde_json::Value>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_READ) {
        return Err(AppError::Forbidden);
    }
    let page = list(&pool, &filter).await?;
    Ok(Json(serde_json::json!({
        "items": page.items,
        "pagination": {
            "page": page.page,
            "pageSize": page.page_size,
            "total": page.total,
        },
    })))
}

#[derive(Debug, Serialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub instance: Instance,
    pub latest_heartbeat: Option<Heartbeat>,
}

pub async fn get_instance(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<InstanceDetail>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_READ) {
        return Err(AppError::Forbidden);
    }
    let instance = get(&pool, id).await?;
    require_scope(&auth, &instance)?;
    let latest_heartbeat = ingestion::latest_heartbeat(&pool, id).await?;
    Ok(Json(InstanceDetail { instance, latest_heartbeat }))
}

pub async fn register_instance(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<RegisterInstance>,
) -> AppResult<Json<Instance>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_DEPLOY) {
        return Err(AppError::Forbidden);
    }
    let instance = register(&pool, req).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "instance",
            resource_id: Some(instance.id.to_string()),
            before: None,
            after: serde_json::to_value(&instance).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(instance))
}

/// Deregistration (§6: `DELETE /api/v1/instances/:id`) is ADMIN-only and
/// removes the row outright, distinct from the DESTROYING status transition.
pub async fn delete_instance(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    if auth.role != rbac::Role::Admin {
        return Err(AppError::Forbidden);
    }
    let instance = get(&pool, id).await?;
    require_scope(&auth, &instance)?;
    delete(&pool, id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Delete,
            resource_type: "instance",
            resource_id: Some(id.to_string()),
            before: serde_json::to_value(&instance).ok(),
            after: None,
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Shared by the `/suspend` and `/resume` routes (§6) — each binds a fixed
/// target status rather than accepting one in body.
pub async fn transition_instance_handler(
    pool: &PgPool,
    auth: &AuthUser,
    id: Uuid,
    target: InstanceStatus,
    required_perm: &'static str,
) -> AppResult<Json<Instance>> {
    if !rbac::can_perform(auth.role, required_perm) {
        return Err(AppError::Forbidden);
    }
    let before = get(pool, id).await?;
    require_scope(auth, &before)?;
    let updated = transition(pool, id, target).await?;
    let action = match target {
        InstanceStatus::Destroying => AuditAction::Destroy,
        InstanceStatus::Suspended => AuditAction::Suspend,
        InstanceStatus::Running if before.status == "SUSPENDED" || before.status == "STOPPED" => {
            AuditAction::Resume
        }
        _ => AuditAction::Update,
    };
    audit::record(
        pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action,
            resource_type: "instance",
            resource_id: Some(id.to_string()),
            before: serde_json::to_value(&before).ok(),
            after: serde_json::to_value(&updated).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    publish_instance_event(&updated, target.as_str());
    Ok(Json(updated))
}

pub async fn suspend_instance(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Instance>> {
    transition_instance_handler(&pool, &auth, id, InstanceStatus::Suspended, perm::INSTANCES_DEPLOY).await
}

pub async fn resume_instance(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Instance>> {
    transition_instance_handler(&pool, &auth, id, InstanceStatus::Running, perm::INSTANCES_DEPLOY).await
}

pub async fn redeploy_instance(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Instance>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_DEPLOY) {
        return Err(AppError::Forbidden);
    }
    let before = get(&pool, id).await?;
    require_scope(&auth, &before)?;
    let updated = redeploy(&pool, id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Deploy,
            resource_type: "instance",
            resource_id: Some(id.to_string()),
            before: serde_json::to_value(&before).ok(),
            after: serde_json::to_value(&updated).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    publish_instance_event(&updated, "redeploy");
    Ok(Json(updated))
}

pub async fn clone_instance_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Instance>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_DEPLOY) {
        return Err(AppError::Forbidden);
    }
    let source = get(&pool, id).await?;
    require_scope(&auth, &source)?;
    let cloned = clone_instance(&pool, id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "instance",
            resource_id: Some(cloned.id.to_string()),
            before: None,
            after: serde_json::to_value(&cloned).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    publish_instance_event(&cloned, "clone");
    Ok(Json(cloned))
}

pub async fn fleet_view_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
) -> AppResult<Json<FleetView>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_READ) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(fleet_view(&pool).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_spec() {
        use InstanceStatus::*;
        assert!(Deploying.can_transition_to(Running));
        assert!(Deploying.can_transition_to(Error));
        assert!(!Deploying.can_transition_to(Suspended));
        assert!(Running.can_transition_to(Destroying));
        assert!(!Running.can_transition_to(Deploying));
        assert!(Destroying.can_transition_to(Unknown));
        assert!(!Stopped.can_transition_to(Unknown));
        assert!(!Unknown.can_transition_to(Running));
    }

    #[test]
    fn name_regex_rejects_uppercase_and_leading_hyphen() {
        assert!(NAME_RE.is_match("my-instance-1"));
        assert!(!NAME_RE.is_match("My-Instance"));
        assert!(!NAME_RE.is_match("-leading-hyphen"));
    }

    #[test]
    fn banners_follow_fixed_cutoffs() {
        assert_eq!(cpu_banner(50.0), BannerLevel::Ok);
        assert_eq!(cpu_banner(85.0), BannerLevel::Warning);
        assert_eq!(cpu_banner(96.0), BannerLevel::Critical);
        assert_eq!(disk_banner(86.0), BannerLevel::Warning);
        assert_eq!(disk_banner(91.0), BannerLevel::Critical);
        assert_eq!(memory_banner(91.0), BannerLevel::Critical);
    }
}
