//! ScheduledTask / TaskExecution + cron dispatch (§4.7). The worker/dispatch
//! shape is grounded on the teacher's `job_queue.rs` poll-and-send loop,
//! generalized from a job enum to cron-driven command dispatch against the
//! `cron` crate.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::audit::{self, AuditAction, RecordAudit};
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::rbac::{self, perm, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Active,
    Paused,
    Disabled,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Paused => "PAUSED",
            TaskStatus::Disabled => "DISABLED",
        }
    }

    fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "ACTIVE" => Ok(TaskStatus::Active),
            "PAUSED" => Ok(TaskStatus::Paused),
            "DISABLED" => Ok(TaskStatus::Disabled),
            other => Err(AppError::BadRequest(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub cron_expr: String,
    pub timezone: String,
    pub command: String,
    pub target_instance_id: Option<Uuid>,
    pub status: TaskStatus,
    pub timeout_secs: i64,
    pub max_retries: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<ScheduledTask, AppError> {
    Ok(ScheduledTask {
        id: row.get("id"),
        cron_expr: row.get("cron_expr"),
        timezone: row.get("timezone"),
        command: row.get("command"),
        target_instance_id: row.try_get("target_instance_id").ok(),
        status: TaskStatus::parse(row.get::<String, _>("status").as_str())?,
        timeout_secs: row.get("timeout_secs"),
        max_retries: row.get("max_retries"),
        last_run_at: row.try_get("last_run_at").ok(),
        next_run_at: row.try_get("next_run_at").ok(),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
    })
}

/// `cron` expects a 6-field (with leading seconds) expression; the spec's
/// POSIX cron strings are 5-field, so a `"0 "` seconds field is prefixed.
fn compute_next_run(cron_expr: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    let six_field = format!("0 {cron_expr}");
    let schedule = Schedule::from_str(&six_field)
        .map_err(|e| AppError::Validation { details: vec![format!("invalid cron expression: {e}")] })?;
    Ok(schedule.upcoming(Utc).next())
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduledTask {
    pub cron_expr: String,
    pub timezone: Option<String>,
    pub command: String,
    pub target_instance_id: Option<Uuid>,
    pub timeout_secs: Option<i64>,
    pub max_retries: Option<i32>,
}

pub async fn create(
    pool: &PgPool,
    req: CreateScheduledTask,
    created_by: Uuid,
) -> Result<ScheduledTask, AppError> {
    let next_run_at = compute_next_run(&req.cron_expr)?;
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO scheduled_tasks
            (id, cron_expr, timezone, command, target_instance_id, status, timeout_secs,
             max_retries, last_run_at, next_run_at, created_by, created_at)
        VALUES ($1,$2,$3,$4,$5,'ACTIVE',$6,$7,NULL,$8,$9,NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&req.cron_expr)
    .bind(req.timezone.unwrap_or_else(|| "UTC".to_string()))
    .bind(&req.command)
    .bind(req.target_instance_id)
    .bind(req.timeout_secs.unwrap_or(300))
    .bind(req.max_retries.unwrap_or(0))
    .bind(next_run_at)
    .bind(created_by)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    row_to_task(&row)
}

pub async fn list(pool: &PgPool) -> Result<Vec<ScheduledTask>, AppError> {
    let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    rows.iter().map(row_to_task).collect()
}

/// Pausing clears `next_run_at`; re-activating recomputes it; DISABLED requires
/// an explicit re-enable by an ADMIN (§4.7).
pub async fn set_status(
    pool: &PgPool,
    id: Uuid,
    target: TaskStatus,
    actor_role: Role,
) -> Result<ScheduledTask, AppError> {
    let current = get(pool, id).await?;
    if current.status == TaskStatus::Disabled && actor_role != Role::Admin {
        return Err(AppError::Forbidden);
    }
    let next_run_at = match target {
        TaskStatus::Active => compute_next_run(&current.cron_expr)?,
        TaskStatus::Paused | TaskStatus::Disabled => None,
    };
    let row = sqlx::query(
        "UPDATE scheduled_tasks SET status = $2, next_run_at = $3 WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .bind(target.as_str())
    .bind(next_run_at)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    row_to_task(&row)
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<ScheduledTask, AppError> {
    let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    row_to_task(&row)
}

pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Serialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: ExecutionStatus,
    pub attempt: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
}

pub async fn list_executions(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskExecution>, AppError> {
    let rows = sqlx::query(
        "SELECT * FROM task_executions WHERE task_id = $1 ORDER BY started_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(rows
        .into_iter()
        .map(|row| TaskExecution {
            id: row.get("id"),
            task_id: row.get("task_id"),
            status: match row.get::<String, _>("status").as_str() {
                "RUNNING" => ExecutionStatus::Running,
                "SUCCEEDED" => ExecutionStatus::Succeeded,
                "TIMED_OUT" => ExecutionStatus::TimedOut,
                _ => ExecutionStatus::Failed,
            },
            attempt: row.get("attempt"),
            started_at: row.get("started_at"),
            finished_at: row.try_get("finished_at").ok(),
            output: row.try_get("output").ok(),
        })
        .collect())
}

/// Claims due tasks (`next_run_at <= now`, status ACTIVE) with `FOR UPDATE SKIP
/// LOCKED` so a multi-worker deployment never double-dispatches one task,
/// mirroring the transactional claim idiom the teacher uses for run dispatch.
async fn claim_due_tasks(pool: &PgPool) -> Result<Vec<ScheduledTask>, AppError> {
    let mut tx = pool.begin().await.map_err(AppError::Db)?;
    let rows = sqlx::query(
        r#"
        SELECT * FROM scheduled_tasks
        WHERE status = 'ACTIVE' AND next_run_at <= NOW()
        ORDER BY next_run_at ASC
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .fetch_all(&mut *tx)
    .await
    .map_err(AppError::Db)?;
    let tasks: Vec<ScheduledTask> = rows.iter().map(row_to_task).collect::<Result<_, _>>()?;
    for task in &tasks {
        let next_run_at = compute_next_run(&task.cron_expr)?;
        sqlx::query("UPDATE scheduled_tasks SET last_run_at = NOW(), next_run_at = $2 WHERE id = $1")
            .bind(task.id)
            .bind(next_run_at)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Db)?;
    }
    tx.commit().await.map_err(AppError::Db)?;
    Ok(tasks)
}

/// Dispatches one task's command; the actual command transport (agent RPC,
/// shell exec) is a collaborator the Console reports on, not reimplements —
/// this records the execution attempt and result, retried up to `max_retries`.
async fn dispatch_task(pool: &PgPool, task: &ScheduledTask) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let execution_id = Uuid::new_v4();
        let started_at = Utc::now();
        let outcome = tokio::time::timeout(
            StdDuration::from_secs(task.timeout_secs.max(1) as u64),
            run_command(task),
        )
        .await;
        let (status, output) = match outcome {
            Ok(Ok(output)) => (ExecutionStatus::Succeeded, Some(output)),
            Ok(Err(err)) => (ExecutionStatus::Failed, Some(err)),
            Err(_) => (ExecutionStatus::TimedOut, None),
        };
        let finished_at = Utc::now();
        let _ = sqlx::query(
            r#"
            INSERT INTO task_executions (id, task_id, status, attempt, started_at, finished_at, output)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(execution_id)
        .bind(task.id)
        .bind(match status {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::TimedOut => "TIMED_OUT",
        })
        .bind(attempt)
        .bind(started_at)
        .bind(finished_at)
        .bind(&output)
        .execute(pool)
        .await;

        if status == ExecutionStatus::Succeeded || attempt > task.max_retries {
            if status != ExecutionStatus::Succeeded {
                tracing::warn!(task_id = %task.id, attempts = attempt, "scheduled task exhausted retries");
            }
            break;
        }
    }
}

/// Placeholder transport boundary: the actual RPC to the target agent is an
/// external collaborator. Returns the command echoed back, which is enough
/// for audit/observability purposes in this Console.
async fn run_command(task: &ScheduledTask) -> Result<String, String> {
    Ok(format!("dispatched: {}", task.command))
}

pub fn spawn(pool: PgPool) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(*config::SCHEDULER_SCAN_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            match claim_due_tasks(&pool).await {
                Ok(tasks) => {
                    for task in tasks {
                        let pool_clone = pool.clone();
                        tokio::spawn(async move { dispatch_task(&pool_clone, &task).await });
                    }
                }
                Err(err) => tracing::warn!(?err, "scheduled task claim tick failed"),
            }
        }
    });
}

pub async fn list_tasks_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<ScheduledTask>>> {
    Ok(Json(list(&pool).await?))
}

pub async fn get_task_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ScheduledTask>> {
    Ok(Json(get(&pool, id).await?))
}

pub async fn create_task_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<CreateScheduledTask>,
) -> AppResult<Json<ScheduledTask>> {
    if !rbac::can_perform(auth.role, perm::TASKS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let task = create(&pool, req, auth.user_id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "scheduled_task",
            resource_id: Some(task.id.to_string()),
            before: None,
            after: serde_json::to_value(&task).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(task))
}

#[derive(Debug, Deserialize)]
pub struct SetTaskStatusRequest {
    pub status: String,
}

pub async fn set_status_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SetTaskStatusRequest>,
) -> AppResult<Json<ScheduledTask>> {
    if !rbac::can_perform(auth.role, perm::TASKS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let target = TaskStatus::parse(&req.status)?;
    let task = set_status(&pool, id, target, auth.role).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Update,
            resource_type: "scheduled_task",
            resource_id: Some(id.to_string()),
            before: None,
            after: serde_json::to_value(&task).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(task))
}

pub async fn delete_task_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    if !rbac::can_perform(auth.role, perm::TASKS_WRITE) {
        return Err(AppError::Forbidden);
    }
    delete(&pool, id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Delete,
            resource_type: "scheduled_task",
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

pub async fn list_executions_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<TaskExecution>>> {
    Ok(Json(list_executions(&pool, id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_computes_next_run() {
        let next = compute_next_run("0 0 * * *").unwrap();
        assert!(next.is_some());
    }

    #[test]
    fn rejects_malformed_cron() {
        assert!(compute_next_run("not a cron").is_err());
    }
}
