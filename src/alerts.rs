//! AlertRule / AlertEvent state machine and evaluation loop (§4.6). The scan
//! loop shape is grounded on the teacher's `evaluations/scheduler.rs` periodic
//! `tokio::time::interval` tick; transient per-(rule,instance) evaluation state
//! lives in a `DashMap`, following the same in-memory-partition idiom as
//! `rate_limit.rs`, since only FIRING/RESOLVED transitions are durable.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::audit::{self, AuditAction, RecordAudit};
use crate::config;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::notify::{dispatch_with_retry, Channel as NotifyTransportChannel, Notification, NotificationSink};
use crate::rbac::{self, perm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl ComparisonOp {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonOp::Gt => value > threshold,
            ComparisonOp::Gte => value >= threshold,
            ComparisonOp::Lt => value < threshold,
            ComparisonOp::Lte => value <= threshold,
            ComparisonOp::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub metric: String,
    pub op: ComparisonOp,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyTarget {
    pub channel: NotifyTransportChannel,
    /// Webhook URL or email recipient list, depending on `channel`.
    pub destination: Option<String>,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvalState {
    Inactive,
    Pending,
    Firing,
    Resolved,
}

#[derive(Debug, Serialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub name: String,
    pub conditions: Vec<Condition>,
    pub combinator: Combinator,
    pub severity: Severity,
    pub window_secs: i64,
    pub pending_for_secs: i64,
    pub cooldown_secs: i64,
    pub target_instance_id: Option<Uuid>,
    pub notify_targets: Vec<NotifyTarget>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn row_to_rule(row: &sqlx::postgres::PgRow) -> Result<AlertRule, AppError> {
    Ok(AlertRule {
        id: row.get("id"),
        name: row.get("name"),
        conditions: row
            .get::<sqlx::types::Json<Vec<Condition>>, _>("conditions")
            .0,
        combinator: row.get::<sqlx::types::Json<Combinator>, _>("combinator").0,
        severity: row.get::<sqlx::types::Json<Severity>, _>("severity").0,
        window_secs: row.get("window_secs"),
        pending_for_secs: row.get("pending_for_secs"),
        cooldown_secs: row.get("cooldown_secs"),
        target_instance_id: row.try_get("target_instance_id").ok(),
        notify_targets: row
            .get::<sqlx::types::Json<Vec<NotifyTarget>>, _>("notify_targets")
            .0,
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRule {
    pub name: String,
    pub conditions: Vec<Condition>,
    pub combinator: Combinator,
    pub severity: Severity,
    pub window_secs: i64,
    pub pending_for_secs: i64,
    pub cooldown_secs: i64,
    pub target_instance_id: Option<Uuid>,
    pub notify_targets: Vec<NotifyTarget>,
    pub enabled: bool,
}

fn validate(req: &CreateAlertRule) -> Result<(), AppError> {
    let mut details = Vec::new();
    if req.conditions.is_empty() {
        details.push("at least one condition is required".to_string());
    }
    for c in &req.conditions {
        if !c.threshold.is_finite() {
            details.push(format!("threshold for {} must be finite", c.metric));
        }
    }
    for target in &req.notify_targets {
        if target.channel == NotifyTransportChannel::Webhook
            && target.destination.as_deref().unwrap_or("").is_empty()
        {
            details.push("webhook notify target requires a destination URL".to_string());
        }
    }
    if !details.is_empty() {
        return Err(AppError::Validation { details });
    }
    Ok(())
}

pub async fn create(pool: &PgPool, req: CreateAlertRule) -> Result<AlertRule, AppError> {
    validate(&req)?;
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO alert_rules
            (id, name, conditions, combinator, severity, window_secs, pending_for_secs,
             cooldown_secs, target_instance_id, notify_targets, enabled, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(&req.name)
    .bind(sqlx::types::Json(&req.conditions))
    .bind(sqlx::types::Json(req.combinator))
    .bind(sqlx::types::Json(req.severity))
    .bind(req.window_secs)
    .bind(req.pending_for_secs)
    .bind(req.cooldown_secs)
    .bind(req.target_instance_id)
    .bind(sqlx::types::Json(&req.notify_targets))
    .bind(req.enabled)
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    row_to_rule(&row)
}

pub async fn list(pool: &PgPool) -> Result<Vec<AlertRule>, AppError> {
    let rows = sqlx::query("SELECT * FROM alert_rules ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    rows.iter().map(row_to_rule).collect()
}

pub async fn set_enabled(pool: &PgPool, id: Uuid, enabled: bool) -> Result<AlertRule, AppError> {
    let row = sqlx::query("UPDATE alert_rules SET enabled = $2 WHERE id = $1 RETURNING *")
        .bind(id)
        .bind(enabled)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?
        .ok_or(AppError::NotFound)?;
    row_to_rule(&row)
}

pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
    let result = sqlx::query("DELETE FROM alert_rules WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub instance_id: Uuid,
    pub state: EvalState,
    pub trigger_metric: String,
    pub trigger_value: f64,
    pub message: String,
    pub fired_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notifications_sent: i32,
}

pub async fn list_events(pool: &PgPool, instance_id: Option<Uuid>) -> Result<Vec<AlertEvent>, AppError> {
    let rows = if let Some(instance_id) = instance_id {
        sqlx::query("SELECT * FROM alert_events WHERE instance_id = $1 ORDER BY fired_at DESC")
            .bind(instance_id)
            .fetch_all(pool)
            .await
    } else {
        sqlx::query("SELECT * FROM alert_events ORDER BY fired_at DESC")
            .fetch_all(pool)
            .await
    }
    .map_err(AppError::Db)?;
    Ok(rows
        .into_iter()
        .map(|row| AlertEvent {
            id: row.get("id"),
            rule_id: row.get("rule_id"),
            instance_id: row.get("instance_id"),
            state: match row.get::<String, _>("state").as_str() {
                "PENDING" => EvalState::Pending,
                "FIRING" => EvalState::Firing,
                "RESOLVED" => EvalState::Resolved,
                _ => EvalState::Inactive,
            },
            trigger_metric: row.get("trigger_metric"),
            trigger_value: row.get("trigger_value"),
            message: row.get("message"),
            fired_at: row.get("fired_at"),
            resolved_at: row.try_get("resolved_at").ok(),
            notifications_sent: row.get("notifications_sent"),
        })
        .collect())
}

#[derive(Clone)]
struct RuleInstanceState {
    eval_state: EvalState,
    pending_since: Option<DateTime<Utc>>,
    last_notified: HashMap<String, DateTime<Utc>>,
    open_event_id: Option<Uuid>,
}

impl Default for RuleInstanceState {
    fn default() -> Self {
        Self {
            eval_state: EvalState::Inactive,
            pending_since: None,
            last_notified: HashMap::new(),
            open_event_id: None,
        }
    }
}

static EVAL_STATE: Lazy<DashMap<(Uuid, Uuid), RuleInstanceState>> = Lazy::new(DashMap::new);

async fn window_average(
    pool: &PgPool,
    instance_id: Uuid,
    metric: &str,
    window_secs: i64,
) -> Result<Option<f64>, AppError> {
    if !crate::timeseries::VALID_FIELDS.contains(&metric) {
        return Err(AppError::Validation {
            details: vec![format!("unknown metric: {metric}")],
        });
    }
    let sql = format!(
        "SELECT AVG(({metric})::double precision) AS avg_value FROM metric_samples \
         WHERE instance_id = $1 AND recorded_at >= NOW() - ($2 || ' seconds')::interval"
    );
    let row = sqlx::query(&sql)
        .bind(instance_id)
        .bind(window_secs.to_string())
        .fetch_one(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(row.try_get::<Option<f64>, _>("avg_value").unwrap_or(None))
}

fn evaluate_conditions(rule: &AlertRule, samples: &HashMap<String, f64>) -> (bool, Option<(String, f64)>) {
    let mut results = Vec::new();
    let mut trigger = None;
    for c in &rule.conditions {
        if let Some(&value) = samples.get(&c.metric) {
            let holds = c.op.holds(value, c.threshold);
            if holds && trigger.is_none() {
                trigger = Some((c.metric.clone(), value));
            }
            results.push(holds);
        } else {
            results.push(false);
        }
    }
    let breach = match rule.combinator {
        Combinator::And => !results.is_empty() && results.iter().all(|&b| b),
        Combinator::Or => results.iter().any(|&b| b),
    };
    (breach, trigger)
}

/// Evaluates one rule against one instance's current window averages, advancing
/// the INACTIVE→PENDING→FIRING→RESOLVED→INACTIVE state machine and dispatching
/// notifications on transition into, or renewed while in, FIRING.
pub async fn evaluate_rule_for_instance(
    pool: &PgPool,
    sink: &dyn NotificationSink,
    rule: &AlertRule,
    instance_id: Uuid,
) -> Result<(), AppError> {
    let mut samples = HashMap::new();
    for c in &rule.conditions {
        if let Some(avg) = window_average(pool, instance_id, &c.metric, rule.window_secs).await? {
            samples.insert(c.metric.clone(), avg);
        }
    }
    let (breach, trigger) = evaluate_conditions(rule, &samples);
    let now = Utc::now();
    let key = (rule.id, instance_id);

    // Snapshot then drop the shard guard before any `.await` — never hold a
    // DashMap entry across an await point.
    let mut state = EVAL_STATE
        .get(&key)
        .map(|r| r.clone())
        .unwrap_or_default();

    if breach {
        match state.eval_state {
            EvalState::Inactive => {
                state.eval_state = EvalState::Pending;
                state.pending_since = Some(now);
                if rule.pending_for_secs <= 0 {
                    fire(pool, sink, rule, instance_id, &mut state, trigger, now).await?;
                }
            }
            EvalState::Pending => {
                let since = state.pending_since.unwrap_or(now);
                if (now - since).num_seconds() >= rule.pending_for_secs {
                    fire(pool, sink, rule, instance_id, &mut state, trigger, now).await?;
                }
            }
            EvalState::Firing | EvalState::Resolved => {
                state.eval_state = EvalState::Firing;
                maybe_renotify(pool, sink, rule, instance_id, &mut state, trigger, now).await?;
            }
        }
    } else {
        match state.eval_state {
            EvalState::Pending => {
                state.eval_state = EvalState::Inactive;
                state.pending_since = None;
            }
            EvalState::Firing => {
                resolve(pool, &mut state, now).await?;
                state.eval_state = EvalState::Inactive;
            }
            EvalState::Resolved | EvalState::Inactive => {
                state.eval_state = EvalState::Inactive;
            }
        }
    }
    EVAL_STATE.insert(key, state);
    Ok(())
}

async fn fire(
    pool: &PgPool,
    sink: &dyn NotificationSink,
    rule: &AlertRule,
    instance_id: Uuid,
    entry: &mut RuleInstanceState,
    trigger: Option<(String, f64)>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let (metric, value) = trigger.unwrap_or_else(|| ("unknown".to_string(), f64::NAN));
    let threshold = rule
        .conditions
        .iter()
        .find(|c| c.metric == metric)
        .map(|c| c.threshold)
        .unwrap_or(f64::NAN);
    let message = format!("{metric} is {value} (threshold: {threshold})");
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO alert_events
            (id, rule_id, instance_id, state, trigger_metric, trigger_value, message,
             fired_at, resolved_at, notifications_sent)
        VALUES ($1,$2,$3,'FIRING',$4,$5,$6,$7,NULL,0)
        "#,
    )
    .bind(id)
    .bind(rule.id)
    .bind(instance_id)
    .bind(&metric)
    .bind(value)
    .bind(&message)
    .bind(now)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    entry.eval_state = EvalState::Firing;
    entry.open_event_id = Some(id);
    maybe_renotify(pool, sink, rule, instance_id, entry, Some((metric, value)), now).await
}

async fn maybe_renotify(
    pool: &PgPool,
    sink: &dyn NotificationSink,
    rule: &AlertRule,
    _instance_id: Uuid,
    entry: &mut RuleInstanceState,
    trigger: Option<(String, f64)>,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let Some(event_id) = entry.open_event_id else {
        return Ok(());
    };
    let (metric, value) = trigger.unwrap_or_else(|| ("unknown".to_string(), f64::NAN));
    let threshold = rule
        .conditions
        .iter()
        .find(|c| c.metric == metric)
        .map(|c| c.threshold)
        .unwrap_or(f64::NAN);
    let message = format!("{metric} is {value} (threshold: {threshold})");

    for target in &rule.notify_targets {
        let channel_key = format!("{:?}", target.channel);
        let due = match entry.last_notified.get(&channel_key) {
            Some(last) if rule.cooldown_secs > 0 => {
                (now - *last).num_seconds() >= rule.cooldown_secs
            }
            Some(_) => true,
            None => true,
        };
        if !due {
            continue;
        }
        if target.channel == NotifyTransportChannel::Email && target.recipients.is_empty() {
            continue;
        }
        let destination = target
            .destination
            .clone()
            .unwrap_or_else(|| target.recipients.join(","));
        let notification = Notification {
            channel: target.channel,
            destination,
            subject: format!("[{:?}] {}", rule.severity, rule.name),
            body: message.clone(),
        };
        let (ok, _attempts) = dispatch_with_retry(sink, &notification).await;
        entry.last_notified.insert(channel_key, now);
        if ok {
            sqlx::query(
                "UPDATE alert_events SET notifications_sent = notifications_sent + 1 WHERE id = $1",
            )
            .bind(event_id)
            .execute(pool)
            .await
            .map_err(AppError::Db)?;
        }
    }
    Ok(())
}

async fn resolve(
    pool: &PgPool,
    entry: &mut RuleInstanceState,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if let Some(event_id) = entry.open_event_id.take() {
        sqlx::query("UPDATE alert_events SET state = 'RESOLVED', resolved_at = $2 WHERE id = $1")
            .bind(event_id)
            .bind(now)
            .execute(pool)
            .await
            .map_err(AppError::Db)?;
    }
    entry.pending_since = None;
    entry.last_notified.clear();
    Ok(())
}

/// Spawns the periodic scan loop: every `ALERT_EVAL_INTERVAL_SECS`, re-evaluates
/// every enabled rule against its target instance(s) (fleet-wide when null).
pub fn spawn(pool: PgPool, sink: std::sync::Arc<dyn NotificationSink>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(*config::ALERT_EVAL_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if let Err(err) = scan_and_evaluate(&pool, sink.as_ref()).await {
                tracing::warn!(?err, "alert evaluation tick failed");
            }
        }
    });
}

async fn scan_and_evaluate(pool: &PgPool, sink: &dyn NotificationSink) -> Result<(), AppError> {
    let rules = list(pool).await?;
    for rule in rules.iter().filter(|r| r.enabled) {
        let instance_ids: Vec<Uuid> = if let Some(target) = rule.target_instance_id {
            vec![target]
        } else {
            sqlx::query("SELECT id FROM instances")
                .fetch_all(pool)
                .await
                .map_err(AppError::Db)?
                .iter()
                .map(|r| r.get("id"))
                .collect()
        };
        for instance_id in instance_ids {
            if let Err(err) = evaluate_rule_for_instance(pool, sink, rule, instance_id).await {
                tracing::warn!(?err, rule_id = %rule.id, %instance_id, "rule evaluation failed");
            }
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct AlertEventFilter {
    pub instance_id: Option<Uuid>,
}

pub async fn list_rules_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<AlertRule>>> {
    Ok(Json(list(&pool).await?))
}

pub async fn create_rule_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<CreateAlertRule>,
) -> AppResult<Json<AlertRule>> {
    if !rbac::can_perform(auth.role, perm::ALERTS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let rule = create(&pool, req).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "alert_rule",
            resource_id: Some(rule.id.to_string()),
            before: None,
            after: serde_json::to_value(&rule).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(rule))
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

pub async fn set_enabled_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SetEnabledRequest>,
) -> AppResult<Json<AlertRule>> {
    if !rbac::can_perform(auth.role, perm::ALERTS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let rule = set_enabled(&pool, id, req.enabled).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Update,
            resource_type: "alert_rule",
            resource_id: Some(id.to_string()),
            before: None,
            after: serde_json::to_value(&rule).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(rule))
}

pub async fn delete_rule_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<axum::http::StatusCode> {
    if !rbac::can_perform(auth.role, perm::ALERTS_WRITE) {
        return Err(AppError::Forbidden);
    }
    delete(&pool, id).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Delete,
            resource_type: "alert_rule",
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

pub async fn list_events_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    axum::extract::Query(filter): axum::extract::Query<AlertEventFilter>,
) -> AppResult<Json<Vec<AlertEvent>>> {
    Ok(Json(list_events(&pool, filter.instance_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_combinator_requires_all_conditions() {
        let rule = AlertRule {
            id: Uuid::new_v4(),
            name: "cpu+mem".into(),
            conditions: vec![
                Condition { metric: "cpu_percent".into(), op: ComparisonOp::Gt, threshold: 80.0 },
                Condition { metric: "memory_percent".into(), op: ComparisonOp::Gt, threshold: 90.0 },
            ],
            combinator: Combinator::And,
            severity: Severity::Warning,
            window_secs: 60,
            pending_for_secs: 0,
            cooldown_secs: 0,
            target_instance_id: None,
            notify_targets: vec![],
            enabled: true,
            created_at: Utc::now(),
        };
        let mut samples = HashMap::new();
        samples.insert("cpu_percent".to_string(), 85.0);
        samples.insert("memory_percent".to_string(), 50.0);
        let (breach, _) = evaluate_conditions(&rule, &samples);
        assert!(!breach);
        samples.insert("memory_percent".to_string(), 95.0);
        let (breach, _) = evaluate_conditions(&rule, &samples);
        assert!(breach);
    }

    #[test]
    fn message_format_matches_spec() {
        let message = format!("{} is {} (threshold: {})", "cpu_percent", 85.0, 80.0);
        assert_eq!(message, "cpu_percent is 85 (threshold: 80)");
    }
}
