//! Cost tracking: CostEntry, Budget, BudgetAlert, CostAnomaly, Optimization
//! recommendations (§4.9). The period-window math is grounded on the teacher's
//! `billing/service.rs::window_bounds`, generalized from subscription reset
//! intervals to daily/weekly/monthly budget periods.

use axum::{
    extract::{Extension, Query},
    Json,
};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::audit::{self, AuditAction, RecordAudit};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::rbac::{self, perm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CostCategory {
    Compute,
    Storage,
    Network,
    Egress,
    Other,
}

#[derive(Debug, Serialize)]
pub struct CostEntry {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub category: CostCategory,
    pub amount_usd: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub provider: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordCostEntry {
    pub instance_id: Uuid,
    pub category: CostCategory,
    pub amount_usd: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub provider: String,
}

pub async fn record_entry(pool: &PgPool, entry: RecordCostEntry) -> Result<Uuid, AppError> {
    if entry.amount_usd < 0.0 {
        return Err(AppError::Validation {
            details: vec!["amount_usd must be >= 0".to_string()],
        });
    }
    if entry.period_start >= entry.period_end {
        return Err(AppError::Validation {
            details: vec!["period_start must precede period_end".to_string()],
        });
    }
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO cost_entries
            (id, instance_id, category, amount_usd, period_start, period_end, provider)
        VALUES ($1,$2,$3,$4,$5,$6,$7)
        "#,
    )
    .bind(id)
    .bind(entry.instance_id)
    .bind(sqlx::types::Json(entry.category))
    .bind(entry.amount_usd)
    .bind(entry.period_start)
    .bind(entry.period_end)
    .bind(&entry.provider)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(id)
}

/// Sums cost entries for `instance_id` (or fleet-wide when `None`) overlapping
/// `[period_start, period_end)`, grouped by category.
pub async fn totals(
    pool: &PgPool,
    instance_id: Option<Uuid>,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<Vec<(CostCategory, f64)>, AppError> {
    let rows = if let Some(instance_id) = instance_id {
        sqlx::query(
            r#"
            SELECT category, SUM(amount_usd) AS total FROM cost_entries
            WHERE instance_id = $1 AND period_start < $3 AND period_end > $2
            GROUP BY category
            "#,
        )
        .bind(instance_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(pool)
        .await
    } else {
        sqlx::query(
            r#"
            SELECT category, SUM(amount_usd) AS total FROM cost_entries
            WHERE period_start < $2 AND period_end > $1
            GROUP BY category
            "#,
        )
        .bind(period_start)
        .bind(period_end)
        .fetch_all(pool)
        .await
    }
    .map_err(AppError::Db)?;
    Ok(rows
        .into_iter()
        .map(|r| {
            (
                r.get::<sqlx::types::Json<CostCategory>, _>("category").0,
                r.try_get("total").unwrap_or(0.0),
            )
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetScope {
    Fleet,
    Team,
    Instance,
}

const VALID_THRESHOLDS: [u8; 5] = [50, 75, 80, 90, 100];

#[derive(Debug, Serialize)]
pub struct Budget {
    pub id: Uuid,
    pub scope: BudgetScope,
    pub team_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub period: BudgetPeriod,
    pub limit_usd: f64,
    pub thresholds: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

fn row_to_budget(row: &sqlx::postgres::PgRow) -> Budget {
    Budget {
        id: row.get("id"),
        scope: row.get::<sqlx::types::Json<BudgetScope>, _>("scope").0,
        team_id: row.try_get("team_id").ok(),
        instance_id: row.try_get("instance_id").ok(),
        period: row.get::<sqlx::types::Json<BudgetPeriod>, _>("period").0,
        limit_usd: row.get("limit_usd"),
        thresholds: row
            .get::<sqlx::types::Json<Vec<u8>>, _>("thresholds")
            .0,
        created_at: row.get("created_at"),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBudget {
    pub scope: BudgetScope,
    pub team_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub period: BudgetPeriod,
    pub limit_usd: f64,
    pub thresholds: Vec<u8>,
}

pub async fn create_budget(pool: &PgPool, req: CreateBudget) -> Result<Budget, AppError> {
    if req.thresholds.iter().any(|t| !VALID_THRESHOLDS.contains(t)) {
        return Err(AppError::Validation {
            details: vec!["thresholds must be a subset of {50,75,80,90,100}".to_string()],
        });
    }
    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        INSERT INTO budgets (id, scope, team_id, instance_id, period, limit_usd, thresholds, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,NOW())
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(sqlx::types::Json(req.scope))
    .bind(req.team_id)
    .bind(req.instance_id)
    .bind(sqlx::types::Json(req.period))
    .bind(req.limit_usd)
    .bind(sqlx::types::Json(&req.thresholds))
    .fetch_one(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(row_to_budget(&row))
}

pub async fn list_budgets(pool: &PgPool) -> Result<Vec<Budget>, AppError> {
    let rows = sqlx::query("SELECT * FROM budgets ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(rows.iter().map(row_to_budget).collect())
}

/// Computes the current period's `[start, end)` bounds for a budget period,
/// the same three-way daily/weekly/monthly split the teacher uses for billing
/// reset windows.
pub fn window_bounds(now: DateTime<Utc>, period: BudgetPeriod) -> (DateTime<Utc>, DateTime<Utc>) {
    match period {
        BudgetPeriod::Daily => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single()
                .unwrap();
            (start, start + Duration::days(1))
        }
        BudgetPeriod::Weekly => {
            let weekday = now.weekday().num_days_from_monday() as i64;
            let rough_start = now - Duration::days(weekday);
            let start = Utc
                .with_ymd_and_hms(rough_start.year(), rough_start.month(), rough_start.day(), 0, 0, 0)
                .single()
                .unwrap();
            (start, start + Duration::days(7))
        }
        BudgetPeriod::Monthly => {
            let start_date = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap();
            let start = Utc.from_utc_datetime(&start_date);
            (start, start + Months::new(1))
        }
    }
}

/// Checks whether spend crossed a new threshold for `budget` in its current
/// period and, if so, records a `BudgetAlert` — guarded by a unique
/// `(budget_id, threshold, period_start)` constraint so each threshold fires
/// exactly once per period even under concurrent evaluation.
pub async fn check_and_record_threshold_crossings(
    pool: &PgPool,
    budget: &Budget,
    spend_usd: f64,
) -> Result<Vec<u8>, AppError> {
    let (period_start, _period_end) = window_bounds(Utc::now(), budget.period);
    let percent = if budget.limit_usd > 0.0 {
        (spend_usd / budget.limit_usd) * 100.0
    } else {
        0.0
    };
    let mut crossed = Vec::new();
    for &threshold in &budget.thresholds {
        if percent < threshold as f64 {
            continue;
        }
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO budget_alerts (id, budget_id, threshold, period_start, triggered_at)
            VALUES ($1,$2,$3,$4,NOW())
            ON CONFLICT (budget_id, threshold, period_start) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(budget.id)
        .bind(threshold as i16)
        .bind(period_start)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
        if result.rows_affected() > 0 {
            crossed.push(threshold);
        }
    }
    Ok(crossed)
}

#[derive(Debug, Serialize)]
pub struct CostAnomaly {
    pub instance_id: Uuid,
    pub actual_usd: f64,
    pub expected_usd: f64,
    pub deviation_pct: f64,
}

/// An anomaly is flagged when actual spend deviates from the expected (prior
/// comparable window) spend by more than 50% (§4.9).
pub fn detect_anomaly(instance_id: Uuid, actual_usd: f64, expected_usd: f64) -> Option<CostAnomaly> {
    if expected_usd <= 0.0 {
        return None;
    }
    let deviation_pct = ((actual_usd - expected_usd).abs() / expected_usd) * 100.0;
    if deviation_pct > 50.0 {
        Some(CostAnomaly {
            instance_id,
            actual_usd,
            expected_usd,
            deviation_pct,
        })
    } else {
        None
    }
}

#[derive(Debug, Serialize)]
pub struct OptimizationRecommendation {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub action: String,
    pub potential_savings_usd: f64,
    pub confidence: u8,
    pub description: String,
}

/// Surfaces recommendations sorted by potential savings, descending (§4.9).
pub async fn list_recommendations(pool: &PgPool) -> Result<Vec<OptimizationRecommendation>, AppError> {
    let rows = sqlx::query(
        "SELECT * FROM optimization_recommendations ORDER BY potential_savings_usd DESC",
    )
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(rows
        .into_iter()
        .map(|r| OptimizationRecommendation {
            id: r.get("id"),
            instance_id: r.get("instance_id"),
            action: r.get("action"),
            potential_savings_usd: r.get("potential_savings_usd"),
            confidence: r.get::<i16, _>("confidence") as u8,
            description: r.get("description"),
        })
        .collect())
}

pub async fn record_entry_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<RecordCostEntry>,
) -> AppResult<axum::http::StatusCode> {
    if !rbac::can_perform(auth.role, perm::BUDGETS_WRITE) {
        return Err(AppError::Forbidden);
    }
    record_entry(&pool, req).await?;
    Ok(axum::http::StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
pub struct TotalsQuery {
    pub instance_id: Option<Uuid>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CategoryTotal {
    pub category: CostCategory,
    pub total_usd: f64,
}

pub async fn totals_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Query(q): Query<TotalsQuery>,
) -> AppResult<Json<Vec<CategoryTotal>>> {
    let rows = totals(&pool, q.instance_id, q.period_start, q.period_end).await?;
    Ok(Json(
        rows.into_iter()
            .map(|(category, total_usd)| CategoryTotal { category, total_usd })
            .collect(),
    ))
}

pub async fn list_budgets_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<Budget>>> {
    Ok(Json(list_budgets(&pool).await?))
}

pub async fn create_budget_handler(
    Extension(pool): Extension<PgPool>,
    auth: AuthUser,
    Json(req): Json<CreateBudget>,
) -> AppResult<Json<Budget>> {
    if !rbac::can_perform(auth.role, perm::BUDGETS_WRITE) {
        return Err(AppError::Forbidden);
    }
    let budget = create_budget(&pool, req).await?;
    audit::record(
        &pool,
        RecordAudit {
            actor_user_id: auth.user_id,
            action: AuditAction::Create,
            resource_type: "budget",
            resource_id: Some(budget.id.to_string()),
            before: None,
            after: serde_json::to_value(&budget).ok(),
            outcome: "success",
            ip: None,
        },
    )
    .await
    .ok();
    Ok(Json(budget))
}

pub async fn list_recommendations_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
) -> AppResult<Json<Vec<OptimizationRecommendation>>> {
    Ok(Json(list_recommendations(&pool).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anomaly_requires_more_than_fifty_percent_deviation() {
        assert!(detect_anomaly(Uuid::new_v4(), 160.0, 100.0).is_some());
        assert!(detect_anomaly(Uuid::new_v4(), 140.0, 100.0).is_none());
    }

    #[test]
    fn monthly_window_starts_on_the_first() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
        let (start, end) = window_bounds(now, BudgetPeriod::Monthly);
        assert_eq!(start.day(), 1);
        assert_eq!(end.month(), 4);
    }
}
