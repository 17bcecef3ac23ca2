//! Time-series query layer (§4.4). Named ranges map deterministically to a
//! granularity; no query ever returns more than 500 points.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

const POINT_CEILING: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Raw,
    OneMinute,
    FiveMinutes,
    OneHour,
    OneDay,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Raw => "raw",
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::OneHour => "1h",
            Granularity::OneDay => "1d",
        }
    }

    fn bucket_secs(&self) -> i64 {
        match self {
            Granularity::Raw => 1,
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::OneHour => 3600,
            Granularity::OneDay => 86400,
        }
    }
}

/// Named ranges map deterministically to granularity: 1h→1m, 6h→5m, 24h→5m, 7d→1h, 30d→1d.
pub fn granularity_for_named_range(range: &str) -> Result<(Granularity, chrono::Duration), AppError> {
    match range {
        "1h" => Ok((Granularity::OneMinute, chrono::Duration::hours(1))),
        "6h" => Ok((Granularity::FiveMinutes, chrono::Duration::hours(6))),
        "24h" => Ok((Granularity::FiveMinutes, chrono::Duration::hours(24))),
        "7d" => Ok((Granularity::OneHour, chrono::Duration::days(7))),
        "30d" => Ok((Granularity::OneDay, chrono::Duration::days(30))),
        other => Err(AppError::Validation {
            details: vec![format!("unknown range '{other}'")],
        }),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SamplePoint {
    pub instance_id: Uuid,
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Validates the implied bucket count against the 500-point ceiling before issuing
/// any query; fails closed with `TooManyPoints` rather than truncating silently.
pub fn check_ceiling(from: DateTime<Utc>, to: DateTime<Utc>, granularity: Granularity) -> Result<(), AppError> {
    let span_secs = (to - from).num_seconds().max(0);
    let bucket_count = (span_secs / granularity.bucket_secs()).max(1) as usize;
    if bucket_count > POINT_CEILING {
        return Err(AppError::TooManyPoints {
            bucket_count,
            ceiling: POINT_CEILING,
        });
    }
    Ok(())
}

/// Queries one field for one instance (or fleet-wide when `instance_id` is `None`)
/// over `[from, to]` at `granularity`. Fleet queries tag each point with its instance
/// id and are never aggregated across instances.
pub async fn query(
    pool: &PgPool,
    instance_id: Option<Uuid>,
    field: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    granularity: Granularity,
) -> Result<Vec<SamplePoint>, AppError> {
    check_ceiling(from, to, granularity)?;
    if !VALID_FIELDS.contains(&field) {
        return Err(AppError::Validation {
            details: vec![format!("unknown field '{field}'")],
        });
    }

    let rows = if granularity == Granularity::Raw {
        let mut q = sqlx::QueryBuilder::new(format!(
            "SELECT instance_id, ts, {field} as value FROM metric_samples WHERE ts BETWEEN "
        ));
        q.push_bind(from).push(" AND ").push_bind(to);
        if let Some(id) = instance_id {
            q.push(" AND instance_id = ").push_bind(id);
        }
        q.push(" ORDER BY instance_id, ts ASC LIMIT ").push_bind(POINT_CEILING as i64);
        q.build().fetch_all(pool).await.map_err(AppError::Db)?
    } else {
        let mut q = sqlx::QueryBuilder::new(
            "SELECT instance_id, bucket_start as ts, \
             ((stats->",
        );
        q.push_bind(field)
            .push("->>'sum')::double precision / NULLIF((stats->")
            .push_bind(field)
            .push("->>'count')::double precision, 0)) as value \
             FROM metric_rollups WHERE granularity = ")
            .push_bind(granularity.as_str())
            .push(" AND bucket_start BETWEEN ")
            .push_bind(from)
            .push(" AND ")
            .push_bind(to);
        if let Some(id) = instance_id {
            q.push(" AND instance_id = ").push_bind(id);
        }
        q.push(" ORDER BY instance_id, bucket_start ASC LIMIT ")
            .push_bind(POINT_CEILING as i64);
        q.build().fetch_all(pool).await.map_err(AppError::Db)?
    };

    Ok(rows
        .into_iter()
        .map(|r| SamplePoint {
            instance_id: r.get("instance_id"),
            ts: r.get("ts"),
            value: r.try_get("value").unwrap_or(0.0),
        })
        .collect())
}

pub const VALID_FIELDS: &[&str] = &[
    "cpu_percent",
    "memory_used",
    "memory_total",
    "disk_used",
    "disk_total",
    "uptime_seconds",
    "load_avg_1",
    "load_avg_5",
    "load_avg_15",
    "net_bytes_sent",
    "net_bytes_recv",
];

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub field: String,
    pub range: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

fn resolve_window(params: &MetricsQuery) -> Result<(Granularity, DateTime<Utc>, DateTime<Utc>), AppError> {
    match (&params.range, params.from, params.to) {
        (Some(range), _, _) => {
            let (granularity, span) = granularity_for_named_range(range)?;
            Ok((granularity, Utc::now() - span, Utc::now()))
        }
        (None, Some(from), Some(to)) => Ok((Granularity::Raw, from, to)),
        _ => Err(AppError::Validation {
            details: vec!["metrics query requires either 'range' or both 'from' and 'to'".to_string()],
        }),
    }
}

/// Backs `GET /api/v1/instances/:id/metrics`. A named `range` picks both window and
/// granularity (§4.4); an explicit `from`/`to` always queries raw samples.
pub async fn metrics_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(instance_id): Path<Uuid>,
    Query(params): Query<MetricsQuery>,
) -> AppResult<Json<Vec<SamplePoint>>> {
    let (granularity, from, to) = resolve_window(&params)?;
    let points = query(&pool, Some(instance_id), &params.field, from, to, granularity).await?;
    Ok(Json(points))
}

#[derive(Debug, Deserialize)]
pub struct FleetMetricsQuery {
    pub field: String,
    pub instance_id: Option<Uuid>,
    pub range: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Backs `GET /api/v1/metrics/timeseries`: the same range/granularity rules as the
/// per-instance route, but fleet-wide when `instance_id` is omitted (§4.4, §6).
pub async fn fleet_metrics_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Query(params): Query<FleetMetricsQuery>,
) -> AppResult<Json<Vec<SamplePoint>>> {
    let (granularity, from, to) = resolve_window(&MetricsQuery {
        field: params.field.clone(),
        range: params.range,
        from: params.from,
        to: params.to,
    })?;
    let points = query(&pool, params.instance_id, &params.field, from, to, granularity).await?;
    Ok(Json(points))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_ranges_map_to_fixed_granularity() {
        assert_eq!(granularity_for_named_range("1h").unwrap().0, Granularity::OneMinute);
        assert_eq!(granularity_for_named_range("6h").unwrap().0, Granularity::FiveMinutes);
        assert_eq!(granularity_for_named_range("24h").unwrap().0, Granularity::FiveMinutes);
        assert_eq!(granularity_for_named_range("7d").unwrap().0, Granularity::OneHour);
        assert_eq!(granularity_for_named_range("30d").unwrap().0, Granularity::OneDay);
        assert!(granularity_for_named_range("90d").is_err());
    }

    #[test]
    fn ceiling_rejects_oversized_raw_window() {
        let from = Utc::now() - chrono::Duration::days(30);
        let to = Utc::now();
        let err = check_ceiling(from, to, Granularity::Raw).unwrap_err();
        assert!(matches!(err, AppError::TooManyPoints { .. }));
    }

    #[test]
    fn ceiling_accepts_1h_range_at_1m_granularity() {
        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now();
        assert!(check_ceiling(from, to, Granularity::OneMinute).is_ok());
    }
}
