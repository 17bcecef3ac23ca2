//! Ingestion pipeline (§4.3): persists heartbeat/metric/log/event frames, maintains
//! incremental rollups, and sweeps for stale instances. Grounded on the teacher's
//! `ingestion.rs` poll-loop worker shape and `telemetry.rs` validation helpers.

use axum::extract::{Extension, Path, Query};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::protocol::{HeartbeatPayload, LogLine, MetricPayload};
use crate::session;

pub const GRANULARITIES: &[(&str, i64)] = &[("1m", 60), ("5m", 300), ("1h", 3600), ("1d", 86400)];

fn field_map(p: &MetricPayload) -> HashMap<&'static str, f64> {
    HashMap::from([
        ("cpu_percent", p.cpu_percent),
        ("memory_used", p.memory_used as f64),
        ("memory_total", p.memory_total as f64),
        ("disk_used", p.disk_used as f64),
        ("disk_total", p.disk_total as f64),
        ("uptime_seconds", p.uptime_seconds as f64),
        ("load_avg_1", p.load_avg_1),
        ("load_avg_5", p.load_avg_5),
        ("load_avg_15", p.load_avg_15),
        ("net_bytes_sent", p.net_bytes_sent as f64),
        ("net_bytes_recv", p.net_bytes_recv as f64),
    ])
}

/// Upserts the *latest heartbeat* row (§3 invariant: at most one latest per
/// instance) and appends to the raw time series, then feeds the rollup tables.
pub async fn ingest_heartbeat(
    pool: &PgPool,
    instance_id: Uuid,
    ts: DateTime<Utc>,
    payload: &HeartbeatPayload,
) -> Result<(), AppError> {
    crate::protocol::validate_heartbeat(payload)?;

    sqlx::query(
        r#"
        INSERT INTO latest_heartbeats
            (instance_id, ts, cpu_percent, memory_used, memory_total, disk_used, disk_total,
             uptime_seconds, load_avg_1, load_avg_5, load_avg_15, net_bytes_sent, net_bytes_recv,
             process_count)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
        ON CONFLICT (instance_id) DO UPDATE SET
            ts = EXCLUDED.ts, cpu_percent = EXCLUDED.cpu_percent,
            memory_used = EXCLUDED.memory_used, memory_total = EXCLUDED.memory_total,
            disk_used = EXCLUDED.disk_used, disk_total = EXCLUDED.disk_total,
            uptime_seconds = EXCLUDED.uptime_seconds,
            load_avg_1 = EXCLUDED.load_avg_1, load_avg_5 = EXCLUDED.load_avg_5,
            load_avg_15 = EXCLUDED.load_avg_15,
            net_bytes_sent = EXCLUDED.net_bytes_sent, net_bytes_recv = EXCLUDED.net_bytes_recv,
            process_count = EXCLUDED.process_count
        WHERE latest_heartbeats.ts <= EXCLUDED.ts
        "#,
    )
    .bind(instance_id)
    .bind(ts)
    .bind(payload.cpu_percent)
    .bind(payload.memory_used as i64)
    .bind(payload.memory_total as i64)
    .bind(payload.disk_used as i64)
    .bind(payload.disk_total as i64)
    .bind(payload.uptime_seconds as i64)
    .bind(payload.load_avg_1)
    .bind(payload.load_avg_5)
    .bind(payload.load_avg_15)
    .bind(payload.net_bytes_sent as i64)
    .bind(payload.net_bytes_recv as i64)
    .bind(payload.process_count as i32)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    session::mark_online(instance_id);

    let as_metric = MetricPayload {
        cpu_percent: payload.cpu_percent,
        memory_used: payload.memory_used,
        memory_total: payload.memory_total,
        disk_used: payload.disk_used,
        disk_total: payload.disk_total,
        uptime_seconds: payload.uptime_seconds,
        load_avg_1: payload.load_avg_1,
        load_avg_5: payload.load_avg_5,
        load_avg_15: payload.load_avg_15,
        net_bytes_sent: payload.net_bytes_sent,
        net_bytes_recv: payload.net_bytes_recv,
    };
    ingest_metric_sample(pool, instance_id, ts, &as_metric).await?;

    Ok(())
}

/// Validates and persists a metric sample, then updates every coarser rollup bucket
/// incrementally (§4.3: "on each raw write, the containing bucket for each coarser
/// granularity is updated").
pub async fn ingest_metric_sample(
    pool: &PgPool,
    instance_id: Uuid,
    ts: DateTime<Utc>,
    payload: &MetricPayload,
) -> Result<(), AppError> {
    crate::protocol::validate_metric(payload)?;

    sqlx::query(
        r#"
        INSERT INTO metric_samples
            (instance_id, ts, cpu_percent, memory_used, memory_total, disk_used, disk_total,
             uptime_seconds, load_avg_1, load_avg_5, load_avg_15, net_bytes_sent, net_bytes_recv)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)
        "#,
    )
    .bind(instance_id)
    .bind(ts)
    .bind(payload.cpu_percent)
    .bind(payload.memory_used as i64)
    .bind(payload.memory_total as i64)
    .bind(payload.disk_used as i64)
    .bind(payload.disk_total as i64)
    .bind(payload.uptime_seconds as i64)
    .bind(payload.load_avg_1)
    .bind(payload.load_avg_5)
    .bind(payload.load_avg_15)
    .bind(payload.net_bytes_sent as i64)
    .bind(payload.net_bytes_recv as i64)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;

    let fields = field_map(payload);
    for (granularity, bucket_secs) in GRANULARITIES {
        let bucket_start_epoch = (ts.timestamp() / bucket_secs) * bucket_secs;
        let bucket_start = DateTime::<Utc>::from_timestamp(bucket_start_epoch, 0).unwrap();
        upsert_rollup_bucket(pool, instance_id, granularity, bucket_start, &fields).await?;
    }
    Ok(())
}

async fn upsert_rollup_bucket(
    pool: &PgPool,
    instance_id: Uuid,
    granularity: &str,
    bucket_start: DateTime<Utc>,
    fields: &HashMap<&'static str, f64>,
) -> Result<(), AppError> {
    let stats = json!(fields
        .iter()
        .map(|(k, v)| (k.to_string(), json!({"count": 1, "sum": v, "min": v, "max": v})))
        .collect::<serde_json::Map<_, _>>());

    sqlx::query(
        r#"
        INSERT INTO metric_rollups (instance_id, granularity, bucket_start, stats)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (instance_id, granularity, bucket_start) DO UPDATE SET
            stats = (
                SELECT jsonb_object_agg(
                    key,
                    jsonb_build_object(
                        'count', (COALESCE((old.value->>'count')::numeric, 0) + (new.value->>'count')::numeric),
                        'sum', (COALESCE((old.value->>'sum')::numeric, 0) + (new.value->>'sum')::numeric),
                        'min', LEAST(COALESCE((old.value->>'min')::numeric, (new.value->>'min')::numeric), (new.value->>'min')::numeric),
                        'max', GREATEST(COALESCE((old.value->>'max')::numeric, (new.value->>'max')::numeric), (new.value->>'max')::numeric)
                    )
                )
                FROM jsonb_each(EXCLUDED.stats) AS new
                LEFT JOIN jsonb_each(metric_rollups.stats) AS old ON old.key = new.key
            )
        "#,
    )
    .bind(instance_id)
    .bind(granularity)
    .bind(bucket_start)
    .bind(stats)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(())
}

/// Accepts `log:line` or `log:batch` (≤ 1000 lines), deduplicating only by
/// `(instance_id, ts, message)` within a 5 s window to absorb agent retries.
pub async fn ingest_logs(
    pool: &PgPool,
    instance_id: Uuid,
    lines: &[LogLine],
) -> Result<(), AppError> {
    if lines.len() > 1000 {
        return Err(AppError::Validation {
            details: vec!["log:batch accepts at most 1000 lines".to_string()],
        });
    }
    for line in lines {
        let ts = line
            .ts
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
            .unwrap_or_else(Utc::now);

        let duplicate = sqlx::query(
            r#"
            SELECT 1 FROM log_entries
            WHERE instance_id = $1 AND message = $2
              AND ts BETWEEN $3 - INTERVAL '5 seconds' AND $3 + INTERVAL '5 seconds'
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .bind(&line.message)
        .bind(ts)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?;
        if duplicate.is_some() {
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO log_entries (id, instance_id, ts, level, source, message, metadata)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(instance_id)
        .bind(ts)
        .bind(line.level.to_uppercase())
        .bind(line.source.to_uppercase())
        .bind(&line.message)
        .bind(&line.metadata)
        .execute(pool)
        .await
        .map_err(AppError::Db)?;
    }
    Ok(())
}

/// Events are persisted and fanned out; never rolled up.
pub async fn ingest_event(
    pool: &PgPool,
    instance_id: Uuid,
    event_type: &str,
    ts: DateTime<Utc>,
    metadata: serde_json::Value,
) -> Result<Uuid, AppError> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO events (id, instance_id, ts, event_type, metadata) VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(id)
    .bind(instance_id)
    .bind(ts)
    .bind(event_type)
    .bind(metadata)
    .execute(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(id)
}

/// Background sweep (§4.3): instances whose latest heartbeat exceeds 5x the nominal
/// cadence are flagged `stale` (volatile, not persisted as `status`). Mirrors the
/// teacher's `start_ingestion_worker` poll-loop shape.
pub fn spawn_stale_sweep(pool: PgPool) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(*crate::config::STALE_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let threshold_secs = (*crate::config::HEARTBEAT_INTERVAL_SECS as i64) * 5;
            let rows = match sqlx::query(
                "SELECT instance_id, ts FROM latest_heartbeats WHERE ts < NOW() - ($1 || ' seconds')::interval",
            )
            .bind(threshold_secs.to_string())
            .fetch_all(&pool)
            .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!(?e, "stale sweep query failed");
                    continue;
                }
            };
            for row in rows {
                let instance_id: Uuid = row.get("instance_id");
                tracing::debug!(%instance_id, "instance marked stale");
            }
        }
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub instance_id: Uuid,
    pub ts: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_used: i64,
    pub memory_total: i64,
    pub disk_used: i64,
    pub disk_total: i64,
    pub uptime_seconds: i64,
    pub load_avg_1: f64,
    pub load_avg_5: f64,
    pub load_avg_15: f64,
    pub net_bytes_sent: i64,
    pub net_bytes_recv: i64,
    pub process_count: i32,
}

fn row_to_heartbeat(row: &sqlx::postgres::PgRow) -> Heartbeat {
    Heartbeat {
        instance_id: row.get("instance_id"),
        ts: row.get("ts"),
        cpu_percent: row.get("cpu_percent"),
        memory_used: row.get("memory_used"),
        memory_total: row.get("memory_total"),
        disk_used: row.get("disk_used"),
        disk_total: row.get("disk_total"),
        uptime_seconds: row.get("uptime_seconds"),
        load_avg_1: row.get("load_avg_1"),
        load_avg_5: row.get("load_avg_5"),
        load_avg_15: row.get("load_avg_15"),
        net_bytes_sent: row.get("net_bytes_sent"),
        net_bytes_recv: row.get("net_bytes_recv"),
        process_count: row.get("process_count"),
    }
}

/// The single latest-heartbeat row kept per instance (§3), used for dashboards and
/// as the backing data for the `/processes` observability view — the protocol carries
/// no richer per-process listing than `process_count`.
pub async fn latest_heartbeat(pool: &PgPool, instance_id: Uuid) -> Result<Option<Heartbeat>, AppError> {
    let row = sqlx::query("SELECT * FROM latest_heartbeats WHERE instance_id = $1")
        .bind(instance_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Db)?;
    Ok(row.as_ref().map(row_to_heartbeat))
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub metadata: serde_json::Value,
}

pub async fn list_events(
    pool: &PgPool,
    instance_id: Uuid,
    limit: i64,
) -> Result<Vec<EventRecord>, AppError> {
    let rows = sqlx::query(
        "SELECT id, instance_id, ts, event_type, metadata FROM events \
         WHERE instance_id = $1 ORDER BY ts DESC LIMIT $2",
    )
    .bind(instance_id)
    .bind(limit.clamp(1, 1000))
    .fetch_all(pool)
    .await
    .map_err(AppError::Db)?;
    Ok(rows
        .into_iter()
        .map(|r| EventRecord {
            id: r.get("id"),
            instance_id: r.get("instance_id"),
            ts: r.get("ts"),
            event_type: r.get("event_type"),
            metadata: r.try_get("metadata").unwrap_or(json!({})),
        })
        .collect())
}

// --- HTTP handlers ---

/// `GET /api/v1/instances/:id/heartbeats` returns the latest cached heartbeat, not
/// a history — older samples live in `metric_samples`/`metric_rollups` and are read
/// through `timeseries::metrics_handler` instead.
pub async fn heartbeat_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(instance_id): Path<Uuid>,
) -> AppResult<Json<Option<Heartbeat>>> {
    Ok(Json(latest_heartbeat(&pool, instance_id).await?))
}

#[derive(Debug, Serialize)]
pub struct ProcessSummary {
    pub instance_id: Uuid,
    pub ts: DateTime<Utc>,
    pub process_count: i32,
}

pub async fn processes_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(instance_id): Path<Uuid>,
) -> AppResult<Json<Option<ProcessSummary>>> {
    let summary = latest_heartbeat(&pool, instance_id)
        .await?
        .map(|hb| ProcessSummary {
            instance_id: hb.instance_id,
            ts: hb.ts,
            process_count: hb.process_count,
        });
    Ok(Json(summary))
}

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

pub async fn events_handler(
    Extension(pool): Extension<PgPool>,
    _auth: AuthUser,
    Path(instance_id): Path<Uuid>,
    Query(params): Query<EventsQuery>,
) -> AppResult<Json<Vec<EventRecord>>> {
    Ok(Json(list_events(&pool, instance_id, params.limit.unwrap_or(100)).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_map_covers_all_metric_fields() {
        let payload = MetricPayload {
            cpu_percent: 10.0,
            memory_used: 1,
            memory_total: 2,
            disk_used: 1,
            disk_total: 2,
            uptime_seconds: 1,
            load_avg_1: 0.1,
            load_avg_5: 0.1,
            load_avg_15: 0.1,
            net_bytes_sent: 1,
            net_bytes_recv: 1,
        };
        let fields = field_map(&payload);
        assert_eq!(fields.len(), 11);
        assert_eq!(fields["cpu_percent"], 10.0);
    }
}
