//! Framed bidirectional message protocol (§4.1). The wire envelope is parsed once
//! into a tagged-variant `Frame` keyed by `(channel, type)`; no payload is parsed
//! twice, per the Design Notes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub channel: Option<Value>,
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    pub ts: Option<Value>,
    pub data: Option<Value>,
    #[serde(rename = "instanceId")]
    pub instance_id: Option<String>,
    #[serde(rename = "correlationId")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ts: i64,
    pub data: Value,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(rename = "correlationId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(channel: &str, kind: &str, ts: i64, data: Value) -> Self {
        Envelope {
            channel: channel.to_string(),
            kind: kind.to_string(),
            ts,
            data,
            instance_id: None,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_instance(mut self, instance_id: Option<String>) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn error(err: &AppError, correlation_id: Option<String>, ts: i64) -> Self {
        Envelope::new("error", "error", ts, crate::error::frame_error_payload(err))
            .with_correlation(correlation_id)
    }
}

/// Total parser: bytes in, either a validated `Envelope` or a `MalformedFrame`
/// error. Never retains the raw `Value` past this call.
pub fn parse_envelope(bytes: &str) -> Result<Envelope, AppError> {
    let raw: RawEnvelope = serde_json::from_str(bytes)
        .map_err(|e| AppError::MalformedFrame(format!("invalid JSON: {e}")))?;

    let channel = match raw.channel {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(AppError::MalformedFrame("missing or empty channel".into())),
    };
    let kind = match raw.kind {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(AppError::MalformedFrame("missing or empty type".into())),
    };
    let ts = match raw.ts {
        Some(Value::Number(n)) if n.as_f64().map(|f| f.is_finite()).unwrap_or(false) => {
            n.as_i64().unwrap_or_else(|| n.as_f64().unwrap() as i64)
        }
        _ => return Err(AppError::MalformedFrame("ts must be a finite number".into())),
    };
    let data = raw.data.ok_or_else(|| AppError::MalformedFrame("missing data".into()))?;

    if !VALID_CHANNELS.contains(&channel.as_str()) {
        return Err(AppError::MalformedFrame(format!("unknown channel '{channel}'")));
    }

    Ok(Envelope {
        channel,
        kind,
        ts,
        data,
        instance_id: raw.instance_id,
        correlation_id: raw.correlation_id,
    })
}

const VALID_CHANNELS: &[&str] = &[
    "heartbeat",
    "metrics",
    "logs",
    "terminal",
    "events",
    "commands",
];

/// Heartbeat payload, `heartbeat:ping` / the latest-heartbeat cache row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "cpuPercent")]
    pub cpu_percent: f64,
    #[serde(rename = "memoryUsed")]
    pub memory_used: u64,
    #[serde(rename = "memoryTotal")]
    pub memory_total: u64,
    #[serde(rename = "diskUsed")]
    pub disk_used: u64,
    #[serde(rename = "diskTotal")]
    pub disk_total: u64,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
    #[serde(rename = "loadAvg1")]
    pub load_avg_1: f64,
    #[serde(rename = "loadAvg5")]
    pub load_avg_5: f64,
    #[serde(rename = "loadAvg15")]
    pub load_avg_15: f64,
    #[serde(rename = "netBytesSent")]
    pub net_bytes_sent: u64,
    #[serde(rename = "netBytesRecv")]
    pub net_bytes_recv: u64,
    #[serde(rename = "processCount")]
    pub process_count: u32,
}

/// Metric sample payload: same fields as heartbeat minus `process_count`.
pub type MetricPayload = HeartbeatPayloadSansProcessCount;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayloadSansProcessCount {
    #[serde(rename = "cpuPercent")]
    pub cpu_percent: f64,
    #[serde(rename = "memoryUsed")]
    pub memory_used: u64,
    #[serde(rename = "memoryTotal")]
    pub memory_total: u64,
    #[serde(rename = "diskUsed")]
    pub disk_used: u64,
    #[serde(rename = "diskTotal")]
    pub disk_total: u64,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
    #[serde(rename = "loadAvg1")]
    pub load_avg_1: f64,
    #[serde(rename = "loadAvg5")]
    pub load_avg_5: f64,
    #[serde(rename = "loadAvg15")]
    pub load_avg_15: f64,
    #[serde(rename = "netBytesSent")]
    pub net_bytes_sent: u64,
    #[serde(rename = "netBytesRecv")]
    pub net_bytes_recv: u64,
}

/// Validates the numeric bounds named in §4.1: `cpuPercent ∈ [0,100]`,
/// `memory_total > 0`.
pub fn validate_heartbeat(payload: &HeartbeatPayload) -> Result<(), AppError> {
    let mut details = Vec::new();
    if !(0.0..=100.0).contains(&payload.cpu_percent) {
        details.push("cpuPercent out of range".to_string());
    }
    if payload.memory_total == 0 {
        details.push("memory_total must be > 0".to_string());
    }
    if payload.disk_total == 0 {
        details.push("disk_total must be > 0".to_string());
    }
    if !details.is_empty() {
        return Err(AppError::Validation { details });
    }
    Ok(())
}

pub fn validate_metric(payload: &MetricPayload) -> Result<(), AppError> {
    let mut details = Vec::new();
    if !(0.0..=100.0).contains(&payload.cpu_percent) {
        details.push("cpuPercent out of range".to_string());
    }
    if payload.memory_total == 0 {
        details.push("memory_total must be > 0".to_string());
    }
    if !details.is_empty() {
        return Err(AppError::Validation { details });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalCreatePayload {
    pub cols: u32,
    pub rows: u32,
}

/// Minimum terminal dimensions from §4.1/§4.2: `cols ≥ 10`, `rows ≥ 1`.
pub fn validate_terminal_create(payload: &TerminalCreatePayload) -> Result<(), AppError> {
    let mut details = Vec::new();
    if payload.cols < 10 {
        details.push("cols must be >= 10".to_string());
    }
    if payload.rows < 1 {
        details.push("rows must be >= 1".to_string());
    }
    if !details.is_empty() {
        return Err(AppError::Validation { details });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub level: String,
    pub source: String,
    pub message: String,
    pub metadata: Option<Value>,
    pub ts: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_heartbeat_envelope() {
        let raw = r#"{"channel":"heartbeat","type":"heartbeat:ping","ts":1000,"data":{"uptime":1},"correlationId":"c1"}"#;
        let env = parse_envelope(raw).unwrap();
        assert_eq!(env.channel, "heartbeat");
        assert_eq!(env.kind, "heartbeat:ping");
        assert_eq!(env.correlation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn rejects_missing_channel() {
        let raw = r#"{"type":"heartbeat:ping","ts":1000,"data":{}}"#;
        let err = parse_envelope(raw).unwrap_err();
        assert_eq!(err.code(), "MALFORMED");
    }

    #[test]
    fn rejects_empty_channel() {
        let raw = r#"{"channel":"","type":"x","ts":1000,"data":{}}"#;
        assert!(parse_envelope(raw).is_err());
    }

    #[test]
    fn rejects_non_finite_ts() {
        let raw = r#"{"channel":"heartbeat","type":"x","ts":"not-a-number","data":{}}"#;
        assert!(parse_envelope(raw).is_err());
    }

    #[test]
    fn rejects_unknown_channel() {
        let raw = r#"{"channel":"bogus","type":"x","ts":1,"data":{}}"#;
        assert!(parse_envelope(raw).is_err());
    }

    #[test]
    fn round_trips_structured_payload() {
        let env = Envelope::new("events", "event:deploy", 42, serde_json::json!({"a":1}))
            .with_instance(Some("inst-1".into()));
        let encoded = serde_json::to_string(&env).unwrap();
        let decoded: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn rejects_out_of_range_cpu_percent() {
        let payload = HeartbeatPayload {
            cpu_percent: 150.0,
            memory_used: 1,
            memory_total: 10,
            disk_used: 1,
            disk_total: 10,
            uptime_seconds: 1,
            load_avg_1: 0.1,
            load_avg_5: 0.1,
            load_avg_15: 0.1,
            net_bytes_sent: 0,
            net_bytes_recv: 0,
            process_count: 1,
        };
        assert!(validate_heartbeat(&payload).is_err());
    }

    #[test]
    fn rejects_terminal_below_minimum_dimensions() {
        assert!(validate_terminal_create(&TerminalCreatePayload { cols: 5, rows: 1 }).is_err());
        assert!(validate_terminal_create(&TerminalCreatePayload { cols: 80, rows: 0 }).is_err());
        assert!(validate_terminal_create(&TerminalCreatePayload { cols: 80, rows: 24 }).is_ok());
    }
}
