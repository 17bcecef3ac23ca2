//! `/ws/agent` handshake and frame relay (§4.2, §6). Grounded on the teacher's
//! `servers.rs` SSE handlers (`stream_metrics`/`stream_status`), generalized
//! from a one-way `Sse` stream to a bidirectional `axum::extract::ws` socket.

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::Extension,
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::extractor::resolve_api_key;
use crate::ingestion;
use crate::protocol::{self, Envelope};
use crate::session;

const CLOSE_UNAUTHORIZED: u16 = 1008;
const CLOSE_INVALID_KEY: u16 = 4001;

fn extract_raw_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn extract_instance_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("X-Instance-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
}

pub async fn handler(
    ws: WebSocketUpgrade,
    Extension(pool): Extension<PgPool>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let raw_key = extract_raw_key(&headers);
    let instance_id = extract_instance_id(&headers);

    ws.on_upgrade(move |socket| async move {
        handle_agent_socket(socket, pool, raw_key, instance_id).await;
    })
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_agent_socket(
    mut socket: WebSocket,
    pool: PgPool,
    raw_key: Option<String>,
    instance_id: Option<Uuid>,
) {
    let Some(raw_key) = raw_key else {
        close_with(&mut socket, CLOSE_UNAUTHORIZED, "missing X-Api-Key").await;
        return;
    };
    let Some(instance_id) = instance_id else {
        close_with(&mut socket, CLOSE_UNAUTHORIZED, "missing X-Instance-ID").await;
        return;
    };
    let auth = match resolve_api_key(&pool, &raw_key).await {
        Ok(auth) => auth,
        Err(_) => {
            close_with(&mut socket, CLOSE_INVALID_KEY, "invalid or expired key").await;
            return;
        }
    };

    let (tx, mut outbound_rx) = tokio::sync::mpsc::channel::<Envelope>(*crate::config::VIEWER_BUFFER_FRAMES);
    if let Some(displaced) = session::register_agent(instance_id, auth.user_id, tx) {
        let disconnect = Envelope::new(
            "events",
            "event:disconnect",
            Utc::now().timestamp_millis(),
            serde_json::json!({ "reason": "superseded by newer agent link" }),
        );
        let _ = displaced.send(disconnect).await;
    }
    session::mark_online(instance_id);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match handle_agent_frame(&pool, instance_id, &text).await {
                            Ok(Some(reply)) => {
                                if let Ok(text) = serde_json::to_string(&reply) {
                                    if socket.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Ok(None) => {}
                            Err(err) => {
                                let frame = Envelope::error(&err, None, Utc::now().timestamp_millis());
                                let _ = socket.send(Message::Text(serde_json::to_string(&frame).unwrap_or_default())).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            relayed = outbound_rx.recv() => {
                match relayed {
                    Some(envelope) => {
                        if let Ok(text) = serde_json::to_string(&envelope) {
                            if socket.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    session::unregister_agent(instance_id);
}

/// Dispatches one parsed frame from an agent link to the ingestion pipeline,
/// keyed by channel: `heartbeat`/`metrics`/`logs`/`events` persist and
/// fan out; `commands` responses are relayed back to the issuing viewer (not
/// modeled further — command issuance is viewer-initiated and out of scope
/// for the agent link itself). Returns a reply envelope for the caller to
/// send back on the agent's own socket (currently only `heartbeat:pong`).
async fn handle_agent_frame(
    pool: &PgPool,
    instance_id: Uuid,
    text: &str,
) -> Result<Option<Envelope>, AppError> {
    let envelope = protocol::parse_envelope(text)?;
    let ts = Utc::now();
    let mut reply = None;
    match envelope.channel.as_str() {
        "heartbeat" => {
            let payload: protocol::HeartbeatPayload = serde_json::from_value(envelope.data.clone())
                .map_err(|e| AppError::MalformedFrame(e.to_string()))?;
            protocol::validate_heartbeat(&payload)?;
            ingestion::ingest_heartbeat(pool, instance_id, ts, &payload).await?;
            session::mark_online(instance_id);
            let correlation_id = envelope.correlation_id.clone();
            let pong_ts = ts.timestamp_millis().max(envelope.ts);
            session::publish(instance_id, envelope);
            reply = Some(
                Envelope::new("heartbeat", "heartbeat:pong", pong_ts, serde_json::json!({}))
                    .with_correlation(correlation_id),
            );
        }
        "metrics" => {
            let payload: protocol::MetricPayload = serde_json::from_value(envelope.data.clone())
                .map_err(|e| AppError::MalformedFrame(e.to_string()))?;
            protocol::validate_metric(&payload)?;
            ingestion::ingest_metric_sample(pool, instance_id, ts, &payload).await?;
            session::publish(instance_id, envelope);
        }
        "logs" => {
            let line: protocol::LogLine = serde_json::from_value(envelope.data.clone())
                .map_err(|e| AppError::MalformedFrame(e.to_string()))?;
            ingestion::ingest_logs(pool, instance_id, &[line]).await?;
            session::publish(instance_id, envelope);
        }
        "events" => {
            ingestion::ingest_event(pool, instance_id, &envelope.kind, ts, envelope.data.clone()).await?;
            session::publish(instance_id, envelope);
        }
        "terminal" => {
            session::publish(instance_id, envelope);
        }
        other => {
            return Err(AppError::MalformedFrame(format!("unexpected channel on agent link: {other}")));
        }
    }
    Ok(reply)
}
