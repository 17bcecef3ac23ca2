//! `/ws/terminal/:instanceId` viewer handshake, telemetry fan-out relay, and
//! interactive terminal session multiplexing (§4.2). Same grounding as
//! `ws_agent.rs`: the teacher's `servers.rs::stream_status`/`stream_metrics`
//! SSE handlers, generalized to a bidirectional socket.

use axum::{
    extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    extract::{Extension, Path},
    http::HeaderMap,
    response::IntoResponse,
};
use base64::Engine;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::extractor::{resolve_api_key, AuthUser};
use crate::instances;
use crate::protocol::{self, Envelope};
use crate::rbac::{self, perm};
use crate::session::{self, TerminalStatus};

const CLOSE_UNAUTHORIZED: u16 = 1008;
const CLOSE_INVALID_KEY: u16 = 4001;
const CLOSE_ROLE_DENIED: u16 = 4003;

pub async fn handler(
    ws: WebSocketUpgrade,
    Extension(pool): Extension<PgPool>,
    Path(instance_id): Path<Uuid>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let raw_key = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    ws.on_upgrade(move |socket| async move {
        handle_viewer_socket(socket, pool, instance_id, raw_key).await;
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

async fn handle_viewer_socket(
    mut socket: WebSocket,
    pool: PgPool,
    instance_id: Uuid,
    raw_key: Option<String>,
) {
    let Some(raw_key) = raw_key else {
        close_with(&mut socket, CLOSE_UNAUTHORIZED, "missing Authorization header").await;
        return;
    };
    let auth = match resolve_api_key(&pool, &raw_key).await {
        Ok(auth) => auth,
        Err(_) => {
            close_with(&mut socket, CLOSE_INVALID_KEY, "invalid or expired key").await;
            return;
        }
    };

    if !authorize_delivery(&pool, &auth, instance_id).await {
        close_with(&mut socket, CLOSE_ROLE_DENIED, "forbidden").await;
        return;
    }

    let mut fanout = session::subscribe(instance_id);
    let mut active_session: Option<Uuid> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match handle_viewer_frame(&pool, &auth, instance_id, &mut active_session, &text).await {
                            Ok(Some(reply)) => {
                                let _ = socket.send(Message::Text(serde_json::to_string(&reply).unwrap_or_default())).await;
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
            fanned = fanout.recv() => {
                match fanned {
                    Ok(envelope) => {
                        // Re-authorize at delivery time (§4.2): mid-session revocation
                        // takes effect within one frame.
                        if !authorize_delivery(&pool, &auth, instance_id).await {
                            close_with(&mut socket, CLOSE_ROLE_DENIED, "access revoked").await;
                            break;
                        }
                        if let Ok(text) = serde_json::to_string(&envelope) {
                            if socket.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        let dropped = Envelope::new(
                            "logs",
                            "log:dropped",
                            Utc::now().timestamp_millis(),
                            serde_json::json!({ "reason": "viewer buffer overflow" }),
                        );
                        if let Ok(text) = serde_json::to_string(&dropped) {
                            let _ = socket.send(Message::Text(text)).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if let Some(session_id) = active_session {
        session::close_session(session_id, TerminalStatus::Disconnected);
        let closing = Envelope::new(
            "terminal",
            "terminal:close",
            Utc::now().timestamp_millis(),
            serde_json::json!({ "reason": "client gone" }),
        );
        if let Some(sender) = session::agent_sender(instance_id) {
            let _ = sender.send(closing).await;
        }
    }
}

async fn authorize_delivery(pool: &PgPool, auth: &AuthUser, instance_id: Uuid) -> bool {
    if !rbac::can_perform(auth.role, perm::INSTANCES_CONNECT) {
        return false;
    }
    match instances::get(pool, instance_id).await {
        Ok(instance) => rbac::in_scope(auth.role, &auth.team_ids, instance.team_id),
        Err(_) => false,
    }
}

/// Handles one frame from the viewer: `terminal:create` opens a session against
/// the instance's agent link, `terminal:data`/`terminal:resize`/`terminal:close`
/// address an existing session, everything else is relayed as a command.
async fn handle_viewer_frame(
    pool: &PgPool,
    auth: &AuthUser,
    instance_id: Uuid,
    active_session: &mut Option<Uuid>,
    text: &str,
) -> Result<Option<Envelope>, AppError> {
    let envelope = protocol::parse_envelope(text)?;
    match envelope.kind.as_str() {
        "terminal:create" => {
            let payload: protocol::TerminalCreatePayload = serde_json::from_value(envelope.data.clone())
                .map_err(|e| AppError::MalformedFrame(e.to_string()))?;
            protocol::validate_terminal_create(&payload)?;
            if !session::is_online(instance_id) {
                return Err(AppError::InvalidState("instance offline".to_string()));
            }
            let session_id = session::open_session(instance_id, auth.user_id, payload.cols, payload.rows);
            *active_session = Some(session_id);
            relay_to_agent(pool, instance_id, envelope).await?;
            Ok(Some(Envelope::new(
                "terminal",
                "terminal:created",
                Utc::now().timestamp_millis(),
                serde_json::json!({ "sessionId": session_id }),
            )))
        }
        "terminal:resize" => {
            if let Some(session_id) = active_session {
                let payload: protocol::TerminalCreatePayload = serde_json::from_value(envelope.data.clone())
                    .map_err(|e| AppError::MalformedFrame(e.to_string()))?;
                protocol::validate_terminal_create(&payload)?;
                session::resize_session(*session_id, payload.cols, payload.rows);
            }
            relay_to_agent(pool, instance_id, envelope).await?;
            Ok(None)
        }
        "terminal:data" => {
            relay_to_agent(pool, instance_id, envelope).await?;
            Ok(None)
        }
        "terminal:close" => {
            if let Some(session_id) = active_session.take() {
                session::close_session(session_id, TerminalStatus::Closed);
            }
            relay_to_agent(pool, instance_id, envelope).await?;
            Ok(None)
        }
        _ => {
            relay_to_agent(pool, instance_id, envelope).await?;
            Ok(None)
        }
    }
}

async fn relay_to_agent(_pool: &PgPool, instance_id: Uuid, envelope: Envelope) -> Result<(), AppError> {
    let Some(sender) = session::agent_sender(instance_id) else {
        return Err(AppError::InvalidState("instance offline".to_string()));
    };
    sender
        .send(envelope)
        .await
        .map_err(|_| AppError::InvalidState("agent link closed".to_string()))
}

/// Decodes a base64 terminal data payload (§4.1 `{"b": "<base64>"}`); used by
/// handlers that need the raw bytes rather than the opaque frame.
pub fn decode_terminal_payload(data: &serde_json::Value) -> Result<Vec<u8>, AppError> {
    let encoded = data
        .get("b")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::MalformedFrame("missing terminal data field `b`".to_string()))?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| AppError::MalformedFrame(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_base64_payload() {
        let data = serde_json::json!({ "b": "aGVsbG8=" });
        let decoded = decode_terminal_payload(&data).unwrap();
        assert_eq!(decoded, b"hello");
    }

    #[test]
    fn rejects_missing_field() {
        let data = serde_json::json!({});
        assert!(decode_terminal_payload(&data).is_err());
    }
}
