//! Session manager (§4.2): agent links, viewer links, interactive sessions, and the
//! per-instance fan-out bus. Every registry is a `DashMap` partitioned by instance id
//! (or session id), mutated by a single owner, following the teacher's
//! `METRIC_CHANNELS`/`STATUS_CHANNELS` shape generalized from two fixed channels to
//! the full envelope-channel set.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::protocol::Envelope;

/// One entry per instance: the live agent link, if connected.
struct AgentLink {
    user_id: Uuid,
    sender: mpsc::Sender<Envelope>,
}

static AGENT_LINKS: Lazy<DashMap<Uuid, AgentLink>> = Lazy::new(DashMap::new);
/// Volatile online flag with a TTL refreshed by each heartbeat; not persisted.
static ONLINE: Lazy<DashMap<Uuid, Instant>> = Lazy::new(DashMap::new);
static FANOUT: Lazy<DashMap<Uuid, broadcast::Sender<Envelope>>> = Lazy::new(DashMap::new);

const ONLINE_TTL: Duration = Duration::from_secs(90);

/// Registers a new agent link for `instance_id`, displacing and returning the prior
/// link's sender (if any) so the caller can write its `DISCONNECT` event and close it.
/// "Newer wins" per §4.2.
pub fn register_agent(
    instance_id: Uuid,
    user_id: Uuid,
    sender: mpsc::Sender<Envelope>,
) -> Option<mpsc::Sender<Envelope>> {
    let previous = AGENT_LINKS.insert(instance_id, AgentLink { user_id, sender });
    mark_online(instance_id);
    previous.map(|p| p.sender)
}

pub fn unregister_agent(instance_id: Uuid) {
    AGENT_LINKS.remove(&instance_id);
}

pub fn agent_sender(instance_id: Uuid) -> Option<mpsc::Sender<Envelope>> {
    AGENT_LINKS.get(&instance_id).map(|l| l.sender.clone())
}

pub fn agent_owner(instance_id: Uuid) -> Option<Uuid> {
    AGENT_LINKS.get(&instance_id).map(|l| l.user_id)
}

pub fn mark_online(instance_id: Uuid) {
    ONLINE.insert(instance_id, Instant::now());
}

pub fn is_online(instance_id: Uuid) -> bool {
    ONLINE
        .get(&instance_id)
        .map(|t| t.elapsed() < ONLINE_TTL)
        .unwrap_or(false)
}

fn fanout_channel(instance_id: Uuid) -> broadcast::Sender<Envelope> {
    FANOUT
        .entry(instance_id)
        .or_insert_with(|| broadcast::channel(*crate::config::VIEWER_BUFFER_FRAMES).0)
        .clone()
}

/// Publishes a frame to every viewer subscribed to `instance_id`. Frames arrive in
/// publication order per instance; a lagging viewer's oldest buffered frames are
/// dropped by the underlying broadcast channel itself, matching the overflow policy
/// in §4.2 (the channel emits `RecvError::Lagged` to the reader, which records a
/// `log:dropped` sentinel — see `ws_terminal::viewer_stream`).
pub fn publish(instance_id: Uuid, envelope: Envelope) {
    let tx = fanout_channel(instance_id);
    let _ = tx.send(envelope);
}

pub fn subscribe(instance_id: Uuid) -> broadcast::Receiver<Envelope> {
    fanout_channel(instance_id).subscribe()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    Closed,
}

struct InteractiveSession {
    instance_id: Uuid,
    user_id: Uuid,
    status: TerminalStatus,
    cols: u32,
    rows: u32,
    pending: Vec<Envelope>,
    pending_bytes: usize,
}

const PENDING_BUFFER_CEILING: usize = 64 * 1024;

static SESSIONS: Lazy<DashMap<Uuid, InteractiveSession>> = Lazy::new(DashMap::new);

/// Opens a new interactive session in `connecting` state. Frames addressed to it
/// before `terminal:created` is observed are buffered (up to 64 KiB) by
/// `buffer_or_drop`, then dropped with an `ERROR` frame once the ceiling is hit.
pub fn open_session(instance_id: Uuid, user_id: Uuid, cols: u32, rows: u32) -> Uuid {
    let session_id = Uuid::new_v4();
    SESSIONS.insert(
        session_id,
        InteractiveSession {
            instance_id,
            user_id,
            status: TerminalStatus::Connecting,
            cols,
            rows,
            pending: Vec::new(),
            pending_bytes: 0,
        },
    );
    session_id
}

pub fn mark_connected(session_id: Uuid) -> Vec<Envelope> {
    if let Some(mut s) = SESSIONS.get_mut(&session_id) {
        s.status = TerminalStatus::Connected;
        std::mem::take(&mut s.pending)
    } else {
        Vec::new()
    }
}

/// Buffers `envelope` for a session not yet `connected`. Returns `Err` (ceiling
/// exceeded, caller should emit `ERROR` and drop) once 64 KiB of buffered frames
/// have accumulated.
pub fn buffer_or_drop(session_id: Uuid, envelope: Envelope) -> Result<(), ()> {
    let Some(mut s) = SESSIONS.get_mut(&session_id) else {
        return Err(());
    };
    if s.status == TerminalStatus::Connected {
        return Err(());
    }
    let size = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0);
    if s.pending_bytes + size > PENDING_BUFFER_CEILING {
        return Err(());
    }
    s.pending_bytes += size;
    s.pending.push(envelope);
    Ok(())
}

pub fn session_status(session_id: Uuid) -> Option<TerminalStatus> {
    SESSIONS.get(&session_id).map(|s| s.status)
}

pub fn session_instance(session_id: Uuid) -> Option<Uuid> {
    SESSIONS.get(&session_id).map(|s| s.instance_id)
}

pub fn session_owner(session_id: Uuid) -> Option<Uuid> {
    SESSIONS.get(&session_id).map(|s| s.user_id)
}

pub fn resize_session(session_id: Uuid, cols: u32, rows: u32) {
    if let Some(mut s) = SESSIONS.get_mut(&session_id) {
        s.cols = cols;
        s.rows = rows;
    }
}

/// Closes a session with the given status (`closed`, `disconnected`, or `error`) and
/// removes it from the partition. Callers persist the end state and emit the final
/// `terminal:close` to the peer before or after calling this.
pub fn close_session(session_id: Uuid, status: TerminalStatus) {
    if let Some(mut s) = SESSIONS.get_mut(&session_id) {
        s.status = status;
    }
    SESSIONS.remove(&session_id);
}

/// Sessions belonging to a broadcast group (§4.2 "Broadcast input"): an input frame
/// replicates to each member whose status is `connected`, skipping the rest silently.
pub fn connected_members(session_ids: &[Uuid]) -> Vec<Uuid> {
    session_ids
        .iter()
        .copied()
        .filter(|id| session_status(*id) == Some(TerminalStatus::Connected))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displaced_agent_link_is_returned() {
        let instance = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        assert!(register_agent(instance, Uuid::new_v4(), tx1).is_none());
        let displaced = register_agent(instance, Uuid::new_v4(), tx2);
        assert!(displaced.is_some());
        unregister_agent(instance);
    }

    #[test]
    fn session_buffers_until_connected_then_flushes() {
        let session = open_session(Uuid::new_v4(), Uuid::new_v4(), 80, 24);
        let env = Envelope::new("terminal", "terminal:data", 1, serde_json::json!({"b":"AA=="}));
        assert!(buffer_or_drop(session, env.clone()).is_ok());
        let flushed = mark_connected(session);
        assert_eq!(flushed.len(), 1);
        // after connected, buffering is no longer accepted (frames go live instead)
        assert!(buffer_or_drop(session, env).is_err());
        close_session(session, TerminalStatus::Closed);
    }

    #[test]
    fn broadcast_group_skips_non_connected_members() {
        let a = open_session(Uuid::new_v4(), Uuid::new_v4(), 80, 24);
        let b = open_session(Uuid::new_v4(), Uuid::new_v4(), 80, 24);
        mark_connected(a);
        let members = connected_members(&[a, b]);
        assert_eq!(members, vec![a]);
        close_session(a, TerminalStatus::Closed);
        close_session(b, TerminalStatus::Closed);
    }
}
