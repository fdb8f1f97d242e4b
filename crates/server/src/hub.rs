//! Signaling hub: peer registry, session pairing, and rooms.
//!
//! The protocol is line-oriented text over WebSocket. A peer registers with
//! `HELLO <uid> [<meta-b64>]`, then either pairs with another peer via
//! `SESSION <callee>` (after which every text frame is relayed verbatim to
//! the partner) or joins a named room. Protocol violations close the socket
//! with code 1002.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// Close code for protocol violations.
const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// What the hub asks a peer's socket task to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Send(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerStatus {
    Idle,
    InSession,
    InRoom(String),
}

struct PeerEntry {
    addr: String,
    status: PeerStatus,
    /// Opaque base64 JSON blob from HELLO, returned verbatim in SESSION_OK.
    meta_b64: Option<String>,
    tx: UnboundedSender<Directive>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<String, PeerEntry>,
    /// Bidirectional pairing: `sessions[u] = v` implies `sessions[v] = u`.
    sessions: HashMap<String, String>,
    rooms: HashMap<String, HashSet<String>>,
}

/// Registry of connected peers, their sessions, and rooms. All tables are
/// owned here; socket tasks only exchange [`Directive`]s with the hub.
pub struct Hub {
    state: Mutex<HubState>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    InvalidUid,
    DuplicateUid,
}

/// A valid UID is non-empty and contains no whitespace.
pub fn valid_uid(uid: &str) -> bool {
    !uid.is_empty() && !uid.contains(char::is_whitespace)
}

/// A valid room name is a single whitespace-free token and never the
/// literal `session` (which is reserved for pairing status).
pub fn valid_room_id(room_id: &str) -> bool {
    room_id != "session" && valid_uid(room_id)
}

impl Hub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
        }
    }

    pub async fn register(
        &self,
        uid: &str,
        addr: &str,
        meta_b64: Option<String>,
        tx: UnboundedSender<Directive>,
    ) -> Result<(), RegisterError> {
        if !valid_uid(uid) {
            return Err(RegisterError::InvalidUid);
        }
        let mut state = self.state.lock().await;
        if state.peers.contains_key(uid) {
            return Err(RegisterError::DuplicateUid);
        }
        info!(uid, addr, has_meta = meta_b64.is_some(), "Registered peer");
        state.peers.insert(
            uid.to_string(),
            PeerEntry {
                addr: addr.to_string(),
                status: PeerStatus::Idle,
                meta_b64,
                tx,
            },
        );
        Ok(())
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Handle one inbound text frame from a registered peer.
    pub async fn handle_message(&self, uid: &str, msg: &str) {
        let mut state = self.state.lock().await;
        let status = match state.peers.get(uid) {
            Some(peer) => peer.status.clone(),
            None => return,
        };
        match status {
            PeerStatus::InSession => state.relay_to_partner(uid, msg),
            PeerStatus::InRoom(room_id) => state.handle_room_message(uid, &room_id, msg),
            PeerStatus::Idle => {
                if let Some(callee) = msg.strip_prefix("SESSION ") {
                    state.start_session(uid, callee.trim());
                } else if let Some(room_id) = msg.strip_prefix("ROOM ") {
                    state.join_room(uid, room_id.trim());
                } else {
                    debug!(uid, msg, "Ignoring unknown message from idle peer");
                }
            }
        }
    }

    /// Remove a peer on disconnect: tear down its session (closing the
    /// partner's socket to force a state reset) and announce its departure
    /// to any room.
    pub async fn remove_peer(&self, uid: &str) {
        let mut state = self.state.lock().await;
        state.cleanup_session(uid);
        if let Some(peer) = state.peers.remove(uid) {
            if let PeerStatus::InRoom(room_id) = peer.status {
                state.cleanup_room(uid, &room_id);
            }
            info!(uid, addr = %peer.addr, "Disconnected peer");
        }
    }

    #[cfg(test)]
    async fn session_partner(&self, uid: &str) -> Option<String> {
        self.state.lock().await.sessions.get(uid).cloned()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    fn send_to(&self, uid: &str, msg: String) {
        if let Some(peer) = self.peers.get(uid) {
            let _ = peer.tx.send(Directive::Send(msg));
        }
    }

    fn relay_to_partner(&self, uid: &str, msg: &str) {
        if let Some(other) = self.sessions.get(uid) {
            debug!(from = uid, to = %other, "Relaying session message");
            self.send_to(other, msg.to_string());
        }
    }

    fn start_session(&mut self, uid: &str, callee: &str) {
        if !self.peers.contains_key(callee) {
            self.send_to(uid, format!("ERROR peer '{callee}' not found"));
            return;
        }
        let caller_busy = self
            .peers
            .get(uid)
            .map(|p| p.status != PeerStatus::Idle)
            .unwrap_or(true);
        let callee_busy = self
            .peers
            .get(callee)
            .map(|p| p.status != PeerStatus::Idle)
            .unwrap_or(true);
        if caller_busy || callee_busy || callee == uid {
            self.send_to(uid, format!("ERROR peer '{callee}' busy"));
            return;
        }

        let meta = self
            .peers
            .get(callee)
            .and_then(|p| p.meta_b64.clone())
            .unwrap_or_default();
        let reply = if meta.is_empty() {
            "SESSION_OK".to_string()
        } else {
            format!("SESSION_OK {meta}")
        };
        self.send_to(uid, reply);

        info!(caller = uid, callee, "Session established");
        self.sessions.insert(uid.to_string(), callee.to_string());
        self.sessions.insert(callee.to_string(), uid.to_string());
        if let Some(peer) = self.peers.get_mut(uid) {
            peer.status = PeerStatus::InSession;
        }
        if let Some(peer) = self.peers.get_mut(callee) {
            peer.status = PeerStatus::InSession;
        }
    }

    fn join_room(&mut self, uid: &str, room_id: &str) {
        if !valid_room_id(room_id) {
            self.send_to(uid, format!("ERROR invalid room id '{room_id}'"));
            return;
        }
        let members = self.rooms.entry(room_id.to_string()).or_default().clone();

        let roster: Vec<&str> = members.iter().map(String::as_str).collect();
        self.send_to(uid, format!("ROOM_OK {}", roster.join(" ")));

        info!(uid, room_id, "Peer joined room");
        self.rooms
            .get_mut(room_id)
            .map(|m| m.insert(uid.to_string()));
        if let Some(peer) = self.peers.get_mut(uid) {
            peer.status = PeerStatus::InRoom(room_id.to_string());
        }
        for member in &members {
            self.send_to(member, format!("ROOM_PEER_JOINED {uid}"));
        }
    }

    fn handle_room_message(&mut self, uid: &str, room_id: &str, msg: &str) {
        if let Some(rest) = msg.strip_prefix("ROOM_PEER_MSG ") {
            let Some((other, payload)) = rest.split_once(' ') else {
                self.send_to(uid, "ERROR invalid ROOM_PEER_MSG".to_string());
                return;
            };
            if !self.peers.contains_key(other) {
                self.send_to(uid, format!("ERROR peer '{other}' not found"));
                return;
            }
            let in_same_room = self
                .peers
                .get(other)
                .map(|p| p.status == PeerStatus::InRoom(room_id.to_string()))
                .unwrap_or(false);
            if !in_same_room {
                self.send_to(uid, format!("ERROR peer '{other}' is not in the room"));
                return;
            }
            self.send_to(other, format!("ROOM_PEER_MSG {uid} {payload}"));
        } else if msg == "ROOM_PEER_LIST" {
            let roster: Vec<&str> = self
                .rooms
                .get(room_id)
                .map(|members| {
                    members
                        .iter()
                        .filter(|m| m.as_str() != uid)
                        .map(String::as_str)
                        .collect()
                })
                .unwrap_or_default();
            self.send_to(uid, format!("ROOM_PEER_LIST {}", roster.join(" ")));
        } else {
            self.send_to(uid, "ERROR invalid msg, already in room".to_string());
        }
    }

    /// Drop the session pairing for `uid`. The partner's socket is closed so
    /// its client resets cleanly rather than waiting on a dead pairing.
    fn cleanup_session(&mut self, uid: &str) {
        if let Some(other) = self.sessions.remove(uid) {
            info!(uid, "Cleaned up session");
            if self.sessions.remove(&other).is_some() {
                if let Some(peer) = self.peers.remove(&other) {
                    info!(other = %other, "Closing partner connection");
                    let _ = peer.tx.send(Directive::Close);
                }
            }
        }
    }

    fn cleanup_room(&mut self, uid: &str, room_id: &str) {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return;
        };
        if !members.remove(uid) {
            return;
        }
        let remaining: Vec<String> = members.iter().cloned().collect();
        for member in remaining {
            self.send_to(&member, format!("ROOM_PEER_LEFT {uid}"));
        }
    }
}

/// Wait for the next text frame, sending a WebSocket ping whenever
/// `keepalive` elapses without traffic so stateful middleboxes keep the
/// connection alive. Returns `None` when the socket closes or errors.
async fn recv_text_with_ping(
    socket: &mut WebSocket,
    keepalive: Duration,
) -> Option<Utf8Bytes> {
    loop {
        match timeout(keepalive, socket.recv()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => return None,
            Err(_) => {
                debug!("Keepalive timeout, sending ping");
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    return None;
                }
            }
        }
    }
}

async fn close_with(socket: &mut WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_PROTOCOL_ERROR,
            reason: reason.into(),
        })))
        .await;
}

/// Drive one peer's WebSocket connection: HELLO registration, then the
/// message loop until disconnect.
pub async fn handle_socket(
    mut socket: WebSocket,
    addr: String,
    hub: Arc<Hub>,
    keepalive: Duration,
) {
    debug!(%addr, "WebSocket connected");

    let Some(hello) = recv_text_with_ping(&mut socket, keepalive).await else {
        return;
    };
    let mut toks = hello.splitn(3, ' ');
    if toks.next() != Some("HELLO") {
        warn!(%addr, "Invalid hello");
        close_with(&mut socket, "invalid protocol").await;
        return;
    }
    let Some(uid) = toks.next().map(str::to_string) else {
        close_with(&mut socket, "invalid protocol").await;
        return;
    };
    let meta_b64 = toks.next().map(str::to_string);

    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(e) = hub.register(&uid, &addr, meta_b64, tx).await {
        warn!(%addr, uid, ?e, "Rejected peer registration");
        close_with(&mut socket, "invalid peer uid").await;
        return;
    }

    if socket.send(Message::Text("HELLO".into())).await.is_err() {
        hub.remove_peer(&uid).await;
        return;
    }

    run_peer_loop(&mut socket, &uid, &hub, rx, keepalive).await;
    hub.remove_peer(&uid).await;
}

async fn run_peer_loop(
    socket: &mut WebSocket,
    uid: &str,
    hub: &Arc<Hub>,
    mut rx: UnboundedReceiver<Directive>,
    keepalive: Duration,
) {
    loop {
        tokio::select! {
            directive = rx.recv() => match directive {
                Some(Directive::Send(msg)) => {
                    if socket.send(Message::Text(msg.into())).await.is_err() {
                        return;
                    }
                }
                Some(Directive::Close) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            },
            received = timeout(keepalive, socket.recv()) => match received {
                Ok(Some(Ok(Message::Text(text)))) => {
                    hub.handle_message(uid, &text).await;
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    debug!(uid, "WebSocket error: {e}");
                    return;
                }
                Err(_) => {
                    debug!(uid, "Keepalive timeout, sending ping");
                    if socket.send(Message::Ping(vec![].into())).await.is_err() {
                        return;
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn register(hub: &Hub, uid: &str, meta: Option<&str>) -> UnboundedReceiver<Directive> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(uid, "127.0.0.1:1", meta.map(str::to_string), tx)
            .await
            .unwrap();
        rx
    }

    fn next(rx: &mut UnboundedReceiver<Directive>) -> Directive {
        rx.try_recv().expect("expected a directive")
    }

    #[test]
    fn uid_validation() {
        assert!(valid_uid("peer-1"));
        assert!(!valid_uid(""));
        assert!(!valid_uid("has space"));
        assert!(!valid_uid("tab\there"));
    }

    #[test]
    fn room_id_validation() {
        assert!(valid_room_id("lobby"));
        assert!(!valid_room_id("session"));
        assert!(!valid_room_id("two words"));
        assert!(!valid_room_id(""));
    }

    #[tokio::test]
    async fn duplicate_uid_rejected() {
        let hub = Hub::new();
        let _rx = register(&hub, "A", None).await;
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert_eq!(
            hub.register("A", "127.0.0.1:2", None, tx).await,
            Err(RegisterError::DuplicateUid)
        );
    }

    #[tokio::test]
    async fn session_pairing_is_symmetric() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let _b = register(&hub, "B", None).await;

        hub.handle_message("A", "SESSION B").await;
        assert_eq!(next(&mut a), Directive::Send("SESSION_OK".into()));
        assert_eq!(hub.session_partner("A").await.as_deref(), Some("B"));
        assert_eq!(hub.session_partner("B").await.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn session_ok_carries_callee_meta() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let _b = register(&hub, "B", Some("eyJyZXMiOiIxOTIweDEwODAifQ==")).await;

        hub.handle_message("A", "SESSION B").await;
        assert_eq!(
            next(&mut a),
            Directive::Send("SESSION_OK eyJyZXMiOiIxOTIweDEwODAifQ==".into())
        );
    }

    #[tokio::test]
    async fn session_with_unknown_peer_errors() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        hub.handle_message("A", "SESSION nobody").await;
        assert_eq!(
            next(&mut a),
            Directive::Send("ERROR peer 'nobody' not found".into())
        );
    }

    #[tokio::test]
    async fn session_with_busy_peer_errors() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let _b = register(&hub, "B", None).await;
        let mut c = register(&hub, "C", None).await;

        hub.handle_message("A", "SESSION B").await;
        let _ = next(&mut a);
        hub.handle_message("C", "SESSION B").await;
        assert_eq!(next(&mut c), Directive::Send("ERROR peer 'B' busy".into()));
    }

    #[tokio::test]
    async fn in_session_text_relays_verbatim() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let mut b = register(&hub, "B", None).await;

        hub.handle_message("A", "SESSION B").await;
        let _ = next(&mut a);

        hub.handle_message("A", r#"{"sdp": {"type": "offer", "sdp": "v=0"}}"#)
            .await;
        assert_eq!(
            next(&mut b),
            Directive::Send(r#"{"sdp": {"type": "offer", "sdp": "v=0"}}"#.into())
        );
    }

    #[tokio::test]
    async fn disconnect_cleans_both_sides_and_closes_partner() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let mut b = register(&hub, "B", None).await;

        hub.handle_message("A", "SESSION B").await;
        let _ = next(&mut a);

        hub.remove_peer("A").await;
        assert_eq!(hub.session_partner("A").await, None);
        assert_eq!(hub.session_partner("B").await, None);
        assert_eq!(next(&mut b), Directive::Close);
        assert_eq!(hub.peer_count().await, 0);
    }

    #[tokio::test]
    async fn room_join_announces_to_existing_members() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let mut b = register(&hub, "B", None).await;

        hub.handle_message("A", "ROOM lobby").await;
        assert_eq!(next(&mut a), Directive::Send("ROOM_OK ".into()));

        hub.handle_message("B", "ROOM lobby").await;
        assert_eq!(next(&mut b), Directive::Send("ROOM_OK A".into()));
        assert_eq!(next(&mut a), Directive::Send("ROOM_PEER_JOINED B".into()));
    }

    #[tokio::test]
    async fn invalid_room_id_errors() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        hub.handle_message("A", "ROOM session").await;
        assert_eq!(
            next(&mut a),
            Directive::Send("ERROR invalid room id 'session'".into())
        );
    }

    #[tokio::test]
    async fn room_peer_msg_forwards_with_sender_uid() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let mut b = register(&hub, "B", None).await;

        hub.handle_message("A", "ROOM lobby").await;
        hub.handle_message("B", "ROOM lobby").await;
        let _ = next(&mut a);
        let _ = next(&mut a); // ROOM_PEER_JOINED B
        let _ = next(&mut b);

        hub.handle_message("A", "ROOM_PEER_MSG B hello there").await;
        assert_eq!(
            next(&mut b),
            Directive::Send("ROOM_PEER_MSG A hello there".into())
        );
    }

    #[tokio::test]
    async fn room_peer_list_excludes_self() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let mut b = register(&hub, "B", None).await;

        hub.handle_message("A", "ROOM lobby").await;
        hub.handle_message("B", "ROOM lobby").await;
        let _ = next(&mut a);
        let _ = next(&mut a);
        let _ = next(&mut b);

        hub.handle_message("B", "ROOM_PEER_LIST").await;
        assert_eq!(next(&mut b), Directive::Send("ROOM_PEER_LIST A".into()));
    }

    #[tokio::test]
    async fn room_departure_broadcasts_left() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let mut b = register(&hub, "B", None).await;

        hub.handle_message("A", "ROOM lobby").await;
        hub.handle_message("B", "ROOM lobby").await;
        let _ = next(&mut a);
        let _ = next(&mut a);
        let _ = next(&mut b);

        hub.remove_peer("B").await;
        assert_eq!(next(&mut a), Directive::Send("ROOM_PEER_LEFT B".into()));
    }

    #[tokio::test]
    async fn room_message_to_outsider_errors() {
        let hub = Hub::new();
        let mut a = register(&hub, "A", None).await;
        let _b = register(&hub, "B", None).await;

        hub.handle_message("A", "ROOM lobby").await;
        let _ = next(&mut a);

        hub.handle_message("A", "ROOM_PEER_MSG B hi").await;
        assert_eq!(
            next(&mut a),
            Directive::Send("ERROR peer 'B' is not in the room".into())
        );
    }
}
