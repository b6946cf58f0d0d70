//! Real-time fan-out of events to connections grouped by session.

pub mod protocol;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::domain::{ConnectionId, ServerEvent, SessionId, UserId};
use crate::error::DocketError;

/// Send side of one live connection (WebSocket-style).
///
/// The hub only needs two things from a connection: an identity and a way to
/// push one event. A send that fails marks the connection dead; cleanup is
/// lazy, there is no heartbeat polling.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    fn id(&self) -> ConnectionId;

    async fn send(&self, event: ServerEvent) -> Result<(), DocketError>;
}

/// All hub indices, co-updated under one lock.
///
/// Invariants:
/// - a connection maps to exactly one user;
/// - a session's connection set and a user's session set are never left
///   empty: the entry is deleted the instant the set would empty;
/// - typing membership is a subset of the session's current users.
#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, HashMap<ConnectionId, Arc<dyn ConnectionSink>>>,
    users: HashMap<UserId, HashSet<SessionId>>,
    connections: HashMap<ConnectionId, UserId>,
    typing: HashMap<SessionId, HashSet<UserId>>,
}

impl HubState {
    /// Index surgery for one departing connection. No broadcasts here; the
    /// caller decides whether (and what) to announce.
    ///
    /// Returns the user the connection belonged to, if the indices knew it.
    fn remove_connection(&mut self, connection_id: ConnectionId, session_id: &SessionId) -> Option<UserId> {
        let user_id = self.connections.get(&connection_id).cloned()?;

        let mut session_emptied = false;
        let mut user_left_session = false;
        if let Some(conns) = self.sessions.get_mut(session_id) {
            conns.remove(&connection_id);
            user_left_session = !conns
                .keys()
                .any(|cid| self.connections.get(cid) == Some(&user_id));
            if conns.is_empty() {
                session_emptied = true;
            }
        }
        if session_emptied {
            // No tombstones: the session dies with its last connection.
            self.sessions.remove(session_id);
            self.typing.remove(session_id);
        }

        if user_left_session {
            if let Some(typing) = self.typing.get_mut(session_id) {
                typing.remove(&user_id);
                if typing.is_empty() {
                    self.typing.remove(session_id);
                }
            }
            if let Some(sessions) = self.users.get_mut(&user_id) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    self.users.remove(&user_id);
                }
            }
        }

        // Drop the connection entry once no session holds it anymore.
        let still_connected = self
            .sessions
            .values()
            .any(|conns| conns.contains_key(&connection_id));
        if !still_connected {
            self.connections.remove(&connection_id);
        }

        Some(user_id)
    }

    fn session_users(&self, session_id: &SessionId) -> Vec<UserId> {
        let Some(conns) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        let mut users: Vec<UserId> = conns
            .keys()
            .filter_map(|cid| self.connections.get(cid).cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        users.sort();
        users
    }

    fn typing_users(&self, session_id: &SessionId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Live targets in a session, minus `exclude`.
    fn targets(
        &self,
        session_id: &SessionId,
        exclude: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, Arc<dyn ConnectionSink>)> {
        let Some(conns) = self.sessions.get(session_id) else {
            return Vec::new();
        };
        conns
            .iter()
            .filter(|(cid, _)| Some(**cid) != exclude)
            .map(|(cid, sink)| (*cid, Arc::clone(sink)))
            .collect()
    }
}

/// In-process notification hub.
///
/// All index mutation happens under one async lock; delivery happens after
/// the lock is released, concurrently per target and bounded by a per-send
/// timeout so one broken consumer cannot stall the rest of the session.
pub struct NotificationHub {
    state: Mutex<HubState>,
    send_timeout: Duration,
}

impl NotificationHub {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            send_timeout,
        }
    }

    /// Register a connection in a session. Idempotent. Announces
    /// `user_joined` to the rest of the session and replies `session_joined`
    /// to the joining connection.
    pub async fn join(
        &self,
        sink: Arc<dyn ConnectionSink>,
        session_id: SessionId,
        user_id: UserId,
    ) {
        let connection_id = sink.id();
        let (users, targets) = {
            let mut state = self.state.lock().await;
            state
                .sessions
                .entry(session_id.clone())
                .or_default()
                .insert(connection_id, Arc::clone(&sink));
            state
                .users
                .entry(user_id.clone())
                .or_default()
                .insert(session_id.clone());
            state.connections.insert(connection_id, user_id.clone());
            (
                state.session_users(&session_id),
                state.targets(&session_id, Some(connection_id)),
            )
        };

        debug!(connection = %connection_id, session = %session_id, user = %user_id, "join");

        let reply = ServerEvent::SessionJoined {
            user_id: user_id.clone(),
            users,
        };
        let reply_ok = tokio::time::timeout(self.send_timeout, sink.send(reply))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !reply_ok {
            // Joined and died immediately; lazy cleanup applies.
            self.leave(connection_id, &session_id).await;
            return;
        }

        self.deliver(&session_id, targets, ServerEvent::UserJoined { user_id })
            .await;
    }

    /// Remove a connection from a session, pruning every index it touched,
    /// and announce `user_left` to whoever remains.
    pub async fn leave(&self, connection_id: ConnectionId, session_id: &SessionId) {
        let (user_id, targets) = {
            let mut state = self.state.lock().await;
            let user_id = state.remove_connection(connection_id, session_id);
            (user_id, state.targets(session_id, None))
        };
        let Some(user_id) = user_id else {
            return; // already gone, leave is idempotent
        };

        debug!(connection = %connection_id, session = %session_id, user = %user_id, "leave");

        // Failures here are pruned without another user_left round: one
        // announcement per departure is enough.
        let failed = self
            .send_concurrently(targets, ServerEvent::UserLeft { user_id })
            .await;
        if !failed.is_empty() {
            let mut state = self.state.lock().await;
            for cid in failed {
                state.remove_connection(cid, session_id);
            }
        }
    }

    /// Deliver to every live connection in the session except `exclude`.
    /// Dead connections found along the way are routed through `leave`.
    pub async fn broadcast(
        &self,
        session_id: &SessionId,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) {
        let targets = {
            let state = self.state.lock().await;
            state.targets(session_id, exclude)
        };
        self.deliver(session_id, targets, event).await;
    }

    /// Flip a user's typing flag and announce the new typing set.
    ///
    /// There is no TTL on typing state: an ungraceful disconnect keeps the
    /// flag until `leave` purges it.
    pub async fn typing(&self, session_id: &SessionId, user_id: UserId, is_typing: bool) {
        let (typing_users, targets) = {
            let mut state = self.state.lock().await;
            if !state.sessions.contains_key(session_id) {
                return;
            }
            let set = state.typing.entry(session_id.clone()).or_default();
            if is_typing {
                set.insert(user_id.clone());
            } else {
                set.remove(&user_id);
            }
            if set.is_empty() {
                state.typing.remove(session_id);
            }
            (state.typing_users(session_id), state.targets(session_id, None))
        };

        self.deliver(
            session_id,
            targets,
            ServerEvent::TypingUpdate {
                user_id,
                is_typing,
                typing_users,
            },
        )
        .await;
    }

    /// Broadcast into every session the user currently participates in.
    pub async fn send_to_user(&self, user_id: &UserId, event: ServerEvent) {
        let sessions: Vec<SessionId> = {
            let state = self.state.lock().await;
            state
                .users
                .get(user_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        for session_id in sessions {
            self.broadcast(&session_id, event.clone(), None).await;
        }
    }

    /// Users currently in a session (empty when the session is gone).
    pub async fn get_session_users(&self, session_id: &SessionId) -> Vec<UserId> {
        let state = self.state.lock().await;
        state.session_users(session_id)
    }

    /// Users currently flagged typing in a session.
    pub async fn get_typing_users(&self, session_id: &SessionId) -> Vec<UserId> {
        let state = self.state.lock().await;
        state.typing_users(session_id)
    }

    /// User a connection belongs to.
    pub async fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        let state = self.state.lock().await;
        state.connections.get(&connection_id).cloned()
    }

    /// Does the hub still track this session?
    pub async fn has_session(&self, session_id: &SessionId) -> bool {
        let state = self.state.lock().await;
        state.sessions.contains_key(session_id)
    }

    /// Deliver + lazy cleanup: every failed target goes through `leave`.
    async fn deliver(
        &self,
        session_id: &SessionId,
        targets: Vec<(ConnectionId, Arc<dyn ConnectionSink>)>,
        event: ServerEvent,
    ) {
        let failed = self.send_concurrently(targets, event).await;
        for connection_id in failed {
            warn!(connection = %connection_id, session = %session_id, "send failed, dropping connection");
            self.leave(connection_id, session_id).await;
        }
    }

    /// Issue all sends concurrently, each bounded by the send timeout, and
    /// return the connections that failed.
    async fn send_concurrently(
        &self,
        targets: Vec<(ConnectionId, Arc<dyn ConnectionSink>)>,
        event: ServerEvent,
    ) -> Vec<ConnectionId> {
        let mut set = JoinSet::new();
        let timeout = self.send_timeout;
        for (connection_id, sink) in targets {
            let event = event.clone();
            set.spawn(async move {
                let ok = tokio::time::timeout(timeout, sink.send(event))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                (connection_id, ok)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((connection_id, false)) => failed.push(connection_id),
                Err(e) => warn!(error = %e, "send task panicked"),
            }
        }
        failed
    }
}
