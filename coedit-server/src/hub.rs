//! The live session hub: websocket fan-in of requests, fan-out of responses,
//! and garbage collection of idle users and sessions.
//!
//! Each session with at least one open socket is owned by a [`ManagedSession`]
//! actor. Its single event loop serializes every inbound edit through the
//! store's compare-and-swap path and broadcasts the result to all connected
//! users, deduplicating by content hash so unchanged periodic snapshots are
//! never echoed.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::{UpdateSessionRequest, UpdateSessionResponse};
use crate::store::{SessionId, SessionStore};

/// Capacity of each bounded queue in the hub (outbound per user, and the two
/// per-session queues).
const QUEUE_CAPACITY: usize = 32;

/// Cadence of the cancelled-user cleanup tick and the global sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Sweep ticks a session may spend with no connected users before it is
/// dropped from the registry.
const IDLE_TICKS_BEFORE_DROP: u32 = 120;

/// One open websocket, with its read and write loops.
pub struct ConnectedUser {
    user_id: String,
    to_user: mpsc::Sender<UpdateSessionResponse>,
    cancel: CancellationToken,
}

impl ConnectedUser {
    /// Wires a socket up to the hub's inbound queue and spawns the two loops.
    fn spawn(
        user_id: String,
        socket: WebSocket,
        requests: mpsc::Sender<UpdateSessionRequest>,
    ) -> Arc<Self> {
        info!("connected user: {user_id}");
        let (to_user, outbound) = mpsc::channel(QUEUE_CAPACITY);
        let user = Arc::new(Self {
            user_id,
            to_user,
            cancel: CancellationToken::new(),
        });
        let (sink, stream) = socket.split();
        tokio::spawn(Arc::clone(&user).read_loop(stream, requests));
        tokio::spawn(Arc::clone(&user).write_loop(sink, outbound));
        user
    }

    /// Queues a response for this user. Blocks while the outbound queue is
    /// full; resolves immediately (dropping the response) once the user is
    /// cancelled, because the write loop has released the receiver.
    async fn send(&self, resp: UpdateSessionResponse) {
        if !self.cancel.is_cancelled() {
            let _ = self.to_user.send(resp).await;
        }
    }

    /// Terminal and idempotent; both loops exit on the token.
    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn read_loop(
        self: Arc<Self>,
        mut stream: SplitStream<WebSocket>,
        requests: mpsc::Sender<UpdateSessionRequest>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = stream.next() => {
                    let frame = match msg {
                        Some(Ok(Message::Text(frame))) => frame,
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => continue,
                    };
                    let req: UpdateSessionRequest = match serde_json::from_str(frame.as_str()) {
                        Ok(req) => req,
                        Err(e) => {
                            warn!("dropping undecodable frame from {}: {e}", self.user_id);
                            continue;
                        }
                    };
                    if req.ping {
                        self.send(UpdateSessionResponse::pong()).await;
                        continue;
                    }
                    if requests.send(req).await.is_err() {
                        break;
                    }
                }
            }
        }
        self.cancel();
    }

    async fn write_loop(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
        mut outbound: mpsc::Receiver<UpdateSessionResponse>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                resp = outbound.recv() => {
                    let Some(resp) = resp else { break };
                    let frame = serde_json::to_string(&resp).expect("failed serialize");
                    if sink.send(Message::text(frame)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        self.cancel();
    }
}

/// Per-session actor owning the connected users and the two bounded queues.
pub struct ManagedSession {
    session_id: SessionId,
    store: Arc<dyn SessionStore>,
    users: DashMap<String, Arc<ConnectedUser>>,
    from_users: mpsc::Sender<UpdateSessionRequest>,
    to_users: mpsc::Sender<UpdateSessionResponse>,
    cancel: CancellationToken,
}

impl ManagedSession {
    fn spawn(session_id: SessionId, store: Arc<dyn SessionStore>) -> Arc<Self> {
        let (from_users, from_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (to_users, to_rx) = mpsc::channel(QUEUE_CAPACITY);
        let hub = Arc::new(Self {
            session_id,
            store,
            users: DashMap::new(),
            from_users,
            to_users,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&hub).run(from_rx, to_rx));
        hub
    }

    /// Connects a user's socket, replacing (and cancelling) any previous
    /// connection under the same id.
    pub fn add_user(&self, user_id: &str, socket: WebSocket) {
        let user = ConnectedUser::spawn(user_id.to_string(), socket, self.from_users.clone());
        if let Some(old) = self.users.insert(user_id.to_string(), user) {
            old.cancel();
        }
    }

    /// Number of connections that have not been cancelled yet.
    pub fn user_count(&self) -> usize {
        self.users.iter().filter(|u| !u.cancelled()).count()
    }

    /// Queues a response for fan-out. Never blocks: the actor loop is this
    /// queue's only consumer, so a full queue is shed with a warning rather
    /// than risking the loop waiting on itself; the next periodic snapshot
    /// re-converges anyone who missed it.
    pub async fn queue_response(&self, resp: UpdateSessionResponse) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.to_users.try_send(resp) {
            warn!("session {}: outbound queue overflow: {e}", self.session_id);
        }
    }

    /// Terminal and idempotent. Closes the loop and every connected user.
    pub fn cancel(&self) {
        self.cancel.cancel();
        for user in self.users.iter() {
            user.cancel();
        }
    }

    /// Whether this hub has been cancelled.
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn run(
        self: Arc<Self>,
        mut from_rx: mpsc::Receiver<UpdateSessionRequest>,
        mut to_rx: mpsc::Receiver<UpdateSessionResponse>,
    ) {
        let mut last_hash: Option<[u8; 16]> = None;
        let mut cleanup = time::interval(SWEEP_INTERVAL);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                req = from_rx.recv() => {
                    let Some(req) = req else { break };
                    match self.store.update_session(&self.session_id, req).await {
                        Ok(resp) => self.queue_response(resp).await,
                        Err(e) => warn!("failed to update session {}: {e}", self.session_id),
                    }
                }
                resp = to_rx.recv() => {
                    let Some(resp) = resp else { break };
                    self.broadcast(resp, &mut last_hash).await;
                }
                _ = cleanup.tick() => {
                    self.users.retain(|_, user| !user.cancelled());
                }
            }
        }
        debug!("session {} loop finished", self.session_id);
    }

    /// Sends a response to every connected user, unless it hashes identically
    /// to the previous broadcast.
    async fn broadcast(&self, resp: UpdateSessionResponse, last_hash: &mut Option<[u8; 16]>) {
        let encoded = match bincode::serialize(&resp) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("failed to encode response for {}: {e}", self.session_id);
                return;
            }
        };
        let hash = md5::compute(&encoded).0;
        if *last_hash == Some(hash) {
            return;
        }
        *last_hash = Some(hash);

        let targets: Vec<Arc<ConnectedUser>> = self
            .users
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for user in targets {
            user.send(resp.clone()).await;
        }
    }
}

/// A registry slot for one live session. Dropping the entry cancels the hub.
struct SessionEntry {
    hub: Arc<ManagedSession>,
    idle_ticks: u32,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        self.hub.cancel();
    }
}

/// Registry of all live sessions, plus the periodic snapshot/GC sweep.
pub struct UsersManager {
    store: Arc<dyn SessionStore>,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
}

impl UsersManager {
    /// Creates the registry and starts the sweep task.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let sessions: Arc<DashMap<SessionId, SessionEntry>> = Default::default();
        tokio::spawn(sweeper(Arc::clone(&store), Arc::clone(&sessions)));
        Self { store, sessions }
    }

    /// Attaches a socket to the session's hub, creating the hub on first
    /// join. A hub cancelled by a concurrent sweep is replaced in place.
    pub fn register_user(&self, session_id: SessionId, user_id: &str, socket: WebSocket) {
        let mut entry = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEntry {
                hub: ManagedSession::spawn(session_id.clone(), Arc::clone(&self.store)),
                idle_ticks: 0,
            });
        if entry.hub.cancelled() {
            entry.hub = ManagedSession::spawn(session_id, Arc::clone(&self.store));
            entry.idle_ticks = 0;
        }
        entry.hub.add_user(user_id, socket);
    }

    /// Number of sessions currently holding a live hub.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Pushes fresh snapshots to active sessions and reaps idle ones.
async fn sweeper(store: Arc<dyn SessionStore>, sessions: Arc<DashMap<SessionId, SessionEntry>>) {
    let mut tick = time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;

        let mut active = Vec::new();
        let mut expired = Vec::new();
        for mut entry in sessions.iter_mut() {
            if entry.hub.user_count() == 0 {
                entry.idle_ticks += 1;
                if entry.idle_ticks > IDLE_TICKS_BEFORE_DROP {
                    expired.push(entry.key().clone());
                }
            } else {
                entry.idle_ticks = 0;
                active.push((entry.key().clone(), Arc::clone(&entry.hub)));
            }
        }

        for id in expired {
            info!("dropping idle session {id}");
            sessions.remove(&id);
        }

        for (id, hub) in active {
            match store.load_session(&id).await {
                Ok(session) => hub.queue_response(session.snapshot_response()).await,
                Err(e) => debug!("skipping snapshot for session {id}: {e}"),
            }
        }
    }
}
