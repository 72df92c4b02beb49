//! Durable session storage with compare-and-swap update semantics.
//!
//! Sessions live in an external key/value store as opaque binary blobs with a
//! seven-day TTL, refreshed on every write. All mutation funnels through
//! [`SessionStore::update_session`], which loads the current blob, runs the
//! merge engine, and commits only if no other writer intervened — so
//! concurrent edits to one session are strictly serialized even across server
//! processes.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::Commands;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::messages::{UpdateSessionRequest, UpdateSessionResponse};
use crate::session::Session;

/// How long a session key lives without being written.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// How many times a compare-and-swap update retries before giving up.
const CAS_MAX_ATTEMPTS: usize = 8;

/// Unique identifier for a session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Maximum length of a session ID, in bytes.
    pub const MAX_LEN: usize = 64;

    /// Generates a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("session ID is empty");
        }
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("session ID is too long");
        }
        if !s.chars().all(Self::valid_char) {
            anyhow::bail!("session ID contains invalid characters");
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Failures surfaced by a session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is absent or has expired.
    #[error("session '{0}' does not exist")]
    NotFound(SessionId),
    /// Competing writers won every compare-and-swap attempt.
    #[error("failed to modify session '{0}': too many conflicting writes")]
    Contention(SessionId),
    /// The merge engine refused the request.
    #[error("invalid update: {0}")]
    Rejected(anyhow::Error),
    /// The stored blob could not be encoded or decoded.
    #[error("corrupt session encoding: {0}")]
    Codec(anyhow::Error),
    /// Transport failure talking to the backing store.
    #[error("store transport error: {0}")]
    Transport(#[from] redis::RedisError),
    /// A blocking store task was cancelled or panicked.
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A durable, expiring map of sessions with linearizable per-key updates.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Seeds a fresh session under a new random id and returns the id.
    async fn create_session(&self) -> Result<SessionId, StoreError>;

    /// Loads a session, failing fast when the key is absent or expired.
    async fn load_session(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Atomic read-modify-write: loads the session, runs the merge engine on
    /// it, and commits the result under the same TTL. Concurrent calls for
    /// the same id are strictly serialized.
    async fn update_session(
        &self,
        id: &SessionId,
        req: UpdateSessionRequest,
    ) -> Result<UpdateSessionResponse, StoreError>;
}

/// Redis-backed store. Updates use WATCH/MULTI/EXEC so the commit aborts (and
/// retries) whenever another writer touches the key between read and write.
///
/// WATCH is connection state, so each operation runs on its own dedicated
/// connection from a blocking task rather than a shared multiplexed one.
pub struct RedisSessionStore {
    client: redis::Client,
}

/// Connection parameters for the Redis store, usually from the environment.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// `host:port` of the Redis server.
    pub host: String,
    /// Optional AUTH password.
    pub password: Option<String>,
    /// Database number.
    pub db: i64,
}

impl RedisSessionStore {
    /// Connects and pings the server, failing fast when it is unreachable.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let (host, port) = match config.host.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(6379)),
            None => (config.host.clone(), 6379),
        };
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: config.db,
                password: config.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let probe = client.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut conn = probe.get_connection()?;
            redis::cmd("PING").query::<String>(&mut conn)?;
            Ok(())
        })
        .await??;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_session(&self) -> Result<SessionId, StoreError> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let id = SessionId::random();
            let blob = Session::default().to_bytes().map_err(StoreError::Codec)?;
            let mut conn = client.get_connection()?;
            let _: () = conn.set_ex(id.as_str(), blob, SESSION_EXPIRY.as_secs())?;
            Ok(id)
        })
        .await?
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        let client = self.client.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection()?;
            let blob: Option<Vec<u8>> = conn.get(id.as_str())?;
            match blob {
                Some(blob) => Session::from_bytes(&blob).map_err(StoreError::Codec),
                None => Err(StoreError::NotFound(id)),
            }
        })
        .await?
    }

    async fn update_session(
        &self,
        id: &SessionId,
        req: UpdateSessionRequest,
    ) -> Result<UpdateSessionResponse, StoreError> {
        let client = self.client.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection()?;
            for _ in 0..CAS_MAX_ATTEMPTS {
                redis::cmd("WATCH").arg(id.as_str()).query::<()>(&mut conn)?;
                let blob: Option<Vec<u8>> = conn.get(id.as_str())?;
                let Some(blob) = blob else {
                    redis::cmd("UNWATCH").query::<()>(&mut conn)?;
                    return Err(StoreError::NotFound(id));
                };
                let mut session = Session::from_bytes(&blob).map_err(StoreError::Codec)?;
                let resp = match session.update(req.clone()) {
                    Ok(resp) => resp,
                    Err(e) => {
                        redis::cmd("UNWATCH").query::<()>(&mut conn)?;
                        return Err(StoreError::Rejected(e));
                    }
                };
                let blob = session.to_bytes().map_err(StoreError::Codec)?;
                // EXEC returns nil when the watched key changed underneath us.
                let committed: Option<()> = redis::pipe()
                    .atomic()
                    .set_ex(id.as_str(), blob, SESSION_EXPIRY.as_secs())
                    .ignore()
                    .query(&mut conn)?;
                if committed.is_some() {
                    return Ok(resp);
                }
            }
            Err(StoreError::Contention(id))
        })
        .await?
    }
}

struct StoredSession {
    blob: Vec<u8>,
    expires_at: Instant,
}

/// In-process store with the same contract: per-key serialized updates and
/// TTL expiry. The fallback when no external store is configured, and the
/// backend every test runs against.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, StoredSession>,
}

impl MemorySessionStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self) -> Result<SessionId, StoreError> {
        let id = SessionId::random();
        let blob = Session::default().to_bytes().map_err(StoreError::Codec)?;
        self.sessions.insert(
            id.clone(),
            StoredSession {
                blob,
                expires_at: Instant::now() + SESSION_EXPIRY,
            },
        );
        Ok(id)
    }

    async fn load_session(&self, id: &SessionId) -> Result<Session, StoreError> {
        let Some(stored) = self.sessions.get(id) else {
            return Err(StoreError::NotFound(id.clone()));
        };
        if stored.expires_at <= Instant::now() {
            drop(stored);
            self.sessions.remove(id);
            return Err(StoreError::NotFound(id.clone()));
        }
        Session::from_bytes(&stored.blob).map_err(StoreError::Codec)
    }

    async fn update_session(
        &self,
        id: &SessionId,
        req: UpdateSessionRequest,
    ) -> Result<UpdateSessionResponse, StoreError> {
        // The exclusive entry reference serializes writers for this key.
        let Some(mut stored) = self.sessions.get_mut(id) else {
            return Err(StoreError::NotFound(id.clone()));
        };
        if stored.expires_at <= Instant::now() {
            drop(stored);
            self.sessions.remove(id);
            return Err(StoreError::NotFound(id.clone()));
        }
        let mut session = Session::from_bytes(&stored.blob).map_err(StoreError::Codec)?;
        let resp = session.update(req).map_err(StoreError::Rejected)?;
        stored.blob = session.to_bytes().map_err(StoreError::Codec)?;
        stored.expires_at = Instant::now() + SESSION_EXPIRY;
        Ok(resp)
    }
}
