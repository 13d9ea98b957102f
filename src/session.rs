use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use uuid::Uuid;

/// Identifies one authenticated session. Issued on logon, carried in the
///  session header of every subsequent call.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new_unique() -> SessionId {
        SessionId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> Option<SessionId> {
        Some(SessionId(Uuid::from_slice(bytes).ok()?))
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.0.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<SessionId> {
        Ok(SessionId(Uuid::from_u128(buf.try_get_u128()?)))
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One authenticated caller's server-side state. Created on successful
///  authentication, renewed on every dispatched call and on heartbeat,
///  removed on logoff or by the store's expiry policy.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub identity: String,
    pub created_at: SystemTime,
    pub last_renewed: SystemTime,
    pub client_addr: Option<SocketAddr>,
    /// free-form per-session variables for hosting layers; the core never
    ///  reads them
    pub variables: FxHashMap<String, String>,
}

impl Session {
    pub fn new(identity: &str, client_addr: Option<SocketAddr>) -> Session {
        let now = SystemTime::now();
        Session {
            id: SessionId::new_unique(),
            identity: identity.to_owned(),
            created_at: now,
            last_renewed: now,
            client_addr,
            variables: Default::default(),
        }
    }

    pub fn renew(&mut self) {
        self.last_renewed = SystemTime::now();
    }

    pub fn age_since_renewal(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_renewed)
            .unwrap_or(Duration::ZERO)
    }
}

/// The session store the dispatcher consumes. The implementation - in
///  memory, distributed, database-backed - is the hosting layer's choice;
///  the dispatcher treats every call as an atomic external operation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn exists(&self, id: SessionId) -> bool;
    async fn get(&self, id: SessionId) -> Option<Session>;
    async fn store(&self, session: Session);
    async fn remove(&self, id: SessionId);
    /// sessions unrenewed for longer than this are expired; 0 disables expiry
    fn age_limit_minutes(&self) -> u64;
}

/// Reference store keeping sessions in process memory, with lazy expiry on
///  lookup.
#[derive(Debug)]
pub struct InMemorySessionStore {
    age_limit_minutes: u64,
    sessions: std::sync::Mutex<FxHashMap<SessionId, Session>>,
}

impl InMemorySessionStore {
    pub fn new(age_limit_minutes: u64) -> InMemorySessionStore {
        InMemorySessionStore {
            age_limit_minutes,
            sessions: Default::default(),
        }
    }

    fn is_expired(&self, session: &Session) -> bool {
        self.age_limit_minutes > 0
            && session.age_since_renewal() > Duration::from_secs(self.age_limit_minutes * 60)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn exists(&self, id: SessionId) -> bool {
        self.get(id).await.is_some()
    }

    async fn get(&self, id: SessionId) -> Option<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&id) {
            Some(session) if self.is_expired(session) => {
                sessions.remove(&id);
                None
            }
            Some(session) => Some(session.clone()),
            None => None,
        }
    }

    async fn store(&self, session: Session) {
        self.sessions.lock().unwrap().insert(session.id, session);
    }

    async fn remove(&self, id: SessionId) {
        self.sessions.lock().unwrap().remove(&id);
    }

    fn age_limit_minutes(&self) -> u64 {
        self.age_limit_minutes
    }
}
