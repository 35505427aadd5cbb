//! Concurrent table of attached rover sessions.
//!
//! Each session owns a bounded outbound queue. The broadcaster pushes frames
//! into the queues; the session task drains its queue onto the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::rtcm::Frame;

pub type SessionId = u64;

/// What a completed handshake knows about the client.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub remote_address: SocketAddr,
    pub mountpoint: String,
    pub authenticated: bool,
    pub username: Option<String>,
}

/// Point-in-time copy of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession {
    pub id: SessionId,
    pub remote_address: SocketAddr,
    pub mountpoint: String,
    pub connected_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub authenticated: bool,
    pub username: Option<String>,
}

#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub remote_address: SocketAddr,
    pub mountpoint: String,
    pub connected_at: DateTime<Utc>,
    pub authenticated: bool,
    pub username: Option<String>,
    bytes_sent: AtomicU64,
    outbound: mpsc::Sender<Frame>,
    evicted: CancellationToken,
}

/// Outcome of offering a frame to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// The session's queue is full; it cannot keep up.
    Overflow,
    /// The session task is gone.
    Closed,
}

impl SessionHandle {
    pub fn offer(&self, frame: &Frame) -> Offer {
        match self.outbound.try_send(frame.clone()) {
            Ok(()) => Offer::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Offer::Overflow,
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    pub fn add_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ClientSession {
        ClientSession {
            id: self.id,
            remote_address: self.remote_address,
            mountpoint: self.mountpoint.clone(),
            connected_at: self.connected_at,
            bytes_sent: self.bytes_sent(),
            authenticated: self.authenticated,
            username: self.username.clone(),
        }
    }
}

/// Session-side half of a registration.
#[derive(Debug)]
pub struct Subscription {
    pub id: SessionId,
    pub handle: Arc<SessionHandle>,
    pub frames: mpsc::Receiver<Frame>,
    /// Cancelled when the registry drops this session.
    pub evicted: CancellationToken,
}

#[derive(Debug)]
pub struct ClientRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ClientRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a session under a fresh id.
    pub fn register(&self, session: NewSession) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, frames) = mpsc::channel(self.queue_capacity);
        let evicted = CancellationToken::new();
        let handle = Arc::new(SessionHandle {
            id,
            remote_address: session.remote_address,
            mountpoint: session.mountpoint,
            connected_at: Utc::now(),
            authenticated: session.authenticated,
            username: session.username,
            bytes_sent: AtomicU64::new(0),
            outbound,
            evicted: evicted.clone(),
        });
        self.sessions.insert(id, handle.clone());
        Subscription {
            id,
            handle,
            frames,
            evicted,
        }
    }

    /// Removes a session and signals its task. Unknown ids are ignored.
    pub fn unregister(&self, id: SessionId) -> Option<ClientSession> {
        let (_, handle) = self.sessions.remove(&id)?;
        handle.evicted.cancel();
        Some(handle.snapshot())
    }

    /// Visits every session registered when the call started. The map is
    /// not locked while `f` runs, so `f` may register or unregister.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<SessionHandle>),
    {
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in &handles {
            f(handle);
        }
    }

    /// Sessions ordered by id, which is also connection order.
    pub fn snapshot(&self) -> Vec<ClientSession> {
        let mut sessions: Vec<ClientSession> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        sessions.sort_by_key(|session| session.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }
}
