//! Process-wide cursor registry. Ids are drawn from a CSPRNG over the i64
//! space; every cursor is tied to the connection that created it.

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, watch};

/// A paused backend result stream: the pinned connection plus the opaque
/// continuation the backend hands back between pages.
#[derive(Debug)]
pub struct CursorStream {
    pub client: Option<deadpool_postgres::Object>,
    pub continuation: Option<Vec<u8>>,
}

impl CursorStream {
    pub fn exhausted() -> Self {
        Self {
            client: None,
            continuation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Open,
    Iterating,
    Exhausted,
    Closed,
}

#[derive(Debug)]
pub struct Cursor {
    pub id: i64,
    pub db: String,
    pub coll: String,
    pub owner: u64,
    pub tailable: bool,
    pub batch_size: i32,
    pub created_at: Instant,
    pub last_access: Instant,
    pub state: CursorState,
    pub stream: CursorStream,
}

impl Cursor {
    pub fn ns(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    /// Idempotent: releases the pinned backend connection exactly once.
    pub fn close(&mut self) {
        if self.state != CursorState::Closed {
            self.state = CursorState::Closed;
            self.stream.client = None;
            self.stream.continuation = None;
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    NotFound,
    NotOwned,
}

#[derive(Debug, PartialEq, Eq)]
pub enum KillOutcome {
    Killed,
    NotFound,
    NotOwned,
}

pub struct CursorRegistry {
    cursors: RwLock<HashMap<i64, Arc<Mutex<Cursor>>>>,
    by_conn: Mutex<HashMap<u64, HashSet<i64>>>,
    idle_timeout: Duration,
}

impl CursorRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            cursors: RwLock::new(HashMap::new()),
            by_conn: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Register a new cursor and return its id. Never returns 0 or an id
    /// already in use.
    pub async fn allocate(
        &self,
        owner: u64,
        db: String,
        coll: String,
        tailable: bool,
        batch_size: i32,
        stream: CursorStream,
    ) -> i64 {
        let mut cursors = self.cursors.write().await;
        let id = loop {
            let candidate: i64 = rand::thread_rng().r#gen();
            if candidate != 0 && !cursors.contains_key(&candidate) {
                break candidate;
            }
        };
        let now = Instant::now();
        cursors.insert(
            id,
            Arc::new(Mutex::new(Cursor {
                id,
                db,
                coll,
                owner,
                tailable,
                batch_size,
                created_at: now,
                last_access: now,
                state: CursorState::Open,
                stream,
            })),
        );
        drop(cursors);
        self.by_conn.lock().await.entry(owner).or_default().insert(id);
        tracing::debug!(cursor_id = id, conn_id = owner, "cursor allocated");
        id
    }

    /// Look up a cursor for iteration, enforcing ownership.
    pub async fn fetch(
        &self,
        id: i64,
        owner: u64,
    ) -> Result<Arc<Mutex<Cursor>>, FetchOutcome> {
        let cursors = self.cursors.read().await;
        let entry = cursors.get(&id).cloned().ok_or(FetchOutcome::NotFound)?;
        drop(cursors);
        let cursor = entry.lock().await;
        if cursor.owner != owner {
            return Err(FetchOutcome::NotOwned);
        }
        if cursor.state == CursorState::Closed {
            return Err(FetchOutcome::NotFound);
        }
        drop(cursor);
        Ok(entry)
    }

    /// Remove a cursor entirely (after exhaustion or kill).
    pub async fn remove(&self, id: i64) {
        let removed = self.cursors.write().await.remove(&id);
        if let Some(entry) = removed {
            let mut cursor = entry.lock().await;
            let owner = cursor.owner;
            cursor.close();
            drop(cursor);
            let mut by_conn = self.by_conn.lock().await;
            if let Some(set) = by_conn.get_mut(&owner) {
                set.remove(&id);
                if set.is_empty() {
                    by_conn.remove(&owner);
                }
            }
        }
    }

    /// Kill one cursor on behalf of `owner`. Non-owners learn nothing beyond
    /// "not found".
    pub async fn kill(&self, id: i64, owner: u64) -> KillOutcome {
        let entry = {
            let cursors = self.cursors.read().await;
            cursors.get(&id).cloned()
        };
        let Some(entry) = entry else {
            return KillOutcome::NotFound;
        };
        {
            let cursor = entry.lock().await;
            if cursor.owner != owner {
                return KillOutcome::NotOwned;
            }
        }
        self.remove(id).await;
        tracing::debug!(cursor_id = id, conn_id = owner, "cursor killed");
        KillOutcome::Killed
    }

    /// Release everything the closing connection owns.
    pub async fn close_for_conn(&self, conn_id: u64) {
        let ids: Vec<i64> = self
            .by_conn
            .lock()
            .await
            .remove(&conn_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            if let Some(entry) = self.cursors.write().await.remove(id) {
                entry.lock().await.close();
            }
        }
        if !ids.is_empty() {
            tracing::debug!(conn_id, count = ids.len(), "cursors released on disconnect");
        }
    }

    /// Sweep idle non-tailable cursors. Returns the number closed.
    pub async fn reap(&self) -> usize {
        let candidates: Vec<(i64, Arc<Mutex<Cursor>>)> = {
            let cursors = self.cursors.read().await;
            cursors.iter().map(|(id, e)| (*id, e.clone())).collect()
        };
        let mut reaped = 0usize;
        for (id, entry) in candidates {
            let expired = {
                let cursor = entry.lock().await;
                !cursor.tailable && cursor.last_access.elapsed() > self.idle_timeout
            };
            if expired {
                self.remove(id).await;
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::debug!(count = reaped, "idle cursors reaped");
        }
        reaped
    }

    pub async fn len(&self) -> usize {
        self.cursors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cursors.read().await.is_empty()
    }
}

/// Periodic idle sweep, stopped by the server shutdown signal.
pub fn spawn_reaper(
    registry: Arc<CursorRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.reap().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
