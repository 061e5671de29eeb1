// Copyright 2026 The Shardgate Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use super::{Connection, Connector};
use crate::error::{sqlerror, ErrorKind, Result, ServerError};
use crate::types::{QueryResult, ReqCtx};

// Stand-in for "no wait timeout"; pending acquires are bounded by the
// caller's cancellation scope instead.
const FOREVER: Duration = Duration::from_secs(365 * 24 * 3600);

/// Bounded pool of backend connections. Acquisition waits for a free slot,
/// observing the caller's cancellation scope and an optional wait timeout.
/// Idle connections past the idle timeout are discarded lazily on reuse.
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: &'static str,
    connector: Mutex<Option<Arc<dyn Connector>>>,
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    idle_timeout_ms: AtomicU64,
    idle: Mutex<Vec<IdleConn>>,
    in_use: AtomicUsize,
    open: AtomicBool,
}

struct IdleConn {
    conn: Box<dyn Connection>,
    since: Instant,
}

impl ConnPool {
    pub fn new(name: &'static str, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                connector: Mutex::new(None),
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity: AtomicUsize::new(capacity),
                idle_timeout_ms: AtomicU64::new(idle_timeout.as_millis() as u64),
                idle: Mutex::new(Vec::new()),
                in_use: AtomicUsize::new(0),
                open: AtomicBool::new(false),
            }),
        }
    }

    pub fn open(&self, connector: Arc<dyn Connector>) {
        *self.inner.connector.lock().unwrap() = Some(connector);
        self.inner.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.idle.lock().unwrap().clear();
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::SeqCst)
    }

    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn set_capacity(&self, capacity: usize) {
        let old = self.inner.capacity.swap(capacity, Ordering::SeqCst);
        if capacity > old {
            self.inner.semaphore.add_permits(capacity - old);
        } else if capacity < old {
            let semaphore = self.inner.semaphore.clone();
            let surplus = (old - capacity) as u32;
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many(surplus).await {
                    permits.forget();
                }
            });
        }
    }

    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.inner.idle_timeout_ms.store(idle_timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Acquires a connection. `wait_timeout` bounds the wait for a free
    /// slot; on expiry the caller gets RESOURCE_EXHAUSTED.
    pub async fn get(&self, ctx: &ReqCtx, wait_timeout: Option<Duration>) -> Result<PooledConn> {
        if !self.is_open() {
            return Err(ServerError::new(ErrorKind::Internal, format!("{} pool is closed", self.inner.name)));
        }
        let permit = tokio::select! {
            permit = self.inner.semaphore.clone().acquire_owned() => permit.map_err(|_| {
                ServerError::new(ErrorKind::Internal, format!("{} pool is closed", self.inner.name))
            })?,
            _ = ctx.cancel.cancelled() => {
                return Err(ServerError::with_sql(
                    ErrorKind::Unknown,
                    sqlerror::ER_QUERY_INTERRUPTED,
                    "70100",
                    format!("interrupted while waiting for {} pool", self.inner.name),
                ));
            },
            _ = tokio::time::sleep(wait_timeout.unwrap_or(FOREVER)), if wait_timeout.is_some() => {
                return Err(ServerError::new(
                    ErrorKind::ResourceExhausted,
                    format!("{} pool wait exceeded {:?}", self.inner.name, wait_timeout.unwrap_or_default()),
                ));
            },
        };
        if !self.is_open() {
            return Err(ServerError::new(ErrorKind::Internal, format!("{} pool is closed", self.inner.name)));
        }
        let conn = match self.take_idle() {
            Some(conn) => conn,
            None => {
                let connector = self.inner.connector.lock().unwrap().clone();
                let connector = connector
                    .ok_or_else(|| ServerError::new(ErrorKind::Internal, format!("{} pool is closed", self.inner.name)))?;
                connector.connect().await?
            },
        };
        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConn { conn: Some(conn), _permit: Some(permit), pool: self.inner.clone() })
    }

    fn take_idle(&self) -> Option<Box<dyn Connection>> {
        let idle_timeout = Duration::from_millis(self.inner.idle_timeout_ms.load(Ordering::SeqCst));
        let mut idle = self.inner.idle.lock().unwrap();
        while let Some(entry) = idle.pop() {
            if entry.since.elapsed() < idle_timeout && entry.conn.is_healthy() {
                return Some(entry.conn);
            }
        }
        None
    }
}

/// A connection on loan from the pool. `recycle` returns it for reuse;
/// dropping it instead closes the connection. Either way the slot frees up.
pub struct PooledConn {
    conn: Option<Box<dyn Connection>>,
    _permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish_non_exhaustive()
    }
}

impl PooledConn {
    pub async fn execute(&mut self, sql: &str, max_rows: usize, want_fields: bool) -> Result<QueryResult> {
        match self.conn.as_mut() {
            Some(conn) => conn.execute(sql, max_rows, want_fields).await,
            None => Err(ServerError::new(ErrorKind::Internal, "connection already recycled")),
        }
    }

    pub async fn stream(&mut self, sql: &str, sink: &mpsc::Sender<QueryResult>) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.stream(sql, sink).await,
            None => Err(ServerError::new(ErrorKind::Internal, "connection already recycled")),
        }
    }

    /// Returns the connection to the pool.
    pub fn recycle(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
            if self.pool.open.load(Ordering::SeqCst) && conn.is_healthy() {
                self.pool.idle.lock().unwrap().push(IdleConn { conn, since: Instant::now() });
            }
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
