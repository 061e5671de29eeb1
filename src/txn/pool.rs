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

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::{ConnPool, Connector, PooledConn};
use crate::config::ServerConfig;
use crate::error::{ErrorKind, Result, ServerError};
use crate::messages::MessageDigest;
use crate::types::{QueryResult, ReqCtx};
use crate::utils::{drop_watcher, DropOwner, History, LogThrottle};

const TX_LOG_CAPACITY: usize = 32;

/// A transaction's pinned connection plus everything recorded on it.
pub struct TxConnection {
    conn: PooledConn,
    pub tx_id: i64,
    pub queries: Vec<String>,
    pub messages: Vec<MessageDigest>,
    pub started: Instant,
    expired: bool,
}

impl std::fmt::Debug for TxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxConnection")
            .field("tx_id", &self.tx_id)
            .field("queries", &self.queries)
            .field("started", &self.started)
            .field("expired", &self.expired)
            .finish_non_exhaustive()
    }
}

impl TxConnection {
    pub async fn exec(&mut self, sql: &str, max_rows: usize, want_fields: bool) -> Result<QueryResult> {
        self.conn.execute(sql, max_rows, want_fields).await
    }

    /// Records a DML for the redo log written at Prepare.
    pub fn record_query(&mut self, sql: impl Into<String>) {
        self.queries.push(sql.into());
    }

    /// Records a message-table change published after commit.
    pub fn record_message(&mut self, digest: MessageDigest) {
        self.messages.push(digest);
    }
}

enum TxSlot {
    Available(Box<TxConnection>),
    InUse,
}

/// One line of `/txlogz`.
#[derive(Clone, Debug, Serialize)]
pub struct TxRecord {
    pub tx_id: i64,
    pub conclusion: String,
    pub duration_ms: u64,
    pub queries: Vec<String>,
}

/// Issues transaction ids and pins one pooled connection per id from Begin
/// until commit, rollback, or the sweeper's kill.
#[derive(Clone)]
pub struct TxPool {
    inner: Arc<TxPoolInner>,
}

struct TxPoolInner {
    pool: ConnPool,
    active: Mutex<HashMap<i64, TxSlot>>,
    next_id: AtomicI64,
    timeout_ms: AtomicU64,
    pool_timeout_ms: AtomicU64,
    log: History<TxRecord>,
    full_throttle: LogThrottle,
    sweeper: Mutex<Option<DropOwner>>,
}

impl TxPool {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            inner: Arc::new(TxPoolInner {
                pool: ConnPool::new("transaction", config.transaction_cap, config.idle_timeout()),
                active: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                timeout_ms: AtomicU64::new(config.transaction_timeout().as_millis() as u64),
                pool_timeout_ms: AtomicU64::new(config.tx_pool_timeout().as_millis() as u64),
                log: History::new(TX_LOG_CAPACITY),
                full_throttle: LogThrottle::new(Duration::from_secs(60)),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn open(&self, connector: Arc<dyn Connector>) {
        self.inner.pool.open(connector);
        self.start_sweeper();
    }

    /// Closes the pool. Unless `immediate`, open transactions get up to
    /// `grace` to conclude on their own before being rolled back.
    pub async fn close(&self, immediate: bool, grace: Duration) {
        if !immediate && grace > Duration::ZERO {
            let deadline = Instant::now() + grace;
            while !self.active_ids().is_empty() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        for tx_id in self.active_ids() {
            if let Err(err) = self.rollback(&ReqCtx::local(), tx_id).await {
                if err.kind != ErrorKind::NotInTx {
                    warn!("rollback of transaction {tx_id} during close failed: {err}");
                }
            }
        }
        *self.inner.sweeper.lock().unwrap() = None;
        self.inner.pool.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.pool.is_open()
    }

    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.inner.pool.set_capacity(capacity);
    }

    pub fn in_use(&self) -> usize {
        self.inner.pool.in_use()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.timeout_ms.load(Ordering::SeqCst))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.timeout_ms.store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_pool_timeout(&self, timeout: Duration) {
        self.inner.pool_timeout_ms.store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn active_ids(&self) -> Vec<i64> {
        self.inner.active.lock().unwrap().keys().copied().collect()
    }

    pub fn records(&self) -> Vec<TxRecord> {
        self.inner.log.records()
    }

    /// Opens a transaction: one pool slot, one `begin`, one fresh id.
    pub async fn begin(&self, ctx: &ReqCtx) -> Result<i64> {
        let pool_timeout = Duration::from_millis(self.inner.pool_timeout_ms.load(Ordering::SeqCst));
        let mut conn = match self.inner.pool.get(ctx, Some(pool_timeout)).await {
            Ok(conn) => conn,
            Err(err) if err.kind == ErrorKind::ResourceExhausted => {
                if self.inner.full_throttle.ready() {
                    warn!("transaction pool full: connection limit {} reached", self.capacity());
                }
                return Err(ServerError::new(ErrorKind::ResourceExhausted, "tx pool full"));
            },
            Err(err) => return Err(err),
        };
        conn.execute("begin", 1, false).await?;
        let tx_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let tx_conn = Box::new(TxConnection {
            conn,
            tx_id,
            queries: Vec::new(),
            messages: Vec::new(),
            started: Instant::now(),
            expired: false,
        });
        self.inner.active.lock().unwrap().insert(tx_id, TxSlot::Available(tx_conn));
        Ok(tx_id)
    }

    /// Takes exclusive hold of a transaction's connection. The caller must
    /// hand it back with `release` or finish it with `conclude`.
    pub fn checkout(&self, tx_id: i64) -> Result<Box<TxConnection>> {
        let mut active = self.inner.active.lock().unwrap();
        match active.get_mut(&tx_id) {
            None => Err(ServerError::not_in_tx(tx_id)),
            Some(slot @ TxSlot::Available(_)) => match std::mem::replace(slot, TxSlot::InUse) {
                TxSlot::Available(conn) => Ok(conn),
                TxSlot::InUse => unreachable!(),
            },
            Some(TxSlot::InUse) => {
                Err(ServerError::new(ErrorKind::Internal, format!("transaction {tx_id} is in use")))
            },
        }
    }

    /// Returns a checked-out connection for further statements.
    pub fn release(&self, conn: Box<TxConnection>) {
        self.inner.active.lock().unwrap().insert(conn.tx_id, TxSlot::Available(conn));
    }

    /// Finishes a transaction: drops it from the active map, records it in
    /// the transaction log, and returns or closes the connection.
    pub fn conclude(&self, conn: Box<TxConnection>, conclusion: &str, reuse: bool) {
        self.inner.active.lock().unwrap().remove(&conn.tx_id);
        self.inner.log.add(TxRecord {
            tx_id: conn.tx_id,
            conclusion: conclusion.to_string(),
            duration_ms: conn.started.elapsed().as_millis() as u64,
            queries: conn.queries.clone(),
        });
        let pooled = conn.conn;
        if reuse {
            pooled.recycle();
        }
    }

    /// Commits and returns the message digests to publish.
    pub async fn commit(&self, _ctx: &ReqCtx, tx_id: i64) -> Result<Vec<MessageDigest>> {
        let mut conn = self.checkout(tx_id)?;
        match conn.exec("commit", 1, false).await {
            Ok(_) => {
                let messages = std::mem::take(&mut conn.messages);
                self.conclude(conn, "commit", true);
                Ok(messages)
            },
            Err(err) => {
                self.conclude(conn, "commit failed", false);
                Err(err)
            },
        }
    }

    pub async fn rollback(&self, _ctx: &ReqCtx, tx_id: i64) -> Result<()> {
        let mut conn = self.checkout(tx_id)?;
        match conn.exec("rollback", 1, false).await {
            Ok(_) => {
                self.conclude(conn, "rollback", true);
                Ok(())
            },
            Err(err) => {
                self.conclude(conn, "rollback failed", false);
                Err(err)
            },
        }
    }

    /// The sweeper marks transactions past their timeout, then kills the
    /// still-open ones on the following pass.
    fn start_sweeper(&self) {
        let (owner, mut watcher) = drop_watcher();
        *self.inner.sweeper.lock().unwrap() = Some(owner);
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = (pool.timeout() / 10).max(Duration::from_millis(10));
                tokio::select! {
                    _ = tokio::time::sleep(interval) => pool.sweep().await,
                    _ = watcher.dropped() => break,
                }
            }
        });
    }

    async fn sweep(&self) {
        let timeout = self.timeout();
        let mut kills = Vec::new();
        {
            let mut active = self.inner.active.lock().unwrap();
            for (tx_id, slot) in active.iter_mut() {
                if let TxSlot::Available(conn) = slot {
                    if conn.started.elapsed() >= timeout {
                        if conn.expired {
                            kills.push(*tx_id);
                        } else {
                            conn.expired = true;
                        }
                    }
                }
            }
        }
        for tx_id in kills {
            let Ok(mut conn) = self.checkout(tx_id) else {
                continue;
            };
            info!("killing transaction {tx_id}: exceeded timeout {timeout:?}");
            let rolled_back = conn.exec("rollback", 1, false).await.is_ok();
            self.conclude(conn, "kill", rolled_back);
        }
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::backend::MemoryBackend;

    fn pool_with(backend: &MemoryBackend, config: &ServerConfig) -> TxPool {
        let pool = TxPool::new(config);
        pool.open(Arc::new(backend.clone()));
        pool
    }

    fn small_config(cap: usize) -> ServerConfig {
        ServerConfig { transaction_cap: cap, tx_pool_timeout: 0.1, ..Default::default() }
    }

    #[tokio::test]
    async fn test_begin_commit_lifecycle() {
        let backend = MemoryBackend::new();
        let pool = pool_with(&backend, &small_config(3));
        let tx_id = pool.begin(&ReqCtx::local()).await.unwrap();
        assert_that!(pool.in_use()).is_equal_to(1);
        pool.commit(&ReqCtx::local(), tx_id).await.unwrap();
        assert_that!(pool.in_use()).is_equal_to(0);
        assert_that!(backend.queries()).is_equal_to(vec!["begin".to_string(), "commit".to_string()]);
        let record = &pool.records()[0];
        assert_that!(record.conclusion.as_str()).is_equal_to("commit");
    }

    #[tokio::test]
    async fn test_commit_twice_is_not_in_tx() {
        let backend = MemoryBackend::new();
        let pool = pool_with(&backend, &small_config(3));
        let tx_id = pool.begin(&ReqCtx::local()).await.unwrap();
        pool.commit(&ReqCtx::local(), tx_id).await.unwrap();
        let err = pool.commit(&ReqCtx::local(), tx_id).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::NotInTx);
        let err = pool.rollback(&ReqCtx::local(), tx_id).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::NotInTx);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_tx_pool_full() {
        let backend = MemoryBackend::new();
        let pool = pool_with(&backend, &small_config(3));
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.begin(&ReqCtx::local()).await.unwrap());
        }
        let start = Instant::now();
        let err = pool.begin(&ReqCtx::local()).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::ResourceExhausted);
        assert_that!(err.message.as_str()).is_equal_to("tx pool full");
        assert_that!(start.elapsed() >= Duration::from_millis(100)).is_true();
        assert_that!(start.elapsed() <= Duration::from_millis(150 * 4)).is_true();
    }

    #[tokio::test]
    async fn test_pinned_connection_serializes_statements() {
        let backend = MemoryBackend::new();
        let pool = pool_with(&backend, &small_config(3));
        let tx_id = pool.begin(&ReqCtx::local()).await.unwrap();
        let mut conn = pool.checkout(tx_id).unwrap();
        let err = pool.checkout(tx_id).unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::Internal);
        conn.exec("insert into t (id) values (1)", 1, false).await.unwrap();
        conn.record_query("insert into t (id) values (1)");
        pool.release(conn);
        pool.rollback(&ReqCtx::local(), tx_id).await.unwrap();
        assert_that!(backend.queries()).is_equal_to(vec![
            "begin".to_string(),
            "insert into t (id) values (1)".to_string(),
            "rollback".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_sweeper_kills_expired_transactions() {
        let backend = MemoryBackend::new();
        let config = ServerConfig { transaction_cap: 3, transaction_timeout: 0.05, ..Default::default() };
        let pool = pool_with(&backend, &config);
        let tx_id = pool.begin(&ReqCtx::local()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_that!(pool.active_ids()).is_empty();
        assert_that!(pool.in_use()).is_equal_to(0);
        let err = pool.commit(&ReqCtx::local(), tx_id).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::NotInTx);
        let records = pool.records();
        assert_that!(records[0].conclusion.as_str()).is_equal_to("kill");
    }

    #[tokio::test]
    async fn test_close_rolls_back_open_transactions() {
        let backend = MemoryBackend::new();
        let pool = pool_with(&backend, &small_config(3));
        pool.begin(&ReqCtx::local()).await.unwrap();
        pool.close(true, Duration::ZERO).await;
        assert_that!(pool.active_ids()).is_empty();
        assert_that!(backend.queries()).is_equal_to(vec!["begin".to_string(), "rollback".to_string()]);
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_monotonic() {
        let backend = MemoryBackend::new();
        let pool = pool_with(&backend, &small_config(3));
        let first = pool.begin(&ReqCtx::local()).await.unwrap();
        let second = pool.begin(&ReqCtx::local()).await.unwrap();
        assert_that!(second > first).is_true();
    }
}
