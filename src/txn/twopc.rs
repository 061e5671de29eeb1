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

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

use crate::backend::{ConnPool, Connector, PooledConn};
use crate::config::ServerConfig;
use crate::error::{ErrorKind, Result, ServerError};
use crate::types::{bind_sql, BindValue, BindVars, QueryResult, ReqCtx, Target, Value};
use crate::utils::{drop_watcher, DropOwner};

const TWOPC_POOL_SIZE: usize = 2;
const METADATA_MAX_ROWS: usize = 10000;

/// All two-phase-commit metadata lives in a reserved side-car schema, never
/// co-mingled with user tables.
pub const SIDECAR_SCHEMA: &str = "_shardgate";

const CREATE_SCHEMA: &str = "create database if not exists _shardgate";
const CREATE_REDO_STATEMENT: &str = "\
create table if not exists _shardgate.redo_statement (
  dtid varbinary(512) not null,
  seq bigint not null,
  statement mediumblob not null,
  primary key (dtid, seq)
)";
const CREATE_DT_STATE: &str = "\
create table if not exists _shardgate.dt_state (
  dtid varbinary(512) not null,
  state varchar(16) not null,
  time_created bigint not null,
  participants mediumblob not null,
  primary key (dtid)
)";

const INSERT_REDO: &str =
    "insert into _shardgate.redo_statement (dtid, seq, statement) values (:dtid, :seq, :statement)";
const READ_REDO: &str = "select statement from _shardgate.redo_statement where dtid = :dtid order by seq";
const DELETE_REDO: &str = "delete from _shardgate.redo_statement where dtid = :dtid";
const INSERT_DT: &str = "insert into _shardgate.dt_state (dtid, state, time_created, participants) \
     values (:dtid, 'PREPARE', :time_created, :participants)";
const TRANSITION_DT: &str =
    "update _shardgate.dt_state set state = :state where dtid = :dtid and state = 'PREPARE'";
const READ_DT: &str = "select dtid, state, time_created, participants from _shardgate.dt_state where dtid = :dtid";
const DELETE_DT: &str = "delete from _shardgate.dt_state where dtid = :dtid";
const READ_ABANDONED: &str = "select dtid, state, time_created, participants from _shardgate.dt_state \
     where time_created < :cutoff";

/// Coordinator decision states of a distributed transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DtState {
    Prepare,
    Commit,
    Rollback,
}

impl DtState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DtState::Prepare => "PREPARE",
            DtState::Commit => "COMMIT",
            DtState::Rollback => "ROLLBACK",
        }
    }

    fn parse(name: &str) -> Result<DtState> {
        match name {
            "PREPARE" => Ok(DtState::Prepare),
            "COMMIT" => Ok(DtState::Commit),
            "ROLLBACK" => Ok(DtState::Rollback),
            other => Err(ServerError::new(ErrorKind::Internal, format!("corrupt dt_state value {other}"))),
        }
    }
}

/// Metadata of one distributed transaction as stored in dt_state.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionMetadata {
    pub dtid: String,
    pub state: DtState,
    pub time_created: i64,
    pub participants: Vec<Target>,
}

/// Durable side of the 2PC executor: owns the side-car tables and all
/// statement traffic against them.
#[derive(Clone)]
pub struct TwoPc {
    inner: Arc<TwoPcInner>,
}

struct TwoPcInner {
    pool: ConnPool,
    coordinator_address: String,
    abandon_age: Duration,
    watchdog: Mutex<Option<DropOwner>>,
}

impl TwoPc {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            inner: Arc::new(TwoPcInner {
                pool: ConnPool::new("twopc", TWOPC_POOL_SIZE, config.idle_timeout()),
                coordinator_address: config.twopc_coordinator_address.clone(),
                abandon_age: config.twopc_abandon_age(),
                watchdog: Mutex::new(None),
            }),
        }
    }

    /// Creates the side-car schema. Runs at first start; every statement is
    /// idempotent.
    pub async fn init_schema(&self, connector: &Arc<dyn Connector>) -> Result<()> {
        let mut conn = connector.connect().await?;
        for sql in [CREATE_SCHEMA, CREATE_REDO_STATEMENT, CREATE_DT_STATE] {
            conn.execute(sql, 1, false).await?;
        }
        Ok(())
    }

    pub fn open(&self, connector: Arc<dyn Connector>) {
        self.inner.pool.open(connector);
        if self.inner.abandon_age > Duration::ZERO {
            self.start_watchdog();
        }
    }

    pub fn close(&self) {
        *self.inner.watchdog.lock().unwrap() = None;
        self.inner.pool.close();
    }

    pub fn is_open(&self) -> bool {
        self.inner.pool.is_open()
    }

    /// The guarded transition statement StartCommit runs inside the data
    /// transaction so decision and data commit atomically.
    pub fn transition_sql(dtid: &str, state: DtState) -> Result<String> {
        let mut vars = BindVars::new();
        vars.insert("dtid".to_string(), BindValue::from(dtid));
        vars.insert("state".to_string(), BindValue::from(state.as_str()));
        bind_sql(TRANSITION_DT, &vars)
    }

    /// Persists the statement list of a prepared transaction.
    pub async fn save_redo(&self, ctx: &ReqCtx, dtid: &str, statements: &[String]) -> Result<()> {
        let mut bound = Vec::with_capacity(statements.len());
        for (seq, statement) in statements.iter().enumerate() {
            let mut vars = BindVars::new();
            vars.insert("dtid".to_string(), BindValue::from(dtid));
            vars.insert("seq".to_string(), BindValue::from(seq as i64 + 1));
            vars.insert("statement".to_string(), BindValue::from(statement.as_str()));
            bound.push(bind_sql(INSERT_REDO, &vars)?);
        }
        self.in_transaction(ctx, &bound).await?;
        Ok(())
    }

    pub async fn read_redo(&self, ctx: &ReqCtx, dtid: &str) -> Result<Vec<String>> {
        let mut conn = self.inner.pool.get(ctx, None).await?;
        let sql = bind_dtid(READ_REDO, dtid)?;
        let result = conn.execute(&sql, METADATA_MAX_ROWS, false).await?;
        conn.recycle();
        Ok(result.rows.iter().filter_map(|row| row.first().and_then(|v| v.as_str()).map(str::to_string)).collect())
    }

    /// Replays the redo log and commits both the replay and the log
    /// deletion in one transaction. A missing redo log means the work was
    /// already committed; the call is idempotent.
    pub async fn commit_prepared(&self, ctx: &ReqCtx, dtid: &str) -> Result<()> {
        let statements = self.read_redo(ctx, dtid).await?;
        if statements.is_empty() {
            return Ok(());
        }
        let mut replay = statements;
        replay.push(bind_dtid(DELETE_REDO, dtid)?);
        self.in_transaction(ctx, &replay).await?;
        Ok(())
    }

    /// Discards the redo log of a transaction that will never commit.
    pub async fn discard_redo(&self, ctx: &ReqCtx, dtid: &str) -> Result<()> {
        self.in_transaction(ctx, &[bind_dtid(DELETE_REDO, dtid)?]).await?;
        Ok(())
    }

    /// Writes the PREPARE intent with the participant list.
    pub async fn create_transaction(&self, ctx: &ReqCtx, dtid: &str, participants: &[Target]) -> Result<()> {
        let participants = serde_json::to_string(participants)
            .map_err(|e| ServerError::new(ErrorKind::Internal, format!("cannot encode participants: {e}")))?;
        let mut vars = BindVars::new();
        vars.insert("dtid".to_string(), BindValue::from(dtid));
        vars.insert("time_created".to_string(), BindValue::from(now_millis()));
        vars.insert("participants".to_string(), BindValue::from(participants));
        let sql = bind_sql(INSERT_DT, &vars)?;
        self.in_transaction(ctx, &[sql]).await?;
        Ok(())
    }

    /// Moves the decision from PREPARE to `state`, failing if some other
    /// decision already won.
    pub async fn transition(&self, ctx: &ReqCtx, dtid: &str, state: DtState) -> Result<()> {
        let sql = Self::transition_sql(dtid, state)?;
        let results = self.in_transaction(ctx, &[sql]).await?;
        if results[0].rows_affected != 1 {
            return Err(ServerError::new(
                ErrorKind::Internal,
                format!("could not transition {dtid} to {}: it was concluded or decided already", state.as_str()),
            ));
        }
        Ok(())
    }

    /// Deletes the metadata. Terminal and idempotent.
    pub async fn conclude(&self, ctx: &ReqCtx, dtid: &str) -> Result<()> {
        self.in_transaction(ctx, &[bind_dtid(DELETE_DT, dtid)?]).await?;
        Ok(())
    }

    pub async fn read_transaction(&self, ctx: &ReqCtx, dtid: &str) -> Result<Option<TransactionMetadata>> {
        let mut conn = self.inner.pool.get(ctx, None).await?;
        let sql = bind_dtid(READ_DT, dtid)?;
        let result = conn.execute(&sql, 1, false).await?;
        conn.recycle();
        match result.rows.first() {
            None => Ok(None),
            Some(row) => parse_metadata(row).map(Some),
        }
    }

    /// Metadata rows older than `age`, due for coordinator resolution.
    pub async fn abandoned(&self, ctx: &ReqCtx, age: Duration) -> Result<Vec<TransactionMetadata>> {
        let cutoff = now_millis() - age.as_millis() as i64;
        let mut vars = BindVars::new();
        vars.insert("cutoff".to_string(), BindValue::from(cutoff));
        let sql = bind_sql(READ_ABANDONED, &vars)?;
        let mut conn = self.inner.pool.get(ctx, None).await?;
        let result = conn.execute(&sql, METADATA_MAX_ROWS, false).await?;
        conn.recycle();
        result.rows.iter().map(|row| parse_metadata(row)).collect()
    }

    async fn in_transaction(&self, ctx: &ReqCtx, statements: &[String]) -> Result<Vec<QueryResult>> {
        let mut conn = self.inner.pool.get(ctx, None).await?;
        conn.execute("begin", 1, false).await?;
        let mut results = Vec::with_capacity(statements.len());
        for sql in statements {
            match conn.execute(sql, METADATA_MAX_ROWS, false).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    let _ = conn.execute("rollback", 1, false).await;
                    conn.recycle();
                    return Err(err);
                },
            }
        }
        conn.execute("commit", 1, false).await?;
        conn.recycle();
        Ok(results)
    }

    fn start_watchdog(&self) {
        let (owner, mut watcher) = drop_watcher();
        *self.inner.watchdog.lock().unwrap() = Some(owner);
        let twopc = self.clone();
        let interval = (twopc.inner.abandon_age / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => twopc.report_abandoned().await,
                    _ = watcher.dropped() => break,
                }
            }
        });
    }

    async fn report_abandoned(&self) {
        match self.abandoned(&ReqCtx::local(), self.inner.abandon_age).await {
            Ok(abandoned) if !abandoned.is_empty() => {
                let dtids: Vec<_> = abandoned.iter().map(|m| m.dtid.as_str()).collect();
                warn!(
                    "{} unresolved transactions to be resolved by coordinator {}: {dtids:?}",
                    abandoned.len(),
                    self.inner.coordinator_address,
                );
            },
            Ok(_) => {},
            Err(err) => warn!("abandoned transaction scan failed: {err}"),
        }
    }
}

fn bind_dtid(sql: &str, dtid: &str) -> Result<String> {
    let mut vars = BindVars::new();
    vars.insert("dtid".to_string(), BindValue::from(dtid));
    bind_sql(sql, &vars)
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn parse_metadata(row: &[Value]) -> Result<TransactionMetadata> {
    if row.len() < 4 {
        return Err(ServerError::new(ErrorKind::Internal, "short dt_state row"));
    }
    let dtid = row[0].as_str().unwrap_or_default().to_string();
    let state = DtState::parse(row[1].as_str().unwrap_or_default())?;
    let time_created = row[2].as_i64().unwrap_or_default();
    let participants = match row[3].as_str() {
        Some(json) if !json.is_empty() => serde_json::from_str(json)
            .map_err(|e| ServerError::new(ErrorKind::Internal, format!("corrupt participants column: {e}")))?,
        _ => Vec::new(),
    };
    Ok(TransactionMetadata { dtid, state, time_created, participants })
}
