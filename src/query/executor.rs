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

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::QueryEngine;
use crate::acl::Access;
use crate::error::{ErrorKind, Result, ServerError};
use crate::messages::{MessageDigest, MessagerEngine};
use crate::plan::{NextvalCount, Plan, PlanKind, RuleAction};
use crate::schema::SequenceWindow;
use crate::txn::{TxConnection, TxEngine};
use crate::types::{bind_sql, BindVars, ExecuteOptions, Field, IncludedFields, QueryResult, ReqCtx, Value};

/// Executes one resolved plan: picks the connection source, applies the
/// per-plan semantics, and enforces row and DML bounds.
pub struct QueryExecutor {
    pub ctx: ReqCtx,
    pub sql: String,
    pub bind_vars: BindVars,
    pub tx_id: i64,
    pub options: ExecuteOptions,
    pub plan: Arc<Plan>,
    pub qe: QueryEngine,
    pub te: TxEngine,
    pub messager: MessagerEngine,
}

impl QueryExecutor {
    pub async fn execute(&self) -> Result<QueryResult> {
        self.check_rules()?;
        self.check_acl()?;
        let bound = self.bound_sql()?;
        if self.tx_id != 0 {
            let mut conn = self.te.txpool.checkout(self.tx_id)?;
            let result = self.exec_in_tx_conn(&mut conn, &bound).await;
            self.te.txpool.release(conn);
            return result;
        }
        match self.plan.kind {
            PlanKind::Nextval => self.execute_nextval().await,
            PlanKind::PassSelect | PlanKind::Other | PlanKind::Set => self.fetch(&bound).await,
            PlanKind::Ddl => {
                let result = self.fetch(&bound).await?;
                self.qe.schema().trigger();
                Ok(result)
            },
            PlanKind::SelectLock => {
                Err(ServerError::new(ErrorKind::BadInput, "select with lock disallowed outside transaction"))
            },
            PlanKind::PassDml => {
                Err(ServerError::new(ErrorKind::BadInput, "unpredictable DML disallowed outside transaction"))
            },
            PlanKind::DmlPk
            | PlanKind::DmlSubquery
            | PlanKind::InsertPk
            | PlanKind::InsertSubquery
            | PlanKind::UpsertPk
            | PlanKind::InsertMessage
            | PlanKind::DmlMessage => {
                if self.qe.auto_commit() {
                    self.execute_autocommit(&bound).await
                } else {
                    Err(ServerError::new(ErrorKind::BadInput, "DML disallowed outside transaction"))
                }
            },
        }
    }

    /// Streams the result in chunks: fields first, then rows. The stream is
    /// bounded by the caller's cancellation scope and the terminate surface,
    /// never by an engine deadline.
    pub async fn stream(&self, sink: &mpsc::Sender<QueryResult>) -> Result<()> {
        self.check_rules()?;
        self.check_acl()?;
        let bound = self.bound_sql()?;
        let cancel = self.ctx.cancel.child_token();
        let id = self.qe.streams().register(self.sql.as_str(), cancel.clone());
        let _unregister = scopeguard::guard((), |_| self.qe.streams().unregister(id));
        let mut conn = self.qe.stream_conns().get(&self.ctx, None).await?;
        let result = tokio::select! {
            result = self.stream_conn(&mut conn, &bound, sink) => result,
            _ = cancel.cancelled() => return Ok(()),
        };
        if result.is_ok() {
            conn.recycle();
        }
        result
    }

    async fn stream_conn(
        &self,
        conn: &mut crate::backend::PooledConn,
        bound: &str,
        sink: &mpsc::Sender<QueryResult>,
    ) -> Result<()> {
        match self.options.included_fields {
            IncludedFields::TypeAndName => conn.stream(bound, sink).await,
            included => {
                let (sender, mut receiver) = mpsc::channel::<QueryResult>(16);
                let forward = async {
                    while let Some(chunk) = receiver.recv().await {
                        if sink.send(chunk.strip_metadata(included)).await.is_err() {
                            break;
                        }
                    }
                };
                let produce = async {
                    let result = conn.stream(bound, &sender).await;
                    drop(sender);
                    result
                };
                let (result, ()) = tokio::join!(produce, forward);
                result
            },
        }
    }

    fn check_rules(&self) -> Result<()> {
        let Some((name, action)) = self.qe.rules().evaluate(&self.ctx.caller, &self.plan) else {
            return Ok(());
        };
        let message = format!("query disallowed due to rule {name}");
        Err(match action {
            RuleAction::Fail => ServerError::new(ErrorKind::BadInput, message),
            RuleAction::FailRetry => ServerError::new(ErrorKind::QueryNotServed, message),
        })
    }

    fn check_acl(&self) -> Result<()> {
        if self.ctx.is_local() {
            return Ok(());
        }
        let Some(table) = &self.plan.table_name else {
            return Ok(());
        };
        let access = Access::for_plan(self.plan.kind);
        if self.qe.check_access(&self.ctx.caller.user, table, access) {
            return Ok(());
        }
        if self.qe.strict_table_acl() {
            return Err(ServerError::new(
                ErrorKind::BadInput,
                format!("table acl error: {} cannot {} table {}", self.ctx.caller.user, access.as_str(), table),
            ));
        }
        warn!("table acl: {} lacks {} on table {}, allowed in non-strict mode", self.ctx.caller.user, access.as_str(), table);
        Ok(())
    }

    fn bound_sql(&self) -> Result<String> {
        let mut bound = bind_sql(&self.plan.sql, &self.bind_vars)?;
        if !self.plan.trailing_comment.is_empty() {
            bound.push(' ');
            bound.push_str(&self.plan.trailing_comment);
        }
        Ok(bound)
    }

    fn row_count_exceeded(&self) -> ServerError {
        ServerError::new(ErrorKind::ResourceExhausted, format!("Row count exceeded {}", self.qe.max_result_size()))
    }

    /// Plain fetch on the regular pool with the result-size bound.
    async fn fetch(&self, bound: &str) -> Result<QueryResult> {
        let max = self.qe.max_result_size();
        let mut conn = self.qe.conns().get(&self.ctx, None).await?;
        match conn.execute(bound, max + 1, true).await {
            Ok(result) => {
                conn.recycle();
                if result.rows.len() > max {
                    return Err(self.row_count_exceeded());
                }
                Ok(result)
            },
            Err(err) => {
                conn.recycle();
                Err(err)
            },
        }
    }

    async fn exec_in_tx_conn(&self, conn: &mut TxConnection, bound: &str) -> Result<QueryResult> {
        match self.plan.kind {
            PlanKind::PassSelect | PlanKind::SelectLock | PlanKind::Other => {
                let max = self.qe.max_result_size();
                let result = conn.exec(bound, max + 1, true).await?;
                if result.rows.len() > max {
                    return Err(self.row_count_exceeded());
                }
                Ok(result)
            },
            // Sequence allocation manages its own transactional window; it
            // does not join the caller's transaction.
            PlanKind::Nextval => self.execute_nextval().await,
            PlanKind::Set => {
                let result = conn.exec(bound, 1, false).await?;
                conn.record_query(bound);
                Ok(result)
            },
            PlanKind::Ddl => {
                let result = conn.exec(bound, 1, false).await?;
                self.qe.schema().trigger();
                Ok(result)
            },
            PlanKind::PassDml => {
                if self.qe.strict_mode() {
                    return Err(ServerError::new(
                        ErrorKind::BadInput,
                        "unpredictable DML disallowed in strict mode",
                    ));
                }
                let result = conn.exec(bound, 1, false).await?;
                conn.record_query(bound);
                Ok(result)
            },
            PlanKind::UpsertPk => self.exec_upsert(conn, bound).await,
            PlanKind::DmlPk | PlanKind::DmlSubquery => {
                let result = conn.exec(bound, 1, false).await?;
                let max = self.qe.max_dml_rows();
                if result.rows_affected as usize > max {
                    return Err(ServerError::new(
                        ErrorKind::ResourceExhausted,
                        format!("Row count exceeded {max}"),
                    ));
                }
                conn.record_query(bound);
                Ok(result)
            },
            PlanKind::InsertPk | PlanKind::InsertSubquery => {
                let result = conn.exec(bound, 1, false).await?;
                conn.record_query(bound);
                Ok(result)
            },
            PlanKind::InsertMessage | PlanKind::DmlMessage => {
                let result = conn.exec(bound, 1, false).await?;
                conn.record_query(bound);
                conn.record_message(MessageDigest {
                    table: self.plan.table_name.clone().unwrap_or_default(),
                    statement: bound.to_string(),
                });
                Ok(result)
            },
        }
    }

    /// Tries the bare insert; on duplicate key, promotes to the derived
    /// UPDATE exactly once and reports the combined row count.
    async fn exec_upsert(&self, conn: &mut TxConnection, bound: &str) -> Result<QueryResult> {
        match conn.exec(bound, 1, false).await {
            Ok(result) => {
                conn.record_query(bound);
                Ok(result)
            },
            Err(err) if err.kind == ErrorKind::Integrity => {
                let Some(update) = &self.plan.upsert_update else {
                    return Err(err);
                };
                let update = bind_sql(update, &self.bind_vars)?;
                let result = conn.exec(&update, 1, false).await?;
                conn.record_query(&update);
                Ok(QueryResult {
                    rows_affected: result.rows_affected + 1,
                    insert_id: result.insert_id,
                    ..Default::default()
                })
            },
            Err(err) => Err(err),
        }
    }

    /// Runs one DML inside an implicit transaction on the tx pool.
    async fn execute_autocommit(&self, bound: &str) -> Result<QueryResult> {
        let tx_id = self.te.txpool.begin(&self.ctx).await?;
        let mut conn = self.te.txpool.checkout(tx_id)?;
        let result = self.exec_in_tx_conn(&mut conn, bound).await;
        self.te.txpool.release(conn);
        match result {
            Ok(result) => {
                let digests = self.te.txpool.commit(&self.ctx, tx_id).await?;
                self.messager.publish(&digests);
                Ok(result)
            },
            Err(err) => {
                if let Err(rollback_err) = self.te.txpool.rollback(&self.ctx, tx_id).await {
                    warn!("rollback after failed autocommit DML failed: {rollback_err}");
                }
                Err(err)
            },
        }
    }

    async fn execute_nextval(&self) -> Result<QueryResult> {
        let table = match &self.plan.table {
            Some(table) => table.clone(),
            None => return Err(ServerError::new(ErrorKind::Internal, "sequence plan lost its table")),
        };
        let count = match &self.plan.nextval_count {
            Some(NextvalCount::Literal(n)) => *n,
            Some(NextvalCount::Bind(name)) => match self.bind_vars.get(name).and_then(|v| match v {
                crate::types::BindValue::Value(value) => value.as_i64(),
                _ => None,
            }) {
                Some(n) => n,
                None => return Err(ServerError::new(ErrorKind::BadInput, format!("missing bind var {name}"))),
            },
            None => return Err(ServerError::new(ErrorKind::Internal, "sequence plan lost its count")),
        };
        if count <= 0 {
            return Err(ServerError::new(ErrorKind::BadInput, format!("invalid sequence value count: {count}")));
        }
        let window = self.qe.schema().sequence_window(&table.name);
        let mut window = window.lock().await;
        if window.next + count > window.last {
            self.refill_window(&table.name, &mut window, count).await?;
        }
        let first = window.next;
        window.next += count;
        Ok(QueryResult {
            fields: vec![Field::new("nextval", "INT64")],
            rows: vec![vec![Value::Int(first)]],
            ..Default::default()
        })
    }

    /// Advances the on-disk next_id by whole multiples of the cache span
    /// under a for-update lock, then widens the in-memory window.
    async fn refill_window(&self, table: &str, window: &mut SequenceWindow, count: i64) -> Result<()> {
        let mut conn = self.qe.conns().get(&self.ctx, None).await?;
        conn.execute("begin", 1, false).await?;
        let select = format!("select next_id, cache from {table} where id = 0 for update");
        let result = match conn.execute(&select, 2, false).await {
            Ok(result) => result,
            Err(err) => {
                let _ = conn.execute("rollback", 1, false).await;
                conn.recycle();
                return Err(err);
            },
        };
        let row = match result.rows.first() {
            Some(row) if row.len() >= 2 => row,
            _ => {
                let _ = conn.execute("rollback", 1, false).await;
                conn.recycle();
                return Err(ServerError::new(ErrorKind::Internal, format!("unsupported sequence table: {table}")));
            },
        };
        let disk_next = row[0].as_i64().unwrap_or(0);
        let cache = row[1].as_i64().unwrap_or(0);
        if cache <= 0 {
            let _ = conn.execute("rollback", 1, false).await;
            conn.recycle();
            return Err(ServerError::new(ErrorKind::Internal, format!("invalid cache value in sequence {table}")));
        }
        if window.last < disk_next {
            window.next = disk_next;
            window.last = disk_next;
        }
        let needed = window.next + count - window.last;
        let blocks = (needed + cache - 1) / cache;
        let new_disk_next = window.last + blocks * cache;
        let update = format!("update {table} set next_id = {new_disk_next} where id = 0");
        if let Err(err) = conn.execute(&update, 1, false).await {
            let _ = conn.execute("rollback", 1, false).await;
            conn.recycle();
            return Err(err);
        }
        conn.execute("commit", 1, false).await?;
        conn.recycle();
        window.last = new_disk_next;
        Ok(())
    }
}
