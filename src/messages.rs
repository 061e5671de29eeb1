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

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, Result, ServerError};
use crate::schema::{SchemaEngine, TableKind};
use crate::types::{BindValue, BindVars, Field, QueryResult, Value};

/// Purge never deletes more than this many rows per call.
const PURGE_BATCH: usize = 500;

/// What a committed message-table change publishes to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDigest {
    pub table: String,
    pub statement: String,
}

/// Synthesizes the canonical message DMLs (ack, postpone, purge) and fans
/// committed message-table changes out to stream subscribers.
#[derive(Clone)]
pub struct MessagerEngine {
    inner: Arc<MessagerInner>,
}

struct MessagerInner {
    schema: SchemaEngine,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicUsize,
    open: AtomicBool,
}

struct Subscriber {
    id: usize,
    sender: mpsc::Sender<QueryResult>,
}

impl MessagerEngine {
    pub fn new(schema: SchemaEngine) -> Self {
        Self {
            inner: Arc::new(MessagerInner {
                schema,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicUsize::new(0),
                open: AtomicBool::new(false),
            }),
        }
    }

    pub fn open(&self) {
        self.inner.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.subscribers.lock().unwrap().clear();
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn message_table(&self, name: &str) -> Result<()> {
        match self.inner.schema.get_table(name) {
            Some(table) if table.kind == TableKind::Message => Ok(()),
            _ => Err(ServerError::new(ErrorKind::BadInput, format!("{name} is not a message table"))),
        }
    }

    /// Registers a subscriber for a message table's row stream.
    pub fn subscribe(&self, table: &str, sender: mpsc::Sender<QueryResult>) -> Result<usize> {
        if !self.is_open() {
            return Err(ServerError::new(ErrorKind::QueryNotServed, "messager engine is closed"));
        }
        self.message_table(table)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.entry_ref(table).or_default().push(Subscriber { id, sender });
        Ok(id)
    }

    pub fn unsubscribe(&self, id: usize) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        for list in subscribers.values_mut() {
            list.retain(|s| s.id != id);
        }
    }

    /// Publishes committed message digests. Sends never block; a saturated
    /// subscriber misses the digest and catches up from the table.
    pub fn publish(&self, digests: &[MessageDigest]) {
        let subscribers = self.inner.subscribers.lock().unwrap();
        for digest in digests {
            let Some(list) = subscribers.get(&digest.table) else {
                continue;
            };
            let result = QueryResult {
                fields: vec![Field::new("statement", "VARCHAR")],
                rows: vec![vec![Value::Str(digest.statement.clone())]],
                ..Default::default()
            };
            for subscriber in list {
                let _ = subscriber.sender.try_send(result.clone());
            }
        }
    }

    /// Ack: stamp acked time and clear scheduling for the given ids.
    pub fn generate_ack_query(&self, table: &str, ids: &[String]) -> Result<(String, BindVars)> {
        self.message_table(table)?;
        let sql = format!(
            "update {table} set time_acked = :time_acked, time_next = null \
             where id in :ids and time_acked is null"
        );
        let mut vars = BindVars::new();
        vars.insert("time_acked".to_string(), BindValue::from(now_millis()));
        vars.insert("ids".to_string(), id_list(ids));
        Ok((sql, vars))
    }

    /// Postpone: push the next delivery out and bump the epoch.
    pub fn generate_postpone_query(&self, table: &str, ids: &[String]) -> Result<(String, BindVars)> {
        self.message_table(table)?;
        let sql = format!(
            "update {table} set time_next = :time_next, epoch = epoch + 1 \
             where id in :ids and time_acked is null"
        );
        let mut vars = BindVars::new();
        vars.insert("time_next".to_string(), BindValue::from(now_millis()));
        vars.insert("ids".to_string(), id_list(ids));
        Ok((sql, vars))
    }

    /// Purge: drop acked rows scheduled before the cutoff, capped per call.
    pub fn generate_purge_query(&self, table: &str, time_cutoff: i64) -> Result<(String, BindVars)> {
        self.message_table(table)?;
        let sql = format!(
            "delete from {table} where time_scheduled < :time_scheduled \
             and time_acked is not null limit {PURGE_BATCH}"
        );
        let mut vars = BindVars::new();
        vars.insert("time_scheduled".to_string(), BindValue::from(time_cutoff));
        Ok((sql, vars))
    }
}

fn id_list(ids: &[String]) -> BindValue {
    BindValue::List(ids.iter().map(|id| Value::Str(id.clone())).collect())
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assertor::*;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::schema::Table;

    async fn messager() -> MessagerEngine {
        let backend = MemoryBackend::new();
        backend.add_table(
            Table::new("msg", TableKind::Message).with_columns(&["id", "time_scheduled", "time_acked"]).with_pk(&["id"]),
        );
        backend.add_table(Table::new("t", TableKind::Ordinary).with_pk(&["id"]));
        let schema = SchemaEngine::new();
        schema.open(Arc::new(backend), Duration::from_secs(3600)).await.unwrap();
        let messager = MessagerEngine::new(schema);
        messager.open();
        messager
    }

    #[tokio::test]
    async fn test_ack_query_shape() {
        let messager = messager().await;
        let (sql, vars) = messager.generate_ack_query("msg", &["1".to_string(), "2".to_string()]).unwrap();
        assert_that!(sql.as_str())
            .is_equal_to("update msg set time_acked = :time_acked, time_next = null where id in :ids and time_acked is null");
        assert_that!(vars.contains_key("time_acked")).is_true();
        let bound = crate::types::bind_sql(&sql, &vars).unwrap();
        assert_that!(bound.contains("id in ('1', '2')")).is_true();
    }

    #[tokio::test]
    async fn test_purge_query_is_capped() {
        let messager = messager().await;
        let (sql, _vars) = messager.generate_purge_query("msg", 12345).unwrap();
        assert_that!(sql.ends_with("limit 500")).is_true();
    }

    #[tokio::test]
    async fn test_non_message_table_is_rejected() {
        let messager = messager().await;
        let err = messager.generate_ack_query("t", &["1".to_string()]).unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
        let (sender, _receiver) = mpsc::channel(1);
        let err = messager.subscribe("t", sender).unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_without_blocking() {
        let messager = messager().await;
        let (sender, mut receiver) = mpsc::channel(1);
        let id = messager.subscribe("msg", sender).unwrap();
        let digests = vec![
            MessageDigest { table: "msg".to_string(), statement: "insert 1".to_string() },
            MessageDigest { table: "msg".to_string(), statement: "insert 2".to_string() },
        ];
        // Channel capacity is one: the second digest is dropped, not blocked on.
        messager.publish(&digests);
        let first = receiver.recv().await.unwrap();
        assert_that!(first.rows[0][0]).is_equal_to(Value::Str("insert 1".to_string()));
        assert_that!(receiver.try_recv().is_err()).is_true();
        messager.unsubscribe(id);
        messager.publish(&digests);
        assert_that!(receiver.try_recv().is_err()).is_true();
    }

    #[tokio::test]
    async fn test_closed_engine_rejects_subscription() {
        let messager = messager().await;
        messager.close();
        let (sender, _receiver) = mpsc::channel(1);
        let err = messager.subscribe("msg", sender).unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::QueryNotServed);
    }
}
