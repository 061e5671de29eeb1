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

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::mpsc;

use super::{Connection, Connector, SchemaCatalog};
use crate::error::{Result, ServerError};
use crate::schema::Table;
use crate::types::QueryResult;

/// In-memory stand-in for the backing database. Results are scripted per
/// statement (exact match first, then registered prefixes); unscripted
/// statements succeed with an empty result. Every executed statement is
/// recorded, which is what most tests assert against.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    results: HashMap<String, QueryResult>,
    patterns: Vec<(String, QueryResult)>,
    failures: HashMap<String, ServerError>,
    log: Vec<String>,
    tables: Vec<Table>,
    connect_failure: Option<ServerError>,
    connections: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the result for an exact statement.
    pub fn add_query(&self, sql: impl Into<String>, result: QueryResult) {
        self.state.lock().unwrap().results.insert(sql.into(), result);
    }

    /// Scripts the result for every statement starting with `prefix`.
    pub fn add_query_pattern(&self, prefix: impl Into<String>, result: QueryResult) {
        self.state.lock().unwrap().patterns.push((prefix.into(), result));
    }

    /// Makes the given statement fail with `error`.
    pub fn fail_query(&self, sql: impl Into<String>, error: ServerError) {
        self.state.lock().unwrap().failures.insert(sql.into(), error);
    }

    pub fn remove_failure(&self, sql: &str) {
        self.state.lock().unwrap().failures.remove(sql);
    }

    pub fn add_table(&self, table: Table) {
        self.state.lock().unwrap().tables.push(table);
    }

    /// Makes new connections fail until cleared with `None`.
    pub fn fail_connections(&self, error: Option<ServerError>) {
        self.state.lock().unwrap().connect_failure = error;
    }

    /// All statements executed so far, oldest first.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_queries(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Number of currently open connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.connect_failure {
            return Err(error.clone());
        }
        state.connections += 1;
        Ok(Box::new(MemoryConnection { state: self.state.clone() }))
    }
}

#[async_trait]
impl SchemaCatalog for MemoryBackend {
    async fn load_tables(&self) -> Result<Vec<Table>> {
        Ok(self.state.lock().unwrap().tables.clone())
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    fn lookup(&self, sql: &str) -> Result<QueryResult> {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());
        if let Some(error) = state.failures.get(sql) {
            return Err(error.clone());
        }
        if let Some(result) = state.results.get(sql) {
            return Ok(result.clone());
        }
        for (prefix, result) in &state.patterns {
            if sql.starts_with(prefix.as_str()) {
                return Ok(result.clone());
            }
        }
        Ok(QueryResult::default())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.state.lock().unwrap().connections -= 1;
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str, max_rows: usize, want_fields: bool) -> Result<QueryResult> {
        let mut result = self.lookup(sql)?;
        result.rows.truncate(max_rows);
        if !want_fields {
            result.fields.clear();
        }
        Ok(result)
    }

    async fn stream(&mut self, sql: &str, sink: &mpsc::Sender<QueryResult>) -> Result<()> {
        let result = self.lookup(sql)?;
        let fields = QueryResult { fields: result.fields.clone(), ..Default::default() };
        if sink.send(fields).await.is_err() {
            return Ok(());
        }
        for row in result.rows {
            let chunk = QueryResult { rows: vec![row], ..Default::default() };
            if sink.send(chunk).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use assertor::*;

    use super::*;
    use crate::error::ErrorKind;
    use crate::types::{Field, Value};

    fn one_row_result() -> QueryResult {
        QueryResult {
            fields: vec![Field::new("id", "INT64")],
            rows: vec![vec![Value::Int(1)]],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scripted_and_default_results() {
        let backend = MemoryBackend::new();
        backend.add_query("select id from t", one_row_result());
        let mut conn = backend.connect().await.unwrap();
        let result = conn.execute("select id from t", 100, true).await.unwrap();
        assert_that!(result.rows).has_length(1);
        let result = conn.execute("set names utf8", 100, true).await.unwrap();
        assert_that!(result).is_equal_to(QueryResult::default());
        assert_that!(backend.queries()).is_equal_to(vec![
            "select id from t".to_string(),
            "set names utf8".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_pattern_and_failure() {
        let backend = MemoryBackend::new();
        backend.add_query_pattern("select id", one_row_result());
        backend.fail_query("select boom", ServerError::new(ErrorKind::Unknown, "boom"));
        let mut conn = backend.connect().await.unwrap();
        let result = conn.execute("select id from anywhere", 100, true).await.unwrap();
        assert_that!(result.rows).has_length(1);
        let err = conn.execute("select boom", 100, true).await.unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_max_rows_truncation() {
        let backend = MemoryBackend::new();
        let result = QueryResult {
            rows: vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]],
            ..Default::default()
        };
        backend.add_query("select * from t", result);
        let mut conn = backend.connect().await.unwrap();
        let result = conn.execute("select * from t", 2, true).await.unwrap();
        assert_that!(result.rows).has_length(2);
    }

    #[tokio::test]
    async fn test_connection_count_and_failure() {
        let backend = MemoryBackend::new();
        let conn = backend.connect().await.unwrap();
        assert_that!(backend.connection_count()).is_equal_to(1);
        drop(conn);
        assert_that!(backend.connection_count()).is_equal_to(0);
        backend.fail_connections(Some(ServerError::new(ErrorKind::Unknown, "down")));
        assert_that!(backend.connect().await.is_err()).is_true();
    }

    #[tokio::test]
    async fn test_stream_chunks() {
        let backend = MemoryBackend::new();
        backend.add_query("select id from t", {
            QueryResult {
                fields: vec![Field::new("id", "INT64")],
                rows: vec![vec![Value::Int(1)], vec![Value::Int(2)]],
                ..Default::default()
            }
        });
        let mut conn = backend.connect().await.unwrap();
        let (sender, mut receiver) = mpsc::channel(16);
        conn.stream("select id from t", &sender).await.unwrap();
        drop(sender);
        let fields = receiver.recv().await.unwrap();
        assert_that!(fields.fields).has_length(1);
        assert_that!(fields.rows).is_empty();
        let mut rows = 0;
        while let Some(chunk) = receiver.recv().await {
            rows += chunk.rows.len();
        }
        assert_that!(rows).is_equal_to(2);
    }
}
