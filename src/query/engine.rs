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
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::acl::{Access, TableAcl};
use crate::backend::{ConnPool, Connector, SchemaCatalog};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::plan::{Plan, PlanCache, Planner, QueryRuleSets};
use crate::schema::SchemaEngine;

/// One live streaming query as shown on `/streamqueryz`.
#[derive(Clone, Debug, Serialize)]
pub struct LiveStream {
    pub id: u64,
    pub sql: String,
    pub duration_ms: u64,
}

/// Registry of in-flight streaming queries, supporting targeted and bulk
/// termination through their cancellation scopes.
#[derive(Clone, Default)]
pub struct StreamQueryList {
    inner: Arc<Mutex<StreamListInner>>,
}

#[derive(Default)]
struct StreamListInner {
    next_id: u64,
    entries: HashMap<u64, StreamEntry>,
}

struct StreamEntry {
    sql: String,
    started: Instant,
    cancel: CancellationToken,
}

impl StreamQueryList {
    pub fn register(&self, sql: impl Into<String>, cancel: CancellationToken) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, StreamEntry { sql: sql.into(), started: Instant::now(), cancel });
        id
    }

    pub fn unregister(&self, id: u64) {
        self.inner.lock().unwrap().entries.remove(&id);
    }

    pub fn terminate(&self, id: u64) -> bool {
        match self.inner.lock().unwrap().entries.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            },
            None => false,
        }
    }

    pub fn terminate_all(&self) {
        for entry in self.inner.lock().unwrap().entries.values() {
            entry.cancel.cancel();
        }
    }

    pub fn list(&self) -> Vec<LiveStream> {
        let inner = self.inner.lock().unwrap();
        let mut list: Vec<_> = inner
            .entries
            .iter()
            .map(|(id, entry)| LiveStream {
                id: *id,
                sql: entry.sql.clone(),
                duration_ms: entry.started.elapsed().as_millis() as u64,
            })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }
}

/// The query engine: pools for regular and streaming reads, the plan cache
/// with its planner, rule sets, and the per-request limits.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<QueryEngineInner>,
}

struct QueryEngineInner {
    conns: ConnPool,
    stream_conns: ConnPool,
    schema: SchemaEngine,
    planner: Planner,
    cache: Arc<PlanCache>,
    rules: QueryRuleSets,
    acl: Arc<dyn TableAcl>,
    connector: Mutex<Option<Arc<dyn Connector>>>,
    streams: StreamQueryList,
    max_result_size: AtomicUsize,
    max_dml_rows: AtomicUsize,
    strict_mode: AtomicBool,
    auto_commit: AtomicBool,
    strict_table_acl: bool,
    schema_reload_interval: Duration,
}

impl QueryEngine {
    pub fn new(config: &ServerConfig, schema: SchemaEngine, acl: Arc<dyn TableAcl>) -> Self {
        let cache = Arc::new(PlanCache::new(config.query_cache_size));
        schema.subscribe_reload({
            let cache = cache.clone();
            move || cache.clear()
        });
        Self {
            inner: Arc::new(QueryEngineInner {
                conns: ConnPool::new("query", config.pool_size, config.idle_timeout()),
                stream_conns: ConnPool::new("stream", config.stream_pool_size, config.idle_timeout()),
                planner: Planner::new(schema.clone()),
                schema,
                cache,
                rules: QueryRuleSets::new(),
                acl,
                connector: Mutex::new(None),
                streams: StreamQueryList::default(),
                max_result_size: AtomicUsize::new(config.max_result_size),
                max_dml_rows: AtomicUsize::new(config.max_dml_rows),
                strict_mode: AtomicBool::new(config.strict_mode),
                auto_commit: AtomicBool::new(config.enable_auto_commit),
                strict_table_acl: config.strict_table_acl,
                schema_reload_interval: config.schema_reload_interval(),
            }),
        }
    }

    pub async fn open(&self, connector: Arc<dyn Connector>, catalog: Arc<dyn SchemaCatalog>) -> Result<()> {
        self.inner.schema.open(catalog, self.inner.schema_reload_interval).await?;
        self.inner.conns.open(connector.clone());
        self.inner.stream_conns.open(connector.clone());
        *self.inner.connector.lock().unwrap() = Some(connector);
        Ok(())
    }

    pub fn close(&self) {
        self.inner.streams.terminate_all();
        self.inner.conns.close();
        self.inner.stream_conns.close();
        self.inner.schema.close();
        self.inner.cache.clear();
        *self.inner.connector.lock().unwrap() = None;
    }

    pub fn is_open(&self) -> bool {
        self.inner.conns.is_open()
    }

    /// Resolves a statement through the plan cache, building at most once
    /// per key across concurrent misses.
    pub async fn get_plan(&self, sql: &str) -> Result<Arc<Plan>> {
        let planner = self.inner.planner.clone();
        self.inner.cache.get_or_build(sql, move || planner.build(sql)).await
    }

    /// True when a fresh backend connection can be opened.
    pub async fn is_mysql_reachable(&self) -> bool {
        let connector = self.inner.connector.lock().unwrap().clone();
        match connector {
            Some(connector) => connector.connect().await.is_ok(),
            None => false,
        }
    }

    pub fn check_access(&self, user: &str, table: &str, access: Access) -> bool {
        self.inner.acl.check(user, table, access)
    }

    pub fn strict_table_acl(&self) -> bool {
        self.inner.strict_table_acl
    }

    pub fn conns(&self) -> &ConnPool {
        &self.inner.conns
    }

    pub fn stream_conns(&self) -> &ConnPool {
        &self.inner.stream_conns
    }

    pub fn schema(&self) -> &SchemaEngine {
        &self.inner.schema
    }

    pub fn cache(&self) -> &PlanCache {
        &self.inner.cache
    }

    pub fn rules(&self) -> &QueryRuleSets {
        &self.inner.rules
    }

    pub fn streams(&self) -> &StreamQueryList {
        &self.inner.streams
    }

    pub fn max_result_size(&self) -> usize {
        self.inner.max_result_size.load(Ordering::SeqCst)
    }

    pub fn set_max_result_size(&self, value: usize) {
        self.inner.max_result_size.store(value, Ordering::SeqCst);
    }

    pub fn max_dml_rows(&self) -> usize {
        self.inner.max_dml_rows.load(Ordering::SeqCst)
    }

    pub fn set_max_dml_rows(&self, value: usize) {
        self.inner.max_dml_rows.store(value, Ordering::SeqCst);
    }

    pub fn strict_mode(&self) -> bool {
        self.inner.strict_mode.load(Ordering::SeqCst)
    }

    pub fn set_strict_mode(&self, on: bool) {
        self.inner.strict_mode.store(on, Ordering::SeqCst);
    }

    pub fn auto_commit(&self) -> bool {
        self.inner.auto_commit.load(Ordering::SeqCst)
    }

    pub fn set_auto_commit(&self, on: bool) {
        self.inner.auto_commit.store(on, Ordering::SeqCst);
    }
}
