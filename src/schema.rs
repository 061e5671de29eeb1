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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::backend::SchemaCatalog;
use crate::error::Result;
use crate::utils::{drop_watcher, DropOwner};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TableKind {
    Ordinary,
    Sequence,
    Message,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
}

/// Metadata for one served table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Table {
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<Column>,
    pub pk_columns: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>, kind: TableKind) -> Self {
        Self { name: name.into(), kind, columns: Vec::new(), pk_columns: Vec::new() }
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| Column { name: c.to_string() }).collect();
        self
    }

    pub fn with_pk(mut self, pk_columns: &[&str]) -> Self {
        self.pk_columns = pk_columns.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// In-memory allocation window of a sequence table, advanced by NEXTVAL
/// execution and discarded on schema reload.
#[derive(Debug, Default)]
pub struct SequenceWindow {
    pub next: i64,
    pub last: i64,
}

/// Holds the table map loaded from the catalog, refreshing it periodically
/// and on demand. Reload listeners get notified so dependent caches can
/// drop state derived from the old schema.
#[derive(Clone)]
pub struct SchemaEngine {
    inner: Arc<SchemaInner>,
}

struct SchemaInner {
    catalog: Mutex<Option<Arc<dyn SchemaCatalog>>>,
    tables: Mutex<HashMap<String, Arc<Table>>>,
    sequences: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SequenceWindow>>>>,
    version: AtomicU64,
    listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    ticker: Mutex<Option<DropOwner>>,
}

impl SchemaEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchemaInner {
                catalog: Mutex::new(None),
                tables: Mutex::new(HashMap::new()),
                sequences: Mutex::new(HashMap::new()),
                version: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                ticker: Mutex::new(None),
            }),
        }
    }

    pub async fn open(&self, catalog: Arc<dyn SchemaCatalog>, reload_interval: Duration) -> Result<()> {
        *self.inner.catalog.lock().unwrap() = Some(catalog);
        self.reload().await?;
        let (owner, mut watcher) = drop_watcher();
        *self.inner.ticker.lock().unwrap() = Some(owner);
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(reload_interval) => {
                        if let Err(err) = engine.reload().await {
                            warn!("periodic schema reload failed: {err}");
                        }
                    },
                    _ = watcher.dropped() => break,
                }
            }
        });
        Ok(())
    }

    pub fn close(&self) {
        *self.inner.ticker.lock().unwrap() = None;
        *self.inner.catalog.lock().unwrap() = None;
        self.inner.tables.lock().unwrap().clear();
        self.inner.sequences.lock().unwrap().clear();
    }

    /// Fetches the table list from the catalog and swaps it in. Old tables
    /// are kept when the catalog is unreachable.
    pub async fn reload(&self) -> Result<()> {
        let catalog = self.inner.catalog.lock().unwrap().clone();
        let Some(catalog) = catalog else {
            return Ok(());
        };
        let tables = catalog.load_tables().await?;
        let count = tables.len();
        let map = tables.into_iter().map(|t| (t.name.clone(), Arc::new(t))).collect();
        *self.inner.tables.lock().unwrap() = map;
        self.inner.sequences.lock().unwrap().clear();
        let version = self.inner.version.fetch_add(1, Ordering::SeqCst) + 1;
        info!("schema loaded: {count} tables, version {version}");
        for listener in self.inner.listeners.lock().unwrap().iter() {
            listener();
        }
        Ok(())
    }

    /// Kicks off an asynchronous reload.
    pub fn trigger(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.reload().await {
                warn!("schema reload failed: {err}");
            }
        });
    }

    pub fn subscribe_reload(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.inner.listeners.lock().unwrap().push(Box::new(listener));
    }

    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.inner.tables.lock().unwrap().get(name).cloned()
    }

    pub fn tables(&self) -> Vec<Arc<Table>> {
        let mut tables: Vec<_> = self.inner.tables.lock().unwrap().values().cloned().collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }

    /// The shared allocation window for a sequence table.
    pub fn sequence_window(&self, table: &str) -> Arc<tokio::sync::Mutex<SequenceWindow>> {
        let mut sequences = self.inner.sequences.lock().unwrap();
        sequences.entry_ref(table).or_default().clone()
    }
}

impl Default for SchemaEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assertor::*;

    use super::*;
    use crate::backend::MemoryBackend;

    fn backend_with_tables() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_table(Table::new("t", TableKind::Ordinary).with_columns(&["id", "name"]).with_pk(&["id"]));
        backend.add_table(Table::new("seq", TableKind::Sequence).with_columns(&["id", "next_id", "cache"]));
        backend
    }

    #[tokio::test]
    async fn test_open_loads_tables() {
        let engine = SchemaEngine::new();
        engine.open(Arc::new(backend_with_tables()), Duration::from_secs(3600)).await.unwrap();
        let table = engine.get_table("t").unwrap();
        assert_that!(table.pk_columns).is_equal_to(vec!["id".to_string()]);
        assert_that!(engine.get_table("seq").unwrap().kind).is_equal_to(TableKind::Sequence);
        assert_that!(engine.get_table("missing").is_none()).is_true();
        assert_that!(engine.version()).is_equal_to(1);
    }

    #[tokio::test]
    async fn test_reload_notifies_listeners() {
        let engine = SchemaEngine::new();
        engine.open(Arc::new(backend_with_tables()), Duration::from_secs(3600)).await.unwrap();
        let reloads = Arc::new(AtomicUsize::new(0));
        engine.subscribe_reload({
            let reloads = reloads.clone();
            move || {
                reloads.fetch_add(1, Ordering::SeqCst);
            }
        });
        engine.reload().await.unwrap();
        assert_that!(reloads.load(Ordering::SeqCst)).is_equal_to(1);
        assert_that!(engine.version()).is_equal_to(2);
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_tables() {
        let backend = backend_with_tables();
        let engine = SchemaEngine::new();
        engine.open(Arc::new(backend.clone()), Duration::from_secs(3600)).await.unwrap();
        backend.add_table(Table::new("extra", TableKind::Ordinary));
        engine.reload().await.unwrap();
        assert_that!(engine.get_table("extra").is_some()).is_true();
    }

    #[tokio::test]
    async fn test_sequence_window_shared_until_reload() {
        let engine = SchemaEngine::new();
        engine.open(Arc::new(backend_with_tables()), Duration::from_secs(3600)).await.unwrap();
        {
            let window = engine.sequence_window("seq");
            window.lock().await.next = 5;
        }
        let window = engine.sequence_window("seq");
        assert_that!(window.lock().await.next).is_equal_to(5);
        engine.reload().await.unwrap();
        let window = engine.sequence_window("seq");
        assert_that!(window.lock().await.next).is_equal_to(0);
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let engine = SchemaEngine::new();
        engine.open(Arc::new(backend_with_tables()), Duration::from_secs(3600)).await.unwrap();
        engine.close();
        assert_that!(engine.get_table("t").is_none()).is_true();
    }
}
