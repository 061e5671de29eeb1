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

mod memory;
mod mysql;
mod pool;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use self::memory::MemoryBackend;
pub use self::mysql::MysqlConnector;
pub use self::pool::{ConnPool, PooledConn};
use crate::error::Result;
use crate::schema::Table;
use crate::types::QueryResult;

/// Hands out exclusive connections to the backing database.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// One exclusive backend connection. Every statement handed to it is fully
/// bound SQL; bind substitution happens above this seam.
#[async_trait]
pub trait Connection: Send {
    /// Executes the statement, fetching at most `max_rows` rows.
    async fn execute(&mut self, sql: &str, max_rows: usize, want_fields: bool) -> Result<QueryResult>;

    /// Executes the statement and emits one fields-only chunk followed by
    /// row chunks. A dropped sink terminates the stream without error.
    async fn stream(&mut self, sql: &str, sink: &mpsc::Sender<QueryResult>) -> Result<()>;

    /// Whether the connection may be returned to a pool for reuse.
    fn is_healthy(&self) -> bool;
}

/// Produces table metadata for the served database.
#[async_trait]
pub trait SchemaCatalog: Send + Sync + 'static {
    async fn load_tables(&self) -> Result<Vec<Table>>;
}
