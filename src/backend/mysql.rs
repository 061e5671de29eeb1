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

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts};
use tokio::sync::mpsc;

use super::{Connection, Connector, SchemaCatalog};
use crate::error::{ErrorKind, Result, ServerError};
use crate::schema::{Column, Table, TableKind};
use crate::types::{Field, QueryResult, Value};

const STREAM_CHUNK_ROWS: usize = 64;

const TABLES_QUERY: &str = "select table_name, table_comment from information_schema.tables \
     where table_schema = database()";
const COLUMNS_QUERY: &str = "select table_name, column_name, column_key from information_schema.columns \
     where table_schema = database() order by table_name, ordinal_position";

/// Connects to the backing MySQL over the wire.
pub struct MysqlConnector {
    opts: Opts,
}

impl MysqlConnector {
    pub fn new(url: &str) -> Result<Self> {
        let opts =
            Opts::from_url(url).map_err(|e| ServerError::new(ErrorKind::BadInput, format!("invalid db url: {e}")))?;
        Ok(Self { opts })
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = Conn::new(self.opts.clone()).await.map_err(convert_error)?;
        Ok(Box::new(MysqlConnection { conn, broken: false }))
    }
}

#[async_trait]
impl SchemaCatalog for MysqlConnector {
    async fn load_tables(&self) -> Result<Vec<Table>> {
        let mut conn = Conn::new(self.opts.clone()).await.map_err(convert_error)?;
        let mut tables = Vec::new();
        for row in conn.query::<mysql_async::Row, _>(TABLES_QUERY).await.map_err(convert_error)? {
            let values = row.unwrap();
            let name = text(&values[0]);
            let comment = text(&values[1]);
            let kind = if comment.contains("shardgate_message") {
                TableKind::Message
            } else if comment.contains("shardgate_sequence") {
                TableKind::Sequence
            } else {
                TableKind::Ordinary
            };
            tables.push(Table { name, kind, columns: Vec::new(), pk_columns: Vec::new() });
        }
        for row in conn.query::<mysql_async::Row, _>(COLUMNS_QUERY).await.map_err(convert_error)? {
            let values = row.unwrap();
            let table_name = text(&values[0]);
            let column_name = text(&values[1]);
            let key = text(&values[2]);
            if let Some(table) = tables.iter_mut().find(|t| t.name == table_name) {
                if key == "PRI" {
                    table.pk_columns.push(column_name.clone());
                }
                table.columns.push(Column { name: column_name });
            }
        }
        Ok(tables)
    }
}

struct MysqlConnection {
    conn: Conn,
    broken: bool,
}

#[async_trait]
impl Connection for MysqlConnection {
    async fn execute(&mut self, sql: &str, max_rows: usize, want_fields: bool) -> Result<QueryResult> {
        let mut query_result = match self.conn.query_iter(sql).await {
            Ok(query_result) => query_result,
            Err(e) => return Err(self.fail(e)),
        };
        let fields = match (want_fields, query_result.columns()) {
            (true, Some(columns)) => columns
                .iter()
                .map(|c| Field::new(c.name_str().into_owned(), format!("{:?}", c.column_type())))
                .collect(),
            _ => Vec::new(),
        };
        let mut rows = Vec::new();
        while let Some(row) = query_result.next().await.map_err(convert_error)? {
            if rows.len() < max_rows {
                rows.push(convert_row(row));
            }
        }
        let rows_affected = query_result.affected_rows();
        let insert_id = query_result.last_insert_id().unwrap_or(0);
        drop(query_result);
        Ok(QueryResult { fields, rows, rows_affected, insert_id })
    }

    async fn stream(&mut self, sql: &str, sink: &mpsc::Sender<QueryResult>) -> Result<()> {
        let mut query_result = match self.conn.query_iter(sql).await {
            Ok(query_result) => query_result,
            Err(e) => return Err(self.fail(e)),
        };
        let fields = match query_result.columns() {
            Some(columns) => columns
                .iter()
                .map(|c| Field::new(c.name_str().into_owned(), format!("{:?}", c.column_type())))
                .collect(),
            None => Vec::new(),
        };
        if sink.send(QueryResult { fields, ..Default::default() }).await.is_err() {
            return Ok(());
        }
        let mut chunk = Vec::with_capacity(STREAM_CHUNK_ROWS);
        while let Some(row) = query_result.next().await.map_err(convert_error)? {
            chunk.push(convert_row(row));
            if chunk.len() == STREAM_CHUNK_ROWS {
                let rows = std::mem::replace(&mut chunk, Vec::with_capacity(STREAM_CHUNK_ROWS));
                if sink.send(QueryResult { rows, ..Default::default() }).await.is_err() {
                    return Ok(());
                }
            }
        }
        if !chunk.is_empty() && sink.send(QueryResult { rows: chunk, ..Default::default() }).await.is_err() {
            return Ok(());
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.broken
    }
}

impl MysqlConnection {
    fn fail(&mut self, e: mysql_async::Error) -> ServerError {
        if matches!(e, mysql_async::Error::Io(_) | mysql_async::Error::Driver(_)) {
            self.broken = true;
        }
        convert_error(e)
    }
}

fn convert_error(e: mysql_async::Error) -> ServerError {
    match e {
        mysql_async::Error::Server(server) => {
            ServerError::from_backend(server.code, server.state, server.message)
        },
        mysql_async::Error::Io(io) => {
            ServerError::with_sql(ErrorKind::Unknown, crate::error::sqlerror::CR_SERVER_LOST, "HY000", io.to_string())
        },
        other => ServerError::new(ErrorKind::Unknown, other.to_string()),
    }
}

fn convert_row(row: mysql_async::Row) -> Vec<Value> {
    row.unwrap().into_iter().map(convert_value).collect()
}

fn convert_value(value: mysql_async::Value) -> Value {
    match value {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Int(v) => Value::Int(v),
        mysql_async::Value::UInt(v) => Value::UInt(v),
        mysql_async::Value::Float(v) => Value::Float(v as f64),
        mysql_async::Value::Double(v) => Value::Float(v),
        mysql_async::Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::Str(text),
            Err(err) => Value::Bytes(err.into_bytes()),
        },
        other => Value::Str(other.as_sql(true)),
    }
}

fn text(value: &mysql_async::Value) -> String {
    match value {
        mysql_async::Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => other.as_sql(true),
    }
}
