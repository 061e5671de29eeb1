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

use super::QueryEngine;
use crate::error::{ErrorKind, Result, ServerError};
use crate::plan::PlanKind;
use crate::types::{bind_sql, BindVars, ReqCtx};

/// Safety bound on boundary discovery for FULL_SCAN.
const MAX_SPLITS: i64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitAlgorithm {
    EqualSplits,
    FullScan,
}

impl SplitAlgorithm {
    pub fn parse(name: &str) -> Result<SplitAlgorithm> {
        match name {
            "EQUAL_SPLITS" => Ok(SplitAlgorithm::EqualSplits),
            "FULL_SCAN" => Ok(SplitAlgorithm::FullScan),
            other => {
                Err(ServerError::new(ErrorKind::BadInput, format!("splitquery: unsupported algorithm: {other}")))
            },
        }
    }
}

/// One subquery of a split; the union of all splits equals the original
/// query's result.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySplit {
    pub sql: String,
    pub row_count: i64,
}

/// Splits a query over one column into range subqueries.
///
/// Exactly one of `split_count` and `rows_per_split` must be non-zero; the
/// other is derived from the table's row count.
pub async fn split_query(
    qe: &QueryEngine,
    ctx: &ReqCtx,
    sql: &str,
    bind_vars: &BindVars,
    split_column: Option<String>,
    split_count: i64,
    rows_per_split: i64,
    algorithm: SplitAlgorithm,
) -> Result<Vec<QuerySplit>> {
    if split_count < 0 || rows_per_split < 0 {
        return Err(ServerError::new(ErrorKind::BadInput, "splitquery: counts must be non-negative"));
    }
    if (split_count == 0) == (rows_per_split == 0) {
        return Err(ServerError::new(
            ErrorKind::BadInput,
            "splitquery: exactly one of split_count and rows_per_split must be non-zero",
        ));
    }
    let plan = qe.get_plan(sql).await?;
    if plan.kind != PlanKind::PassSelect {
        return Err(ServerError::new(ErrorKind::BadInput, "splitquery: query is not a plain select"));
    }
    let table = match &plan.table {
        Some(table) => table.clone(),
        None => return Err(ServerError::new(ErrorKind::BadInput, "splitquery: query has no known table")),
    };
    let column = match split_column.or_else(|| table.pk_columns.first().cloned()) {
        Some(column) => column,
        None => {
            return Err(ServerError::new(
                ErrorKind::BadInput,
                format!("splitquery: table {} has no usable split column", table.name),
            ));
        },
    };
    let base = bind_sql(&plan.sql, bind_vars)?;

    let (split_count, rows_per_split) = if split_count == 0 {
        let total = table_row_count(qe, ctx, &table.name).await?;
        (((total + rows_per_split - 1) / rows_per_split).max(1), rows_per_split)
    } else {
        let total = table_row_count(qe, ctx, &table.name).await?;
        (split_count, ((total + split_count - 1) / split_count).max(1))
    };

    let boundaries = match algorithm {
        SplitAlgorithm::EqualSplits => {
            equal_boundaries(qe, ctx, &table.name, &column, split_count.min(MAX_SPLITS)).await?
        },
        SplitAlgorithm::FullScan => full_scan_boundaries(qe, ctx, &table.name, &column, rows_per_split).await?,
    };

    Ok(build_splits(&base, &column, &boundaries, rows_per_split))
}

async fn fetch_first_row(qe: &QueryEngine, ctx: &ReqCtx, sql: &str) -> Result<Vec<crate::types::Value>> {
    let mut conn = qe.conns().get(ctx, None).await?;
    let result = match conn.execute(sql, 2, false).await {
        Ok(result) => result,
        Err(err) => {
            conn.recycle();
            return Err(err);
        },
    };
    conn.recycle();
    result
        .rows
        .into_iter()
        .next()
        .ok_or_else(|| ServerError::new(ErrorKind::Internal, format!("splitquery: empty result for {sql}")))
}

async fn table_row_count(qe: &QueryEngine, ctx: &ReqCtx, table: &str) -> Result<i64> {
    let row = fetch_first_row(qe, ctx, &format!("select count(*) from {table}")).await?;
    Ok(row.first().and_then(|v| v.as_i64()).unwrap_or(0).max(1))
}

/// Evenly spaced boundaries between the column's min and max.
async fn equal_boundaries(
    qe: &QueryEngine,
    ctx: &ReqCtx,
    table: &str,
    column: &str,
    split_count: i64,
) -> Result<Vec<i64>> {
    let row = fetch_first_row(qe, ctx, &format!("select min({column}), max({column}) from {table}")).await?;
    let (min, max) = match (row.first().and_then(|v| v.as_i64()), row.get(1).and_then(|v| v.as_i64())) {
        (Some(min), Some(max)) if max > min => (min, max),
        // Empty or single-valued table: one split covers everything.
        _ => return Ok(Vec::new()),
    };
    let width = max - min + 1;
    let mut boundaries = Vec::new();
    for i in 1..split_count {
        let boundary = min + width * i / split_count;
        if boundaries.last() != Some(&boundary) && boundary > min && boundary <= max {
            boundaries.push(boundary);
        }
    }
    Ok(boundaries)
}

/// Boundaries discovered by walking the column in order, one page per
/// split. Bounded by MAX_SPLITS for runaway tables.
async fn full_scan_boundaries(
    qe: &QueryEngine,
    ctx: &ReqCtx,
    table: &str,
    column: &str,
    rows_per_split: i64,
) -> Result<Vec<i64>> {
    let mut boundaries = Vec::new();
    let mut previous: Option<i64> = None;
    while (boundaries.len() as i64) < MAX_SPLITS {
        let sql = match previous {
            None => format!("select {column} from {table} order by {column} limit {rows_per_split}, 1"),
            Some(prev) => format!(
                "select {column} from {table} where {column} >= {prev} order by {column} limit {rows_per_split}, 1"
            ),
        };
        let mut conn = qe.conns().get(ctx, None).await?;
        let result = match conn.execute(&sql, 1, false).await {
            Ok(result) => result,
            Err(err) => {
                conn.recycle();
                return Err(err);
            },
        };
        conn.recycle();
        match result.rows.first().and_then(|row| row.first()).and_then(|v| v.as_i64()) {
            Some(boundary) => {
                if previous == Some(boundary) {
                    break;
                }
                boundaries.push(boundary);
                previous = Some(boundary);
            },
            None => break,
        }
    }
    Ok(boundaries)
}

fn build_splits(base: &str, column: &str, boundaries: &[i64], rows_per_split: i64) -> Vec<QuerySplit> {
    if boundaries.is_empty() {
        return vec![QuerySplit { sql: base.to_string(), row_count: rows_per_split }];
    }
    let connector = if base.to_ascii_lowercase().contains(" where ") { "and" } else { "where" };
    let mut splits = Vec::with_capacity(boundaries.len() + 1);
    let first = boundaries[0];
    splits.push(QuerySplit { sql: format!("{base} {connector} ({column} < {first})"), row_count: rows_per_split });
    for pair in boundaries.windows(2) {
        splits.push(QuerySplit {
            sql: format!("{base} {connector} ({column} >= {} and {column} < {})", pair[0], pair[1]),
            row_count: rows_per_split,
        });
    }
    let last = boundaries[boundaries.len() - 1];
    splits.push(QuerySplit { sql: format!("{base} {connector} ({column} >= {last})"), row_count: rows_per_split });
    splits
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assertor::*;

    use super::*;
    use crate::acl::AllowAllAcl;
    use crate::backend::MemoryBackend;
    use crate::config::ServerConfig;
    use crate::schema::{SchemaEngine, Table, TableKind};
    use crate::types::{QueryResult, Value};

    async fn engine() -> (MemoryBackend, QueryEngine) {
        let backend = MemoryBackend::new();
        backend.add_table(Table::new("t", TableKind::Ordinary).with_columns(&["id", "v"]).with_pk(&["id"]));
        let qe = QueryEngine::new(&ServerConfig::default(), SchemaEngine::new(), Arc::new(AllowAllAcl));
        qe.open(Arc::new(backend.clone()), Arc::new(backend.clone())).await.unwrap();
        (backend, qe)
    }

    fn one_row(values: &[i64]) -> QueryResult {
        QueryResult { rows: vec![values.iter().map(|v| Value::Int(*v)).collect()], ..Default::default() }
    }

    #[tokio::test]
    async fn test_param_validation() {
        let (_backend, qe) = engine().await;
        let ctx = ReqCtx::local();
        for (count, rows) in [(0, 0), (2, 100)] {
            let err = split_query(&qe, &ctx, "select * from t", &BindVars::new(), None, count, rows, SplitAlgorithm::EqualSplits)
                .await
                .unwrap_err();
            assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
        }
        let err = split_query(&qe, &ctx, "delete from t where id = 1", &BindVars::new(), None, 2, 0, SplitAlgorithm::EqualSplits)
            .await
            .unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_equal_splits_partition() {
        let (backend, qe) = engine().await;
        backend.add_query("select count(*) from t", one_row(&[10]));
        backend.add_query("select min(id), max(id) from t", one_row(&[1, 10]));
        let splits =
            split_query(&qe, &ReqCtx::local(), "select * from t", &BindVars::new(), None, 2, 0, SplitAlgorithm::EqualSplits)
                .await
                .unwrap();
        assert_that!(splits).has_length(2);
        assert_that!(splits[0].sql.as_str()).is_equal_to("select * from t where (id < 6)");
        assert_that!(splits[1].sql.as_str()).is_equal_to("select * from t where (id >= 6)");
    }

    #[tokio::test]
    async fn test_equal_splits_preserves_existing_where() {
        let (backend, qe) = engine().await;
        backend.add_query("select count(*) from t", one_row(&[10]));
        backend.add_query("select min(id), max(id) from t", one_row(&[1, 10]));
        let splits = split_query(
            &qe,
            &ReqCtx::local(),
            "select * from t where v > 0",
            &BindVars::new(),
            None,
            2,
            0,
            SplitAlgorithm::EqualSplits,
        )
        .await
        .unwrap();
        assert_that!(splits[0].sql.as_str()).is_equal_to("select * from t where v > 0 and (id < 6)");
    }

    #[tokio::test]
    async fn test_equal_splits_single_value_column() {
        let (backend, qe) = engine().await;
        backend.add_query("select count(*) from t", one_row(&[3]));
        backend.add_query("select min(id), max(id) from t", one_row(&[7, 7]));
        let splits =
            split_query(&qe, &ReqCtx::local(), "select * from t", &BindVars::new(), None, 2, 0, SplitAlgorithm::EqualSplits)
                .await
                .unwrap();
        assert_that!(splits).has_length(1);
        assert_that!(splits[0].sql.as_str()).is_equal_to("select * from t");
    }

    #[tokio::test]
    async fn test_full_scan_boundaries() {
        let (backend, qe) = engine().await;
        backend.add_query("select count(*) from t", one_row(&[6]));
        backend.add_query("select id from t order by id limit 2, 1", one_row(&[3]));
        backend.add_query("select id from t where id >= 3 order by id limit 2, 1", one_row(&[5]));
        backend.add_query(
            "select id from t where id >= 5 order by id limit 2, 1",
            QueryResult::default(),
        );
        let splits =
            split_query(&qe, &ReqCtx::local(), "select * from t", &BindVars::new(), None, 0, 2, SplitAlgorithm::FullScan)
                .await
                .unwrap();
        assert_that!(splits).has_length(3);
        assert_that!(splits[0].sql.as_str()).is_equal_to("select * from t where (id < 3)");
        assert_that!(splits[1].sql.as_str()).is_equal_to("select * from t where (id >= 3 and id < 5)");
        assert_that!(splits[2].sql.as_str()).is_equal_to("select * from t where (id >= 5)");
    }

    #[tokio::test]
    async fn test_explicit_split_column() {
        let (backend, qe) = engine().await;
        backend.add_query("select count(*) from t", one_row(&[4]));
        backend.add_query("select min(v), max(v) from t", one_row(&[0, 3]));
        let splits = split_query(
            &qe,
            &ReqCtx::local(),
            "select * from t",
            &BindVars::new(),
            Some("v".to_string()),
            2,
            0,
            SplitAlgorithm::EqualSplits,
        )
        .await
        .unwrap();
        assert_that!(splits[0].sql.contains("v <")).is_true();
    }
}
