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

mod cache;
mod rules;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

pub use self::cache::PlanCache;
pub use self::rules::{rules_from_json, QueryRule, QueryRuleSets, RuleAction};
use crate::error::{ErrorKind, Result, ServerError};
use crate::schema::{SchemaEngine, Table, TableKind};

/// Classification of a query, deciding its rewrite and execution strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanKind {
    PassSelect,
    SelectLock,
    PassDml,
    DmlPk,
    DmlSubquery,
    InsertPk,
    InsertSubquery,
    UpsertPk,
    InsertMessage,
    DmlMessage,
    Nextval,
    Ddl,
    Set,
    Other,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::PassSelect => "PASS_SELECT",
            PlanKind::SelectLock => "SELECT_LOCK",
            PlanKind::PassDml => "PASS_DML",
            PlanKind::DmlPk => "DML_PK",
            PlanKind::DmlSubquery => "DML_SUBQUERY",
            PlanKind::InsertPk => "INSERT_PK",
            PlanKind::InsertSubquery => "INSERT_SUBQUERY",
            PlanKind::UpsertPk => "UPSERT_PK",
            PlanKind::InsertMessage => "INSERT_MESSAGE",
            PlanKind::DmlMessage => "DML_MESSAGE",
            PlanKind::Nextval => "NEXTVAL",
            PlanKind::Ddl => "DDL",
            PlanKind::Set => "SET",
            PlanKind::Other => "OTHER",
        }
    }

    pub fn parse(name: &str) -> Result<PlanKind> {
        let kind = match name {
            "PASS_SELECT" => PlanKind::PassSelect,
            "SELECT_LOCK" => PlanKind::SelectLock,
            "PASS_DML" => PlanKind::PassDml,
            "DML_PK" => PlanKind::DmlPk,
            "DML_SUBQUERY" => PlanKind::DmlSubquery,
            "INSERT_PK" => PlanKind::InsertPk,
            "INSERT_SUBQUERY" => PlanKind::InsertSubquery,
            "UPSERT_PK" => PlanKind::UpsertPk,
            "INSERT_MESSAGE" => PlanKind::InsertMessage,
            "DML_MESSAGE" => PlanKind::DmlMessage,
            "NEXTVAL" => PlanKind::Nextval,
            "DDL" => PlanKind::Ddl,
            "SET" => PlanKind::Set,
            "OTHER" => PlanKind::Other,
            other => return Err(ServerError::new(ErrorKind::BadInput, format!("unknown plan kind {other}"))),
        };
        Ok(kind)
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            PlanKind::PassDml
                | PlanKind::DmlPk
                | PlanKind::DmlSubquery
                | PlanKind::InsertPk
                | PlanKind::InsertSubquery
                | PlanKind::UpsertPk
                | PlanKind::InsertMessage
                | PlanKind::DmlMessage
        )
    }

    /// DMLs whose row effect is bounded and checked against max-dml-rows.
    pub fn is_bounded_dml(&self) -> bool {
        matches!(self, PlanKind::DmlPk | PlanKind::DmlSubquery)
    }
}

/// How many sequence values a NEXTVAL statement asks for.
#[derive(Clone, Debug, PartialEq)]
pub enum NextvalCount {
    Literal(i64),
    Bind(String),
}

/// A cached execution plan for one normalized statement.
#[derive(Debug)]
pub struct Plan {
    pub kind: PlanKind,
    /// Statement to execute, trailing comment split off.
    pub sql: String,
    /// Trailing comment reattached at execution time.
    pub trailing_comment: String,
    pub table_name: Option<String>,
    pub table: Option<Arc<Table>>,
    /// For UPSERT_PK: the UPDATE executed after a duplicate-key failure.
    pub upsert_update: Option<String>,
    pub nextval_count: Option<NextvalCount>,
    /// Times this plan was served from the cache.
    pub hits: AtomicU64,
}

impl Plan {
    fn new(kind: PlanKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
            trailing_comment: String::new(),
            table_name: None,
            table: None,
            upsert_update: None,
            nextval_count: None,
            hits: AtomicU64::new(0),
        }
    }

    /// The statement with its trailing comment reattached.
    pub fn full_sql(&self) -> String {
        if self.trailing_comment.is_empty() {
            self.sql.clone()
        } else {
            format!("{} {}", self.sql, self.trailing_comment)
        }
    }
}

/// Builds plans by classifying normalized SQL against the loaded schema.
/// This is a heuristic classifier behind the planner seam; it does not
/// attempt full SQL parsing.
#[derive(Clone)]
pub struct Planner {
    schema: SchemaEngine,
}

impl Planner {
    pub fn new(schema: SchemaEngine) -> Self {
        Self { schema }
    }

    pub fn build(&self, sql: &str) -> Result<Plan> {
        let sql = sql.trim().trim_end_matches(';').trim();
        if sql.is_empty() {
            return Err(ServerError::new(ErrorKind::BadInput, "empty query"));
        }
        let (base, comment) = split_trailing_comment(sql);
        let lower = base.to_ascii_lowercase();
        let mut plan = match first_word(&lower) {
            "select" => self.build_select(base, &lower)?,
            "insert" | "replace" => self.build_insert(base, &lower)?,
            "update" => self.build_dml(base, &lower, "update ")?,
            "delete" => self.build_dml(base, &lower, "delete from ")?,
            "create" | "alter" | "drop" | "rename" | "truncate" => Plan::new(PlanKind::Ddl, base),
            "set" => Plan::new(PlanKind::Set, base),
            "begin" | "start" | "commit" | "rollback" | "savepoint" => {
                return Err(ServerError::new(ErrorKind::BadInput, "transaction statements are not allowed here"));
            },
            _ => Plan::new(PlanKind::Other, base),
        };
        plan.trailing_comment = comment.to_string();
        Ok(plan)
    }

    fn build_select(&self, base: &str, lower: &str) -> Result<Plan> {
        if let Some(rest) = lower.strip_prefix("select next ") {
            if rest.contains(" from ") {
                return self.build_nextval(base, lower);
            }
        }
        let kind = if lower.ends_with(" for update") || lower.ends_with(" lock in share mode") {
            PlanKind::SelectLock
        } else {
            PlanKind::PassSelect
        };
        let mut plan = Plan::new(kind, base);
        if let Some(rest) = after_keyword(lower, base, " from ") {
            self.resolve_table(&mut plan, rest);
        }
        Ok(plan)
    }

    fn build_nextval(&self, base: &str, lower: &str) -> Result<Plan> {
        // select next <count> values from <seq> | select next value from <seq>
        let after_next = &lower["select next ".len()..];
        let count_token = first_word(after_next);
        let count = match count_token {
            "value" => NextvalCount::Literal(1),
            token if token.starts_with(':') => NextvalCount::Bind(token[1..].to_string()),
            token => match token.parse::<i64>() {
                Ok(n) if n > 0 => NextvalCount::Literal(n),
                _ => {
                    return Err(ServerError::new(
                        ErrorKind::BadInput,
                        format!("invalid sequence value count: {count_token}"),
                    ));
                },
            },
        };
        let mut plan = Plan::new(PlanKind::Nextval, base);
        if let Some(rest) = after_keyword(lower, base, " from ") {
            self.resolve_table(&mut plan, rest);
        }
        match &plan.table {
            Some(table) if table.kind == TableKind::Sequence => {},
            _ => {
                return Err(ServerError::new(
                    ErrorKind::BadInput,
                    format!("{} is not a sequence table", plan.table_name.as_deref().unwrap_or("target")),
                ));
            },
        }
        plan.nextval_count = Some(count);
        Ok(plan)
    }

    fn build_insert(&self, base: &str, lower: &str) -> Result<Plan> {
        let mut plan = Plan::new(PlanKind::InsertPk, base);
        if let Some(rest) = after_keyword(lower, base, "into ") {
            self.resolve_table(&mut plan, rest);
        }
        let message_table = matches!(&plan.table, Some(table) if table.kind == TableKind::Message);
        if message_table {
            plan.kind = PlanKind::InsertMessage;
            return Ok(plan);
        }
        if let Some(at) = lower.find(" on duplicate key update ") {
            plan.kind = PlanKind::UpsertPk;
            plan.upsert_update = derive_upsert_update(base, lower, at, plan.table.as_deref());
            if plan.upsert_update.is_some() {
                // Run the bare insert so the duplicate-key failure surfaces
                // here and the promotion update can be retried exactly once.
                plan.sql = base[..at].trim_end().to_string();
            }
            return Ok(plan);
        }
        if contains_keyword(lower, " select ") {
            plan.kind = PlanKind::InsertSubquery;
        }
        Ok(plan)
    }

    fn build_dml(&self, base: &str, lower: &str, table_marker: &str) -> Result<Plan> {
        let mut plan = Plan::new(PlanKind::PassDml, base);
        if let Some(rest) = after_keyword(lower, base, table_marker) {
            self.resolve_table(&mut plan, rest);
        }
        if matches!(&plan.table, Some(table) if table.kind == TableKind::Message) {
            plan.kind = PlanKind::DmlMessage;
            return Ok(plan);
        }
        if contains_keyword(lower, " select ") || contains_keyword(lower, "(select ") {
            plan.kind = PlanKind::DmlSubquery;
            return Ok(plan);
        }
        let has_pk = matches!(&plan.table, Some(table) if !table.pk_columns.is_empty());
        if contains_keyword(lower, " where ") && has_pk {
            plan.kind = PlanKind::DmlPk;
        }
        Ok(plan)
    }

    fn resolve_table(&self, plan: &mut Plan, rest: &str) {
        let name = parse_ident(rest);
        if name.is_empty() {
            return;
        }
        plan.table = self.schema.get_table(&name);
        plan.table_name = Some(name);
    }
}

/// Splits a trailing `/* ... */` comment off the statement.
pub fn split_trailing_comment(sql: &str) -> (&str, &str) {
    let trimmed = sql.trim_end();
    if !trimmed.ends_with("*/") {
        return (trimmed, "");
    }
    match trimmed.rfind("/*") {
        Some(at) if at > 0 => (sql[..at].trim_end(), trimmed[at..].trim()),
        _ => (trimmed, ""),
    }
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or("")
}

/// Finds `keyword` in the lowercased statement and returns the original
/// text following it.
fn after_keyword<'a>(lower: &str, base: &'a str, keyword: &str) -> Option<&'a str> {
    lower.find(keyword).map(|at| &base[at + keyword.len()..])
}

fn contains_keyword(lower: &str, keyword: &str) -> bool {
    lower.contains(keyword)
}

/// Reads a (possibly backtick-quoted, possibly qualified) identifier off the
/// front of `rest`.
fn parse_ident(rest: &str) -> String {
    let rest = rest.trim_start();
    let mut name = String::new();
    let mut chars = rest.chars();
    let mut quoted = false;
    for c in chars.by_ref() {
        match c {
            '`' if name.is_empty() && !quoted => quoted = true,
            '`' => break,
            c if quoted => name.push(c),
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$') => name.push(c),
            _ => break,
        }
    }
    name
}

/// Derives the promotion UPDATE for an upsert: the clause after
/// `on duplicate key update` becomes the SET list, and the primary-key
/// columns of the insert list become the WHERE clause. Returns None when the
/// statement shape does not allow a safe derivation (multi-row inserts,
/// unknown table, primary key not listed).
fn derive_upsert_update(base: &str, lower: &str, dup_at: usize, table: Option<&Table>) -> Option<String> {
    let table = table?;
    if table.pk_columns.is_empty() {
        return None;
    }
    let clause = base[dup_at + " on duplicate key update ".len()..].trim();
    let insert_part = &base[..dup_at];
    let insert_lower = &lower[..dup_at];

    let columns_open = insert_part.find('(')?;
    let columns_close = matching_paren(insert_part, columns_open)?;
    let columns: Vec<String> = split_top_level(&insert_part[columns_open + 1..columns_close])
        .iter()
        .map(|c| parse_ident(c))
        .collect();

    let values_at = insert_lower.find(" values")?;
    if values_at < columns_close {
        return None;
    }
    let values_open = insert_part[values_at..].find('(')? + values_at;
    let values_close = matching_paren(insert_part, values_open)?;
    if insert_part[values_close + 1..].trim_start().starts_with(',') {
        // Multi-row insert; no single promotion target.
        return None;
    }
    let values = split_top_level(&insert_part[values_open + 1..values_close]);
    if values.len() != columns.len() {
        return None;
    }

    let mut conditions = Vec::with_capacity(table.pk_columns.len());
    for pk in &table.pk_columns {
        let at = columns.iter().position(|c| c.eq_ignore_ascii_case(pk))?;
        conditions.push(format!("{} = {}", pk, values[at].trim()));
    }
    Some(format!("update {} set {} where {}", table.name, clause, conditions.join(" and ")))
}

/// Index of the `)` matching the `(` at `open`, respecting nested parens
/// and string literals.
fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) => {
                if c == b'\\' && q != b'`' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            },
            None => match c {
                b'\'' | b'"' | b'`' => quote = Some(c),
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                },
                _ => {},
            },
        }
        i += 1;
    }
    None
}

/// Splits on commas at paren depth zero, respecting string literals.
fn split_top_level(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) => {
                if c == b'\\' && q != b'`' {
                    i += 1;
                } else if c == q {
                    quote = None;
                }
            },
            None => match c {
                b'\'' | b'"' | b'`' => quote = Some(c),
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b',' if depth == 0 => {
                    parts.push(s[start..i].trim());
                    start = i + 1;
                },
                _ => {},
            },
        }
        i += 1;
    }
    parts.push(s[start..].trim());
    parts
}
