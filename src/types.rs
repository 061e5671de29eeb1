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

use std::fmt::{self, Display, Formatter, Write};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, Result, ServerError};

/// Role a shard target is serving in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Replica,
    Rdonly,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "PRIMARY",
            Role::Replica => "REPLICA",
            Role::Rdonly => "RDONLY",
        }
    }

    pub fn parse(name: &str) -> Result<Role> {
        match name.to_ascii_uppercase().as_str() {
            "PRIMARY" | "MASTER" => Ok(Role::Primary),
            "REPLICA" => Ok(Role::Replica),
            "RDONLY" | "BATCH" => Ok(Role::Rdonly),
            other => Err(ServerError::new(ErrorKind::BadInput, format!("unknown role {other}"))),
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (keyspace, shard, role) tuple this engine serves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub role: Role,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, role: Role) -> Self {
        Self { keyspace: keyspace.into(), shard: shard.into(), role }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.keyspace, self.shard, self.role)
    }
}

/// A single column value as returned from the backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Appends this value as a MySQL literal.
    pub fn encode_sql(&self, buf: &mut String) {
        match self {
            Value::Null => buf.push_str("null"),
            Value::Int(v) => {
                let _ = write!(buf, "{v}");
            },
            Value::UInt(v) => {
                let _ = write!(buf, "{v}");
            },
            Value::Float(v) => {
                let _ = write!(buf, "{v}");
            },
            Value::Str(s) => encode_string(s, buf),
            Value::Bytes(b) => {
                buf.push_str("_binary'");
                for c in b {
                    match c {
                        b'\'' => buf.push_str("\\'"),
                        b'\\' => buf.push_str("\\\\"),
                        b'\0' => buf.push_str("\\0"),
                        c => buf.push(*c as char),
                    }
                }
                buf.push('\'');
            },
        }
    }
}

fn encode_string(s: &str, buf: &mut String) {
    buf.push('\'');
    for c in s.chars() {
        match c {
            '\'' => buf.push_str("\\'"),
            '\\' => buf.push_str("\\\\"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            '\0' => buf.push_str("\\0"),
            c => buf.push(c),
        }
    }
    buf.push('\'');
}

/// A client-supplied bind variable: a single value or a list for IN clauses.
#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    Value(Value),
    List(Vec<Value>),
}

impl BindValue {
    fn encode_sql(&self, buf: &mut String) -> Result<()> {
        match self {
            BindValue::Value(v) => v.encode_sql(buf),
            BindValue::List(values) => {
                if values.is_empty() {
                    return Err(ServerError::new(ErrorKind::BadInput, "empty list supplied as bind variable"));
                }
                buf.push('(');
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        buf.push_str(", ");
                    }
                    v.encode_sql(buf);
                }
                buf.push(')');
            },
        }
        Ok(())
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        BindValue::Value(Value::Int(v))
    }
}

impl From<u64> for BindValue {
    fn from(v: u64) -> Self {
        BindValue::Value(Value::UInt(v))
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::Value(Value::Str(v.to_string()))
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Value(Value::Str(v))
    }
}

pub type BindVars = HashMap<String, BindValue>;

/// Substitutes `:name` placeholders with encoded bind values. Placeholders
/// inside string literals and backtick quoting are left untouched.
pub fn bind_sql(sql: &str, bind_vars: &BindVars) -> Result<String> {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut quote: Option<char> = None;
    while let Some((_, c)) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' && q != '`' {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            },
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                },
                ':' if chars.peek().map(|(_, n)| n.is_ascii_alphabetic() || *n == '_').unwrap_or(false) => {
                    let mut name = String::new();
                    while let Some((_, n)) = chars.peek() {
                        if n.is_ascii_alphanumeric() || *n == '_' {
                            name.push(*n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    match bind_vars.get(&name) {
                        Some(value) => value.encode_sql(&mut out)?,
                        None => {
                            return Err(ServerError::new(
                                ErrorKind::BadInput,
                                format!("missing bind var {name}"),
                            ));
                        },
                    }
                },
                c => out.push(c),
            },
        }
    }
    Ok(out)
}

/// Result field metadata.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    pub column_type: String,
}

impl Field {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self { name: name.into(), column_type: column_type.into() }
    }
}

/// How much field metadata a result should carry back to the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IncludedFields {
    #[default]
    TypeAndName,
    TypeOnly,
    None,
}

/// Per-request execution options.
#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    pub included_fields: IncludedFields,
}

/// One query result, or one chunk of a streamed result.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    pub fn with_rows_affected(rows_affected: u64) -> Self {
        Self { rows_affected, ..Default::default() }
    }

    pub fn strip_metadata(mut self, included: IncludedFields) -> Self {
        match included {
            IncludedFields::TypeAndName => self,
            IncludedFields::TypeOnly => {
                for field in &mut self.fields {
                    field.name.clear();
                }
                self
            },
            IncludedFields::None => {
                self.fields.clear();
                self
            },
        }
    }
}

/// Identity of the calling party, used for ACL and rule evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallerId {
    pub user: String,
    pub addr: String,
}

/// Request scope handed down with every operation. Local scopes mark
/// process-internal invocations which bypass target checks and timeouts.
#[derive(Clone, Debug)]
pub struct ReqCtx {
    pub cancel: CancellationToken,
    pub caller: CallerId,
    local: bool,
}

impl ReqCtx {
    pub fn remote(caller: CallerId) -> Self {
        Self { cancel: CancellationToken::new(), caller, local: false }
    }

    pub fn local() -> Self {
        Self { cancel: CancellationToken::new(), caller: CallerId::default(), local: true }
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Derives a child scope cancelled with this one.
    pub fn child(&self) -> Self {
        Self { cancel: self.cancel.child_token(), caller: self.caller.clone(), local: self.local }
    }

    /// The same scope driven by a different cancellation token.
    pub fn with_cancel(self, cancel: CancellationToken) -> Self {
        Self { cancel, ..self }
    }
}
