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

use hashbrown::HashMap;
use serde::Deserialize;

use crate::error::{ErrorKind, Result, ServerError};
use crate::plan::PlanKind;

/// The access class a plan needs on its table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Admin,
}

impl Access {
    pub fn for_plan(kind: PlanKind) -> Access {
        match kind {
            PlanKind::PassSelect | PlanKind::SelectLock | PlanKind::Nextval | PlanKind::Other => Access::Read,
            PlanKind::Ddl => Access::Admin,
            _ => Access::Write,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Access::Read => "READ",
            Access::Write => "WRITE",
            Access::Admin => "ADMIN",
        }
    }
}

/// Per-table access control consulted on every plan execution.
pub trait TableAcl: Send + Sync {
    fn check(&self, user: &str, table: &str, access: Access) -> bool;
}

/// The default when no ACL config is supplied.
pub struct AllowAllAcl;

impl TableAcl for AllowAllAcl {
    fn check(&self, _user: &str, _table: &str, _access: Access) -> bool {
        true
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct TablePerms {
    #[serde(default)]
    read: Vec<String>,
    #[serde(default)]
    write: Vec<String>,
    #[serde(default)]
    admin: Vec<String>,
}

/// ACL loaded from a static JSON map of table name to user lists. A table
/// absent from the config grants nothing.
pub struct StaticAcl {
    entries: HashMap<String, TablePerms>,
}

impl StaticAcl {
    pub fn from_json(data: &str) -> Result<Self> {
        let entries: HashMap<String, TablePerms> = serde_json::from_str(data)
            .map_err(|e| ServerError::new(ErrorKind::BadInput, format!("malformed table acl: {e}")))?;
        Ok(Self { entries })
    }
}

impl TableAcl for StaticAcl {
    fn check(&self, user: &str, table: &str, access: Access) -> bool {
        let Some(perms) = self.entries.get(table) else {
            return false;
        };
        // Admin implies write, write implies read.
        let granted = match access {
            Access::Read => [&perms.read, &perms.write, &perms.admin],
            Access::Write => [&perms.write, &perms.admin, &perms.admin],
            Access::Admin => [&perms.admin, &perms.admin, &perms.admin],
        };
        granted.iter().any(|list| list.iter().any(|u| u == user))
    }
}
