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

use hashbrown::HashMap;
use regex::Regex;
use serde::Deserialize;

use super::{Plan, PlanKind};
use crate::error::{ErrorKind, Result, ServerError};
use crate::types::CallerId;

/// What a matched rule does to the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleAction {
    /// Reject outright.
    Fail,
    /// Reject in a way that tells the client to re-resolve and retry.
    FailRetry,
}

/// One predicate over (caller, query, plan). Unset dimensions match
/// everything; a rule fires only when every set dimension matches.
#[derive(Clone, Debug)]
pub struct QueryRule {
    pub name: String,
    pub user: Option<String>,
    pub addr: Option<String>,
    pub query: Option<Regex>,
    pub plans: Vec<PlanKind>,
    pub tables: Vec<String>,
    pub action: RuleAction,
}

impl QueryRule {
    pub fn new(name: impl Into<String>, action: RuleAction) -> Self {
        Self { name: name.into(), user: None, addr: None, query: None, plans: Vec::new(), tables: Vec::new(), action }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_query(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ServerError::new(ErrorKind::BadInput, format!("invalid rule regex: {e}")))?;
        self.query = Some(regex);
        Ok(self)
    }

    pub fn with_plans(mut self, plans: &[PlanKind]) -> Self {
        self.plans = plans.to_vec();
        self
    }

    pub fn with_tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    fn matches(&self, caller: &CallerId, plan: &Plan) -> bool {
        if let Some(user) = &self.user {
            if *user != caller.user {
                return false;
            }
        }
        if let Some(addr) = &self.addr {
            if *addr != caller.addr {
                return false;
            }
        }
        if let Some(query) = &self.query {
            if !query.is_match(&plan.sql) {
                return false;
            }
        }
        if !self.plans.is_empty() && !self.plans.contains(&plan.kind) {
            return false;
        }
        if !self.tables.is_empty() {
            match &plan.table_name {
                Some(table) if self.tables.iter().any(|t| t == table) => {},
                _ => return false,
            }
        }
        true
    }
}

/// Named rule sources composed into one filter, evaluated per request.
#[derive(Clone, Default)]
pub struct QueryRuleSets {
    sources: Arc<Mutex<HashMap<String, Arc<Vec<QueryRule>>>>>,
}

impl QueryRuleSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&self, name: impl Into<String>) {
        self.sources.lock().unwrap().entry(name.into()).or_insert_with(|| Arc::new(Vec::new()));
    }

    pub fn unregister_source(&self, name: &str) {
        self.sources.lock().unwrap().remove(name);
    }

    pub fn set_rules(&self, name: &str, rules: Vec<QueryRule>) -> Result<()> {
        let mut sources = self.sources.lock().unwrap();
        match sources.get_mut(name) {
            Some(slot) => {
                *slot = Arc::new(rules);
                Ok(())
            },
            None => Err(ServerError::new(ErrorKind::BadInput, format!("rule source {name} is not registered"))),
        }
    }

    /// First matching rule wins; sources are consulted in name order for
    /// deterministic evaluation.
    pub fn evaluate(&self, caller: &CallerId, plan: &Plan) -> Option<(String, RuleAction)> {
        let sources = self.sources.lock().unwrap();
        let mut names: Vec<_> = sources.keys().collect();
        names.sort();
        for name in names {
            for rule in sources[name].iter() {
                if rule.matches(caller, plan) {
                    return Some((rule.name.clone(), rule.action));
                }
            }
        }
        None
    }
}

#[derive(Deserialize)]
struct RuleSpec {
    name: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    addr: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    plans: Vec<String>,
    #[serde(default)]
    tables: Vec<String>,
    action: String,
}

/// Parses a JSON rule list, the format rule sources are fed with.
pub fn rules_from_json(data: &str) -> Result<Vec<QueryRule>> {
    let specs: Vec<RuleSpec> = serde_json::from_str(data)
        .map_err(|e| ServerError::new(ErrorKind::BadInput, format!("malformed rules: {e}")))?;
    let mut rules = Vec::with_capacity(specs.len());
    for spec in specs {
        let action = match spec.action.as_str() {
            "FAIL" => RuleAction::Fail,
            "FAIL_RETRY" => RuleAction::FailRetry,
            other => {
                return Err(ServerError::new(ErrorKind::BadInput, format!("unknown rule action {other}")));
            },
        };
        let mut rule = QueryRule::new(spec.name, action);
        rule.user = spec.user;
        rule.addr = spec.addr;
        if let Some(pattern) = spec.query {
            rule = rule.with_query(&pattern)?;
        }
        rule.plans = spec.plans.iter().map(|p| PlanKind::parse(p)).collect::<Result<_>>()?;
        rule.tables = spec.tables;
        rules.push(rule);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use assertor::*;

    use super::*;

    fn plan(sql: &str, kind: PlanKind, table: Option<&str>) -> Plan {
        Plan {
            kind,
            sql: sql.to_string(),
            trailing_comment: String::new(),
            table_name: table.map(|t| t.to_string()),
            table: None,
            upsert_update: None,
            nextval_count: None,
            hits: AtomicU64::new(0),
        }
    }

    fn caller(user: &str) -> CallerId {
        CallerId { user: user.to_string(), addr: "10.0.0.1".to_string() }
    }

    #[test]
    fn test_rule_dimensions() {
        let rule = QueryRule::new("block_scans", RuleAction::Fail)
            .with_user("batch")
            .with_plans(&[PlanKind::PassSelect])
            .with_tables(&["t"]);
        assert_that!(rule.matches(&caller("batch"), &plan("select * from t", PlanKind::PassSelect, Some("t"))))
            .is_true();
        assert_that!(rule.matches(&caller("app"), &plan("select * from t", PlanKind::PassSelect, Some("t"))))
            .is_false();
        assert_that!(rule.matches(&caller("batch"), &plan("delete from t", PlanKind::DmlPk, Some("t")))).is_false();
        assert_that!(rule.matches(&caller("batch"), &plan("select * from u", PlanKind::PassSelect, Some("u"))))
            .is_false();
    }

    #[test]
    fn test_query_regex() {
        let rule = QueryRule::new("no_commission", RuleAction::Fail).with_query(r"(?i)commission").unwrap();
        assert_that!(rule.matches(&caller("x"), &plan("select Commission from t", PlanKind::PassSelect, None)))
            .is_true();
        assert_that!(rule.matches(&caller("x"), &plan("select id from t", PlanKind::PassSelect, None))).is_false();
    }

    #[test]
    fn test_rule_sets_compose() {
        let sets = QueryRuleSets::new();
        sets.register_source("custom");
        assert_that!(sets.evaluate(&caller("x"), &plan("select 1", PlanKind::PassSelect, None)).is_none()).is_true();
        sets.set_rules("custom", vec![QueryRule::new("deny_all", RuleAction::FailRetry)]).unwrap();
        let (name, action) = sets.evaluate(&caller("x"), &plan("select 1", PlanKind::PassSelect, None)).unwrap();
        assert_that!(name.as_str()).is_equal_to("deny_all");
        assert_that!(action).is_equal_to(RuleAction::FailRetry);
        sets.unregister_source("custom");
        assert_that!(sets.evaluate(&caller("x"), &plan("select 1", PlanKind::PassSelect, None)).is_none()).is_true();
    }

    #[test]
    fn test_set_rules_requires_registration() {
        let sets = QueryRuleSets::new();
        let err = sets.set_rules("ghost", Vec::new()).unwrap_err();
        assert_that!(err.kind).is_equal_to(ErrorKind::BadInput);
    }

    #[test]
    fn test_rules_from_json() {
        let rules = rules_from_json(
            r#"[{"name": "r1", "user": "batch", "query": "^select", "plans": ["PASS_SELECT"], "action": "FAIL"}]"#,
        )
        .unwrap();
        assert_that!(rules).has_length(1);
        assert_that!(rules[0].action).is_equal_to(RuleAction::Fail);
        assert_that!(rules_from_json(r#"[{"name": "r", "action": "EXPLODE"}]"#).is_err()).is_true();
    }
}
