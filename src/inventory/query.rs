use std::{fmt, sync::OnceLock};

use regex::Regex;
use serde_json::Value;

use crate::errors::ProvisionError;
use crate::inventory::model::{DEFAULT_ENVIRONMENT, ENVIRONMENT_FIELD};
use crate::inventory::Record;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SearchIndex {
    Node,
    Users,
    Role,
    Environment,
    DataBag(String),
}

impl SearchIndex {
    pub fn name(&self) -> &str {
        match self {
            Self::Node => "node",
            Self::Users => "users",
            Self::Role => "role",
            Self::Environment => "environment",
            Self::DataBag(name) => name,
        }
    }
}

impl fmt::Display for SearchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Nodes that have not reported a hostname yet cannot be monitored.
const NODE_PRESENT: &str = "hostname:[* TO *]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub index: SearchIndex,
    pub filter: String,
}

impl SearchQuery {
    pub fn new(index: SearchIndex, filter: impl Into<String>) -> Self {
        Self {
            index,
            filter: filter.into(),
        }
    }

    pub fn all(index: SearchIndex) -> Self {
        Self::new(index, "*:*")
    }

    pub fn all_nodes() -> Self {
        Self::new(SearchIndex::Node, NODE_PRESENT)
    }

    pub fn nodes_in_environment(environment: &str) -> Self {
        Self::all_nodes().and_environment(environment)
    }

    pub fn nodes_with_role(role: &str) -> Self {
        Self::new(SearchIndex::Node, format!("{NODE_PRESENT} AND roles:{role}"))
    }

    /// Nodes matching a caller-supplied expression, grouped so that narrowing
    /// clauses apply to the whole of it.
    pub fn nodes_matching(filter: &str) -> Self {
        Self::new(SearchIndex::Node, format!("{NODE_PRESENT} AND ({})", filter.trim()))
    }

    pub fn users_in_group(group: &str) -> Self {
        Self::new(SearchIndex::Users, format!("groups:{group}"))
    }

    pub fn data_bag(name: &str) -> Self {
        Self::all(SearchIndex::DataBag(name.to_string()))
    }

    /// Narrows the query to one deployment environment.
    pub fn and_environment(self, environment: &str) -> Self {
        let clause = format!("{ENVIRONMENT_FIELD}:{environment}");
        let filter = if self.filter.trim() == "*:*" {
            clause
        } else {
            format!("{} AND {clause}", self.filter)
        };
        Self {
            index: self.index,
            filter,
        }
    }
}

impl fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?q={}", self.index, self.filter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Present,
    Exact(String),
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Clause {
    All,
    Field { path: Vec<String>, matcher: Matcher },
}

/// Conjunction of `field:value` clauses evaluated against inventory records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

fn clause_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<field>\*|[A-Za-z0-9_@.\-]+):(?P<value>\[\*\s+TO\s+\*\]|\S+)$")
            .expect("clause pattern is valid")
    })
}

fn conjunction_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\s+AND\s+").expect("conjunction pattern is valid"))
}

impl Filter {
    pub fn parse(expression: &str) -> Result<Self, ProvisionError> {
        let expression = expression.trim();
        let invalid = |reason: &str| ProvisionError::InvalidFilter {
            filter: expression.to_string(),
            reason: reason.to_string(),
        };

        if expression.is_empty() {
            return Err(invalid("expression is empty"));
        }

        let mut depth = 0usize;
        for symbol in expression.chars() {
            match symbol {
                '(' => depth += 1,
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| invalid("unbalanced parentheses"))?
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(invalid("unbalanced parentheses"));
        }

        // Only conjunctions are supported, so grouping never changes the result.
        let mut clauses = Vec::new();
        for raw in conjunction_pattern().split(expression) {
            let raw = raw
                .trim()
                .trim_start_matches(|c: char| c == '(' || c.is_whitespace())
                .trim_end_matches(|c: char| c == ')' || c.is_whitespace());
            let captures = clause_pattern()
                .captures(raw)
                .ok_or_else(|| invalid(&format!("cannot parse clause `{raw}`")))?;
            let field = &captures["field"];
            let value = captures["value"].trim_matches('"');

            if field == "*" {
                if value != "*" {
                    return Err(invalid("a wildcard field only matches `*`"));
                }
                clauses.push(Clause::All);
                continue;
            }

            let matcher = if value.starts_with('[') || value == "*" {
                Matcher::Present
            } else if let Some(prefix) = value.strip_suffix('*') {
                Matcher::Prefix(prefix.to_string())
            } else {
                Matcher::Exact(value.to_string())
            };
            clauses.push(Clause::Field {
                path: field.split('.').map(str::to_string).collect(),
                matcher,
            });
        }

        Ok(Self { clauses })
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::All => true,
            Clause::Field { path, matcher } => match lookup(record, path) {
                Some(value) => value_matches(value, matcher),
                None => implicit_value(path).is_some_and(|text| scalar_matches(text, matcher)),
            },
        })
    }
}

fn lookup<'a>(record: &'a Record, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(record.get(first)?, |value, key| value.get(key))
}

/// Value a field takes when a record omits it.
fn implicit_value(path: &[String]) -> Option<&'static str> {
    match path {
        [field] if field == ENVIRONMENT_FIELD => Some(DEFAULT_ENVIRONMENT),
        _ => None,
    }
}

fn value_matches(value: &Value, matcher: &Matcher) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => items.iter().any(|item| value_matches(item, matcher)),
        Value::String(text) => scalar_matches(text, matcher),
        Value::Bool(_) | Value::Number(_) => scalar_matches(&value.to_string(), matcher),
        Value::Object(_) => matches!(matcher, Matcher::Present),
    }
}

fn scalar_matches(text: &str, matcher: &Matcher) -> bool {
    match matcher {
        Matcher::Present => true,
        Matcher::Exact(expected) => text == expected,
        Matcher::Prefix(prefix) => text.starts_with(prefix.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("record must be an object")
    }

    #[test]
    fn environment_clause_is_appended() {
        let query = SearchQuery::nodes_in_environment("production");
        assert_eq!(query.index, SearchIndex::Node);
        assert_eq!(
            query.filter,
            "hostname:[* TO *] AND chef_environment:production"
        );

        let narrowed = SearchQuery::data_bag("nagios_services").and_environment("staging");
        assert_eq!(narrowed.filter, "chef_environment:staging");
    }

    #[test]
    fn match_all_accepts_any_record() {
        let filter = Filter::parse("*:*").expect("valid filter");
        assert!(filter.matches(&record(json!({}))));
        assert!(filter.matches(&record(json!({"id": "load"}))));
    }

    #[test]
    fn range_requires_field_presence() {
        let filter = Filter::parse("hostname:[* TO *]").expect("valid filter");
        assert!(filter.matches(&record(json!({"hostname": "web1"}))));
        assert!(!filter.matches(&record(json!({"name": "web1"}))));
        assert!(!filter.matches(&record(json!({"hostname": null}))));
    }

    #[test]
    fn list_fields_match_any_element() {
        let filter = Filter::parse("roles:webserver AND chef_environment:production")
            .expect("valid filter");
        assert!(filter.matches(&record(json!({
            "roles": ["base", "webserver"],
            "chef_environment": "production"
        }))));
        assert!(!filter.matches(&record(json!({
            "roles": ["base"],
            "chef_environment": "production"
        }))));
        assert!(!filter.matches(&record(json!({
            "roles": ["webserver"],
            "chef_environment": "staging"
        }))));
    }

    #[test]
    fn prefix_and_nested_fields() {
        let filter = Filter::parse("hostname:db* AND nagios.pager:[* TO *]").expect("valid filter");
        assert!(filter.matches(&record(json!({
            "hostname": "db02",
            "nagios": {"pager": "ops@example.com"}
        }))));
        assert!(!filter.matches(&record(json!({
            "hostname": "web02",
            "nagios": {"pager": "ops@example.com"}
        }))));
    }

    #[test]
    fn numbers_compare_as_text() {
        let filter = Filter::parse("uid:2001").expect("valid filter");
        assert!(filter.matches(&record(json!({"uid": 2001}))));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = Filter::parse("roles webserver").expect_err("expected parse failure");
        assert!(matches!(err, ProvisionError::InvalidFilter { .. }));

        let err = Filter::parse("*:webserver").expect_err("expected parse failure");
        assert!(matches!(err, ProvisionError::InvalidFilter { .. }));
    }

    #[test]
    fn member_queries_require_a_hostname() {
        assert_eq!(
            SearchQuery::nodes_with_role("webserver").filter,
            "hostname:[* TO *] AND roles:webserver"
        );

        let filter = Filter::parse(&SearchQuery::nodes_with_role("webserver").filter)
            .expect("valid filter");
        assert!(!filter.matches(&record(json!({"name": "fresh", "roles": ["webserver"]}))));
        assert!(filter.matches(&record(json!({"hostname": "web1", "roles": ["webserver"]}))));
    }

    #[test]
    fn supplied_expression_is_grouped_before_narrowing() {
        let query = SearchQuery::nodes_matching("roles:web OR roles:api").and_environment("production");
        assert_eq!(
            query.filter,
            "hostname:[* TO *] AND (roles:web OR roles:api) AND chef_environment:production"
        );

        let filter = Filter::parse(
            &SearchQuery::nodes_matching("roles:web").and_environment("production").filter,
        )
        .expect("grouped filter parses");
        assert!(filter.matches(&record(json!({
            "hostname": "web1",
            "roles": ["web"],
            "chef_environment": "production"
        }))));

        let err = Filter::parse("(roles:web AND os:linux").expect_err("expected parse failure");
        assert!(matches!(err, ProvisionError::InvalidFilter { .. }));
    }

    #[test]
    fn missing_environment_counts_as_default() {
        let filter = Filter::parse(&SearchQuery::nodes_in_environment(DEFAULT_ENVIRONMENT).filter)
            .expect("valid filter");
        assert!(filter.matches(&record(json!({"hostname": "web1"}))));
        assert!(!filter.matches(&record(json!({"hostname": "web2", "chef_environment": "staging"}))));

        let production = Filter::parse("chef_environment:production").expect("valid filter");
        assert!(!production.matches(&record(json!({"hostname": "web1"}))));
    }
}
