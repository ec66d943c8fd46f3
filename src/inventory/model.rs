//! Typed inventory records
//!
//! Rows coming back from a search are validated here once, so the rest of the
//! run works with named fields instead of loose maps.

use serde::Serialize;
use serde_json::Value;

use crate::errors::ProvisionError;
use crate::inventory::Record;

pub const DEFAULT_ENVIRONMENT: &str = "_default";
pub const ENVIRONMENT_FIELD: &str = "chef_environment";

pub trait FromRecord: Sized {
    const KIND: &'static str;

    fn from_record(record: &Record) -> Result<Self, ProvisionError>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub hostname: String,
    pub fqdn: Option<String>,
    pub ipaddress: Option<String>,
    pub os: String,
    pub environment: String,
    pub roles: Vec<String>,
}

impl FromRecord for Node {
    const KIND: &'static str = "node";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        Ok(Self {
            name: required_str(record, Self::KIND, "name")?,
            hostname: required_str(record, Self::KIND, "hostname")?,
            fqdn: optional_str(record, "fqdn"),
            ipaddress: optional_str(record, "ipaddress"),
            os: required_str(record, Self::KIND, "os")?,
            environment: optional_str(record, ENVIRONMENT_FIELD)
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            roles: string_list(record, "roles"),
        })
    }
}

/// Hostname projection of a node row, used by membership queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostName(pub String);

impl FromRecord for HostName {
    const KIND: &'static str = "node";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        required_str(record, Self::KIND, "hostname").map(Self)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Sysadmin {
    pub id: String,
    pub groups: Vec<String>,
    pub htpasswd: Option<String>,
    pub email: Option<String>,
    pub pager: Option<String>,
}

impl FromRecord for Sysadmin {
    const KIND: &'static str = "user";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        let contact = record.get("nagios").and_then(Value::as_object);
        Ok(Self {
            id: required_str(record, Self::KIND, "id")?,
            groups: string_list(record, "groups"),
            htpasswd: optional_str(record, "htpasswd"),
            email: contact.and_then(|nagios| optional_str(nagios, "email")),
            pager: contact.and_then(|nagios| optional_str(nagios, "pager")),
        })
    }
}

/// Service check definition passed through to the renderer untouched.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(transparent)]
pub struct ServiceDefinition(pub Record);

impl FromRecord for ServiceDefinition {
    const KIND: &'static str = "nagios_services";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        Ok(Self(record.clone()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(transparent)]
pub struct EventHandlerDefinition(pub Record);

impl FromRecord for EventHandlerDefinition {
    const KIND: &'static str = "nagios_eventhandlers";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        Ok(Self(record.clone()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostgroupDefinition {
    pub hostgroup_name: String,
    pub search_query: String,
}

impl FromRecord for HostgroupDefinition {
    const KIND: &'static str = "nagios_hostgroups";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        Ok(Self {
            hostgroup_name: required_str(record, Self::KIND, "hostgroup_name")?,
            search_query: required_str(record, Self::KIND, "search_query")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Role {
    pub name: String,
}

impl FromRecord for Role {
    const KIND: &'static str = "role";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        Ok(Self {
            name: required_str(record, Self::KIND, "name")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
}

impl FromRecord for Environment {
    const KIND: &'static str = "environment";

    fn from_record(record: &Record) -> Result<Self, ProvisionError> {
        Ok(Self {
            name: required_str(record, Self::KIND, "name")?,
        })
    }
}

fn required_str(
    record: &Record,
    kind: &'static str,
    field: &'static str,
) -> Result<String, ProvisionError> {
    optional_str(record, field).ok_or(ProvisionError::missing_field(kind, field))
}

fn optional_str(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn string_list(record: &Record, field: &str) -> Vec<String> {
    match record.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => Vec::new(),
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
    fn node_parses_with_defaults() {
        let node = Node::from_record(&record(json!({
            "name": "web1.example.com",
            "hostname": "web1",
            "os": "linux",
            "roles": ["base", "webserver"]
        })))
        .expect("node should parse");

        assert_eq!(node.hostname, "web1");
        assert_eq!(node.environment, DEFAULT_ENVIRONMENT);
        assert_eq!(node.roles, vec!["base", "webserver"]);
        assert_eq!(node.ipaddress, None);
    }

    #[test]
    fn node_without_hostname_fails_fast() {
        let err = Node::from_record(&record(json!({"name": "web1", "os": "linux"})))
            .expect_err("expected missing hostname");
        assert!(matches!(
            err,
            ProvisionError::MissingField {
                kind: "node",
                field: "hostname"
            }
        ));
    }

    #[test]
    fn blank_required_field_counts_as_missing() {
        let err = Role::from_record(&record(json!({"name": "  "}))).expect_err("expected failure");
        assert!(matches!(err, ProvisionError::MissingField { field: "name", .. }));
    }

    #[test]
    fn sysadmin_reads_nested_contact() {
        let admin = Sysadmin::from_record(&record(json!({
            "id": "alice",
            "groups": ["sysadmin"],
            "htpasswd": "$apr1$abc",
            "nagios": {"email": "alice@example.com", "pager": "alice-pager@example.com"}
        })))
        .expect("user should parse");

        assert_eq!(admin.email.as_deref(), Some("alice@example.com"));
        assert_eq!(admin.pager.as_deref(), Some("alice-pager@example.com"));
        assert_eq!(admin.htpasswd.as_deref(), Some("$apr1$abc"));
    }

    #[test]
    fn service_definition_is_passed_through() {
        let raw = record(json!({"id": "load", "hostgroup_name": "linux", "check_interval": 5}));
        let service = ServiceDefinition::from_record(&raw).expect("service should parse");
        assert_eq!(serde_json::to_value(&service).expect("serialize"), Value::Object(raw));
    }
}
