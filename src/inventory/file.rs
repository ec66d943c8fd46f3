use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use tracing::info;

use crate::errors::ProvisionError;
use crate::inventory::{Filter, InventorySearch, Record, SearchError, SearchQuery};

/// Inventory snapshot kept in a YAML or JSON file, keyed by index name.
///
/// ```yaml
/// node:
///   - { name: web1, hostname: web1, os: linux, chef_environment: production }
/// users:
///   - { id: alice, groups: [sysadmin] }
/// ```
#[derive(Debug, Clone, Default)]
pub struct FileInventory {
    indexes: HashMap<String, Vec<Record>>,
}

impl FileInventory {
    pub fn new(indexes: HashMap<String, Vec<Record>>) -> Self {
        Self { indexes }
    }

    pub fn load(path: &Path) -> Result<Self, ProvisionError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| ProvisionError::io("failed to read inventory", path, err))?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let indexes: HashMap<String, Vec<Record>> = if is_json {
            serde_json::from_str(&raw).map_err(|err| invalid_snapshot(path, err.to_string()))?
        } else {
            serde_yaml::from_str(&raw).map_err(|err| invalid_snapshot(path, err.to_string()))?
        };

        info!(
            path = %path.display(),
            indexes = indexes.len(),
            "loaded inventory snapshot"
        );
        Ok(Self::new(indexes))
    }
}

fn invalid_snapshot(path: &Path, reason: String) -> ProvisionError {
    ProvisionError::io(
        "invalid inventory snapshot",
        path,
        std::io::Error::new(std::io::ErrorKind::InvalidData, reason),
    )
}

#[async_trait]
impl InventorySearch for FileInventory {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>, SearchError> {
        let records = self.indexes.get(query.index.name()).ok_or_else(|| {
            SearchError::unavailable(&query.index, "index not present in inventory snapshot")
        })?;

        let filter = Filter::parse(&query.filter)
            .map_err(|err| SearchError::unavailable(&query.index, err.to_string()))?;

        Ok(records
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::{json, Value};

    use super::*;
    use crate::inventory::SearchIndex;

    const SNAPSHOT: &str = r#"
node:
  - { name: web1, hostname: web1, os: linux, chef_environment: production, roles: [webserver] }
  - { name: db1, hostname: db1, os: linux, chef_environment: staging, roles: [database] }
users:
  - { id: alice, groups: [sysadmin] }
  - { id: bob, groups: [developers] }
"#;

    fn snapshot_file(contents: &str, suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write snapshot");
        file
    }

    #[tokio::test]
    async fn yaml_snapshot_is_filtered() {
        let file = snapshot_file(SNAPSHOT, ".yaml");
        let inventory = FileInventory::load(file.path()).expect("snapshot loads");

        let rows = inventory
            .search(&SearchQuery::nodes_in_environment("production"))
            .await
            .expect("search succeeds");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("hostname"), Some(&json!("web1")));

        let admins = inventory
            .search(&SearchQuery::users_in_group("sysadmin"))
            .await
            .expect("search succeeds");
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].get("id"), Some(&json!("alice")));
    }

    #[tokio::test]
    async fn json_snapshot_loads() {
        let file = snapshot_file(r#"{"role": [{"name": "webserver"}]}"#, ".json");
        let inventory = FileInventory::load(file.path()).expect("snapshot loads");

        let rows = inventory
            .search(&SearchQuery::all(SearchIndex::Role))
            .await
            .expect("search succeeds");
        assert_eq!(rows[0].get("name").and_then(Value::as_str), Some("webserver"));
    }

    #[tokio::test]
    async fn absent_index_is_unavailable() {
        let inventory = FileInventory::default();
        let err = inventory
            .search(&SearchQuery::data_bag("nagios_eventhandlers"))
            .await
            .expect_err("expected unavailable");
        assert!(matches!(err, SearchError::Unavailable { .. }));
    }

    #[test]
    fn broken_snapshot_is_reported() {
        let file = snapshot_file("node: [unterminated", ".yaml");
        let err = FileInventory::load(file.path()).expect_err("expected parse failure");
        assert!(err.to_string().contains("invalid inventory snapshot"));
    }
}
