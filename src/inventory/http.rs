use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::inventory::{InventorySearch, Record, SearchError, SearchQuery};

const DEFAULT_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    total: Option<usize>,
    #[serde(default)]
    rows: Vec<Value>,
}

/// Client for a paged `GET /search/{index}?q=...` inventory API.
#[derive(Debug, Clone)]
pub struct HttpInventory {
    client: Client,
    base_url: String,
    token: Option<String>,
    page_size: usize,
}

impl HttpInventory {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            token,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    async fn fetch_page(&self, query: &SearchQuery, start: usize) -> Result<SearchPage, SearchError> {
        let url = format!("{}/search/{}", self.base_url, query.index);
        let mut request = self.client.get(&url).query(&[
            ("q", query.filter.clone()),
            ("start", start.to_string()),
            ("rows", self.page_size.to_string()),
        ]);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SearchError::unavailable(&query.index, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::unavailable(
                &query.index,
                format!("search service answered HTTP {status}"),
            ));
        }

        response
            .json::<SearchPage>()
            .await
            .map_err(|err| SearchError::malformed(&query.index, err.to_string()))
    }
}

#[async_trait]
impl InventorySearch for HttpInventory {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>, SearchError> {
        let mut records = Vec::new();

        loop {
            let page = self.fetch_page(query, records.len()).await?;
            let received = page.rows.len();

            for row in page.rows {
                match row {
                    Value::Object(record) => records.push(record),
                    other => {
                        return Err(SearchError::malformed(
                            &query.index,
                            format!("expected an object row, got {other}"),
                        ))
                    }
                }
            }

            debug!(
                query = %query,
                received,
                collected = records.len(),
                total = page.total,
                "search page received"
            );

            match page.total {
                Some(total) if received > 0 && records.len() < total => continue,
                _ => break,
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{
        extract::{Path, Query},
        http::{HeaderMap, StatusCode},
        routing::get,
        Json, Router,
    };
    use serde_json::json;

    use super::*;
    use crate::inventory::SearchIndex;

    async fn search_handler(
        Path(index): Path<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, StatusCode> {
        if headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            != Some("Bearer token-123")
        {
            return Err(StatusCode::UNAUTHORIZED);
        }

        let start: usize = params
            .get("start")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let rows: usize = params
            .get("rows")
            .and_then(|value| value.parse().ok())
            .unwrap_or(1000);

        match index.as_str() {
            "node" => {
                let nodes: Vec<Value> = (0..5)
                    .map(|i| json!({"name": format!("web{i}"), "hostname": format!("web{i}"), "os": "linux"}))
                    .collect();
                let page: Vec<Value> = nodes.into_iter().skip(start).take(rows).collect();
                Ok(Json(json!({"total": 5, "start": start, "rows": page})))
            }
            "role" => Ok(Json(json!({"rows": [1, 2]}))),
            "users" => Ok(Json(json!({
                "total": 1,
                "rows": [{"id": params.get("q").cloned().unwrap_or_default()}]
            }))),
            _ => Err(StatusCode::NOT_FOUND),
        }
    }

    async fn spawn_search_service() -> String {
        let app = Router::new().route("/search/{index}", get(search_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn pages_until_total_is_collected() {
        let base = spawn_search_service().await;
        let client = HttpInventory::new(base, Some("token-123".to_string())).with_page_size(2);

        let rows = client
            .search(&SearchQuery::all_nodes())
            .await
            .expect("search should succeed");

        let hostnames: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.get("hostname").and_then(Value::as_str))
            .collect();
        assert_eq!(hostnames, vec!["web0", "web1", "web2", "web3", "web4"]);
    }

    #[tokio::test]
    async fn filter_is_sent_as_query_parameter() {
        let base = spawn_search_service().await;
        let client = HttpInventory::new(base, Some("token-123".to_string()));

        let rows = client
            .search(&SearchQuery::users_in_group("sysadmin"))
            .await
            .expect("search should succeed");

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&json!("groups:sysadmin")));
    }

    #[tokio::test]
    async fn missing_data_bag_is_unavailable() {
        let base = spawn_search_service().await;
        let client = HttpInventory::new(base, Some("token-123".to_string()));

        let err = client
            .search(&SearchQuery::data_bag("nagios_services"))
            .await
            .expect_err("expected unavailable");
        assert!(matches!(err, SearchError::Unavailable { index, .. } if index == "nagios_services"));
    }

    #[tokio::test]
    async fn rejected_token_is_unavailable() {
        let base = spawn_search_service().await;
        let client = HttpInventory::new(base, None);

        let err = client
            .search(&SearchQuery::all(SearchIndex::Role))
            .await
            .expect_err("expected unavailable");
        assert!(matches!(err, SearchError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn non_object_rows_are_malformed() {
        let base = spawn_search_service().await;
        let client = HttpInventory::new(base, Some("token-123".to_string()));

        let err = client
            .search(&SearchQuery::all(SearchIndex::Role))
            .await
            .expect_err("expected malformed");
        assert!(matches!(err, SearchError::Malformed { .. }));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let client = HttpInventory::new("http://127.0.0.1:1", None);

        let err = client
            .search(&SearchQuery::all_nodes())
            .await
            .expect_err("expected unavailable");
        assert!(matches!(err, SearchError::Unavailable { .. }));
    }
}
