//! Inventory search service access
//!
//! Queries are expressed as [`SearchQuery`] values and answered by an
//! [`InventorySearch`] implementation: a remote search API or a local snapshot.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

pub mod file;
pub mod http;
pub mod model;
pub mod query;

pub use file::FileInventory;
pub use http::HttpInventory;
pub use query::{Filter, SearchIndex, SearchQuery};

/// One row of a search result, keyed by attribute name.
pub type Record = Map<String, Value>;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search on `{index}` unavailable: {reason}")]
    Unavailable { index: String, reason: String },
    #[error("search on `{index}` returned a malformed response: {reason}")]
    Malformed { index: String, reason: String },
}

impl SearchError {
    pub fn unavailable(index: &SearchIndex, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            index: index.to_string(),
            reason: reason.into(),
        }
    }

    pub fn malformed(index: &SearchIndex, reason: impl Into<String>) -> Self {
        Self::Malformed {
            index: index.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait InventorySearch: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<Record>, SearchError>;
}
