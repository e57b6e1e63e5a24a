// src/catalog/mod.rs
// Catalog Fetcher (C3): reads pages of records from the upstream storefront
// and resolves order lookups. Rate-limit aware via a bounded semaphore
// (concurrency cap) plus a Retry-After-honoring retry loop.

pub mod taxonomy;

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::config::catalog::CatalogConfig;
use crate::domain::{Record, RecordKind};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<Record>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub order_number: String,
    pub customer_email: String,
    pub status: String,
    pub items: Vec<String>,
}

#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    async fn list_since(&self, kind: RecordKind, cursor: Option<&str>) -> EngineResult<Page>;

    async fn get(&self, kind: RecordKind, id: &str) -> EngineResult<Option<Record>>;

    /// Requires both identifiers; returns NotFound if either mismatches.
    /// Emails are matched case-insensitively with surrounding whitespace trimmed.
    async fn resolve_order(&self, order_number: &str, customer_email: &str) -> EngineResult<Order>;

    /// Cheap reachability probe for `GET /health`. Never returns an error;
    /// unreachable degrades the service, it doesn't fail the health check.
    async fn health_check(&self) -> bool;
}

pub struct HttpCatalogFetcher {
    client: reqwest::Client,
    config: CatalogConfig,
    concurrency: Arc<Semaphore>,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    items: Vec<RawCatalogItem>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCatalogItem {
    id: String,
    title: String,
    body: String,
    url: Option<String>,
    brand: Option<String>,
    #[serde(default)]
    attributes: std::collections::BTreeMap<String, serde_json::Value>,
}

impl HttpCatalogFetcher {
    pub fn new(config: CatalogConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .expect("failed to build catalog http client");
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent_requests));
        Self {
            client,
            config,
            concurrency,
        }
    }

    async fn get_with_limit(&self, url: &str) -> EngineResult<reqwest::Response> {
        let _permit = self.concurrency.acquire().await.map_err(|_| {
            EngineError::overload("catalog fetcher concurrency semaphore closed")
        })?;

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(EngineError::from)?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            warn!(retry_after, "catalog fetcher rate limited");
            return Err(EngineError::transient(format!(
                "rate limited, retry after {retry_after}s"
            )));
        }

        if !response.status().is_success() {
            let status = response.status();
            return Err(if status.is_client_error() {
                EngineError::Upstream4xx(format!("catalog provider {status}"))
            } else {
                EngineError::Transient(format!("catalog provider {status}"))
            });
        }

        Ok(response)
    }
}

fn to_record(kind: RecordKind, item: RawCatalogItem) -> Record {
    Record {
        id: item.id,
        kind,
        title: item.title,
        body: item.body,
        url: item.url,
        brand: item.brand,
        attributes: item.attributes,
        content_hash: String::new(),
        dense_vector: None,
        lexical_text: String::new(),
        active: true,
        updated_at: chrono::Utc::now(),
        source_version: None,
    }
    .with_recomputed_hash()
}

#[async_trait]
impl CatalogFetcher for HttpCatalogFetcher {
    async fn list_since(&self, kind: RecordKind, cursor: Option<&str>) -> EngineResult<Page> {
        let mut url = format!(
            "{}/catalog/{}?page_size={}",
            self.config.base_url.trim_end_matches('/'),
            kind.as_str(),
            self.config.page_size
        );
        if let Some(c) = cursor {
            url.push_str(&format!("&cursor={c}"));
        }

        let response = self.get_with_limit(&url).await?;
        let raw: RawPage = response.json().await.map_err(EngineError::from)?;
        Ok(Page {
            records: raw.items.into_iter().map(|i| to_record(kind, i)).collect(),
            next_cursor: raw.next_cursor,
        })
    }

    async fn get(&self, kind: RecordKind, id: &str) -> EngineResult<Option<Record>> {
        let url = format!(
            "{}/catalog/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            kind.as_str(),
            id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(EngineError::from)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EngineError::Transient(format!(
                "catalog provider {}",
                response.status()
            )));
        }
        let item: RawCatalogItem = response.json().await.map_err(EngineError::from)?;
        Ok(Some(to_record(kind, item)))
    }

    async fn resolve_order(&self, order_number: &str, customer_email: &str) -> EngineResult<Order> {
        let normalized_email = customer_email.trim().to_lowercase();
        let url = format!(
            "{}/orders/{}",
            self.config.base_url.trim_end_matches('/'),
            order_number
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(EngineError::from)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::not_found(format!("order {order_number} not found")));
        }
        if !response.status().is_success() {
            return Err(EngineError::Transient(format!(
                "catalog provider {}",
                response.status()
            )));
        }

        let order: Order = response.json().await.map_err(EngineError::from)?;
        if order.customer_email.trim().to_lowercase() != normalized_email {
            return Err(EngineError::not_found(format!(
                "order {order_number} does not match supplied email"
            )));
        }
        Ok(order)
    }

    async fn health_check(&self) -> bool {
        self.client
            .head(self.config.base_url.trim_end_matches('/'))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    pub struct FakeCatalogFetcher {
        pub records: Mutex<HashMap<RecordKind, Vec<Record>>>,
        pub orders: Mutex<HashMap<String, Order>>,
    }

    impl FakeCatalogFetcher {
        pub fn new() -> Self {
            Self {
                records: Mutex::new(HashMap::new()),
                orders: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl CatalogFetcher for FakeCatalogFetcher {
        async fn list_since(&self, kind: RecordKind, _cursor: Option<&str>) -> EngineResult<Page> {
            let records = self.records.lock().await;
            Ok(Page {
                records: records.get(&kind).cloned().unwrap_or_default(),
                next_cursor: None,
            })
        }

        async fn get(&self, kind: RecordKind, id: &str) -> EngineResult<Option<Record>> {
            let records = self.records.lock().await;
            Ok(records
                .get(&kind)
                .and_then(|rs| rs.iter().find(|r| r.id == id).cloned()))
        }

        async fn resolve_order(&self, order_number: &str, customer_email: &str) -> EngineResult<Order> {
            let orders = self.orders.lock().await;
            let normalized_email = customer_email.trim().to_lowercase();
            match orders.get(order_number) {
                Some(o) if o.customer_email.trim().to_lowercase() == normalized_email => Ok(o.clone()),
                _ => Err(EngineError::not_found(format!("order {order_number} not found"))),
            }
        }

        async fn health_check(&self) -> bool {
            true
        }
    }
}
