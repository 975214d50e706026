//! Marketplace bookkeeping collaborators.
//!
//! Product-sold marking and seller sale counters are owned by the
//! marketplace service; atomic increments are its contract, not ours.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::ports::{HookError, MarketplaceHooks};

#[derive(Clone)]
pub struct HttpMarketplaceHooks {
    client: Client,
    base_url: String,
}

impl HttpMarketplaceHooks {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), HookError> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| HookError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(HookError(format!(
                "{path} returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketplaceHooks for HttpMarketplaceHooks {
    async fn mark_product_sold(&self, product_id: &str, buyer_id: &str) -> Result<(), HookError> {
        self.post(
            &format!("/products/{product_id}/sold"),
            json!({ "sold_to": buyer_id }),
        )
        .await
    }

    async fn increment_seller_sales(&self, seller_id: &str) -> Result<(), HookError> {
        self.post(&format!("/users/{seller_id}/sales/increment"), json!({}))
            .await
    }
}

/// No-op hooks for deployments without a marketplace service configured.
#[derive(Default, Clone)]
pub struct NoopMarketplaceHooks;

#[async_trait]
impl MarketplaceHooks for NoopMarketplaceHooks {
    async fn mark_product_sold(&self, product_id: &str, buyer_id: &str) -> Result<(), HookError> {
        tracing::debug!(product_id, buyer_id, "marketplace hooks disabled, skipping product-sold");
        Ok(())
    }

    async fn increment_seller_sales(&self, seller_id: &str) -> Result<(), HookError> {
        tracing::debug!(seller_id, "marketplace hooks disabled, skipping sales increment");
        Ok(())
    }
}
