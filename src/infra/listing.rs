//! HTTP directory-listing fetcher

use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;

use crate::core::locator::ListingFetcher;

/// Fetches listing pages with `reqwest`
#[derive(Debug, Clone)]
pub struct HttpListingFetcher {
    client: reqwest::Client,
}

impl HttpListingFetcher {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(connect_timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

impl ListingFetcher for HttpListingFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, String>> {
        async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("HTTP {}", response.status()));
            }
            response.text().await.map_err(|e| e.to_string())
        }
        .boxed()
    }
}
