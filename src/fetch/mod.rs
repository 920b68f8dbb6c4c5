//! HTTP access for remote inputs and the snapping service.

mod basic;
pub mod auth;

pub use basic::BasicClient;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Request, Response};
use serde::de::DeserializeOwned;

/// Transport seam for every outbound request, so auth wrappers and test
/// doubles can be layered without touching callers.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}

pub async fn fetch_json<C: HttpClient, T: DeserializeOwned>(client: &C, url: &str) -> Result<T> {
    let bytes = fetch_bytes(client, url).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Reads `source` from disk, or over HTTP when it looks like a URL.
#[tracing::instrument(skip(client))]
pub async fn read_source<C: HttpClient>(client: &C, source: &str) -> Result<Vec<u8>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_bytes(client, source).await
    } else {
        Ok(tokio::fs::read(source).await?)
    }
}
