use std::time::Duration;

use anyhow::{anyhow, Result};
use once_cell::sync::{Lazy, OnceCell};
use reqwest::{Client, Response};
use tokio::sync::Semaphore;

/// A semaphore for limiting concurrent requests.
///
/// 限制同時對外的請求數，避免被行情來源視為濫用而封鎖。
static SEMAPHORE: Lazy<Semaphore> = Lazy::new(|| Semaphore::new(8));

/// A singleton instance of the reqwest client.
static CLIENT: OnceCell<Client> = OnceCell::new();

/// Returns the reqwest client singleton instance or creates one if it doesn't exist.
fn get_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .brotli(true)
            .gzip(true)
            .connect_timeout(Duration::from_secs(8))
            .timeout(Duration::from_secs(15))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .map_err(|e| anyhow!("Failed to create reqwest client: {:?}", e))
    })
}

/// Performs an HTTP GET request and returns the raw response.
///
/// 狀態碼的判讀交由呼叫端處理。
pub async fn get_response(url: &str) -> Result<Response> {
    let _permit = SEMAPHORE.acquire().await?;
    Ok(get_client()?.get(url).send().await?)
}
