//! Bootstrap zone loader -- fetches the fallback discovery payload over HTTP.

use std::time::Duration;

use serde_json::Value;
use switchboard_manager::{ConnectionManager, Tier, ZoneDirectory};
use tokio::sync::Mutex;

const BOOTSTRAP_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ZoneLoadError {
    #[error("fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("payload is not a discovery document")]
    Invalid,
}

/// Fetch `url` and load it as the fallback tier (zone order shuffled).
pub async fn load_bootstrap_zone(
    http: &reqwest::Client,
    url: &str,
    manager: &Mutex<ConnectionManager>,
) -> Result<(), ZoneLoadError> {
    tracing::info!(url, "fetching bootstrap zone list");

    let payload: Value = http
        .get(url)
        .timeout(BOOTSTRAP_FETCH_TIMEOUT)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let mut mgr = manager.lock().await;
    if ZoneDirectory::parse_zone(Tier::Fallback, false, &payload, &mut mgr) {
        Ok(())
    } else {
        Err(ZoneLoadError::Invalid)
    }
}
