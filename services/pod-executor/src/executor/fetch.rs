//! HTTP fetches for remote files and remote env files.

use std::collections::BTreeMap;
use std::time::Duration;

use podex_messages::EnvFile;
use tracing::debug;

use super::error::ExecutorError;

/// Upper bound on a single fetched payload.
pub const MAX_FETCH_BYTES: usize = 16 * 1024 * 1024;

pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub async fn fetch_bytes(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, ExecutorError> {
    let fetch_err = |reason: String| ExecutorError::Fetch {
        url: url.to_string(),
        reason,
    };

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| fetch_err(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(fetch_err(format!("HTTP {status}")));
    }
    if response
        .content_length()
        .is_some_and(|len| len > MAX_FETCH_BYTES as u64)
    {
        return Err(fetch_err(format!("payload exceeds {MAX_FETCH_BYTES} bytes")));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| fetch_err(e.to_string()))?;
    if body.len() > MAX_FETCH_BYTES {
        return Err(fetch_err(format!("payload exceeds {MAX_FETCH_BYTES} bytes")));
    }
    debug!(url, bytes = body.len(), "Fetched remote payload");
    Ok(body.to_vec())
}

/// Fetches and parses a dotenv file.
pub async fn fetch_env(
    client: &reqwest::Client,
    url: &str,
) -> Result<BTreeMap<String, String>, ExecutorError> {
    let body = fetch_bytes(client, url).await?;
    let text = String::from_utf8(body).map_err(|_| ExecutorError::Fetch {
        url: url.to_string(),
        reason: "env file is not valid UTF-8".to_string(),
    })?;
    let env = EnvFile::parse(&text).map_err(|e| ExecutorError::Fetch {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(env.into_map())
}
