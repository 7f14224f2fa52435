//! HTTP collaborators: flag/segment fetches and telemetry posts

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use sdk_core::sync::{Collector, DataFetcher, Endpoint, SegmentChanges, SplitChanges};
use sdk_core::Settings;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct MySegment {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MySegmentsResponse {
    #[serde(default)]
    my_segments: Vec<MySegment>,
}

/// Talks to the sdk, events and telemetry services
pub struct HttpClient {
    client: Client,
    sdk_url: Url,
    events_url: Url,
    telemetry_url: Url,
    authorization_key: String,
    sdk_version: String,
}

/// Appends `path` to the base URL's path instead of replacing its last segment
fn join(base: &Url, path: &str) -> Result<Url> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined).with_context(|| format!("Invalid URL {joined}"))
}

impl HttpClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            sdk_url: Url::parse(&settings.urls.sdk).context("Invalid sdk URL")?,
            events_url: Url::parse(&settings.urls.events).context("Invalid events URL")?,
            telemetry_url: Url::parse(&settings.urls.telemetry)
                .context("Invalid telemetry URL")?,
            authorization_key: settings.core.authorization_key.clone(),
            sdk_version: settings.sdk_version.clone(),
        })
    }

    fn endpoint_url(&self, endpoint: Endpoint) -> Result<Url> {
        let base = match endpoint {
            Endpoint::Usage => &self.telemetry_url,
            _ => &self.events_url,
        };
        join(base, endpoint.path())
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.authorization_key)
            .header("SplitSDKVersion", &self.sdk_version)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }
}

#[async_trait]
impl DataFetcher for HttpClient {
    async fn fetch_split_changes(&self, since: i64) -> Result<SplitChanges> {
        let mut url = join(&self.sdk_url, "/splitChanges")?;
        url.query_pairs_mut().append_pair("since", &since.to_string());
        self.get(url).await
    }

    async fn fetch_my_segments(&self, key: &str) -> Result<Vec<String>> {
        let mut url = join(&self.sdk_url, "/mySegments")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("sdk URL cannot be a base"))?
            .push(key);
        let response: MySegmentsResponse = self.get(url).await?;
        Ok(response.my_segments.into_iter().map(|s| s.name).collect())
    }

    async fn fetch_segment_changes(&self, name: &str, since: i64) -> Result<SegmentChanges> {
        let mut url = join(&self.sdk_url, "/segmentChanges")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("sdk URL cannot be a base"))?
            .push(name);
        url.query_pairs_mut().append_pair("since", &since.to_string());
        self.get(url).await
    }
}

#[async_trait]
impl Collector for HttpClient {
    async fn post(&self, endpoint: Endpoint, body: String) -> Result<()> {
        let url = self.endpoint_url(endpoint)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.authorization_key)
            .header("SplitSDKVersion", &self.sdk_version)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }
        Ok(())
    }
}

/// Collector of localhost mode: batches never leave the process
pub struct DiscardCollector;

#[async_trait]
impl Collector for DiscardCollector {
    async fn post(&self, endpoint: Endpoint, body: String) -> Result<()> {
        debug!(kind = endpoint.kind(), bytes = body.len(), "Discarding batch");
        Ok(())
    }
}
