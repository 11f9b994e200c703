//! HTTP client for the backend REST surface: conditional feed fetches,
//! streaming auth, and the telemetry/impressions/events submission
//! endpoints.
pub mod auth;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::events::Event;
use crate::impressions::{CountPerFeature, Impression, UniqueKeysPerFeature};
use crate::segments::SegmentChanges;
use crate::splits::{SplitChanges, SplitChangesResponse};
use crate::telemetry::{ConfigEcho, Endpoint, RuntimeStats, TelemetryRuntime};
use crate::{Error, Result, SdkMetadata};

pub use auth::{AuthResponse, Token};

pub const DEFAULT_SDK_URL: &str = "https://sdk.split.io/api";
pub const DEFAULT_EVENTS_URL: &str = "https://events.split.io/api";
pub const DEFAULT_AUTH_URL: &str = "https://auth.split.io/api";
pub const DEFAULT_STREAMING_URL: &str = "https://streaming.split.io/sse";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1500);

/// Whether a failed request may be retried within the same sync cycle.
/// Client errors other than timeouts and throttling are not.
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Network(_) | Error::Io(_) => true,
        Error::RequestRejected(status) => {
            *status == 408 || *status == 429 || (500..600).contains(status)
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub sdk_url: String,
    pub events_url: String,
    pub auth_url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> ApiConfig {
        ApiConfig {
            sdk_url: DEFAULT_SDK_URL.to_owned(),
            events_url: DEFAULT_EVENTS_URL.to_owned(),
            auth_url: DEFAULT_AUTH_URL.to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// The backend API client. Holds one connection pool reused across all REST
/// requests of a factory.
pub struct SplitApi {
    client: reqwest::Client,
    config: ApiConfig,
    sdk_key: String,
    metadata: SdkMetadata,
    telemetry: Arc<TelemetryRuntime>,
}

impl SplitApi {
    pub fn new(
        sdk_key: String,
        config: ApiConfig,
        metadata: SdkMetadata,
        telemetry: Arc<TelemetryRuntime>,
    ) -> Result<SplitApi> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()?;
        Ok(SplitApi {
            client,
            config,
            sdk_key,
            metadata,
            telemetry,
        })
    }

    /// Conditional fetch of the flag feed: definitions changed since the
    /// given change-number, optionally restricted to flag sets, optionally
    /// with a CDN-bypassing `till`.
    pub async fn fetch_splits(
        &self,
        since: i64,
        sets: Option<&str>,
        till: Option<i64>,
    ) -> Result<SplitChanges> {
        let mut params: Vec<(&str, String)> = vec![("since", since.to_string())];
        if let Some(sets) = sets {
            params.push(("sets", sets.to_owned()));
        }
        if let Some(till) = till {
            params.push(("till", till.to_string()));
        }
        let url = Url::parse_with_params(
            &format!("{}/splitChanges", self.config.sdk_url),
            &params,
        )
        .map_err(Error::InvalidBaseUrl)?;

        log::debug!(target: "splitio", "fetching feature flag changes since {since}");
        let response: SplitChangesResponse = self.get_json(url, Endpoint::SplitChanges).await?;
        Ok(response.into_changes())
    }

    /// Conditional fetch of one segment's member delta.
    pub async fn fetch_segment(
        &self,
        name: &str,
        since: i64,
        till: Option<i64>,
    ) -> Result<SegmentChanges> {
        let mut params: Vec<(&str, String)> = vec![("since", since.to_string())];
        if let Some(till) = till {
            params.push(("till", till.to_string()));
        }
        let url = Url::parse_with_params(
            &format!("{}/segmentChanges/{name}", self.config.sdk_url),
            &params,
        )
        .map_err(Error::InvalidBaseUrl)?;

        log::debug!(target: "splitio", "fetching segment {name} changes since {since}");
        self.get_json(url, Endpoint::SegmentChanges).await
    }

    /// Obtain a streaming token. `Ok(token)` with `push_enabled == false`
    /// means streaming is disabled for this account.
    pub async fn authenticate(&self) -> Result<Token> {
        let url = Url::parse(&format!("{}/v2/auth?s=1.3", self.config.auth_url))
            .map_err(Error::InvalidBaseUrl)?;

        let response: AuthResponse = self.get_json(url, Endpoint::Auth).await.map_err(|err| {
            if matches!(err, Error::Unauthorized | Error::RequestRejected(_))
                && !is_retryable(&err)
            {
                self.telemetry.record_auth_rejection();
                Error::PushAuthFailed
            } else {
                err
            }
        })?;

        match (response.push_enabled, response.token) {
            (true, Some(raw)) => Token::parse(true, &raw),
            _ => Ok(Token {
                push_enabled: false,
                token: String::new(),
                channels: Vec::new(),
                exp: 0,
                iat: 0,
            }),
        }
    }

    pub async fn post_impressions(&self, impressions: &[Impression]) -> Result<()> {
        let bulk = build_impressions_bulk(impressions);
        let url = self.events_endpoint("testImpressions/bulk")?;
        self.post_json(url, Endpoint::ImpressionsBulk, &bulk).await
    }

    pub async fn post_impression_counts(&self, counts: &[CountPerFeature]) -> Result<()> {
        let body = ImpressionCountsBody {
            pf: counts
                .iter()
                .map(|count| ImpressionCount {
                    f: count.feature.clone(),
                    m: count.timeframe,
                    rc: count.count,
                })
                .collect(),
        };
        let url = self.events_endpoint("testImpressions/count")?;
        self.post_json(url, Endpoint::ImpressionsCount, &body).await
    }

    pub async fn post_unique_keys(&self, unique_keys: &[UniqueKeysPerFeature]) -> Result<()> {
        let body = UniqueKeysBody {
            keys: unique_keys
                .iter()
                .map(|entry| UniqueKeys {
                    f: entry.feature.clone(),
                    ks: entry.keys.clone(),
                })
                .collect(),
        };
        let url = self.events_endpoint("keys/cs")?;
        self.post_json(url, Endpoint::UniqueKeys, &body).await
    }

    pub async fn post_events(&self, events: &[Event]) -> Result<()> {
        let url = self.events_endpoint("events/bulk")?;
        self.post_json(url, Endpoint::EventsBulk, &events).await
    }

    pub async fn post_telemetry_config(&self, echo: &ConfigEcho) -> Result<()> {
        let url = self.events_endpoint("metrics/config")?;
        self.post_json(url, Endpoint::TelemetryConfig, echo).await
    }

    pub async fn post_telemetry_stats(&self, stats: &RuntimeStats) -> Result<()> {
        let url = self.events_endpoint("metrics/usage")?;
        self.post_json(url, Endpoint::TelemetryUsage, stats).await
    }

    fn events_endpoint(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{path}", self.config.events_url)).map_err(Error::InvalidBaseUrl)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, endpoint: Endpoint) -> Result<T> {
        let started = Instant::now();
        let response = self.decorate(self.client.get(url)).send().await;
        self.telemetry
            .record_http_latency(endpoint, started.elapsed());
        let response = self.check_status(endpoint, response?)?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: Url,
        endpoint: Endpoint,
        body: &B,
    ) -> Result<()> {
        let started = Instant::now();
        let response = self.decorate(self.client.post(url)).json(body).send().await;
        self.telemetry
            .record_http_latency(endpoint, started.elapsed());
        self.check_status(endpoint, response?)?;
        Ok(())
    }

    fn decorate(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut request = request
            .header("Authorization", format!("Bearer {}", self.sdk_key))
            .header("SplitSDKVersion", self.metadata.sdk_version.clone());
        if let Some(ip) = &self.metadata.machine_ip {
            request = request.header("SplitSDKMachineIP", ip.clone());
        }
        if let Some(name) = &self.metadata.machine_name {
            request = request.header("SplitSDKMachineName", name.clone());
        }
        request
    }

    fn check_status(
        &self,
        endpoint: Endpoint,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        self.telemetry.record_http_error(endpoint, status.as_u16());
        log::warn!(
            target: "splitio",
            "received non-200 response from {}: {status}",
            endpoint.as_str(),
        );
        if status == StatusCode::UNAUTHORIZED {
            Err(Error::Unauthorized)
        } else {
            Err(Error::RequestRejected(status.as_u16()))
        }
    }
}

/// Impressions are POSTed grouped by feature.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestImpressions {
    pub test_name: String,
    pub key_impressions: Vec<KeyImpression>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyImpression {
    pub key_name: String,
    pub treatment: String,
    pub time: i64,
    pub change_number: i64,
    pub label: String,
    pub bucketing_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pt: Option<i64>,
}

pub fn build_impressions_bulk(impressions: &[Impression]) -> Vec<TestImpressions> {
    let mut grouped: Vec<TestImpressions> = Vec::new();
    for impression in impressions {
        let key_impression = KeyImpression {
            key_name: impression.matching_key.clone(),
            treatment: impression.treatment.clone(),
            time: impression.time,
            change_number: impression.change_number,
            label: impression.label.clone(),
            bucketing_key: impression.bucketing_key.clone(),
            pt: impression.previous_time,
        };
        match grouped
            .iter_mut()
            .find(|group| group.test_name == impression.feature_name)
        {
            Some(group) => group.key_impressions.push(key_impression),
            None => grouped.push(TestImpressions {
                test_name: impression.feature_name.clone(),
                key_impressions: vec![key_impression],
            }),
        }
    }
    grouped
}

#[derive(Debug, Serialize)]
struct ImpressionCountsBody {
    pf: Vec<ImpressionCount>,
}

#[derive(Debug, Serialize)]
struct ImpressionCount {
    f: String,
    m: i64,
    rc: u64,
}

#[derive(Debug, Serialize)]
struct UniqueKeysBody {
    keys: Vec<UniqueKeys>,
}

#[derive(Debug, Serialize)]
struct UniqueKeys {
    f: String,
    ks: Vec<String>,
}
