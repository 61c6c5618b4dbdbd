//! External outreach platform client: wire types, the `LeadSource` trait,
//! and an HTTP implementation with bounded retry and an injected rate
//! limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-source";

/// Raw lead as the platform returns it. `payload` is the client-defined
/// custom-field map and is deliberately left free-form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLead {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub campaign: Option<String>,
    #[serde(default)]
    pub lt_interest_status: Option<i64>,
    #[serde(default)]
    pub email_reply_count: i64,
    #[serde(default)]
    pub email_open_count: i64,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub payload: JsonMap<String, JsonValue>,
}

/// Raw email event. `ue_type == 2` marks an inbound reply; the legacy
/// `is_reply` flag drifted between API versions and must not be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEmail {
    pub id: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub lead: Option<String>,
    #[serde(default)]
    pub ue_type: Option<i64>,
    #[serde(default)]
    pub is_reply: Option<bool>,
    #[serde(default)]
    pub from_address_email: Option<String>,
    #[serde(default)]
    pub to_address_email: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub body_text: Option<String>,
    #[serde(default)]
    pub eaccount: Option<String>,
    #[serde(default)]
    pub i_status: Option<i64>,
    #[serde(default)]
    pub timestamp_email: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamp_created: Option<DateTime<Utc>>,
}

impl ExternalEmail {
    /// Event time with creation time as the fallback.
    pub fn effective_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp_email.or(self.timestamp_created)
    }
}

/// One day of campaign aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAnalyticsRow {
    pub date: NaiveDate,
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub contacted: i64,
    #[serde(default)]
    pub replies: i64,
    #[serde(default)]
    pub unique_replies: i64,
    #[serde(default)]
    pub bounced: i64,
    #[serde(default)]
    pub opened: i64,
    #[serde(default)]
    pub clicked: i64,
}

/// One page of a cursor-paginated listing. No cursor means end of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub next_starting_after: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LeadQuery {
    pub limit: Option<u32>,
    pub starting_after: Option<String>,
    pub search: Option<String>,
    pub interest_status: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmailFilter {
    pub campaign_id: Option<String>,
    pub lead: Option<String>,
    pub limit: Option<u32>,
    pub starting_after: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyRequest {
    pub eaccount: String,
    pub reply_to_uuid: String,
    pub subject: String,
    pub body_html: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// The external Lead Source API, abstracted so the engine and tests can
/// swap in fakes.
#[async_trait]
pub trait LeadSource: Send + Sync {
    /// Leads for one campaign, or the global pool when `campaign_id` is
    /// `None` (used by the backfill ingress with an interest filter).
    async fn list_leads(
        &self,
        campaign_id: Option<&str>,
        query: &LeadQuery,
    ) -> Result<Page<ExternalLead>, SourceError>;

    async fn list_emails(&self, filter: &EmailFilter) -> Result<Page<ExternalEmail>, SourceError>;

    async fn campaign_daily_analytics(
        &self,
        campaign_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyAnalyticsRow>, SourceError>;

    async fn campaigns_for_email(&self, email: &str) -> Result<Vec<String>, SourceError>;

    async fn reply_to_email(&self, request: &ReplyRequest) -> Result<(), SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Explicitly-scoped courtesy rate limiter injected into the client, so
/// multiple host instances never share hidden process-wide state.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.instantly.ai/api/v2".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

/// reqwest-backed `LeadSource` with bounded retry on transient failures.
#[derive(Debug)]
pub struct HttpLeadSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: BackoffPolicy,
    token_bucket: Option<Arc<TokenBucket>>,
}

impl HttpLeadSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| anyhow::anyhow!("building reqwest client: {err}"))?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(TokenBucket::new(c.capacity, c.refill_every)));
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            backoff: config.backoff,
            token_bucket,
        })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &JsonValue,
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let bytes = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(body)
            })
            .await?;
        decode(&url, &bytes)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let bytes = self
            .send_with_retry(|| {
                self.client
                    .get(&url)
                    .bearer_auth(&self.api_key)
                    .query(query)
            })
            .await?;
        decode(&url, &bytes)
    }

    async fn send_with_retry(
        &self,
        make_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, SourceError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let request_id = Uuid::new_v4();
        let span = info_span!("source_request", %request_id);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match make_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(SourceError::Request(err)),
            None => Err(SourceError::Decode {
                url: "<unknown>".to_string(),
                message: "retry loop exhausted without capturing an error".to_string(),
            }),
        }
    }
}

fn decode<T: DeserializeOwned>(url: &str, bytes: &[u8]) -> Result<T, SourceError> {
    serde_json::from_slice(bytes).map_err(|err| SourceError::Decode {
        url: url.to_string(),
        message: err.to_string(),
    })
}

#[async_trait]
impl LeadSource for HttpLeadSource {
    async fn list_leads(
        &self,
        campaign_id: Option<&str>,
        query: &LeadQuery,
    ) -> Result<Page<ExternalLead>, SourceError> {
        let mut body = serde_json::json!({});
        if let Some(campaign) = campaign_id {
            body["campaign"] = JsonValue::from(campaign);
        }
        if let Some(limit) = query.limit {
            body["limit"] = JsonValue::from(limit);
        }
        if let Some(cursor) = &query.starting_after {
            body["starting_after"] = JsonValue::from(cursor.as_str());
        }
        if let Some(search) = &query.search {
            body["search"] = JsonValue::from(search.as_str());
        }
        if let Some(interest) = query.interest_status {
            body["lt_interest_status"] = JsonValue::from(interest);
        }
        self.post_json("/leads/list", &body).await
    }

    async fn list_emails(&self, filter: &EmailFilter) -> Result<Page<ExternalEmail>, SourceError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(campaign) = &filter.campaign_id {
            query.push(("campaign_id", campaign.clone()));
        }
        if let Some(lead) = &filter.lead {
            query.push(("lead", lead.clone()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(cursor) = &filter.starting_after {
            query.push(("starting_after", cursor.clone()));
        }
        if let Some(order) = &filter.sort_order {
            query.push(("sort_order", order.clone()));
        }
        self.get_json("/emails", &query).await
    }

    async fn campaign_daily_analytics(
        &self,
        campaign_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyAnalyticsRow>, SourceError> {
        let query = [
            ("campaign_id", campaign_id.to_string()),
            ("start_date", start.to_string()),
            ("end_date", end.to_string()),
        ];
        self.get_json("/campaigns/analytics/daily", &query).await
    }

    async fn campaigns_for_email(&self, email: &str) -> Result<Vec<String>, SourceError> {
        let query = [("email", email.to_string())];
        self.get_json("/leads/campaigns", &query).await
    }

    async fn reply_to_email(&self, request: &ReplyRequest) -> Result<(), SourceError> {
        let body = serde_json::json!({
            "eaccount": request.eaccount,
            "reply_to_uuid": request.reply_to_uuid,
            "subject": request.subject,
            "body": { "html": request.body_html },
        });
        let _: JsonValue = self.post_json("/emails/reply", &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn lead_page_deserializes_with_free_form_payload() {
        let page: Page<ExternalLead> = serde_json::from_str(
            r#"{
                "items": [{
                    "id": "L1",
                    "email": "A@X.com",
                    "lt_interest_status": 1,
                    "email_reply_count": 2,
                    "payload": {"Industry": "SaaS", "functie": "CTO"}
                }],
                "next_starting_after": "L1"
            }"#,
        )
        .expect("page decodes");

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_starting_after.as_deref(), Some("L1"));
        let lead = &page.items[0];
        assert_eq!(lead.id, "L1");
        assert_eq!(lead.email, "A@X.com");
        assert_eq!(lead.lt_interest_status, Some(1));
        assert_eq!(lead.email_reply_count, 2);
        assert_eq!(lead.status, 0);
        assert_eq!(
            lead.payload.get("Industry").and_then(|v| v.as_str()),
            Some("SaaS")
        );
    }

    #[test]
    fn email_effective_timestamp_falls_back_to_creation() {
        let email: ExternalEmail = serde_json::from_str(
            r#"{
                "id": "E1",
                "ue_type": 2,
                "timestamp_created": "2026-03-01T10:00:00Z"
            }"#,
        )
        .expect("email decodes");
        assert_eq!(
            email.effective_timestamp().map(|t| t.to_rfc3339()),
            Some("2026-03-01T10:00:00+00:00".to_string())
        );
        assert_eq!(email.ue_type, Some(2));
        assert_eq!(email.is_reply, None);
    }

    #[tokio::test]
    async fn token_bucket_grants_up_to_capacity_without_waiting() {
        let bucket = TokenBucket::new(3, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
