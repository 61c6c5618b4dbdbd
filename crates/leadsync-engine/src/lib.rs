//! Sync orchestration: per-campaign reconciliation, the email cache pass,
//! new-positive detection and alerting, and the webhook/backfill/cleanup
//! ingress variants.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{
    derive_lead_status, extract_payload_field, merge_interest, normalize_email, payload_keys,
    CachedEmail, CampaignDayStats, InterestStatus, LeadRecord, ReplySnapshot, SyncErrorKind,
};
use leadsync_source::{
    EmailFilter, ExternalEmail, ExternalLead, LeadQuery, LeadSource, SourceError,
};
use leadsync_store::{LeadStore, StoreError, LEAD_UPSERT_BATCH};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-engine";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("campaign {0} is not mapped to any client")]
    UnknownCampaign(String),
    #[error("lead {email} not found in campaign {campaign_id}")]
    LeadNotFound { email: String, campaign_id: String },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Source(_) => SyncErrorKind::ApiFailure,
            _ => SyncErrorKind::SyncError,
        }
    }

    /// True for the ingress errors that mean "no such resource" rather
    /// than a failed operation.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownCampaign(_) | Self::LeadNotFound { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_limit: u32,
    pub page_delay: Duration,
    pub step_delay: Duration,
    pub client_delay: Duration,
    pub analytics_window_days: i64,
    pub notifications_enabled: bool,
    pub dashboard_base_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_limit: 100,
            page_delay: Duration::from_millis(300),
            step_delay: Duration::from_millis(500),
            client_delay: Duration::from_millis(1000),
            analytics_window_days: 365,
            notifications_enabled: false,
            dashboard_base_url: "http://localhost:3000".to_string(),
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let millis = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };
        Self {
            page_limit: std::env::var("LEADSYNC_PAGE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.page_limit),
            page_delay: millis("LEADSYNC_PAGE_DELAY_MS", defaults.page_delay),
            step_delay: millis("LEADSYNC_STEP_DELAY_MS", defaults.step_delay),
            client_delay: millis("LEADSYNC_CLIENT_DELAY_MS", defaults.client_delay),
            analytics_window_days: std::env::var("LEADSYNC_ANALYTICS_WINDOW_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.analytics_window_days),
            notifications_enabled: std::env::var("LEADSYNC_NOTIFICATIONS_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.notifications_enabled),
            dashboard_base_url: std::env::var("LEADSYNC_DASHBOARD_URL")
                .unwrap_or(defaults.dashboard_base_url),
            scheduler_enabled: std::env::var("LEADSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("LEADSYNC_SYNC_CRON").unwrap_or(defaults.sync_cron),
        }
    }
}

/// Outbound alert for one newly-positive lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositiveLeadAlert {
    pub client_id: String,
    pub campaign_id: String,
    pub lead_email: String,
    pub lead_name: Option<String>,
    pub target_email: String,
    pub inbox_url: String,
    pub is_vacancy: bool,
}

/// Delivery seam for new-positive alerts, so tests can record instead of
/// calling out.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &PositiveLeadAlert) -> anyhow::Result<()>;
}

/// Fires alerts at a configured webhook URL.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| anyhow::anyhow!("building alert webhook client: {err}"))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn deliver(&self, alert: &PositiveLeadAlert) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("alert webhook answered {status}");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn deliver(&self, _alert: &PositiveLeadAlert) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub clients_synced: usize,
    pub clients_failed: usize,
    pub campaigns_synced: usize,
    pub campaigns_failed: usize,
    pub leads_upserted: usize,
    pub emails_cached: usize,
    pub alerts_sent: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientSyncSummary {
    pub client_id: String,
    pub campaigns_synced: usize,
    pub campaigns_failed: usize,
    pub leads_upserted: usize,
    pub emails_cached: usize,
    pub alerts_sent: usize,
}

/// Result of reconciling one `(client, campaign)` pair. `newly_positive`
/// is empty whenever detection was disabled for the pass.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub leads_seen: usize,
    pub leads_upserted: usize,
    pub batches_failed: usize,
    pub detection_enabled: bool,
    pub newly_positive: Vec<LeadRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SingleLeadOutcome {
    pub client_ids: Vec<String>,
    pub interest_status: Option<InterestStatus>,
    pub leads_upserted: usize,
    pub emails_cached: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillSummary {
    pub scanned: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub errored: usize,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignCleanup {
    pub client_id: String,
    pub campaign_id: String,
    pub removed: Vec<String>,
    pub kept: usize,
    pub deleted_rows: u64,
    pub deleted_emails: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub campaigns: Vec<CampaignCleanup>,
}

/// The sync orchestrator. One instance is shared across the web ingress
/// and the scheduler; all state lives in the injected collaborators.
pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn LeadSource>,
    store: Arc<dyn LeadStore>,
    alerts: Arc<dyn AlertSink>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn LeadSource>,
        store: Arc<dyn LeadStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            alerts,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Bulk sync across all tenants, least-recently-synced first so a run
    /// truncated by the host's execution limit still makes global progress
    /// on the next invocation.
    pub async fn sync_all_clients(&self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clients = self.store.clients_by_staleness().await?;

        let span = info_span!("sync_all_clients", %run_id, clients = clients.len());
        async {
            let mut summary = SyncRunSummary {
                run_id,
                started_at,
                finished_at: started_at,
                clients_synced: 0,
                clients_failed: 0,
                campaigns_synced: 0,
                campaigns_failed: 0,
                leads_upserted: 0,
                emails_cached: 0,
                alerts_sent: 0,
            };

            for client_id in &clients {
                match self.sync_client_data(client_id).await {
                    Ok(client_summary) => {
                        summary.clients_synced += 1;
                        summary.campaigns_synced += client_summary.campaigns_synced;
                        summary.campaigns_failed += client_summary.campaigns_failed;
                        summary.leads_upserted += client_summary.leads_upserted;
                        summary.emails_cached += client_summary.emails_cached;
                        summary.alerts_sent += client_summary.alerts_sent;
                    }
                    Err(err) => {
                        summary.clients_failed += 1;
                        self.record_failure(Some(client_id.as_str()), &err, "sync_client_data")
                            .await;
                    }
                }
                tokio::time::sleep(self.config.client_delay).await;
            }

            summary.finished_at = Utc::now();
            info!(
                clients = summary.clients_synced,
                failed = summary.clients_failed,
                leads = summary.leads_upserted,
                "bulk sync finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Full pass for one client: per campaign, analytics then the email
    /// cache then reconciliation, each failure isolated to its campaign.
    pub async fn sync_client_data(&self, client_id: &str) -> Result<ClientSyncSummary, SyncError> {
        let campaigns = self.store.campaigns_for_client(client_id).await?;
        let mut summary = ClientSyncSummary {
            client_id: client_id.to_string(),
            ..ClientSyncSummary::default()
        };

        for campaign_id in &campaigns {
            if let Err(err) = self.sync_campaign_analytics(client_id, campaign_id).await {
                self.record_failure(Some(client_id), &err, "campaign_analytics")
                    .await;
            }
            tokio::time::sleep(self.config.step_delay).await;

            match self.cache_campaign_emails(client_id, campaign_id).await {
                Ok(cached) => summary.emails_cached += cached,
                Err(err) => {
                    self.record_failure(Some(client_id), &err, "email_cache_pass")
                        .await;
                }
            }
            tokio::time::sleep(self.config.step_delay).await;

            match self.reconcile_campaign(client_id, campaign_id).await {
                Ok(outcome) => {
                    summary.campaigns_synced += 1;
                    summary.leads_upserted += outcome.leads_upserted;
                    if self.config.notifications_enabled {
                        summary.alerts_sent += self
                            .notify_new_positives(client_id, &outcome.newly_positive)
                            .await;
                    }
                }
                Err(err) => {
                    summary.campaigns_failed += 1;
                    self.record_failure(Some(client_id), &err, "reconcile_campaign")
                        .await;
                }
            }
            tokio::time::sleep(self.config.step_delay).await;
        }

        Ok(summary)
    }

    /// Fetch every lead of one campaign, classify, and upsert in batches.
    ///
    /// The baseline interest map is read before any write; if that read
    /// fails the pass still upserts but reports no newly-positive leads,
    /// because guessing would risk duplicate notifications.
    pub async fn reconcile_campaign(
        &self,
        client_id: &str,
        campaign_id: &str,
    ) -> Result<ReconcileOutcome, SyncError> {
        let leads = self.fetch_all_leads(Some(campaign_id), None).await?;
        let emails: Vec<String> = leads.iter().map(|l| normalize_email(&l.email)).collect();

        let snapshots = self
            .store
            .latest_reply_snapshots(client_id, &emails)
            .await?;

        let (baseline, detection_enabled) =
            match self.store.interest_baseline(client_id, &emails).await {
                Ok(baseline) => (baseline, true),
                Err(err) => {
                    self.record_failure(
                        Some(client_id),
                        &SyncError::from(err),
                        "interest_baseline",
                    )
                    .await;
                    (HashMap::new(), false)
                }
            };

        let now = Utc::now();
        let records: Vec<LeadRecord> = leads
            .iter()
            .map(|lead| {
                let snapshot = snapshots.get(&normalize_email(&lead.email));
                lead_record_from_external(client_id, campaign_id, lead, snapshot, now)
            })
            .collect();

        let mut upserted = 0usize;
        let mut batches_failed = 0usize;
        for batch in records.chunks(LEAD_UPSERT_BATCH) {
            match self.store.upsert_leads(batch).await {
                Ok(written) => upserted += written,
                Err(err) => {
                    batches_failed += 1;
                    self.record_failure(Some(client_id), &SyncError::from(err), "upsert_batch")
                        .await;
                }
            }
        }

        let newly_positive = if detection_enabled {
            detect_new_positives(&records, &baseline)
        } else {
            Vec::new()
        };

        Ok(ReconcileOutcome {
            leads_seen: records.len(),
            leads_upserted: upserted,
            batches_failed,
            detection_enabled,
            newly_positive,
        })
    }

    /// Pull one campaign's email history into the local cache.
    pub async fn cache_campaign_emails(
        &self,
        client_id: &str,
        campaign_id: &str,
    ) -> Result<usize, SyncError> {
        let filter = EmailFilter {
            campaign_id: Some(campaign_id.to_string()),
            ..EmailFilter::default()
        };
        self.cache_emails(client_id, filter).await
    }

    /// Pull one lead's email history into the local cache.
    pub async fn cache_lead_emails(
        &self,
        client_id: &str,
        lead_email: &str,
    ) -> Result<usize, SyncError> {
        let filter = EmailFilter {
            lead: Some(normalize_email(lead_email)),
            ..EmailFilter::default()
        };
        self.cache_emails(client_id, filter).await
    }

    async fn cache_emails(&self, client_id: &str, filter: EmailFilter) -> Result<usize, SyncError> {
        let mut cached = 0usize;
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .source
                .list_emails(&EmailFilter {
                    limit: Some(self.config.page_limit),
                    starting_after: cursor.clone(),
                    ..filter.clone()
                })
                .await?;

            let rows: Vec<CachedEmail> = page
                .items
                .iter()
                .filter_map(|email| cached_email_from_external(client_id, email))
                .collect();
            cached += self.store.upsert_cached_emails(&rows).await?;

            match page.next_starting_after {
                Some(next) if !next.is_empty() => {
                    cursor = Some(next);
                    tokio::time::sleep(self.config.page_delay).await;
                }
                _ => break,
            }
        }
        Ok(cached)
    }

    /// Per-day aggregates over the bounded historical window. Additive and
    /// idempotent; independent of lead/email sync.
    pub async fn sync_campaign_analytics(
        &self,
        client_id: &str,
        campaign_id: &str,
    ) -> Result<usize, SyncError> {
        let end = Utc::now().date_naive();
        let start = end - chrono::Duration::days(self.config.analytics_window_days);
        let rows = self
            .source
            .campaign_daily_analytics(campaign_id, start, end)
            .await?;
        let stats: Vec<CampaignDayStats> = rows
            .iter()
            .map(|row| CampaignDayStats {
                client_id: client_id.to_string(),
                campaign_id: campaign_id.to_string(),
                date: row.date,
                sent: row.sent,
                contacted: row.contacted,
                replies: row.replies,
                unique_replies: row.unique_replies,
                bounced: row.bounced,
                opened: row.opened,
                clicked: row.clicked,
            })
            .collect();
        Ok(self.store.upsert_campaign_analytics(&stats).await?)
    }

    /// Resolve the alert target and fire one alert per newly-positive
    /// lead. Delivery failures are logged and swallowed; they never fail
    /// the sync pass.
    pub async fn notify_new_positives(&self, client_id: &str, leads: &[LeadRecord]) -> usize {
        if leads.is_empty() {
            return 0;
        }
        let profile = match self.store.client_profile(client_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                warn!(client_id, "no client profile, skipping alerts");
                return 0;
            }
            Err(err) => {
                self.record_failure(Some(client_id), &SyncError::from(err), "client_profile")
                    .await;
                return 0;
            }
        };
        if !profile.notifications_enabled {
            return 0;
        }
        let Some(target_email) = profile
            .notification_email
            .clone()
            .or_else(|| profile.login_emails.first().cloned())
        else {
            warn!(client_id, "no alert target email configured");
            return 0;
        };

        let mut sent = 0usize;
        for lead in leads {
            let alert = PositiveLeadAlert {
                client_id: client_id.to_string(),
                campaign_id: lead.campaign_id.clone(),
                lead_email: lead.email.clone(),
                lead_name: full_name(lead),
                target_email: target_email.clone(),
                inbox_url: format!(
                    "{}/inbox?lead={}&campaign={}",
                    self.config.dashboard_base_url.trim_end_matches('/'),
                    normalize_email(&lead.email),
                    lead.campaign_id
                ),
                is_vacancy: profile.is_recruitment || lead.vacancy_url.is_some(),
            };
            match self.alerts.deliver(&alert).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    warn!(client_id, lead = %alert.lead_email, %err, "alert delivery failed");
                    let _ = self
                        .store
                        .log_sync_error(
                            Some(client_id),
                            SyncErrorKind::SyncError,
                            "alert delivery failed",
                            serde_json::json!({
                                "lead_email": alert.lead_email,
                                "error": err.to_string(),
                            }),
                        )
                        .await;
                }
            }
        }
        sent
    }

    /// Webhook ingress: sync exactly one lead for every client claiming
    /// the campaign. The webhook delivery is itself the positive signal,
    /// so interest defaults to positive unless the lead record carries its
    /// own classification. No baseline diff, no alerting.
    pub async fn sync_single_lead(
        &self,
        email: &str,
        campaign_id: &str,
    ) -> Result<SingleLeadOutcome, SyncError> {
        let client_ids = self.store.clients_for_campaign(campaign_id).await?;
        if client_ids.is_empty() {
            return Err(SyncError::UnknownCampaign(campaign_id.to_string()));
        }

        let normalized = normalize_email(email);
        let page = self
            .source
            .list_leads(
                Some(campaign_id),
                &LeadQuery {
                    limit: Some(10),
                    search: Some(normalized.clone()),
                    ..LeadQuery::default()
                },
            )
            .await?;
        let lead = page
            .items
            .into_iter()
            .find(|l| normalize_email(&l.email) == normalized)
            .ok_or_else(|| SyncError::LeadNotFound {
                email: normalized.clone(),
                campaign_id: campaign_id.to_string(),
            })?;

        let interest =
            InterestStatus::from_raw(lead.lt_interest_status).or(Some(InterestStatus::Positive));
        let now = Utc::now();
        let mut leads_upserted = 0usize;
        let mut emails_cached = 0usize;
        for client_id in &client_ids {
            let mut record = lead_record_from_external(client_id, campaign_id, &lead, None, now);
            record.interest_status = interest;
            leads_upserted += self
                .store
                .upsert_leads(std::slice::from_ref(&record))
                .await?;
            emails_cached += self.cache_lead_emails(client_id, &normalized).await?;
        }

        Ok(SingleLeadOutcome {
            client_ids,
            interest_status: interest,
            leads_upserted,
            emails_cached,
        })
    }

    /// Backfill ingress: one page of the global positive pool, resolved to
    /// every `(client, campaign)` pair that claims each lead.
    pub async fn backfill_positives(
        &self,
        limit: u32,
        cursor: Option<String>,
    ) -> Result<BackfillSummary, SyncError> {
        let page = self
            .source
            .list_leads(
                None,
                &LeadQuery {
                    limit: Some(limit),
                    starting_after: cursor,
                    interest_status: Some(1),
                    ..LeadQuery::default()
                },
            )
            .await?;

        let now = Utc::now();
        let mut summary = BackfillSummary {
            scanned: page.items.len(),
            next_cursor: page.next_starting_after.clone(),
            ..BackfillSummary::default()
        };

        for lead in &page.items {
            match self.backfill_one(lead, now).await {
                Ok(0) => summary.skipped += 1,
                Ok(written) => summary.inserted += written,
                Err(err) => {
                    summary.errored += 1;
                    self.record_failure(None, &err, "backfill_lead").await;
                }
            }
        }
        Ok(summary)
    }

    async fn backfill_one(&self, lead: &ExternalLead, now: DateTime<Utc>) -> Result<usize, SyncError> {
        let campaigns = match &lead.campaign {
            Some(campaign) => vec![campaign.clone()],
            None => {
                self.source
                    .campaigns_for_email(&normalize_email(&lead.email))
                    .await?
            }
        };

        let mut pairs: Vec<(String, String)> = Vec::new();
        for campaign_id in &campaigns {
            for client_id in self.store.clients_for_campaign(campaign_id).await? {
                pairs.push((client_id, campaign_id.clone()));
            }
        }
        if pairs.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        for (client_id, campaign_id) in &pairs {
            let record = lead_record_from_external(client_id, campaign_id, lead, None, now);
            written += self
                .store
                .upsert_leads(std::slice::from_ref(&record))
                .await?;
        }

        let distinct_clients: HashSet<&String> = pairs.iter().map(|(c, _)| c).collect();
        for client_id in distinct_clients {
            if let Err(err) = self
                .cache_lead_emails(client_id, &normalize_email(&lead.email))
                .await
            {
                self.record_failure(Some(client_id.as_str()), &err, "backfill_email_cache")
                    .await;
            }
        }
        Ok(written)
    }

    /// Cleanup ingress: remove local rows for leads the external source no
    /// longer lists, cascading to cached emails only when no other row for
    /// the same `(client, email)` remains. Dry-run reports only.
    pub async fn cleanup_campaigns(
        &self,
        client_filter: Option<&str>,
        dry_run: bool,
    ) -> Result<CleanupReport, SyncError> {
        let client_ids = match client_filter {
            Some(client_id) => vec![client_id.to_string()],
            None => self.store.clients_by_staleness().await?,
        };

        let mut campaigns = Vec::new();
        for client_id in &client_ids {
            for campaign_id in self.store.campaigns_for_client(client_id).await? {
                match self.cleanup_campaign(client_id, &campaign_id, dry_run).await {
                    Ok(report) => campaigns.push(report),
                    Err(err) => {
                        self.record_failure(Some(client_id.as_str()), &err, "cleanup_campaign")
                            .await;
                    }
                }
            }
        }
        Ok(CleanupReport { dry_run, campaigns })
    }

    async fn cleanup_campaign(
        &self,
        client_id: &str,
        campaign_id: &str,
        dry_run: bool,
    ) -> Result<CampaignCleanup, SyncError> {
        let external = self.fetch_all_leads(Some(campaign_id), None).await?;
        let membership: HashSet<String> = external
            .iter()
            .map(|lead| normalize_email(&lead.email))
            .collect();

        let local = self.store.leads_for_campaign(client_id, campaign_id).await?;
        let mut removed: Vec<String> = local
            .iter()
            .map(|lead| normalize_email(&lead.email))
            .filter(|email| !membership.contains(email))
            .collect();
        removed.sort();
        removed.dedup();
        let kept = local.len() - removed.len();

        let mut deleted_rows = 0u64;
        let mut deleted_emails = 0u64;
        if !dry_run && !removed.is_empty() {
            deleted_rows = self
                .store
                .delete_leads_by_email(client_id, campaign_id, &removed)
                .await?;
            deleted_emails = self
                .store
                .delete_orphaned_cached_emails(client_id, &removed)
                .await?;
        }

        Ok(CampaignCleanup {
            client_id: client_id.to_string(),
            campaign_id: campaign_id.to_string(),
            removed,
            kept,
            deleted_rows,
            deleted_emails,
        })
    }

    /// Destructive maintenance: wipe leads and the email cache. Both are
    /// re-derivable from the external source via backfill.
    pub async fn reset_all(&self) -> Result<(), SyncError> {
        self.store.reset_all().await?;
        Ok(())
    }

    /// Optional in-process cron for the bulk sync.
    pub async fn maybe_build_scheduler(
        self: &Arc<Self>,
    ) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let engine = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            Box::pin(async move {
                match engine.sync_all_clients().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        clients = summary.clients_synced,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(%err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn fetch_all_leads(
        &self,
        campaign_id: Option<&str>,
        interest_status: Option<i64>,
    ) -> Result<Vec<ExternalLead>, SyncError> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .source
                .list_leads(
                    campaign_id,
                    &LeadQuery {
                        limit: Some(self.config.page_limit),
                        starting_after: cursor.clone(),
                        search: None,
                        interest_status,
                    },
                )
                .await?;
            all.extend(page.items);
            match page.next_starting_after {
                Some(next) if !next.is_empty() => {
                    cursor = Some(next);
                    tokio::time::sleep(self.config.page_delay).await;
                }
                _ => break,
            }
        }
        Ok(all)
    }

    async fn record_failure(&self, client_id: Option<&str>, err: &SyncError, context: &str) {
        warn!(client = client_id.unwrap_or("-"), context, %err, "sync step failed");
        let details = serde_json::json!({
            "context": context,
            "error": err.to_string(),
        });
        if let Err(log_err) = self
            .store
            .log_sync_error(client_id, err.kind(), &err.to_string(), details)
            .await
        {
            warn!(%log_err, "writing to the sync error log failed");
        }
    }
}

/// Map one external lead into the canonical row shape. Email casing is
/// preserved on the row; matching always goes through `normalize_email`.
pub fn lead_record_from_external(
    client_id: &str,
    campaign_id: &str,
    lead: &ExternalLead,
    snapshot: Option<&ReplySnapshot>,
    now: DateTime<Utc>,
) -> LeadRecord {
    let email_derived = snapshot.and_then(|s| s.interest);
    let lead_derived = InterestStatus::from_raw(lead.lt_interest_status);
    LeadRecord {
        client_id: client_id.to_string(),
        external_lead_id: lead.id.clone(),
        campaign_id: campaign_id.to_string(),
        email: lead.email.clone(),
        first_name: extract_payload_field(&lead.payload, payload_keys::FIRST_NAME),
        last_name: extract_payload_field(&lead.payload, payload_keys::LAST_NAME),
        company_name: extract_payload_field(&lead.payload, payload_keys::COMPANY),
        job_title: extract_payload_field(&lead.payload, payload_keys::JOB_TITLE),
        industry: extract_payload_field(&lead.payload, payload_keys::INDUSTRY),
        company_size: extract_payload_field(&lead.payload, payload_keys::COMPANY_SIZE),
        linkedin_url: extract_payload_field(&lead.payload, payload_keys::LINKEDIN_URL),
        vacancy_url: extract_payload_field(&lead.payload, payload_keys::VACANCY_URL),
        lead_status: derive_lead_status(lead.email_reply_count, lead.status, lead.email_open_count),
        interest_status: merge_interest(email_derived, lead_derived),
        client_has_replied: false,
        opened_at: None,
        archived_at: None,
        is_excluded: false,
        reply_subject: snapshot.and_then(|s| s.subject.clone()),
        reply_content: snapshot.and_then(|s| s.content.clone()),
        last_synced_at: now,
        updated_at: now,
    }
}

/// Derive the cache row for one external email. Returns `None` when no
/// lead email can be attributed at all.
pub fn cached_email_from_external(client_id: &str, email: &ExternalEmail) -> Option<CachedEmail> {
    // The type code is authoritative; the legacy is_reply flag drifted
    // between API versions.
    let is_reply = email.ue_type == Some(2);
    let lead_email = email
        .lead
        .as_deref()
        .map(normalize_email)
        .or_else(|| {
            if is_reply {
                email.from_address_email.as_deref().map(normalize_email)
            } else {
                email.to_address_email.as_deref().map(normalize_email)
            }
        })
        .filter(|candidate| !candidate.is_empty())?;

    Some(CachedEmail {
        external_email_id: email.id.clone(),
        client_id: client_id.to_string(),
        lead_email,
        is_reply,
        from_address: email.from_address_email.clone(),
        to_address: email.to_address_email.clone(),
        subject: email.subject.clone(),
        body_html: email.body_html.clone(),
        body_text: email.body_text.clone(),
        sender_account: if is_reply { None } else { email.eaccount.clone() },
        i_status: email.i_status,
        email_timestamp: email.effective_timestamp().unwrap_or_else(Utc::now),
    })
}

/// Newly positive means freshly positive while the stored baseline (by
/// normalized email) was anything else, including never seen.
pub fn detect_new_positives(
    records: &[LeadRecord],
    baseline: &HashMap<String, Option<InterestStatus>>,
) -> Vec<LeadRecord> {
    records
        .iter()
        .filter(|record| {
            record.interest_status == Some(InterestStatus::Positive)
                && baseline
                    .get(&normalize_email(&record.email))
                    .copied()
                    .flatten()
                    != Some(InterestStatus::Positive)
        })
        .cloned()
        .collect()
}

fn full_name(lead: &LeadRecord) -> Option<String> {
    match (&lead.first_name, &lead.last_name) {
        (Some(first), Some(last)) => Some(format!("{first} {last}")),
        (Some(first), None) => Some(first.clone()),
        (None, Some(last)) => Some(last.clone()),
        (None, None) => None,
    }
}
