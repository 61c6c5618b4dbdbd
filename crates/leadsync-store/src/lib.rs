//! Relational store behind the `LeadStore` trait: batched idempotent
//! upserts, baseline lookups, the client/campaign mapping, analytics rows,
//! and the durable sync error log. Postgres (sqlx) for production, an
//! in-memory implementation for tests and local development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use leadsync_core::{
    normalize_email, CachedEmail, CampaignDayStats, ClientCampaign, ClientProfile, InterestStatus,
    LeadRecord, LeadStatus, ReplySnapshot, SyncErrorKind,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "leadsync-store";

/// Leads are upserted in batches of this many rows.
pub const LEAD_UPSERT_BATCH: usize = 500;

/// Baseline interest lookups are chunked to respect query-size limits.
pub const BASELINE_LOOKUP_CHUNK: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One durable error log row.
#[derive(Debug, Clone)]
pub struct LoggedSyncError {
    pub client_id: Option<String>,
    pub kind: SyncErrorKind,
    pub message: String,
    pub details: JsonValue,
}

/// The persistence seam of the sync engine. Every mutation is an
/// idempotent upsert so any pass can be safely re-run after partial
/// failure; overlapping runs interleave as last-writer-wins because every
/// write recomputes the same external truth.
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Upsert one batch keyed by `(client_id, external_lead_id,
    /// campaign_id)`. Returns the number of rows written.
    async fn upsert_leads(&self, leads: &[LeadRecord]) -> Result<usize, StoreError>;

    /// Stored interest per normalized email for one client. Absent keys
    /// mean the lead has never been seen.
    async fn interest_baseline(
        &self,
        client_id: &str,
        emails: &[String],
    ) -> Result<HashMap<String, Option<InterestStatus>>, StoreError>;

    async fn leads_for_campaign(
        &self,
        client_id: &str,
        campaign_id: &str,
    ) -> Result<Vec<LeadRecord>, StoreError>;

    /// Reader-side contact list: one logical contact per email, the
    /// most-recently-updated row winning across campaigns.
    async fn contacts_for_client(&self, client_id: &str) -> Result<Vec<LeadRecord>, StoreError>;

    /// Delete rows for one campaign whose email (matched case-insensitively)
    /// is in `emails`. Returns the number of deleted rows.
    async fn delete_leads_by_email(
        &self,
        client_id: &str,
        campaign_id: &str,
        emails: &[String],
    ) -> Result<u64, StoreError>;

    async fn upsert_cached_emails(&self, emails: &[CachedEmail]) -> Result<usize, StoreError>;

    /// Latest inbound reply per normalized lead email, by event timestamp.
    async fn latest_reply_snapshots(
        &self,
        client_id: &str,
        lead_emails: &[String],
    ) -> Result<HashMap<String, ReplySnapshot>, StoreError>;

    /// Drop cached emails for the given lead emails, but only where no lead
    /// row for the same `(client, email)` remains.
    async fn delete_orphaned_cached_emails(
        &self,
        client_id: &str,
        emails: &[String],
    ) -> Result<u64, StoreError>;

    async fn campaigns_for_client(&self, client_id: &str) -> Result<Vec<String>, StoreError>;

    async fn clients_for_campaign(&self, campaign_id: &str) -> Result<Vec<String>, StoreError>;

    /// Distinct clients with at least one campaign, least-recently-synced
    /// first. Never-synced clients sort first via an empty-string sentinel;
    /// this ordering is the batch job's resumption mechanism.
    async fn clients_by_staleness(&self) -> Result<Vec<String>, StoreError>;

    async fn upsert_campaign_analytics(
        &self,
        rows: &[CampaignDayStats],
    ) -> Result<usize, StoreError>;

    async fn client_profile(&self, client_id: &str)
        -> Result<Option<ClientProfile>, StoreError>;

    async fn log_sync_error(
        &self,
        client_id: Option<&str>,
        kind: SyncErrorKind,
        message: &str,
        details: JsonValue,
    ) -> Result<(), StoreError>;

    /// Destructive: wipes leads and cached emails. Both are re-derivable
    /// from the external source.
    async fn reset_all(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn lead_from_row(row: &PgRow) -> Result<LeadRecord, sqlx::Error> {
    let interest: Option<String> = row.try_get("interest_status")?;
    let status: String = row.try_get("lead_status")?;
    Ok(LeadRecord {
        client_id: row.try_get("client_id")?,
        external_lead_id: row.try_get("external_lead_id")?,
        campaign_id: row.try_get("campaign_id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        company_name: row.try_get("company_name")?,
        job_title: row.try_get("job_title")?,
        industry: row.try_get("industry")?,
        company_size: row.try_get("company_size")?,
        linkedin_url: row.try_get("linkedin_url")?,
        vacancy_url: row.try_get("vacancy_url")?,
        lead_status: LeadStatus::parse(&status),
        interest_status: interest.as_deref().and_then(InterestStatus::parse),
        client_has_replied: row.try_get("client_has_replied")?,
        opened_at: row.try_get("opened_at")?,
        archived_at: row.try_get("archived_at")?,
        is_excluded: row.try_get("is_excluded")?,
        reply_subject: row.try_get("reply_subject")?,
        reply_content: row.try_get("reply_content")?,
        last_synced_at: row.try_get("last_synced_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn upsert_leads(&self, leads: &[LeadRecord]) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for lead in leads {
            sqlx::query(
                r#"
                INSERT INTO leads (
                    client_id, external_lead_id, campaign_id, email,
                    first_name, last_name, company_name, job_title, industry,
                    company_size, linkedin_url, vacancy_url, lead_status,
                    interest_status, client_has_replied, opened_at,
                    archived_at, is_excluded, reply_subject, reply_content,
                    last_synced_at, updated_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20, $21, $22
                )
                ON CONFLICT (client_id, external_lead_id, campaign_id)
                DO UPDATE SET
                    email = EXCLUDED.email,
                    first_name = EXCLUDED.first_name,
                    last_name = EXCLUDED.last_name,
                    company_name = EXCLUDED.company_name,
                    job_title = EXCLUDED.job_title,
                    industry = EXCLUDED.industry,
                    company_size = EXCLUDED.company_size,
                    linkedin_url = EXCLUDED.linkedin_url,
                    vacancy_url = EXCLUDED.vacancy_url,
                    lead_status = EXCLUDED.lead_status,
                    interest_status = EXCLUDED.interest_status,
                    reply_subject = COALESCE(EXCLUDED.reply_subject, leads.reply_subject),
                    reply_content = COALESCE(EXCLUDED.reply_content, leads.reply_content),
                    client_has_replied = CASE
                        WHEN EXCLUDED.reply_content IS NOT NULL
                         AND EXCLUDED.reply_content IS DISTINCT FROM leads.reply_content
                        THEN FALSE
                        ELSE leads.client_has_replied
                    END,
                    last_synced_at = EXCLUDED.last_synced_at,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&lead.client_id)
            .bind(&lead.external_lead_id)
            .bind(&lead.campaign_id)
            .bind(&lead.email)
            .bind(&lead.first_name)
            .bind(&lead.last_name)
            .bind(&lead.company_name)
            .bind(&lead.job_title)
            .bind(&lead.industry)
            .bind(&lead.company_size)
            .bind(&lead.linkedin_url)
            .bind(&lead.vacancy_url)
            .bind(lead.lead_status.as_str())
            .bind(lead.interest_status.map(|s| s.as_str()))
            .bind(lead.client_has_replied)
            .bind(lead.opened_at)
            .bind(lead.archived_at)
            .bind(lead.is_excluded)
            .bind(&lead.reply_subject)
            .bind(&lead.reply_content)
            .bind(lead.last_synced_at)
            .bind(lead.updated_at)
            .execute(&self.pool)
            .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn interest_baseline(
        &self,
        client_id: &str,
        emails: &[String],
    ) -> Result<HashMap<String, Option<InterestStatus>>, StoreError> {
        let mut baseline = HashMap::new();
        let normalized: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();
        for chunk in normalized.chunks(BASELINE_LOOKUP_CHUNK) {
            let rows = sqlx::query(
                r#"
                SELECT lower(email) AS email, interest_status
                  FROM leads
                 WHERE client_id = $1
                   AND lower(email) = ANY($2)
                "#,
            )
            .bind(client_id)
            .bind(chunk)
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                let email: String = row.try_get("email")?;
                let interest: Option<String> = row.try_get("interest_status")?;
                baseline.insert(email, interest.as_deref().and_then(InterestStatus::parse));
            }
        }
        Ok(baseline)
    }

    async fn leads_for_campaign(
        &self,
        client_id: &str,
        campaign_id: &str,
    ) -> Result<Vec<LeadRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
              FROM leads
             WHERE client_id = $1
               AND campaign_id = $2
             ORDER BY lower(email)
            "#,
        )
        .bind(client_id)
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| lead_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn contacts_for_client(&self, client_id: &str) -> Result<Vec<LeadRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (lower(email)) *
              FROM leads
             WHERE client_id = $1
             ORDER BY lower(email), updated_at DESC
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| lead_from_row(row).map_err(StoreError::from))
            .collect()
    }

    async fn delete_leads_by_email(
        &self,
        client_id: &str,
        campaign_id: &str,
        emails: &[String],
    ) -> Result<u64, StoreError> {
        let normalized: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM leads
             WHERE client_id = $1
               AND campaign_id = $2
               AND lower(email) = ANY($3)
            "#,
        )
        .bind(client_id)
        .bind(campaign_id)
        .bind(&normalized)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_cached_emails(&self, emails: &[CachedEmail]) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for email in emails {
            sqlx::query(
                r#"
                INSERT INTO cached_emails (
                    external_email_id, client_id, lead_email, is_reply,
                    from_address, to_address, subject, body_html, body_text,
                    sender_account, i_status, email_timestamp
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (external_email_id)
                DO UPDATE SET
                    client_id = EXCLUDED.client_id,
                    lead_email = EXCLUDED.lead_email,
                    is_reply = EXCLUDED.is_reply,
                    from_address = EXCLUDED.from_address,
                    to_address = EXCLUDED.to_address,
                    subject = EXCLUDED.subject,
                    body_html = EXCLUDED.body_html,
                    body_text = EXCLUDED.body_text,
                    sender_account = EXCLUDED.sender_account,
                    i_status = EXCLUDED.i_status,
                    email_timestamp = EXCLUDED.email_timestamp
                "#,
            )
            .bind(&email.external_email_id)
            .bind(&email.client_id)
            .bind(&email.lead_email)
            .bind(email.is_reply)
            .bind(&email.from_address)
            .bind(&email.to_address)
            .bind(&email.subject)
            .bind(&email.body_html)
            .bind(&email.body_text)
            .bind(&email.sender_account)
            .bind(email.i_status)
            .bind(email.email_timestamp)
            .execute(&self.pool)
            .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn latest_reply_snapshots(
        &self,
        client_id: &str,
        lead_emails: &[String],
    ) -> Result<HashMap<String, ReplySnapshot>, StoreError> {
        let normalized: Vec<String> = lead_emails.iter().map(|e| normalize_email(e)).collect();
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (lead_email)
                   lead_email, subject, body_html, body_text, i_status,
                   email_timestamp
              FROM cached_emails
             WHERE client_id = $1
               AND is_reply
               AND lead_email = ANY($2)
             ORDER BY lead_email, email_timestamp DESC
            "#,
        )
        .bind(client_id)
        .bind(&normalized)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = HashMap::with_capacity(rows.len());
        for row in rows {
            let lead_email: String = row.try_get("lead_email")?;
            let body_html: Option<String> = row.try_get("body_html")?;
            let body_text: Option<String> = row.try_get("body_text")?;
            let i_status: Option<i64> = row.try_get("i_status")?;
            snapshots.insert(
                lead_email,
                ReplySnapshot {
                    subject: row.try_get("subject")?,
                    content: body_html.or(body_text),
                    interest: InterestStatus::from_raw(i_status),
                    received_at: row.try_get("email_timestamp")?,
                },
            );
        }
        Ok(snapshots)
    }

    async fn delete_orphaned_cached_emails(
        &self,
        client_id: &str,
        emails: &[String],
    ) -> Result<u64, StoreError> {
        let normalized: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();
        let result = sqlx::query(
            r#"
            DELETE FROM cached_emails ce
             WHERE ce.client_id = $1
               AND ce.lead_email = ANY($2)
               AND NOT EXISTS (
                   SELECT 1 FROM leads l
                    WHERE l.client_id = ce.client_id
                      AND lower(l.email) = ce.lead_email
               )
            "#,
        )
        .bind(client_id)
        .bind(&normalized)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn campaigns_for_client(&self, client_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT campaign_id
              FROM client_campaigns
             WHERE client_id = $1
             ORDER BY campaign_id
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("campaign_id").map_err(StoreError::from))
            .collect()
    }

    async fn clients_for_campaign(&self, campaign_id: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT client_id
              FROM client_campaigns
             WHERE campaign_id = $1
             ORDER BY client_id
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("client_id").map_err(StoreError::from))
            .collect()
    }

    async fn clients_by_staleness(&self) -> Result<Vec<String>, StoreError> {
        // Never-synced clients get the empty-string sentinel so they sort
        // first; the text cast keeps that sentinel comparable.
        let rows = sqlx::query(
            r#"
            SELECT cc.client_id
              FROM client_campaigns cc
              LEFT JOIN leads l ON l.client_id = cc.client_id
             GROUP BY cc.client_id
             ORDER BY COALESCE(MAX(l.last_synced_at)::text, '') ASC, cc.client_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("client_id").map_err(StoreError::from))
            .collect()
    }

    async fn upsert_campaign_analytics(
        &self,
        rows: &[CampaignDayStats],
    ) -> Result<usize, StoreError> {
        let mut written = 0usize;
        for stats in rows {
            sqlx::query(
                r#"
                INSERT INTO campaign_daily_analytics (
                    client_id, campaign_id, date, sent, contacted, replies,
                    unique_replies, bounced, opened, clicked
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (client_id, campaign_id, date)
                DO UPDATE SET
                    sent = EXCLUDED.sent,
                    contacted = EXCLUDED.contacted,
                    replies = EXCLUDED.replies,
                    unique_replies = EXCLUDED.unique_replies,
                    bounced = EXCLUDED.bounced,
                    opened = EXCLUDED.opened,
                    clicked = EXCLUDED.clicked
                "#,
            )
            .bind(&stats.client_id)
            .bind(&stats.campaign_id)
            .bind(stats.date)
            .bind(stats.sent)
            .bind(stats.contacted)
            .bind(stats.replies)
            .bind(stats.unique_replies)
            .bind(stats.bounced)
            .bind(stats.opened)
            .bind(stats.clicked)
            .execute(&self.pool)
            .await?;
            written += 1;
        }
        Ok(written)
    }

    async fn client_profile(
        &self,
        client_id: &str,
    ) -> Result<Option<ClientProfile>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT client_id, notification_email, login_emails,
                   notifications_enabled, is_recruitment
              FROM clients
             WHERE client_id = $1
            "#,
        )
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(ClientProfile {
                client_id: row.try_get("client_id")?,
                notification_email: row.try_get("notification_email")?,
                login_emails: row.try_get("login_emails")?,
                notifications_enabled: row.try_get("notifications_enabled")?,
                is_recruitment: row.try_get("is_recruitment")?,
            })),
            None => Ok(None),
        }
    }

    async fn log_sync_error(
        &self,
        client_id: Option<&str>,
        kind: SyncErrorKind,
        message: &str,
        details: JsonValue,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_errors (client_id, kind, message, details)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(client_id)
        .bind(kind.as_str())
        .bind(message)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cached_emails")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM leads").execute(&self.pool).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests and local development)
// ---------------------------------------------------------------------------

type LeadKey = (String, String, String);

#[derive(Debug, Default)]
struct MemoryState {
    leads: BTreeMap<LeadKey, LeadRecord>,
    cached_emails: BTreeMap<String, CachedEmail>,
    mappings: Vec<ClientCampaign>,
    profiles: HashMap<String, ClientProfile>,
    analytics: BTreeMap<(String, String, NaiveDate), CampaignDayStats>,
    errors: Vec<LoggedSyncError>,
    fail_baseline: bool,
}

/// `LeadStore` over process memory. Mirrors the Postgres semantics exactly
/// so engine and handler tests exercise the real reconciliation paths.
#[derive(Debug, Default)]
pub struct MemoryLeadStore {
    state: Mutex<MemoryState>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_mapping(&self, client_id: &str, campaign_id: &str) {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.mappings.push(ClientCampaign {
            client_id: client_id.to_string(),
            campaign_id: campaign_id.to_string(),
        });
    }

    pub fn seed_profile(&self, profile: ClientProfile) {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.profiles.insert(profile.client_id.clone(), profile);
    }

    /// Makes the next baseline lookups fail, for exercising the
    /// detection-suppression path.
    pub fn fail_baseline_lookups(&self, fail: bool) {
        self.state.lock().expect("memory store poisoned").fail_baseline = fail;
    }

    pub fn logged_errors(&self) -> Vec<LoggedSyncError> {
        self.state.lock().expect("memory store poisoned").errors.clone()
    }

    pub fn lead(
        &self,
        client_id: &str,
        external_lead_id: &str,
        campaign_id: &str,
    ) -> Option<LeadRecord> {
        self.state
            .lock()
            .expect("memory store poisoned")
            .leads
            .get(&(
                client_id.to_string(),
                external_lead_id.to_string(),
                campaign_id.to_string(),
            ))
            .cloned()
    }

    pub fn lead_count(&self) -> usize {
        self.state.lock().expect("memory store poisoned").leads.len()
    }

    pub fn cached_email(&self, external_email_id: &str) -> Option<CachedEmail> {
        self.state
            .lock()
            .expect("memory store poisoned")
            .cached_emails
            .get(external_email_id)
            .cloned()
    }

    pub fn cached_email_count(&self) -> usize {
        self.state
            .lock()
            .expect("memory store poisoned")
            .cached_emails
            .len()
    }

    pub fn analytics_count(&self) -> usize {
        self.state
            .lock()
            .expect("memory store poisoned")
            .analytics
            .len()
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn upsert_leads(&self, leads: &[LeadRecord]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        for lead in leads {
            let key = (
                lead.client_id.clone(),
                lead.external_lead_id.clone(),
                lead.campaign_id.clone(),
            );
            let mut incoming = lead.clone();
            if let Some(existing) = state.leads.get(&key) {
                // A fresh lead reply clears the client-replied marker so the
                // inbox resurfaces the thread; everything else the sync does
                // not own is carried over from the existing row.
                let fresh_reply = incoming.reply_content.is_some()
                    && incoming.reply_content != existing.reply_content;
                if incoming.reply_subject.is_none() {
                    incoming.reply_subject = existing.reply_subject.clone();
                }
                if incoming.reply_content.is_none() {
                    incoming.reply_content = existing.reply_content.clone();
                }
                incoming.client_has_replied = if fresh_reply {
                    false
                } else {
                    existing.client_has_replied
                };
                incoming.opened_at = existing.opened_at;
                incoming.archived_at = existing.archived_at;
                incoming.is_excluded = existing.is_excluded;
            }
            state.leads.insert(key, incoming);
        }
        Ok(leads.len())
    }

    async fn interest_baseline(
        &self,
        client_id: &str,
        emails: &[String],
    ) -> Result<HashMap<String, Option<InterestStatus>>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        if state.fail_baseline {
            return Err(StoreError::Unavailable(
                "baseline lookup failed (induced)".to_string(),
            ));
        }
        let wanted: HashSet<String> = emails.iter().map(|e| normalize_email(e)).collect();
        let mut baseline = HashMap::new();
        for lead in state.leads.values() {
            if lead.client_id != client_id {
                continue;
            }
            let email = normalize_email(&lead.email);
            if wanted.contains(&email) {
                baseline.insert(email, lead.interest_status);
            }
        }
        Ok(baseline)
    }

    async fn leads_for_campaign(
        &self,
        client_id: &str,
        campaign_id: &str,
    ) -> Result<Vec<LeadRecord>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        Ok(state
            .leads
            .values()
            .filter(|l| l.client_id == client_id && l.campaign_id == campaign_id)
            .cloned()
            .collect())
    }

    async fn contacts_for_client(&self, client_id: &str) -> Result<Vec<LeadRecord>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        let mut best: BTreeMap<String, LeadRecord> = BTreeMap::new();
        for lead in state.leads.values() {
            if lead.client_id != client_id {
                continue;
            }
            let email = normalize_email(&lead.email);
            match best.get(&email) {
                Some(existing) if existing.updated_at >= lead.updated_at => {}
                _ => {
                    best.insert(email, lead.clone());
                }
            }
        }
        Ok(best.into_values().collect())
    }

    async fn delete_leads_by_email(
        &self,
        client_id: &str,
        campaign_id: &str,
        emails: &[String],
    ) -> Result<u64, StoreError> {
        let doomed: HashSet<String> = emails.iter().map(|e| normalize_email(e)).collect();
        let mut state = self.state.lock().expect("memory store poisoned");
        let before = state.leads.len();
        state.leads.retain(|_, lead| {
            !(lead.client_id == client_id
                && lead.campaign_id == campaign_id
                && doomed.contains(&normalize_email(&lead.email)))
        });
        Ok((before - state.leads.len()) as u64)
    }

    async fn upsert_cached_emails(&self, emails: &[CachedEmail]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        for email in emails {
            state
                .cached_emails
                .insert(email.external_email_id.clone(), email.clone());
        }
        Ok(emails.len())
    }

    async fn latest_reply_snapshots(
        &self,
        client_id: &str,
        lead_emails: &[String],
    ) -> Result<HashMap<String, ReplySnapshot>, StoreError> {
        let wanted: HashSet<String> = lead_emails.iter().map(|e| normalize_email(e)).collect();
        let state = self.state.lock().expect("memory store poisoned");
        let mut snapshots: HashMap<String, ReplySnapshot> = HashMap::new();
        for email in state.cached_emails.values() {
            if email.client_id != client_id
                || !email.is_reply
                || !wanted.contains(&email.lead_email)
            {
                continue;
            }
            let candidate = ReplySnapshot {
                subject: email.subject.clone(),
                content: email.body_html.clone().or_else(|| email.body_text.clone()),
                interest: InterestStatus::from_raw(email.i_status),
                received_at: email.email_timestamp,
            };
            match snapshots.get(&email.lead_email) {
                Some(existing) if existing.received_at >= candidate.received_at => {}
                _ => {
                    snapshots.insert(email.lead_email.clone(), candidate);
                }
            }
        }
        Ok(snapshots)
    }

    async fn delete_orphaned_cached_emails(
        &self,
        client_id: &str,
        emails: &[String],
    ) -> Result<u64, StoreError> {
        let wanted: HashSet<String> = emails.iter().map(|e| normalize_email(e)).collect();
        let mut state = self.state.lock().expect("memory store poisoned");
        let still_referenced: HashSet<String> = state
            .leads
            .values()
            .filter(|l| l.client_id == client_id)
            .map(|l| normalize_email(&l.email))
            .collect();
        let before = state.cached_emails.len();
        state.cached_emails.retain(|_, email| {
            !(email.client_id == client_id
                && wanted.contains(&email.lead_email)
                && !still_referenced.contains(&email.lead_email))
        });
        Ok((before - state.cached_emails.len()) as u64)
    }

    async fn campaigns_for_client(&self, client_id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        let mut campaigns: Vec<String> = state
            .mappings
            .iter()
            .filter(|m| m.client_id == client_id)
            .map(|m| m.campaign_id.clone())
            .collect();
        campaigns.sort();
        campaigns.dedup();
        Ok(campaigns)
    }

    async fn clients_for_campaign(&self, campaign_id: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        let mut clients: Vec<String> = state
            .mappings
            .iter()
            .filter(|m| m.campaign_id == campaign_id)
            .map(|m| m.client_id.clone())
            .collect();
        clients.sort();
        clients.dedup();
        Ok(clients)
    }

    async fn clients_by_staleness(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        let mut clients: Vec<String> = state
            .mappings
            .iter()
            .map(|m| m.client_id.clone())
            .collect();
        clients.sort();
        clients.dedup();
        // Empty-string sentinel for never-synced clients, matching the SQL.
        let mut keyed: Vec<(String, String)> = clients
            .into_iter()
            .map(|client_id| {
                let last = state
                    .leads
                    .values()
                    .filter(|l| l.client_id == client_id)
                    .map(|l| l.last_synced_at.to_rfc3339())
                    .max()
                    .unwrap_or_default();
                (last, client_id)
            })
            .collect();
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, client_id)| client_id).collect())
    }

    async fn upsert_campaign_analytics(
        &self,
        rows: &[CampaignDayStats],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        for stats in rows {
            state.analytics.insert(
                (
                    stats.client_id.clone(),
                    stats.campaign_id.clone(),
                    stats.date,
                ),
                stats.clone(),
            );
        }
        Ok(rows.len())
    }

    async fn client_profile(
        &self,
        client_id: &str,
    ) -> Result<Option<ClientProfile>, StoreError> {
        let state = self.state.lock().expect("memory store poisoned");
        Ok(state.profiles.get(client_id).cloned())
    }

    async fn log_sync_error(
        &self,
        client_id: Option<&str>,
        kind: SyncErrorKind,
        message: &str,
        details: JsonValue,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.errors.push(LoggedSyncError {
            client_id: client_id.map(ToString::to_string),
            kind,
            message: message.to_string(),
            details,
        });
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.leads.clear();
        state.cached_emails.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn lead(client: &str, id: &str, campaign: &str, email: &str) -> LeadRecord {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        LeadRecord {
            client_id: client.to_string(),
            external_lead_id: id.to_string(),
            campaign_id: campaign.to_string(),
            email: email.to_string(),
            first_name: None,
            last_name: None,
            company_name: None,
            job_title: None,
            industry: None,
            company_size: None,
            linkedin_url: None,
            vacancy_url: None,
            lead_status: LeadStatus::Emailed,
            interest_status: None,
            client_has_replied: false,
            opened_at: None,
            archived_at: None,
            is_excluded: false,
            reply_subject: None,
            reply_content: None,
            last_synced_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_the_triple_key() {
        let store = MemoryLeadStore::new();
        let rows = vec![
            lead("k1", "l1", "c1", "a@x.com"),
            lead("k1", "l1", "c1", "a@x.com"),
        ];
        store.upsert_leads(&rows).await.unwrap();
        store.upsert_leads(&rows).await.unwrap();
        assert_eq!(store.lead_count(), 1);
    }

    #[tokio::test]
    async fn upsert_preserves_reply_snapshot_and_inbox_flags() {
        let store = MemoryLeadStore::new();
        let mut first = lead("k1", "l1", "c1", "a@x.com");
        first.reply_subject = Some("Re: intro".to_string());
        first.client_has_replied = true;
        store.upsert_leads(&[first]).await.unwrap();

        // A later pass without reply data must not erase the snapshot.
        store
            .upsert_leads(&[lead("k1", "l1", "c1", "a@x.com")])
            .await
            .unwrap();
        let stored = store.lead("k1", "l1", "c1").unwrap();
        assert_eq!(stored.reply_subject.as_deref(), Some("Re: intro"));
        assert!(stored.client_has_replied);
    }

    #[tokio::test]
    async fn contacts_reduce_to_one_row_per_email() {
        let store = MemoryLeadStore::new();
        let mut older = lead("k1", "l1", "c1", "A@X.com");
        older.job_title = Some("CFO".to_string());
        let mut newer = lead("k1", "l2", "c2", "a@x.com");
        newer.job_title = Some("CEO".to_string());
        newer.updated_at = older.updated_at + chrono::Duration::hours(1);
        store.upsert_leads(&[older, newer]).await.unwrap();

        let contacts = store.contacts_for_client("k1").await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].job_title.as_deref(), Some("CEO"));
    }

    #[tokio::test]
    async fn baseline_contains_only_seen_leads() {
        let store = MemoryLeadStore::new();
        let mut seen = lead("k1", "l1", "c1", "A@X.com");
        seen.interest_status = Some(InterestStatus::Neutral);
        store.upsert_leads(&[seen]).await.unwrap();

        let baseline = store
            .interest_baseline("k1", &["a@x.com".to_string(), "new@x.com".to_string()])
            .await
            .unwrap();
        assert_eq!(baseline.get("a@x.com"), Some(&Some(InterestStatus::Neutral)));
        assert!(!baseline.contains_key("new@x.com"));
    }

    #[tokio::test]
    async fn staleness_ordering_puts_never_synced_first() {
        let store = MemoryLeadStore::new();
        store.seed_mapping("k-old", "c1");
        store.seed_mapping("k-new", "c2");
        store.seed_mapping("k-never", "c3");

        let mut older = lead("k-old", "l1", "c1", "a@x.com");
        older.last_synced_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        let mut newer = lead("k-new", "l2", "c2", "b@x.com");
        newer.last_synced_at = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).single().unwrap();
        store.upsert_leads(&[older, newer]).await.unwrap();

        let order = store.clients_by_staleness().await.unwrap();
        assert_eq!(order, vec!["k-never", "k-old", "k-new"]);
    }

    #[tokio::test]
    async fn orphaned_cached_emails_cascade_only_without_remaining_rows() {
        let store = MemoryLeadStore::new();
        store
            .upsert_leads(&[lead("k1", "l1", "c1", "keep@x.com")])
            .await
            .unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let email = |id: &str, lead_email: &str| CachedEmail {
            external_email_id: id.to_string(),
            client_id: "k1".to_string(),
            lead_email: lead_email.to_string(),
            is_reply: true,
            from_address: None,
            to_address: None,
            subject: None,
            body_html: None,
            body_text: None,
            sender_account: None,
            i_status: None,
            email_timestamp: now,
        };
        store
            .upsert_cached_emails(&[email("e1", "keep@x.com"), email("e2", "gone@x.com")])
            .await
            .unwrap();

        let removed = store
            .delete_orphaned_cached_emails(
                "k1",
                &["keep@x.com".to_string(), "gone@x.com".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.cached_email_count(), 1);
    }

    #[tokio::test]
    async fn latest_reply_snapshot_picks_newest_by_timestamp() {
        let store = MemoryLeadStore::new();
        let at = |h: u32| Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap();
        let email = |id: &str, hour: u32, subject: &str| CachedEmail {
            external_email_id: id.to_string(),
            client_id: "k1".to_string(),
            lead_email: "a@x.com".to_string(),
            is_reply: true,
            from_address: Some("a@x.com".to_string()),
            to_address: None,
            subject: Some(subject.to_string()),
            body_html: None,
            body_text: Some("body".to_string()),
            sender_account: None,
            i_status: Some(1),
            email_timestamp: at(hour),
        };
        store
            .upsert_cached_emails(&[
                email("e1", 9, "first"),
                email("e2", 11, "latest"),
                email("e3", 10, "middle"),
            ])
            .await
            .unwrap();

        let snapshots = store
            .latest_reply_snapshots("k1", &["a@x.com".to_string()])
            .await
            .unwrap();
        assert_eq!(
            snapshots.get("a@x.com").and_then(|s| s.subject.as_deref()),
            Some("latest")
        );
    }
}
