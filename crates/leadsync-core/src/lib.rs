//! Core domain model and the pure interest/reply classifier.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "leadsync-core";

/// Normalized tri-state interest classification. Absence is modelled as
/// `Option<InterestStatus>::None`, never as a fourth variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterestStatus {
    Positive,
    Neutral,
    Negative,
}

impl InterestStatus {
    /// Map a raw platform interest code: 1 is positive, 0 neutral, -1
    /// negative. Any other code (or no code at all) is absent.
    pub fn from_raw(raw: Option<i64>) -> Option<Self> {
        match raw {
            Some(1) => Some(Self::Positive),
            Some(0) => Some(Self::Neutral),
            Some(-1) => Some(Self::Negative),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }
}

/// Merge the email-derived and lead-derived interest signals.
///
/// The email-derived value is the baseline; the lead-derived value
/// overrides only when it is positive, or when it is neutral while the
/// baseline is negative. Positive is sticky once seen from either source;
/// negative can be downgraded to neutral but is never upgraded by silence.
/// The asymmetry is intentional, do not replace with a symmetric lattice.
pub fn merge_interest(
    email_derived: Option<InterestStatus>,
    lead_derived: Option<InterestStatus>,
) -> Option<InterestStatus> {
    match (email_derived, lead_derived) {
        (_, Some(InterestStatus::Positive)) => Some(InterestStatus::Positive),
        (Some(InterestStatus::Negative), Some(InterestStatus::Neutral)) => {
            Some(InterestStatus::Neutral)
        }
        (None, lead) => lead,
        (email, _) => email,
    }
}

/// Lead lifecycle status derived from the platform's send/open/reply
/// counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    NotYetEmailed,
    Emailed,
    Replied,
    Bounced,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotYetEmailed => "not_yet_emailed",
            Self::Emailed => "emailed",
            Self::Replied => "replied",
            Self::Bounced => "bounced",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "emailed" => Self::Emailed,
            "replied" => Self::Replied,
            "bounced" => Self::Bounced,
            _ => Self::NotYetEmailed,
        }
    }
}

/// Derive the lifecycle status from raw platform counters. `Bounced` is
/// never produced here; it only enters rows through downstream features.
pub fn derive_lead_status(reply_count: i64, status_code: i64, open_count: i64) -> LeadStatus {
    if reply_count > 0 {
        LeadStatus::Replied
    } else if status_code == 0 {
        LeadStatus::NotYetEmailed
    } else if open_count > 0 || status_code == 1 {
        LeadStatus::Emailed
    } else {
        LeadStatus::NotYetEmailed
    }
}

/// Canonical lead row, one per `(client_id, external_lead_id, campaign_id)`.
/// The same human lead may hold rows in several campaigns for one client;
/// readers deduplicate by email explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub client_id: String,
    pub external_lead_id: String,
    pub campaign_id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company_name: Option<String>,
    pub job_title: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub linkedin_url: Option<String>,
    pub vacancy_url: Option<String>,
    pub lead_status: LeadStatus,
    pub interest_status: Option<InterestStatus>,
    pub client_has_replied: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub is_excluded: bool,
    pub reply_subject: Option<String>,
    pub reply_content: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cached copy of one external email, keyed globally by the platform's
/// email id. The cache owns nothing: it may be wiped and re-populated from
/// the external source at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEmail {
    pub external_email_id: String,
    pub client_id: String,
    pub lead_email: String,
    pub is_reply: bool,
    pub from_address: Option<String>,
    pub to_address: Option<String>,
    pub subject: Option<String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub sender_account: Option<String>,
    pub i_status: Option<i64>,
    pub email_timestamp: DateTime<Utc>,
}

/// Most recent inbound reply observed for one lead email. `interest` is
/// the email-derived classifier signal, the baseline of `merge_interest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub subject: Option<String>,
    pub content: Option<String>,
    pub interest: Option<InterestStatus>,
    pub received_at: DateTime<Utc>,
}

/// Per-day campaign aggregate, one row per `(client, campaign, date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignDayStats {
    pub client_id: String,
    pub campaign_id: String,
    pub date: NaiveDate,
    pub sent: i64,
    pub contacted: i64,
    pub replies: i64,
    pub unique_replies: i64,
    pub bounced: i64,
    pub opened: i64,
    pub clicked: i64,
}

/// Join row resolving which client owns which external campaign. A
/// campaign may map to several clients; callers handle every pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCampaign {
    pub client_id: String,
    pub campaign_id: String,
}

/// Notification-relevant slice of a client account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client_id: String,
    pub notification_email: Option<String>,
    pub login_emails: Vec<String>,
    pub notifications_enabled: bool,
    pub is_recruitment: bool,
}

/// Durable error log classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    ApiFailure,
    SyncError,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiFailure => "api_failure",
            Self::SyncError => "sync_error",
        }
    }
}

/// Lowercased, trimmed email used wherever leads are matched across
/// campaigns or sources. Row storage keeps the original casing.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// First non-empty trimmed value found in `payload` by case-insensitive
/// match over an ordered list of candidate key spellings.
pub fn extract_payload_field(
    payload: &JsonMap<String, JsonValue>,
    variants: &[&str],
) -> Option<String> {
    for variant in variants {
        for (key, value) in payload {
            if !key.eq_ignore_ascii_case(variant) {
                continue;
            }
            if let Some(text) = value.as_str() {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

/// Candidate key spellings for the free-form payload fields. The external
/// platform's custom-field schema is client-defined, so English and Dutch
/// variants both occur in production data.
pub mod payload_keys {
    pub const FIRST_NAME: &[&str] = &["first_name", "firstName", "First Name", "voornaam"];
    pub const LAST_NAME: &[&str] = &["last_name", "lastName", "Last Name", "achternaam"];
    pub const COMPANY: &[&str] = &["company_name", "companyName", "Company", "company", "bedrijf"];
    pub const JOB_TITLE: &[&str] = &[
        "Job Title",
        "job_title",
        "jobTitle",
        "title",
        "functie",
        "functietitel",
    ];
    pub const INDUSTRY: &[&str] = &["Industry", "industry", "branche", "sector"];
    pub const COMPANY_SIZE: &[&str] = &[
        "Company Size",
        "company_size",
        "companySize",
        "employees",
        "bedrijfsgrootte",
    ];
    pub const LINKEDIN_URL: &[&str] = &[
        "LinkedIn URL",
        "linkedin_url",
        "linkedinUrl",
        "linkedin",
        "LinkedIn",
    ];
    pub const VACANCY_URL: &[&str] = &[
        "Vacancy URL",
        "vacancy_url",
        "vacancyUrl",
        "vacature",
        "vacature_url",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(entries: &[(&str, &str)]) -> JsonMap<String, JsonValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn raw_interest_codes_map_to_tri_state() {
        assert_eq!(
            InterestStatus::from_raw(Some(1)),
            Some(InterestStatus::Positive)
        );
        assert_eq!(
            InterestStatus::from_raw(Some(0)),
            Some(InterestStatus::Neutral)
        );
        assert_eq!(
            InterestStatus::from_raw(Some(-1)),
            Some(InterestStatus::Negative)
        );
        assert_eq!(InterestStatus::from_raw(Some(7)), None);
        assert_eq!(InterestStatus::from_raw(None), None);
    }

    #[test]
    fn positive_wins_from_either_source() {
        use InterestStatus::*;
        for other in [Some(Positive), Some(Neutral), Some(Negative), None] {
            assert_eq!(merge_interest(Some(Positive), other), Some(Positive));
            assert_eq!(merge_interest(other, Some(Positive)), Some(Positive));
        }
    }

    #[test]
    fn lead_neutral_downgrades_negative_baseline() {
        use InterestStatus::*;
        assert_eq!(merge_interest(Some(Negative), Some(Neutral)), Some(Neutral));
        // The reverse direction keeps the baseline.
        assert_eq!(merge_interest(Some(Neutral), Some(Negative)), Some(Neutral));
    }

    #[test]
    fn silence_never_upgrades() {
        use InterestStatus::*;
        assert_eq!(merge_interest(Some(Negative), None), Some(Negative));
        assert_eq!(merge_interest(None, Some(Negative)), Some(Negative));
        assert_eq!(merge_interest(None, None), None);
        assert_eq!(merge_interest(Some(Neutral), None), Some(Neutral));
    }

    #[test]
    fn lead_status_derivation_priorities() {
        assert_eq!(derive_lead_status(2, 1, 5), LeadStatus::Replied);
        assert_eq!(derive_lead_status(0, 0, 5), LeadStatus::NotYetEmailed);
        assert_eq!(derive_lead_status(0, 1, 0), LeadStatus::Emailed);
        assert_eq!(derive_lead_status(0, 3, 2), LeadStatus::Emailed);
        assert_eq!(derive_lead_status(0, 3, 0), LeadStatus::NotYetEmailed);
    }

    #[test]
    fn extraction_is_case_insensitive_first_match_wins() {
        let payload = payload(&[("Job Title", "CEO"), ("job_title", "ignored")]);
        assert_eq!(
            extract_payload_field(&payload, &["Job Title", "job_title"]),
            Some("CEO".to_string())
        );
        // Variant order decides, not payload order.
        assert_eq!(
            extract_payload_field(&payload, &["job_title", "Job Title"]),
            Some("ignored".to_string())
        );
    }

    #[test]
    fn extraction_skips_empty_and_non_string_values() {
        let mut map = payload(&[("industry", "  ")]);
        map.insert("Industry".to_string(), json!(42));
        map.insert("branche".to_string(), json!("SaaS "));
        assert_eq!(
            extract_payload_field(&map, payload_keys::INDUSTRY),
            Some("SaaS".to_string())
        );
        assert_eq!(extract_payload_field(&map, &["missing"]), None);
    }

    #[test]
    fn email_normalization_lowercases_and_trims() {
        assert_eq!(normalize_email(" A@X.com "), "a@x.com");
    }
}
