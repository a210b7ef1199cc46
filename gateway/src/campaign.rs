use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Campaign id that acts as a tenant's fallback when no rule-based match
/// scores positively.
pub const DEFAULT_CAMPAIGN_ID: &str = "default";

/// A named routing policy owned by a tenant.
///
/// `(tenant_id, campaign_id)` is unique; only `active` campaigns are eligible
/// for matching.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Campaign {
    pub tenant_id: String,
    pub campaign_id: String,
    pub name: String,
    pub status: CampaignStatus,
    #[serde(default)]
    pub rules: Vec<Rule>,
    pub destination_url: String,
    #[serde(default)]
    pub append_params: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Active
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Active,
    Paused,
    Archived,
    Deleted,
}

/// A (field, operator, values, priority) predicate contributing to a
/// campaign's match score.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Rule {
    pub field: String,
    pub operator: RuleOperator,
    pub values: Vec<String>,
    pub priority: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleOperator {
    Equals,
    Contains,
    In,
    Prefix,
    /// Operators this build does not know never match; they are not an error
    /// so that newer rule vocabularies can roll out ahead of the gateway.
    #[serde(other)]
    Unknown,
}
