use crate::campaign::{Campaign, DEFAULT_CAMPAIGN_ID, Rule, RuleOperator};
use crate::errors::{GatewayError, Result};
use crate::event::CapturedEvent;
use crate::snapshot::SnapshotHandle;
use chrono::{Datelike, Timelike, Weekday};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

/// A resolved routing decision.
#[derive(Clone, Debug, PartialEq)]
pub struct Destination {
    pub url: String,
    /// Empty when the decision came from the tenant fallback URL.
    pub campaign_id: String,
}

/// Routes a captured request to a destination using the tenant's slice of
/// the current campaign snapshot. Lock-free on the hot path: each decision
/// works against one immutable snapshot.
#[derive(Clone)]
pub struct CampaignRouter {
    snapshot: Arc<SnapshotHandle>,
}

impl CampaignRouter {
    pub fn new(snapshot: Arc<SnapshotHandle>) -> Self {
        CampaignRouter { snapshot }
    }

    /// Resolution order: forced path campaign, best positive rule score
    /// (ties broken by the lexicographically smaller campaign id), the
    /// tenant's `default` campaign, the tenant fallback URL.
    pub fn resolve(
        &self,
        tenant_id: &str,
        path_campaign: Option<&str>,
        event: &CapturedEvent,
    ) -> Result<Destination> {
        let snapshot = self.snapshot.load();
        let Some(tenant) = snapshot.tenant(tenant_id) else {
            return Err(GatewayError::NoDestination);
        };

        if let Some(forced) = path_campaign
            && let Some(campaign) = tenant.campaigns.get(forced)
        {
            return Ok(destination_for(campaign, event));
        }

        let mut best: Option<(&Arc<Campaign>, u32)> = None;
        for campaign in tenant.campaigns.values() {
            let score = match_score(campaign, event);
            if score == 0 {
                continue;
            }
            best = match best {
                Some((current, current_score))
                    if score < current_score
                        || (score == current_score
                            && campaign.campaign_id >= current.campaign_id) =>
                {
                    Some((current, current_score))
                }
                _ => Some((campaign, score)),
            };
        }
        if let Some((campaign, _)) = best {
            return Ok(destination_for(campaign, event));
        }

        if let Some(campaign) = tenant.campaigns.get(DEFAULT_CAMPAIGN_ID) {
            return Ok(destination_for(campaign, event));
        }

        if let Some(fallback) = &tenant.fallback_url {
            return Ok(Destination {
                url: fallback.clone(),
                campaign_id: String::new(),
            });
        }

        Err(GatewayError::NoDestination)
    }
}

fn destination_for(campaign: &Campaign, event: &CapturedEvent) -> Destination {
    Destination {
        url: build_destination_url(
            &campaign.destination_url,
            campaign.append_params,
            &event.request.query,
        ),
        campaign_id: campaign.campaign_id.clone(),
    }
}

fn match_score(campaign: &Campaign, event: &CapturedEvent) -> u32 {
    campaign
        .rules
        .iter()
        .filter(|rule| rule_matches(rule, event))
        .map(|rule| rule.priority)
        .sum()
}

fn rule_matches(rule: &Rule, event: &CapturedEvent) -> bool {
    let Some(value) = field_value(event, &rule.field) else {
        return false;
    };

    match rule.operator {
        RuleOperator::Equals | RuleOperator::In => rule.values.iter().any(|v| v == value.as_ref()),
        RuleOperator::Contains => {
            let value = value.to_lowercase();
            rule.values.iter().any(|v| value.contains(&v.to_lowercase()))
        }
        RuleOperator::Prefix => rule.values.iter().any(|v| value.starts_with(v.as_str())),
        RuleOperator::Unknown => false,
    }
}

/// Resolves a rule field against the captured request.
///
/// `hour` and `day_of_week` derive from the ingestion timestamp (UTC);
/// device/os/browser come from the coarse user-agent classification; geo
/// fields prefer the query parameter and fall back to edge-provided headers;
/// anything else reads the raw query parameter of the same name.
fn field_value<'a>(event: &'a CapturedEvent, field: &str) -> Option<Cow<'a, str>> {
    let borrowed = |v: Option<&'a str>| v.map(Cow::Borrowed);
    match field {
        "hour" => {
            let ts = chrono::DateTime::from_timestamp_millis(event.timestamp_ms as i64)?;
            Some(Cow::Owned(ts.hour().to_string()))
        }
        "day_of_week" => {
            let ts = chrono::DateTime::from_timestamp_millis(event.timestamp_ms as i64)?;
            Some(Cow::Borrowed(day_name(ts.weekday())))
        }
        "source" => borrowed(event.enriched.source.as_deref()),
        "medium" => borrowed(event.enriched.medium.as_deref()),
        "device_type" => borrowed(event.enriched.device_type.as_deref()),
        "os" => borrowed(event.enriched.os.as_deref()),
        "browser" => borrowed(event.enriched.browser.as_deref()),
        "country" | "region" | "city" => borrowed(
            event
                .first_param(field)
                .or_else(|| event.first_header(&format!("x-geo-{field}"))),
        ),
        other => borrowed(event.first_param(other)),
    }
}

fn day_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Merges the inbound query into the destination URL when the campaign asks
/// for it. Inbound values win on duplicate keys; every inbound value is
/// preserved. A destination that fails to parse is returned unchanged.
fn build_destination_url(
    destination: &str,
    append_params: bool,
    query: &BTreeMap<String, Vec<String>>,
) -> String {
    if !append_params || query.is_empty() {
        return destination.to_string();
    }

    let mut url = match Url::parse(destination) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = %e, destination, "invalid destination URL");
            return destination.to_string();
        }
    };

    let existing: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in existing.iter().filter(|(k, _)| !query.contains_key(k)) {
            pairs.append_pair(key, value);
        }
        for (key, values) in query {
            for value in values {
                pairs.append_pair(key, value);
            }
        }
    }

    url.to_string()
}
