use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{CurrencyCode, VatCode};

/// A reference-data snapshot: the full set of pricing plans, VAT rates and
/// currency rates installed for a deployment. One snapshot is loaded per
/// process start and replaces the previous one atomically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReferenceData {
    #[serde(default)]
    pub pricing_plans: Vec<PricingPlan>,
    #[serde(default)]
    pub vat_rates: Vec<VatRate>,
    #[serde(default)]
    pub currency_rates: Vec<CurrencyRate>,
}

impl ReferenceData {
    /// Parse a serialized snapshot.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// One version of a pricing plan, valid from a month start onward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingPlan {
    pub plan_guid: Uuid,
    #[serde(deserialize_with = "instant_or_date")]
    pub valid_from: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub components: Vec<PricingPlanComponent>,
}

/// One named cost line within a plan version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingPlanComponent {
    pub name: String,
    pub formula: String,
    pub currency_code: CurrencyCode,
    pub vat_code: VatCode,
}

/// One version of a VAT band's rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatRate {
    pub code: VatCode,
    #[serde(deserialize_with = "instant_or_date")]
    pub valid_from: DateTime<Utc>,
    pub rate: Decimal,
}

/// One version of a currency's conversion rate into the reporting currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrencyRate {
    pub code: CurrencyCode,
    #[serde(deserialize_with = "instant_or_date")]
    pub valid_from: DateTime<Utc>,
    pub rate: Decimal,
}

/// Snapshot files write `valid_from` either as a full RFC 3339 instant or as
/// a bare `YYYY-MM-DD` date, which means midnight UTC.
fn instant_or_date<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(t) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(t.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map(|d| {
            DateTime::from_naive_utc_and_offset(
                chrono::NaiveDateTime::new(d, chrono::NaiveTime::MIN),
                Utc,
            )
        })
        .map_err(|_| {
            serde::de::Error::custom(format!(
                "valid_from must be an RFC 3339 instant or YYYY-MM-DD date, got {raw:?}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_snapshot() {
        let cfg = ReferenceData::from_json(
            r#"{
                "pricing_plans": [{
                    "plan_guid": "efb5f1ce-0a8a-435d-a8b2-6b2b61c6dbe5",
                    "valid_from": "2001-01-01",
                    "name": "DB_PLAN_1",
                    "components": [{
                        "name": "compute",
                        "formula": "ceil($time_in_seconds/3600) * 1",
                        "currency_code": "GBP",
                        "vat_code": "Standard"
                    }]
                }],
                "vat_rates": [{"code": "Standard", "valid_from": "2001-01-01", "rate": 0}],
                "currency_rates": [{"code": "USD", "valid_from": "2001-01-01T00:00:00Z", "rate": 0.8}]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.pricing_plans.len(), 1);
        assert_eq!(cfg.pricing_plans[0].valid_from, "2001-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(cfg.pricing_plans[0].components[0].currency_code, CurrencyCode::GBP);
        assert_eq!(cfg.vat_rates[0].rate, Decimal::ZERO);
        assert_eq!(cfg.currency_rates[0].valid_from, "2001-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn offset_instants_keep_their_instant() {
        let cfg = ReferenceData::from_json(
            r#"{"vat_rates": [{"code": "Zero", "valid_from": "2017-04-01T00:00:00+01:00", "rate": 0}]}"#,
        )
        .unwrap();
        // +01:00 midnight is 23:00 UTC the previous day.
        assert_eq!(cfg.vat_rates[0].valid_from, "2017-03-31T23:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn rejects_unknown_codes() {
        assert!(ReferenceData::from_json(
            r#"{"currency_rates": [{"code": "UKP", "valid_from": "2001-01-01", "rate": 1}]}"#
        )
        .is_err());
        assert!(ReferenceData::from_json(
            r#"{"vat_rates": [{"code": "standard", "valid_from": "2001-01-01", "rate": 0}]}"#
        )
        .is_err());
    }

    #[test]
    fn rejects_malformed_valid_from() {
        assert!(ReferenceData::from_json(
            r#"{"vat_rates": [{"code": "Zero", "valid_from": "April 2017", "rate": 0}]}"#
        )
        .is_err());
    }
}
