//! Reference-data loading and the versioned lookup used by pricing.
//!
//! A snapshot (pricing plans, VAT rates, currency rates) is validated in
//! full and then replaces the previous snapshot in a single transaction.
//! Rejection messages name the violated constraint so callers can
//! discriminate, matching the constraint names in `schema.sql`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::{
    is_month_start, CurrencyCode, CurrencyRate, PricingPlan, ReferenceData, VatCode, VatRate,
};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::formula::Formula;
use crate::store::EventStore;

/// Anything versioned by a `valid_from` instant. The same "greatest
/// `valid_from <= T`" selection applies to plans, VAT rates and currency
/// rates, so it is implemented once over sorted slices.
pub trait Versioned {
    fn valid_from(&self) -> DateTime<Utc>;
}

/// The latest version valid at `at`, from a slice sorted by `valid_from`
/// ascending.
pub fn version_at<T: Versioned>(versions: &[T], at: DateTime<Utc>) -> Option<&T> {
    let idx = versions.partition_point(|v| v.valid_from() <= at);
    idx.checked_sub(1).map(|i| &versions[i])
}

/// One plan version with its components' formulas already parsed.
#[derive(Debug, Clone)]
pub struct PlanVersion {
    pub valid_from: DateTime<Utc>,
    pub name: String,
    pub components: Vec<ComponentVersion>,
}

#[derive(Debug, Clone)]
pub struct ComponentVersion {
    pub name: String,
    pub formula: Formula,
    pub currency_code: CurrencyCode,
    pub vat_code: VatCode,
}

#[derive(Debug, Clone, Copy)]
pub struct RateVersion {
    pub valid_from: DateTime<Utc>,
    pub rate: Decimal,
}

impl Versioned for PlanVersion {
    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }
}

impl Versioned for RateVersion {
    fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }
}

/// An in-memory reference-data snapshot, indexed for the pricing joins. Each
/// version list is sorted by `valid_from` so `version_at` can bisect.
#[derive(Debug, Clone, Default)]
pub struct RefData {
    plans: HashMap<Uuid, Vec<PlanVersion>>,
    vat_rates: HashMap<VatCode, Vec<RateVersion>>,
    currency_rates: HashMap<CurrencyCode, Vec<RateVersion>>,
}

impl RefData {
    /// Build the indexed snapshot from validated reference rows.
    pub fn from_reference_data(data: &ReferenceData) -> Result<Self> {
        let mut refdata = RefData::default();
        for plan in &data.pricing_plans {
            let mut components = Vec::with_capacity(plan.components.len());
            for component in &plan.components {
                components.push(ComponentVersion {
                    name: component.name.clone(),
                    formula: Formula::parse(&component.formula)?,
                    currency_code: component.currency_code,
                    vat_code: component.vat_code,
                });
            }
            refdata.plans.entry(plan.plan_guid).or_default().push(PlanVersion {
                valid_from: plan.valid_from,
                name: plan.name.clone(),
                components,
            });
        }
        for rate in &data.vat_rates {
            refdata.vat_rates.entry(rate.code).or_default().push(RateVersion {
                valid_from: rate.valid_from,
                rate: rate.rate,
            });
        }
        for rate in &data.currency_rates {
            refdata.currency_rates.entry(rate.code).or_default().push(RateVersion {
                valid_from: rate.valid_from,
                rate: rate.rate,
            });
        }
        // GBP is the reporting currency; a unit rate applies unless the
        // snapshot overrides it.
        refdata.currency_rates.entry(CurrencyCode::GBP).or_insert_with(|| {
            vec![RateVersion {
                valid_from: DateTime::<Utc>::MIN_UTC,
                rate: Decimal::ONE,
            }]
        });

        for versions in refdata.plans.values_mut() {
            versions.sort_by_key(|v| v.valid_from);
        }
        for versions in refdata.vat_rates.values_mut() {
            versions.sort_by_key(|v| v.valid_from);
        }
        for versions in refdata.currency_rates.values_mut() {
            versions.sort_by_key(|v| v.valid_from);
        }
        Ok(refdata)
    }

    pub fn plan_versions(&self, plan_guid: Uuid) -> &[PlanVersion] {
        self.plans.get(&plan_guid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn vat_versions(&self, code: VatCode) -> &[RateVersion] {
        self.vat_rates.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn currency_versions(&self, code: CurrencyCode) -> &[RateVersion] {
        self.currency_rates.get(&code).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Reject anything the reference tables would reject, with the same
/// constraint names, before any row is written.
pub fn validate_reference_data(data: &ReferenceData) -> Result<()> {
    let mut plan_keys = HashSet::new();
    for plan in &data.pricing_plans {
        check_month_aligned("pricing plan", &plan.plan_guid.to_string(), plan.valid_from)?;
        if !plan_keys.insert((plan.plan_guid, plan.valid_from)) {
            return Err(Error::Validation(format!(
                "pricing plan ({}, {}) violates unique constraint \"pricing_plans_pkey\"",
                plan.plan_guid,
                plan.valid_from.to_rfc3339(),
            )));
        }
        if plan.components.is_empty() {
            return Err(Error::Validation(format!(
                "pricing plan {} must have at least one component",
                plan.plan_guid
            )));
        }
        let mut component_names = HashSet::new();
        for component in &plan.components {
            if !component_names.insert(component.name.as_str()) {
                return Err(Error::Validation(format!(
                    "pricing plan ({}, {}) component {:?} violates unique constraint \
                     \"pricing_plan_components_pkey\"",
                    plan.plan_guid,
                    plan.valid_from.to_rfc3339(),
                    component.name,
                )));
            }
            Formula::parse(&component.formula).map_err(|e| {
                Error::Validation(format!(
                    "pricing plan {} component {:?}: {e}",
                    plan.plan_guid, component.name
                ))
            })?;
        }
    }

    let mut vat_keys = HashSet::new();
    for rate in &data.vat_rates {
        check_month_aligned("vat rate", &rate.code.to_string(), rate.valid_from)?;
        if rate.rate < Decimal::ZERO {
            return Err(Error::Validation(format!(
                "vat rate ({}, {}) violates check constraint \"vat_rate_not_negative\"",
                rate.code,
                rate.valid_from.to_rfc3339(),
            )));
        }
        if !vat_keys.insert((rate.code, rate.valid_from)) {
            return Err(Error::Validation(format!(
                "vat rate ({}, {}) violates unique constraint \"vat_rates_pkey\"",
                rate.code,
                rate.valid_from.to_rfc3339(),
            )));
        }
    }

    let mut currency_keys = HashSet::new();
    for rate in &data.currency_rates {
        check_month_aligned("currency rate", &rate.code.to_string(), rate.valid_from)?;
        if rate.rate <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "currency rate ({}, {}) violates check constraint \"currency_rate_positive\"",
                rate.code,
                rate.valid_from.to_rfc3339(),
            )));
        }
        if !currency_keys.insert((rate.code, rate.valid_from)) {
            return Err(Error::Validation(format!(
                "currency rate ({}, {}) violates unique constraint \"currency_rates_pkey\"",
                rate.code,
                rate.valid_from.to_rfc3339(),
            )));
        }
    }

    Ok(())
}

fn check_month_aligned(entity: &str, identity: &str, valid_from: DateTime<Utc>) -> Result<()> {
    if !is_month_start(valid_from) {
        return Err(Error::Validation(format!(
            "{entity} ({identity}, {}) violates check constraint \"valid_from_start_of_month\"",
            valid_from.to_rfc3339(),
        )));
    }
    Ok(())
}

impl EventStore {
    /// Validate a snapshot and install it, replacing the previous one. Any
    /// rejection aborts the whole snapshot; nothing persists.
    pub async fn store_reference_data(&self, data: &ReferenceData) -> Result<()> {
        validate_reference_data(data)?;

        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM pricing_plan_components")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pricing_plans").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM vat_rates").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM currency_rates").execute(&mut *tx).await?;

        for plan in &data.pricing_plans {
            sqlx::query(
                "INSERT INTO pricing_plans (plan_guid, valid_from, name) VALUES ($1, $2, $3)",
            )
            .bind(plan.plan_guid)
            .bind(plan.valid_from)
            .bind(&plan.name)
            .execute(&mut *tx)
            .await?;

            for component in &plan.components {
                sqlx::query(
                    "INSERT INTO pricing_plan_components \
                     (plan_guid, valid_from, name, formula, currency_code, vat_code) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(plan.plan_guid)
                .bind(plan.valid_from)
                .bind(&component.name)
                .bind(&component.formula)
                .bind(component.currency_code)
                .bind(component.vat_code)
                .execute(&mut *tx)
                .await?;
            }
        }

        for rate in &data.vat_rates {
            sqlx::query("INSERT INTO vat_rates (code, valid_from, rate) VALUES ($1, $2, $3)")
                .bind(rate.code)
                .bind(rate.valid_from)
                .bind(rate.rate)
                .execute(&mut *tx)
                .await?;
        }

        for rate in &data.currency_rates {
            sqlx::query("INSERT INTO currency_rates (code, valid_from, rate) VALUES ($1, $2, $3)")
                .bind(rate.code)
                .bind(rate.valid_from)
                .bind(rate.rate)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(
            plans = data.pricing_plans.len(),
            vat_rates = data.vat_rates.len(),
            currency_rates = data.currency_rates.len(),
            "reference data snapshot installed"
        );

        Ok(())
    }

    /// Read the installed snapshot back into the indexed form pricing uses.
    pub async fn load_ref_data(&self) -> Result<RefData> {
        let plan_rows: Vec<PlanRow> = sqlx::query_as(
            "SELECT plan_guid, valid_from, name FROM pricing_plans ORDER BY plan_guid, valid_from",
        )
        .fetch_all(self.pool())
        .await?;

        let component_rows: Vec<ComponentRow> = sqlx::query_as(
            "SELECT plan_guid, valid_from, name, formula, currency_code, vat_code \
             FROM pricing_plan_components ORDER BY plan_guid, valid_from, name",
        )
        .fetch_all(self.pool())
        .await?;

        let vat_rows: Vec<VatRateRow> =
            sqlx::query_as("SELECT code, valid_from, rate FROM vat_rates").fetch_all(self.pool()).await?;

        let currency_rows: Vec<CurrencyRateRow> =
            sqlx::query_as("SELECT code, valid_from, rate FROM currency_rates")
                .fetch_all(self.pool())
                .await?;

        let mut components: HashMap<(Uuid, DateTime<Utc>), Vec<_>> = HashMap::new();
        for row in component_rows {
            components
                .entry((row.plan_guid, row.valid_from))
                .or_default()
                .push(shared::PricingPlanComponent {
                    name: row.name,
                    formula: row.formula,
                    currency_code: row.currency_code,
                    vat_code: row.vat_code,
                });
        }

        let data = ReferenceData {
            pricing_plans: plan_rows
                .into_iter()
                .map(|row| PricingPlan {
                    components: components.remove(&(row.plan_guid, row.valid_from)).unwrap_or_default(),
                    plan_guid: row.plan_guid,
                    valid_from: row.valid_from,
                    name: row.name,
                })
                .collect(),
            vat_rates: vat_rows
                .into_iter()
                .map(|row| VatRate {
                    code: row.code,
                    valid_from: row.valid_from,
                    rate: row.rate,
                })
                .collect(),
            currency_rates: currency_rows
                .into_iter()
                .map(|row| CurrencyRate {
                    code: row.code,
                    valid_from: row.valid_from,
                    rate: row.rate,
                })
                .collect(),
        };

        RefData::from_reference_data(&data)
    }
}

#[derive(sqlx::FromRow)]
struct PlanRow {
    plan_guid: Uuid,
    valid_from: DateTime<Utc>,
    name: String,
}

#[derive(sqlx::FromRow)]
struct ComponentRow {
    plan_guid: Uuid,
    valid_from: DateTime<Utc>,
    name: String,
    formula: String,
    currency_code: CurrencyCode,
    vat_code: VatCode,
}

#[derive(sqlx::FromRow)]
struct VatRateRow {
    code: VatCode,
    valid_from: DateTime<Utc>,
    rate: Decimal,
}

#[derive(sqlx::FromRow)]
struct CurrencyRateRow {
    code: CurrencyCode,
    valid_from: DateTime<Utc>,
    rate: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PricingPlanComponent;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn plan(guid: &str, valid_from: &str, name: &str) -> PricingPlan {
        PricingPlan {
            plan_guid: guid.parse().unwrap(),
            valid_from: at(valid_from),
            name: name.to_string(),
            components: vec![PricingPlanComponent {
                name: "compute".to_string(),
                formula: "ceil($time_in_seconds/3600) * 0.01".to_string(),
                currency_code: CurrencyCode::GBP,
                vat_code: VatCode::Standard,
            }],
        }
    }

    #[test]
    fn version_at_picks_greatest_valid_from_not_after() {
        let versions = vec![
            RateVersion { valid_from: at("2001-01-01T00:00:00Z"), rate: Decimal::ONE },
            RateVersion { valid_from: at("2001-03-01T00:00:00Z"), rate: Decimal::TWO },
        ];
        assert!(version_at(&versions, at("2000-12-31T23:59:59Z")).is_none());
        assert_eq!(version_at(&versions, at("2001-01-01T00:00:00Z")).unwrap().rate, Decimal::ONE);
        assert_eq!(version_at(&versions, at("2001-02-15T00:00:00Z")).unwrap().rate, Decimal::ONE);
        assert_eq!(version_at(&versions, at("2001-03-01T00:00:00Z")).unwrap().rate, Decimal::TWO);
        assert_eq!(version_at(&versions, at("2030-01-01T00:00:00Z")).unwrap().rate, Decimal::TWO);
    }

    #[test]
    fn gbp_converts_at_unity_unless_configured() {
        let refdata = RefData::from_reference_data(&ReferenceData::default()).unwrap();
        let version = version_at(
            refdata.currency_versions(CurrencyCode::GBP),
            at("2001-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(version.rate, Decimal::ONE);

        let refdata = RefData::from_reference_data(&ReferenceData {
            currency_rates: vec![CurrencyRate {
                code: CurrencyCode::GBP,
                valid_from: at("2001-01-01T00:00:00Z"),
                rate: Decimal::TWO,
            }],
            ..Default::default()
        })
        .unwrap();
        let version = version_at(
            refdata.currency_versions(CurrencyCode::GBP),
            at("2002-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(version.rate, Decimal::TWO);
    }

    #[test]
    fn rejects_duplicate_plan_versions() {
        let data = ReferenceData {
            pricing_plans: vec![
                plan("f4d4b95a-f55e-4593-8d54-3364c25798c4", "2001-01-01T00:00:00Z", "APP_PLAN_1"),
                plan("f4d4b95a-f55e-4593-8d54-3364c25798c4", "2001-01-01T00:00:00Z", "APP_PLAN_1"),
            ],
            ..Default::default()
        };
        let err = validate_reference_data(&data).unwrap_err();
        assert!(err.to_string().contains("violates unique constraint"), "{err}");
    }

    #[test]
    fn rejects_unaligned_valid_from() {
        for bad in [
            "2017-04-04T00:00:00Z",
            "2017-04-01T01:00:00Z",
            "2017-04-01T00:01:00Z",
            "2017-04-01T01:00:01Z",
        ] {
            let data = ReferenceData {
                pricing_plans: vec![plan("f4d4b95a-f55e-4593-8d54-3364c25798c4", bad, "bad-plan")],
                ..Default::default()
            };
            let err = validate_reference_data(&data).unwrap_err();
            assert!(
                err.to_string().contains("violates check constraint \"valid_from_start_of_month\""),
                "{bad}: {err}"
            );
        }

        // Month-start midnight in another zone is a different instant.
        let data = ReferenceData {
            vat_rates: vec![VatRate {
                code: VatCode::Standard,
                valid_from: DateTime::parse_from_rfc3339("2017-04-01T00:00:00+01:00")
                    .unwrap()
                    .with_timezone(&Utc),
                rate: Decimal::ZERO,
            }],
            ..Default::default()
        };
        let err = validate_reference_data(&data).unwrap_err();
        assert!(err.to_string().contains("valid_from_start_of_month"), "{err}");
    }

    #[test]
    fn rejects_duplicate_rate_versions() {
        let data = ReferenceData {
            vat_rates: vec![
                VatRate { code: VatCode::Zero, valid_from: at("2001-01-01T00:00:00Z"), rate: Decimal::ZERO },
                VatRate { code: VatCode::Zero, valid_from: at("2001-01-01T00:00:00Z"), rate: Decimal::ZERO },
            ],
            ..Default::default()
        };
        let err = validate_reference_data(&data).unwrap_err();
        assert!(err.to_string().contains("violates unique constraint \"vat_rates_pkey\""), "{err}");

        let data = ReferenceData {
            currency_rates: vec![
                CurrencyRate { code: CurrencyCode::USD, valid_from: at("2001-01-01T00:00:00Z"), rate: Decimal::ONE },
                CurrencyRate { code: CurrencyCode::USD, valid_from: at("2001-01-01T00:00:00Z"), rate: Decimal::ONE },
            ],
            ..Default::default()
        };
        let err = validate_reference_data(&data).unwrap_err();
        assert!(err.to_string().contains("violates unique constraint \"currency_rates_pkey\""), "{err}");
    }

    #[test]
    fn rejects_negative_vat_and_plans_without_components() {
        let data = ReferenceData {
            vat_rates: vec![VatRate {
                code: VatCode::Standard,
                valid_from: at("2001-01-01T00:00:00Z"),
                rate: Decimal::NEGATIVE_ONE,
            }],
            ..Default::default()
        };
        assert!(validate_reference_data(&data).unwrap_err().to_string().contains("vat_rate_not_negative"));

        let mut empty = plan("f4d4b95a-f55e-4593-8d54-3364c25798c4", "2001-01-01T00:00:00Z", "p");
        empty.components.clear();
        let data = ReferenceData { pricing_plans: vec![empty], ..Default::default() };
        assert!(validate_reference_data(&data)
            .unwrap_err()
            .to_string()
            .contains("must have at least one component"));
    }

    #[test]
    fn rejects_formulas_that_do_not_parse() {
        let mut bad = plan("f4d4b95a-f55e-4593-8d54-3364c25798c4", "2001-01-01T00:00:00Z", "p");
        bad.components[0].formula = "ceil(".to_string();
        let data = ReferenceData { pricing_plans: vec![bad], ..Default::default() };
        let err = validate_reference_data(&data).unwrap_err();
        assert!(err.to_string().contains("formula parse error"), "{err}");
    }
}
