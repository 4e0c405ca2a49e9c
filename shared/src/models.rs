use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::interval::Interval;

/// The kind of a raw usage event. Stored as the Postgres enum `event_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    App,
    Service,
    Compose,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::App => "app",
            EventKind::Service => "service",
            EventKind::Compose => "compose",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "app" => Ok(EventKind::App),
            "service" => Ok(EventKind::Service),
            "compose" => Ok(EventKind::Compose),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

/// VAT band applied to a pricing plan component. Stored as the Postgres enum
/// `vat_code`; the wire form is the capitalized code itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "vat_code")]
pub enum VatCode {
    Standard,
    Reduced,
    Zero,
}

impl std::fmt::Display for VatCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VatCode::Standard => f.write_str("Standard"),
            VatCode::Reduced => f.write_str("Reduced"),
            VatCode::Zero => f.write_str("Zero"),
        }
    }
}

/// Billing currency. GBP is the reporting currency and always converts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "currency_code")]
pub enum CurrencyCode {
    GBP,
    USD,
    EUR,
}

impl std::fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CurrencyCode::GBP => f.write_str("GBP"),
            CurrencyCode::USD => f.write_str("USD"),
            CurrencyCode::EUR => f.write_str("EUR"),
        }
    }
}

/// A raw usage event as delivered by the collector.
///
/// Fields are optional at this boundary so ingest validation can name the
/// missing field; events read back from the store always have every field
/// populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub guid: Option<Uuid>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub raw_message: Option<serde_json::Value>,
}

/// Filter for reading raw events back out of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEventFilter {
    pub kind: String,
    /// Flip from newest-first to oldest-first.
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// A normalized usage event: one resource-state interval with the resource
/// commitment that was active across it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_guid: Uuid,
    pub resource_guid: Uuid,
    pub resource_name: String,
    pub resource_type: String,
    pub org_guid: Uuid,
    pub space_guid: Uuid,
    pub plan_guid: Uuid,
    pub plan_name: String,
    pub duration: Interval,
    pub number_of_nodes: Option<i32>,
    pub memory_in_mb: Option<i32>,
    pub storage_in_mb: Option<i32>,
}

/// Time window (and optional org restriction) for billable-event queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    pub range_start: DateTime<Utc>,
    pub range_stop: DateTime<Utc>,
    #[serde(default)]
    pub org_guids: Vec<Uuid>,
}

impl EventFilter {
    pub fn range(&self) -> Interval {
        Interval::new(self.range_start, self.range_stop)
    }

    /// Empty org list means no org restriction.
    pub fn includes_org(&self, org_guid: Uuid) -> bool {
        self.org_guids.is_empty() || self.org_guids.contains(&org_guid)
    }
}

/// One priced segment of a plan component. Within a detail line the chosen
/// plan, VAT and currency versions are constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceComponent {
    pub name: String,
    pub plan_name: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub vat_rate: Decimal,
    pub vat_code: VatCode,
    pub currency_code: CurrencyCode,
    #[serde(with = "rust_decimal::serde::str")]
    pub currency_rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub inc_vat: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ex_vat: Decimal,
}

/// Computed cost of a billable event: totals plus the per-component breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    #[serde(with = "rust_decimal::serde::str")]
    pub inc_vat: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ex_vat: Decimal,
    pub details: Vec<PriceComponent>,
}

/// A resource-usage interval enriched with its computed cost. This is the
/// serialized shape API callers consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableEvent {
    pub event_guid: Uuid,
    pub event_start: DateTime<Utc>,
    pub event_stop: DateTime<Utc>,
    pub resource_guid: Uuid,
    pub resource_name: String,
    pub resource_type: String,
    pub org_guid: Uuid,
    pub org_name: String,
    pub space_guid: Uuid,
    pub space_name: String,
    pub plan_guid: Uuid,
    pub plan_name: String,
    pub service_guid: String,
    pub service_name: String,
    pub number_of_nodes: Option<i32>,
    pub memory_in_mb: Option<i32>,
    pub storage_in_mb: Option<i32>,
    pub price: Price,
}
