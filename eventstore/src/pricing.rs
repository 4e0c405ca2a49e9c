//! Pricing of normalized usage events against a reference-data snapshot.
//!
//! For each event the plan version active at the interval start is selected
//! with the shared "greatest `valid_from <= T`" rule, the interval is split
//! wherever a chosen plan, VAT or currency version changes, and each
//! component formula is evaluated per segment. A billable event's totals are
//! the sums over its detail segments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use shared::{BillableEvent, Interval, Price, PriceComponent, UsageEvent};

use crate::error::{Error, Result};
use crate::formula::{FormulaError, Vars};
use crate::refdata::{version_at, RefData, Versioned};

/// Price `event` over the part of its duration that falls inside `range`.
/// Returns `None` when the event does not intersect the range.
pub fn price_usage_event(
    refdata: &RefData,
    event: &UsageEvent,
    range: &Interval,
) -> Result<Option<BillableEvent>> {
    let Some(window) = event.duration.clip(range) else {
        return Ok(None);
    };

    let plan_versions = refdata.plan_versions(event.plan_guid);
    let mut details = Vec::new();

    for segment in split_at(&window, plan_versions.iter().map(|v| v.valid_from())) {
        let plan = version_at(plan_versions, segment.start).ok_or(Error::NoPlan {
            plan_guid: event.plan_guid,
            at: segment.start,
        })?;

        for component in &plan.components {
            let vat_versions = refdata.vat_versions(component.vat_code);
            let currency_versions = refdata.currency_versions(component.currency_code);
            let boundaries = vat_versions
                .iter()
                .map(|v| v.valid_from())
                .chain(currency_versions.iter().map(|v| v.valid_from()));

            for sub in split_at(&segment, boundaries) {
                let vat = version_at(vat_versions, sub.start).ok_or(Error::NoVatRate {
                    code: component.vat_code,
                    at: sub.start,
                })?;
                let currency =
                    version_at(currency_versions, sub.start).ok_or(Error::NoCurrencyRate {
                        code: component.currency_code,
                        at: sub.start,
                    })?;

                let vars = Vars {
                    time_in_seconds: Decimal::from(sub.seconds()),
                    memory_in_mb: event.memory_in_mb.map(Decimal::from),
                    storage_in_mb: event.storage_in_mb.map(Decimal::from),
                    number_of_nodes: event.number_of_nodes.map(Decimal::from),
                };
                let value = component.formula.evaluate(&vars)?;
                let ex_vat = checked_mul(value, currency.rate)?;
                let inc_vat = checked_mul(ex_vat, checked_add(Decimal::ONE, vat.rate)?)?;

                details.push(PriceComponent {
                    name: component.name.clone(),
                    plan_name: plan.name.clone(),
                    start: sub.start,
                    stop: sub.stop,
                    vat_rate: vat.rate,
                    vat_code: component.vat_code,
                    currency_code: component.currency_code,
                    currency_rate: currency.rate,
                    inc_vat,
                    ex_vat,
                });
            }
        }
    }

    let mut ex_vat = Decimal::ZERO;
    let mut inc_vat = Decimal::ZERO;
    for detail in &details {
        ex_vat = checked_add(ex_vat, detail.ex_vat)?;
        inc_vat = checked_add(inc_vat, detail.inc_vat)?;
    }

    Ok(Some(BillableEvent {
        event_guid: event.event_guid,
        event_start: window.start,
        event_stop: window.stop,
        resource_guid: event.resource_guid,
        resource_name: event.resource_name.clone(),
        resource_type: event.resource_type.clone(),
        org_guid: event.org_guid,
        org_name: String::new(),
        space_guid: event.space_guid,
        space_name: String::new(),
        plan_guid: event.plan_guid,
        plan_name: event.plan_name.clone(),
        service_guid: String::new(),
        service_name: String::new(),
        number_of_nodes: event.number_of_nodes,
        memory_in_mb: event.memory_in_mb,
        storage_in_mb: event.storage_in_mb,
        price: Price {
            inc_vat,
            ex_vat,
            details,
        },
    }))
}

/// Split `window` at every boundary instant strictly inside it, yielding
/// adjacent half-open segments in order.
fn split_at(
    window: &Interval,
    boundaries: impl Iterator<Item = DateTime<Utc>>,
) -> Vec<Interval> {
    let mut cuts: Vec<_> = boundaries
        .filter(|b| window.start < *b && *b < window.stop)
        .collect();
    cuts.sort();
    cuts.dedup();

    let mut segments = Vec::with_capacity(cuts.len() + 1);
    let mut start = window.start;
    for cut in cuts {
        segments.push(Interval::new(start, cut));
        start = cut;
    }
    segments.push(Interval::new(start, window.stop));
    segments
}

fn checked_mul(lhs: Decimal, rhs: Decimal) -> Result<Decimal> {
    lhs.checked_mul(rhs).ok_or(Error::Formula(FormulaError::Overflow))
}

fn checked_add(lhs: Decimal, rhs: Decimal) -> Result<Decimal> {
    lhs.checked_add(rhs).ok_or(Error::Formula(FormulaError::Overflow))
}
