//! Consolidation of fully elapsed months into an immutable table.
//!
//! Consolidating a month prices it through the live pipeline and freezes the
//! resulting component rows under `(month, event_guid, component_name)`.
//! Each month is written in one transaction guarded by a per-month advisory
//! lock; a month already marked consolidated is left untouched, so
//! re-consolidation is a no-op and failure leaves the table unchanged.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use futures::TryStreamExt;
use rust_decimal::Decimal;
use shared::{
    month_date, month_start, month_starts_within, months_touching, next_month, BillableEvent,
    CurrencyCode, EventFilter, Price, PriceComponent, VatCode,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::reader::{drain, stream_live_slice, validate_filter, BillableEventRows};
use crate::store::EventStore;

/// Advisory lock class for month consolidation.
const CONSOLIDATION_LOCK_CLASS: i32 = 0x62696c;

impl EventStore {
    /// Consolidate every calendar month fully contained in `[start, end)`.
    /// Months already consolidated are skipped.
    pub async fn consolidate_full_months(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<()> {
        for month in month_starts_within(start, end) {
            self.consolidate_month(month).await?;
        }
        Ok(())
    }

    /// Consolidate from the earliest raw event's month through the last
    /// fully elapsed month.
    pub async fn consolidate_all(&self) -> Result<()> {
        let Some(earliest) = self.earliest_raw_event_at().await? else {
            debug!("no raw events stored, nothing to consolidate");
            return Ok(());
        };
        self.consolidate_full_months(month_start(earliest), month_start(Utc::now()))
            .await
    }

    /// True iff every month the filter range touches is consolidated and the
    /// range does not intersect the current, not-yet-elapsed month.
    pub async fn is_range_consolidated(&self, filter: &EventFilter) -> Result<bool> {
        validate_filter(filter)?;
        if filter.range_stop > month_start(Utc::now()) {
            return Ok(false);
        }
        let months: Vec<NaiveDate> = months_touching(filter.range_start, filter.range_stop)
            .map(month_date)
            .collect();
        let consolidated: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM consolidated_months WHERE month = ANY($1)",
        )
        .bind(&months)
        .fetch_one(self.pool())
        .await?;
        Ok(consolidated as usize == months.len())
    }

    /// Open a cursor over `[range_start, range_stop)`, serving consolidated
    /// months from the immutable table and the rest through the live
    /// pipeline, as one stream ordered by `(event_start, event_guid,
    /// component_name)`. Consolidated rows are priced per whole month, so
    /// the filter must be month-aligned.
    pub async fn get_consolidated_billable_event_rows(
        &self,
        token: CancellationToken,
        filter: &EventFilter,
    ) -> Result<BillableEventRows> {
        validate_filter(filter)?;
        if !shared::is_month_start(filter.range_start) || !shared::is_month_start(filter.range_stop)
        {
            return Err(Error::InvalidFilter(
                "consolidated reads must cover whole calendar months".to_string(),
            ));
        }

        let store = self.clone();
        let filter = filter.clone();
        Ok(BillableEventRows::spawn(token, move |tx| async move {
            let months: Vec<DateTime<Utc>> =
                months_touching(filter.range_start, filter.range_stop).collect();
            let month_dates: Vec<NaiveDate> = months.iter().copied().map(month_date).collect();
            let consolidated: HashSet<NaiveDate> = sqlx::query_scalar::<_, NaiveDate>(
                "SELECT month FROM consolidated_months WHERE month = ANY($1)",
            )
            .bind(&month_dates)
            .fetch_all(store.pool())
            .await?
            .into_iter()
            .collect();

            // Live slices are only priced when needed, but the snapshot is
            // loaded once for all of them.
            let refdata = store.load_ref_data().await?;

            for month in months {
                let delivered = if consolidated.contains(&month_date(month)) {
                    stream_consolidated_month(&store, month_date(month), &filter.org_guids, &tx)
                        .await?
                } else {
                    let slice = EventFilter {
                        range_start: month,
                        range_stop: next_month(month),
                        org_guids: filter.org_guids.clone(),
                    };
                    stream_live_slice(&store, &refdata, &slice, &tx).await?
                };
                if !delivered {
                    break;
                }
            }
            Ok(())
        }))
    }

    /// Convenience that drains the consolidated cursor into memory.
    pub async fn get_consolidated_billable_events(
        &self,
        token: CancellationToken,
        filter: &EventFilter,
    ) -> Result<Vec<BillableEvent>> {
        let rows = self.get_consolidated_billable_event_rows(token, filter).await?;
        drain(rows).await
    }

    async fn consolidate_month(&self, month: DateTime<Utc>) -> Result<()> {
        let month_key = month_date(month);
        if self.is_month_consolidated(month_key).await? {
            debug!(month = %month_key, "month already consolidated, skipping");
            return Ok(());
        }

        let filter = EventFilter {
            range_start: month,
            range_stop: next_month(month),
            org_guids: Vec::new(),
        };
        let events = self.get_billable_events(CancellationToken::new(), &filter).await?;

        let mut tx = self.pool().begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(CONSOLIDATION_LOCK_CLASS)
            .bind(month.year() * 100 + month.month() as i32)
            .execute(&mut *tx)
            .await?;

        // Another consolidator may have won the lock first.
        let already: Option<NaiveDate> =
            sqlx::query_scalar("SELECT month FROM consolidated_months WHERE month = $1")
                .bind(month_key)
                .fetch_optional(&mut *tx)
                .await?;
        if already.is_some() {
            debug!(month = %month_key, "month consolidated concurrently, skipping");
            return Ok(());
        }

        let mut components = 0usize;
        for event in &events {
            for detail in &event.price.details {
                sqlx::query(
                    "INSERT INTO consolidated_billable_events (month, event_guid, \
                     component_name, event_start, event_stop, resource_guid, resource_name, \
                     resource_type, org_guid, org_name, space_guid, space_name, plan_guid, \
                     plan_name, service_guid, service_name, number_of_nodes, memory_in_mb, \
                     storage_in_mb, component_plan_name, component_start, component_stop, \
                     vat_code, vat_rate, currency_code, currency_rate, ex_vat, inc_vat) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
                     $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)",
                )
                .bind(month_key)
                .bind(event.event_guid)
                .bind(&detail.name)
                .bind(event.event_start)
                .bind(event.event_stop)
                .bind(event.resource_guid)
                .bind(&event.resource_name)
                .bind(&event.resource_type)
                .bind(event.org_guid)
                .bind(&event.org_name)
                .bind(event.space_guid)
                .bind(&event.space_name)
                .bind(event.plan_guid)
                .bind(&event.plan_name)
                .bind(&event.service_guid)
                .bind(&event.service_name)
                .bind(event.number_of_nodes)
                .bind(event.memory_in_mb)
                .bind(event.storage_in_mb)
                .bind(&detail.plan_name)
                .bind(detail.start)
                .bind(detail.stop)
                .bind(detail.vat_code)
                .bind(detail.vat_rate)
                .bind(detail.currency_code)
                .bind(detail.currency_rate)
                .bind(detail.ex_vat)
                .bind(detail.inc_vat)
                .execute(&mut *tx)
                .await?;
                components += 1;
            }
        }

        sqlx::query("INSERT INTO consolidated_months (month) VALUES ($1)")
            .bind(month_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(month = %month_key, events = events.len(), components, "month consolidated");
        Ok(())
    }

    async fn is_month_consolidated(&self, month: NaiveDate) -> Result<bool> {
        let found: Option<NaiveDate> =
            sqlx::query_scalar("SELECT month FROM consolidated_months WHERE month = $1")
                .bind(month)
                .fetch_optional(self.pool())
                .await?;
        Ok(found.is_some())
    }
}

/// Replay one consolidated month, reassembling stored component rows into
/// billable events. Returns false when the receiving cursor has gone away.
async fn stream_consolidated_month(
    store: &EventStore,
    month: NaiveDate,
    org_guids: &[Uuid],
    tx: &mpsc::Sender<Result<BillableEvent>>,
) -> Result<bool> {
    let mut rows = sqlx::query_as::<_, ConsolidatedRow>(
        "SELECT event_guid, component_name, event_start, event_stop, resource_guid, \
         resource_name, resource_type, org_guid, org_name, space_guid, space_name, plan_guid, \
         plan_name, service_guid, service_name, number_of_nodes, memory_in_mb, storage_in_mb, \
         component_plan_name, component_start, component_stop, vat_code, vat_rate, \
         currency_code, currency_rate, ex_vat, inc_vat \
         FROM consolidated_billable_events \
         WHERE month = $1 AND (cardinality($2::uuid[]) = 0 OR org_guid = ANY($2)) \
         ORDER BY event_start, event_guid, component_name",
    )
    .bind(month)
    .bind(org_guids)
    .fetch(store.pool());

    let mut pending: Option<BillableEvent> = None;
    while let Some(row) = rows.try_next().await? {
        match pending.as_mut() {
            Some(current) if current.event_guid == row.event_guid => {
                let detail = row.into_price_component();
                current.price.ex_vat += detail.ex_vat;
                current.price.inc_vat += detail.inc_vat;
                current.price.details.push(detail);
            }
            _ => {
                if let Some(done) = pending.take() {
                    if tx.send(Ok(done)).await.is_err() {
                        return Ok(false);
                    }
                }
                pending = Some(row.into_billable_event());
            }
        }
    }
    if let Some(done) = pending {
        if tx.send(Ok(done)).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

#[derive(sqlx::FromRow)]
struct ConsolidatedRow {
    event_guid: Uuid,
    component_name: String,
    event_start: DateTime<Utc>,
    event_stop: DateTime<Utc>,
    resource_guid: Uuid,
    resource_name: String,
    resource_type: String,
    org_guid: Uuid,
    org_name: String,
    space_guid: Uuid,
    space_name: String,
    plan_guid: Uuid,
    plan_name: String,
    service_guid: String,
    service_name: String,
    number_of_nodes: Option<i32>,
    memory_in_mb: Option<i32>,
    storage_in_mb: Option<i32>,
    component_plan_name: String,
    component_start: DateTime<Utc>,
    component_stop: DateTime<Utc>,
    vat_code: VatCode,
    vat_rate: Decimal,
    currency_code: CurrencyCode,
    currency_rate: Decimal,
    ex_vat: Decimal,
    inc_vat: Decimal,
}

impl ConsolidatedRow {
    fn into_price_component(self) -> PriceComponent {
        PriceComponent {
            name: self.component_name,
            plan_name: self.component_plan_name,
            start: self.component_start,
            stop: self.component_stop,
            vat_rate: self.vat_rate,
            vat_code: self.vat_code,
            currency_code: self.currency_code,
            currency_rate: self.currency_rate,
            inc_vat: self.inc_vat,
            ex_vat: self.ex_vat,
        }
    }

    fn into_billable_event(self) -> BillableEvent {
        let mut event = BillableEvent {
            event_guid: self.event_guid,
            event_start: self.event_start,
            event_stop: self.event_stop,
            resource_guid: self.resource_guid,
            resource_name: self.resource_name.clone(),
            resource_type: self.resource_type.clone(),
            org_guid: self.org_guid,
            org_name: self.org_name.clone(),
            space_guid: self.space_guid,
            space_name: self.space_name.clone(),
            plan_guid: self.plan_guid,
            plan_name: self.plan_name.clone(),
            service_guid: self.service_guid.clone(),
            service_name: self.service_name.clone(),
            number_of_nodes: self.number_of_nodes,
            memory_in_mb: self.memory_in_mb,
            storage_in_mb: self.storage_in_mb,
            price: Price {
                inc_vat: self.inc_vat,
                ex_vat: self.ex_vat,
                details: Vec::new(),
            },
        };
        event.price.details.push(self.into_price_component());
        event
    }
}
