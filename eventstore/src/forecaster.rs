//! Forecasting: pricing hypothetical events that were never stored.
//!
//! The supplied raw events are validated, normalized and priced exactly as
//! if they had been ingested and refreshed, against the reference data
//! currently installed. Nothing touches the raw-event or derived tables, so
//! the call is referentially transparent with respect to persistent state.

use chrono::Utc;
use shared::{BillableEvent, EventFilter, RawEvent};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::events::normalize;
use crate::pricing::price_usage_event;
use crate::reader::{drain, validate_filter, BillableEventRows};
use crate::store::{validate_raw_event, EventStore};

impl EventStore {
    /// Open a cursor over the billable events the supplied raw events would
    /// produce within `filter`, had they been stored.
    pub async fn forecast_billable_event_rows(
        &self,
        token: CancellationToken,
        events: &[RawEvent],
        filter: &EventFilter,
    ) -> Result<BillableEventRows> {
        validate_filter(filter)?;
        for event in events {
            validate_raw_event(event)?;
        }
        debug!(events = events.len(), "forecasting billable events");

        let store = self.clone();
        let filter = filter.clone();
        let events = events.to_vec();
        Ok(BillableEventRows::spawn(token, move |tx| async move {
            let refdata = store.load_ref_data().await?;
            let now = Utc::now();
            let normalized = normalize(&events, now, store.config().compute_plan_guid)?;
            let range = filter.range();
            for event in &normalized {
                if !filter.includes_org(event.org_guid) {
                    continue;
                }
                let Some(billable) = price_usage_event(&refdata, event, &range)? else {
                    continue;
                };
                if tx.send(Ok(billable)).await.is_err() {
                    break;
                }
            }
            Ok(())
        }))
    }

    /// Convenience that drains the forecast cursor into memory.
    pub async fn forecast_billable_events(
        &self,
        token: CancellationToken,
        events: &[RawEvent],
        filter: &EventFilter,
    ) -> Result<Vec<BillableEvent>> {
        let rows = self.forecast_billable_event_rows(token, events, filter).await?;
        drain(rows).await
    }
}
