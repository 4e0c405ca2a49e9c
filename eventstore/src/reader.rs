//! Streaming reads of billable events.
//!
//! The cursor is the primary surface: rows are fetched and priced by a
//! spawned worker holding one pooled connection, delivered through a bounded
//! channel so the full result set is never materialized. The slice API
//! drains a cursor. Pricing happens here, at read time, against the current
//! reference data, so a missing plan version or a formula failure surfaces
//! through the cursor's error channel and terminates it.

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use shared::{BillableEvent, EventFilter, UsageEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pricing::price_usage_event;
use crate::refdata::RefData;
use crate::store::EventStore;

/// Rows buffered between the fetch worker and the cursor.
const ROW_BUFFER: usize = 32;

/// A forward-only, single-pass cursor over billable events.
///
/// Call `next().await` to advance; `event()` / `event_json()` expose the
/// current row. Close on every exit path; dropping the cursor aborts the
/// fetch worker as a backstop.
pub struct BillableEventRows {
    rx: mpsc::Receiver<Result<BillableEvent>>,
    handle: JoinHandle<()>,
    token: CancellationToken,
    current: Option<BillableEvent>,
    pub(crate) err: Option<Error>,
    closed: bool,
}

impl BillableEventRows {
    /// Spawn a fetch worker. `work` receives the sending half of the row
    /// channel; its error, if any, becomes the cursor's terminal error.
    pub(crate) fn spawn<F, Fut>(token: CancellationToken, work: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<BillableEvent>>) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        let err_tx = tx.clone();
        let fut = work(tx);
        let worker_token = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = worker_token.cancelled() => {}
                result = fut => {
                    if let Err(err) = result {
                        let _ = err_tx.send(Err(err)).await;
                    }
                }
            }
        });
        BillableEventRows {
            rx,
            handle,
            token,
            current: None,
            err: None,
            closed: false,
        }
    }

    /// Advance to the next row. Returns false once the stream is exhausted,
    /// an error occurred (see `err()`), or cancellation was observed.
    pub async fn next(&mut self) -> bool {
        if self.closed || self.err.is_some() {
            return false;
        }
        tokio::select! {
            _ = self.token.cancelled() => {
                self.current = None;
                self.err = Some(Error::Cancelled);
                false
            }
            row = self.rx.recv() => match row {
                Some(Ok(event)) => {
                    self.current = Some(event);
                    true
                }
                Some(Err(err)) => {
                    self.current = None;
                    self.err = Some(err);
                    false
                }
                None => {
                    self.current = None;
                    false
                }
            }
        }
    }

    /// The current row, if `next()` returned true.
    pub fn event(&self) -> Option<&BillableEvent> {
        self.current.as_ref()
    }

    /// The current row serialized to its wire JSON.
    pub fn event_json(&self) -> Result<Vec<u8>> {
        let event = self.current.as_ref().ok_or(Error::NoRow)?;
        Ok(serde_json::to_vec(event)?)
    }

    /// The error that terminated the cursor, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Release the cursor's connection. Idempotent; safe after any failure.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.current = None;
        self.rx.close();
        self.handle.abort();
    }
}

impl Drop for BillableEventRows {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Drain a cursor into memory, closing it on every path.
pub(crate) async fn drain(mut rows: BillableEventRows) -> Result<Vec<BillableEvent>> {
    let mut out = Vec::new();
    while rows.next().await {
        if let Some(event) = rows.event() {
            out.push(event.clone());
        }
    }
    rows.close();
    match rows.err.take() {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

pub(crate) fn validate_filter(filter: &EventFilter) -> Result<()> {
    if filter.range_start >= filter.range_stop {
        return Err(Error::InvalidFilter(
            "filter range_start must be before range_stop".to_string(),
        ));
    }
    Ok(())
}

/// Price every normalized event overlapping `filter` and push the results to
/// `tx`. Returns false when the receiving cursor has gone away.
pub(crate) async fn stream_live_slice(
    store: &EventStore,
    refdata: &RefData,
    filter: &EventFilter,
    tx: &mpsc::Sender<Result<BillableEvent>>,
) -> Result<bool> {
    let range = filter.range();
    let mut rows = store.usage_events_stream(filter);
    while let Some(event) = rows.try_next().await? {
        let Some(billable) = price_usage_event(refdata, &event, &range)? else {
            continue;
        };
        if tx.send(Ok(billable)).await.is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

impl EventStore {
    /// Open a cursor over billable events whose interval intersects the
    /// filter range. Rows arrive ordered by `(event_start, event_guid)`;
    /// components crossing a reference-version boundary inside the range are
    /// split so each detail line carries a single version.
    pub async fn get_billable_event_rows(
        &self,
        token: CancellationToken,
        filter: &EventFilter,
    ) -> Result<BillableEventRows> {
        validate_filter(filter)?;
        debug!(
            range_start = %filter.range_start,
            range_stop = %filter.range_stop,
            orgs = filter.org_guids.len(),
            "opening billable event cursor"
        );

        let store = self.clone();
        let filter = filter.clone();
        Ok(BillableEventRows::spawn(token, move |tx| async move {
            let refdata = store.load_ref_data().await?;
            stream_live_slice(&store, &refdata, &filter, &tx).await?;
            Ok(())
        }))
    }

    /// Convenience that drains the cursor into memory.
    pub async fn get_billable_events(
        &self,
        token: CancellationToken,
        filter: &EventFilter,
    ) -> Result<Vec<BillableEvent>> {
        let rows = self.get_billable_event_rows(token, filter).await?;
        drain(rows).await
    }
}

impl EventStore {
    /// Normalized events overlapping the filter range as a row stream,
    /// ordered by clipped start then guid.
    pub(crate) fn usage_events_stream<'a>(
        &'a self,
        filter: &'a EventFilter,
    ) -> BoxStream<'a, sqlx::Result<UsageEvent>> {
        sqlx::query_as::<_, crate::store::UsageEventRow>(
            "SELECT event_guid, resource_guid, resource_name, resource_type, org_guid, \
             space_guid, plan_guid, plan_name, lower(duration) AS event_start, \
             upper(duration) AS event_stop, number_of_nodes, memory_in_mb, storage_in_mb \
             FROM events \
             WHERE lower(duration) < $2 AND upper(duration) > $1 \
               AND (cardinality($3::uuid[]) = 0 OR org_guid = ANY($3)) \
             ORDER BY GREATEST(lower(duration), $1), event_guid",
        )
        .bind(filter.range_start)
        .bind(filter.range_stop)
        .bind(&filter.org_guids)
        .fetch(self.pool())
        .map(|row| row.map(UsageEvent::from))
        .boxed()
    }
}
