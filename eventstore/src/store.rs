//! The event store: schema management, append-only raw-event ingest and the
//! refresh that rebuilds the derived tables.

use chrono::{DateTime, Utc};
use shared::{EventKind, RawEvent, RawEventFilter, UsageEvent};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::events::normalize;
use crate::pricing::price_usage_event;

const SCHEMA: &str = include_str!("schema.sql");

/// Handle on the billing event store. Cheap to clone; all operations run
/// against the shared connection pool.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: PgPool,
    config: StoreConfig,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        EventStore::with_config(pool, StoreConfig::default())
    }

    pub fn with_config(pool: PgPool, config: StoreConfig) -> Self {
        EventStore { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create the schema. Every statement is idempotent, so this is safe to
    /// run on each process start.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("event store schema initialised");
        Ok(())
    }

    /// Append a batch of raw events in one transaction. Every element must
    /// carry all four fields; any invalid element rolls the whole batch
    /// back. Events whose GUID is already stored are skipped silently.
    pub async fn store_events(&self, batch: &[RawEvent]) -> Result<()> {
        let mut validated = Vec::with_capacity(batch.len());
        for event in batch {
            validated.push(validate_raw_event(event)?);
        }

        let mut tx = self.pool.begin().await?;
        let mut stored = 0u64;
        for (guid, created_at, kind, raw_message) in validated {
            let result = sqlx::query(
                "INSERT INTO raw_events (guid, created_at, kind, raw_message) \
                 VALUES ($1, $2, $3, $4) ON CONFLICT (guid) DO NOTHING",
            )
            .bind(guid)
            .bind(created_at)
            .bind(kind)
            .bind(raw_message)
            .execute(&mut *tx)
            .await?;
            stored += result.rows_affected();
        }
        tx.commit().await?;

        debug!(
            batch = batch.len(),
            stored,
            skipped = batch.len() as u64 - stored,
            "raw events stored"
        );
        Ok(())
    }

    /// Raw events of one kind, newest first unless `reverse` is set.
    pub async fn get_events(&self, filter: &RawEventFilter) -> Result<Vec<RawEvent>> {
        if filter.kind.is_empty() {
            return Err(Error::InvalidFilter(
                "you must supply a kind to filter events by".to_string(),
            ));
        }
        let kind: EventKind = filter.kind.parse().map_err(|_| {
            Error::InvalidFilter(format!("cannot query events of kind '{}'", filter.kind))
        })?;

        let order = if filter.reverse { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT guid, created_at, kind, raw_message FROM raw_events \
             WHERE kind = $1 ORDER BY created_at {order}, id {order} LIMIT $2",
        );

        let rows: Vec<RawEventRow> = sqlx::query_as(&sql)
            .bind(kind)
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(RawEvent::from).collect())
    }

    /// Rebuild the derived tables: normalized `events` and the priced
    /// `billable_event_components`, both replaced in one transaction. Open
    /// intervals are closed at the refresh instant.
    pub async fn refresh(&self) -> Result<()> {
        let refdata = self.load_ref_data().await?;
        let raw = self.all_raw_events().await?;
        let now = Utc::now();

        let normalized = normalize(&raw, now, self.config.compute_plan_guid)?;

        let mut priced = Vec::with_capacity(normalized.len());
        for event in &normalized {
            if let Some(billable) = price_usage_event(&refdata, event, &event.duration)? {
                priced.push(billable);
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM billable_event_components").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM events").execute(&mut *tx).await?;

        for event in &normalized {
            sqlx::query(
                "INSERT INTO events (event_guid, resource_guid, resource_name, resource_type, \
                 org_guid, space_guid, plan_guid, plan_name, duration, number_of_nodes, \
                 memory_in_mb, storage_in_mb) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, tstzrange($9, $10, '[)'), $11, $12, $13)",
            )
            .bind(event.event_guid)
            .bind(event.resource_guid)
            .bind(&event.resource_name)
            .bind(&event.resource_type)
            .bind(event.org_guid)
            .bind(event.space_guid)
            .bind(event.plan_guid)
            .bind(&event.plan_name)
            .bind(event.duration.start)
            .bind(event.duration.stop)
            .bind(event.number_of_nodes)
            .bind(event.memory_in_mb)
            .bind(event.storage_in_mb)
            .execute(&mut *tx)
            .await?;
        }

        let mut components = 0usize;
        for billable in &priced {
            for detail in &billable.price.details {
                sqlx::query(
                    "INSERT INTO billable_event_components (event_guid, name, plan_name, \
                     start_at, stop_at, vat_code, vat_rate, currency_code, currency_rate, \
                     ex_vat, inc_vat) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                )
                .bind(billable.event_guid)
                .bind(&detail.name)
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

        tx.commit().await?;

        info!(events = normalized.len(), components, "derived tables refreshed");
        Ok(())
    }

    /// The instant of the earliest stored raw event, if any.
    pub(crate) async fn earliest_raw_event_at(&self) -> Result<Option<DateTime<Utc>>> {
        let earliest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT min(created_at) FROM raw_events")
                .fetch_one(&self.pool)
                .await?;
        Ok(earliest)
    }

    async fn all_raw_events(&self) -> Result<Vec<RawEvent>> {
        let rows: Vec<RawEventRow> = sqlx::query_as(
            "SELECT guid, created_at, kind, raw_message FROM raw_events ORDER BY created_at, guid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RawEvent::from).collect())
    }
}

pub(crate) fn validate_raw_event(
    event: &RawEvent,
) -> Result<(Uuid, DateTime<Utc>, EventKind, serde_json::Value)> {
    let guid = match event.guid {
        Some(guid) if !guid.is_nil() => guid,
        _ => return Err(Error::BatchIngest("usage event must have a GUID".to_string())),
    };
    let created_at = event
        .created_at
        .ok_or_else(|| Error::BatchIngest("usage event must have a CreatedAt".to_string()))?;
    if event.kind.is_empty() {
        return Err(Error::BatchIngest("usage event must have a Kind".to_string()));
    }
    let kind: EventKind = event
        .kind
        .parse()
        .map_err(|_| Error::BatchIngest(format!("cannot store events of kind '{}'", event.kind)))?;
    let raw_message = match &event.raw_message {
        Some(value) if !value.is_null() => value.clone(),
        _ => {
            return Err(Error::BatchIngest(
                "usage event must have a RawMessage payload".to_string(),
            ))
        }
    };
    Ok((guid, created_at, kind, raw_message))
}

#[derive(sqlx::FromRow)]
struct RawEventRow {
    guid: Uuid,
    created_at: DateTime<Utc>,
    kind: EventKind,
    raw_message: serde_json::Value,
}

impl From<RawEventRow> for RawEvent {
    fn from(row: RawEventRow) -> Self {
        RawEvent {
            guid: Some(row.guid),
            created_at: Some(row.created_at),
            kind: row.kind.to_string(),
            raw_message: Some(row.raw_message),
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct UsageEventRow {
    event_guid: Uuid,
    resource_guid: Uuid,
    resource_name: String,
    resource_type: String,
    org_guid: Uuid,
    space_guid: Uuid,
    plan_guid: Uuid,
    plan_name: String,
    event_start: DateTime<Utc>,
    event_stop: DateTime<Utc>,
    number_of_nodes: Option<i32>,
    memory_in_mb: Option<i32>,
    storage_in_mb: Option<i32>,
}

impl From<UsageEventRow> for UsageEvent {
    fn from(row: UsageEventRow) -> Self {
        UsageEvent {
            event_guid: row.event_guid,
            resource_guid: row.resource_guid,
            resource_name: row.resource_name,
            resource_type: row.resource_type,
            org_guid: row.org_guid,
            space_guid: row.space_guid,
            plan_guid: row.plan_guid,
            plan_name: row.plan_name,
            duration: shared::Interval::new(row.event_start, row.event_stop),
            number_of_nodes: row.number_of_nodes,
            memory_in_mb: row.memory_in_mb,
            storage_in_mb: row.storage_in_mb,
        }
    }
}
