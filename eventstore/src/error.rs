use chrono::{DateTime, Utc};
use shared::{CurrencyCode, VatCode};
use thiserror::Error;
use uuid::Uuid;

use crate::formula::FormulaError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the event store. Nothing is recovered silently except
/// duplicate-GUID ingest.
#[derive(Debug, Error)]
pub enum Error {
    /// Reference data rejected; the snapshot was not persisted.
    #[error("{0}")]
    Validation(String),

    /// A raw-event batch contained an invalid element; the whole batch was
    /// rolled back.
    #[error("{0}")]
    BatchIngest(String),

    /// A query filter the store cannot serve.
    #[error("{0}")]
    InvalidFilter(String),

    /// No pricing plan version is active at the interval start.
    #[error("no version of pricing plan {plan_guid} is valid at {at}")]
    NoPlan { plan_guid: Uuid, at: DateTime<Utc> },

    /// No VAT rate version is active at the interval start.
    #[error("no {code} VAT rate is valid at {at}")]
    NoVatRate { code: VatCode, at: DateTime<Utc> },

    /// No currency rate version is active at the interval start.
    #[error("no {code} currency rate is valid at {at}")]
    NoCurrencyRate { code: CurrencyCode, at: DateTime<Utc> },

    /// A pricing formula failed to parse or evaluate.
    #[error(transparent)]
    Formula(#[from] FormulaError),

    /// Cooperative cancellation was observed at a suspension point.
    #[error("operation cancelled")]
    Cancelled,

    /// The cursor has no current row; call `next()` first.
    #[error("cursor has no current row")]
    NoRow,

    /// A raw message could not be decoded during normalization.
    #[error("invalid raw message: {0}")]
    Message(#[from] serde_json::Error),

    /// Underlying store failure. Not retried here; retrying is the caller's
    /// responsibility.
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}
