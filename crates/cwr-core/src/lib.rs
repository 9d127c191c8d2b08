//! Core domain model for closed-won reconciliation: deal snapshots, close-date
//! parsing, first-win resolution and business-type classification.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cwr-core";

/// Close-date layouts accepted from the CRM, tried in order.
pub const CLOSE_DATE_FORMATS: [&str; 2] = [
    // `%.f` consumes the leading dot and any number of fraction digits;
    // `within_layout_bounds` caps it at MAX_FRACTION_DIGITS.
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
];

/// Longest fraction accepted in a close date.
pub const MAX_FRACTION_DIGITS: usize = 6;

/// Layout written back onto the entity record (microsecond precision).
pub const CANONICAL_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub const DEFAULT_THRESHOLD_DAYS: i64 = 365;
pub const MAX_PAGE_SIZE: usize = 100;
pub const MAX_CHUNK_SIZE: usize = 100;

/// Opaque identifier of the tracked customer/contact record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// "after" token handed out by the remote store for the next page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaginationCursor(String);

impl PaginationCursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Immutable snapshot of a deal as served by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    pub stage: String,
    pub close_date: Option<String>,
}

/// One page of a deal search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DealPage {
    pub deals: Vec<Deal>,
    pub next_cursor: Option<PaginationCursor>,
}

/// A closed-won deal whose close date parsed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedWonRecord {
    pub deal_id: String,
    pub closed_at: DateTime<Utc>,
}

/// Single property assignment inside a batch mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DealPropertyUpdate {
    pub deal_id: String,
    pub property: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusinessType {
    #[serde(rename = "New Business")]
    NewBusiness,
    #[serde(rename = "Existing Business")]
    ExistingBusiness,
}

impl BusinessType {
    /// Label written to the deal's classification property.
    pub fn label(self) -> &'static str {
        match self {
            Self::NewBusiness => "New Business",
            Self::ExistingBusiness => "Existing Business",
        }
    }
}

impl fmt::Display for BusinessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("date format not supported: {raw}")]
pub struct DateFormatError {
    pub raw: String,
}

/// Parse a CRM timestamp, returning the first layout in [`CLOSE_DATE_FORMATS`] that matches.
///
/// Whitespace anywhere, fractions longer than [`MAX_FRACTION_DIGITS`] and leap
/// seconds are rejected even where chrono alone would accept them.
pub fn parse_close_date(raw: &str) -> Result<DateTime<Utc>, DateFormatError> {
    let rejected = || DateFormatError {
        raw: raw.to_string(),
    };
    if !within_layout_bounds(raw) {
        return Err(rejected());
    }
    CLOSE_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        // chrono encodes second 60 as a nanosecond value past one second.
        .filter(|naive| naive.nanosecond() < 1_000_000_000)
        .map(|naive| naive.and_utc())
        .ok_or_else(rejected)
}

fn within_layout_bounds(raw: &str) -> bool {
    if raw.chars().any(char::is_whitespace) {
        return false;
    }
    let Some(body) = raw.strip_suffix('Z') else {
        return false;
    };
    match body.rsplit_once('.') {
        Some((_, fraction)) => {
            (1..=MAX_FRACTION_DIGITS).contains(&fraction.len())
                && fraction.bytes().all(|b| b.is_ascii_digit())
        }
        None => true,
    }
}

pub fn format_canonical(instant: DateTime<Utc>) -> String {
    instant.format(CANONICAL_DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDeal {
    pub deal_id: String,
    pub error: DateFormatError,
}

/// Closed-won records for one entity, ascending by `closed_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub records: Vec<ClosedWonRecord>,
    pub skipped: Vec<SkippedDeal>,
}

impl Resolution {
    /// First closed-won record; `None` is the empty-result outcome.
    pub fn earliest(&self) -> Option<&ClosedWonRecord> {
        self.records.first()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Keep deals in a closed-won stage with a parseable close date, sorted oldest first.
///
/// The sort is stable, so deals sharing an instant keep their fetch order.
pub fn resolve_closed_won(deals: &[Deal], closed_won_stages: &BTreeSet<String>) -> Resolution {
    let mut resolution = Resolution::default();

    for deal in deals {
        if !closed_won_stages.contains(&deal.stage) {
            continue;
        }
        let Some(raw) = deal.close_date.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        match parse_close_date(raw) {
            Ok(closed_at) => resolution.records.push(ClosedWonRecord {
                deal_id: deal.id.clone(),
                closed_at,
            }),
            Err(error) => resolution.skipped.push(SkippedDeal {
                deal_id: deal.id.clone(),
                error,
            }),
        }
    }

    resolution.records.sort_by_key(|record| record.closed_at);
    resolution
}

/// Strictly more than `threshold_days` whole days since the first win is existing business.
pub fn classify(first_won_at: DateTime<Utc>, now: DateTime<Utc>, threshold_days: i64) -> BusinessType {
    if (now - first_won_at).num_days() > threshold_days {
        BusinessType::ExistingBusiness
    } else {
        BusinessType::NewBusiness
    }
}

/// Contiguous, order-preserving batches of at most `chunk_size` records.
pub fn partition_chunks(
    records: &[ClosedWonRecord],
    chunk_size: usize,
) -> std::slice::Chunks<'_, ClosedWonRecord> {
    records.chunks(chunk_size.max(1))
}

pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}
