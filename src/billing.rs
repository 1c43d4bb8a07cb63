use chrono::{Duration, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::sessions::model::Session;

pub const DEFAULT_FEE_PER_BLOCK: u64 = 2000;
pub const DEFAULT_BLOCK_MINUTES: u32 = 10;

/// Price of a session, charged per started block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BillingRates {
    pub fee_per_block: u64,
    pub block_minutes: u32,
}

impl Default for BillingRates {
    fn default() -> Self {
        Self {
            fee_per_block: DEFAULT_FEE_PER_BLOCK,
            block_minutes: DEFAULT_BLOCK_MINUTES,
        }
    }
}

impl BillingRates {
    /// Number of blocks charged; partial blocks round up and at least one
    /// block is always charged
    pub fn blocks_for(&self, duration_minutes: u32) -> u64 {
        let block = u64::from(self.block_minutes.max(1));
        u64::from(duration_minutes).div_ceil(block).max(1)
    }

    pub fn amount_for(&self, duration_minutes: u32) -> u64 {
        self.blocks_for(duration_minutes) * self.fee_per_block
    }
}

/// Which timestamp decides the calendar day a session is billed on.
/// One report must use one anchor throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAnchor {
    /// `start_time`, for a live view of today's sessions
    Creation,
    /// `end_time`, for historical reports over finished sessions
    Completion,
}

impl FromStr for ReportAnchor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "creation" | "start" => Ok(ReportAnchor::Creation),
            "completion" | "end" => Ok(ReportAnchor::Completion),
            other => Err(format!("Unknown report anchor: {}", other)),
        }
    }
}

impl fmt::Display for ReportAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportAnchor::Creation => f.write_str("creation"),
            ReportAnchor::Completion => f.write_str("completion"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayTotal {
    pub date: NaiveDate,
    pub sessions: usize,
    pub amount: u64,
}

/// Group sessions by local calendar day of `anchor` and total their fees.
///
/// `offset` is the clock-sync correction applied before converting to `tz`.
/// Most recent day first.
pub fn daily_totals<Tz: TimeZone>(
    sessions: &[Session],
    rates: &BillingRates,
    anchor: ReportAnchor,
    offset: Duration,
    tz: &Tz,
) -> Vec<DayTotal> {
    let mut days: BTreeMap<NaiveDate, DayTotal> = BTreeMap::new();

    for session in sessions {
        let at = match anchor {
            ReportAnchor::Creation => session.start_time,
            ReportAnchor::Completion => session.end_time,
        };
        let date = (at + offset).with_timezone(tz).date_naive();

        let day = days.entry(date).or_insert(DayTotal {
            date,
            sessions: 0,
            amount: 0,
        });
        day.sessions += 1;
        day.amount += rates.amount_for(session.duration_minutes);
    }

    days.into_values().rev().collect()
}
