//! Order book snapshot types

use crate::constants::{BOOK_DEPTH, EVENT_TIME_SCALE};
use chrono::{DateTime, FixedOffset, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One depth level of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Bid price
    pub bid_price: Decimal,
    /// Bid size
    pub bid_size: Decimal,
    /// Ask price
    pub ask_price: Decimal,
    /// Ask size
    pub ask_size: Decimal,
}

impl PriceLevel {
    /// Values in storage column order
    #[must_use]
    pub const fn values(&self) -> [Decimal; 4] {
        [self.bid_price, self.bid_size, self.ask_price, self.ask_size]
    }
}

/// One observed book state for one instrument at one instant
///
/// `event_date` is the calendar date of `event_time` at the venue's local
/// date boundary and `next_date` is exactly one day later; together they are
/// the range of the storage partition that holds the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookSnapshot {
    /// Upper-cased market symbol without venue prefix
    pub instrument: String,
    /// Seconds since epoch with millisecond scale
    pub event_time: Decimal,
    /// Venue-local calendar date of `event_time`
    pub event_date: NaiveDate,
    /// `event_date` + 1 day
    pub next_date: NaiveDate,
    /// Depth levels, index 0 = best
    pub levels: [PriceLevel; BOOK_DEPTH],
}

impl OrderbookSnapshot {
    /// Build a snapshot from a millisecond timestamp
    ///
    /// Returns `None` when the timestamp is outside chrono's representable
    /// range.
    #[must_use]
    pub fn from_millis(
        instrument: String,
        timestamp_ms: i64,
        offset: FixedOffset,
        levels: [PriceLevel; BOOK_DEPTH],
    ) -> Option<Self> {
        let event_date = venue_date(timestamp_ms, offset)?;
        let next_date = event_date.succ_opt()?;
        Some(Self {
            instrument,
            event_time: Decimal::new(timestamp_ms, EVENT_TIME_SCALE),
            event_date,
            next_date,
            levels,
        })
    }

    /// `[event_date, next_date)` range of the covering partition
    #[must_use]
    pub const fn partition_range(&self) -> (NaiveDate, NaiveDate) {
        (self.event_date, self.next_date)
    }

    /// The 20 level values in storage column order
    pub fn level_values(&self) -> impl Iterator<Item = Decimal> + '_ {
        self.levels.iter().flat_map(PriceLevel::values)
    }
}

/// Calendar date of a millisecond timestamp at a fixed UTC offset
#[must_use]
pub fn venue_date(timestamp_ms: i64, offset: FixedOffset) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(timestamp_ms).map(|utc| utc.with_timezone(&offset).date_naive())
}
