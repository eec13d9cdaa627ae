//! Event normalization
//!
//! Turns one raw queue payload (the venue's websocket `orderbook` message,
//! JSON) into an [`OrderbookSnapshot`]. Both the abbreviated (`cd`, `tms`,
//! `obu`) and the long (`code`, `timestamp`, `orderbook_units`) field names
//! are accepted.

use crate::error::{LoaderError, LoaderResult};
use chrono::FixedOffset;
use rust_decimal::Decimal;
use rust_decimal::serde::arbitrary_precision_option;
use serde::Deserialize;
use services_common::{BOOK_DEPTH, MAX_LEVEL_INTEGER_DIGITS, OrderbookSnapshot, PriceLevel};

/// Length of the venue prefix in a channel code (`KRW-BTC` → `BTC`)
pub const VENUE_PREFIX_LEN: usize = 4;

#[derive(Debug, Deserialize)]
struct RawOrderbookEvent {
    #[serde(rename = "cd", alias = "code")]
    code: Option<String>,
    #[serde(rename = "tms", alias = "timestamp")]
    timestamp_ms: Option<i64>,
    #[serde(rename = "obu", alias = "orderbook_units")]
    units: Option<Vec<RawUnit>>,
}

// numbers go straight from JSON text to Decimal, never through f64
#[derive(Debug, Deserialize)]
struct RawUnit {
    #[serde(rename = "ap", alias = "ask_price", default, with = "arbitrary_precision_option")]
    ask_price: Option<Decimal>,
    #[serde(rename = "as", alias = "ask_size", default, with = "arbitrary_precision_option")]
    ask_size: Option<Decimal>,
    #[serde(rename = "bp", alias = "bid_price", default, with = "arbitrary_precision_option")]
    bid_price: Option<Decimal>,
    #[serde(rename = "bs", alias = "bid_size", default, with = "arbitrary_precision_option")]
    bid_size: Option<Decimal>,
}

/// Converts raw payloads into snapshots; pure
#[derive(Debug, Clone, Copy)]
pub struct EventNormalizer {
    utc_offset: FixedOffset,
    max_level_value: Decimal,
}

impl EventNormalizer {
    /// Normalizer whose calendar dates follow `utc_offset`
    #[must_use]
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            utc_offset,
            max_level_value: Decimal::from(10_i64.pow(MAX_LEVEL_INTEGER_DIGITS)),
        }
    }

    /// Normalize one raw payload
    ///
    /// # Errors
    /// [`LoaderError::MalformedEvent`] when the payload is not JSON, a required
    /// field is missing, fewer than five levels are present, or a value cannot
    /// be stored.
    pub fn normalize(&self, payload: &[u8]) -> LoaderResult<OrderbookSnapshot> {
        let raw: RawOrderbookEvent = serde_json::from_slice(payload)
            .map_err(|e| LoaderError::malformed(format!("invalid payload: {e}")))?;

        let code = raw.code.ok_or_else(|| LoaderError::malformed("missing channel code"))?;
        let instrument = instrument_from_code(&code)?;

        let timestamp_ms = raw
            .timestamp_ms
            .ok_or_else(|| LoaderError::malformed("missing timestamp"))?;
        if timestamp_ms <= 0 {
            return Err(LoaderError::malformed(format!("non-positive timestamp {timestamp_ms}")));
        }

        let units = raw.units.ok_or_else(|| LoaderError::malformed("missing depth levels"))?;
        if units.len() < BOOK_DEPTH {
            return Err(LoaderError::malformed(format!(
                "expected {BOOK_DEPTH} depth levels, got {}",
                units.len()
            )));
        }

        let mut levels = [PriceLevel::default(); BOOK_DEPTH];
        for (index, (slot, unit)) in levels.iter_mut().zip(&units).enumerate() {
            *slot = self.level(index, unit)?;
        }

        OrderbookSnapshot::from_millis(instrument, timestamp_ms, self.utc_offset, levels)
            .ok_or_else(|| LoaderError::malformed(format!("timestamp {timestamp_ms} out of range")))
    }

    fn level(&self, index: usize, unit: &RawUnit) -> LoaderResult<PriceLevel> {
        Ok(PriceLevel {
            bid_price: self.field(index, "bid_price", unit.bid_price)?,
            bid_size: self.field(index, "bid_size", unit.bid_size)?,
            ask_price: self.field(index, "ask_price", unit.ask_price)?,
            ask_size: self.field(index, "ask_size", unit.ask_size)?,
        })
    }

    fn field(&self, index: usize, name: &str, value: Option<Decimal>) -> LoaderResult<Decimal> {
        let value = value
            .ok_or_else(|| LoaderError::malformed(format!("level {index} missing {name}")))?;
        if value.is_sign_negative() && !value.is_zero() {
            return Err(LoaderError::malformed(format!(
                "level {index} {name} is negative: {value}"
            )));
        }
        if value >= self.max_level_value {
            return Err(LoaderError::malformed(format!("level {index} {name} too large: {value}")));
        }
        Ok(value)
    }
}

/// Instrument symbol from a channel code: venue prefix stripped, upper-cased
///
/// # Errors
/// [`LoaderError::MalformedEvent`] when the code is too short or the symbol
/// contains anything but ASCII letters and digits.
pub fn instrument_from_code(code: &str) -> LoaderResult<String> {
    let symbol = match code.char_indices().nth(VENUE_PREFIX_LEN) {
        Some((start, _)) => &code[start..],
        None => {
            return Err(LoaderError::malformed(format!(
                "channel code '{code}' shorter than venue prefix"
            )));
        }
    };

    if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LoaderError::malformed(format!("unsupported symbol '{symbol}' in '{code}'")));
    }

    Ok(symbol.to_ascii_uppercase())
}
