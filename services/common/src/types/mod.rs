//! Shared domain types

pub mod orderbook;

pub use orderbook::{OrderbookSnapshot, PriceLevel, venue_date};
