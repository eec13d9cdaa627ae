//! Common types and configuration shared by the market-data loader services

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod constants;
pub mod errors;
pub mod types;

pub use self::config::*;
pub use constants::*;
pub use errors::*;
pub use types::*;
