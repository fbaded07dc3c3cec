//! Forecast pipeline
//!
//! One tick fetches an estimate from forecast.solar (`client`), then writes it
//! as predicted and live values (`writer`). `runner` ties the two together and
//! owns error handling for a tick.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

mod client;
mod runner;
mod writer;

pub use client::DEFAULT_BASE_URL;
pub use client::Estimate;
pub use client::ForecastError;
pub use client::ForecastProvider;
pub use client::ForecastSolarClient;
pub use client::RateLimit;
pub use client::estimate_path;
pub use client::parse_estimate;
#[cfg(test)]
pub use client::MockForecastProvider;
pub use runner::ForecastRunner;
pub use runner::TickError;
pub use writer::SampleWriter;
pub use writer::WriteSummary;
pub use writer::to_kilowatts;

/// Power in watts per local timestamp, in chronological order
pub type ForecastSeries = BTreeMap<NaiveDateTime, f64>;
