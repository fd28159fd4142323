use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the posted-ticker ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedTickerRecord {
    /// Uppercase-normalized ticker, the primary key.
    pub ticker: String,
    pub posted_at: DateTime<Utc>,
    pub relative_volume: Option<f64>,
    pub theme: Option<String>,
    pub sector: Option<String>,
}

pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}
