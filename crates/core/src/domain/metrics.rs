use serde::{Deserialize, Serialize};

/// Point-in-time trading metrics for one ticker.
///
/// Fetched fresh for every screening decision and never cached. A field is `None`
/// when the quote page did not expose it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteMetrics {
    pub relative_volume: Option<f64>,
    pub volume: Option<u64>,
}

impl QuoteMetrics {
    pub fn is_empty(&self) -> bool {
        self.relative_volume.is_none() && self.volume.is_none()
    }
}
