use crate::domain::metrics::QuoteMetrics;
use crate::domain::posted::{normalize_ticker, PostedTickerRecord};
use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::SqlitePool;
use std::path::Path;

// Fixed-width UTC text so lexical order in SQLite matches chronological order.
// Same shape as the column default (strftime '%Y-%m-%dT%H:%M:%fZ').
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Durable set of tickers that were already delivered downstream.
///
/// One row per normalized ticker; marking a ticker again replaces its row.
#[derive(Debug, Clone)]
pub struct PostedTickerLedger {
    pool: SqlitePool,
}

impl PostedTickerLedger {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let pool = super::connect_file(path).await?;
        tracing::debug!(path = %path.display(), "opened posted ticker ledger");
        Self::from_pool(pool).await
    }

    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let pool = super::connect_in_memory().await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> anyhow::Result<Self> {
        super::migrate(&pool).await?;
        let ledger = Self { pool };

        let count = ledger.count().await?;
        if count > 0 {
            tracing::info!(count, "loaded previously posted tickers from ledger");
        }
        Ok(ledger)
    }

    pub async fn is_posted(&self, ticker: &str) -> anyhow::Result<bool> {
        let ticker = normalize_ticker(ticker);
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM posted_tickers WHERE ticker = ?")
            .bind(&ticker)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("lookup posted ticker {ticker} failed"))?;
        Ok(row.is_some())
    }

    pub async fn mark_posted(
        &self,
        ticker: &str,
        metrics: Option<&QuoteMetrics>,
        theme: Option<&str>,
        sector: Option<&str>,
    ) -> anyhow::Result<()> {
        self.mark_posted_at(ticker, metrics, theme, sector, Utc::now())
            .await
    }

    pub async fn mark_posted_at(
        &self,
        ticker: &str,
        metrics: Option<&QuoteMetrics>,
        theme: Option<&str>,
        sector: Option<&str>,
        posted_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let ticker = normalize_ticker(ticker);
        anyhow::ensure!(!ticker.is_empty(), "ticker must be non-empty");

        sqlx::query(
            "INSERT OR REPLACE INTO posted_tickers (ticker, posted_at, relative_volume, theme, sector) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&ticker)
        .bind(encode_timestamp(posted_at))
        .bind(metrics.and_then(|m| m.relative_volume))
        .bind(theme)
        .bind(sector)
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark posted ticker {ticker} failed"))?;

        Ok(())
    }

    /// All records, most recently posted first.
    pub async fn list(&self) -> anyhow::Result<Vec<PostedTickerRecord>> {
        let rows = sqlx::query_as::<_, (String, String, Option<f64>, Option<String>, Option<String>)>(
            "SELECT ticker, posted_at, relative_volume, theme, sector \
             FROM posted_tickers \
             ORDER BY posted_at DESC, ticker ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("list posted tickers failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for (ticker, posted_at, relative_volume, theme, sector) in rows {
            let posted_at = decode_timestamp(&posted_at).with_context(|| {
                format!("invalid posted_at in ledger for ticker={ticker}: {posted_at}")
            })?;
            out.push(PostedTickerRecord {
                ticker,
                posted_at,
                relative_volume,
                theme,
                sector,
            });
        }
        Ok(out)
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posted_tickers")
            .fetch_one(&self.pool)
            .await
            .context("count posted tickers failed")?;
        Ok(count)
    }

    /// Deletes every record, or only those posted strictly before `before`.
    /// Returns the number of rows removed.
    pub async fn clear(&self, before: Option<DateTime<Utc>>) -> anyhow::Result<u64> {
        let res = match before {
            Some(cutoff) => {
                sqlx::query("DELETE FROM posted_tickers WHERE posted_at < ?")
                    .bind(encode_timestamp(cutoff))
                    .execute(&self.pool)
                    .await
            }
            None => {
                sqlx::query("DELETE FROM posted_tickers")
                    .execute(&self.pool)
                    .await
            }
        }
        .context("clear posted tickers failed")?;

        let removed = res.rows_affected();
        tracing::info!(removed, cutoff = ?before, "cleared posted tickers");
        Ok(removed)
    }

    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            tracing::debug!("closed posted ticker ledger");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn decode_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    // Naive forms: SQLite CURRENT_TIMESTAMP and rows written without an offset.
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(naive.and_utc());
        }
    }
    anyhow::bail!("unrecognized timestamp: {s}")
}
