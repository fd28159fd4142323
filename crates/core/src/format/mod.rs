pub mod super_signal;

use crate::domain::metrics::QuoteMetrics;
use crate::domain::recommendation::{get_recommendations_list, RecommendationItem};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Discord caps messages at 2000 characters; leave headroom for the code fence.
pub const DEFAULT_TABLE_MAX_LENGTH: usize = 1900;

const EMPTY_MESSAGE: &str = "No recommendations available.";
const HIGH_RELATIVE_VOLUME: f64 = 2.0;
const HIGH_VOLUME: u64 = 1_000_000;
const CELL_MAX_WIDTH: usize = 25;
const HEADER_MAX_WIDTH: usize = 15;

const PRIORITY_COLUMNS: [&str; 11] = [
    "ticker",
    "company",
    "sector",
    "theme",
    "risk_level",
    "entry_price_range",
    "target_price",
    "stop_loss",
    "confidence_score",
    "earnings_date",
    "reasoning",
];

pub fn format_volume(volume: u64) -> String {
    if volume >= 1_000_000 {
        format!("{:.2}M", volume as f64 / 1_000_000.0)
    } else if volume >= 1_000 {
        format!("{:.1}K", volume as f64 / 1_000.0)
    } else {
        volume.to_string()
    }
}

/// Renders one recommendation as a standalone chat message.
pub fn format_single_recommendation(
    item: &RecommendationItem,
    metrics: Option<&QuoteMetrics>,
) -> String {
    let ticker = item.ticker().unwrap_or_else(|| "???".to_string());
    let company = item.company().unwrap_or_else(|| "Unknown".to_string());
    let sector = item.sector().unwrap_or_default();
    let theme = item.theme().unwrap_or_default();
    let risk = item.risk_level().unwrap_or_default();

    let mut lines = vec![
        format!("**${ticker}** - {company}"),
        format!("Sector: {sector} | Theme: {theme} | Risk: {risk}"),
    ];

    if let Some(metrics) = metrics.filter(|m| !m.is_empty()) {
        let mut parts = Vec::with_capacity(2);
        if let Some(rvol) = metrics.relative_volume {
            let emoji = if rvol >= HIGH_RELATIVE_VOLUME { "🔥" } else { "📊" };
            parts.push(format!("{emoji} RVOL: {rvol:.2}"));
        }
        if let Some(volume) = metrics.volume {
            let emoji = if volume >= HIGH_VOLUME { "📈" } else { "📉" };
            parts.push(format!("{emoji} Vol: {}", format_volume(volume)));
        }
        lines.push(parts.join(" | "));
    }

    lines.push(String::new());
    lines.push(format!(
        "Entry: {}",
        item.entry_price_range().unwrap_or_default()
    ));
    lines.push(format!(
        "Target: {} | Stop: {}",
        item.target_price().unwrap_or_default(),
        item.stop_loss().unwrap_or_default()
    ));

    if let Some(earnings) = item.earnings_date() {
        lines.push(format!("Earnings: {earnings}"));
    }
    if let Some(reasoning) = item.reasoning() {
        lines.push(format!("\n_{reasoning}_"));
    }

    lines.join("\n")
}

/// Renders a raw upstream payload as a fixed-width table inside a code block.
pub fn format_recommendations_table(payload: &Value, max_length: usize) -> String {
    let items = get_recommendations_list(payload);
    render_table(&items, max_length, Utc::now())
}

/// Table rendering with an explicit timestamp. Output never exceeds `max_length`
/// characters; rows that do not fit are summarized as `... and N more`.
pub fn render_table(
    items: &[RecommendationItem],
    max_length: usize,
    generated_at: DateTime<Utc>,
) -> String {
    let Some(first) = items.first() else {
        return clip(EMPTY_MESSAGE, max_length);
    };

    let columns = table_columns(first);
    let widths: Vec<usize> = columns
        .iter()
        .map(|col| {
            items.iter().fold(col.chars().count().min(HEADER_MAX_WIDTH), |w, item| {
                let cell = truncate_cell(&item.text(col).unwrap_or_default(), CELL_MAX_WIDTH);
                w.max(cell.chars().count().min(CELL_MAX_WIDTH))
            })
        })
        .collect();

    let prefix = format!(
        "**Falcon Recommendations** ({})\n```\n",
        generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let suffix = "\n```";

    let fixed_len = prefix.chars().count() + suffix.chars().count();

    // Header, separator and the widest possible "... and N more" line must fit;
    // trailing (lowest priority) columns are dropped until they do.
    let worst_more_len = 1 + format!("... and {} more", items.len()).chars().count();
    let mut shown_columns = columns.len();
    while shown_columns > 0
        && fixed_len + 2 * line_len(&widths[..shown_columns]) + 1 + worst_more_len > max_length
    {
        shown_columns -= 1;
    }
    if shown_columns == 0 {
        return clip(
            &format!("{prefix}... and {} more{suffix}", items.len()),
            max_length,
        );
    }
    if shown_columns < columns.len() {
        tracing::debug!(
            shown = shown_columns,
            total = columns.len(),
            "dropping table columns to fit message length"
        );
    }
    let columns = &columns[..shown_columns];
    let widths = &widths[..shown_columns];

    let header = columns
        .iter()
        .zip(widths)
        .map(|(col, &w)| pad(&col.chars().take(w).collect::<String>(), w))
        .collect::<Vec<_>>()
        .join(" | ");
    let separator = widths
        .iter()
        .map(|&w| "-".repeat(w))
        .collect::<Vec<_>>()
        .join("-+-");

    // Running length of "header\nseparator\nrow\n...".
    let mut body_len = header.chars().count() + 1 + separator.chars().count();
    let mut rows: Vec<String> = Vec::with_capacity(items.len());

    for item in items {
        let row = columns
            .iter()
            .zip(widths)
            .map(|(col, &w)| pad(&truncate_cell(&item.text(col).unwrap_or_default(), w), w))
            .collect::<Vec<_>>()
            .join(" | ");
        let row_len = row.chars().count() + 1;
        if fixed_len + body_len + row_len > max_length {
            break;
        }
        body_len += row_len;
        rows.push(row);
    }

    let mut more_line = None;
    if rows.len() < items.len() {
        loop {
            let line = format!("... and {} more", items.len() - rows.len());
            if fixed_len + body_len + 1 + line.chars().count() <= max_length || rows.is_empty() {
                more_line = Some(line);
                break;
            }
            if let Some(dropped) = rows.pop() {
                body_len -= dropped.chars().count() + 1;
            }
        }
    }

    let mut lines = Vec::with_capacity(rows.len() + 3);
    lines.push(header);
    lines.push(separator);
    lines.extend(rows);
    lines.extend(more_line);

    clip(&format!("{prefix}{}{suffix}", lines.join("\n")), max_length)
}

fn table_columns(first: &RecommendationItem) -> Vec<String> {
    let keys: Vec<&str> = first.keys().collect();
    let mut columns: Vec<String> = PRIORITY_COLUMNS
        .iter()
        .filter(|col| keys.contains(col))
        .map(|col| col.to_string())
        .collect();
    for key in keys {
        if !PRIORITY_COLUMNS.contains(&key) {
            columns.push(key.to_string());
        }
    }
    columns
}

/// Printed width of one table line over these columns (`" | "` between cells).
fn line_len(widths: &[usize]) -> usize {
    widths.iter().sum::<usize>() + 3 * widths.len().saturating_sub(1)
}

fn truncate_cell(value: &str, max_len: usize) -> String {
    if value.chars().count() <= max_len {
        return value.to_string();
    }
    let kept: String = value.chars().take(max_len.saturating_sub(2)).collect();
    format!("{kept}..")
}

fn pad(value: &str, width: usize) -> String {
    format!("{value:<width$}")
}

fn clip(text: &str, max_length: usize) -> String {
    text.chars().take(max_length).collect()
}
