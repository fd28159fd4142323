use serde_json::{json, Value};

const MAX_LISTED_FLAGS: usize = 5;

/// Formatters for messages that arrive with source metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormatter {
    /// Stock alerts emitted by the super-signal scanner.
    SuperSignal,
}

impl MessageFormatter {
    pub const ALL: [MessageFormatter; 1] = [MessageFormatter::SuperSignal];

    pub fn can_handle(&self, metadata: Option<&Value>) -> bool {
        match self {
            MessageFormatter::SuperSignal => metadata
                .and_then(|m| m.get("source"))
                .and_then(Value::as_str)
                == Some("super-signal"),
        }
    }

    pub fn format(&self, message: &str, metadata: Option<&Value>) -> String {
        match self {
            MessageFormatter::SuperSignal => match metadata {
                Some(metadata) => format_super_signal(message, metadata),
                None => message.to_string(),
            },
        }
    }
}

/// Applies the first formatter that accepts `metadata`; otherwise returns `message`.
pub fn apply_formatters(message: &str, metadata: Option<&Value>) -> String {
    MessageFormatter::ALL
        .iter()
        .find(|f| f.can_handle(metadata))
        .map(|f| f.format(message, metadata))
        .unwrap_or_else(|| message.to_string())
}

pub fn format_stock_alert(
    ticker: &str,
    risk_flags: &[String],
    price: Option<f64>,
    message: Option<&str>,
) -> String {
    let metadata = json!({
        "source": "super-signal",
        "ticker": ticker,
        "risk_flags": risk_flags,
        "risk_count": risk_flags.len(),
        "price": price,
        "signal_type": "alert",
    });
    MessageFormatter::SuperSignal.format(message.unwrap_or_default(), Some(&metadata))
}

fn format_super_signal(message: &str, metadata: &Value) -> String {
    let ticker = metadata
        .get("ticker")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty());
    let risk_count = metadata
        .get("risk_count")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let risk_flags: Vec<String> = metadata
        .get("risk_flags")
        .and_then(Value::as_array)
        .map(|flags| {
            flags
                .iter()
                .map(|f| match f {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let price = metadata.get("price").and_then(Value::as_f64);
    let signal_type = metadata
        .get("signal_type")
        .and_then(Value::as_str)
        .unwrap_or("alert");

    let emoji = match risk_count {
        n if n >= 3 => "🚨",
        n if n >= 1 => "⚠️",
        _ => "📊",
    };

    let mut lines = Vec::new();
    match ticker {
        Some(ticker) => {
            let suffix = match signal_type {
                "alert" => " Alert",
                "signal" => " Signal",
                _ => "",
            };
            lines.push(format!("{emoji} ${ticker}{suffix}"));
        }
        None => lines.push(format!("{emoji} Stock Alert")),
    }
    lines.push(String::new());

    if let Some(price) = price {
        lines.push(format!("Price: ${price:.2}"));
    }
    if risk_count > 0 {
        lines.push(format!("Risk flags: {risk_count}"));
    }
    if !risk_flags.is_empty() {
        lines.push(String::new());
        for flag in risk_flags.iter().take(MAX_LISTED_FLAGS) {
            lines.push(format!("• {flag}"));
        }
    }

    if let Some(ticker) = ticker {
        let default_text = format!("${ticker} alert");
        if !message.is_empty() && message.to_lowercase() != default_text.to_lowercase() {
            lines.push(String::new());
            lines.push(message.to_string());
        }
        lines.push(String::new());
        lines.push(format!("#{ticker} #stocks #trading"));
    }

    lines.join("\n")
}
