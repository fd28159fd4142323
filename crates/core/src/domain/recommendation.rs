use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single upstream recommendation.
///
/// The upstream schema is a flat object with a handful of well-known keys
/// (`ticker`, `company`, `sector`, ...). Every other key is kept in insertion order
/// so table rendering can show it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecommendationItem {
    fields: Map<String, Value>,
}

impl RecommendationItem {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Display text for `key`, or `None` when absent, null or blank.
    pub fn text(&self, key: &str) -> Option<String> {
        let s = match self.fields.get(key)? {
            Value::Null => return None,
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Array(values) => values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            other @ Value::Object(_) => other.to_string(),
        };
        Some(s).filter(|s| !s.is_empty())
    }

    pub fn ticker(&self) -> Option<String> {
        self.text("ticker")
    }

    pub fn company(&self) -> Option<String> {
        self.text("company")
    }

    pub fn sector(&self) -> Option<String> {
        self.text("sector")
    }

    pub fn theme(&self) -> Option<String> {
        self.text("theme")
    }

    pub fn risk_level(&self) -> Option<String> {
        self.text("risk_level")
    }

    pub fn entry_price_range(&self) -> Option<String> {
        self.text("entry_price_range")
    }

    pub fn target_price(&self) -> Option<String> {
        self.text("target_price")
    }

    pub fn stop_loss(&self) -> Option<String> {
        self.text("stop_loss")
    }

    pub fn earnings_date(&self) -> Option<String> {
        self.text("earnings_date")
    }

    pub fn reasoning(&self) -> Option<String> {
        self.text("reasoning")
    }
}

/// Normalizes the three payload shapes the upstream endpoint may return.
///
/// - a bare list of items
/// - an object with a `recommendations` list
/// - a single bare item object
///
/// Null, empty lists and empty objects yield no items. Entries that are not
/// objects are dropped.
pub fn get_recommendations_list(payload: &Value) -> Vec<RecommendationItem> {
    let entries: &[Value] = match payload {
        Value::Array(items) => items,
        Value::Object(obj) if obj.is_empty() => return Vec::new(),
        Value::Object(obj) => match obj.get("recommendations") {
            Some(Value::Array(items)) => items,
            Some(_) => return Vec::new(),
            None => return vec![RecommendationItem::from_fields(obj.clone())],
        },
        _ => return Vec::new(),
    };

    let mut out = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        match entry {
            Value::Object(obj) => out.push(RecommendationItem::from_fields(obj.clone())),
            other => {
                tracing::warn!(idx, entry = %other, "dropping non-object recommendation entry");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tickers(items: &[RecommendationItem]) -> Vec<String> {
        items.iter().filter_map(|i| i.ticker()).collect()
    }

    #[test]
    fn falsy_payloads_yield_nothing() {
        assert!(get_recommendations_list(&json!([])).is_empty());
        assert!(get_recommendations_list(&json!({})).is_empty());
        assert!(get_recommendations_list(&Value::Null).is_empty());
    }

    #[test]
    fn wrapped_list_is_unwrapped() {
        let payload = json!({"recommendations": [{"ticker": "AAPL"}, {"ticker": "MSFT"}]});
        assert_eq!(tickers(&get_recommendations_list(&payload)), ["AAPL", "MSFT"]);
    }

    #[test]
    fn bare_list_keeps_order_and_duplicates() {
        let payload = json!([{"ticker": "GOOG"}, {"ticker": "AAPL"}, {"ticker": "GOOG"}]);
        assert_eq!(
            tickers(&get_recommendations_list(&payload)),
            ["GOOG", "AAPL", "GOOG"]
        );
    }

    #[test]
    fn single_object_becomes_one_item() {
        let payload = json!({"ticker": "NVDA", "company": "NVIDIA"});
        let items = get_recommendations_list(&payload);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].company().as_deref(), Some("NVIDIA"));
    }

    #[test]
    fn non_object_entries_are_dropped() {
        let payload = json!([{"ticker": "AAPL"}, "junk", 3]);
        assert_eq!(tickers(&get_recommendations_list(&payload)), ["AAPL"]);
    }

    #[test]
    fn text_renders_scalars_and_skips_blanks() {
        let item = RecommendationItem::from_fields(
            json!({
                "ticker": "  ",
                "target_price": 182.5,
                "catalysts": ["earnings", "buyback"],
                "stop_loss": null
            })
            .as_object()
            .cloned()
            .unwrap(),
        );
        assert_eq!(item.ticker(), None);
        assert_eq!(item.target_price().as_deref(), Some("182.5"));
        assert_eq!(item.text("catalysts").as_deref(), Some("earnings, buyback"));
        assert_eq!(item.stop_loss(), None);
    }

    #[test]
    fn keys_preserve_upstream_order() {
        let payload = json!({"zeta": 1, "ticker": "AMD", "alpha": 2});
        let items = get_recommendations_list(&payload);
        assert_eq!(items[0].keys().collect::<Vec<_>>(), ["zeta", "ticker", "alpha"]);
    }
}
