//! Supplier price breaks.
//!
//! Suppliers report volume pricing as a list of `{quantity, price}` entries,
//! but the field names and formats differ between Digi-Key, Mouser and the
//! checker's own normalisation. [`PriceBreaks::from_event_data`] folds all of
//! them into one `threshold -> unit price` map, stored as JSON
//! (`{"1": 2.0, "100": 1.5}`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

const LIST_KEYS: [&str; 2] = ["price_breaks", "PriceBreaks"];
const QUANTITY_KEYS: [&str; 4] = ["quantity", "Quantity", "breakQuantity", "BreakQuantity"];
const PRICE_KEYS: [&str; 4] = ["price", "Price", "unitPrice", "UnitPrice"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceBreaks(BTreeMap<u64, f64>);

impl PriceBreaks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, threshold: u64, price: f64) {
        self.0.insert(threshold, price);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Normalise the price list carried by a supplier event.
    /// Entries whose quantity or price cannot be read are dropped.
    pub fn from_event_data(data: &Value) -> Self {
        let entries = LIST_KEYS
            .iter()
            .find_map(|key| data.get(*key).and_then(Value::as_array));

        let mut breaks = Self::new();
        for entry in entries.into_iter().flatten() {
            let quantity = first_field(entry, &QUANTITY_KEYS).and_then(parse_quantity);
            let price = first_field(entry, &PRICE_KEYS).and_then(parse_price);

            if let (Some(quantity), Some(price)) = (quantity, price) {
                breaks.insert(quantity, price);
            }
        }
        breaks
    }

    /// Price at the largest threshold not above `quantity`
    pub fn unit_price_at(&self, quantity: u64) -> Option<f64> {
        self.0.range(..=quantity).next_back().map(|(_, price)| *price)
    }
}

impl FromIterator<(u64, f64)> for PriceBreaks {
    fn from_iter<I: IntoIterator<Item = (u64, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn first_field<'a>(entry: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| entry.get(*key))
        .find(|value| !value.is_null())
}

fn parse_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn parse_price(value: &Value) -> Option<f64> {
    let price = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            // currency prefix and thousands separators, e.g. "US$ 1,204.10"
            let digits = s
                .trim()
                .trim_start_matches(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
                .replace(',', "");
            digits.trim().parse().ok()?
        }
        _ => return None,
    };

    price.is_finite().then_some(price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalises_supplier_formats() {
        let digikey = json!({
            "price_breaks": [
                {"quantity": 1, "price": "$2.00"},
                {"quantity": 100, "price": "$1.50"}
            ]
        });
        let breaks = PriceBreaks::from_event_data(&digikey);
        assert_eq!(breaks, PriceBreaks::from_iter([(1, 2.0), (100, 1.5)]));
        assert_eq!(serde_json::to_value(&breaks).unwrap(), json!({"1": 2.0, "100": 1.5}));

        let mouser = json!({
            "PriceBreaks": [
                {"Quantity": "1", "Price": "US$ 1,204.10"},
                {"BreakQuantity": 10, "UnitPrice": 0.95},
                {"breakQuantity": "1,000", "unitPrice": "0.80"}
            ]
        });
        let breaks = PriceBreaks::from_event_data(&mouser);
        assert_eq!(
            breaks,
            PriceBreaks::from_iter([(1, 1204.10), (10, 0.95), (1000, 0.80)])
        );
    }

    #[test]
    fn test_unparsable_entries_are_dropped() {
        let data = json!({
            "price_breaks": [
                {"quantity": "many", "price": "$1.00"},
                {"quantity": 5, "price": "call us"},
                {"quantity": 10},
                {"quantity": 25, "price": "$0.50"}
            ]
        });
        assert_eq!(
            PriceBreaks::from_event_data(&data),
            PriceBreaks::from_iter([(25, 0.5)])
        );
        assert!(PriceBreaks::from_event_data(&json!({"mpn": "X"})).is_empty());
    }

    #[test]
    fn test_floor_lookup() {
        let breaks = PriceBreaks::from_iter([(10, 1.0), (100, 0.8), (1000, 0.5)]);
        assert_eq!(breaks.unit_price_at(9), None);
        assert_eq!(breaks.unit_price_at(10), Some(1.0));
        assert_eq!(breaks.unit_price_at(99), Some(1.0));
        assert_eq!(breaks.unit_price_at(100), Some(0.8));
        assert_eq!(breaks.unit_price_at(1_000), Some(0.5));
        assert_eq!(breaks.unit_price_at(1_000_000), Some(0.5));
        assert_eq!(PriceBreaks::new().unit_price_at(1), None);
    }
}
