//! Address canonicalization for geocoder queries.

use std::sync::OnceLock;

use regex::Regex;

const COUNTRY: &str = "Taiwan";

fn house_number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.+?)([0-9０-９一二三四五六七八九十百千]+號)$")
            .expect("house number pattern is valid")
    })
}

/// Builds a geocoder query from a Taiwanese address.
///
/// A trailing `<road><number>號` is reordered to `<number>號, <road>`. Empty
/// parts are dropped so the result never contains doubled or dangling separators.
pub fn normalize_address(city: &str, district: &str, raw_address: &str) -> String {
    let address = raw_address.trim();
    let mut parts: Vec<&str> = Vec::with_capacity(5);

    match house_number_pattern().captures(address) {
        Some(caps) => {
            let road = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let number = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            parts.push(number);
            parts.push(road);
        }
        None => parts.push(address),
    }
    parts.push(district.trim());
    parts.push(city.trim());
    parts.push(COUNTRY);

    parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
