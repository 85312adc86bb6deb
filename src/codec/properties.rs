use std::collections::BTreeMap;

/// The separator between a property name and its value.
pub const NAME_VALUE_SEPARATOR: char = '\u{1}';
/// The separator terminating each property pair.
pub const PROPERTY_SEPARATOR: char = '\u{2}';

/// Render the given properties in their wire form, `name\u{1}value\u{2}` per pair.
///
/// Pairs with an empty name or value are dropped.
pub fn properties_to_string(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (name, value) in properties.iter().filter(|(name, value)| !name.is_empty() && !value.is_empty()) {
        out.push_str(name);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(value);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

/// Parse properties from their wire form, dropping malformed or empty pairs.
pub fn string_to_properties(raw: &str) -> BTreeMap<String, String> {
    raw.split(PROPERTY_SEPARATOR)
        .filter_map(|pair| pair.split_once(NAME_VALUE_SEPARATOR))
        .filter(|(name, value)| !name.is_empty() && !value.is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
