//! Kubernetes resource quantity parsing
//!
//! Drift detection compares requests and limits by value, so `1000m` and `1`
//! or `1Gi` and `1024Mi` are the same quantity.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 8] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
];

/// Parse a quantity string ("100m", "1.5", "512Mi", "1e3") into its value
pub fn parse_quantity(qty: &str) -> Option<f64> {
    let qty = qty.trim();
    if qty.is_empty() {
        return None;
    }

    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(number) = qty.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }

    // "E" is exa unless it is part of an exponent ("1E3")
    if let Some(number) = qty.strip_suffix('E') {
        return number.parse::<f64>().ok().map(|n| n * 1e18);
    }

    for (suffix, factor) in DECIMAL_SUFFIXES {
        if let Some(number) = qty.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * factor);
        }
    }

    qty.parse::<f64>().ok()
}

/// Returns true if both quantities denote the same value.
///
/// Unparseable quantities fall back to string comparison.
pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_quantity(&a.0), parse_quantity(&b.0)) {
        (Some(x), Some(y)) => (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0),
        _ => a.0 == b.0,
    }
}

/// Returns true if two resource lists (requests or limits) hold the same keys
/// with equal quantities. A missing list equals an empty one.
pub fn resource_lists_equal(
    a: Option<&BTreeMap<String, Quantity>>,
    b: Option<&BTreeMap<String, Quantity>>,
) -> bool {
    let empty = BTreeMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);

    a.len() == b.len()
        && a.iter().all(|(key, qa)| {
            b.get(key)
                .map(|qb| quantities_equal(qa, qb))
                .unwrap_or(false)
        })
}
