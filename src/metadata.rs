//! Extraction of delivery/tip extension fields from opaque order metadata.
//!
//! Storefront plugins write the same facts under different keys, so every
//! field has an ordered list of candidate keys. Lookup is exact first, then
//! case-insensitive substring. Fee lines and the customer note are used as
//! fallbacks when metadata has nothing.

use serde::{Deserialize, Serialize};

use crate::models::{FeeLine, MetaEntry};

const ORDER_METHOD_KEYS: &[&str] = &[
    "exwfood_order_method",
    "_order_type",
    "order_type",
    "_woofood_order_type",
];
const DELIVERY_TIME_KEYS: &[&str] = &[
    "exwfood_time_deli",
    "exwfood_delivery_time",
    "delivery_time",
    "_delivery_time",
    "_woofood_delivery_time",
];
const DELIVERY_ADDRESS_KEYS: &[&str] = &[
    "exwfood_delivery_address",
    "delivery_address",
    "_delivery_address",
    "_woofood_delivery_address",
];
const DELIVERY_FEE_KEYS: &[&str] = &[
    "exwfood_delivery_fee",
    "delivery_fee",
    "_delivery_fee",
    "_woofood_delivery_fee",
];
const TIP_KEYS: &[&str] = &["exwfood_tip", "tip", "_tip", "_woofood_tip"];

const DELIVERY_FEE_LINE_WORDS: &[&str] = &["delivery", "shipping", "freight", "transport"];
const TIP_FEE_LINE_WORDS: &[&str] = &["tip", "gratuity", "appreciation"];
const NOTE_FEE_PHRASES: &[&str] = &["delivery fee", "delivery charge", "shipping fee"];

/// Fields derived once at ingestion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderExtensions {
    pub delivery_method: String,
    pub delivery_time: Option<String>,
    pub delivery_address: Option<String>,
    pub delivery_fee: Option<String>,
    pub tip: Option<String>,
    pub is_delivery: bool,
}

/// Everything the extraction pass looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionInput<'a> {
    pub meta: &'a [MetaEntry],
    pub fee_lines: &'a [FeeLine],
    pub customer_note: &'a str,
    pub billing_address: &'a str,
    pub shipping_address: &'a str,
}

pub fn extract_extensions(input: ExtractionInput<'_>) -> OrderExtensions {
    let method = find_meta(input.meta, ORDER_METHOD_KEYS);
    let delivery_time = find_meta(input.meta, DELIVERY_TIME_KEYS);
    let delivery_address = find_meta(input.meta, DELIVERY_ADDRESS_KEYS);

    let mut delivery_fee = find_meta(input.meta, DELIVERY_FEE_KEYS);
    if is_zero_amount(delivery_fee.as_deref()) {
        if let Some(line) = find_fee_line(input.fee_lines, DELIVERY_FEE_LINE_WORDS) {
            delivery_fee = Some(line.total.clone());
        }
    }
    if is_zero_amount(delivery_fee.as_deref()) {
        if let Some(fee) = fee_from_note(input.customer_note) {
            delivery_fee = Some(fee);
        }
    }

    let mut tip = find_meta(input.meta, TIP_KEYS);
    if is_zero_amount(tip.as_deref()) {
        if let Some(line) = find_fee_line(input.fee_lines, TIP_FEE_LINE_WORDS) {
            tip = Some(line.total.clone());
        }
    }

    let note = input.customer_note.to_lowercase();
    let shipping = input.shipping_address.trim();
    let is_delivery = method
        .as_deref()
        .is_some_and(|m| m.trim().eq_ignore_ascii_case("delivery"))
        || !is_zero_amount(delivery_fee.as_deref())
        || delivery_address.as_deref().is_some_and(|a| !a.trim().is_empty())
        || note.contains("delivery")
        || (!shipping.is_empty() && shipping != input.billing_address.trim());

    if is_delivery && is_zero_amount(delivery_fee.as_deref()) {
        let fallback = input.fee_lines.iter().find(|line| {
            let name = line.name.to_lowercase();
            !name.contains("tip") && !name.contains("tax")
        });
        if let Some(line) = fallback.filter(|l| !is_zero_amount(Some(&l.total))) {
            delivery_fee = Some(line.total.clone());
        }
    }

    let delivery_method = match method {
        Some(m) if !m.trim().is_empty() => m,
        _ if is_delivery => "delivery".to_string(),
        _ => "pickup".to_string(),
    };

    OrderExtensions {
        delivery_method,
        delivery_time,
        delivery_address,
        delivery_fee,
        tip,
        is_delivery,
    }
}

fn find_meta(meta: &[MetaEntry], keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(entry) = meta.iter().find(|m| m.key == *key) {
            return Some(entry.value.clone());
        }
    }
    for key in keys {
        let key = key.to_lowercase();
        if let Some(entry) = meta.iter().find(|m| m.key.to_lowercase().contains(&key)) {
            return Some(entry.value.clone());
        }
    }
    None
}

fn find_fee_line<'a>(lines: &'a [FeeLine], words: &[&str]) -> Option<&'a FeeLine> {
    lines.iter().find(|line| {
        let name = line.name.to_lowercase();
        words.iter().any(|w| name.contains(w))
    })
}

fn is_zero_amount(value: Option<&str>) -> bool {
    match value {
        None => true,
        Some(v) => v.trim().parse::<f64>().map(|n| n == 0.0).unwrap_or(v.trim().is_empty()),
    }
}

/// Find "Delivery fee: $4.50" style phrases in a free-text note.
fn fee_from_note(note: &str) -> Option<String> {
    let lower = note.to_ascii_lowercase();
    for phrase in NOTE_FEE_PHRASES {
        let Some(pos) = lower.find(phrase) else {
            continue;
        };
        let rest = &note[pos + phrase.len()..];
        let rest = rest.trim_start_matches([':', '：']).trim_start();
        let rest = rest.trim_start_matches(['$', '¥', '￥', '€', '£']).trim_start();
        let amount: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let amount = amount.trim_end_matches('.');
        if amount.starts_with(|c: char| c.is_ascii_digit()) {
            return Some(amount.to_string());
        }
    }
    None
}
