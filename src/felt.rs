//! Field-element string conventions.
//!
//! Every address, key, data value and selector that leaves this process is a
//! 0x-prefixed, 64-digit, lowercase hex string. Storage keys additionally use
//! fixed-width block suffixes so lexicographic iteration matches chain order.

use anyhow::{Context, Result};
use starknet::core::types::Felt;
use starknet::core::utils::get_selector_from_name;

/// Offset used to mirror block numbers in the reverse index.
const BLOCK_KEY_MIRROR: u64 = 1_000_000_000_000;

/// Normalizes a hex string to the canonical `0x` + 64 lowercase digits form.
///
/// Accepts input with or without the `0x` prefix. An empty string normalizes
/// to the zero field element. Inputs longer than 64 digits are returned
/// lowercased but otherwise untouched (they are not valid field elements and
/// will fail later parsing).
pub fn normalize_hex(input: &str) -> String {
    let digits = input.strip_prefix("0x").unwrap_or(input).to_lowercase();
    if digits.len() >= 64 {
        return format!("0x{digits}");
    }
    format!("0x{digits:0>64}")
}

/// Renders a [`Felt`] in the canonical normalized form.
pub fn normalize_felt(felt: &Felt) -> String {
    felt.to_fixed_hex_string()
}

/// Resolves an event name or raw hex selector to a [`Felt`] selector.
///
/// Inputs starting with `0x` are parsed as-is; anything else is treated as a
/// Cairo event name and hashed with the Starknet selector derivation
/// (Keccak-250 of the UTF-8 name).
pub fn event_selector(name_or_hex: &str) -> Result<Felt> {
    if name_or_hex.starts_with("0x") {
        return Felt::from_hex(name_or_hex)
            .with_context(|| format!("invalid selector hex: {name_or_hex}"));
    }
    get_selector_from_name(name_or_hex)
        .with_context(|| format!("invalid event name: {name_or_hex}"))
}

/// Renders a block number as the fixed-width forward-index key component.
pub fn block_key(block_number: u64) -> String {
    format!("{block_number:020}")
}

/// Renders a block number mirrored for the reverse index, so that ascending
/// iteration over reverse keys visits blocks in descending order.
pub fn reverse_block_key(block_number: u64) -> String {
    format!("{:020}", BLOCK_KEY_MIRROR.saturating_sub(block_number))
}

/// Inverts an order key for the reverse index.
///
/// Each hex digit is complemented (`0 ↔ f`, `1 ↔ e`, …), which reverses the
/// lexicographic order of fixed-width keys. The `0x` prefix, when present, is
/// preserved so normalized field elements stay recognizable in both families.
pub fn invert_order_key(key: &str) -> String {
    let (prefix, digits) = match key.strip_prefix("0x") {
        Some(rest) => ("0x", rest),
        None => ("", key),
    };
    let inverted: String = digits
        .chars()
        .map(|c| match c.to_digit(16) {
            Some(v) => char::from_digit(15 - v, 16).unwrap_or(c),
            None => c,
        })
        .collect();
    format!("{prefix}{inverted}")
}

/// Interprets a [`Felt`] as a `u128`, if it fits.
pub fn felt_to_u128(felt: &Felt) -> Option<u128> {
    let bytes = felt.to_bytes_be();
    if bytes[..16].iter().any(|b| *b != 0) {
        return None;
    }
    Some(u128::from_be_bytes(bytes[16..].try_into().expect("16 bytes")))
}
