//! Contract ABI handling: parsing, event-variant lookup and typed decoding.
//!
//! A Cairo event arrives as a flat sequence of field elements. The ABI is the
//! only map back to structure: the top-level event enum names the variant for
//! a selector, and the variant's type tree (primitives, arrays, structs)
//! says how many words each field consumes. Decoding walks that tree over the
//! payload `keys[1..] ++ data`.

pub mod value;

use primitive_types::U256;
use serde::Deserialize;
use starknet::core::types::{ContractClass, Felt};
use starknet::core::utils::get_selector_from_name;

use crate::error::DecodeError;
use crate::felt::{felt_to_u128, normalize_felt};

pub use value::Value;

/// Array-ish type prefixes; a `@` snapshot marker may precede any of them.
const ARRAY_PREFIXES: &[&str] = &["core::array::Array", "core::array::Span", "core::span::Span"];

/// A named, typed member of a struct or event payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AbiMember {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// A variant of the top-level event enum.
#[derive(Debug, Clone, Deserialize)]
pub struct AbiVariant {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AbiEntry {
    Function {
        name: String,
    },
    Struct {
        name: String,
        members: Vec<AbiMember>,
    },
    Event {
        name: String,
        #[serde(default)]
        kind: String,
        #[serde(default)]
        variants: Vec<AbiVariant>,
        #[serde(default)]
        members: Vec<AbiMember>,
    },
    Interface {
        #[serde(default)]
        items: Vec<AbiEntry>,
    },
    #[serde(other)]
    Other,
}

/// Parsed contract ABI.
///
/// Only the entry kinds the decoder needs are retained; everything else in
/// the ABI JSON is tolerated and ignored.
#[derive(Debug, Clone)]
pub struct ContractAbi {
    entries: Vec<AbiEntry>,
}

impl ContractAbi {
    /// Parses an ABI from its JSON array form.
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let entries: Vec<AbiEntry> =
            serde_json::from_str(json).map_err(|e| DecodeError::InvalidAbi(e.to_string()))?;
        Ok(Self { entries })
    }

    /// Extracts the ABI from a fetched contract class.
    ///
    /// Legacy (Cairo 0) classes have no event enum and are rejected.
    pub fn from_contract_class(class: &ContractClass) -> Result<Self, DecodeError> {
        match class {
            ContractClass::Sierra(sierra) => Self::from_json(&sierra.abi),
            ContractClass::Legacy(_) => Err(DecodeError::InvalidAbi(
                "legacy (Cairo 0) contract classes are not supported".to_string(),
            )),
        }
    }

    /// Whether the ABI declares a function with this name, at the top level
    /// or inside an interface block.
    pub fn has_function(&self, name: &str) -> bool {
        fn scan(entries: &[AbiEntry], name: &str) -> bool {
            entries.iter().any(|entry| match entry {
                AbiEntry::Function { name: n } => n == name || n.ends_with(&format!("::{name}")),
                AbiEntry::Interface { items, .. } => scan(items, name),
                _ => false,
            })
        }
        scan(&self.entries, name)
    }

    /// Whether the top-level event enum has a variant with this name.
    pub fn has_event(&self, name: &str) -> bool {
        self.event_enum()
            .map(|variants| variants.iter().any(|v| v.name == name))
            .unwrap_or(false)
    }

    /// The variants of the single authoritative event enum: the entry of kind
    /// `event` whose `kind` is `enum` and whose name ends in `::Event`.
    fn event_enum(&self) -> Result<&[AbiVariant], DecodeError> {
        let mut found: Option<&[AbiVariant]> = None;
        for entry in &self.entries {
            if let AbiEntry::Event { name, kind, variants, .. } = entry {
                if kind == "enum" && name.ends_with("::Event") {
                    if found.is_some() {
                        // Ambiguous ABIs cannot be decoded reliably.
                        return Err(DecodeError::UnknownEvent {
                            selector: "<ambiguous event enum>".to_string(),
                        });
                    }
                    found = Some(variants);
                }
            }
        }
        found.ok_or_else(|| DecodeError::UnknownEvent {
            selector: "<no event enum>".to_string(),
        })
    }

    /// Resolves an event selector to the payload type of its enum variant.
    pub fn variant_type(&self, selector: &Felt) -> Result<String, DecodeError> {
        for variant in self.event_enum()? {
            if let Ok(candidate) = get_selector_from_name(&variant.name) {
                if candidate == *selector {
                    return Ok(variant.ty.clone());
                }
            }
        }
        Err(DecodeError::UnknownEvent {
            selector: normalize_felt(selector),
        })
    }

    /// Finds the members of a struct-like entry whose name equals the type
    /// string or ends with `::<type>`. Event entries declared with members
    /// (struct-kind event payloads) resolve the same way.
    fn resolve_struct(&self, type_name: &str) -> Option<&[AbiMember]> {
        let suffix = format!("::{type_name}");
        self.entries.iter().find_map(|entry| match entry {
            AbiEntry::Struct { name, members }
            | AbiEntry::Event { name, members, .. }
                if !members.is_empty() && (name == type_name || name.ends_with(&suffix)) =>
            {
                Some(members.as_slice())
            }
            _ => None,
        })
    }

    /// Decodes an event payload (`keys[1..] ++ data`) against the variant
    /// selected by `selector`.
    pub fn decode_event(
        &self,
        selector: &Felt,
        payload: &[Felt],
    ) -> Result<DecodedEvent, DecodeError> {
        let event_type = self.variant_type(selector)?;
        let mut cursor = FeltCursor::new(payload);
        let fields = self.decode_type(&event_type, &mut cursor)?;
        Ok(DecodedEvent { event_type, fields })
    }

    /// Decodes one value of `type_name` from the cursor.
    fn decode_type(&self, type_name: &str, cursor: &mut FeltCursor) -> Result<Value, DecodeError> {
        let type_name = type_name.strip_prefix('@').unwrap_or(type_name);

        if let Some(value) = self.decode_primitive(type_name, cursor)? {
            return Ok(value);
        }

        if let Some(inner) = array_inner_type(type_name) {
            let len_felt = cursor.next(type_name)?;
            let len = felt_to_u128(len_felt).ok_or_else(|| DecodeError::OutOfRange {
                type_name: type_name.to_string(),
                value: normalize_felt(len_felt),
            })?;
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(self.decode_type(inner, cursor)?);
            }
            return Ok(Value::Array(items));
        }

        let members = self
            .resolve_struct(type_name)
            .ok_or_else(|| DecodeError::UnresolvedStruct {
                type_name: type_name.to_string(),
            })?;
        let mut fields = Vec::with_capacity(members.len());
        for member in members {
            let value = self.decode_type(&member.ty, cursor)?;
            fields.push((member.name.clone(), value));
        }
        Ok(Value::Struct(fields))
    }

    /// Decodes a primitive, or returns `Ok(None)` when `type_name` is not in
    /// the primitive table.
    fn decode_primitive(
        &self,
        type_name: &str,
        cursor: &mut FeltCursor,
    ) -> Result<Option<Value>, DecodeError> {
        let value = match type_name {
            // ByteArray reconstruction is a known limitation: the raw word is
            // surfaced as-is.
            "core::byte_array::ByteArray" | "core::felt252" => {
                Value::Felt(normalize_felt(cursor.next(type_name)?))
            }
            "core::starknet::contract_address::ContractAddress"
            | "core::starknet::class_hash::ClassHash" => {
                Value::Felt(normalize_felt(cursor.next(type_name)?))
            }
            "core::bool" => {
                let felt = cursor.next(type_name)?;
                Value::Bool(*felt != Felt::ZERO)
            }
            "core::integer::u8" => decode_unsigned(cursor.next(type_name)?, 8, type_name)?,
            "core::integer::u16" => decode_unsigned(cursor.next(type_name)?, 16, type_name)?,
            "core::integer::u32" => decode_unsigned(cursor.next(type_name)?, 32, type_name)?,
            "core::integer::u64" => decode_unsigned(cursor.next(type_name)?, 64, type_name)?,
            "core::integer::u128" => decode_unsigned(cursor.next(type_name)?, 128, type_name)?,
            "core::integer::u256" => {
                let lo = cursor.next(type_name)?;
                let hi = cursor.next(type_name)?;
                let lo = felt_to_u128(lo).ok_or_else(|| out_of_range(type_name, lo))?;
                let hi = felt_to_u128(hi).ok_or_else(|| out_of_range(type_name, hi))?;
                Value::Uint256((U256::from(hi) << 128) | U256::from(lo))
            }
            "core::integer::i8" => decode_signed(cursor.next(type_name)?, 8, type_name)?,
            "core::integer::i16" => decode_signed(cursor.next(type_name)?, 16, type_name)?,
            "core::integer::i32" => decode_signed(cursor.next(type_name)?, 32, type_name)?,
            "core::integer::i64" => decode_signed(cursor.next(type_name)?, 64, type_name)?,
            "core::integer::i128" => decode_signed(cursor.next(type_name)?, 128, type_name)?,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

/// A decoded event: the resolved variant type and its field tree.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub event_type: String,
    pub fields: Value,
}

impl DecodedEvent {
    /// Produces the storable record: the decoded fields augmented with the
    /// emitting address (under `address_field`), block number, transaction
    /// hash and variant type.
    pub fn into_record(
        self,
        address_field: &str,
        address: &Felt,
        block_number: u64,
        transaction_hash: &Felt,
    ) -> serde_json::Value {
        let mut map = match self.fields.to_json() {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        map.insert(
            address_field.to_string(),
            serde_json::Value::String(normalize_felt(address)),
        );
        map.insert("block_number".to_string(), serde_json::Value::from(block_number));
        map.insert(
            "transaction_hash".to_string(),
            serde_json::Value::String(normalize_felt(transaction_hash)),
        );
        map.insert(
            "event_type".to_string(),
            serde_json::Value::String(self.event_type),
        );
        serde_json::Value::Object(map)
    }
}

/// Extracts the element type of an array-ish type string, if it is one.
fn array_inner_type(type_name: &str) -> Option<&str> {
    let type_name = type_name.strip_prefix('@').unwrap_or(type_name);
    for prefix in ARRAY_PREFIXES {
        if let Some(rest) = type_name.strip_prefix(prefix) {
            let start = rest.find('<')?;
            let end = rest.rfind('>')?;
            if end > start {
                return Some(rest[start + 1..end].trim());
            }
        }
    }
    None
}

fn out_of_range(type_name: &str, felt: &Felt) -> DecodeError {
    DecodeError::OutOfRange {
        type_name: type_name.to_string(),
        value: normalize_felt(felt),
    }
}

fn decode_unsigned(felt: &Felt, bits: u32, type_name: &str) -> Result<Value, DecodeError> {
    let max = if bits == 128 { u128::MAX } else { (1u128 << bits) - 1 };
    let value = felt_to_u128(felt).filter(|v| *v <= max);
    value
        .map(Value::Uint)
        .ok_or_else(|| out_of_range(type_name, felt))
}

/// Signed integers are encoded as `P - |x|` for negative `x`; both halves of
/// the range are recovered through field negation.
fn decode_signed(felt: &Felt, bits: u32, type_name: &str) -> Result<Value, DecodeError> {
    let max = if bits == 128 {
        i128::MAX as u128
    } else {
        (1u128 << (bits - 1)) - 1
    };
    if let Some(v) = felt_to_u128(felt) {
        if v <= max {
            return Ok(Value::Int(v as i128));
        }
    }
    let negated = Felt::ZERO - *felt;
    if let Some(v) = felt_to_u128(&negated) {
        let min_magnitude = 1u128 << (bits - 1);
        if v > 0 && v <= min_magnitude {
            return Ok(Value::Int((v as i128).wrapping_neg()));
        }
    }
    Err(out_of_range(type_name, felt))
}

/// Forward-only reader over the flat payload.
struct FeltCursor<'a> {
    felts: &'a [Felt],
    pos: usize,
}

impl<'a> FeltCursor<'a> {
    fn new(felts: &'a [Felt]) -> Self {
        Self { felts, pos: 0 }
    }

    fn next(&mut self, type_name: &str) -> Result<&'a Felt, DecodeError> {
        let felt = self.felts.get(self.pos).ok_or_else(|| DecodeError::ShortPayload {
            type_name: type_name.to_string(),
        })?;
        self.pos += 1;
        Ok(felt)
    }
}
