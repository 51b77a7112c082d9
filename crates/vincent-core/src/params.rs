//! Policy parameter metadata and its reshaping for on-chain calls.
//!
//! Callers describe parameters per ability as flat lists
//! (`names[ability][i]`, `types[ability][i]`, `values[ability][i]`). The
//! contracts expect one list per policy, `[ability][policy][parameter]`.
//! [`to_per_policy`] performs that 2D → 3D reshaping and
//! [`ParameterValue::parse`] checks that each raw string value decodes as its
//! declared type. ABI encoding of the decoded values is left to the contract
//! client.

use crate::error::{E2eError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ParameterType
// ---------------------------------------------------------------------------

/// On-chain parameter type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ParameterType {
    Int256,
    Int256Array,
    Uint256,
    Uint256Array,
    Bool,
    BoolArray,
    Address,
    AddressArray,
    String,
    StringArray,
    Bytes,
    BytesArray,
}

impl ParameterType {
    pub fn id(self) -> u8 {
        match self {
            ParameterType::Int256 => 0,
            ParameterType::Int256Array => 1,
            ParameterType::Uint256 => 2,
            ParameterType::Uint256Array => 3,
            ParameterType::Bool => 4,
            ParameterType::BoolArray => 5,
            ParameterType::Address => 6,
            ParameterType::AddressArray => 7,
            ParameterType::String => 8,
            ParameterType::StringArray => 9,
            ParameterType::Bytes => 10,
            ParameterType::BytesArray => 11,
        }
    }

    /// Solidity type name, e.g. `uint256[]`.
    pub fn abi_type(self) -> &'static str {
        match self {
            ParameterType::Int256 => "int256",
            ParameterType::Int256Array => "int256[]",
            ParameterType::Uint256 => "uint256",
            ParameterType::Uint256Array => "uint256[]",
            ParameterType::Bool => "bool",
            ParameterType::BoolArray => "bool[]",
            ParameterType::Address => "address",
            ParameterType::AddressArray => "address[]",
            ParameterType::String => "string",
            ParameterType::StringArray => "string[]",
            ParameterType::Bytes => "bytes",
            ParameterType::BytesArray => "bytes[]",
        }
    }

    pub fn is_array(self) -> bool {
        self.abi_type().ends_with("[]")
    }
}

impl TryFrom<u8> for ParameterType {
    type Error = E2eError;

    fn try_from(id: u8) -> Result<Self> {
        Ok(match id {
            0 => ParameterType::Int256,
            1 => ParameterType::Int256Array,
            2 => ParameterType::Uint256,
            3 => ParameterType::Uint256Array,
            4 => ParameterType::Bool,
            5 => ParameterType::BoolArray,
            6 => ParameterType::Address,
            7 => ParameterType::AddressArray,
            8 => ParameterType::String,
            9 => ParameterType::StringArray,
            10 => ParameterType::Bytes,
            11 => ParameterType::BytesArray,
            other => return Err(E2eError::UnknownParameterType(other)),
        })
    }
}

impl From<ParameterType> for u8 {
    fn from(ty: ParameterType) -> u8 {
        ty.id()
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abi_type())
    }
}

// ---------------------------------------------------------------------------
// ParameterValue
// ---------------------------------------------------------------------------

/// A decoded parameter value. Integers stay decimal strings since they may
/// exceed 128 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    Int(String),
    Uint(String),
    Bool(bool),
    Address(String),
    String(String),
    Bytes(String),
    Array(Vec<ParameterValue>),
}

impl ParameterValue {
    /// Decode `raw` as `ty`. Array types take a JSON array of strings.
    pub fn parse(ty: ParameterType, raw: &str) -> Result<Self> {
        let invalid = |reason: &str| E2eError::InvalidParameter {
            ty: ty.to_string(),
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        match ty {
            ParameterType::Int256 => {
                let digits = raw.strip_prefix('-').unwrap_or(raw);
                if is_decimal(digits) {
                    Ok(ParameterValue::Int(raw.to_string()))
                } else {
                    Err(invalid("expected a decimal integer"))
                }
            }
            ParameterType::Uint256 => {
                if is_decimal(raw) {
                    Ok(ParameterValue::Uint(raw.to_string()))
                } else {
                    Err(invalid("expected an unsigned decimal integer"))
                }
            }
            ParameterType::Bool => Ok(ParameterValue::Bool(raw.eq_ignore_ascii_case("true"))),
            ParameterType::Address => match raw.strip_prefix("0x") {
                Some(h) if h.len() == 40 && hex::decode(h).is_ok() => {
                    Ok(ParameterValue::Address(raw.to_string()))
                }
                _ => Err(invalid("expected 0x followed by 40 hex characters")),
            },
            ParameterType::Bytes => match raw.strip_prefix("0x") {
                Some(h) if hex::decode(h).is_ok() => Ok(ParameterValue::Bytes(raw.to_string())),
                _ => Err(invalid("expected 0x-prefixed hex")),
            },
            ParameterType::String => Ok(ParameterValue::String(raw.to_string())),
            ParameterType::Int256Array
            | ParameterType::Uint256Array
            | ParameterType::BoolArray
            | ParameterType::AddressArray
            | ParameterType::StringArray
            | ParameterType::BytesArray => {
                let items: Vec<serde_json::Value> =
                    serde_json::from_str(raw).map_err(|e| invalid(&e.to_string()))?;
                let element = element_type(ty);
                items
                    .iter()
                    .map(|item| match item {
                        serde_json::Value::String(s) => Self::parse(element, s),
                        other => Self::parse(element, &other.to_string()),
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(ParameterValue::Array)
            }
        }
    }
}

fn element_type(ty: ParameterType) -> ParameterType {
    match ty {
        ParameterType::Int256Array => ParameterType::Int256,
        ParameterType::Uint256Array => ParameterType::Uint256,
        ParameterType::BoolArray => ParameterType::Bool,
        ParameterType::AddressArray => ParameterType::Address,
        ParameterType::StringArray => ParameterType::String,
        ParameterType::BytesArray => ParameterType::Bytes,
        scalar => scalar,
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

// ---------------------------------------------------------------------------
// PolicyParameters
// ---------------------------------------------------------------------------

/// Per-ability flat parameter metadata as supplied at registration time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyParameters {
    #[serde(rename = "abilityPolicyParameterNames", default)]
    pub names: Vec<Vec<String>>,
    #[serde(rename = "abilityPolicyParameterTypes", default)]
    pub types: Vec<Vec<ParameterType>>,
    #[serde(
        rename = "abilityPolicyParameterValues",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub values: Option<Vec<Vec<String>>>,
}

/// One policy's parameters after reshaping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyParameterSet {
    pub names: Vec<String>,
    pub types: Vec<ParameterType>,
    pub values: Vec<ParameterValue>,
}

/// `[ability][policy]` parameter sets.
pub type NestedParameters = Vec<Vec<PolicyParameterSet>>;

/// Reshape per-ability parameter lists into per-policy lists.
///
/// Every policy of ability `a` receives ability `a`'s parameter list. An
/// ability with no parameters yields empty sets for each of its policies.
/// Outer lengths of `names`/`types`/`values` must be either zero or the
/// ability count; inner lengths must agree per ability.
pub fn to_per_policy(
    policy_ids: &[Vec<String>],
    params: &PolicyParameters,
) -> Result<NestedParameters> {
    let abilities = policy_ids.len();
    check_outer("names", params.names.len(), abilities)?;
    check_outer("types", params.types.len(), abilities)?;
    if let Some(values) = &params.values {
        check_outer("values", values.len(), abilities)?;
    }

    let mut nested = Vec::with_capacity(abilities);
    for (a, policies) in policy_ids.iter().enumerate() {
        let names = params.names.get(a).map(Vec::as_slice).unwrap_or(&[]);
        let types = params.types.get(a).map(Vec::as_slice).unwrap_or(&[]);
        let raw_values = params
            .values
            .as_ref()
            .and_then(|v| v.get(a))
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        if names.len() != types.len() {
            return Err(E2eError::ParameterShape(format!(
                "ability {a}: {} names but {} types",
                names.len(),
                types.len()
            )));
        }
        if params.values.is_some() && raw_values.len() != names.len() {
            return Err(E2eError::ParameterShape(format!(
                "ability {a}: {} names but {} values",
                names.len(),
                raw_values.len()
            )));
        }

        let values = types
            .iter()
            .zip(raw_values)
            .map(|(ty, raw)| ParameterValue::parse(*ty, raw))
            .collect::<Result<Vec<_>>>()?;

        let set = PolicyParameterSet {
            names: names.to_vec(),
            types: types.to_vec(),
            values,
        };
        nested.push(vec![set; policies.len()]);
    }
    Ok(nested)
}

fn check_outer(field: &str, len: usize, abilities: usize) -> Result<()> {
    if len != 0 && len != abilities {
        return Err(E2eError::ParameterShape(format!(
            "{field} has {len} entries for {abilities} abilities"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
