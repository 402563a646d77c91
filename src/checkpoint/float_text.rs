//! Lossless text form of `f64`, including the non-finite values.
//!
//! JSON numbers cannot carry `inf`/`NaN` and are not guaranteed to parse back
//! to the same bits, so checkpoint floats are written as strings using
//! Rust's shortest round-trip formatting.

use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

/// Formats `x` so that [`decode`] returns the identical value.
#[must_use]
pub fn encode(x: f64) -> String {
    format!("{x:?}")
}

/// Parses a value written by [`encode`].
pub fn decode(s: &str) -> Result<f64, std::num::ParseFloatError> {
    s.trim().parse::<f64>()
}

/// Serializes an `f64` as its lossless text.
pub fn serialize<S: Serializer>(x: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode(*x))
}

/// Reads an `f64` written by [`serialize`].
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let s = String::deserialize(deserializer)?;
    decode(&s).map_err(|e| D::Error::custom(format!("invalid float '{s}': {e}")))
}

/// `Option<f64>` as an optional string.
pub mod option {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    /// Serializes an optional `f64`.
    pub fn serialize<S: Serializer>(x: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
        match x {
            Some(v) => serializer.serialize_some(&super::encode(*v)),
            None => serializer.serialize_none(),
        }
    }

    /// Reads an optional `f64`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| super::decode(&s).map_err(|e| D::Error::custom(format!("invalid float '{s}': {e}"))))
            .transpose()
    }
}
